//! Seam to the hardware video encoder.
//!
//! The vendor SDK is an external collaborator; the dispatcher only needs
//! the setter surface below. Every setter applies the value to the running
//! pipeline and returns an error when the hardware rejects it, which drives
//! the dispatcher's commit-or-rollback policy.

use thiserror::Error;

use crate::config::{Codec, RateControlMode};

#[derive(Error, Debug)]
pub enum EncoderError {
    #[error("encoder rejected {param} = {value}")]
    Rejected { param: &'static str, value: i64 },

    #[error("encoder channel not running")]
    NotRunning,
}

/// Control surface of the running encoder channel.
pub trait EncoderControl: Send + Sync {
    /// Bits per second.
    fn set_bitrate(&self, bps: u32) -> Result<(), EncoderError>;
    fn set_fps(&self, fps: u32) -> Result<(), EncoderError>;
    fn set_gop(&self, gop: u32) -> Result<(), EncoderError>;
    fn set_codec(&self, codec: Codec) -> Result<(), EncoderError>;
    fn set_rate_control(&self, mode: RateControlMode) -> Result<(), EncoderError>;
    /// Focus-peaking overlay quality; negative disables.
    fn set_focus_mode(&self, quality: i32) -> Result<(), EncoderError>;
}

/// Camera image-quality setters routed through the ISP.
pub trait CameraTuning: Send + Sync {
    fn set_brightness(&self, cam_id: u32, value: u32) -> Result<(), EncoderError>;
    fn set_contrast(&self, cam_id: u32, value: u32) -> Result<(), EncoderError>;
    fn set_saturation(&self, cam_id: u32, value: u32) -> Result<(), EncoderError>;
    fn set_sharpness(&self, cam_id: u32, value: u32) -> Result<(), EncoderError>;
    fn set_hdr_mode(&self, cam_id: u32, enabled: bool) -> Result<(), EncoderError>;
    fn set_mirror_flip(&self, cam_id: u32, mirror: bool, flip: bool) -> Result<(), EncoderError>;
}

/// Restarts system services on reboot commands; implemented over the OS
/// init scripts on target, mocked in tests.
pub trait ServiceControl: Send + Sync {
    /// Target 1 = stop the link service then reboot the board,
    /// target 2 = restart the link service only.
    fn restart(&self, target: u32) -> std::io::Result<()>;
}
