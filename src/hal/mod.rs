//! Default implementations of the hardware collaborator traits.
//!
//! The vendor codec/ISP/KMS SDKs are linked in downstream builds; the
//! implementations here let both binaries run on a development host: the
//! null variants accept every request and log it, the system variants
//! shell out to the OS facilities present on the target image.

use std::process::Command;
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};

use tracing::{info, warn};

use crate::camera::{CameraDriver, CameraError, CameraInfo, CameraType};
use crate::config::{Codec, Config, RateControlMode};
use crate::encoder::{CameraTuning, EncoderControl, EncoderError, ServiceControl};
use crate::video::decoder::{
    BufferGeometry, DecodeError, DecoderBackend, DecoderEvent,
};
use crate::video::present::{Blitter, DisplayBackend, DmaBuf, FbId, PresentError, Rect};
use crate::video::decoder::VideoFrame;

/// Accepts every encoder request. Stands in for the vendor encoder SDK on
/// hosts without one.
#[derive(Default)]
pub struct NullEncoder;

impl EncoderControl for NullEncoder {
    fn set_bitrate(&self, bps: u32) -> Result<(), EncoderError> {
        info!(bps, "encoder bitrate set");
        Ok(())
    }
    fn set_fps(&self, fps: u32) -> Result<(), EncoderError> {
        info!(fps, "encoder fps set");
        Ok(())
    }
    fn set_gop(&self, gop: u32) -> Result<(), EncoderError> {
        info!(gop, "encoder gop set");
        Ok(())
    }
    fn set_codec(&self, codec: Codec) -> Result<(), EncoderError> {
        info!(?codec, "encoder codec set");
        Ok(())
    }
    fn set_rate_control(&self, mode: RateControlMode) -> Result<(), EncoderError> {
        info!(?mode, "encoder rate control set");
        Ok(())
    }
    fn set_focus_mode(&self, quality: i32) -> Result<(), EncoderError> {
        info!(quality, "encoder focus mode set");
        Ok(())
    }
}

impl CameraTuning for NullEncoder {
    fn set_brightness(&self, cam_id: u32, value: u32) -> Result<(), EncoderError> {
        info!(cam_id, value, "brightness set");
        Ok(())
    }
    fn set_contrast(&self, cam_id: u32, value: u32) -> Result<(), EncoderError> {
        info!(cam_id, value, "contrast set");
        Ok(())
    }
    fn set_saturation(&self, cam_id: u32, value: u32) -> Result<(), EncoderError> {
        info!(cam_id, value, "saturation set");
        Ok(())
    }
    fn set_sharpness(&self, cam_id: u32, value: u32) -> Result<(), EncoderError> {
        info!(cam_id, value, "sharpness set");
        Ok(())
    }
    fn set_hdr_mode(&self, cam_id: u32, enabled: bool) -> Result<(), EncoderError> {
        info!(cam_id, enabled, "HDR mode set");
        Ok(())
    }
    fn set_mirror_flip(&self, cam_id: u32, mirror: bool, flip: bool) -> Result<(), EncoderError> {
        info!(cam_id, mirror, flip, "mirror/flip set");
        Ok(())
    }
}

/// Performs the per-type bind/unbind sequencing with logging only; the
/// vendor media pipeline calls live in the target build.
#[derive(Default)]
pub struct LoggingCameraDriver;

impl CameraDriver for LoggingCameraDriver {
    fn init(&self, camera: &CameraInfo, config: &mut Config) -> Result<(), CameraError> {
        match camera.camera_type {
            CameraType::Csi => {
                info!(name = %camera.name, "CSI camera init");
            }
            CameraType::Usb | CameraType::Thermal => {
                // Populate missing capture geometry from the device's best
                // mode before the capture channel comes up.
                if config.camera_usb.width == 0 || config.camera_usb.height == 0 {
                    if let Some(res) = camera.best_resolution() {
                        config.camera_usb.width = res.width;
                        config.camera_usb.height = res.height;
                    }
                }
                if config.camera_usb.device_index == 0 {
                    config.camera_usb.device_index = camera.device_id;
                }
                info!(
                    name = %camera.name,
                    width = config.camera_usb.width,
                    height = config.camera_usb.height,
                    "USB camera init"
                );
            }
            CameraType::Fake => {}
        }
        Ok(())
    }

    fn deinit(&self, camera: &CameraInfo, _config: &mut Config) {
        info!(name = %camera.name, "camera deinit");
    }

    fn bind_encoder(&self, camera: &CameraInfo, _config: &Config) -> Result<(), CameraError> {
        info!(name = %camera.name, "camera bound to encoder channel");
        Ok(())
    }

    fn unbind_encoder(&self, camera: &CameraInfo, _config: &Config) {
        info!(name = %camera.name, "camera unbound from encoder channel");
    }
}

/// Restarts the link service through the init scripts on the target image.
pub struct InitScriptServices {
    service_script: String,
}

impl Default for InitScriptServices {
    fn default() -> Self {
        Self {
            service_script: "/etc/init.d/S90fpv-link".to_string(),
        }
    }
}

impl ServiceControl for InitScriptServices {
    fn restart(&self, target: u32) -> std::io::Result<()> {
        match target {
            1 => {
                info!("stopping service and rebooting board");
                Command::new(&self.service_script).arg("stop").status()?;
                Command::new("reboot").status()?;
            }
            2 => {
                info!("restarting link service");
                Command::new(&self.service_script).arg("restart").status()?;
            }
            other => {
                warn!(target = other, "unknown reboot target ignored");
            }
        }
        Ok(())
    }
}

/// Decoder stub that never produces frames. Keeps the GS pipeline
/// shape intact on hosts without the vendor decoder.
#[derive(Default)]
pub struct NullDecoder;

impl DecoderBackend for NullDecoder {
    fn start(&self, codec: Codec) -> Result<(), DecodeError> {
        info!(?codec, "null decoder started");
        Ok(())
    }
    fn put_packet(&self, _data: &[u8]) -> Result<(), DecodeError> {
        Ok(())
    }
    fn poll_frame(&self) -> DecoderEvent {
        DecoderEvent::Idle
    }
    fn attach_buffers(&self, _geometry: &BufferGeometry) -> Result<(), DecodeError> {
        Ok(())
    }
    fn ack_info_change(&self) -> Result<(), DecodeError> {
        Ok(())
    }
    fn release_buffers(&self) {}
    fn stop(&self) {}
}

/// Headless display: tracks handles and sizes, scans out nothing.
pub struct HeadlessDisplay {
    width: u32,
    height: u32,
    next_fb: AtomicU32,
}

impl HeadlessDisplay {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            next_fb: AtomicU32::new(1),
        }
    }
}

impl DisplayBackend for HeadlessDisplay {
    fn display_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }
    fn import_video_frame(&self, _frame: &VideoFrame) -> Result<FbId, PresentError> {
        Ok(FbId(self.next_fb.fetch_add(1, Ordering::Relaxed)))
    }
    fn commit_video(
        &self,
        _fb: FbId,
        _src_w: u32,
        _src_h: u32,
        _dst: Rect,
    ) -> Result<(), PresentError> {
        Ok(())
    }
    fn release_fb(&self, _fb: FbId) {}
    fn commit_osd(&self, _argb: &[u8], _width: u32, _height: u32) -> Result<(), PresentError> {
        Ok(())
    }
}

/// Blitter stub handing out fake DMA descriptors.
#[derive(Default)]
pub struct NullBlitter {
    next_fd: AtomicI32,
}

impl Blitter for NullBlitter {
    fn alloc_buffer(&self, size: usize) -> Result<DmaBuf, PresentError> {
        Ok(DmaBuf {
            fd: 9000 + self.next_fd.fetch_add(1, Ordering::Relaxed),
            size,
        })
    }
    fn free_buffer(&self, _buf: DmaBuf) {}
    fn rotate_nv12(
        &self,
        _src_fd: i32,
        _dst: DmaBuf,
        _src_w: u32,
        _src_h: u32,
        _rotation: crate::video::present::Rotation,
    ) -> Result<(), PresentError> {
        Ok(())
    }
}
