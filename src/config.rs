//! Live and persisted configuration.
//!
//! One in-memory [`Config`] record drives the drone pipeline; it is read
//! from a TOML file at startup and written back on the `SavePersistent`
//! command. Field semantics: bitrate is stored in bits per second; the wire
//! carries kbps and the command dispatcher converts at its boundary.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Video codec selection shared by encoder and decoder sides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    H264,
    #[default]
    H265,
}

/// Encoder rate-control mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RateControlMode {
    #[default]
    Cbr,
    Vbr,
}

/// Encoder section of the drone configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct EncoderConfig {
    #[serde(default)]
    pub codec: Codec,

    #[serde(default = "default_stream_width")]
    pub width: u32,

    #[serde(default = "default_stream_height")]
    pub height: u32,

    /// Bits per second.
    #[serde(default = "default_bitrate_bps")]
    pub bitrate: u32,

    #[serde(default = "default_fps")]
    pub fps: u32,

    #[serde(default = "default_gop")]
    pub gop: u32,

    #[serde(default)]
    pub rate_mode: RateControlMode,

    /// RTP payload size hint, bytes.
    #[serde(default = "default_payload_size")]
    pub payload_size: u32,

    /// Focus-peaking quality, negative = off.
    #[serde(default = "default_focus_quality")]
    pub focus_quality: i32,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            codec: Codec::default(),
            width: default_stream_width(),
            height: default_stream_height(),
            bitrate: default_bitrate_bps(),
            fps: default_fps(),
            gop: default_gop(),
            rate_mode: RateControlMode::default(),
            payload_size: default_payload_size(),
            focus_quality: default_focus_quality(),
        }
    }
}

/// CSI camera tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CameraCsiConfig {
    #[serde(default)]
    pub cam_id: u32,

    #[serde(default = "default_true")]
    pub auto_white_balance: bool,

    #[serde(default = "default_mid_level")]
    pub brightness: u32,

    #[serde(default = "default_mid_level")]
    pub contrast: u32,

    #[serde(default = "default_mid_level")]
    pub saturation: u32,

    #[serde(default = "default_mid_level")]
    pub sharpness: u32,

    #[serde(default)]
    pub hdr_enabled: bool,

    #[serde(default)]
    pub mirror: bool,

    #[serde(default)]
    pub flip: bool,

    #[serde(default)]
    pub width: u32,

    #[serde(default)]
    pub height: u32,
}

impl Default for CameraCsiConfig {
    fn default() -> Self {
        Self {
            cam_id: 0,
            auto_white_balance: true,
            brightness: default_mid_level(),
            contrast: default_mid_level(),
            saturation: default_mid_level(),
            sharpness: default_mid_level(),
            hdr_enabled: false,
            mirror: false,
            flip: false,
            width: 0,
            height: 0,
        }
    }
}

/// USB camera parameters; zero width/height means "take the device's best
/// mode at bind time".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CameraUsbConfig {
    #[serde(default)]
    pub device_index: u32,

    #[serde(default)]
    pub width: u32,

    #[serde(default)]
    pub height: u32,
}

/// RTP stream egress endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct StreamConfig {
    #[serde(default = "default_stream_ip")]
    pub ip: String,

    #[serde(default = "default_stream_port")]
    pub port: u16,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            ip: default_stream_ip(),
            port: default_stream_port(),
        }
    }
}

/// Optional rendezvous server the drone can fetch its stream target from.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ServerConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub host: String,

    #[serde(default)]
    pub port: u16,
}

/// Link-level settings carried alongside the hardware sections.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct LinkConfig {
    #[serde(default)]
    pub wfb_key: String,

    #[serde(default)]
    pub detection_enabled: bool,
}

/// The whole drone-side configuration record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    #[serde(default)]
    pub encoder: EncoderConfig,

    #[serde(default)]
    pub camera_csi: CameraCsiConfig,

    #[serde(default)]
    pub camera_usb: CameraUsbConfig,

    #[serde(default)]
    pub stream: StreamConfig,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub link: LinkConfig,

    /// Where `SavePersistent` writes; not serialized itself.
    #[serde(skip)]
    pub persist_path: PathBuf,
}

fn default_stream_width() -> u32 {
    1920
}
fn default_stream_height() -> u32 {
    1080
}
fn default_bitrate_bps() -> u32 {
    2048 * 1024
}
fn default_fps() -> u32 {
    30
}
fn default_gop() -> u32 {
    30
}
fn default_payload_size() -> u32 {
    1400
}
fn default_focus_quality() -> i32 {
    -1
}
fn default_mid_level() -> u32 {
    50
}
fn default_true() -> bool {
    true
}
fn default_stream_ip() -> String {
    "0.0.0.0".to_string()
}
fn default_stream_port() -> u16 {
    5602
}

impl Config {
    /// Load from a TOML file, remembering the path for `SavePersistent`.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(&path)?;
        let mut config: Config = toml::from_str(&content)?;
        config.persist_path = path.as_ref().to_path_buf();
        config.validate()?;
        Ok(config)
    }

    /// Write the current record to `path` as TOML.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let enc = &self.encoder;
        if enc.width == 0 || enc.height == 0 {
            return Err(ConfigError::Invalid(
                "encoder width and height must be > 0".into(),
            ));
        }
        if enc.fps == 0 || enc.fps > 240 {
            return Err(ConfigError::Invalid(format!(
                "encoder fps must be in 1..=240, got {}",
                enc.fps
            )));
        }
        if enc.bitrate < 100_000 {
            return Err(ConfigError::Invalid(format!(
                "encoder bitrate {} bps is below the 100 kbps floor",
                enc.bitrate
            )));
        }
        if self.stream.port == 0 {
            return Err(ConfigError::Invalid("stream port must be > 0".into()));
        }
        Ok(())
    }
}

/// Ground-station runtime configuration, filled from the CLI.
#[derive(Debug, Clone)]
pub struct DisplayConfig {
    pub ip: String,
    pub port: u16,
    pub wfb_port: u16,
    /// Commit mode: false = non-blocking atomic commit (default),
    /// true = wait for vsync.
    pub vsync: bool,
    /// RTP payload type filter, 0 = any dynamic.
    pub payload_type: u8,
    /// Forced codec; `None` enables auto-detection.
    pub codec: Option<Codec>,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            ip: "0.0.0.0".to_string(),
            port: default_stream_port(),
            wfb_port: 8003,
            vsync: false,
            payload_type: 0,
            codec: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.encoder.bitrate, 2048 * 1024);
        assert_eq!(config.encoder.fps, 30);
        assert_eq!(config.encoder.codec, Codec::H265);
        assert_eq!(config.camera_csi.brightness, 50);
        assert_eq!(config.stream.port, 5602);
        assert!(!config.link.detection_enabled);
    }

    #[test]
    fn test_parse_partial_toml() {
        let toml = r#"
[encoder]
codec = "h264"
bitrate = 4194304
fps = 60

[stream]
ip = "192.168.1.20"
port = 5602

[camera-csi]
brightness = 60
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.encoder.codec, Codec::H264);
        assert_eq!(config.encoder.bitrate, 4_194_304);
        assert_eq!(config.encoder.fps, 60);
        // Unspecified fields fall back to defaults.
        assert_eq!(config.encoder.gop, 30);
        assert_eq!(config.camera_csi.brightness, 60);
        assert_eq!(config.camera_csi.contrast, 50);
        assert_eq!(config.stream.ip, "192.168.1.20");
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fpv-link.toml");

        let mut config = Config::default();
        config.encoder.bitrate = 6 * 1024 * 1024;
        config.camera_csi.mirror = true;
        config.link.wfb_key = "ground-key".into();
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.encoder.bitrate, 6 * 1024 * 1024);
        assert!(loaded.camera_csi.mirror);
        assert_eq!(loaded.link.wfb_key, "ground-key");
        assert_eq!(loaded.persist_path, path);
    }

    #[test]
    fn test_validation_rejects_zero_fps() {
        let toml = r#"
[encoder]
fps = 0
"#;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, toml).unwrap();
        assert!(matches!(
            Config::load(&path),
            Err(ConfigError::Invalid(_))
        ));
    }
}
