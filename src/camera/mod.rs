//! Capture device management: discovery, classification, priority-based
//! selection and the bind/unbind dance against the encoder channel.
//!
//! Discovery is split behind [`scan::DeviceScanner`] so the ranking and
//! switching logic stays testable without V4L2 hardware.

pub mod scan;

use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};

use crate::config::Config;

pub use scan::{DeviceScanner, V4lScanner};

pub const MAX_SUPPORTED_RESOLUTIONS: usize = 10;
pub const MAX_CAMERAS: usize = 16;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("camera index {0} out of range")]
    BadIndex(usize),

    #[error("camera '{0}' is not available for streaming")]
    Unavailable(String),

    #[error("no camera selected")]
    NoneSelected,

    #[error("driver failure during {stage}: {message}")]
    Driver {
        stage: &'static str,
        message: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CameraType {
    Csi,
    Usb,
    Thermal,
    Fake,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorModel {
    Imx307,
    Imx415,
    Gc4663,
    UvcGeneric,
    Thermal,
    Unknown,
}

/// Lower value = higher priority; sorted ascending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CameraPriority {
    High = 1,
    Medium = 2,
    Low = 3,
    Fallback = 4,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

/// One discovered capture device.
#[derive(Debug, Clone)]
pub struct CameraInfo {
    pub camera_type: CameraType,
    pub sensor: SensorModel,
    pub name: String,
    pub device_path: String,
    pub driver_name: String,
    pub bus_info: String,
    pub device_id: u32,
    pub vendor_id: u32,
    pub product_id: u32,
    pub is_available: bool,
    pub supports_streaming: bool,
    pub priority: CameraPriority,
    /// 0..100, used as a tiebreaker within a priority class.
    pub quality_score: u8,
    pub resolutions: Vec<Resolution>,
}

impl CameraInfo {
    pub fn best_resolution(&self) -> Option<Resolution> {
        self.resolutions.first().copied()
    }

    fn streamable(&self) -> bool {
        self.is_available && self.supports_streaming
    }
}

/// Per-type driver operations against the capture/encoder pipeline. The
/// concrete implementation wraps the vendor media SDK; tests record calls.
pub trait CameraDriver: Send + Sync {
    fn init(&self, camera: &CameraInfo, config: &mut Config) -> Result<(), CameraError>;
    fn deinit(&self, camera: &CameraInfo, config: &mut Config);
    fn bind_encoder(&self, camera: &CameraInfo, config: &Config) -> Result<(), CameraError>;
    fn unbind_encoder(&self, camera: &CameraInfo, config: &Config);
}

/// Owns the discovered camera table and the current selection.
pub struct CameraManager {
    cameras: Vec<CameraInfo>,
    primary: Option<usize>,
    secondary: Option<usize>,
    current: Option<usize>,
    driver: Arc<dyn CameraDriver>,
}

impl CameraManager {
    /// Discover devices through `scanner` and auto-select the best CSI
    /// candidates.
    pub fn new(scanner: &dyn DeviceScanner, driver: Arc<dyn CameraDriver>) -> Self {
        let mut cameras = scanner.scan();
        cameras.truncate(MAX_CAMERAS);
        info!(count = cameras.len(), "camera discovery finished");

        let mut manager = Self {
            cameras,
            primary: None,
            secondary: None,
            current: None,
            driver,
        };
        manager.select_best(CameraType::Csi);
        manager
    }

    /// Build from a pre-classified table (tests, replay).
    pub fn with_cameras(cameras: Vec<CameraInfo>, driver: Arc<dyn CameraDriver>) -> Self {
        let mut manager = Self {
            cameras,
            primary: None,
            secondary: None,
            current: None,
            driver,
        };
        manager.select_best(CameraType::Csi);
        manager
    }

    pub fn count(&self) -> usize {
        self.cameras.len()
    }

    pub fn cameras(&self) -> &[CameraInfo] {
        &self.cameras
    }

    pub fn primary(&self) -> Option<&CameraInfo> {
        self.primary.map(|i| &self.cameras[i])
    }

    pub fn secondary(&self) -> Option<&CameraInfo> {
        self.secondary.map(|i| &self.cameras[i])
    }

    pub fn current(&self) -> Option<&CameraInfo> {
        self.current.map(|i| &self.cameras[i])
    }

    pub fn current_index(&self) -> Option<usize> {
        self.current
    }

    /// Sort by priority ascending then quality descending, then pick
    /// primary/secondary of the preferred type with fallbacks to any
    /// streamable device.
    pub fn select_best(&mut self, preferred: CameraType) -> Option<usize> {
        self.cameras.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then(b.quality_score.cmp(&a.quality_score))
        });
        // Indices into the sorted table; the previous selection does not
        // survive a re-sort.
        self.primary = None;
        self.secondary = None;
        self.current = None;

        for (i, cam) in self.cameras.iter().enumerate() {
            if cam.camera_type == preferred && cam.streamable() {
                if self.primary.is_none() {
                    self.primary = Some(i);
                } else if self.secondary.is_none() {
                    self.secondary = Some(i);
                    break;
                }
            }
        }

        if self.primary.is_none() {
            self.primary = self.cameras.iter().position(|c| c.streamable());
            if let Some(p) = self.primary {
                warn!(name = %self.cameras[p].name, "no preferred-type camera, using fallback");
            }
        }
        if self.secondary.is_none() {
            self.secondary = self
                .cameras
                .iter()
                .enumerate()
                .position(|(i, c)| Some(i) != self.primary && c.streamable());
        }

        if let Some(p) = self.primary {
            info!(
                name = %self.cameras[p].name,
                priority = ?self.cameras[p].priority,
                quality = self.cameras[p].quality_score,
                "primary camera selected"
            );
        }
        self.primary
    }

    /// Switch to the camera at `index`. The previous camera is unbound and
    /// deinitialized before the target is initialized and bound; an error
    /// mid-way leaves the previous camera torn down and the caller should
    /// retry with a fallback index.
    pub fn select_by_index(&mut self, config: &mut Config, index: usize) -> Result<(), CameraError> {
        if index >= self.cameras.len() {
            return Err(CameraError::BadIndex(index));
        }
        self.select_camera(config, index)
    }

    fn select_camera(&mut self, config: &mut Config, target: usize) -> Result<(), CameraError> {
        if !self.cameras[target].streamable() {
            return Err(CameraError::Unavailable(self.cameras[target].name.clone()));
        }

        if let Some(current) = self.current {
            if current == target {
                return Ok(());
            }
            let cam = self.cameras[current].clone();
            info!(from = %cam.name, to = %self.cameras[target].name, "switching cameras");
            self.driver.unbind_encoder(&cam, config);
            self.driver.deinit(&cam, config);
            self.current = None;
        }

        let cam = self.cameras[target].clone();
        self.driver.init(&cam, config)?;
        self.driver.bind_encoder(&cam, config)?;
        self.current = Some(target);
        info!(name = %cam.name, "camera selected");
        Ok(())
    }

    /// Bind the auto-selected primary camera at startup.
    pub fn select_primary(&mut self, config: &mut Config) -> Result<(), CameraError> {
        let primary = self.primary.ok_or(CameraError::NoneSelected)?;
        self.select_camera(config, primary)
    }

    /// Tear down the current camera, e.g. at shutdown.
    pub fn release_current(&mut self, config: &mut Config) {
        if let Some(current) = self.current.take() {
            let cam = self.cameras[current].clone();
            self.driver.unbind_encoder(&cam, config);
            self.driver.deinit(&cam, config);
        }
    }
}
