//! V4L2 device discovery and classification.
//!
//! CSI sensors are found through `/dev/v4l-subdevN` plus the sysfs-exposed
//! sensor name; capture nodes come from `/dev/videoN` capability queries.
//! ISP pipeline nodes are filtered out by name, USB devices are grouped by
//! bus so multi-node cameras contribute a single entry, and thermal imagers
//! are recognized heuristically.

use std::collections::HashSet;
use std::path::Path;

use once_cell::sync::Lazy;
use tracing::{debug, info};

use super::{CameraInfo, CameraPriority, CameraType, Resolution, SensorModel};

/// Thermal Cam Co. vendor id.
const THERMAL_VENDOR_ID: u32 = 0x3474;

struct CsiSensorMatch {
    pattern: &'static str,
    sensor: SensorModel,
    priority: CameraPriority,
    quality: u8,
}

static CSI_SENSORS: Lazy<Vec<CsiSensorMatch>> = Lazy::new(|| {
    vec![
        CsiSensorMatch {
            pattern: "imx415",
            sensor: SensorModel::Imx415,
            priority: CameraPriority::High,
            quality: 95,
        },
        CsiSensorMatch {
            pattern: "imx307",
            sensor: SensorModel::Imx307,
            priority: CameraPriority::High,
            quality: 90,
        },
        CsiSensorMatch {
            pattern: "gc4663",
            sensor: SensorModel::Gc4663,
            priority: CameraPriority::Medium,
            quality: 75,
        },
    ]
});

/// ISP pipeline node prefixes that look like video devices but are not
/// cameras.
const ISP_NODE_PATTERNS: &[&str] = &[
    "rkisp_mainpath",
    "rkisp_selfpath",
    "rkisp_rawwr",
    "rkisp_rawrd",
    "rkisp-statistics",
    "rkisp-input-params",
    "rkisp-mipi-luma",
    "rkispp_",
    "rkispp-stats",
    "rkispp-input",
    "rkispp-scale",
    "rkispp-m_bypass",
    "rkispp-iqtool",
];

/// Subdev sensor names accepted as CSI cameras.
const CSI_SUBDEV_PATTERNS: &[&str] = &["imx307", "imx415", "gc4663", "imx219", "ov5647", "ov4689"];

pub fn is_isp_pipeline_node(name: &str) -> bool {
    ISP_NODE_PATTERNS.iter().any(|p| name.contains(p))
}

/// Classify a sensor by its driver/card strings.
pub fn match_csi_sensor(driver: &str, card: &str) -> (SensorModel, CameraPriority, u8) {
    for m in CSI_SENSORS.iter() {
        if driver.contains(m.pattern) || card.contains(m.pattern) {
            return (m.sensor, m.priority, m.quality);
        }
    }
    (SensorModel::Unknown, CameraPriority::Fallback, 50)
}

/// Thermal imagers announce themselves inconsistently; match on vendor id,
/// name fragments, or suspiciously short generic card names.
pub fn looks_thermal(card: &str, driver: &str, bus_info: &str, vendor_id: u32) -> bool {
    card.to_ascii_lowercase().contains("thermal")
        || driver.to_ascii_lowercase().contains("thermal")
        || bus_info.contains("3474")
        || vendor_id == THERMAL_VENDOR_ID
        || (card.contains("Camera") && card.len() <= 15)
}

/// Produces the classified device table. The real implementation walks
/// sysfs and V4L2; tests supply canned tables.
pub trait DeviceScanner {
    fn scan(&self) -> Vec<CameraInfo>;
}

/// Scanner backed by /dev and /sys on the target.
#[derive(Default)]
pub struct V4lScanner;

impl DeviceScanner for V4lScanner {
    fn scan(&self) -> Vec<CameraInfo> {
        let mut cameras = scan_csi_subdevs();
        cameras.extend(scan_video_nodes());
        cameras
    }
}

fn scan_csi_subdevs() -> Vec<CameraInfo> {
    let mut found = Vec::new();

    for i in 0..20 {
        let subdev = format!("/dev/v4l-subdev{i}");
        if !Path::new(&subdev).exists() {
            continue;
        }
        let name_path = format!("/sys/class/video4linux/v4l-subdev{i}/name");
        let Ok(raw_name) = std::fs::read_to_string(&name_path) else {
            continue;
        };
        let sensor_name = raw_name.trim();
        if !CSI_SUBDEV_PATTERNS.iter().any(|p| sensor_name.contains(p)) {
            continue;
        }

        let (sensor, _, _) = match_csi_sensor(sensor_name, sensor_name);
        let mut cam = CameraInfo {
            camera_type: CameraType::Csi,
            sensor,
            name: sensor_name.to_string(),
            // CSI sensors are consumed through the main ISP output node.
            device_path: "/dev/video0".to_string(),
            driver_name: sensor_name.to_string(),
            bus_info: format!("csi-subdev{i}"),
            device_id: 0,
            vendor_id: 0,
            product_id: 0,
            is_available: true,
            supports_streaming: true,
            // Subdev-announced sensors ride the main ISP path.
            priority: CameraPriority::High,
            quality_score: 90,
            resolutions: Vec::new(),
        };
        if cam.sensor == SensorModel::Imx307 {
            cam.resolutions = vec![
                Resolution {
                    width: 1920,
                    height: 1080,
                    fps: 30,
                },
                Resolution {
                    width: 1945,
                    height: 1097,
                    fps: 60,
                },
            ];
        }
        info!(sensor = %cam.name, subdev = %subdev, "CSI camera detected");
        found.push(cam);
    }

    if found.is_empty() {
        debug!("no CSI camera sensors found in subdevices");
    }
    found
}

fn scan_video_nodes() -> Vec<CameraInfo> {
    let mut nodes = Vec::new();

    let Ok(entries) = std::fs::read_dir("/dev") else {
        return nodes;
    };
    for entry in entries.flatten() {
        let file_name = entry.file_name();
        let name = file_name.to_string_lossy();
        let Some(id_str) = name.strip_prefix("video") else {
            continue;
        };
        let Ok(device_id) = id_str.parse::<u32>() else {
            continue;
        };
        let path = format!("/dev/{name}");
        if let Some(info) = probe_video_node(&path, device_id) {
            nodes.push(info);
        }
    }

    dedup_by_bus(nodes)
}

fn probe_video_node(path: &str, device_id: u32) -> Option<CameraInfo> {
    let device = v4l::Device::with_path(path).ok()?;
    let caps = device.query_caps().ok()?;

    if is_isp_pipeline_node(&caps.card) {
        return None;
    }

    let supports_streaming = caps
        .capabilities
        .contains(v4l::capability::Flags::STREAMING);

    let mut info = CameraInfo {
        camera_type: CameraType::Fake,
        sensor: SensorModel::Unknown,
        name: caps.card.clone(),
        device_path: path.to_string(),
        driver_name: caps.driver.clone(),
        bus_info: caps.bus.clone(),
        device_id,
        vendor_id: 0,
        product_id: 0,
        is_available: true,
        supports_streaming,
        priority: CameraPriority::Fallback,
        quality_score: 0,
        resolutions: Vec::new(),
    };

    if caps.bus.contains("usb") {
        info.camera_type = CameraType::Usb;
        info.sensor = SensorModel::UvcGeneric;
        info.priority = CameraPriority::Low;
        info.quality_score = 60;
        let (vendor, product) = read_usb_ids(&caps.bus);
        info.vendor_id = vendor;
        info.product_id = product;

        if looks_thermal(&caps.card, &caps.driver, &caps.bus, vendor) {
            info.camera_type = CameraType::Thermal;
            info.sensor = SensorModel::Thermal;
            info.priority = CameraPriority::Medium;
            info.quality_score = 75;
            debug!(card = %caps.card, "classified as thermal camera");
        }
    } else if caps.bus.contains("platform") {
        info.camera_type = CameraType::Csi;
        let (sensor, priority, quality) = match_csi_sensor(&caps.driver, &caps.card);
        info.sensor = sensor;
        info.priority = priority;
        info.quality_score = quality;
    } else {
        return None;
    }

    info.resolutions = enum_resolutions(&device);
    debug!(
        card = %info.name,
        path = %info.device_path,
        resolutions = info.resolutions.len(),
        "video node probed"
    );
    Some(info)
}

/// Extract "1-3" from bus_info like "usb-ffe00000.usb-1.3" and read the
/// vendor/product ids from sysfs.
fn read_usb_ids(bus_info: &str) -> (u32, u32) {
    let Some(usb_part) = bus_info.split("usb-").last() else {
        return (0, 0);
    };
    let Some(device) = usb_part.rsplit('-').next() else {
        return (0, 0);
    };

    let read_hex = |file: &str| -> u32 {
        std::fs::read_to_string(format!("/sys/bus/usb/devices/{device}/{file}"))
            .ok()
            .and_then(|s| u32::from_str_radix(s.trim(), 16).ok())
            .unwrap_or(0)
    };
    (read_hex("idVendor"), read_hex("idProduct"))
}

fn enum_resolutions(device: &v4l::Device) -> Vec<Resolution> {
    use v4l::video::Capture;

    // Different cameras expose sizes only for their native format; try the
    // common ones until any format yields discrete sizes.
    let formats: [&[u8; 4]; 5] = [b"YUYV", b"MJPG", b"RGB3", b"GREY", b"Y16 "];
    for fourcc in formats {
        let Ok(sizes) = device.enum_framesizes(v4l::FourCC::new(fourcc)) else {
            continue;
        };
        let mut resolutions = Vec::new();
        for size in sizes {
            if resolutions.len() >= super::MAX_SUPPORTED_RESOLUTIONS {
                break;
            }
            if let v4l::framesize::FrameSizeEnum::Discrete(discrete) = size.size {
                resolutions.push(Resolution {
                    width: discrete.width,
                    height: discrete.height,
                    fps: 30,
                });
            }
        }
        if !resolutions.is_empty() {
            return resolutions;
        }
    }
    Vec::new()
}

/// Multi-node USB cameras show up as several /dev/videoN entries sharing a
/// bus_info. Keep the node with the most resolutions, then the lowest node
/// number.
fn dedup_by_bus(mut nodes: Vec<CameraInfo>) -> Vec<CameraInfo> {
    let mut kept: Vec<CameraInfo> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();

    nodes.sort_by(|a, b| {
        b.resolutions
            .len()
            .cmp(&a.resolutions.len())
            .then(a.device_id.cmp(&b.device_id))
    });

    for node in nodes {
        if node.bus_info.is_empty() || seen.insert(node.bus_info.clone()) {
            kept.push(node);
        }
    }
    kept.sort_by_key(|n| n.device_id);
    kept
}
