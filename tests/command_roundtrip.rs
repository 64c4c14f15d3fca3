//! End-to-end: a GS peer issues synchronous commands against a drone peer
//! running the real dispatcher over loopback UDP.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use fpv_link::camera::{
    CameraDriver, CameraError, CameraInfo, CameraManager, CameraPriority, CameraType, Resolution,
    SensorModel,
};
use fpv_link::command::CommandDispatcher;
use fpv_link::config::{Codec, Config, RateControlMode};
use fpv_link::encoder::{CameraTuning, EncoderControl, EncoderError, ServiceControl};
use fpv_link::link::packet::{CommandId, SubCommand};
use fpv_link::link::{LinkEndpoints, LinkPeer, SyncCmdError};
use fpv_link::proxy::{TunnelManager, TunnelPorts};
use tokio::sync::mpsc;

/// Encoder that rejects bitrates above a threshold.
struct PickyEncoder {
    max_bps: u32,
}

impl EncoderControl for PickyEncoder {
    fn set_bitrate(&self, bps: u32) -> Result<(), EncoderError> {
        if bps > self.max_bps {
            return Err(EncoderError::Rejected {
                param: "bitrate",
                value: bps as i64,
            });
        }
        Ok(())
    }
    fn set_fps(&self, _fps: u32) -> Result<(), EncoderError> {
        Ok(())
    }
    fn set_gop(&self, _gop: u32) -> Result<(), EncoderError> {
        Ok(())
    }
    fn set_codec(&self, _codec: Codec) -> Result<(), EncoderError> {
        Ok(())
    }
    fn set_rate_control(&self, _mode: RateControlMode) -> Result<(), EncoderError> {
        Ok(())
    }
    fn set_focus_mode(&self, _quality: i32) -> Result<(), EncoderError> {
        Ok(())
    }
}

impl CameraTuning for PickyEncoder {
    fn set_brightness(&self, _cam_id: u32, _value: u32) -> Result<(), EncoderError> {
        Ok(())
    }
    fn set_contrast(&self, _cam_id: u32, _value: u32) -> Result<(), EncoderError> {
        Ok(())
    }
    fn set_saturation(&self, _cam_id: u32, _value: u32) -> Result<(), EncoderError> {
        Ok(())
    }
    fn set_sharpness(&self, _cam_id: u32, _value: u32) -> Result<(), EncoderError> {
        Ok(())
    }
    fn set_hdr_mode(&self, _cam_id: u32, _enabled: bool) -> Result<(), EncoderError> {
        Ok(())
    }
    fn set_mirror_flip(&self, _cam_id: u32, _m: bool, _f: bool) -> Result<(), EncoderError> {
        Ok(())
    }
}

/// Records the bind lifecycle so the switch ordering can be asserted.
#[derive(Default)]
struct OrderedDriver {
    calls: Mutex<Vec<String>>,
}

impl CameraDriver for OrderedDriver {
    fn init(&self, camera: &CameraInfo, _config: &mut Config) -> Result<(), CameraError> {
        self.calls.lock().unwrap().push(format!("init:{}", camera.name));
        Ok(())
    }
    fn deinit(&self, camera: &CameraInfo, _config: &mut Config) {
        self.calls
            .lock()
            .unwrap()
            .push(format!("deinit:{}", camera.name));
    }
    fn bind_encoder(&self, camera: &CameraInfo, _config: &Config) -> Result<(), CameraError> {
        self.calls.lock().unwrap().push(format!("bind:{}", camera.name));
        Ok(())
    }
    fn unbind_encoder(&self, camera: &CameraInfo, _config: &Config) {
        self.calls
            .lock()
            .unwrap()
            .push(format!("unbind:{}", camera.name));
    }
}

struct NoRestart;

impl ServiceControl for NoRestart {
    fn restart(&self, _target: u32) -> std::io::Result<()> {
        Ok(())
    }
}

fn camera(name: &str, t: CameraType, p: CameraPriority) -> CameraInfo {
    CameraInfo {
        camera_type: t,
        sensor: SensorModel::Unknown,
        name: name.into(),
        device_path: format!("/dev/{name}"),
        driver_name: String::new(),
        bus_info: String::new(),
        device_id: 0,
        vendor_id: 0,
        product_id: 0,
        is_available: true,
        supports_streaming: true,
        priority: p,
        quality_score: 80,
        resolutions: vec![Resolution {
            width: 1920,
            height: 1080,
            fps: 30,
        }],
    }
}

struct Harness {
    gs: LinkPeer,
    drone: LinkPeer,
    config: Arc<Mutex<Config>>,
    driver: Arc<OrderedDriver>,
    dispatcher_task: tokio::task::JoinHandle<()>,
}

async fn harness(max_bitrate_kbps: u32) -> Harness {
    let ephemeral = LinkEndpoints {
        listen: ([127, 0, 0, 1], 0).into(),
        remote: ([127, 0, 0, 1], 1).into(),
    };
    let drone = LinkPeer::bind_with(ephemeral).await.unwrap();
    let gs = LinkPeer::bind_with(ephemeral).await.unwrap();
    drone.set_remote(gs.local_addr().unwrap());
    gs.set_remote(drone.local_addr().unwrap());

    let config = Arc::new(Mutex::new(Config::default()));
    let driver = Arc::new(OrderedDriver::default());
    let encoder = Arc::new(PickyEncoder {
        max_bps: max_bitrate_kbps * 1024,
    });

    let mut cameras = CameraManager::with_cameras(
        vec![
            camera("csi-primary", CameraType::Csi, CameraPriority::High),
            camera("usb-secondary", CameraType::Usb, CameraPriority::Low),
        ],
        Arc::clone(&driver) as Arc<dyn CameraDriver>,
    );
    cameras
        .select_primary(&mut config.lock().unwrap())
        .unwrap();

    let dispatcher = CommandDispatcher::new(
        Arc::clone(&config),
        Arc::clone(&encoder) as Arc<dyn EncoderControl>,
        encoder,
        Arc::new(Mutex::new(cameras)),
        TunnelManager::new(TunnelPorts::default()),
        Arc::new(NoRestart),
        Arc::new(drone.sender()),
        PathBuf::from("/nonexistent/defaults.toml"),
    );

    let (tx, rx) = mpsc::unbounded_channel();
    drone.register_cmd_cb(move |frame| {
        let _ = tx.send(frame.clone());
    });
    let dispatcher_task = tokio::spawn(dispatcher.run(rx));

    Harness {
        gs,
        drone,
        config,
        driver,
        dispatcher_task,
    }
}

impl Harness {
    async fn teardown(mut self) {
        self.gs.shutdown().await;
        self.drone.shutdown().await;
        self.dispatcher_task.abort();
    }
}

#[tokio::test]
async fn test_set_bitrate_applies_and_acks() {
    let h = harness(6000).await;

    let reply = h
        .gs
        .send_cmd_sync(
            CommandId::Set,
            SubCommand::Bitrate,
            &4096u32.to_le_bytes(),
            64,
            Duration::from_secs(2),
        )
        .await
        .expect("bitrate accepted");
    assert_eq!(u32::from_le_bytes(reply[..4].try_into().unwrap()), 4096);
    // Internal unit is bps.
    assert_eq!(h.config.lock().unwrap().encoder.bitrate, 4096 * 1024);

    h.teardown().await;
}

#[tokio::test]
async fn test_set_bitrate_rejected_then_get_sees_old_value() {
    let h = harness(6000).await;

    // 8192 kbps exceeds the encoder's 6000 kbps ceiling.
    let result = h
        .gs
        .send_cmd_sync(
            CommandId::Set,
            SubCommand::Bitrate,
            &8192u32.to_le_bytes(),
            64,
            Duration::from_secs(2),
        )
        .await;
    match result {
        Err(SyncCmdError::Nack(data)) => {
            assert_eq!(u32::from_le_bytes(data[..4].try_into().unwrap()), 2048);
        }
        other => panic!("expected NACK, got {other:?}"),
    }

    let reply = h
        .gs
        .send_cmd_sync(
            CommandId::Get,
            SubCommand::Bitrate,
            &[],
            64,
            Duration::from_secs(2),
        )
        .await
        .unwrap();
    assert_eq!(u32::from_le_bytes(reply[..4].try_into().unwrap()), 2048);

    h.teardown().await;
}

#[tokio::test]
async fn test_switch_cameras_end_to_end() {
    let h = harness(6000).await;

    // Index 1 is the USB secondary after priority sorting.
    let reply = h
        .gs
        .send_cmd_sync(
            CommandId::Set,
            SubCommand::SwitchCameras,
            &1u32.to_le_bytes(),
            64,
            Duration::from_secs(2),
        )
        .await
        .expect("switch accepted");
    assert_eq!(u32::from_le_bytes(reply[..4].try_into().unwrap()), 1);
    assert_eq!(u32::from_le_bytes(reply[4..8].try_into().unwrap()), 2);

    // The CSI camera came down before the USB camera came up.
    let calls = h.driver.calls.lock().unwrap().clone();
    assert_eq!(
        calls,
        vec![
            "init:csi-primary",
            "bind:csi-primary",
            "unbind:csi-primary",
            "deinit:csi-primary",
            "init:usb-secondary",
            "bind:usb-secondary",
        ]
    );

    h.teardown().await;
}

#[tokio::test]
async fn test_codec_get_reports_hevc_default() {
    let h = harness(6000).await;

    let reply = h
        .gs
        .send_cmd_sync(
            CommandId::Get,
            SubCommand::Codec,
            &[],
            64,
            Duration::from_secs(2),
        )
        .await
        .unwrap();
    assert_eq!(u32::from_le_bytes(reply[..4].try_into().unwrap()), 1);

    h.teardown().await;
}

#[tokio::test]
async fn test_payload_size_not_implemented() {
    let h = harness(6000).await;

    let result = h
        .gs
        .send_cmd_sync(
            CommandId::Get,
            SubCommand::PayloadSize,
            &[],
            64,
            Duration::from_secs(2),
        )
        .await;
    assert!(matches!(result, Err(SyncCmdError::Nack(_))));

    h.teardown().await;
}
