//! Drone-side command dispatcher.
//!
//! Interprets every incoming `Cmd` frame against the live configuration and
//! replies with an ACK carrying the effective value, or a NACK carrying the
//! unchanged current value. SET handlers for encoder parameters are
//! transactional: the previous value is restored when the hardware rejects
//! the new one.
//!
//! Frames are funneled from the link receive task into a channel and
//! consumed by a single dispatcher task, so no handler ever races another.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::camera::CameraManager;
use crate::config::{Codec, Config, RateControlMode};
use crate::encoder::{CameraTuning, EncoderControl, ServiceControl};
use crate::link::packet::{CommandFrame, CommandId, SubCommand};
use crate::link::LinkSender;
use crate::proxy::{parse_gs_ip, TunnelManager};

/// Where command replies go. [`LinkSender`] in production; tests record.
pub trait ReplySink: Send + Sync {
    fn reply(&self, cmd: CommandId, subcmd: u8, data: &[u8]);
}

impl ReplySink for LinkSender {
    fn reply(&self, cmd: CommandId, subcmd: u8, data: &[u8]) {
        if let Err(e) = self.send_cmd_raw(cmd, subcmd, data) {
            warn!(error = %e, subcmd, "failed to send command reply");
        }
    }
}

/// Everything a command can touch.
pub struct CommandDispatcher {
    config: Arc<Mutex<Config>>,
    encoder: Arc<dyn EncoderControl>,
    tuning: Arc<dyn CameraTuning>,
    cameras: Arc<Mutex<CameraManager>>,
    tunnels: TunnelManager,
    services: Arc<dyn ServiceControl>,
    sink: Arc<dyn ReplySink>,
    /// Flight-controller variant tag, e.g. "BTFL"; "UNK" when no FC link.
    fc_variant: String,
    /// Source for `RestoreDefault`.
    default_config_path: PathBuf,
}

impl CommandDispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<Mutex<Config>>,
        encoder: Arc<dyn EncoderControl>,
        tuning: Arc<dyn CameraTuning>,
        cameras: Arc<Mutex<CameraManager>>,
        tunnels: TunnelManager,
        services: Arc<dyn ServiceControl>,
        sink: Arc<dyn ReplySink>,
        default_config_path: PathBuf,
    ) -> Self {
        Self {
            config,
            encoder,
            tuning,
            cameras,
            tunnels,
            services,
            sink,
            fc_variant: "UNK".to_string(),
            default_config_path,
        }
    }

    pub fn set_fc_variant(&mut self, variant: impl Into<String>) {
        self.fc_variant = variant.into();
    }

    /// Consume frames until the channel closes. The single consumer
    /// serializes all command handling.
    pub async fn run(mut self, mut rx: mpsc::UnboundedReceiver<CommandFrame>) {
        info!("command dispatcher started");
        while let Some(frame) = rx.recv().await {
            self.handle(frame).await;
        }
        self.tunnels.stop().await;
        info!("command dispatcher stopped");
    }

    fn ack(&self, subcmd: u8, data: &[u8]) {
        self.sink.reply(CommandId::Ack, subcmd, data);
    }

    fn nack(&self, subcmd: u8, data: &[u8]) {
        self.sink.reply(CommandId::Nack, subcmd, data);
    }

    pub async fn handle(&mut self, frame: CommandFrame) {
        if frame.cmd.is_reply() {
            debug!(subcmd = frame.subcmd, "ignoring unsolicited reply frame");
            return;
        }

        let Some(sub) = frame.subcommand() else {
            warn!(subcmd = frame.subcmd, "unknown sub-command");
            self.nack(frame.subcmd, &[]);
            return;
        };

        debug!(cmd = ?frame.cmd, sub = ?sub, size = frame.data.len(), "command received");

        match sub {
            SubCommand::SysInfo => {
                if frame.cmd == CommandId::Get {
                    let mut variant = [0u8; 4];
                    let src = self.fc_variant.as_bytes();
                    let n = src.len().min(4);
                    variant[..n].copy_from_slice(&src[..n]);
                    self.ack(sub as u8, &variant);
                }
            }

            SubCommand::Bitrate => self.handle_bitrate(frame.cmd, &frame.data),
            SubCommand::Fps => self.handle_fps(frame.cmd, &frame.data),
            SubCommand::Gop => self.handle_gop(frame.cmd, &frame.data),
            SubCommand::Vbr => self.handle_vbr(frame.cmd, &frame.data),
            SubCommand::Codec => self.handle_codec(frame.cmd, &frame.data),
            SubCommand::FocusMode => self.handle_focus_mode(frame.cmd, &frame.data),
            SubCommand::PayloadSize => {
                // Not supported by the current encoder pipeline.
                self.nack(sub as u8, &[]);
            }

            SubCommand::Brightness
            | SubCommand::Contrast
            | SubCommand::Saturation
            | SubCommand::Sharpness => self.handle_tuning(sub, frame.cmd, &frame.data),
            SubCommand::Hdr => self.handle_hdr(frame.cmd, &frame.data),
            SubCommand::MirrorFlip => self.handle_mirror_flip(frame.cmd, &frame.data),

            SubCommand::Detection => self.handle_detection(frame.cmd, &frame.data),
            SubCommand::WfbKey => self.handle_wfb_key(frame.cmd, &frame.data),
            SubCommand::SwitchCameras => self.handle_switch_cameras(frame.cmd, &frame.data),

            SubCommand::SavePersistent => {
                if frame.cmd == CommandId::Set {
                    let (path, result) = {
                        let config = self.config.lock().unwrap();
                        let path = config.persist_path.clone();
                        (path.clone(), config.save(&path))
                    };
                    match result {
                        Ok(()) => {
                            info!(path = %path.display(), "configuration persisted");
                            self.ack(sub as u8, &[]);
                        }
                        Err(e) => {
                            error!(error = %e, "failed to persist configuration");
                            self.nack(sub as u8, &[]);
                        }
                    }
                }
            }

            SubCommand::RestoreDefault => {
                if frame.cmd == CommandId::Set {
                    match Config::load(&self.default_config_path) {
                        Ok(mut fresh) => {
                            let mut config = self.config.lock().unwrap();
                            fresh.persist_path = config.persist_path.clone();
                            *config = fresh;
                            info!("configuration restored from defaults");
                            drop(config);
                            self.ack(sub as u8, &[]);
                        }
                        Err(e) => {
                            error!(error = %e, "failed to load default configuration");
                            self.nack(sub as u8, &[]);
                        }
                    }
                }
            }

            SubCommand::Reboot => {
                if frame.cmd == CommandId::Set {
                    let Some(target) = read_u32(&frame.data) else {
                        self.nack(sub as u8, &[]);
                        return;
                    };
                    info!(target, "reboot command received");
                    // ACK first and let it egress before the service goes
                    // down.
                    self.ack(sub as u8, &target.to_le_bytes());
                    let services = Arc::clone(&self.services);
                    tokio::spawn(async move {
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        if let Err(e) = services.restart(target) {
                            error!(error = %e, target, "service restart failed");
                        }
                    });
                }
            }

            SubCommand::SetGsIp => {
                if frame.cmd == CommandId::Set {
                    match parse_gs_ip(&frame.data) {
                        Ok(ip) => match self.tunnels.retarget(ip).await {
                            Ok(()) => {
                                let text = ip.to_string();
                                self.ack(sub as u8, text.as_bytes());
                            }
                            Err(e) => {
                                error!(error = %e, "tunnel retarget failed");
                                self.nack(sub as u8, &[]);
                            }
                        },
                        Err(e) => {
                            warn!(error = %e, "bad SetGsIp payload");
                            self.nack(sub as u8, &[]);
                        }
                    }
                }
            }
        }
    }

    /// Wire unit is kbps; the configuration stores bps. The conversion
    /// happens exactly here and nowhere else.
    fn handle_bitrate(&self, cmd: CommandId, data: &[u8]) {
        let sub = SubCommand::Bitrate as u8;
        match cmd {
            CommandId::Get => {
                let kbps = self.config.lock().unwrap().encoder.bitrate / 1024;
                self.ack(sub, &kbps.to_le_bytes());
            }
            CommandId::Set => {
                let old_bps = self.config.lock().unwrap().encoder.bitrate;
                let Some(kbps) = read_u32(data) else {
                    self.nack(sub, &(old_bps / 1024).to_le_bytes());
                    return;
                };
                let new_bps = kbps.saturating_mul(1024);
                match self.encoder.set_bitrate(new_bps) {
                    Ok(()) => {
                        self.config.lock().unwrap().encoder.bitrate = new_bps;
                        info!(kbps, "bitrate applied");
                        self.ack(sub, &kbps.to_le_bytes());
                    }
                    Err(e) => {
                        warn!(error = %e, kbps, "bitrate rejected, restoring previous");
                        if let Err(e) = self.encoder.set_bitrate(old_bps) {
                            error!(error = %e, old_bps, "critical: bitrate rollback failed");
                        }
                        self.nack(sub, &(old_bps / 1024).to_le_bytes());
                    }
                }
            }
            _ => {}
        }
    }

    fn handle_fps(&self, cmd: CommandId, data: &[u8]) {
        let sub = SubCommand::Fps as u8;
        match cmd {
            CommandId::Get => {
                let fps = self.config.lock().unwrap().encoder.fps;
                self.ack(sub, &fps.to_le_bytes());
            }
            CommandId::Set => {
                let old = self.config.lock().unwrap().encoder.fps;
                let Some(fps) = read_u32(data) else {
                    self.nack(sub, &old.to_le_bytes());
                    return;
                };
                match self.encoder.set_fps(fps) {
                    Ok(()) => {
                        self.config.lock().unwrap().encoder.fps = fps;
                        info!(fps, "fps applied");
                        self.ack(sub, &fps.to_le_bytes());
                    }
                    Err(e) => {
                        warn!(error = %e, fps, "fps rejected, restoring previous");
                        if let Err(e) = self.encoder.set_fps(old) {
                            error!(error = %e, old, "critical: fps rollback failed");
                        }
                        self.nack(sub, &old.to_le_bytes());
                    }
                }
            }
            _ => {}
        }
    }

    fn handle_gop(&self, cmd: CommandId, data: &[u8]) {
        let sub = SubCommand::Gop as u8;
        match cmd {
            CommandId::Get => {
                let gop = self.config.lock().unwrap().encoder.gop;
                self.ack(sub, &gop.to_le_bytes());
            }
            CommandId::Set => {
                let old = self.config.lock().unwrap().encoder.gop;
                let Some(gop) = read_u32(data) else {
                    self.nack(sub, &old.to_le_bytes());
                    return;
                };
                match self.encoder.set_gop(gop) {
                    Ok(()) => {
                        self.config.lock().unwrap().encoder.gop = gop;
                        info!(gop, "gop applied");
                        self.ack(sub, &gop.to_le_bytes());
                    }
                    Err(e) => {
                        warn!(error = %e, gop, "gop rejected, restoring previous");
                        if let Err(e) = self.encoder.set_gop(old) {
                            error!(error = %e, old, "critical: gop rollback failed");
                        }
                        self.nack(sub, &old.to_le_bytes());
                    }
                }
            }
            _ => {}
        }
    }

    fn handle_vbr(&self, cmd: CommandId, data: &[u8]) {
        let sub = SubCommand::Vbr as u8;
        match cmd {
            CommandId::Get => {
                let enabled =
                    (self.config.lock().unwrap().encoder.rate_mode == RateControlMode::Vbr) as u32;
                self.ack(sub, &enabled.to_le_bytes());
            }
            CommandId::Set => {
                let old = self.config.lock().unwrap().encoder.rate_mode;
                let Some(enabled) = read_u32(data) else {
                    self.nack(sub, &((old == RateControlMode::Vbr) as u32).to_le_bytes());
                    return;
                };
                let mode = if enabled != 0 {
                    RateControlMode::Vbr
                } else {
                    RateControlMode::Cbr
                };
                match self.encoder.set_rate_control(mode) {
                    Ok(()) => {
                        self.config.lock().unwrap().encoder.rate_mode = mode;
                        info!(?mode, "rate control applied");
                        self.ack(sub, &enabled.to_le_bytes());
                    }
                    Err(e) => {
                        warn!(error = %e, ?mode, "rate control rejected, restoring previous");
                        if let Err(e) = self.encoder.set_rate_control(old) {
                            error!(error = %e, "critical: rate control rollback failed");
                        }
                        self.nack(sub, &((old == RateControlMode::Vbr) as u32).to_le_bytes());
                    }
                }
            }
            _ => {}
        }
    }

    fn handle_codec(&self, cmd: CommandId, data: &[u8]) {
        let sub = SubCommand::Codec as u8;
        match cmd {
            CommandId::Get => {
                let is_hevc = (self.config.lock().unwrap().encoder.codec == Codec::H265) as u32;
                self.ack(sub, &is_hevc.to_le_bytes());
            }
            CommandId::Set => {
                let old = self.config.lock().unwrap().encoder.codec;
                let Some(is_hevc) = read_u32(data) else {
                    self.nack(sub, &((old == Codec::H265) as u32).to_le_bytes());
                    return;
                };
                let codec = if is_hevc != 0 { Codec::H265 } else { Codec::H264 };
                match self.encoder.set_codec(codec) {
                    Ok(()) => {
                        self.config.lock().unwrap().encoder.codec = codec;
                        info!(?codec, "codec applied");
                        self.ack(sub, &is_hevc.to_le_bytes());
                    }
                    Err(e) => {
                        warn!(error = %e, ?codec, "codec rejected, restoring previous");
                        if let Err(e) = self.encoder.set_codec(old) {
                            error!(error = %e, "critical: codec rollback failed");
                        }
                        self.nack(sub, &((old == Codec::H265) as u32).to_le_bytes());
                    }
                }
            }
            _ => {}
        }
    }

    fn handle_focus_mode(&self, cmd: CommandId, data: &[u8]) {
        let sub = SubCommand::FocusMode as u8;
        match cmd {
            CommandId::Get => {
                let quality = self.config.lock().unwrap().encoder.focus_quality;
                self.ack(sub, &quality.to_le_bytes());
            }
            CommandId::Set => {
                let Some(raw) = read_u32(data) else {
                    let current = self.config.lock().unwrap().encoder.focus_quality;
                    self.nack(sub, &current.to_le_bytes());
                    return;
                };
                let quality = raw as i32;
                self.config.lock().unwrap().encoder.focus_quality = quality;
                if let Err(e) = self.encoder.set_focus_mode(quality) {
                    warn!(error = %e, quality, "focus mode setter failed");
                }
                self.ack(sub, &quality.to_le_bytes());
            }
            _ => {}
        }
    }

    fn handle_tuning(&self, sub: SubCommand, cmd: CommandId, data: &[u8]) {
        let read_current = |config: &Config| match sub {
            SubCommand::Brightness => config.camera_csi.brightness,
            SubCommand::Contrast => config.camera_csi.contrast,
            SubCommand::Saturation => config.camera_csi.saturation,
            SubCommand::Sharpness => config.camera_csi.sharpness,
            _ => unreachable!("handle_tuning only sees tuning sub-commands"),
        };

        match cmd {
            CommandId::Get => {
                let current = read_current(&self.config.lock().unwrap());
                self.ack(sub as u8, &current.to_le_bytes());
            }
            CommandId::Set => {
                let (cam_id, current) = {
                    let config = self.config.lock().unwrap();
                    (config.camera_csi.cam_id, read_current(&config))
                };
                let Some(value) = read_u32(data) else {
                    self.nack(sub as u8, &current.to_le_bytes());
                    return;
                };
                let result = match sub {
                    SubCommand::Brightness => self.tuning.set_brightness(cam_id, value),
                    SubCommand::Contrast => self.tuning.set_contrast(cam_id, value),
                    SubCommand::Saturation => self.tuning.set_saturation(cam_id, value),
                    SubCommand::Sharpness => self.tuning.set_sharpness(cam_id, value),
                    _ => unreachable!(),
                };
                match result {
                    Ok(()) => {
                        let mut config = self.config.lock().unwrap();
                        match sub {
                            SubCommand::Brightness => config.camera_csi.brightness = value,
                            SubCommand::Contrast => config.camera_csi.contrast = value,
                            SubCommand::Saturation => config.camera_csi.saturation = value,
                            SubCommand::Sharpness => config.camera_csi.sharpness = value,
                            _ => unreachable!(),
                        }
                        drop(config);
                        self.ack(sub as u8, &value.to_le_bytes());
                    }
                    Err(e) => {
                        warn!(error = %e, ?sub, value, "camera tuning rejected");
                        self.nack(sub as u8, &current.to_le_bytes());
                    }
                }
            }
            _ => {}
        }
    }

    fn handle_hdr(&self, cmd: CommandId, data: &[u8]) {
        let sub = SubCommand::Hdr as u8;
        match cmd {
            CommandId::Get => {
                let enabled = self.config.lock().unwrap().camera_csi.hdr_enabled as u32;
                self.ack(sub, &enabled.to_le_bytes());
            }
            CommandId::Set => {
                let (cam_id, current) = {
                    let config = self.config.lock().unwrap();
                    (config.camera_csi.cam_id, config.camera_csi.hdr_enabled as u32)
                };
                let Some(enabled) = read_u32(data) else {
                    self.nack(sub, &current.to_le_bytes());
                    return;
                };
                match self.tuning.set_hdr_mode(cam_id, enabled != 0) {
                    Ok(()) => {
                        self.config.lock().unwrap().camera_csi.hdr_enabled = enabled != 0;
                        self.ack(sub, &enabled.to_le_bytes());
                    }
                    Err(e) => {
                        warn!(error = %e, "HDR mode rejected");
                        self.nack(sub, &current.to_le_bytes());
                    }
                }
            }
            _ => {}
        }
    }

    fn handle_mirror_flip(&self, cmd: CommandId, data: &[u8]) {
        let sub = SubCommand::MirrorFlip as u8;
        match cmd {
            CommandId::Get => {
                let config = self.config.lock().unwrap();
                let mask = (config.camera_csi.mirror as u32) | ((config.camera_csi.flip as u32) << 1);
                drop(config);
                self.ack(sub, &mask.to_le_bytes());
            }
            CommandId::Set => {
                let Some(mask) = read_u32(data) else {
                    let config = self.config.lock().unwrap();
                    let current =
                        (config.camera_csi.mirror as u32) | ((config.camera_csi.flip as u32) << 1);
                    drop(config);
                    self.nack(sub, &current.to_le_bytes());
                    return;
                };
                let mirror = mask & 0x01 != 0;
                let flip = mask & 0x02 != 0;
                let cam_id = {
                    let mut config = self.config.lock().unwrap();
                    config.camera_csi.mirror = mirror;
                    config.camera_csi.flip = flip;
                    config.camera_csi.cam_id
                };
                if let Err(e) = self.tuning.set_mirror_flip(cam_id, mirror, flip) {
                    warn!(error = %e, "mirror/flip setter failed");
                }
                self.ack(sub, &mask.to_le_bytes());
            }
            _ => {}
        }
    }

    fn handle_detection(&self, cmd: CommandId, data: &[u8]) {
        let sub = SubCommand::Detection as u8;
        match cmd {
            CommandId::Get => {
                let enabled = self.config.lock().unwrap().link.detection_enabled as u32;
                self.ack(sub, &enabled.to_le_bytes());
            }
            CommandId::Set => {
                let Some(enabled) = read_u32(data) else {
                    self.nack(sub, &[]);
                    return;
                };
                self.config.lock().unwrap().link.detection_enabled = enabled != 0;
                self.ack(sub, &enabled.to_le_bytes());
            }
            _ => {}
        }
    }

    fn handle_wfb_key(&self, cmd: CommandId, data: &[u8]) {
        let sub = SubCommand::WfbKey as u8;
        match cmd {
            CommandId::Get => {
                let key = self.config.lock().unwrap().link.wfb_key.clone();
                self.ack(sub, key.as_bytes());
            }
            CommandId::Set => {
                if data.is_empty() || data.len() > 64 {
                    self.nack(sub, &[]);
                    return;
                }
                let key = String::from_utf8_lossy(data)
                    .trim_end_matches('\0')
                    .to_string();
                info!(len = key.len(), "WFB key updated");
                self.config.lock().unwrap().link.wfb_key = key;
                self.ack(sub, &[]);
            }
            _ => {}
        }
    }

    fn handle_switch_cameras(&self, cmd: CommandId, data: &[u8]) {
        let sub = SubCommand::SwitchCameras as u8;
        match cmd {
            CommandId::Get => {
                let cameras = self.cameras.lock().unwrap();
                match cameras.current_index() {
                    Some(index) => {
                        let reply = pack_index_total(index as u32, cameras.count() as u32);
                        self.ack(sub, &reply);
                    }
                    None => self.nack(sub, &[]),
                }
            }
            CommandId::Set => {
                let Some(index) = read_u32(data) else {
                    self.nack(sub, &[]);
                    return;
                };
                let mut cameras = self.cameras.lock().unwrap();
                let mut config = self.config.lock().unwrap();
                match cameras.select_by_index(&mut config, index as usize) {
                    Ok(()) => {
                        let reply = pack_index_total(index, cameras.count() as u32);
                        drop(config);
                        drop(cameras);
                        self.ack(sub, &reply);
                    }
                    Err(e) => {
                        warn!(error = %e, index, "camera switch failed");
                        drop(config);
                        drop(cameras);
                        self.nack(sub, &[]);
                    }
                }
            }
            _ => {}
        }
    }
}

/// Exactly four little-endian bytes, or nothing.
fn read_u32(data: &[u8]) -> Option<u32> {
    let bytes: [u8; 4] = data.try_into().ok()?;
    Some(u32::from_le_bytes(bytes))
}

fn pack_index_total(index: u32, total: u32) -> [u8; 8] {
    let mut out = [0u8; 8];
    out[..4].copy_from_slice(&index.to_le_bytes());
    out[4..].copy_from_slice(&total.to_le_bytes());
    out
}
