//! Airborne node: camera → encoder → RTP egress, plus the command,
//! telemetry and RC surfaces of the link.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use fpv_link::camera::{CameraManager, V4lScanner};
use fpv_link::command::CommandDispatcher;
use fpv_link::config::{Codec, Config};
use fpv_link::hal::{InitScriptServices, LoggingCameraDriver, NullEncoder};
use fpv_link::link::{LinkMode, LinkPeer, LinkRole};
use fpv_link::proxy::{TunnelManager, TunnelPorts};
use fpv_link::telemetry;
use fpv_link::telemetry::modem::UqmiProbe;

#[derive(Parser, Debug)]
#[command(name = "fpv-drone")]
#[command(about = "Drone-side video/telemetry/command link node")]
#[command(version)]
struct Cli {
    /// Path to the persisted configuration file
    #[arg(short, long, default_value = "/etc/fpv-link.toml")]
    config: PathBuf,

    /// RTP destination address override
    #[arg(long)]
    ip: Option<String>,

    /// RTP destination port override
    #[arg(long)]
    port: Option<u16>,

    /// Force the encoder codec
    #[arg(long, value_parser = parse_codec)]
    codec: Option<Codec>,

    /// Use the tunnel-mode link endpoints
    #[arg(long)]
    tunnel: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn parse_codec(value: &str) -> Result<Codec, String> {
    match value.to_ascii_lowercase().as_str() {
        "h264" => Ok(Codec::H264),
        "h265" => Ok(Codec::H265),
        other => Err(format!("unsupported codec '{other}' (h264|h265)")),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    fmt().with_env_filter(filter).with_target(false).init();

    info!(config = %cli.config.display(), "fpv-drone starting");

    let mut config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            warn!(error = %e, "cannot load configuration, using defaults");
            let mut config = Config::default();
            config.persist_path = cli.config.clone();
            config
        }
    };
    if let Some(ip) = cli.ip {
        config.stream.ip = ip;
    }
    if let Some(port) = cli.port {
        config.stream.port = port;
    }
    if let Some(codec) = cli.codec {
        config.encoder.codec = codec;
    }

    info!(
        codec = ?config.encoder.codec,
        resolution = %format!("{}x{}", config.encoder.width, config.encoder.height),
        bitrate = config.encoder.bitrate,
        fps = config.encoder.fps,
        gop = config.encoder.gop,
        stream = %format!("{}:{}", config.stream.ip, config.stream.port),
        "configuration"
    );

    // Camera discovery and primary selection.
    let driver = Arc::new(LoggingCameraDriver);
    let mut cameras = CameraManager::new(&V4lScanner, driver);
    info!(count = cameras.count(), "cameras discovered");
    for cam in cameras.cameras() {
        info!(
            name = %cam.name,
            path = %cam.device_path,
            kind = ?cam.camera_type,
            sensor = ?cam.sensor,
            priority = ?cam.priority,
            quality = cam.quality_score,
            "camera"
        );
    }
    if let Err(e) = cameras.select_primary(&mut config) {
        warn!(error = %e, "no camera bound, continuing without capture");
    }

    let config = Arc::new(Mutex::new(config));
    let cameras = Arc::new(Mutex::new(cameras));

    // Link peer and the command path.
    let mode = if cli.tunnel {
        LinkMode::Tunnel
    } else {
        LinkMode::Direct
    };
    let mut link = LinkPeer::bind(LinkRole::Drone, mode)
        .await
        .context("link init failed")?;

    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    link.register_cmd_cb(move |frame| {
        if cmd_tx.send(frame.clone()).is_err() {
            warn!("command dispatcher gone, dropping frame");
        }
    });
    link.register_rc_cb(|channels| {
        tracing::debug!(?channels, "RC frame");
    });

    let default_config = PathBuf::from("/etc/fpv-link.default.toml");
    let dispatcher = CommandDispatcher::new(
        Arc::clone(&config),
        Arc::new(NullEncoder),
        Arc::new(NullEncoder),
        Arc::clone(&cameras),
        TunnelManager::new(TunnelPorts::default()),
        Arc::new(InitScriptServices::default()),
        Arc::new(link.sender()),
        default_config,
    );
    let dispatcher_task = tokio::spawn(dispatcher.run(cmd_rx));

    // Telemetry producer.
    let running = Arc::new(AtomicBool::new(true));
    let telemetry_task = telemetry::spawn_producer(
        link.sender(),
        Arc::new(UqmiProbe::default()),
        Arc::clone(&running),
    );

    info!("fpv-drone running, press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;
    info!("shutting down");

    running.store(false, Ordering::Release);
    link.shutdown().await;
    dispatcher_task.abort();
    telemetry_task.abort();

    let mut cameras = cameras.lock().unwrap();
    let mut config = config.lock().unwrap();
    cameras.release_current(&mut config);

    info!("fpv-drone stopped");
    Ok(())
}
