//! Ground station: RTP ingress → decoder → video plane, link peer →
//! OSD grid + overlay → OSD plane.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use fpv_link::config::{Codec, DisplayConfig};
use fpv_link::hal::{HeadlessDisplay, NullBlitter, NullDecoder};
use fpv_link::link::{LinkMode, LinkPeer, LinkRole};
use fpv_link::osd::font::{FontPage, FontSet};
use fpv_link::osd::grid::GRID_ROWS;
use fpv_link::osd::msp::MspParser;
use fpv_link::osd::{DisplayMode, MspOsdBridge, OsdComposer};
use fpv_link::video::present::{DisplayBackend, Rotation};
use fpv_link::video::VideoPipeline;
use fpv_link::wfb;

#[derive(Parser, Debug)]
#[command(name = "fpv-gs")]
#[command(about = "Ground-station video decoder and OSD compositor")]
#[command(version)]
struct Cli {
    /// Address to listen on for the RTP stream
    #[arg(long, default_value = "0.0.0.0")]
    ip: String,

    /// RTP stream port
    #[arg(long, default_value_t = 5602)]
    port: u16,

    /// WFB status-link port
    #[arg(long, default_value_t = 8003)]
    wfb: u16,

    /// Wait for vsync on atomic commits instead of non-blocking flips
    #[arg(long)]
    vsync: bool,

    /// Display rotation in degrees (0, 90, 180, 270)
    #[arg(long, default_value_t = 0)]
    rotation: u32,

    /// Skip detection and force the stream codec
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

    if cli.port == cli.wfb {
        anyhow::bail!("RTP port and WFB port must differ");
    }
    let rotation = Rotation::from_degrees(cli.rotation).context("invalid --rotation")?;

    let config = DisplayConfig {
        ip: cli.ip.clone(),
        port: cli.port,
        wfb_port: cli.wfb,
        vsync: cli.vsync,
        payload_type: 0,
        codec: cli.codec,
    };
    info!(
        rtp = %format!("{}:{}", config.ip, config.port),
        wfb = config.wfb_port,
        vsync = config.vsync,
        ?rotation,
        "fpv-gs starting"
    );

    // Display, decoder and blitter collaborators. Target builds install
    // the KMS/MPP/RGA-backed implementations here.
    let display: Arc<dyn DisplayBackend> = Arc::new(HeadlessDisplay::new(1920, 1080));
    let decoder = Arc::new(NullDecoder);
    let blitter = Arc::new(NullBlitter::default());

    // OSD composer with a built-in fallback font; real glyph assets are
    // loaded by the packaging layer.
    let composer = Arc::new(OsdComposer::new(Arc::clone(&display), rotation));
    let mut fonts = FontSet::default();
    fonts.set_page(0, FontPage::solid(24, 36, [255, 255, 255, 255]));
    composer.set_fonts(fonts);
    composer.set_mode(DisplayMode::Running);
    composer.splash();

    // Link peer: DisplayPort bytes feed the MSP parser, telemetry goes to
    // the overlay.
    let mode = if cli.tunnel {
        LinkMode::Tunnel
    } else {
        LinkMode::Direct
    };
    let mut link = LinkPeer::bind(LinkRole::GroundStation, mode)
        .await
        .context("link init failed")?;

    let msp = Mutex::new((MspParser::new(), MspOsdBridge::new(Arc::clone(&composer))));
    link.register_displayport_cb(move |data| {
        let mut guard = msp.lock().unwrap();
        let (parser, bridge) = &mut *guard;
        parser.feed(data, bridge);
    });

    let telemetry_composer = Arc::clone(&composer);
    link.register_sys_telemetry_cb(move |t| {
        let line = format!("CPU {:.0}C {:.0}%", t.cpu_temp_c, t.cpu_usage_pct);
        telemetry_composer.print_overlay(0, 0, 0, line.as_bytes());
    });

    let detection_count = Arc::new(Mutex::new(0usize));
    let det_counter = Arc::clone(&detection_count);
    link.register_detection_cb(move |boxes| {
        *det_counter.lock().unwrap() = boxes.len();
    });

    // WFB status on the overlay's bottom line.
    let running = Arc::new(AtomicBool::new(true));
    let wfb_composer = Arc::clone(&composer);
    let wfb_task = wfb::spawn_listener(&cli.ip, cli.wfb, Arc::clone(&running), move |status| {
        if let Some(line) = wfb::format_status_line(status) {
            wfb_composer.clear_overlay();
            wfb_composer.print_overlay(0, GRID_ROWS - 1, 0, line.as_bytes());
        }
    })
    .await
    .context("WFB status link init failed")?;

    // Video pipeline: detection, decode, present.
    let pipeline = VideoPipeline::start(&config, decoder, Arc::clone(&display), blitter, rotation)
        .await
        .context("video pipeline init failed")?;

    info!("fpv-gs running, press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;
    info!("shutting down");

    running.store(false, Ordering::Release);
    pipeline.stop().await;
    link.shutdown().await;
    if let Err(e) = wfb_task.await {
        warn!(error = %e, "WFB task join failed");
    }

    info!("fpv-gs stopped");
    Ok(())
}
