//! WFB status-link listener.
//!
//! The wfb receiver publishes periodic JSON status datagrams with per-key
//! packet counters and per-antenna RF statistics. The GS renders a summary
//! on the OSD overlay's bottom line. Datagrams that fail to parse are
//! dropped; the stream is purely informational.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Deserialize;
use thiserror::Error;
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

pub const MAX_ANTENNAS: usize = 16;

#[derive(Error, Debug)]
pub enum WfbError {
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
}

/// One RX antenna record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize)]
pub struct AntennaStats {
    #[serde(default)]
    pub freq: i64,
    #[serde(default)]
    pub mcs: i64,
    #[serde(default)]
    pub bw: i64,
    #[serde(default)]
    pub ant_id: i64,
    #[serde(default)]
    pub pkt_delta: i64,
    #[serde(default)]
    pub rssi_avg: i64,
    #[serde(default)]
    pub snr_avg: i64,
    #[serde(default)]
    pub bitrate_mbps: f32,
}

/// Parsed status datagram.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WfbRxStatus {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub ants: Vec<AntennaStats>,
}

impl WfbRxStatus {
    pub fn parse(datagram: &[u8]) -> Option<Self> {
        let mut status: WfbRxStatus = serde_json::from_slice(datagram).ok()?;
        status.ants.truncate(MAX_ANTENNAS);
        Some(status)
    }
}

/// Format the overlay's bottom status line: frequency, bandwidth symbol +
/// bitrate, link-quality symbol + RSSI per antenna.
pub fn format_status_line(status: &WfbRxStatus) -> Option<String> {
    const CHAR_LINK_LQ: char = '\u{7B}';
    const CHAR_LINK_BW: char = '\u{70}';

    let first = status.ants.first()?;
    let mut line = format!(
        "{} {}{:.1} {}{}",
        first.freq, CHAR_LINK_BW, first.bitrate_mbps, CHAR_LINK_LQ, first.rssi_avg
    );
    for ant in &status.ants[1..] {
        line.push_str(&format!(" {}{}", CHAR_LINK_LQ, ant.rssi_avg));
    }
    Some(line)
}

/// Spawn the UDP listener; `on_status` runs for every parsed datagram.
pub async fn spawn_listener(
    host: &str,
    port: u16,
    running: Arc<AtomicBool>,
    on_status: impl Fn(&WfbRxStatus) + Send + Sync + 'static,
) -> Result<tokio::task::JoinHandle<()>, WfbError> {
    let socket = UdpSocket::bind((host, port)).await?;
    info!(addr = %socket.local_addr()?, "WFB status link listening");

    Ok(tokio::spawn(async move {
        let mut buf = vec![0u8; 8192];
        while running.load(Ordering::Acquire) {
            let received = tokio::select! {
                r = socket.recv_from(&mut buf) => r,
                _ = tokio::time::sleep(std::time::Duration::from_secs(1)) => continue,
            };
            match received {
                Ok((len, _)) => match WfbRxStatus::parse(&buf[..len]) {
                    Some(status) => on_status(&status),
                    None => debug!(len, "undecodable WFB status datagram"),
                },
                Err(e) => {
                    warn!(error = %e, "WFB status recv failed");
                }
            }
        }
        info!("WFB status link stopped");
    }))
}
