//! GS-side video pipeline: UDP ingress → RTP depacketize → codec detect →
//! decoder feed → present.

pub mod decoder;
pub mod present;
pub mod rtp;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::{Codec, DisplayConfig};
use decoder::{DecodeError, DecoderBackend, PacketFeeder};
use present::{Blitter, DisplayBackend, Presenter, Rotation};
use rtp::{CodecDetector, Depacketizer, DetectOutcome, RtpPacket};

#[derive(Error, Debug)]
pub enum VideoError {
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec detection failed")]
    DetectionFailed,

    #[error(transparent)]
    Decode(#[from] DecodeError),
}

/// Owns the RTP ingress task and the decoder thread.
pub struct VideoPipeline {
    running: Arc<AtomicBool>,
    ingress: Option<JoinHandle<()>>,
}

impl VideoPipeline {
    /// Bind the RTP socket and start the pipeline. The decoder starts once
    /// the codec is known (forced by config, or auto-detected from the
    /// first decisive payloads).
    pub async fn start(
        config: &DisplayConfig,
        backend: Arc<dyn DecoderBackend>,
        display: Arc<dyn DisplayBackend>,
        blitter: Arc<dyn Blitter>,
        rotation: Rotation,
    ) -> Result<Self, VideoError> {
        let socket = UdpSocket::bind((config.ip.as_str(), config.port)).await?;
        info!(addr = %socket.local_addr()?, "RTP ingress listening");

        let running = Arc::new(AtomicBool::new(true));
        let ingress = tokio::spawn(ingress_loop(
            socket,
            config.codec,
            config.payload_type,
            backend,
            display,
            blitter,
            rotation,
            Arc::clone(&running),
        ));

        Ok(Self {
            running,
            ingress: Some(ingress),
        })
    }

    pub async fn stop(mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(task) = self.ingress.take() {
            if let Err(e) = task.await {
                error!(error = %e, "RTP ingress join failed");
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn ingress_loop(
    socket: UdpSocket,
    forced_codec: Option<Codec>,
    payload_type: u8,
    backend: Arc<dyn DecoderBackend>,
    display: Arc<dyn DisplayBackend>,
    blitter: Arc<dyn Blitter>,
    rotation: Rotation,
    running: Arc<AtomicBool>,
) {
    let mut buf = vec![0u8; 2048];

    // Phase 1: codec detection, skipped when the CLI forces a codec.
    let codec = match forced_codec {
        Some(codec) => {
            info!(?codec, "codec forced by configuration");
            codec
        }
        None => {
            match detect_phase(&socket, payload_type, &mut buf, &running).await {
                Some(codec) => codec,
                None => {
                    if running.load(Ordering::Acquire) {
                        error!("failed to detect codec from RTP stream");
                    }
                    return;
                }
            }
        }
    };

    if let Err(e) = backend.start(codec) {
        error!(error = %e, "decoder start failed");
        return;
    }

    // Decoder pull loop on a blocking thread; the presenter moves in.
    let mut presenter = Presenter::new(display, blitter, rotation);
    let loop_backend = Arc::clone(&backend);
    let loop_running = Arc::clone(&running);
    let decoder_thread = tokio::task::spawn_blocking(move || {
        decoder::run_decoder_loop(loop_backend.as_ref(), &mut presenter, &loop_running);
        presenter.release();
    });

    // Phase 2: depacketize and feed.
    let feeder = PacketFeeder::new(Arc::clone(&backend));
    let mut depacketizer = Depacketizer::new(codec);

    while running.load(Ordering::Acquire) {
        let received = tokio::select! {
            r = socket.recv_from(&mut buf) => r,
            _ = tokio::time::sleep(Duration::from_secs(1)) => continue,
        };
        let (len, _) = match received {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "RTP recv failed");
                continue;
            }
        };

        let packet = match RtpPacket::parse(&buf[..len]) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "dropping malformed RTP datagram");
                continue;
            }
        };
        if payload_type != 0 && packet.payload_type != payload_type {
            continue;
        }

        for nal in depacketizer.push(&packet) {
            // A stalled decoder drops this packet; the stream recovers at
            // the next keyframe.
            let _ = feeder.feed(&nal);
        }
    }

    backend.stop();
    if let Err(e) = decoder_thread.await {
        error!(error = %e, "decoder thread join failed");
    }
    info!(stalls = feeder.stall_count(), "RTP ingress stopped");
}

async fn detect_phase(
    socket: &UdpSocket,
    payload_type: u8,
    buf: &mut [u8],
    running: &AtomicBool,
) -> Option<Codec> {
    let mut detector = CodecDetector::default();

    while running.load(Ordering::Acquire) {
        let received = tokio::select! {
            r = socket.recv_from(buf) => r,
            _ = tokio::time::sleep(Duration::from_secs(5)) => continue,
        };
        let (len, _) = match received {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "RTP recv failed during detection");
                continue;
            }
        };
        let Ok(packet) = RtpPacket::parse(&buf[..len]) else {
            continue;
        };
        if payload_type != 0 && packet.payload_type != payload_type {
            continue;
        }
        match detector.push(&packet.payload) {
            DetectOutcome::Detected(codec) => return Some(codec),
            DetectOutcome::GaveUp => return None,
            DetectOutcome::Undecided => {}
        }
    }
    None
}
