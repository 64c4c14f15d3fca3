//! Hardware decoder loop.
//!
//! The decoder SDK sits behind [`DecoderBackend`]; this module owns the
//! pull loop, the DMA buffer-pool geometry computed on info-change events,
//! and the feed path with its stall accounting.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::Codec;

/// Frames dropped after each info-change while the buffer pool settles.
pub const STARTUP_SKIP_FRAMES: u32 = 6;

/// Buffers allocated per pool.
pub const POOL_BUFFER_COUNT: usize = 8;

/// Feeding gives up after this long and counts a stall.
pub const FEED_DEADLINE: Duration = Duration::from_millis(100);

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("decoder input queue full")]
    QueueFull,

    #[error("decoder stalled, packet dropped")]
    Stalled,

    #[error("unsupported frame format {0:?}")]
    UnsupportedFormat(FrameFormat),

    #[error("decoder backend: {0}")]
    Backend(String),
}

/// Pixel layouts the pool geometry understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameFormat {
    Nv12,
    Yuv420p,
    Yuv422,
    Nv12TenBit,
    Yuv422TenBit,
}

/// Geometry of one DMA frame pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferGeometry {
    pub width: u32,
    pub height: u32,
    pub hor_stride: u32,
    pub ver_stride: u32,
    pub buffer_size: usize,
    pub count: usize,
}

fn align16(v: u32) -> u32 {
    (v + 15) & !15
}

/// Strides are 16-aligned; the per-buffer size follows the format's bytes
/// per pixel: NV12/YUV420 3/2, YUV422 2, 10-bit 420 2, 10-bit 422 4.
pub fn buffer_geometry(
    width: u32,
    height: u32,
    format: FrameFormat,
) -> Result<BufferGeometry, DecodeError> {
    let hor_stride = align16(width);
    let ver_stride = align16(height);
    let plane = hor_stride as usize * ver_stride as usize;
    let buffer_size = match format {
        FrameFormat::Nv12 | FrameFormat::Yuv420p => plane * 3 / 2,
        FrameFormat::Yuv422 | FrameFormat::Nv12TenBit => plane * 2,
        FrameFormat::Yuv422TenBit => plane * 4,
    };
    Ok(BufferGeometry {
        width,
        height,
        hor_stride,
        ver_stride,
        buffer_size,
        count: POOL_BUFFER_COUNT,
    })
}

/// One decoded frame handed to the presenter. The DMA handle stays owned
/// by the decoder pool; the presenter imports it by value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoFrame {
    pub dma_fd: i32,
    pub width: u32,
    pub height: u32,
    pub hor_stride: u32,
    pub ver_stride: u32,
}

/// What the decoder produced on one poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderEvent {
    Idle,
    InfoChange {
        width: u32,
        height: u32,
        format: FrameFormat,
    },
    Frame(VideoFrame),
    EndOfStream,
}

/// The vendor decoder SDK surface.
pub trait DecoderBackend: Send + Sync {
    fn start(&self, codec: Codec) -> Result<(), DecodeError>;
    fn put_packet(&self, data: &[u8]) -> Result<(), DecodeError>;
    /// Non-blocking pull of the next decoder event.
    fn poll_frame(&self) -> DecoderEvent;
    fn attach_buffers(&self, geometry: &BufferGeometry) -> Result<(), DecodeError>;
    fn ack_info_change(&self) -> Result<(), DecodeError>;
    fn release_buffers(&self);
    fn stop(&self);
}

/// Where presented frames go; implemented by the presenter.
pub trait FrameSink: Send {
    fn present(&mut self, frame: &VideoFrame);
}

/// Feed side: retries a full input queue for up to [`FEED_DEADLINE`], then
/// drops the packet and counts a stall. The pipeline is real-time, so a
/// dropped packet is preferable to backpressure into the network.
pub struct PacketFeeder {
    backend: Arc<dyn DecoderBackend>,
    stall_count: Arc<AtomicU64>,
}

impl PacketFeeder {
    pub fn new(backend: Arc<dyn DecoderBackend>) -> Self {
        Self {
            backend,
            stall_count: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn stall_count(&self) -> u64 {
        self.stall_count.load(Ordering::Relaxed)
    }

    pub fn feed(&self, data: &[u8]) -> Result<(), DecodeError> {
        let begin = Instant::now();
        loop {
            match self.backend.put_packet(data) {
                Ok(()) => return Ok(()),
                Err(DecodeError::QueueFull) => {
                    if begin.elapsed() > FEED_DEADLINE {
                        let stalls = self.stall_count.fetch_add(1, Ordering::Relaxed) + 1;
                        warn!(stalls, "cannot feed decoder, dropping packet");
                        return Err(DecodeError::Stalled);
                    }
                    std::thread::sleep(Duration::from_millis(1));
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// The pull loop. Runs on a blocking thread until `running` clears or the
/// stream ends. On an info change the old pool is released and a new one
/// attached before acknowledging; the first [`STARTUP_SKIP_FRAMES`] frames
/// after that are dropped so the pool can stabilize.
pub fn run_decoder_loop(
    backend: &dyn DecoderBackend,
    sink: &mut dyn FrameSink,
    running: &AtomicBool,
) {
    info!("decoder loop started");
    let mut skipped = 0u32;

    while running.load(Ordering::Acquire) {
        match backend.poll_frame() {
            DecoderEvent::InfoChange {
                width,
                height,
                format,
            } => {
                info!(width, height, ?format, "decoder info change");
                match buffer_geometry(width, height, format) {
                    Ok(geometry) => {
                        backend.release_buffers();
                        if let Err(e) = backend.attach_buffers(&geometry) {
                            warn!(error = %e, "failed to attach frame buffers");
                            continue;
                        }
                        if let Err(e) = backend.ack_info_change() {
                            warn!(error = %e, "failed to acknowledge info change");
                        }
                        skipped = 0;
                    }
                    Err(e) => warn!(error = %e, "unusable stream geometry"),
                }
            }
            DecoderEvent::Frame(frame) => {
                if skipped < STARTUP_SKIP_FRAMES {
                    skipped += 1;
                    debug!(skipped, "dropping startup frame");
                    std::thread::sleep(Duration::from_millis(50));
                    continue;
                }
                sink.present(&frame);
            }
            DecoderEvent::EndOfStream => {
                info!("decoder end of stream");
                break;
            }
            DecoderEvent::Idle => {
                std::thread::sleep(Duration::from_millis(1));
            }
        }
    }

    backend.release_buffers();
    info!("decoder loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_geometry_nv12() {
        let g = buffer_geometry(1920, 1080, FrameFormat::Nv12).unwrap();
        assert_eq!(g.hor_stride, 1920);
        assert_eq!(g.ver_stride, 1088);
        assert_eq!(g.buffer_size, 1920 * 1088 * 3 / 2);
        assert_eq!(g.count, POOL_BUFFER_COUNT);
    }

    #[test]
    fn test_geometry_alignment() {
        let g = buffer_geometry(1945, 1097, FrameFormat::Nv12).unwrap();
        assert_eq!(g.hor_stride, 1952);
        assert_eq!(g.ver_stride, 1104);
    }

    #[test]
    fn test_geometry_formats() {
        let plane = 1920usize * 1088;
        assert_eq!(
            buffer_geometry(1920, 1080, FrameFormat::Yuv422).unwrap().buffer_size,
            plane * 2
        );
        assert_eq!(
            buffer_geometry(1920, 1080, FrameFormat::Nv12TenBit)
                .unwrap()
                .buffer_size,
            plane * 2
        );
        assert_eq!(
            buffer_geometry(1920, 1080, FrameFormat::Yuv422TenBit)
                .unwrap()
                .buffer_size,
            plane * 4
        );
    }

    struct ScriptedBackend {
        events: Mutex<Vec<DecoderEvent>>,
        attached: Mutex<Vec<BufferGeometry>>,
        released: AtomicU64,
        acked: AtomicU64,
    }

    impl ScriptedBackend {
        fn new(mut events: Vec<DecoderEvent>) -> Self {
            events.reverse();
            Self {
                events: Mutex::new(events),
                attached: Mutex::new(Vec::new()),
                released: AtomicU64::new(0),
                acked: AtomicU64::new(0),
            }
        }
    }

    impl DecoderBackend for ScriptedBackend {
        fn start(&self, _codec: Codec) -> Result<(), DecodeError> {
            Ok(())
        }
        fn put_packet(&self, _data: &[u8]) -> Result<(), DecodeError> {
            Ok(())
        }
        fn poll_frame(&self) -> DecoderEvent {
            self.events
                .lock()
                .unwrap()
                .pop()
                .unwrap_or(DecoderEvent::EndOfStream)
        }
        fn attach_buffers(&self, geometry: &BufferGeometry) -> Result<(), DecodeError> {
            self.attached.lock().unwrap().push(*geometry);
            Ok(())
        }
        fn ack_info_change(&self) -> Result<(), DecodeError> {
            self.acked.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn release_buffers(&self) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
        fn stop(&self) {}
    }

    #[derive(Default)]
    struct CollectingSink {
        frames: Vec<VideoFrame>,
    }

    impl FrameSink for CollectingSink {
        fn present(&mut self, frame: &VideoFrame) {
            self.frames.push(*frame);
        }
    }

    fn frame(n: i32) -> DecoderEvent {
        DecoderEvent::Frame(VideoFrame {
            dma_fd: n,
            width: 1280,
            height: 720,
            hor_stride: 1280,
            ver_stride: 720,
        })
    }

    #[test]
    fn test_loop_skips_first_frames_then_presents() {
        let mut events = vec![DecoderEvent::InfoChange {
            width: 1280,
            height: 720,
            format: FrameFormat::Nv12,
        }];
        for n in 0..10 {
            events.push(frame(n));
        }
        events.push(DecoderEvent::EndOfStream);

        let backend = ScriptedBackend::new(events);
        let mut sink = CollectingSink::default();
        let running = AtomicBool::new(true);

        run_decoder_loop(&backend, &mut sink, &running);

        // Frames 0..6 skipped, 6..10 presented (the 7th emitted frame is
        // the first on screen).
        assert_eq!(sink.frames.len(), 4);
        assert_eq!(sink.frames[0].dma_fd, 6);

        // Info change: one pool attached with the right geometry, ack'd,
        // plus the final release on exit.
        let attached = backend.attached.lock().unwrap();
        assert_eq!(attached.len(), 1);
        assert_eq!(attached[0].count, POOL_BUFFER_COUNT);
        assert_eq!(attached[0].buffer_size, 1280 * 720 * 3 / 2);
        assert_eq!(backend.acked.load(Ordering::SeqCst), 1);
        assert_eq!(backend.released.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_info_change_resets_skip_counter() {
        let mut events = vec![DecoderEvent::InfoChange {
            width: 1280,
            height: 720,
            format: FrameFormat::Nv12,
        }];
        for n in 0..7 {
            events.push(frame(n));
        }
        events.push(DecoderEvent::InfoChange {
            width: 1920,
            height: 1080,
            format: FrameFormat::Nv12,
        });
        for n in 100..107 {
            events.push(frame(n));
        }

        let backend = ScriptedBackend::new(events);
        let mut sink = CollectingSink::default();
        let running = AtomicBool::new(true);

        run_decoder_loop(&backend, &mut sink, &running);

        // One frame survives each burst of seven.
        assert_eq!(sink.frames.len(), 2);
        assert_eq!(sink.frames[0].dma_fd, 6);
        assert_eq!(sink.frames[1].dma_fd, 106);
    }

    struct AlwaysFullBackend;

    impl DecoderBackend for AlwaysFullBackend {
        fn start(&self, _codec: Codec) -> Result<(), DecodeError> {
            Ok(())
        }
        fn put_packet(&self, _data: &[u8]) -> Result<(), DecodeError> {
            Err(DecodeError::QueueFull)
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

    #[test]
    fn test_feeder_counts_stalls() {
        let feeder = PacketFeeder::new(Arc::new(AlwaysFullBackend));
        let result = feeder.feed(&[0, 0, 0, 1, 0x65]);
        assert!(matches!(result, Err(DecodeError::Stalled)));
        assert_eq!(feeder.stall_count(), 1);
    }
}
