//! Presentation of decoded frames on the layered display.
//!
//! The display controller and the 2D blitter are collaborator traits. The
//! presenter computes the aspect-preserving fit rectangle, routes 90°/270°
//! frames through a persistent rotation buffer, and keeps the previous
//! framebuffer handle alive until the commit of its successor returns.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

use super::decoder::{FrameSink, VideoFrame};

#[derive(Error, Debug)]
pub enum PresentError {
    #[error("display backend: {0}")]
    Display(String),

    #[error("blitter: {0}")]
    Blitter(String),

    #[error("invalid rotation {0} degrees")]
    BadRotation(u32),
}

/// Screen rotation, read from the platform at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Rotation {
    #[default]
    Deg0,
    Deg90,
    Deg180,
    Deg270,
}

impl Rotation {
    pub fn from_degrees(deg: u32) -> Result<Self, PresentError> {
        match deg {
            0 => Ok(Rotation::Deg0),
            90 => Ok(Rotation::Deg90),
            180 => Ok(Rotation::Deg180),
            270 => Ok(Rotation::Deg270),
            other => Err(PresentError::BadRotation(other)),
        }
    }

    pub fn swaps_axes(self) -> bool {
        matches!(self, Rotation::Deg90 | Rotation::Deg270)
    }
}

/// An axis-aligned output rectangle on the display.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

/// The largest centered rectangle inside `(dst_w, dst_h)` with the aspect
/// ratio of `(src_w, src_h)`: letterbox when the display is taller,
/// pillarbox when it is wider.
pub fn fit_rect(src_w: u32, src_h: u32, dst_w: u32, dst_h: u32) -> Rect {
    if src_w == 0 || src_h == 0 || dst_w == 0 || dst_h == 0 {
        return Rect {
            x: 0,
            y: 0,
            width: dst_w,
            height: dst_h,
        };
    }

    let src_aspect = src_w as f64 / src_h as f64;
    let (mut out_w, mut out_h) = (dst_w, dst_h);

    if dst_w as f64 / src_aspect > dst_h as f64 {
        // Pillarbox: height-bound.
        out_w = (dst_h as f64 * src_aspect).round() as u32;
    } else {
        // Letterbox: width-bound.
        out_h = (dst_w as f64 / src_aspect).round() as u32;
    }

    Rect {
        x: ((dst_w as i32) - (out_w as i32)) / 2,
        y: ((dst_h as i32) - (out_h as i32)) / 2,
        width: out_w,
        height: out_h,
    }
}

/// Opaque display framebuffer handle produced by importing a DMA frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FbId(pub u32);

/// DMA buffer owned by the presenter's rotation stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaBuf {
    pub fd: i32,
    pub size: usize,
}

/// The KMS/atomic display controller surface.
pub trait DisplayBackend: Send + Sync {
    /// Physical display size in pixels.
    fn display_size(&self) -> (u32, u32);
    /// Wrap a DMA frame into a display framebuffer object.
    fn import_video_frame(&self, frame: &VideoFrame) -> Result<FbId, PresentError>;
    /// Atomically commit `fb` to the video plane inside `dst`.
    fn commit_video(&self, fb: FbId, src_w: u32, src_h: u32, dst: Rect)
        -> Result<(), PresentError>;
    /// Drop a framebuffer object. Never called for the currently committed
    /// one.
    fn release_fb(&self, fb: FbId);
    /// Push an ARGB buffer to the OSD plane.
    fn commit_osd(&self, argb: &[u8], width: u32, height: u32) -> Result<(), PresentError>;
}

/// The 2D engine: buffer allocation, NV12 rotation, ARGB blending.
pub trait Blitter: Send + Sync {
    fn alloc_buffer(&self, size: usize) -> Result<DmaBuf, PresentError>;
    fn free_buffer(&self, buf: DmaBuf);
    fn rotate_nv12(
        &self,
        src_fd: i32,
        dst: DmaBuf,
        src_w: u32,
        src_h: u32,
        rotation: Rotation,
    ) -> Result<(), PresentError>;
}

/// Two-slot framebuffer ring plus the persistent rotation buffer.
pub struct Presenter {
    display: Arc<dyn DisplayBackend>,
    blitter: Arc<dyn Blitter>,
    rotation: Rotation,
    /// Committed in the last successful flip.
    current_fb: Option<FbId>,
    rotate_buf: Option<DmaBuf>,
    rotate_dims: (u32, u32),
    dropped: u64,
}

impl Presenter {
    pub fn new(
        display: Arc<dyn DisplayBackend>,
        blitter: Arc<dyn Blitter>,
        rotation: Rotation,
    ) -> Self {
        Self {
            display,
            blitter,
            rotation,
            current_fb: None,
            rotate_buf: None,
            rotate_dims: (0, 0),
            dropped: 0,
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    fn present_inner(&mut self, frame: &VideoFrame) -> Result<(), PresentError> {
        let (disp_w, disp_h) = self.display.display_size();

        // Output geometry: rotated frames land with swapped axes.
        let (out_w, out_h) = if self.rotation.swaps_axes() {
            (frame.height, frame.width)
        } else {
            (frame.width, frame.height)
        };
        let dst = fit_rect(out_w, out_h, disp_w, disp_h);

        let fb = match self.rotation {
            Rotation::Deg0 | Rotation::Deg180 => self.display.import_video_frame(frame)?,
            Rotation::Deg90 | Rotation::Deg270 => {
                let rotated = self.rotate(frame)?;
                self.display.import_video_frame(&rotated)?
            }
        };

        // Commit first; only a successful flip may release the previous
        // framebuffer. On failure the new fb is dropped and the display
        // keeps scanning out the old one.
        match self.display.commit_video(fb, out_w, out_h, dst) {
            Ok(()) => {
                if let Some(prev) = self.current_fb.replace(fb) {
                    self.display.release_fb(prev);
                }
                Ok(())
            }
            Err(e) => {
                self.display.release_fb(fb);
                Err(e)
            }
        }
    }

    /// Rotate into the persistent buffer, reallocating only when the frame
    /// geometry changed.
    fn rotate(&mut self, frame: &VideoFrame) -> Result<VideoFrame, PresentError> {
        let dims = (frame.width, frame.height);
        let size = frame.hor_stride as usize * frame.ver_stride as usize * 3 / 2;

        if self.rotate_buf.is_none() || self.rotate_dims != dims {
            if let Some(old) = self.rotate_buf.take() {
                self.blitter.free_buffer(old);
            }
            let buf = self.blitter.alloc_buffer(size)?;
            debug!(size, ?dims, "rotation buffer reallocated");
            self.rotate_buf = Some(buf);
            self.rotate_dims = dims;
        }
        let buf = self.rotate_buf.expect("just ensured");

        self.blitter
            .rotate_nv12(frame.dma_fd, buf, frame.width, frame.height, self.rotation)?;

        Ok(VideoFrame {
            dma_fd: buf.fd,
            width: frame.height,
            height: frame.width,
            hor_stride: frame.ver_stride,
            ver_stride: frame.hor_stride,
        })
    }

    /// Release held resources at pipeline shutdown.
    pub fn release(&mut self) {
        if let Some(fb) = self.current_fb.take() {
            self.display.release_fb(fb);
        }
        if let Some(buf) = self.rotate_buf.take() {
            self.blitter.free_buffer(buf);
        }
        info!(dropped = self.dropped, "presenter released");
    }
}

impl FrameSink for Presenter {
    fn present(&mut self, frame: &VideoFrame) {
        // Real-time pipeline: a failed present logs and drops the frame.
        if let Err(e) = self.present_inner(frame) {
            self.dropped += 1;
            warn!(error = %e, dropped = self.dropped, "present failed, frame dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
    use std::sync::Mutex;

    #[test]
    fn test_fit_rect_pillarbox() {
        // 4:3 source on a 16:9 display: full height, centered horizontally.
        let r = fit_rect(1440, 1080, 1920, 1080);
        assert_eq!(r.height, 1080);
        assert_eq!(r.width, 1440);
        assert_eq!(r.x, 240);
        assert_eq!(r.y, 0);
    }

    #[test]
    fn test_fit_rect_letterbox() {
        // 21:9-ish source on 16:9: full width, bars top and bottom.
        let r = fit_rect(2560, 1080, 1920, 1080);
        assert_eq!(r.width, 1920);
        assert_eq!(r.height, 810);
        assert_eq!(r.x, 0);
        assert_eq!(r.y, 135);
    }

    #[test]
    fn test_fit_rect_exact_match() {
        let r = fit_rect(1920, 1080, 1920, 1080);
        assert_eq!(
            r,
            Rect {
                x: 0,
                y: 0,
                width: 1920,
                height: 1080
            }
        );
    }

    #[test]
    fn test_fit_rect_aspect_within_one_pixel() {
        // Odd sizes: the short-axis rounding error stays within a pixel.
        for (sw, sh) in [(1280u32, 720u32), (720, 576), (640, 481), (1945, 1097)] {
            let r = fit_rect(sw, sh, 1920, 1080);
            let src_aspect = sw as f64 / sh as f64;
            let got_aspect = r.width as f64 / r.height as f64;
            let err_px = (got_aspect - src_aspect).abs() * r.height as f64 / src_aspect;
            assert!(err_px <= 1.0, "{sw}x{sh}: aspect off by {err_px} px");
            // Centered.
            assert_eq!(r.x, ((1920 - r.width as i32) / 2) as i32);
            assert_eq!(r.y, ((1080 - r.height as i32) / 2) as i32);
        }
    }

    #[derive(Default)]
    struct FakeDisplay {
        next_fb: AtomicU32,
        commits: Mutex<Vec<(FbId, Rect)>>,
        released: Mutex<Vec<FbId>>,
        fail_commit: AtomicBool,
        /// Set while a release-before-commit would be observable.
        committed_fb: Mutex<Option<FbId>>,
        violations: AtomicU32,
    }

    impl DisplayBackend for FakeDisplay {
        fn display_size(&self) -> (u32, u32) {
            (1920, 1080)
        }
        fn import_video_frame(&self, _frame: &VideoFrame) -> Result<FbId, PresentError> {
            Ok(FbId(self.next_fb.fetch_add(1, Ordering::SeqCst) + 1))
        }
        fn commit_video(
            &self,
            fb: FbId,
            _src_w: u32,
            _src_h: u32,
            dst: Rect,
        ) -> Result<(), PresentError> {
            if self.fail_commit.load(Ordering::SeqCst) {
                return Err(PresentError::Display("simulated".into()));
            }
            *self.committed_fb.lock().unwrap() = Some(fb);
            self.commits.lock().unwrap().push((fb, dst));
            Ok(())
        }
        fn release_fb(&self, fb: FbId) {
            // Releasing the currently scanned-out fb is the lifetime bug
            // this test guards against.
            if *self.committed_fb.lock().unwrap() == Some(fb) {
                self.violations.fetch_add(1, Ordering::SeqCst);
            }
            self.released.lock().unwrap().push(fb);
        }
        fn commit_osd(&self, _argb: &[u8], _w: u32, _h: u32) -> Result<(), PresentError> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeBlitter {
        allocs: AtomicI32,
        frees: AtomicI32,
        rotations: AtomicI32,
    }

    impl Blitter for FakeBlitter {
        fn alloc_buffer(&self, size: usize) -> Result<DmaBuf, PresentError> {
            let n = self.allocs.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(DmaBuf { fd: 1000 + n, size })
        }
        fn free_buffer(&self, _buf: DmaBuf) {
            self.frees.fetch_add(1, Ordering::SeqCst);
        }
        fn rotate_nv12(
            &self,
            _src_fd: i32,
            _dst: DmaBuf,
            _src_w: u32,
            _src_h: u32,
            _rotation: Rotation,
        ) -> Result<(), PresentError> {
            self.rotations.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn frame(fd: i32, w: u32, h: u32) -> VideoFrame {
        VideoFrame {
            dma_fd: fd,
            width: w,
            height: h,
            hor_stride: (w + 15) & !15,
            ver_stride: (h + 15) & !15,
        }
    }

    #[test]
    fn test_previous_fb_released_only_after_commit() {
        let display = Arc::new(FakeDisplay::default());
        let blitter = Arc::new(FakeBlitter::default());
        let mut presenter = Presenter::new(
            Arc::clone(&display) as Arc<dyn DisplayBackend>,
            blitter,
            Rotation::Deg0,
        );

        presenter.present(&frame(3, 1280, 720));
        presenter.present(&frame(4, 1280, 720));
        presenter.present(&frame(5, 1280, 720));

        assert_eq!(display.commits.lock().unwrap().len(), 3);
        // Two releases: fb1 after fb2's commit, fb2 after fb3's.
        assert_eq!(
            display.released.lock().unwrap().as_slice(),
            &[FbId(1), FbId(2)]
        );
        assert_eq!(display.violations.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_failed_commit_keeps_previous_fb() {
        let display = Arc::new(FakeDisplay::default());
        let blitter = Arc::new(FakeBlitter::default());
        let mut presenter = Presenter::new(
            Arc::clone(&display) as Arc<dyn DisplayBackend>,
            blitter,
            Rotation::Deg0,
        );

        presenter.present(&frame(3, 1280, 720));
        display.fail_commit.store(true, Ordering::SeqCst);
        presenter.present(&frame(4, 1280, 720));

        // The failed frame's fb (2) was dropped; fb 1 stays current.
        assert_eq!(presenter.dropped(), 1);
        assert_eq!(presenter.current_fb, Some(FbId(1)));
        assert_eq!(display.released.lock().unwrap().as_slice(), &[FbId(2)]);

        display.fail_commit.store(false, Ordering::SeqCst);
        presenter.present(&frame(5, 1280, 720));
        assert_eq!(presenter.current_fb, Some(FbId(3)));
    }

    #[test]
    fn test_rotation_buffer_persists_until_size_change() {
        let display = Arc::new(FakeDisplay::default());
        let blitter = Arc::new(FakeBlitter::default());
        let mut presenter = Presenter::new(
            display,
            Arc::clone(&blitter) as Arc<dyn Blitter>,
            Rotation::Deg90,
        );

        presenter.present(&frame(3, 1280, 720));
        presenter.present(&frame(4, 1280, 720));
        assert_eq!(blitter.allocs.load(Ordering::SeqCst), 1);
        assert_eq!(blitter.rotations.load(Ordering::SeqCst), 2);

        // New stream geometry forces a single reallocation.
        presenter.present(&frame(5, 1920, 1080));
        assert_eq!(blitter.allocs.load(Ordering::SeqCst), 2);
        assert_eq!(blitter.frees.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_rotated_fit_swaps_axes() {
        let display = Arc::new(FakeDisplay::default());
        let blitter = Arc::new(FakeBlitter::default());
        let mut presenter = Presenter::new(
            Arc::clone(&display) as Arc<dyn DisplayBackend>,
            blitter,
            Rotation::Deg270,
        );

        // A 1280x720 source rotated 270° presents as 720x1280 content.
        presenter.present(&frame(3, 1280, 720));
        let commits = display.commits.lock().unwrap();
        let (_, dst) = commits[0];
        // On a 1920x1080 display, portrait content pillarboxes to
        // height-bound width 1080*720/1280 ≈ 608.
        assert_eq!(dst.height, 1080);
        assert_eq!(dst.width, 608);
    }
}
