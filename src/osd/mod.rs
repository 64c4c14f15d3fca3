//! OSD composition: MSP DisplayPort grid, application overlay, glyph
//! raster and the push to the display's ARGB plane.
//!
//! Three grids coexist: the MSP-drawn grid, a render scratch grid the
//! fake-HD remapper writes into, and the application overlay (link and
//! telemetry strings). Composition is event-driven — DisplayPort
//! draw-complete, overlay writes and status updates all request a render —
//! and the overlay always draws on top. Glyph 0 never touches a pixel.

pub mod fakehd;
pub mod font;
pub mod grid;
pub mod msp;

use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use crate::video::present::{DisplayBackend, Rotation};
use font::{FontSet, BYTES_PER_PIXEL};
use grid::{split_glyph, CharGrid, GRID_COLS, GRID_ROWS};
use msp::{DisplayportHandler, HdOption};

pub const SPLASH_STRING: &[u8] = b"OSD WAITING...";

/// Cell and glyph geometry of one OSD layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OsdGeometry {
    pub font_width: u32,
    pub font_height: u32,
    pub x_offset: i32,
    pub y_offset: i32,
}

impl OsdGeometry {
    /// SD layout: large glyphs.
    pub const SD: OsdGeometry = OsdGeometry {
        font_width: 36,
        font_height: 54,
        x_offset: 0,
        y_offset: 0,
    };
    /// Full-HD layout.
    pub const FULL: OsdGeometry = OsdGeometry {
        font_width: 24,
        font_height: 36,
        x_offset: 0,
        y_offset: 0,
    };
    /// HD layout with a small horizontal inset.
    pub const HD: OsdGeometry = OsdGeometry {
        font_width: 24,
        font_height: 36,
        x_offset: 5,
        y_offset: 0,
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayMode {
    Disabled,
    Running,
}

/// Map one logical OSD pixel to its physical framebuffer position.
/// For 90/270 the logical canvas has the framebuffer's axes swapped.
pub fn remap_pixel(
    rotation: Rotation,
    px: i64,
    py: i64,
    fb_w: i64,
    fb_h: i64,
) -> (i64, i64) {
    match rotation {
        Rotation::Deg0 => (px, py),
        Rotation::Deg90 => (fb_w - 1 - py, px),
        Rotation::Deg180 => (fb_w - 1 - px, fb_h - 1 - py),
        Rotation::Deg270 => (py, fb_h - 1 - px),
    }
}

/// Rasterize one grid into a BGRA framebuffer. Cells with glyph 0 are
/// skipped entirely so prior framebuffer content under them survives.
pub fn draw_character_map(
    grid: &CharGrid,
    geometry: OsdGeometry,
    fonts: &FontSet,
    rotation: Rotation,
    fb: &mut [u8],
    fb_w: u32,
    fb_h: u32,
) {
    if !fonts.has_any() {
        debug!("no font pages loaded, skipping raster");
        return;
    }
    let fw = geometry.font_width as i64;
    let fh = geometry.font_height as i64;
    let (fb_w, fb_h) = (fb_w as i64, fb_h as i64);

    for (cx, cy, packed) in grid.occupied() {
        let (page, code) = split_glyph(packed);
        let Some(font) = fonts.page(page) else {
            continue;
        };
        let glyph = font.glyph(code);

        let dst_x = cx as i64 * fw + geometry.x_offset as i64;
        let dst_y = cy as i64 * fh + geometry.y_offset as i64;

        for gy in 0..fh {
            for gx in 0..fw {
                let (rx, ry) = remap_pixel(rotation, dst_x + gx, dst_y + gy, fb_w, fb_h);
                if rx < 0 || ry < 0 || rx >= fb_w || ry >= fb_h {
                    continue;
                }
                let fb_offset = ((ry * fb_w + rx) * BYTES_PER_PIXEL as i64) as usize;
                let font_offset = ((gy * fw + gx) * BYTES_PER_PIXEL as i64) as usize;

                // Font atlas is RGBA, the plane is BGRA.
                fb[fb_offset] = glyph[font_offset + 2];
                fb[fb_offset + 1] = glyph[font_offset + 1];
                fb[fb_offset + 2] = glyph[font_offset];
                fb[fb_offset + 3] = glyph[font_offset + 3];
            }
        }
    }
}

struct ComposerState {
    msp_grid: CharGrid,
    render_grid: CharGrid,
    overlay_grid: CharGrid,
    fonts: FontSet,
    geometry: OsdGeometry,
    fakehd_enabled: bool,
    mode: DisplayMode,
    rotation: Rotation,
    framebuffer: Vec<u8>,
    fb_width: u32,
    fb_height: u32,
}

/// The composer. All grid access is serialized by its internal mutex; the
/// MSP parser thread and the overlay writers can interleave freely.
pub struct OsdComposer {
    state: Mutex<ComposerState>,
    display: Arc<dyn DisplayBackend>,
}

impl OsdComposer {
    pub fn new(display: Arc<dyn DisplayBackend>, rotation: Rotation) -> Self {
        let (w, h) = display.display_size();
        info!(width = w, height = h, ?rotation, "OSD composer created");
        Self {
            state: Mutex::new(ComposerState {
                msp_grid: CharGrid::new(),
                render_grid: CharGrid::new(),
                overlay_grid: CharGrid::new(),
                fonts: FontSet::default(),
                geometry: OsdGeometry::HD,
                fakehd_enabled: false,
                mode: DisplayMode::Running,
                rotation,
                framebuffer: vec![0u8; (w * h) as usize * BYTES_PER_PIXEL],
                fb_width: w,
                fb_height: h,
            }),
            display,
        }
    }

    pub fn set_fonts(&self, fonts: FontSet) {
        self.state.lock().unwrap().fonts = fonts;
    }

    pub fn set_fakehd(&self, enabled: bool) {
        self.state.lock().unwrap().fakehd_enabled = enabled;
    }

    pub fn set_mode(&self, mode: DisplayMode) {
        self.state.lock().unwrap().mode = mode;
    }

    /// Write a string into the overlay grid and re-render. The overlay
    /// composes over the MSP layer.
    pub fn print_overlay(&self, x: usize, y: usize, page: u8, text: &[u8]) {
        {
            let mut state = self.state.lock().unwrap();
            state.overlay_grid.print_string(x, y, page, text);
        }
        self.render();
    }

    pub fn clear_overlay(&self) {
        self.state.lock().unwrap().overlay_grid.clear();
    }

    /// Show the startup splash in the overlay's bottom-right corner.
    pub fn splash(&self) {
        let x = GRID_COLS.saturating_sub(SPLASH_STRING.len() + 1);
        self.print_overlay(x, GRID_ROWS - 1, 0, SPLASH_STRING);
    }

    /// Compose all layers and push the result to the OSD plane.
    pub fn render(&self) {
        let mut state = self.state.lock().unwrap();
        let state = &mut *state;

        state.framebuffer.fill(0);

        if state.mode == DisplayMode::Running {
            if state.fakehd_enabled {
                fakehd::map_sd_to_hd(&state.msp_grid, &mut state.render_grid);
                draw_character_map(
                    &state.render_grid,
                    state.geometry,
                    &state.fonts,
                    state.rotation,
                    &mut state.framebuffer,
                    state.fb_width,
                    state.fb_height,
                );
            } else {
                draw_character_map(
                    &state.msp_grid,
                    state.geometry,
                    &state.fonts,
                    state.rotation,
                    &mut state.framebuffer,
                    state.fb_width,
                    state.fb_height,
                );
            }
            draw_character_map(
                &state.overlay_grid,
                state.geometry,
                &state.fonts,
                state.rotation,
                &mut state.framebuffer,
                state.fb_width,
                state.fb_height,
            );
        }

        if let Err(e) =
            self.display
                .commit_osd(&state.framebuffer, state.fb_width, state.fb_height)
        {
            warn!(error = %e, "OSD plane commit failed");
        }
    }

    /// Snapshot of the composed plane, for inspection.
    #[cfg(test)]
    fn composed(&self) -> (Vec<u8>, u32, u32) {
        let state = self.state.lock().unwrap();
        (state.framebuffer.clone(), state.fb_width, state.fb_height)
    }
}

/// Adapter feeding the MSP DisplayPort stream into the composer.
pub struct MspOsdBridge {
    composer: Arc<OsdComposer>,
}

impl MspOsdBridge {
    pub fn new(composer: Arc<OsdComposer>) -> Self {
        Self { composer }
    }
}

impl DisplayportHandler for MspOsdBridge {
    fn draw_character(&mut self, x: u32, y: u32, glyph: u16) {
        let mut state = self.composer.state.lock().unwrap();
        state.msp_grid.set(x as usize, y as usize, glyph);
    }

    fn clear_screen(&mut self) {
        let mut state = self.composer.state.lock().unwrap();
        state.msp_grid.clear();
        state.render_grid.clear();
    }

    fn draw_complete(&mut self) {
        self.composer.render();
    }

    fn set_options(&mut self, _font: u8, mode: HdOption) {
        {
            let mut state = self.composer.state.lock().unwrap();
            state.msp_grid.clear();
            state.render_grid.clear();
            let (geometry, fakehd) = match mode {
                HdOption::Hd6022 => (OsdGeometry::FULL, false),
                HdOption::Hd5018 | HdOption::Hd3016 => (OsdGeometry::HD, false),
                HdOption::Sd => (OsdGeometry::SD, state.fakehd_enabled),
            };
            state.geometry = geometry;
            state.fakehd_enabled = fakehd;
        }
        debug!(?mode, "DisplayPort options applied");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::decoder::VideoFrame;
    use crate::video::present::{FbId, PresentError, Rect};
    use super::font::FontPage;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FakeDisplay {
        size: (u32, u32),
        commits: AtomicU32,
    }

    impl FakeDisplay {
        fn new(w: u32, h: u32) -> Self {
            Self {
                size: (w, h),
                commits: AtomicU32::new(0),
            }
        }
    }

    impl DisplayBackend for FakeDisplay {
        fn display_size(&self) -> (u32, u32) {
            self.size
        }
        fn import_video_frame(&self, _frame: &VideoFrame) -> Result<FbId, PresentError> {
            Ok(FbId(1))
        }
        fn commit_video(
            &self,
            _fb: FbId,
            _sw: u32,
            _sh: u32,
            _dst: Rect,
        ) -> Result<(), PresentError> {
            Ok(())
        }
        fn release_fb(&self, _fb: FbId) {}
        fn commit_osd(&self, _argb: &[u8], _w: u32, _h: u32) -> Result<(), PresentError> {
            self.commits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn solid_fonts() -> FontSet {
        let mut fonts = FontSet::default();
        fonts.set_page(0, FontPage::solid(24, 36, [255, 255, 255, 255]));
        fonts.set_page(1, FontPage::solid(24, 36, [0, 255, 0, 255]));
        fonts
    }

    fn composer() -> (Arc<OsdComposer>, Arc<FakeDisplay>) {
        let display = Arc::new(FakeDisplay::new(1280, 720));
        let composer = Arc::new(OsdComposer::new(
            Arc::clone(&display) as Arc<dyn DisplayBackend>,
            Rotation::Deg0,
        ));
        composer.set_fonts(solid_fonts());
        (composer, display)
    }

    fn alpha_at(fb: &[u8], fb_w: u32, x: u32, y: u32) -> u8 {
        fb[((y * fb_w + x) as usize) * BYTES_PER_PIXEL + 3]
    }

    /// Pixel footprint of a grid cell under the HD geometry.
    fn cell_rect(cx: u32, cy: u32) -> (u32, u32, u32, u32) {
        let g = OsdGeometry::HD;
        (
            cx * g.font_width + g.x_offset as u32,
            cy * g.font_height,
            g.font_width,
            g.font_height,
        )
    }

    #[test]
    fn test_msp_and_overlay_footprints_have_alpha() {
        let (composer, display) = composer();
        let mut bridge = MspOsdBridge::new(Arc::clone(&composer));

        // MSP writes "ARM" at (0,0) on page 0.
        bridge.draw_character(0, 0, u16::from(b'A'));
        bridge.draw_character(1, 0, u16::from(b'R'));
        bridge.draw_character(2, 0, u16::from(b'M'));
        // Overlay writes "100%" bottom-right on page 1.
        composer.print_overlay(GRID_COLS - 5, GRID_ROWS - 1, 1, b"100%");
        bridge.draw_complete();

        assert!(display.commits.load(Ordering::SeqCst) >= 1);

        let (fb, fb_w, _) = composer.composed();
        // Inside the 'A' cell.
        let (x0, y0, w, h) = cell_rect(0, 0);
        assert_eq!(alpha_at(&fb, fb_w, x0 + w / 2, y0 + h / 2), 255);
        // Inside the overlay '1' cell.
        let (ox, oy, ow, oh) = cell_rect((GRID_COLS - 5) as u32, (GRID_ROWS - 1) as u32);
        assert_eq!(alpha_at(&fb, fb_w, ox + ow / 2, oy + oh / 2), 255);
        // Outside both footprints: a cell in the middle of the screen.
        let (mx, my, mw, mh) = cell_rect(20, 10);
        assert_eq!(alpha_at(&fb, fb_w, mx + mw / 2, my + mh / 2), 0);
    }

    #[test]
    fn test_transparent_cells_leave_pixels_untouched() {
        let fonts = solid_fonts();
        let mut grid = CharGrid::new();
        grid.set(1, 1, u16::from(b'X'));

        let (fb_w, fb_h) = (1280u32, 720u32);
        let mut fb = vec![0x5Au8; (fb_w * fb_h) as usize * BYTES_PER_PIXEL];
        draw_character_map(
            &grid,
            OsdGeometry::HD,
            &fonts,
            Rotation::Deg0,
            &mut fb,
            fb_w,
            fb_h,
        );

        // Pixel inside the glyph was painted.
        let (x0, y0, w, h) = {
            let g = OsdGeometry::HD;
            (
                1 * g.font_width + g.x_offset as u32,
                1 * g.font_height,
                g.font_width,
                g.font_height,
            )
        };
        let inside = ((y0 + h / 2) * fb_w + x0 + w / 2) as usize * BYTES_PER_PIXEL;
        assert_eq!(fb[inside + 3], 255);

        // A pixel under a glyph-0 cell keeps the sentinel.
        let outside = ((y0 + h / 2) * fb_w + x0 + 5 * w) as usize * BYTES_PER_PIXEL;
        assert_eq!(fb[outside], 0x5A);
        assert_eq!(fb[outside + 3], 0x5A);
    }

    #[test]
    fn test_disabled_mode_commits_cleared_plane() {
        let (composer, _display) = composer();
        composer.print_overlay(0, 0, 0, b"X");
        composer.set_mode(DisplayMode::Disabled);
        composer.render();
        let (fb, _, _) = composer.composed();
        assert!(fb.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_remap_corners() {
        // Logical canvas 100x50 on a 100x50 screen.
        assert_eq!(remap_pixel(Rotation::Deg0, 0, 0, 100, 50), (0, 0));
        assert_eq!(remap_pixel(Rotation::Deg180, 0, 0, 100, 50), (99, 49));
        // 90°: logical canvas is 50x100 on the 100x50 panel.
        assert_eq!(remap_pixel(Rotation::Deg90, 0, 0, 100, 50), (99, 0));
        assert_eq!(remap_pixel(Rotation::Deg90, 0, 99, 100, 50), (0, 0));
        // 270°: mirror of 90.
        assert_eq!(remap_pixel(Rotation::Deg270, 0, 0, 100, 50), (0, 49));
        assert_eq!(remap_pixel(Rotation::Deg270, 49, 0, 100, 50), (0, 0));
    }

    #[test]
    fn test_rotated_raster_stays_in_bounds() {
        let fonts = solid_fonts();
        let mut grid = CharGrid::new();
        // Worst-case corners.
        grid.set(0, 0, u16::from(b'A'));
        grid.set(GRID_COLS - 1, GRID_ROWS - 1, u16::from(b'Z'));

        for rotation in [
            Rotation::Deg0,
            Rotation::Deg90,
            Rotation::Deg180,
            Rotation::Deg270,
        ] {
            let (fb_w, fb_h) = (1280u32, 720u32);
            let mut fb = vec![0u8; (fb_w * fb_h) as usize * BYTES_PER_PIXEL];
            // Must not panic on out-of-bounds pixels.
            draw_character_map(
                &grid,
                OsdGeometry::HD,
                &fonts,
                rotation,
                &mut fb,
                fb_w,
                fb_h,
            );
        }
    }

    #[test]
    fn test_set_options_switches_geometry_and_clears() {
        let (composer, _display) = composer();
        let mut bridge = MspOsdBridge::new(Arc::clone(&composer));

        bridge.draw_character(3, 3, 0x41);
        bridge.set_options(0, HdOption::Hd6022);

        let state = composer.state.lock().unwrap();
        assert!(state.msp_grid.is_empty());
        assert_eq!(state.geometry, OsdGeometry::FULL);
    }
}
