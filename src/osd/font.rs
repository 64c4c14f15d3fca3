//! Bitmap font pages for the OSD raster.
//!
//! A page is a vertical strip of equally sized RGBA glyphs indexed by the
//! 8-bit character code. Asset loading (PNG decode, variant lookup) is a
//! collaborator concern; pages are built from raw RGBA here.

use thiserror::Error;

pub const BYTES_PER_PIXEL: usize = 4;
/// Glyph codes per page.
pub const GLYPHS_PER_PAGE: usize = 256;
/// Font pages addressable from a glyph code.
pub const MAX_FONT_PAGES: usize = 4;

#[derive(Error, Debug)]
pub enum FontError {
    #[error("atlas size {got} does not match {expected} bytes for {glyphs} glyphs of {width}x{height}")]
    BadAtlasSize {
        got: usize,
        expected: usize,
        glyphs: usize,
        width: u32,
        height: u32,
    },
}

/// One page: a contiguous RGBA atlas of `GLYPHS_PER_PAGE` glyphs stacked
/// vertically.
pub struct FontPage {
    pub glyph_width: u32,
    pub glyph_height: u32,
    rgba: Vec<u8>,
}

impl FontPage {
    pub fn from_rgba(glyph_width: u32, glyph_height: u32, rgba: Vec<u8>) -> Result<Self, FontError> {
        let expected =
            glyph_width as usize * glyph_height as usize * BYTES_PER_PIXEL * GLYPHS_PER_PAGE;
        if rgba.len() != expected {
            return Err(FontError::BadAtlasSize {
                got: rgba.len(),
                expected,
                glyphs: GLYPHS_PER_PAGE,
                width: glyph_width,
                height: glyph_height,
            });
        }
        Ok(Self {
            glyph_width,
            glyph_height,
            rgba,
        })
    }

    /// A page where every glyph is a solid RGBA color. Used for tests and
    /// the built-in splash rendering when no font asset is present.
    pub fn solid(glyph_width: u32, glyph_height: u32, rgba: [u8; 4]) -> Self {
        let pixels = glyph_width as usize * glyph_height as usize * GLYPHS_PER_PAGE;
        let mut data = Vec::with_capacity(pixels * BYTES_PER_PIXEL);
        for _ in 0..pixels {
            data.extend_from_slice(&rgba);
        }
        Self {
            glyph_width,
            glyph_height,
            rgba: data,
        }
    }

    /// RGBA pixels of one glyph, row-major.
    pub fn glyph(&self, code: u8) -> &[u8] {
        let glyph_bytes =
            self.glyph_width as usize * self.glyph_height as usize * BYTES_PER_PIXEL;
        let start = glyph_bytes * code as usize;
        &self.rgba[start..start + glyph_bytes]
    }
}

/// Up to four pages; lookups fall back to page 0 when a page is absent.
#[derive(Default)]
pub struct FontSet {
    pages: [Option<FontPage>; MAX_FONT_PAGES],
}

impl FontSet {
    pub fn set_page(&mut self, index: usize, page: FontPage) {
        if index < MAX_FONT_PAGES {
            self.pages[index] = Some(page);
        }
    }

    pub fn page(&self, index: u8) -> Option<&FontPage> {
        let direct = self.pages.get(index as usize).and_then(Option::as_ref);
        direct.or(self.pages[0].as_ref())
    }

    pub fn has_any(&self) -> bool {
        self.pages.iter().any(Option::is_some)
    }
}
