//! "Fake-HD" remapping.
//!
//! Flight controllers that only speak the SD DisplayPort layout draw into
//! a 30×16 region; this spreads those cells across the full HD grid so the
//! OSD uses the whole screen. Pure function from grid to grid, corners
//! anchored, first writer wins on collisions.

use super::grid::{CharGrid, GRID_COLS, GRID_ROWS};

/// SD source region dimensions.
pub const SD_COLS: usize = 30;
pub const SD_ROWS: usize = 16;

/// Map one SD cell coordinate to its HD position.
pub fn map_cell(x: usize, y: usize) -> (usize, usize) {
    // Proportional spread with the corners pinned: 0 → 0 and
    // SD_COLS-1 → GRID_COLS-1 (same for rows).
    let hd_x = x * (GRID_COLS - 1) / (SD_COLS - 1);
    let hd_y = y * (GRID_ROWS - 1) / (SD_ROWS - 1);
    (hd_x, hd_y)
}

/// Spread the SD region of `sd` into `render`. Cells outside the SD region
/// are passed through unchanged so HD-aware producers coexist.
pub fn map_sd_to_hd(sd: &CharGrid, render: &mut CharGrid) {
    render.clear();

    for (x, y, glyph) in sd.occupied() {
        if x < SD_COLS && y < SD_ROWS {
            let (hd_x, hd_y) = map_cell(x, y);
            if render.get(hd_x, hd_y) == 0 {
                render.set(hd_x, hd_y, glyph);
            }
        } else {
            render.set(x, y, glyph);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_corners_anchored() {
        assert_eq!(map_cell(0, 0), (0, 0));
        assert_eq!(map_cell(SD_COLS - 1, SD_ROWS - 1), (GRID_COLS - 1, GRID_ROWS - 1));
        assert_eq!(map_cell(SD_COLS - 1, 0), (GRID_COLS - 1, 0));
        assert_eq!(map_cell(0, SD_ROWS - 1), (0, GRID_ROWS - 1));
    }

    #[test]
    fn test_mapping_monotonic() {
        let mut last = 0;
        for x in 0..SD_COLS {
            let (hd_x, _) = map_cell(x, 0);
            assert!(hd_x >= last, "column mapping must not move backwards");
            last = hd_x;
        }
    }

    #[test]
    fn test_map_preserves_glyphs() {
        let mut sd = CharGrid::new();
        sd.set(0, 0, 0x41);
        sd.set(15, 8, 0x42);
        sd.set(SD_COLS - 1, SD_ROWS - 1, 0x43);

        let mut render = CharGrid::new();
        map_sd_to_hd(&sd, &mut render);

        assert_eq!(render.get(0, 0), 0x41);
        let (mx, my) = map_cell(15, 8);
        assert_eq!(render.get(mx, my), 0x42);
        assert_eq!(render.get(GRID_COLS - 1, GRID_ROWS - 1), 0x43);
        assert_eq!(render.occupied().count(), 3);
    }

    #[test]
    fn test_map_clears_previous_render_content() {
        let mut sd = CharGrid::new();
        sd.set(1, 1, 0x55);

        let mut render = CharGrid::new();
        render.set(10, 10, 0x99); // stale content from the previous pass
        map_sd_to_hd(&sd, &mut render);

        assert_eq!(render.get(10, 10), 0);
        assert_eq!(render.occupied().count(), 1);
    }

    #[test]
    fn test_cells_outside_sd_region_pass_through() {
        let mut sd = CharGrid::new();
        sd.set(45, 19, 0x77); // HD-placed by an HD-aware producer

        let mut render = CharGrid::new();
        map_sd_to_hd(&sd, &mut render);
        assert_eq!(render.get(45, 19), 0x77);
    }

    #[test]
    fn test_mapping_deterministic() {
        let mut sd = CharGrid::new();
        for x in 0..SD_COLS {
            sd.set(x, 3, 0x30 + x as u16);
        }
        let mut a = CharGrid::new();
        let mut b = CharGrid::new();
        map_sd_to_hd(&sd, &mut a);
        map_sd_to_hd(&sd, &mut b);
        for x in 0..GRID_COLS {
            for y in 0..GRID_ROWS {
                assert_eq!(a.get(x, y), b.get(x, y));
            }
        }
    }
}
