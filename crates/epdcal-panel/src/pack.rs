//! NRGBA raster to packed 1-bpp plane conversion.
//!
//! The capture pipeline produces a portrait 984-wide PNG; the panel is
//! addressed landscape at 1304x984. Packing rotates the raster into panel
//! space, center-crops the long axis, and classifies every pixel into one
//! of the two ink planes.

use image::RgbaImage;

use crate::error::{PanelError, PanelResult};

/// Panel width in pixels.
pub const PANEL_WIDTH: usize = 1304;
/// Panel height in pixels.
pub const PANEL_HEIGHT: usize = 984;
/// Bytes per packed row.
pub const ROW_STRIDE: usize = PANEL_WIDTH / 8; // 163
/// Bytes per plane.
pub const PLANE_SIZE: usize = ROW_STRIDE * PANEL_HEIGHT;

/// Required source raster width.
const SRC_WIDTH: u32 = 984;
/// Minimum source raster height; taller inputs are center-cropped.
const SRC_MIN_HEIGHT: u32 = 1304;

/// The two 1-bpp color planes of one frame.
///
/// Layout: `byte = y*163 + (x>>3)`, `mask = 0x80 >> (x&7)`. Both planes
/// start all-ones; a cleared bit means ink at that pixel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanePair {
    pub black: Vec<u8>,
    pub red: Vec<u8>,
}

impl PlanePair {
    /// An all-white frame.
    pub fn blank() -> Self {
        Self {
            black: vec![0xFF; PLANE_SIZE],
            red: vec![0xFF; PLANE_SIZE],
        }
    }
}

/// Pixel classification thresholds.
///
/// The panel has no gray: any non-highlight darkness must map to black ink
/// or it disappears. These values are tuned for this panel's waveform; a
/// waveform update should only ever touch this table.
#[derive(Debug, Clone, Copy)]
pub struct ClassifyThresholds {
    /// Pixels with alpha below this are treated as white.
    pub min_alpha: u8,
    /// Minimum luma for a pixel to qualify as red rather than black.
    pub red_min_luma: f32,
    /// Minimum red channel value for red ink.
    pub red_min_channel: u8,
    /// Minimum `R - max(G, B)` dominance for red ink.
    pub red_min_dominance: f32,
    /// Luma below which everything non-red becomes black ink.
    pub black_max_luma: f32,
}

impl Default for ClassifyThresholds {
    fn default() -> Self {
        Self {
            min_alpha: 128,
            // Fully saturated red sits at Y = 0.299*255 ~= 76.2; the floor
            // must sit below that or pure red ink falls through to black.
            red_min_luma: 76.0,
            red_min_channel: 150,
            red_min_dominance: 32.0,
            black_max_luma: 210.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ink {
    White,
    Black,
    Red,
}

impl ClassifyThresholds {
    fn classify(&self, r: u8, g: u8, b: u8, a: u8) -> Ink {
        if a < self.min_alpha {
            return Ink::White;
        }

        let (rf, gf, bf) = (f32::from(r), f32::from(g), f32::from(b));
        let luma = 0.299 * rf + 0.587 * gf + 0.114 * bf;
        let redness = rf - gf.max(bf);

        if luma >= self.red_min_luma && r > self.red_min_channel && redness > self.red_min_dominance
        {
            return Ink::Red;
        }
        if luma < self.black_max_luma {
            return Ink::Black;
        }
        Ink::White
    }
}

/// Packs an NRGBA raster into black/red planes with the default thresholds.
///
/// `rotation` is 90 (clockwise) or 270 (counter-clockwise); any other value
/// behaves as 90. The input must be exactly 984 wide and at least 1304
/// tall; excess height is center-cropped.
pub fn pack_planes(img: &RgbaImage, rotation: u32) -> PanelResult<PlanePair> {
    pack_planes_with(img, rotation, &ClassifyThresholds::default())
}

/// Packs with explicit thresholds. Pure: identical inputs produce
/// byte-identical planes.
pub fn pack_planes_with(
    img: &RgbaImage,
    rotation: u32,
    thresholds: &ClassifyThresholds,
) -> PanelResult<PlanePair> {
    let (width, height) = img.dimensions();
    if width != SRC_WIDTH {
        return Err(PanelError::geometry(format!(
            "expected width {SRC_WIDTH}, got {width}"
        )));
    }
    if height < SRC_MIN_HEIGHT {
        return Err(PanelError::geometry(format!(
            "expected height >= {SRC_MIN_HEIGHT}, got {height}"
        )));
    }

    let rotation = if rotation == 270 { 270 } else { 90 };
    let start_y = (height - SRC_MIN_HEIGHT) / 2;

    let mut planes = PlanePair::blank();

    for dy in 0..PANEL_HEIGHT {
        for dx in 0..PANEL_WIDTH {
            let (sx, sy) = if rotation == 90 {
                (dy as u32, start_y + (SRC_MIN_HEIGHT - 1 - dx as u32))
            } else {
                (SRC_WIDTH - 1 - dy as u32, start_y + dx as u32)
            };

            let pixel = img.get_pixel(sx, sy).0;
            let ink = thresholds.classify(pixel[0], pixel[1], pixel[2], pixel[3]);
            if ink == Ink::White {
                continue;
            }

            let byte = dy * ROW_STRIDE + (dx >> 3);
            let mask = 0x80u8 >> (dx & 7);
            match ink {
                Ink::Black => planes.black[byte] &= !mask,
                Ink::Red => planes.red[byte] &= !mask,
                Ink::White => unreachable!(),
            }
        }
    }

    Ok(planes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    fn white_image(w: u32, h: u32) -> RgbaImage {
        RgbaImage::from_pixel(w, h, Rgba([0xFF, 0xFF, 0xFF, 0xFF]))
    }

    #[test]
    fn all_white_input_yields_blank_planes() {
        let img = white_image(984, 1304);
        let planes = pack_planes(&img, 90).unwrap();
        assert_eq!(planes.black.len(), PLANE_SIZE);
        assert_eq!(planes.red.len(), PLANE_SIZE);
        assert!(planes.black.iter().all(|&b| b == 0xFF));
        assert!(planes.red.iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn packing_is_deterministic() {
        let mut img = white_image(984, 1400);
        for y in 200..400 {
            for x in 100..200 {
                img.put_pixel(x, y, Rgba([0, 0, 0, 0xFF]));
            }
        }
        let a = pack_planes(&img, 90).unwrap();
        let b = pack_planes(&img, 90).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn wrong_width_is_rejected() {
        let img = white_image(983, 1304);
        assert!(matches!(
            pack_planes(&img, 90),
            Err(PanelError::ImageGeometry(_))
        ));
    }

    #[test]
    fn short_height_is_rejected() {
        let img = white_image(984, 1303);
        assert!(matches!(
            pack_planes(&img, 90),
            Err(PanelError::ImageGeometry(_))
        ));
    }

    #[test]
    fn exact_height_packs_without_crop() {
        // height == 1304 means start_y == 0: the raster's first row must be
        // reachable. Paint the very first source row black and check it
        // appears along the dx = 1303 edge after clockwise rotation.
        let mut img = white_image(984, 1304);
        for x in 0..984 {
            img.put_pixel(x, 0, Rgba([0, 0, 0, 0xFF]));
        }
        let planes = pack_planes(&img, 90).unwrap();

        // sy = start_y + 1303 - dx == 0 requires dx == 1303.
        for dy in 0..PANEL_HEIGHT {
            let byte = dy * ROW_STRIDE + (1303 >> 3);
            assert_eq!(planes.black[byte] & (0x80 >> (1303 & 7)), 0, "row {dy}");
        }
    }

    #[test]
    fn unknown_rotation_behaves_as_90() {
        let mut img = white_image(984, 1304);
        img.put_pixel(10, 20, Rgba([0, 0, 0, 0xFF]));
        let as_90 = pack_planes(&img, 90).unwrap();
        let as_180 = pack_planes(&img, 180).unwrap();
        let as_0 = pack_planes(&img, 0).unwrap();
        assert_eq!(as_90, as_180);
        assert_eq!(as_90, as_0);
    }

    #[test]
    fn rotations_differ() {
        let mut img = white_image(984, 1304);
        img.put_pixel(10, 20, Rgba([0, 0, 0, 0xFF]));
        let cw = pack_planes(&img, 90).unwrap();
        let ccw = pack_planes(&img, 270).unwrap();
        assert_ne!(cw, ccw);
    }

    #[test]
    fn red_rectangle_lands_in_red_plane_only() {
        // Pure-red rectangle at source (100..200, 100..200).
        let mut img = white_image(984, 1304);
        for y in 100..200 {
            for x in 100..200 {
                img.put_pixel(x, y, Rgba([0xFF, 0, 0, 0xFF]));
            }
        }
        let planes = pack_planes(&img, 90).unwrap();

        let mut red_cleared = 0usize;
        for dy in 0..PANEL_HEIGHT {
            for dx in 0..PANEL_WIDTH {
                let byte = dy * ROW_STRIDE + (dx >> 3);
                let mask = 0x80u8 >> (dx & 7);
                let in_rect = (100..200).contains(&dy) && {
                    // sy = 1303 - dx must fall in 100..200
                    let sy = 1303 - dx;
                    (100..200).contains(&sy)
                };
                let red_ink = planes.red[byte] & mask == 0;
                let black_ink = planes.black[byte] & mask == 0;
                if in_rect {
                    assert!(red_ink, "expected red ink at ({dx},{dy})");
                    assert!(!black_ink, "unexpected black ink at ({dx},{dy})");
                    red_cleared += 1;
                } else {
                    assert!(!red_ink, "stray red ink at ({dx},{dy})");
                    assert!(!black_ink, "stray black ink at ({dx},{dy})");
                }
            }
        }
        assert_eq!(red_cleared, 100 * 100);
    }

    #[test]
    fn transparent_pixels_are_white() {
        let mut img = white_image(984, 1304);
        img.put_pixel(50, 50, Rgba([0, 0, 0, 0x10]));
        let planes = pack_planes(&img, 90).unwrap();
        assert!(planes.black.iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn midtone_maps_to_black_not_white() {
        // The panel has no gray; anything below the white cutoff must ink.
        let t = ClassifyThresholds::default();
        assert_eq!(t.classify(128, 128, 128, 255), Ink::Black);
        assert_eq!(t.classify(220, 220, 220, 255), Ink::White);
        assert_eq!(t.classify(200, 40, 40, 255), Ink::Red);
        assert_eq!(t.classify(255, 0, 0, 255), Ink::Red);
        // Dark saturated red is too dim to survive the red waveform.
        assert_eq!(t.classify(100, 0, 0, 255), Ink::Black);
    }
}
