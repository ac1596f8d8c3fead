//! Normalized bounding boxes, pixel conversion and crop production.
//!
//! Page Analyzer geometry is untrusted: coordinates outside `[0, 1]`,
//! negative sizes and boxes running off the page are clamped rather than
//! rejected. A box that clamps to zero area still yields an image row but
//! never a crop artifact.

use image::DynamicImage;
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use tracing::debug;

/// `(x, y, w, h)` as fractions of page width/height; `(x, y)` is top-left.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct NormalizedBox {
    pub x: f64,
    pub y: f64,
    pub w: f64,
    pub h: f64,
}

impl NormalizedBox {
    pub fn new(x: f64, y: f64, w: f64, h: f64) -> Self {
        Self { x, y, w, h }
    }

    /// Clamp into the unit square so that `0 <= x,y`, `x+w <= 1`, `y+h <= 1`
    /// and `w,h >= 0`. Non-finite values count as 0.
    pub fn clamped(&self) -> NormalizedBox {
        let (x, w) = clamp_axis(self.x, self.w);
        let (y, h) = clamp_axis(self.y, self.h);
        NormalizedBox { x, y, w, h }
    }

    /// True when the box already satisfies the unit-square invariants.
    pub fn is_within_unit(&self) -> bool {
        self.clamped() == *self
    }

    /// Zero width or zero height after clamping.
    pub fn is_degenerate(&self) -> bool {
        let c = self.clamped();
        c.w <= 0.0 || c.h <= 0.0
    }
}

fn finite_or_zero(v: f64) -> f64 {
    if v.is_finite() {
        v
    } else {
        0.0
    }
}

fn clamp_axis(origin: f64, extent: f64) -> (f64, f64) {
    let origin = finite_or_zero(origin).clamp(0.0, 1.0);
    let extent = finite_or_zero(extent).max(0.0).min(1.0 - origin);
    (origin, extent)
}

/// Pixel-space rectangle, `right`/`bottom` exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelRect {
    pub left: u32,
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
}

impl PixelRect {
    pub fn width(&self) -> u32 {
        self.right - self.left
    }

    pub fn height(&self) -> u32 {
        self.bottom - self.top
    }
}

/// Map a normalized box onto a `width` × `height` raster.
///
/// Each edge is rounded to the nearest pixel and clamped into the raster.
/// Returns `None` when the result has no area.
pub fn to_pixel_rect(bbox: &NormalizedBox, width: u32, height: u32) -> Option<PixelRect> {
    let edge = |v: f64, max: u32| -> u32 {
        let v = finite_or_zero(v);
        (v * f64::from(max)).round().clamp(0.0, f64::from(max)) as u32
    };

    let left = edge(bbox.x, width);
    let top = edge(bbox.y, height);
    let right = edge(bbox.x + bbox.w, width);
    let bottom = edge(bbox.y + bbox.h, height);

    if right <= left || bottom <= top {
        return None;
    }
    Some(PixelRect {
        left,
        top,
        right,
        bottom,
    })
}

/// Cut the region described by `bbox` out of `raster`.
pub fn crop(raster: &DynamicImage, bbox: &NormalizedBox) -> Option<DynamicImage> {
    let rect = to_pixel_rect(&bbox.clamped(), raster.width(), raster.height())?;
    debug!(
        "Crop {}x{} at ({}, {}) from {}x{} raster",
        rect.width(),
        rect.height(),
        rect.left,
        rect.top,
        raster.width(),
        raster.height()
    );
    Some(raster.crop_imm(rect.left, rect.top, rect.width(), rect.height()))
}

/// Crop and PNG-encode. `Ok(None)` means the box was degenerate.
pub fn crop_png(
    raster: &DynamicImage,
    bbox: &NormalizedBox,
) -> Result<Option<Vec<u8>>, image::ImageError> {
    let Some(region) = crop(raster, bbox) else {
        return Ok(None);
    };
    let mut buf = Vec::new();
    region.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)?;
    Ok(Some(buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};

    fn raster(w: u32, h: u32) -> DynamicImage {
        DynamicImage::ImageRgba8(RgbaImage::from_pixel(w, h, Rgba([0, 0, 0, 255])))
    }

    #[test]
    fn clamps_out_of_range_box() {
        let b = NormalizedBox::new(-0.2, 0.5, 0.5, 0.9).clamped();
        assert_eq!(b.x, 0.0);
        assert_eq!(b.w, 0.5);
        assert_eq!(b.y, 0.5);
        assert_eq!(b.h, 0.5);
        assert!(b.is_within_unit());
    }

    #[test]
    fn negative_and_nan_sizes_become_zero() {
        let b = NormalizedBox::new(0.2, 0.2, -0.1, f64::NAN);
        assert!(b.is_degenerate());
        let c = b.clamped();
        assert_eq!((c.w, c.h), (0.0, 0.0));
    }

    #[test]
    fn pixel_rect_from_normalized() {
        let b = NormalizedBox::new(0.1, 0.1, 0.3, 0.2);
        let r = to_pixel_rect(&b, 1000, 800).unwrap();
        assert_eq!(r, PixelRect { left: 100, top: 80, right: 400, bottom: 240 });
        assert_eq!((r.width(), r.height()), (300, 160));
    }

    #[test]
    fn pixel_rect_stays_in_bounds() {
        let boxes = [
            NormalizedBox::new(0.0, 0.0, 1.0, 1.0),
            NormalizedBox::new(0.999, 0.999, 0.001, 0.001),
            NormalizedBox::new(0.5, 0.25, 0.5, 0.75),
            NormalizedBox::new(0.33, 0.66, 0.67, 0.34),
        ];
        for (w, h) in [(1, 1), (7, 13), (1700, 2200)] {
            for b in &boxes {
                if let Some(r) = to_pixel_rect(b, w, h) {
                    assert!(r.right <= w && r.bottom <= h, "{b:?} on {w}x{h} -> {r:?}");
                    assert!(r.left < r.right && r.top < r.bottom);
                }
            }
        }
    }

    #[test]
    fn degenerate_boxes_have_no_rect() {
        assert!(to_pixel_rect(&NormalizedBox::new(0.5, 0.5, 0.0, 0.3), 100, 100).is_none());
        assert!(to_pixel_rect(&NormalizedBox::new(0.5, 0.5, 0.3, -0.1), 100, 100).is_none());
        // Sub-pixel box rounds to nothing.
        assert!(to_pixel_rect(&NormalizedBox::new(0.5, 0.5, 0.001, 0.001), 100, 100).is_none());
    }

    #[test]
    fn crop_matches_rect() {
        let img = raster(1000, 800);
        let region = crop(&img, &NormalizedBox::new(0.1, 0.1, 0.3, 0.2)).unwrap();
        assert_eq!((region.width(), region.height()), (300, 160));
    }

    #[test]
    fn crop_clamps_overhanging_box() {
        let img = raster(200, 100);
        let region = crop(&img, &NormalizedBox::new(0.8, 0.5, 0.5, 0.9)).unwrap();
        assert_eq!((region.width(), region.height()), (40, 50));
    }

    #[test]
    fn crop_png_degenerate_is_none() {
        let img = raster(50, 50);
        let out = crop_png(&img, &NormalizedBox::new(1.2, 0.0, 0.3, 0.3)).unwrap();
        assert!(out.is_none());

        let png = crop_png(&img, &NormalizedBox::new(0.0, 0.0, 0.5, 0.5))
            .unwrap()
            .unwrap();
        assert_eq!(&png[1..4], b"PNG");
    }
}
