//! Normalized bounding-box geometry.
//!
//! Face rectangles are stored as fractions of the image dimensions with the
//! y axis measured from the **bottom** edge, matching the detector
//! convention. Pixel-space helpers convert to and from top-left-origin
//! coordinates for cropping and tiling.

use serde::{Deserialize, Serialize};

/// A face rectangle in normalized, bottom-left-origin coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NormRect {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

/// A rectangle in pixel, top-left-origin coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl NormRect {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn area(&self) -> f32 {
        self.width * self.height
    }

    /// Intersection-over-Union with another rect. 0.0 when disjoint.
    pub fn iou(&self, other: &NormRect) -> f32 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = (self.x + self.width).min(other.x + other.width);
        let y2 = (self.y + self.height).min(other.y + other.height);

        let inter_w = (x2 - x1).max(0.0);
        let inter_h = (y2 - y1).max(0.0);
        let inter_area = inter_w * inter_h;

        let union_area = self.area() + other.area() - inter_area;
        if union_area > 0.0 {
            inter_area / union_area
        } else {
            0.0
        }
    }

    /// Clamp the rect into the unit square, preserving as much as fits.
    pub fn clamped(&self) -> NormRect {
        let x = self.x.clamp(0.0, 1.0);
        let y = self.y.clamp(0.0, 1.0);
        NormRect {
            x,
            y,
            width: self.width.min(1.0 - x).max(0.0),
            height: self.height.min(1.0 - y).max(0.0),
        }
    }

    /// Convert to a pixel rect (top-left origin) for an image of the given
    /// dimensions.
    pub fn to_pixel_rect(&self, img_w: u32, img_h: u32) -> PixelRect {
        let c = self.clamped();
        let w = (c.width * img_w as f32).round() as u32;
        let h = (c.height * img_h as f32).round() as u32;
        let x = (c.x * img_w as f32).round() as u32;
        // Flip: normalized y measures from the bottom edge.
        let y_top = ((1.0 - c.y - c.height) * img_h as f32).round() as u32;
        PixelRect {
            x: x.min(img_w.saturating_sub(1)),
            y: y_top.min(img_h.saturating_sub(1)),
            width: w.max(1).min(img_w),
            height: h.max(1).min(img_h),
        }
    }

    /// Convert from a pixel rect (top-left origin) for an image of the given
    /// dimensions.
    pub fn from_pixel_rect(px: PixelRect, img_w: u32, img_h: u32) -> NormRect {
        let w = px.width as f32 / img_w as f32;
        let h = px.height as f32 / img_h as f32;
        NormRect {
            x: px.x as f32 / img_w as f32,
            y: 1.0 - (px.y + px.height) as f32 / img_h as f32,
            width: w,
            height: h,
        }
    }

    /// Re-project a rect detected inside a pixel sub-region of a larger
    /// image back into the full image's normalized coordinates.
    ///
    /// `local` is normalized (bottom-left origin) relative to `region`;
    /// `region` is in full-image pixel coordinates.
    pub fn from_subregion(local: NormRect, region: PixelRect, img_w: u32, img_h: u32) -> NormRect {
        let local_w_px = local.width * region.width as f32;
        let local_h_px = local.height * region.height as f32;
        let local_x_px = local.x * region.width as f32;
        let local_top_px = (1.0 - local.y - local.height) * region.height as f32;

        let full_x = region.x as f32 + local_x_px;
        let full_top = region.y as f32 + local_top_px;

        NormRect {
            x: full_x / img_w as f32,
            y: 1.0 - (full_top + local_h_px) / img_h as f32,
            width: local_w_px / img_w as f32,
            height: local_h_px / img_h as f32,
        }
        .clamped()
    }
}

/// Non-maximum suppression over arbitrary payloads.
///
/// Candidates are ordered by area descending (a larger box is the more
/// reliable detection when passes overlap), then kept greedily unless their
/// IoU with an already-kept box exceeds `iou_threshold`. Idempotent: running
/// the result through again removes nothing.
pub fn suppress_overlaps<T, F>(mut items: Vec<T>, rect_of: F, iou_threshold: f32) -> Vec<T>
where
    F: Fn(&T) -> NormRect,
{
    items.sort_by(|a, b| {
        rect_of(b)
            .area()
            .partial_cmp(&rect_of(a).area())
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut keep: Vec<T> = Vec::with_capacity(items.len());
    for item in items {
        let rect = rect_of(&item);
        if keep.iter().all(|k| rect_of(k).iou(&rect) <= iou_threshold) {
            keep.push(item);
        }
    }
    keep
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rect(x: f32, y: f32, w: f32, h: f32) -> NormRect {
        NormRect::new(x, y, w, h)
    }

    #[test]
    fn test_iou_identical() {
        let a = rect(0.1, 0.1, 0.5, 0.5);
        assert!((a.iou(&a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_iou_no_overlap() {
        let a = rect(0.0, 0.0, 0.1, 0.1);
        let b = rect(0.5, 0.5, 0.1, 0.1);
        assert!(a.iou(&b).abs() < 1e-6);
    }

    #[test]
    fn test_iou_partial() {
        let a = rect(0.0, 0.0, 0.2, 0.2);
        let b = rect(0.1, 0.0, 0.2, 0.2);
        // Overlap 0.1*0.2 = 0.02, union 0.04+0.04-0.02 = 0.06
        let expected = 0.02 / 0.06;
        assert!((a.iou(&b) - expected).abs() < 1e-5);
    }

    #[test]
    fn test_pixel_roundtrip_flips_y() {
        // Bottom-left-origin rect at the bottom of a 100x200 image.
        let n = rect(0.25, 0.0, 0.5, 0.1);
        let px = n.to_pixel_rect(100, 200);
        assert_eq!(px, PixelRect { x: 25, y: 180, width: 50, height: 20 });

        let back = NormRect::from_pixel_rect(px, 100, 200);
        assert!((back.x - n.x).abs() < 1e-3);
        assert!((back.y - n.y).abs() < 1e-3);
        assert!((back.width - n.width).abs() < 1e-3);
        assert!((back.height - n.height).abs() < 1e-3);
    }

    #[test]
    fn test_subregion_identity_region() {
        // A region covering the whole image must be the identity mapping.
        let local = rect(0.2, 0.3, 0.4, 0.1);
        let region = PixelRect { x: 0, y: 0, width: 640, height: 480 };
        let full = NormRect::from_subregion(local, region, 640, 480);
        assert!((full.x - local.x).abs() < 1e-4);
        assert!((full.y - local.y).abs() < 1e-4);
        assert!((full.width - local.width).abs() < 1e-4);
        assert!((full.height - local.height).abs() < 1e-4);
    }

    #[test]
    fn test_subregion_offset_tile() {
        // A rect filling a tile in the top-left quadrant of a 200x200 image.
        let local = rect(0.0, 0.0, 1.0, 1.0);
        let region = PixelRect { x: 0, y: 0, width: 100, height: 100 };
        let full = NormRect::from_subregion(local, region, 200, 200);
        // Top-left quadrant in bottom-left-origin coords sits at y = 0.5.
        assert!((full.x - 0.0).abs() < 1e-4);
        assert!((full.y - 0.5).abs() < 1e-4);
        assert!((full.width - 0.5).abs() < 1e-4);
        assert!((full.height - 0.5).abs() < 1e-4);
    }

    #[test]
    fn test_suppress_overlaps_prefers_larger() {
        let boxes = vec![
            rect(0.0, 0.0, 0.3, 0.3),
            rect(0.02, 0.02, 0.4, 0.4), // larger, overlapping
            rect(0.7, 0.7, 0.2, 0.2),
        ];
        let kept = suppress_overlaps(boxes, |r| *r, 0.4);
        assert_eq!(kept.len(), 2);
        // The larger of the overlapping pair survives.
        assert!((kept[0].width - 0.4).abs() < 1e-6);
    }

    #[test]
    fn test_suppress_overlaps_idempotent() {
        let boxes = vec![
            rect(0.0, 0.0, 0.3, 0.3),
            rect(0.05, 0.05, 0.3, 0.3),
            rect(0.5, 0.5, 0.2, 0.2),
            rect(0.52, 0.52, 0.25, 0.25),
        ];
        let once = suppress_overlaps(boxes, |r| *r, 0.4);
        let twice = suppress_overlaps(once.clone(), |r| *r, 0.4);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_suppress_overlaps_empty() {
        let kept = suppress_overlaps(Vec::<NormRect>::new(), |r| *r, 0.4);
        assert!(kept.is_empty());
    }

    #[test]
    fn test_clamped_truncates_out_of_bounds() {
        let r = rect(0.8, 0.9, 0.5, 0.5).clamped();
        assert!((r.x - 0.8).abs() < 1e-6);
        assert!((r.width - 0.2).abs() < 1e-5);
        assert!((r.height - 0.1).abs() < 1e-5);
    }
}
