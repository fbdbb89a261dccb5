//! Overlapping-tile re-detection.
//!
//! Base detectors miss small or partially occluded faces in group photos.
//! The tiling detector trades compute for recall: one full-image pass plus
//! an overlapping grid of tile passes, merged with non-maximum suppression.
//! Also hosts label transfer across a re-detection and the tap-to-locate
//! flow for faces the detector never finds on its own.

use image::{imageops, GrayImage};
use thiserror::Error;

use crate::detect::{DetectError, DetectOptions, DetectedFace, FaceDetector};
use crate::geometry::{suppress_overlaps, NormRect, PixelRect};
use crate::types::PersonId;

#[derive(Debug, Clone)]
pub struct TilingConfig {
    /// Tiles per axis.
    pub grid: u32,
    /// Tile side as a multiple of the grid step (1.5 = 50% overlap).
    pub tile_scale: f32,
    /// Tiles smaller than this are skipped to avoid degenerate detections.
    pub min_tile_px: u32,
    /// IoU above which merged candidates are considered duplicates.
    pub merge_iou: f32,
    /// Minimum IoU for an old label to claim a re-detected box.
    pub transfer_iou: f32,
    /// IoU above which a located face is rejected as already present.
    pub duplicate_iou: f32,
    /// Locate crop side as a fraction of the shorter image dimension.
    pub locate_fraction: f32,
    /// Locate crops below this side length are upscaled before detection.
    pub upscale_below_px: u32,
    pub upscale_factor: u32,
}

impl Default for TilingConfig {
    fn default() -> Self {
        Self {
            grid: 3,
            tile_scale: 1.5,
            min_tile_px: 100,
            merge_iou: 0.4,
            transfer_iou: 0.25,
            duplicate_iou: 0.6,
            locate_fraction: 0.30,
            upscale_below_px: 300,
            upscale_factor: 3,
        }
    }
}

#[derive(Error, Debug)]
pub enum LocateError {
    #[error("no face found at the tapped location")]
    NoFaceFound,
    #[error("a face already exists at that location")]
    DuplicateRegion,
    #[error(transparent)]
    Detect(#[from] DetectError),
}

/// A label carried by a box before re-detection ran.
#[derive(Debug, Clone)]
pub struct PriorLabel {
    pub rect: NormRect,
    pub person_id: PersonId,
    pub person_name: String,
}

/// Wraps a base detector with the overlapping-grid re-scan strategy.
pub struct TilingDetector<D> {
    detector: D,
    config: TilingConfig,
}

impl<D: FaceDetector> TilingDetector<D> {
    pub fn new(detector: D) -> Self {
        Self::with_config(detector, TilingConfig::default())
    }

    pub fn with_config(detector: D, config: TilingConfig) -> Self {
        Self { detector, config }
    }

    /// Full-image pass plus tile passes, merged and de-duplicated.
    ///
    /// Per-tile failures are logged and skipped; only a failed full-image
    /// pass aborts the operation.
    pub fn redetect(&mut self, image: &GrayImage) -> Result<Vec<DetectedFace>, DetectError> {
        let (img_w, img_h) = image.dimensions();

        let mut candidates = match self.detector.detect(image, DetectOptions::enhanced()) {
            Ok(faces) => faces,
            Err(DetectError::NoUsableRegion) => Vec::new(),
            Err(e) => return Err(e),
        };
        let full_pass = candidates.len();

        let tiles = tile_grid(img_w, img_h, &self.config);
        for tile in &tiles {
            let crop =
                imageops::crop_imm(image, tile.x, tile.y, tile.width, tile.height).to_image();
            let faces = match self.detector.detect(&crop, DetectOptions::enhanced()) {
                Ok(faces) => faces,
                Err(e) => {
                    tracing::debug!(tile = ?tile, error = %e, "tile pass failed, skipping");
                    continue;
                }
            };
            for face in faces {
                candidates.push(DetectedFace {
                    rect: NormRect::from_subregion(face.rect, *tile, img_w, img_h),
                    confidence: face.confidence,
                    crop: face.crop,
                });
            }
        }

        let merged = suppress_overlaps(candidates, |f| f.rect, self.config.merge_iou);
        tracing::debug!(
            full_pass,
            tiles = tiles.len(),
            kept = merged.len(),
            "re-detection merged"
        );
        Ok(merged)
    }

    /// Detect a face around a tapped point.
    ///
    /// `tap` is in normalized top-left-origin (screen) coordinates; `zoom`
    /// is the current magnification, which shrinks the probed region for
    /// precision. `existing` are the photo's current boxes, used as a
    /// duplicate guard.
    pub fn locate(
        &mut self,
        image: &GrayImage,
        tap: (f32, f32),
        zoom: f32,
        existing: &[NormRect],
    ) -> Result<DetectedFace, LocateError> {
        let (img_w, img_h) = image.dimensions();
        let short = img_w.min(img_h);

        let side = ((short as f32 * self.config.locate_fraction) / zoom.max(1.0)).round() as u32;
        let side = side.clamp(16.min(short), short);

        let cx = tap.0.clamp(0.0, 1.0) * img_w as f32;
        let cy = tap.1.clamp(0.0, 1.0) * img_h as f32;
        let x = (cx - side as f32 / 2.0).round().clamp(0.0, (img_w - side) as f32) as u32;
        let y = (cy - side as f32 / 2.0).round().clamp(0.0, (img_h - side) as f32) as u32;
        let region = PixelRect {
            x,
            y,
            width: side,
            height: side,
        };

        let mut crop = imageops::crop_imm(image, x, y, side, side).to_image();
        if side < self.config.upscale_below_px {
            let scaled = side * self.config.upscale_factor;
            crop = imageops::resize(&crop, scaled, scaled, imageops::FilterType::Triangle);
        }

        let faces = match self.detector.detect(&crop, DetectOptions::enhanced()) {
            Ok(faces) => faces,
            Err(DetectError::NoUsableRegion) => return Err(LocateError::NoFaceFound),
            Err(e) => return Err(e.into()),
        };

        let best = faces
            .into_iter()
            .max_by(|a, b| {
                a.confidence
                    .partial_cmp(&b.confidence)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .ok_or(LocateError::NoFaceFound)?;

        let rect = NormRect::from_subregion(best.rect, region, img_w, img_h);
        if existing
            .iter()
            .any(|e| e.iou(&rect) > self.config.duplicate_iou)
        {
            return Err(LocateError::DuplicateRegion);
        }

        Ok(DetectedFace {
            rect,
            confidence: best.confidence,
            crop: best.crop,
        })
    }

    pub fn config(&self) -> &TilingConfig {
        &self.config
    }
}

/// The overlapping tile grid for an image, in pixel coordinates.
///
/// Returns no tiles when they would fall below the minimum size; the
/// full-image pass already covers small images.
fn tile_grid(img_w: u32, img_h: u32, config: &TilingConfig) -> Vec<PixelRect> {
    let grid = config.grid.max(1);
    let step_x = img_w / grid;
    let step_y = img_h / grid;
    let tile_w = ((step_x as f32 * config.tile_scale).round() as u32).min(img_w);
    let tile_h = ((step_y as f32 * config.tile_scale).round() as u32).min(img_h);

    if tile_w < config.min_tile_px || tile_h < config.min_tile_px {
        return Vec::new();
    }

    let mut tiles = Vec::with_capacity((grid * grid) as usize);
    for row in 0..grid {
        for col in 0..grid {
            let center_x = col * step_x + step_x / 2;
            let center_y = row * step_y + step_y / 2;
            let x = (center_x.saturating_sub(tile_w / 2)).min(img_w - tile_w);
            let y = (center_y.saturating_sub(tile_h / 2)).min(img_h - tile_h);
            tiles.push(PixelRect {
                x,
                y,
                width: tile_w,
                height: tile_h,
            });
        }
    }
    tiles
}

/// Carry labels from pre-re-detection boxes onto the freshly detected set.
///
/// Each old label claims the unclaimed new box it overlaps best, requiring
/// IoU >= `min_iou` (looser than the merge threshold, since re-detection
/// shifts geometry). Old labels with no acceptable match are dropped.
/// Returns one slot per detected rect holding the index of the claiming
/// prior label, so callers can also migrate per-label bookkeeping.
pub fn transfer_labels(
    prior: &[PriorLabel],
    detected: &[NormRect],
    min_iou: f32,
) -> Vec<Option<usize>> {
    let mut assignments: Vec<Option<usize>> = vec![None; detected.len()];

    for (label_idx, label) in prior.iter().enumerate() {
        let mut best: Option<(usize, f32)> = None;
        for (i, rect) in detected.iter().enumerate() {
            if assignments[i].is_some() {
                continue;
            }
            let iou = label.rect.iou(rect);
            if iou >= min_iou && best.map_or(true, |(_, b)| iou > b) {
                best = Some((i, iou));
            }
        }
        match best {
            Some((i, _)) => assignments[i] = Some(label_idx),
            None => {
                tracing::debug!(person = %label.person_id, "label lost in re-detection");
            }
        }
    }

    assignments
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Detector that replays a scripted response per call.
    struct ScriptedDetector {
        responses: VecDeque<Vec<DetectedFace>>,
        calls: usize,
    }

    impl ScriptedDetector {
        fn new(responses: Vec<Vec<DetectedFace>>) -> Self {
            Self {
                responses: responses.into(),
                calls: 0,
            }
        }
    }

    impl FaceDetector for ScriptedDetector {
        fn detect(
            &mut self,
            _image: &GrayImage,
            _options: DetectOptions,
        ) -> Result<Vec<DetectedFace>, DetectError> {
            self.calls += 1;
            Ok(self.responses.pop_front().unwrap_or_default())
        }
    }

    fn face(x: f32, y: f32, w: f32, h: f32, conf: f32) -> DetectedFace {
        DetectedFace {
            rect: NormRect::new(x, y, w, h),
            confidence: conf,
            crop: GrayImage::from_pixel(8, 8, image::Luma([128])),
        }
    }

    fn blank(w: u32, h: u32) -> GrayImage {
        GrayImage::from_pixel(w, h, image::Luma([90]))
    }

    #[test]
    fn test_tile_grid_overlaps_and_covers() {
        let tiles = tile_grid(600, 600, &TilingConfig::default());
        assert_eq!(tiles.len(), 9);
        // 3x3 grid at 1.5x scale: 300px tiles stepping 150px.
        assert!(tiles.iter().all(|t| t.width == 300 && t.height == 300));
        assert_eq!(tiles[0], PixelRect { x: 0, y: 0, width: 300, height: 300 });
        // Last tile is clamped flush with the far edge.
        let last = tiles[8];
        assert_eq!(last.x + last.width, 600);
        assert_eq!(last.y + last.height, 600);
    }

    #[test]
    fn test_tile_grid_skips_small_images() {
        // 150px image -> 75px tiles, below the 100px minimum.
        assert!(tile_grid(150, 150, &TilingConfig::default()).is_empty());
    }

    #[test]
    fn test_redetect_small_image_runs_single_pass() {
        let mut detector = TilingDetector::new(ScriptedDetector::new(vec![vec![face(
            0.2, 0.2, 0.3, 0.3, 0.9,
        )]]));
        let faces = detector.redetect(&blank(150, 150)).unwrap();
        assert_eq!(faces.len(), 1);
        assert_eq!(detector.detector.calls, 1);
    }

    #[test]
    fn test_redetect_merges_full_and_tile_passes() {
        // 400x400 image: 9 tiles of 200x200. The first tile re-finds the
        // full-pass face (same full-image rect after re-projection) plus a
        // small face the full pass missed.
        let full = vec![face(0.05, 0.55, 0.15, 0.15, 0.8)];
        // Tile 0 covers pixels (0,0)..(200,200), the top-left quadrant.
        // Local (0.1, 0.1, 0.3, 0.3) re-projects to (0.05, 0.55, 0.15, 0.15).
        let tile0 = vec![
            face(0.1, 0.1, 0.3, 0.3, 0.95),
            face(0.6, 0.6, 0.1, 0.1, 0.7),
        ];
        let mut responses = vec![full, tile0];
        responses.extend(std::iter::repeat_with(Vec::new).take(8));

        let mut detector = TilingDetector::new(ScriptedDetector::new(responses));
        let faces = detector.redetect(&blank(400, 400)).unwrap();

        // Duplicate suppressed, new small face kept.
        assert_eq!(faces.len(), 2);
        assert_eq!(detector.detector.calls, 10);
    }

    #[test]
    fn test_redetect_survives_tile_failure() {
        struct FlakyDetector {
            calls: usize,
        }
        impl FaceDetector for FlakyDetector {
            fn detect(
                &mut self,
                _image: &GrayImage,
                _options: DetectOptions,
            ) -> Result<Vec<DetectedFace>, DetectError> {
                self.calls += 1;
                if self.calls == 1 {
                    Ok(vec![DetectedFace {
                        rect: NormRect::new(0.4, 0.4, 0.2, 0.2),
                        confidence: 0.9,
                        crop: GrayImage::from_pixel(8, 8, image::Luma([0])),
                    }])
                } else {
                    Err(DetectError::Backend("tile exploded".into()))
                }
            }
        }

        let mut detector = TilingDetector::new(FlakyDetector { calls: 0 });
        let faces = detector.redetect(&blank(400, 400)).unwrap();
        assert_eq!(faces.len(), 1);
    }

    #[test]
    fn test_transfer_label_claims_best_overlap() {
        let alice = PersonId::new();
        let prior = vec![PriorLabel {
            rect: NormRect::new(0.0, 0.0, 0.2, 0.2),
            person_id: alice,
            person_name: "Alice".into(),
        }];
        // IoU with the prior box: ~0.4 for the first, 0.0 for the second.
        let detected = vec![
            NormRect::new(0.0857, 0.0, 0.2, 0.2),
            NormRect::new(0.5, 0.5, 0.2, 0.2),
        ];

        let assigned = transfer_labels(&prior, &detected, 0.25);
        assert_eq!(assigned[0].map(|i| prior[i].person_id), Some(alice));
        assert!(assigned[1].is_none());
    }

    #[test]
    fn test_transfer_label_dropped_below_threshold() {
        let prior = vec![PriorLabel {
            rect: NormRect::new(0.0, 0.0, 0.2, 0.2),
            person_id: PersonId::new(),
            person_name: "Bob".into(),
        }];
        // IoU ~0.1: below the 0.25 floor, so the label is lost.
        let detected = vec![NormRect::new(0.16, 0.0, 0.2, 0.2)];

        let assigned = transfer_labels(&prior, &detected, 0.25);
        assert!(assigned[0].is_none());
    }

    #[test]
    fn test_transfer_labels_do_not_stack() {
        let a = PersonId::new();
        let b = PersonId::new();
        let prior = vec![
            PriorLabel {
                rect: NormRect::new(0.0, 0.0, 0.2, 0.2),
                person_id: a,
                person_name: "A".into(),
            },
            PriorLabel {
                rect: NormRect::new(0.02, 0.02, 0.2, 0.2),
                person_id: b,
                person_name: "B".into(),
            },
        ];
        // One new box overlapping both priors: only the first claims it.
        let detected = vec![NormRect::new(0.01, 0.01, 0.2, 0.2)];

        let assigned = transfer_labels(&prior, &detected, 0.25);
        assert_eq!(assigned[0].map(|i| prior[i].person_id), Some(a));
    }

    #[test]
    fn test_locate_finds_and_reprojects() {
        // 400x400 image, tap dead center, zoom 1 -> 120px probe region at
        // (140,140), upscaled before detection.
        let scripted = ScriptedDetector::new(vec![vec![face(0.25, 0.25, 0.5, 0.5, 0.9)]]);
        let mut detector = TilingDetector::new(scripted);

        let found = detector
            .locate(&blank(400, 400), (0.5, 0.5), 1.0, &[])
            .unwrap();

        assert!((found.rect.x - 0.425).abs() < 1e-3);
        assert!((found.rect.y - 0.425).abs() < 1e-3);
        assert!((found.rect.width - 0.15).abs() < 1e-3);
        assert!((found.rect.height - 0.15).abs() < 1e-3);
    }

    #[test]
    fn test_locate_rejects_duplicate() {
        let scripted = ScriptedDetector::new(vec![vec![face(0.25, 0.25, 0.5, 0.5, 0.9)]]);
        let mut detector = TilingDetector::new(scripted);

        let existing = vec![NormRect::new(0.425, 0.425, 0.15, 0.15)];
        let err = detector
            .locate(&blank(400, 400), (0.5, 0.5), 1.0, &existing)
            .unwrap_err();
        assert!(matches!(err, LocateError::DuplicateRegion));
    }

    #[test]
    fn test_locate_no_face_is_retryable() {
        let scripted = ScriptedDetector::new(vec![Vec::new()]);
        let mut detector = TilingDetector::new(scripted);

        let err = detector
            .locate(&blank(400, 400), (0.2, 0.8), 1.0, &[])
            .unwrap_err();
        assert!(matches!(err, LocateError::NoFaceFound));
    }

    #[test]
    fn test_locate_zoom_shrinks_probe() {
        // At zoom 3 the probe is 40px; the region hugs the tap point.
        let scripted = ScriptedDetector::new(vec![vec![face(0.0, 0.0, 1.0, 1.0, 0.9)]]);
        let mut detector = TilingDetector::new(scripted);

        let found = detector
            .locate(&blank(400, 400), (0.5, 0.5), 3.0, &[])
            .unwrap();
        assert!((found.rect.width - 0.1).abs() < 1e-3);
        assert!((found.rect.height - 0.1).abs() < 1e-3);
    }
}
