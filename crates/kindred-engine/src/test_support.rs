//! Shared fakes for engine tests.
//!
//! Photos are uniform gray images whose first pixel is a "marker"
//! intensity; the fake detector and embedder key off that marker, so tests
//! control similarity scores exactly.

use std::collections::HashMap;
use std::io::Cursor;

use chrono::{DateTime, Utc};
use image::{GrayImage, Luma};

use kindred_core::types::Embedding;
use kindred_core::{
    DetectError, DetectOptions, DetectedFace, EmbedError, EmbeddingEngine, FaceDetector, NormRect,
};
use kindred_platform::{GeocodeError, Geocoder, GpsPoint, PhotoAsset};

pub(crate) fn marker_image(marker: u8) -> GrayImage {
    GrayImage::from_pixel(64, 64, Luma([marker]))
}

pub(crate) fn marker_png(marker: u8) -> Vec<u8> {
    let mut cursor = Cursor::new(Vec::new());
    marker_image(marker)
        .write_to(&mut cursor, image::ImageFormat::Png)
        .expect("png encode");
    cursor.into_inner()
}

pub(crate) fn marker_asset(
    asset_id: &str,
    marker: u8,
    captured_at: DateTime<Utc>,
    gps: Option<GpsPoint>,
) -> PhotoAsset {
    PhotoAsset {
        asset_id: asset_id.to_string(),
        captured_at,
        gps,
        image: Some(marker_png(marker)),
    }
}

/// Reports one face filling the center of any image whose marker it knows.
pub(crate) struct MarkerDetector {
    known: Vec<u8>,
}

impl MarkerDetector {
    pub(crate) fn new(known: Vec<u8>) -> Self {
        Self { known }
    }
}

impl FaceDetector for MarkerDetector {
    fn detect(
        &mut self,
        image: &GrayImage,
        _options: DetectOptions,
    ) -> Result<Vec<DetectedFace>, DetectError> {
        let marker = image.get_pixel(0, 0)[0];
        if self.known.contains(&marker) {
            Ok(vec![DetectedFace {
                rect: NormRect::new(0.25, 0.25, 0.5, 0.5),
                confidence: 0.9,
                crop: image.clone(),
            }])
        } else {
            Ok(Vec::new())
        }
    }
}

/// Embeds crops by looking their marker up in a fixed table.
pub(crate) struct TableEmbedder {
    table: HashMap<u8, Vec<f32>>,
}

impl TableEmbedder {
    pub(crate) fn new(entries: &[(u8, Vec<f32>)]) -> Self {
        Self {
            table: entries.iter().cloned().collect(),
        }
    }
}

impl EmbeddingEngine for TableEmbedder {
    fn embed(&mut self, crop: &GrayImage) -> Result<Embedding, EmbedError> {
        if crop.width() == 0 || crop.height() == 0 {
            return Err(EmbedError::DegenerateCrop {
                width: crop.width(),
                height: crop.height(),
            });
        }
        let marker = crop.get_pixel(0, 0)[0];
        self.table
            .get(&marker)
            .cloned()
            .map(Embedding::new)
            .ok_or_else(|| EmbedError::InferenceFailed(format!("no embedding for marker {marker}")))
    }
}

/// Resolves every coordinate to the same place name.
pub(crate) struct FixedGeocoder(pub(crate) String);

impl Geocoder for FixedGeocoder {
    async fn reverse(&self, _point: GpsPoint) -> Result<String, GeocodeError> {
        Ok(self.0.clone())
    }
}
