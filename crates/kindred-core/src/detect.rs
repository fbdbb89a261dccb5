//! Face detection capability.
//!
//! Detection itself is a host capability (platform vision frameworks,
//! ONNX detectors, remote services). This module fixes the contract the
//! rest of the pipeline is written against.

use image::GrayImage;
use thiserror::Error;

use crate::geometry::NormRect;

#[derive(Error, Debug)]
pub enum DetectError {
    #[error("no usable face region in input")]
    NoUsableRegion,
    #[error("detector backend: {0}")]
    Backend(String),
}

/// Accuracy/latency trade-off requested from the detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DetectAccuracy {
    /// Fast pass for bulk scanning.
    #[default]
    Fast,
    /// Slower, higher-recall pass for re-detection and locate flows.
    Enhanced,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DetectOptions {
    pub accuracy: DetectAccuracy,
}

impl DetectOptions {
    pub fn enhanced() -> Self {
        Self {
            accuracy: DetectAccuracy::Enhanced,
        }
    }
}

/// One detected face: where it is, how confident the detector is, and the
/// pre-cropped face region for embedding.
#[derive(Debug, Clone)]
pub struct DetectedFace {
    /// Normalized, bottom-left-origin rect within the analyzed image.
    pub rect: NormRect,
    pub confidence: f32,
    pub crop: GrayImage,
}

/// Host-provided face detector.
///
/// Returning an empty vec means "no faces"; `NoUsableRegion` is reserved
/// for inputs the backend could not process at all.
pub trait FaceDetector {
    fn detect(
        &mut self,
        image: &GrayImage,
        options: DetectOptions,
    ) -> Result<Vec<DetectedFace>, DetectError>;
}

impl<D: FaceDetector + ?Sized> FaceDetector for &mut D {
    fn detect(
        &mut self,
        image: &GrayImage,
        options: DetectOptions,
    ) -> Result<Vec<DetectedFace>, DetectError> {
        (**self).detect(image, options)
    }
}

impl<D: FaceDetector + ?Sized> FaceDetector for Box<D> {
    fn detect(
        &mut self,
        image: &GrayImage,
        options: DetectOptions,
    ) -> Result<Vec<DetectedFace>, DetectError> {
        (**self).detect(image, options)
    }
}
