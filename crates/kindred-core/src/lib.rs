//! kindred-core — face identity resolution primitives.
//!
//! Embedding extraction (ArcFace via ONNX Runtime), cosine-similarity
//! matching with confidence bucketing, normalized bounding-box geometry,
//! and the overlapping-tile re-detection strategy used to recover small or
//! occluded faces in group photos.

pub mod detect;
pub mod embed;
pub mod geometry;
pub mod matcher;
pub mod tiling;
pub mod types;

pub use detect::{DetectAccuracy, DetectError, DetectOptions, DetectedFace, FaceDetector};
pub use embed::{EmbedError, EmbeddingEngine, OnnxEmbedder};
pub use geometry::{NormRect, PixelRect};
pub use matcher::{find_matches, Confidence, GalleryPerson, MatchParams, MatchResult};
pub use tiling::{transfer_labels, LocateError, PriorLabel, TilingConfig, TilingDetector};
pub use types::{
    EmbeddingId, EncounterId, FaceBoxId, PersonId, PhotoId, TagId, VectorLayoutError,
};
pub use types::Embedding;
