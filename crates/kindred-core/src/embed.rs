//! ArcFace face embedding via ONNX Runtime.
//!
//! Converts a face-crop image into a 512-dimensional identity vector.
//! Deterministic: the same crop and model weights always produce the same
//! vector, so cosine similarity of an embedding with itself is 1.0.

use image::GrayImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

use crate::types::Embedding;

const ARCFACE_INPUT_SIZE: usize = 112;
const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5; // symmetric normalization, not 128.0
const ARCFACE_EMBEDDING_DIM: usize = 512;
const ARCFACE_MODEL_VERSION: &str = "w600k_r50";

#[derive(Error, Debug)]
pub enum EmbedError {
    #[error("model file not found: {0} — download from insightface and place in models/")]
    ModelNotFound(String),
    #[error("degenerate face crop ({width}x{height})")]
    DegenerateCrop { width: u32, height: u32 },
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Converts a face crop into an identity embedding.
///
/// Per-face failures must never abort a batch: callers log, skip the face,
/// and continue.
pub trait EmbeddingEngine {
    fn embed(&mut self, crop: &GrayImage) -> Result<Embedding, EmbedError>;
}

impl<E: EmbeddingEngine + ?Sized> EmbeddingEngine for Box<E> {
    fn embed(&mut self, crop: &GrayImage) -> Result<Embedding, EmbedError> {
        (**self).embed(crop)
    }
}

/// ArcFace-based embedder.
pub struct OnnxEmbedder {
    session: Session,
}

impl OnnxEmbedder {
    /// Load the ArcFace ONNX model from the given path.
    pub fn load(model_path: &str) -> Result<Self, EmbedError> {
        if !Path::new(model_path).exists() {
            return Err(EmbedError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = model_path,
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded ArcFace model"
        );

        Ok(Self { session })
    }

    /// Preprocess a face crop into a NCHW float tensor.
    ///
    /// Bilinear-samples the crop down (or up) to 112x112, normalizes to the
    /// ArcFace input distribution, and replicates the gray channel to RGB.
    fn preprocess(crop: &GrayImage) -> Array4<f32> {
        let size = ARCFACE_INPUT_SIZE;
        let (src_w, src_h) = (crop.width() as usize, crop.height() as usize);
        let pixels = crop.as_raw();
        let mut tensor = Array4::<f32>::zeros((1, 3, size, size));

        for y in 0..size {
            let src_y = (y as f32 + 0.5) * src_h as f32 / size as f32 - 0.5;
            let y0 = (src_y.floor() as i32).clamp(0, src_h as i32 - 1) as usize;
            let y1 = (y0 + 1).min(src_h - 1);
            let fy = (src_y - src_y.floor()).clamp(0.0, 1.0);

            for x in 0..size {
                let src_x = (x as f32 + 0.5) * src_w as f32 / size as f32 - 0.5;
                let x0 = (src_x.floor() as i32).clamp(0, src_w as i32 - 1) as usize;
                let x1 = (x0 + 1).min(src_w - 1);
                let fx = (src_x - src_x.floor()).clamp(0.0, 1.0);

                let tl = pixels[y0 * src_w + x0] as f32;
                let tr = pixels[y0 * src_w + x1] as f32;
                let bl = pixels[y1 * src_w + x0] as f32;
                let br = pixels[y1 * src_w + x1] as f32;

                let val = tl * (1.0 - fx) * (1.0 - fy)
                    + tr * fx * (1.0 - fy)
                    + bl * (1.0 - fx) * fy
                    + br * fx * fy;

                let normalized = (val - ARCFACE_MEAN) / ARCFACE_STD;
                tensor[[0, 0, y, x]] = normalized;
                tensor[[0, 1, y, x]] = normalized;
                tensor[[0, 2, y, x]] = normalized;
            }
        }

        tensor
    }
}

impl EmbeddingEngine for OnnxEmbedder {
    fn embed(&mut self, crop: &GrayImage) -> Result<Embedding, EmbedError> {
        if crop.width() == 0 || crop.height() == 0 {
            return Err(EmbedError::DegenerateCrop {
                width: crop.width(),
                height: crop.height(),
            });
        }

        let input = Self::preprocess(crop);

        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw_data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| EmbedError::InferenceFailed(format!("embedding extraction: {e}")))?;

        let raw: Vec<f32> = raw_data.to_vec();

        if raw.len() != ARCFACE_EMBEDDING_DIM {
            return Err(EmbedError::InferenceFailed(format!(
                "expected {ARCFACE_EMBEDDING_DIM}-dim embedding, got {}",
                raw.len()
            )));
        }

        // L2-normalize so cosine similarity reduces to a dot product.
        let norm: f32 = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
        let values = if norm > 0.0 {
            raw.iter().map(|x| x / norm).collect()
        } else {
            raw
        };

        Ok(Embedding {
            values,
            model_version: Some(ARCFACE_MODEL_VERSION.to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uniform_crop(size: u32, value: u8) -> GrayImage {
        GrayImage::from_pixel(size, size, image::Luma([value]))
    }

    #[test]
    fn test_preprocess_output_shape() {
        let tensor = OnnxEmbedder::preprocess(&uniform_crop(80, 128));
        assert_eq!(
            tensor.shape(),
            &[1, 3, ARCFACE_INPUT_SIZE, ARCFACE_INPUT_SIZE]
        );
    }

    #[test]
    fn test_preprocess_normalization() {
        let tensor = OnnxEmbedder::preprocess(&uniform_crop(112, 128));
        let val = tensor[[0, 0, 0, 0]];
        let expected = (128.0 - ARCFACE_MEAN) / ARCFACE_STD;
        assert!((val - expected).abs() < 1e-6, "got {val}, expected {expected}");
    }

    #[test]
    fn test_preprocess_uniform_stays_uniform_when_resized() {
        // Bilinear sampling of a uniform crop must not introduce texture.
        let tensor = OnnxEmbedder::preprocess(&uniform_crop(37, 200));
        let first = tensor[[0, 0, 0, 0]];
        for y in 0..ARCFACE_INPUT_SIZE {
            for x in 0..ARCFACE_INPUT_SIZE {
                assert!((tensor[[0, 0, y, x]] - first).abs() < 1e-6);
            }
        }
    }

    #[test]
    fn test_preprocess_channels_identical() {
        let tensor = OnnxEmbedder::preprocess(&uniform_crop(50, 100));
        for y in 0..ARCFACE_INPUT_SIZE {
            for x in 0..ARCFACE_INPUT_SIZE {
                let r = tensor[[0, 0, y, x]];
                assert_eq!(r, tensor[[0, 1, y, x]]);
                assert_eq!(r, tensor[[0, 2, y, x]]);
            }
        }
    }
}
