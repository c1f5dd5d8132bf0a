//! ArcFace embedding extraction via ONNX Runtime.
//!
//! Aligns a detected face to the canonical 112×112 crop and produces a
//! 512-dimensional L2-normalized embedding with the w600k_r50 model.

use crate::alignment::{self, ALIGNED_SIZE};
use crate::types::{BoundingBox, Embedding};
use image::GrayImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const EMBED_MEAN: f32 = 127.5;
// Symmetric normalization — not the detector's 128.0.
const EMBED_STD: f32 = 127.5;
const EMBED_DIM: usize = 512;

/// Version tag stamped into embeddings and the gallery file. A gallery
/// trained with a different model must not be matched against.
pub const EMBED_MODEL_VERSION: &str = "w600k_r50";

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("model file not found: {0} — download w600k_r50.onnx from insightface")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("detection carries no landmarks; alignment requires all five points")]
    MissingLandmarks,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// ArcFace-based embedding extractor.
pub struct FaceRecognizer {
    session: Session,
}

impl FaceRecognizer {
    /// Load the ArcFace ONNX model from the given path.
    pub fn load(model_path: &str) -> Result<Self, RecognizerError> {
        if !Path::new(model_path).exists() {
            return Err(RecognizerError::ModelNotFound(model_path.to_string()));
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

    /// Extract the embedding for one detected face in a grayscale frame.
    ///
    /// The detection must carry landmarks; the face is aligned before the
    /// model runs.
    pub fn embed(
        &mut self,
        frame: &GrayImage,
        face: &BoundingBox,
    ) -> Result<Embedding, RecognizerError> {
        let landmarks = face.landmarks.as_ref().ok_or(RecognizerError::MissingLandmarks)?;
        let aligned = alignment::align_face(frame, landmarks);
        let input = preprocess(&aligned);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| RecognizerError::InferenceFailed(format!("embedding: {e}")))?;

        if raw.len() != EMBED_DIM {
            return Err(RecognizerError::InferenceFailed(format!(
                "expected {EMBED_DIM}-dim embedding, got {}",
                raw.len()
            )));
        }

        let norm: f32 = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
        let values: Vec<f32> = if norm > 0.0 {
            raw.iter().map(|x| x / norm).collect()
        } else {
            raw.to_vec()
        };

        Ok(Embedding {
            values,
            model_version: Some(EMBED_MODEL_VERSION.to_string()),
        })
    }
}

/// 112×112 aligned grayscale crop → NCHW float tensor, Y replicated across
/// the three channels.
fn preprocess(aligned: &GrayImage) -> Array4<f32> {
    let size = ALIGNED_SIZE as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));

    for (x, y, pixel) in aligned.enumerate_pixels() {
        let normalized = (pixel.0[0] as f32 - EMBED_MEAN) / EMBED_STD;
        tensor[[0, 0, y as usize, x as usize]] = normalized;
        tensor[[0, 1, y as usize, x as usize]] = normalized;
        tensor[[0, 2, y as usize, x as usize]] = normalized;
    }

    tensor
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preprocess_shape() {
        let aligned = GrayImage::from_pixel(ALIGNED_SIZE, ALIGNED_SIZE, image::Luma([128]));
        let tensor = preprocess(&aligned);
        assert_eq!(tensor.shape(), &[1, 3, ALIGNED_SIZE as usize, ALIGNED_SIZE as usize]);
    }

    #[test]
    fn preprocess_normalization() {
        let aligned = GrayImage::from_pixel(ALIGNED_SIZE, ALIGNED_SIZE, image::Luma([128]));
        let tensor = preprocess(&aligned);
        let expected = (128.0 - EMBED_MEAN) / EMBED_STD;
        assert!((tensor[[0, 0, 0, 0]] - expected).abs() < 1e-6);
    }

    #[test]
    fn preprocess_replicates_channels() {
        let aligned = GrayImage::from_fn(ALIGNED_SIZE, ALIGNED_SIZE, |x, y| {
            image::Luma([((x + y) % 256) as u8])
        });
        let tensor = preprocess(&aligned);
        for y in 0..ALIGNED_SIZE as usize {
            for x in 0..ALIGNED_SIZE as usize {
                assert_eq!(tensor[[0, 0, y, x]], tensor[[0, 1, y, x]]);
                assert_eq!(tensor[[0, 1, y, x]], tensor[[0, 2, y, x]]);
            }
        }
    }
}
