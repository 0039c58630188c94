//! Face embedding adapter and the ArcFace recognizer via ONNX Runtime.
//!
//! Extracts L2-normalized 512-dimensional embeddings from aligned face crops
//! using the w600k_r50 ArcFace model.

use crate::alignment::{self, ALIGNED_SIZE};
use crate::crop;
use crate::types::{BoundingBox, Embedding};
use image::{imageops, imageops::FilterType, RgbImage};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5; // symmetric, unlike SCRFD's 128.0
pub const ARCFACE_EMBEDDING_DIM: usize = 512;
pub const ARCFACE_MODEL_VERSION: &str = "w600k_r50";

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("model file not found: {0} (download from insightface and place in the model directory)")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("face box lies outside the image")]
    EmptyFaceRegion,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Embedding adapter: image region in, embedding out.
///
/// `Ok(None)` means the region holds no usable face. Implementations locate the
/// most prominent face themselves, so callers may pass a whole photo or a crop.
pub trait FaceEmbedder {
    fn embed(&mut self, image: &RgbImage) -> Result<Option<Embedding>, RecognizerError>;
}

/// ArcFace-based face recognizer.
pub struct ArcFaceRecognizer {
    session: Session,
}

impl ArcFaceRecognizer {
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
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded ArcFace model"
        );

        Ok(Self { session })
    }

    /// Extract the embedding of one detected face.
    ///
    /// Faces with landmarks are aligned to the canonical 112×112 position; faces
    /// without landmarks fall back to a plain crop of the box, resized.
    pub fn extract(&mut self, image: &RgbImage, face: &BoundingBox) -> Result<Embedding, RecognizerError> {
        let aligned = face_patch(image, face)?;
        let input = preprocess(&aligned);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| RecognizerError::InferenceFailed(format!("embedding extraction: {e}")))?;

        if raw.len() != ARCFACE_EMBEDDING_DIM {
            return Err(RecognizerError::InferenceFailed(format!(
                "expected {ARCFACE_EMBEDDING_DIM}-dim embedding, got {}",
                raw.len()
            )));
        }

        Ok(Embedding {
            values: l2_normalize(raw.to_vec()),
            model_version: Some(ARCFACE_MODEL_VERSION.to_string()),
        })
    }
}

/// The 112×112 RGB patch fed to ArcFace for `face`.
fn face_patch(image: &RgbImage, face: &BoundingBox) -> Result<RgbImage, RecognizerError> {
    if let Some(landmarks) = face.landmarks.as_ref() {
        return Ok(alignment::align_face(image, landmarks));
    }

    let clamped = crop::clamp_box(face, image.width(), image.height()).ok_or(RecognizerError::EmptyFaceRegion)?;
    let region = imageops::crop_imm(
        image,
        clamped.left as u32,
        clamped.top as u32,
        clamped.width() as u32,
        clamped.height() as u32,
    )
    .to_image();
    Ok(imageops::resize(&region, ALIGNED_SIZE, ALIGNED_SIZE, FilterType::Triangle))
}

/// Normalize an aligned RGB crop into a NCHW float tensor.
fn preprocess(aligned: &RgbImage) -> Array4<f32> {
    let size = ALIGNED_SIZE as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for (x, y, pixel) in aligned.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = (pixel[c] as f32 - ARCFACE_MEAN) / ARCFACE_STD;
        }
    }
    tensor
}

fn l2_normalize(mut values: Vec<f32>) -> Vec<f32> {
    let norm: f32 = values.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        values.iter_mut().for_each(|x| *x /= norm);
    }
    values
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_preprocess_output_shape() {
        let aligned = RgbImage::from_pixel(ALIGNED_SIZE, ALIGNED_SIZE, Rgb([128, 128, 128]));
        let tensor = preprocess(&aligned);
        assert_eq!(tensor.shape(), &[1, 3, 112, 112]);
    }

    #[test]
    fn test_preprocess_normalization_per_channel() {
        let aligned = RgbImage::from_pixel(ALIGNED_SIZE, ALIGNED_SIZE, Rgb([0, 128, 255]));
        let tensor = preprocess(&aligned);
        assert!((tensor[[0, 0, 5, 5]] + 1.0).abs() < 1e-6);
        assert!((tensor[[0, 1, 5, 5]] - (0.5 / 127.5)).abs() < 1e-6);
        assert!((tensor[[0, 2, 5, 5]] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_l2_normalize() {
        let v = l2_normalize(vec![3.0, 4.0]);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);
        assert_eq!(l2_normalize(vec![0.0, 0.0]), vec![0.0, 0.0]);
    }

    #[test]
    fn test_face_patch_without_landmarks_resizes_box() {
        let img = RgbImage::from_pixel(300, 200, Rgb([10, 20, 30]));
        let face = BoundingBox::new(20, 120, 100, 40, 0.9);
        let patch = face_patch(&img, &face).unwrap();
        assert_eq!(patch.dimensions(), (112, 112));
        assert_eq!(patch.get_pixel(50, 50), &Rgb([10, 20, 30]));
    }

    #[test]
    fn test_face_patch_outside_image() {
        let img = RgbImage::new(50, 50);
        let face = BoundingBox::new(100, 200, 150, 120, 0.9);
        assert!(matches!(face_patch(&img, &face), Err(RecognizerError::EmptyFaceRegion)));
    }
}
