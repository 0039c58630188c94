//! SCRFD + ArcFace bundle that serves as both detection and embedding adapter.

use crate::detector::{DetectorError, FaceDetector, ScrfdDetector};
use crate::recognizer::{ArcFaceRecognizer, FaceEmbedder, RecognizerError, ARCFACE_EMBEDDING_DIM, ARCFACE_MODEL_VERSION};
use crate::types::{BoundingBox, Embedding};
use image::RgbImage;
use serde::Serialize;

/// Descriptive model metadata for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct ModelInfo {
    pub detector: &'static str,
    pub recognizer: &'static str,
    pub embedding_dim: usize,
    pub distance_metric: &'static str,
}

/// Loaded detection and recognition models.
///
/// Expensive to construct; build once at startup and hand it to the engine.
pub struct FaceAnalyzer {
    detector: ScrfdDetector,
    recognizer: ArcFaceRecognizer,
}

impl FaceAnalyzer {
    pub fn new(detector: ScrfdDetector, recognizer: ArcFaceRecognizer) -> Self {
        Self { detector, recognizer }
    }

    pub fn load(scrfd_path: &str, arcface_path: &str) -> Result<Self, AnalyzerLoadError> {
        let detector = ScrfdDetector::load(scrfd_path)?;
        let recognizer = ArcFaceRecognizer::load(arcface_path)?;
        Ok(Self::new(detector, recognizer))
    }

    pub fn info() -> ModelInfo {
        ModelInfo {
            detector: "scrfd_10g",
            recognizer: ARCFACE_MODEL_VERSION,
            embedding_dim: ARCFACE_EMBEDDING_DIM,
            distance_metric: "cosine",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AnalyzerLoadError {
    #[error(transparent)]
    Detector(#[from] DetectorError),
    #[error(transparent)]
    Recognizer(#[from] RecognizerError),
}

impl FaceDetector for FaceAnalyzer {
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError> {
        self.detector.detect(image)
    }
}

impl FaceEmbedder for FaceAnalyzer {
    fn embed(&mut self, image: &RgbImage) -> Result<Option<Embedding>, RecognizerError> {
        let faces = self
            .detector
            .detect(image)
            .map_err(|e| RecognizerError::InferenceFailed(format!("face localization: {e}")))?;

        // Detector output is sorted by confidence; the first face is the most prominent.
        let Some(face) = faces.first() else {
            tracing::debug!("embed: no face located");
            return Ok(None);
        };

        tracing::debug!(confidence = face.confidence, faces = faces.len(), "embed: face selected");
        self.recognizer.extract(image, face).map(Some)
    }
}
