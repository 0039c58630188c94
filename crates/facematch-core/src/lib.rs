//! facematch-core: face enrollment and similarity search.
//!
//! SCRFD detection and ArcFace embeddings run via ONNX Runtime on the CPU.
//! Everything above the adapters (codec, distance policy, cropping,
//! enrollment, search, record store) is model-agnostic and works with any
//! [`FaceDetector`] + [`FaceEmbedder`] pair.

pub mod alignment;
pub mod analyzer;
pub mod codec;
pub mod crop;
pub mod detector;
pub mod distance;
pub mod enroll;
pub mod error;
pub mod recognizer;
pub mod search;
pub mod store;
pub mod types;

use std::path::PathBuf;

pub use analyzer::{FaceAnalyzer, ModelInfo};
pub use codec::{CodecError, VectorCodec};
pub use detector::FaceDetector;
pub use distance::{DistancePolicy, DEFAULT_MATCH_THRESHOLD};
pub use enroll::{
    BatchEnrollment, CropSink, DetectionPreview, FaceOrder, Pipeline, PreviewCrop, SingleEnrollment, SkipReason,
    SkippedSlot,
};
pub use error::FaceMatchError;
pub use recognizer::FaceEmbedder;
pub use search::{SearchEngine, DEFAULT_TOP_K};
pub use store::{MemoryStore, RecordStore};
pub use types::{
    BoundingBox, EnrolledFace, Embedding, FaceId, MatchCandidate, MatchHistoryRecord, NewFace, NewMatchRecord,
    RemovedFace, StoreStats,
};

/// Dimension of the embeddings produced by the bundled ArcFace model.
pub const EMBEDDING_DIM: usize = recognizer::ARCFACE_EMBEDDING_DIM;

/// File name of the SCRFD detection model inside the model directory.
pub const SCRFD_MODEL_FILE: &str = "det_10g.onnx";
/// File name of the ArcFace recognition model inside the model directory.
pub const ARCFACE_MODEL_FILE: &str = "w600k_r50.onnx";

/// Default model directory: `$XDG_DATA_HOME/facematch/models`, falling back to
/// `/usr/share/facematch/models` when no home directory is known.
pub fn default_model_dir() -> PathBuf {
    if let Ok(data) = std::env::var("XDG_DATA_HOME") {
        return PathBuf::from(data).join("facematch/models");
    }
    match std::env::var("HOME") {
        Ok(home) => PathBuf::from(home).join(".local/share/facematch/models"),
        Err(_) => PathBuf::from("/usr/share/facematch/models"),
    }
}
