use crate::codec::CodecError;
use crate::detector::DetectorError;
use crate::recognizer::RecognizerError;
use thiserror::Error;

/// Errors surfaced by the matching engine.
#[derive(Error, Debug)]
pub enum FaceMatchError {
    #[error("invalid image: {0}")]
    InvalidImage(String),
    #[error("no face detected")]
    NoFaceDetected,
    #[error("face count mismatch: {detected} faces detected but {provided} labels provided")]
    CountMismatch { detected: usize, provided: usize },
    #[error("crop {index} collapsed to zero area after clamping")]
    DegenerateCrop { index: usize },
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("corrupt embedding: {0}")]
    Codec(#[from] CodecError),
    #[error("adapter timed out")]
    AdapterTimeout,
    #[error("adapter failure: {0}")]
    AdapterFailure(String),
    #[error("store error: {0}")]
    Store(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("not found: {0}")]
    NotFound(String),
}

impl FaceMatchError {
    /// Whether the caller can fix the request and try again.
    ///
    /// Dimension and codec errors mean stored data has lost integrity and are
    /// never recoverable. Adapter timeouts and failures are transient: the caller
    /// may retry the whole call.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::InvalidImage(_)
                | Self::NoFaceDetected
                | Self::CountMismatch { .. }
                | Self::DegenerateCrop { .. }
                | Self::InvalidArgument(_)
                | Self::NotFound(_)
        )
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::AdapterTimeout | Self::AdapterFailure(_))
    }
}

impl From<DetectorError> for FaceMatchError {
    fn from(e: DetectorError) -> Self {
        Self::AdapterFailure(format!("detector: {e}"))
    }
}

impl From<RecognizerError> for FaceMatchError {
    fn from(e: RecognizerError) -> Self {
        Self::AdapterFailure(format!("recognizer: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_classification() {
        assert!(FaceMatchError::NoFaceDetected.is_recoverable());
        assert!(FaceMatchError::CountMismatch { detected: 3, provided: 2 }.is_recoverable());
        assert!(!FaceMatchError::DimensionMismatch { expected: 512, actual: 128 }.is_recoverable());
        assert!(!FaceMatchError::Codec(CodecError::Truncated { len: 2 }).is_recoverable());
        assert!(!FaceMatchError::AdapterTimeout.is_recoverable());
        assert!(FaceMatchError::AdapterTimeout.is_transient());
    }

    #[test]
    fn test_count_mismatch_message() {
        let e = FaceMatchError::CountMismatch { detected: 3, provided: 2 };
        assert_eq!(e.to_string(), "face count mismatch: 3 faces detected but 2 labels provided");
    }
}
