//! Fixed binary layout for persisted embeddings.
//!
//! ```text
//! offset 0  u8   format version
//! offset 1  u8   reserved (0)
//! offset 2  u16  dimension (little-endian)
//! offset 4  f32  × dimension (little-endian)
//! ```
//!
//! The float payload must be exactly `dimension * 4` bytes. Anything else is
//! treated as store corruption.

use thiserror::Error;

const FORMAT_VERSION: u8 = 1;
const HEADER_LEN: usize = 4;
const ELEMENT_SIZE: usize = std::mem::size_of::<f32>();

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("blob of {len} bytes is shorter than the 4-byte header")]
    Truncated { len: usize },
    #[error("unsupported vector format version {0}")]
    UnsupportedVersion(u8),
    #[error("payload of {len} bytes is not a multiple of 4")]
    Misaligned { len: usize },
    #[error("payload holds {actual} elements but header declares {declared}")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("vector dimension {actual} does not match expected {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
}

/// Encoder/decoder bound to one system-wide vector dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VectorCodec {
    dim: usize,
}

impl VectorCodec {
    pub fn new(dim: usize) -> Self {
        Self { dim }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Size in bytes of an encoded vector.
    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.dim * ELEMENT_SIZE
    }

    pub fn encode(&self, values: &[f32]) -> Result<Vec<u8>, CodecError> {
        if values.len() != self.dim || self.dim > u16::MAX as usize {
            return Err(CodecError::DimensionMismatch {
                expected: self.dim,
                actual: values.len(),
            });
        }

        let mut out = Vec::with_capacity(self.encoded_len());
        out.push(FORMAT_VERSION);
        out.push(0);
        out.extend_from_slice(&(self.dim as u16).to_le_bytes());
        for v in values {
            out.extend_from_slice(&v.to_le_bytes());
        }
        Ok(out)
    }

    pub fn decode(&self, bytes: &[u8]) -> Result<Vec<f32>, CodecError> {
        if bytes.len() < HEADER_LEN {
            return Err(CodecError::Truncated { len: bytes.len() });
        }
        if bytes[0] != FORMAT_VERSION {
            return Err(CodecError::UnsupportedVersion(bytes[0]));
        }

        let declared = u16::from_le_bytes([bytes[2], bytes[3]]) as usize;
        let payload = &bytes[HEADER_LEN..];
        if payload.len() % ELEMENT_SIZE != 0 {
            return Err(CodecError::Misaligned { len: payload.len() });
        }
        let actual = payload.len() / ELEMENT_SIZE;
        if actual != declared {
            return Err(CodecError::LengthMismatch { declared, actual });
        }
        if declared != self.dim {
            return Err(CodecError::DimensionMismatch {
                expected: self.dim,
                actual: declared,
            });
        }

        Ok(payload
            .chunks_exact(ELEMENT_SIZE)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(dim: usize) -> Vec<f32> {
        (0..dim).map(|i| (i as f32 * 0.37).sin() / 3.0).collect()
    }

    #[test]
    fn test_roundtrip_512() {
        let codec = VectorCodec::new(512);
        let v = sample(512);
        let bytes = codec.encode(&v).unwrap();
        assert_eq!(bytes.len(), 4 + 512 * 4);
        let back = codec.decode(&bytes).unwrap();
        assert_eq!(back.len(), v.len());
        for (a, b) in v.iter().zip(back.iter()) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn test_roundtrip_is_byte_exact() {
        let codec = VectorCodec::new(3);
        let v = vec![f32::MIN_POSITIVE, -0.0, 1.0e-30];
        let back = codec.decode(&codec.encode(&v).unwrap()).unwrap();
        for (a, b) in v.iter().zip(back.iter()) {
            assert_eq!(a.to_bits(), b.to_bits());
        }
    }

    #[test]
    fn test_encode_rejects_wrong_dimension() {
        let codec = VectorCodec::new(4);
        assert_eq!(
            codec.encode(&[1.0, 2.0]),
            Err(CodecError::DimensionMismatch { expected: 4, actual: 2 })
        );
    }

    #[test]
    fn test_decode_truncated_header() {
        let codec = VectorCodec::new(4);
        assert_eq!(codec.decode(&[1, 0]), Err(CodecError::Truncated { len: 2 }));
    }

    #[test]
    fn test_decode_misaligned_payload() {
        let codec = VectorCodec::new(2);
        let mut bytes = codec.encode(&[1.0, 2.0]).unwrap();
        bytes.pop();
        assert_eq!(codec.decode(&bytes), Err(CodecError::Misaligned { len: 7 }));
    }

    #[test]
    fn test_decode_payload_disagrees_with_header() {
        let codec = VectorCodec::new(2);
        let mut bytes = codec.encode(&[1.0, 2.0]).unwrap();
        bytes.extend_from_slice(&3.0f32.to_le_bytes());
        assert_eq!(
            codec.decode(&bytes),
            Err(CodecError::LengthMismatch { declared: 2, actual: 3 })
        );
    }

    #[test]
    fn test_decode_wrong_system_dimension() {
        let bytes = VectorCodec::new(3).encode(&[1.0, 2.0, 3.0]).unwrap();
        assert_eq!(
            VectorCodec::new(512).decode(&bytes),
            Err(CodecError::DimensionMismatch { expected: 512, actual: 3 })
        );
    }

    #[test]
    fn test_decode_unknown_version() {
        let codec = VectorCodec::new(1);
        let mut bytes = codec.encode(&[1.0]).unwrap();
        bytes[0] = 9;
        assert_eq!(codec.decode(&bytes), Err(CodecError::UnsupportedVersion(9)));
    }
}
