//! Cosine distance and the match/confidence policy applied on top of it.

use crate::error::FaceMatchError;
use serde::Serialize;

/// Cosine distance threshold for ArcFace 512-D embeddings.
pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.68;

/// Cosine distance `1 - cos(a, b)`, clamped into [0, 2].
///
/// Both vectors must have the same, non-zero dimension. A zero-norm vector has
/// no direction and is treated as orthogonal to everything (distance 1).
pub fn cosine_distance(a: &[f32], b: &[f32]) -> Result<f32, FaceMatchError> {
    if a.len() != b.len() || a.is_empty() {
        return Err(FaceMatchError::DimensionMismatch {
            expected: a.len(),
            actual: b.len(),
        });
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    let similarity = if denom > 0.0 {
        (dot / denom).clamp(-1.0, 1.0)
    } else {
        0.0
    };
    Ok((1.0 - similarity).clamp(0.0, 2.0))
}

/// Outcome of comparing two embeddings under a [`DistancePolicy`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Comparison {
    pub distance: f32,
    pub confidence: f32,
    pub is_match: bool,
}

/// System-wide match decision: one threshold, never chosen per call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DistancePolicy {
    threshold: f32,
}

impl Default for DistancePolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MATCH_THRESHOLD)
    }
}

impl DistancePolicy {
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub fn distance(&self, a: &[f32], b: &[f32]) -> Result<f32, FaceMatchError> {
        cosine_distance(a, b)
    }

    /// Lower distance = more similar; equal to the threshold still matches.
    pub fn is_match(&self, distance: f32) -> bool {
        distance <= self.threshold
    }

    /// Display confidence in [0, 100]; 0 for every distance of 1 or more.
    pub fn confidence(&self, distance: f32) -> f32 {
        ((1.0 - distance) * 100.0).clamp(0.0, 100.0)
    }

    pub fn compare(&self, a: &[f32], b: &[f32]) -> Result<Comparison, FaceMatchError> {
        let distance = self.distance(a, b)?;
        Ok(Comparison {
            distance,
            confidence: self.confidence(distance),
            is_match: self.is_match(distance),
        })
    }
}
