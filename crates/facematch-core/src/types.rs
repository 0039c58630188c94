use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Store-assigned identifier of an enrolled face. Increases with insertion order.
pub type FaceId = i64;

/// Face bounding box in absolute pixel coordinates, with the detector's confidence.
///
/// Edges follow the (top, right, bottom, left) convention; `right` and `bottom`
/// are exclusive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
    pub left: i32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl BoundingBox {
    pub fn new(top: i32, right: i32, bottom: i32, left: i32, confidence: f32) -> Self {
        Self {
            top,
            right,
            bottom,
            left,
            confidence,
            landmarks: None,
        }
    }

    pub fn width(&self) -> i32 {
        (self.right - self.left).max(0)
    }

    pub fn height(&self) -> i32 {
        (self.bottom - self.top).max(0)
    }

    pub fn area(&self) -> i64 {
        self.width() as i64 * self.height() as i64
    }
}

/// Face embedding vector (512-dimensional for ArcFace).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }
}

/// A face that has been enrolled under an identity label.
#[derive(Debug, Clone, Serialize)]
pub struct EnrolledFace {
    pub id: FaceId,
    pub label: String,
    pub description: Option<String>,
    /// Reference to the image the embedding came from. Owned by whoever saved it.
    pub source_image: String,
    #[serde(skip_serializing)]
    pub embedding: Embedding,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// What is left of a face after it has been deleted: enough to clean up its image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemovedFace {
    pub id: FaceId,
    pub label: String,
    pub source_image: String,
}

/// A face about to be appended to a record store.
#[derive(Debug, Clone)]
pub struct NewFace {
    pub label: String,
    pub description: Option<String>,
    pub source_image: String,
    pub embedding: Embedding,
}

/// One ranked search result.
#[derive(Debug, Clone, Serialize)]
pub struct MatchCandidate {
    pub face: EnrolledFace,
    /// Cosine distance to the query (lower = more similar).
    pub distance: f32,
    /// Display confidence in [0, 100].
    pub confidence: f32,
    pub is_match: bool,
}

/// Persisted audit entry for one search.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchHistoryRecord {
    pub id: i64,
    pub query_image: String,
    pub matched_face_id: Option<FaceId>,
    pub distance: f32,
    pub confidence: f32,
    pub created_at: DateTime<Utc>,
}

/// A match-history entry about to be appended.
///
/// Only constructible from a ranked candidate list, so `matched_face_id` is set
/// exactly when the best candidate was a match.
#[derive(Debug, Clone, PartialEq)]
pub struct NewMatchRecord {
    query_image: String,
    matched_face_id: Option<FaceId>,
    distance: f32,
    confidence: f32,
}

impl NewMatchRecord {
    /// Build the audit entry for the best (first) candidate, if any.
    pub fn from_best(query_image: impl Into<String>, candidates: &[MatchCandidate]) -> Option<Self> {
        let best = candidates.first()?;
        Some(Self {
            query_image: query_image.into(),
            matched_face_id: best.is_match.then_some(best.face.id),
            distance: best.distance,
            confidence: best.confidence,
        })
    }

    pub fn query_image(&self) -> &str {
        &self.query_image
    }

    pub fn matched_face_id(&self) -> Option<FaceId> {
        self.matched_face_id
    }

    pub fn distance(&self) -> f32 {
        self.distance
    }

    pub fn confidence(&self) -> f32 {
        self.confidence
    }
}

/// Record counts for status reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub total_faces: usize,
    pub total_searches: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(id: FaceId, distance: f32, is_match: bool) -> MatchCandidate {
        MatchCandidate {
            face: EnrolledFace {
                id,
                label: format!("face-{id}"),
                description: None,
                source_image: String::new(),
                embedding: Embedding::new(vec![1.0]),
                created_at: Utc::now(),
                updated_at: None,
            },
            distance,
            confidence: (1.0 - distance) * 100.0,
            is_match,
        }
    }

    #[test]
    fn test_bbox_dimensions() {
        let b = BoundingBox::new(10, 50, 40, 20, 0.9);
        assert_eq!(b.width(), 30);
        assert_eq!(b.height(), 30);
        assert_eq!(b.area(), 900);
    }

    #[test]
    fn test_bbox_inverted_edges_have_zero_size() {
        let b = BoundingBox::new(40, 10, 10, 20, 0.9);
        assert_eq!(b.width(), 0);
        assert_eq!(b.height(), 0);
        assert_eq!(b.area(), 0);
    }

    #[test]
    fn test_history_record_sets_match_only_for_matching_best() {
        let matched = NewMatchRecord::from_best("q.jpg", &[candidate(7, 0.2, true)]).unwrap();
        assert_eq!(matched.matched_face_id(), Some(7));
        assert_eq!(matched.query_image(), "q.jpg");

        let unmatched =
            NewMatchRecord::from_best("q.jpg", &[candidate(7, 0.9, false), candidate(8, 0.95, false)])
                .unwrap();
        assert_eq!(unmatched.matched_face_id(), None);
        assert!((unmatched.distance() - 0.9).abs() < 1e-6);
    }

    #[test]
    fn test_history_record_empty_candidates() {
        assert!(NewMatchRecord::from_best("q.jpg", &[]).is_none());
    }

    #[test]
    fn test_enrolled_face_json_omits_embedding() {
        let c = candidate(1, 0.1, true);
        let json = serde_json::to_value(&c.face).unwrap();
        assert!(json.get("embedding").is_none());
        assert_eq!(json["label"], "face-1");
    }
}
