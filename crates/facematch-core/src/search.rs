//! Linear-scan similarity search over the enrolled set.
//!
//! Every query compares against every record (O(N)). There is no index; this
//! is accurate and fast enough for galleries in the tens of thousands.

use crate::distance::DistancePolicy;
use crate::error::FaceMatchError;
use crate::store::RecordStore;
use crate::types::{EnrolledFace, Embedding, MatchCandidate};

pub const DEFAULT_TOP_K: usize = 5;

/// Ranks enrolled faces against a query embedding. Stateless apart from the policy.
#[derive(Debug, Clone, Copy, Default)]
pub struct SearchEngine {
    policy: DistancePolicy,
}

impl SearchEngine {
    pub fn new(policy: DistancePolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &DistancePolicy {
        &self.policy
    }

    /// Rank `gallery` by ascending distance to `query` and keep the best `top_k`.
    ///
    /// Ties keep gallery order. `is_match` is decided per candidate, so the
    /// result may contain non-matching candidates. Any dimension mismatch fails
    /// the whole search.
    pub fn search(
        &self,
        query: &Embedding,
        gallery: &[EnrolledFace],
        top_k: usize,
    ) -> Result<Vec<MatchCandidate>, FaceMatchError> {
        if top_k == 0 {
            return Err(FaceMatchError::InvalidArgument("top_k must be at least 1".into()));
        }

        let mut scored = Vec::with_capacity(gallery.len());
        for face in gallery {
            let distance = self.policy.distance(&query.values, &face.embedding.values)?;
            scored.push((distance, face));
        }

        // Stable sort: equal distances stay in gallery (insertion) order.
        scored.sort_by(|a, b| a.0.total_cmp(&b.0));
        scored.truncate(top_k);

        let candidates: Vec<MatchCandidate> = scored
            .into_iter()
            .map(|(distance, face)| MatchCandidate {
                face: face.clone(),
                distance,
                confidence: self.policy.confidence(distance),
                is_match: self.policy.is_match(distance),
            })
            .collect();

        tracing::debug!(
            gallery = gallery.len(),
            returned = candidates.len(),
            best_distance = candidates.first().map(|c| c.distance),
            "search complete"
        );

        Ok(candidates)
    }

    /// Search a consistent snapshot of `store`.
    pub fn search_store(
        &self,
        store: &dyn RecordStore,
        query: &Embedding,
        top_k: usize,
    ) -> Result<Vec<MatchCandidate>, FaceMatchError> {
        let gallery = store.all()?;
        self.search(query, &gallery, top_k)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::types::NewFace;
    use chrono::Utc;

    fn face(id: i64, label: &str, values: Vec<f32>) -> EnrolledFace {
        EnrolledFace {
            id,
            label: label.into(),
            description: None,
            source_image: String::new(),
            embedding: Embedding::new(values),
            created_at: Utc::now(),
            updated_at: None,
        }
    }

    fn labels(c: &[MatchCandidate]) -> Vec<&str> {
        c.iter().map(|c| c.face.label.as_str()).collect()
    }

    #[test]
    fn test_search_sorted_by_distance() {
        let gallery = vec![
            face(1, "far", vec![0.0, 1.0, 0.0]),
            face(2, "exact", vec![1.0, 0.0, 0.0]),
            face(3, "near", vec![1.0, 0.3, 0.0]),
            face(4, "opposite", vec![-1.0, 0.0, 0.0]),
        ];
        let query = Embedding::new(vec![1.0, 0.0, 0.0]);
        let result = SearchEngine::default().search(&query, &gallery, 10).unwrap();

        assert_eq!(labels(&result), ["exact", "near", "far", "opposite"]);
        assert!(result.windows(2).all(|w| w[0].distance <= w[1].distance));
        assert!(result[0].is_match);
        assert!(!result[3].is_match);
        assert_eq!(result[3].confidence, 0.0);
    }

    #[test]
    fn test_search_ties_keep_insertion_order() {
        let gallery = vec![
            face(1, "first", vec![0.0, 1.0]),
            face(2, "second", vec![0.0, 2.0]),
            face(3, "best", vec![1.0, 0.0]),
            face(4, "third", vec![0.0, 3.0]),
        ];
        let query = Embedding::new(vec![1.0, 0.0]);
        let engine = SearchEngine::default();
        let result = engine.search(&query, &gallery, 4).unwrap();
        assert_eq!(labels(&result), ["best", "first", "second", "third"]);

        // Reproducible across repeated queries
        let again = engine.search(&query, &gallery, 4).unwrap();
        assert_eq!(labels(&result), labels(&again));
    }

    #[test]
    fn test_search_truncates_to_top_k() {
        let gallery: Vec<EnrolledFace> = (0..10)
            .map(|i| face(i, &format!("p{i}"), vec![1.0, i as f32]))
            .collect();
        let query = Embedding::new(vec![1.0, 0.0]);
        let engine = SearchEngine::default();

        assert_eq!(engine.search(&query, &gallery, 3).unwrap().len(), 3);
        assert_eq!(engine.search(&query, &gallery, 50).unwrap().len(), 10);
    }

    #[test]
    fn test_search_flags_matches_independently_of_top_k() {
        let gallery = vec![face(1, "other", vec![0.0, 1.0])];
        let query = Embedding::new(vec![1.0, 0.0]);
        let result = SearchEngine::default().search(&query, &gallery, 5).unwrap();
        assert_eq!(result.len(), 1);
        assert!(!result[0].is_match);
    }

    #[test]
    fn test_search_empty_gallery() {
        let query = Embedding::new(vec![1.0, 0.0]);
        assert!(SearchEngine::default().search(&query, &[], 5).unwrap().is_empty());
    }

    #[test]
    fn test_search_zero_top_k() {
        let query = Embedding::new(vec![1.0, 0.0]);
        assert!(matches!(
            SearchEngine::default().search(&query, &[], 0),
            Err(FaceMatchError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_search_dimension_mismatch_aborts() {
        let gallery = vec![
            face(1, "ok", vec![1.0, 0.0]),
            face(2, "corrupt", vec![1.0, 0.0, 0.0]),
        ];
        let query = Embedding::new(vec![1.0, 0.0]);
        let err = SearchEngine::default().search(&query, &gallery, 5).unwrap_err();
        assert!(matches!(err, FaceMatchError::DimensionMismatch { expected: 2, actual: 3 }));
    }

    #[test]
    fn test_search_store_snapshot() {
        let store = MemoryStore::new(2);
        for (label, v) in [("a", vec![0.0, 1.0]), ("b", vec![1.0, 0.1])] {
            store
                .append(NewFace {
                    label: label.into(),
                    description: None,
                    source_image: String::new(),
                    embedding: Embedding::new(v),
                })
                .unwrap();
        }
        let query = Embedding::new(vec![1.0, 0.0]);
        let result = SearchEngine::new(DistancePolicy::new(0.3))
            .search_store(&store, &query, 1)
            .unwrap();
        assert_eq!(labels(&result), ["b"]);
        assert!(result[0].is_match);
    }
}
