//! Record store contract and an in-memory implementation.

use crate::error::FaceMatchError;
use crate::types::{EnrolledFace, FaceId, MatchHistoryRecord, NewFace, NewMatchRecord, RemovedFace, StoreStats};
use chrono::Utc;
use std::sync::{Mutex, MutexGuard};

/// Durable storage for enrolled faces and match history.
///
/// `all()` must return faces in insertion order; search relies on it for
/// deterministic tie-breaking.
pub trait RecordStore: Send + Sync {
    /// Append a face. Rejects embeddings of the wrong dimension.
    fn append(&self, face: NewFace) -> Result<EnrolledFace, FaceMatchError>;

    /// Snapshot of every enrolled face, in insertion order.
    fn all(&self) -> Result<Vec<EnrolledFace>, FaceMatchError>;

    fn list(&self, offset: usize, limit: usize) -> Result<Vec<EnrolledFace>, FaceMatchError>;

    fn get(&self, id: FaceId) -> Result<Option<EnrolledFace>, FaceMatchError>;

    /// Replace a face's label and description. The embedding is never touched.
    fn update_metadata(
        &self,
        id: FaceId,
        label: &str,
        description: Option<&str>,
    ) -> Result<Option<EnrolledFace>, FaceMatchError>;

    /// Remove a face, returning its image reference so the caller can clean it up.
    ///
    /// Must succeed even when the stored embedding no longer decodes.
    fn delete(&self, id: FaceId) -> Result<Option<RemovedFace>, FaceMatchError>;

    fn append_match(&self, record: NewMatchRecord) -> Result<MatchHistoryRecord, FaceMatchError>;

    /// Match history, newest first.
    fn match_history(&self, offset: usize, limit: usize) -> Result<Vec<MatchHistoryRecord>, FaceMatchError>;

    fn stats(&self) -> Result<StoreStats, FaceMatchError>;
}

/// Validate and normalize a label: trimmed and non-empty.
pub fn normalize_label(label: &str) -> Result<String, FaceMatchError> {
    let trimmed = label.trim();
    if trimmed.is_empty() {
        return Err(FaceMatchError::InvalidArgument("label must not be empty".into()));
    }
    Ok(trimmed.to_string())
}

#[derive(Default)]
struct MemoryInner {
    faces: Vec<EnrolledFace>,
    history: Vec<MatchHistoryRecord>,
    next_face_id: FaceId,
    next_match_id: i64,
}

/// Process-local store. Ids start at 1 and increase with every append.
pub struct MemoryStore {
    dim: usize,
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            inner: Mutex::new(MemoryInner::default()),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryInner>, FaceMatchError> {
        self.inner
            .lock()
            .map_err(|_| FaceMatchError::Store("memory store mutex poisoned".into()))
    }
}

impl RecordStore for MemoryStore {
    fn append(&self, face: NewFace) -> Result<EnrolledFace, FaceMatchError> {
        if face.embedding.dim() != self.dim {
            return Err(FaceMatchError::DimensionMismatch {
                expected: self.dim,
                actual: face.embedding.dim(),
            });
        }
        let label = normalize_label(&face.label)?;

        let mut inner = self.lock()?;
        inner.next_face_id += 1;
        let record = EnrolledFace {
            id: inner.next_face_id,
            label,
            description: face.description,
            source_image: face.source_image,
            embedding: face.embedding,
            created_at: Utc::now(),
            updated_at: None,
        };
        inner.faces.push(record.clone());
        Ok(record)
    }

    fn all(&self) -> Result<Vec<EnrolledFace>, FaceMatchError> {
        Ok(self.lock()?.faces.clone())
    }

    fn list(&self, offset: usize, limit: usize) -> Result<Vec<EnrolledFace>, FaceMatchError> {
        Ok(self.lock()?.faces.iter().skip(offset).take(limit).cloned().collect())
    }

    fn get(&self, id: FaceId) -> Result<Option<EnrolledFace>, FaceMatchError> {
        Ok(self.lock()?.faces.iter().find(|f| f.id == id).cloned())
    }

    fn update_metadata(
        &self,
        id: FaceId,
        label: &str,
        description: Option<&str>,
    ) -> Result<Option<EnrolledFace>, FaceMatchError> {
        let label = normalize_label(label)?;
        let mut inner = self.lock()?;
        let Some(face) = inner.faces.iter_mut().find(|f| f.id == id) else {
            return Ok(None);
        };
        face.label = label;
        face.description = description.map(str::to_string);
        face.updated_at = Some(Utc::now());
        Ok(Some(face.clone()))
    }

    fn delete(&self, id: FaceId) -> Result<Option<RemovedFace>, FaceMatchError> {
        let mut inner = self.lock()?;
        let pos = inner.faces.iter().position(|f| f.id == id);
        Ok(pos.map(|p| {
            let face = inner.faces.remove(p);
            RemovedFace {
                id: face.id,
                label: face.label,
                source_image: face.source_image,
            }
        }))
    }

    fn append_match(&self, record: NewMatchRecord) -> Result<MatchHistoryRecord, FaceMatchError> {
        let mut inner = self.lock()?;
        inner.next_match_id += 1;
        let entry = MatchHistoryRecord {
            id: inner.next_match_id,
            query_image: record.query_image().to_string(),
            matched_face_id: record.matched_face_id(),
            distance: record.distance(),
            confidence: record.confidence(),
            created_at: Utc::now(),
        };
        inner.history.push(entry.clone());
        Ok(entry)
    }

    fn match_history(&self, offset: usize, limit: usize) -> Result<Vec<MatchHistoryRecord>, FaceMatchError> {
        Ok(self.lock()?.history.iter().rev().skip(offset).take(limit).cloned().collect())
    }

    fn stats(&self) -> Result<StoreStats, FaceMatchError> {
        let inner = self.lock()?;
        Ok(StoreStats {
            total_faces: inner.faces.len(),
            total_searches: inner.history.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Embedding, MatchCandidate};

    fn new_face(label: &str, values: Vec<f32>) -> NewFace {
        NewFace {
            label: label.into(),
            description: None,
            source_image: format!("{label}.jpg"),
            embedding: Embedding::new(values),
        }
    }

    #[test]
    fn test_append_assigns_increasing_ids() {
        let store = MemoryStore::new(2);
        let a = store.append(new_face("alice", vec![1.0, 0.0])).unwrap();
        let b = store.append(new_face("bob", vec![0.0, 1.0])).unwrap();
        assert!(b.id > a.id);
        let all = store.all().unwrap();
        assert_eq!(all.iter().map(|f| f.label.as_str()).collect::<Vec<_>>(), ["alice", "bob"]);
    }

    #[test]
    fn test_append_rejects_wrong_dimension() {
        let store = MemoryStore::new(3);
        let err = store.append(new_face("alice", vec![1.0, 0.0])).unwrap_err();
        assert!(matches!(err, FaceMatchError::DimensionMismatch { expected: 3, actual: 2 }));
        assert!(store.all().unwrap().is_empty());
    }

    #[test]
    fn test_append_rejects_blank_label() {
        let store = MemoryStore::new(1);
        assert!(matches!(
            store.append(new_face("   ", vec![1.0])),
            Err(FaceMatchError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_update_metadata_keeps_embedding() {
        let store = MemoryStore::new(2);
        let face = store.append(new_face("alice", vec![1.0, 0.0])).unwrap();
        let updated = store
            .update_metadata(face.id, " Alice Smith ", Some("badge 42"))
            .unwrap()
            .unwrap();
        assert_eq!(updated.label, "Alice Smith");
        assert_eq!(updated.description.as_deref(), Some("badge 42"));
        assert!(updated.updated_at.is_some());
        assert_eq!(updated.embedding, face.embedding);
        assert!(store.update_metadata(999, "x", None).unwrap().is_none());
    }

    #[test]
    fn test_delete_returns_removed() {
        let store = MemoryStore::new(1);
        let face = store.append(new_face("alice", vec![1.0])).unwrap();
        let removed = store.delete(face.id).unwrap().unwrap();
        assert_eq!(removed.source_image, "alice.jpg");
        assert_eq!(removed.label, "alice");
        assert!(store.delete(face.id).unwrap().is_none());
        assert_eq!(store.stats().unwrap().total_faces, 0);
    }

    #[test]
    fn test_list_pagination() {
        let store = MemoryStore::new(1);
        for i in 0..5 {
            store.append(new_face(&format!("p{i}"), vec![1.0])).unwrap();
        }
        let page = store.list(1, 2).unwrap();
        assert_eq!(page.iter().map(|f| f.label.as_str()).collect::<Vec<_>>(), ["p1", "p2"]);
    }

    #[test]
    fn test_match_history_newest_first() {
        let store = MemoryStore::new(1);
        let face = store.append(new_face("alice", vec![1.0])).unwrap();
        for (i, distance) in [0.1f32, 0.9].iter().enumerate() {
            let candidate = MatchCandidate {
                face: face.clone(),
                distance: *distance,
                confidence: (1.0 - distance) * 100.0,
                is_match: *distance < 0.5,
            };
            let record = NewMatchRecord::from_best(format!("q{i}.jpg"), &[candidate]).unwrap();
            store.append_match(record).unwrap();
        }
        let history = store.match_history(0, 10).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].query_image, "q1.jpg");
        assert_eq!(history[0].matched_face_id, None);
        assert_eq!(history[1].matched_face_id, Some(face.id));
        assert_eq!(store.stats().unwrap().total_searches, 2);
    }
}
