use crate::engine::EngineHandle;
use crate::images::ImageStore;
use facematch_core::types::{FaceId, NewMatchRecord};
use facematch_core::{FaceMatchError, FaceOrder, ModelInfo, RecordStore, SearchEngine, SingleEnrollment};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use zbus::interface;

const DEFAULT_PAGE_SIZE: usize = 100;
const MAX_PAGE_SIZE: usize = 1000;

/// D-Bus interface for the facematch daemon.
///
/// Bus name: org.facematch.FaceMatch1
/// Object path: /org/facematch/FaceMatch1
pub struct FaceMatchService {
    engine: EngineHandle,
    store: Arc<dyn RecordStore>,
    images: Arc<ImageStore>,
    search: SearchEngine,
    default_top_k: usize,
    face_order: FaceOrder,
    models: ModelInfo,
}

impl FaceMatchService {
    pub fn new(
        engine: EngineHandle,
        store: Arc<dyn RecordStore>,
        images: Arc<ImageStore>,
        search: SearchEngine,
        default_top_k: usize,
        face_order: FaceOrder,
        models: ModelInfo,
    ) -> Self {
        Self {
            engine,
            store,
            images,
            search,
            default_top_k,
            face_order,
            models,
        }
    }
}

#[interface(name = "org.facematch.FaceMatch1")]
impl FaceMatchService {
    /// Enroll the most prominent face of an image under `label`.
    async fn enroll(&self, image_path: &str, label: &str, description: &str) -> zbus::fdo::Result<String> {
        tracing::info!(image_path, label, "enroll requested");
        let path = request_path(image_path)?;
        let images = self.images.clone();
        let (saved, image) = blocking(move || {
            let image = images.load(&path)?;
            let saved = images.save_upload(&path)?;
            Ok((saved, image))
        })
        .await
        .map_err(to_fdo)?;

        let request = SingleEnrollment {
            source_image: saved.to_string_lossy().into_owned(),
            label: label.to_string(),
            description: Some(description.to_string()),
        };
        match self.engine.enroll_single(image, request).await {
            Ok(face) => to_json(&face),
            Err(e) => {
                let e = FaceMatchError::from(e);
                // A timed-out enrollment may still have been committed.
                if matches!(e, FaceMatchError::AdapterTimeout) {
                    self.discard_upload_unless_enrolled(saved).await;
                } else {
                    self.discard_upload(saved).await;
                }
                Err(to_fdo(e))
            }
        }
    }

    /// Enroll every face in a group photo, pairing faces with `labels` by position.
    async fn enroll_batch(&self, image_path: &str, labels: Vec<String>) -> zbus::fdo::Result<String> {
        tracing::info!(image_path, labels = labels.len(), "enroll_batch requested");
        let path = request_path(image_path)?;
        let images = self.images.clone();
        let load_path = path.clone();
        let image = blocking(move || images.load(&load_path)).await.map_err(to_fdo)?;

        let report = self
            .engine
            .enroll_batch(image, path.to_string_lossy().into_owned(), labels)
            .await
            .map_err(|e| to_fdo(e.into()))?;
        to_json(&report)
    }

    /// Detect faces in label order and save a crop of each, so a batch can be
    /// confirmed before enrolling. Warns when the image holds more than one face.
    async fn detect(&self, image_path: &str) -> zbus::fdo::Result<String> {
        tracing::info!(image_path, "detect requested");
        let path = request_path(image_path)?;
        let images = self.images.clone();
        let image = blocking(move || images.load(&path)).await.map_err(to_fdo)?;
        let preview = self.engine.preview(image).await.map_err(|e| to_fdo(e.into()))?;
        to_json(&preview)
    }

    /// Rank enrolled faces against the face in an image. `top_k == 0` uses the default.
    async fn search(&self, image_path: &str, top_k: u32) -> zbus::fdo::Result<String> {
        let top_k = match top_k {
            0 => self.default_top_k,
            k => k as usize,
        };
        tracing::info!(image_path, top_k, "search requested");
        let path = request_path(image_path)?;
        let images = self.images.clone();
        let (saved, image) = blocking(move || {
            let image = images.load(&path)?;
            let saved = images.save_upload(&path)?;
            Ok((saved, image))
        })
        .await
        .map_err(to_fdo)?;

        let query = match self.engine.embed(image).await {
            Ok(query) => query,
            Err(e) => {
                self.discard_upload(saved).await;
                return Err(to_fdo(e.into()));
            }
        };

        let store = self.store.clone();
        let search = self.search;
        let query_image = saved.to_string_lossy().into_owned();
        let outcome = blocking(move || {
            let candidates = search.search_store(store.as_ref(), &query, top_k)?;
            let recorded = match NewMatchRecord::from_best(query_image.clone(), &candidates) {
                Some(record) => Some(store.append_match(record)?),
                None => None,
            };
            Ok(SearchReply {
                query_image,
                recorded: recorded.is_some(),
                candidates,
            })
        })
        .await;

        match outcome {
            Ok(reply) => {
                if !reply.recorded {
                    self.discard_upload(saved).await;
                }
                tracing::info!(
                    results = reply.candidates.len(),
                    matched = reply.candidates.first().is_some_and(|c| c.is_match),
                    "search complete"
                );
                to_json(&reply)
            }
            Err(e) => {
                self.discard_upload(saved).await;
                Err(to_fdo(e))
            }
        }
    }

    /// Enrolled faces in insertion order. `limit == 0` uses the default page size.
    async fn list_faces(&self, offset: u32, limit: u32) -> zbus::fdo::Result<String> {
        let store = self.store.clone();
        let limit = page_size(limit);
        let faces = blocking(move || store.list(offset as usize, limit))
            .await
            .map_err(to_fdo)?;
        to_json(&faces)
    }

    async fn get_face(&self, id: i64) -> zbus::fdo::Result<String> {
        let store = self.store.clone();
        let face = blocking(move || store.get(id)?.ok_or_else(|| not_found(id)))
            .await
            .map_err(to_fdo)?;
        to_json(&face)
    }

    /// Replace a face's label and description ("" clears it).
    async fn update_face(&self, id: i64, label: &str, description: &str) -> zbus::fdo::Result<String> {
        tracing::info!(id, label, "update_face requested");
        let store = self.store.clone();
        let label = label.to_string();
        let description = non_empty(description);
        let face = blocking(move || {
            store
                .update_metadata(id, &label, description.as_deref())?
                .ok_or_else(|| not_found(id))
        })
        .await
        .map_err(to_fdo)?;
        to_json(&face)
    }

    /// Remove a face and its saved image. Returns false if no such face exists.
    async fn remove_face(&self, id: i64) -> zbus::fdo::Result<bool> {
        tracing::info!(id, "remove_face requested");
        let store = self.store.clone();
        let images = self.images.clone();
        blocking(move || {
            let Some(face) = store.delete(id)? else {
                return Ok(false);
            };
            images.remove(Path::new(&face.source_image));
            Ok(true)
        })
        .await
        .map_err(to_fdo)
    }

    /// Match history, newest first.
    async fn match_history(&self, offset: u32, limit: u32) -> zbus::fdo::Result<String> {
        let store = self.store.clone();
        let limit = page_size(limit);
        let history = blocking(move || store.match_history(offset as usize, limit))
            .await
            .map_err(to_fdo)?;
        to_json(&history)
    }

    async fn stats(&self) -> zbus::fdo::Result<String> {
        let store = self.store.clone();
        let stats = blocking(move || store.stats()).await.map_err(to_fdo)?;
        to_json(&stats)
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let store = self.store.clone();
        let stats = blocking(move || store.stats()).await.map_err(to_fdo)?;
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "models": self.models,
            "match_threshold": self.search.policy().threshold(),
            "default_top_k": self.default_top_k,
            "face_order": self.face_order,
            "total_faces": stats.total_faces,
        })
        .to_string())
    }
}

impl FaceMatchService {
    async fn discard_upload(&self, path: PathBuf) {
        let images = self.images.clone();
        let _ = tokio::task::spawn_blocking(move || images.remove(&path)).await;
    }

    /// Remove an upload unless an enrolled face still points at it.
    async fn discard_upload_unless_enrolled(&self, path: PathBuf) {
        let store = self.store.clone();
        let images = self.images.clone();
        let _ = tokio::task::spawn_blocking(move || {
            let reference = path.to_string_lossy();
            match store.all() {
                Ok(faces) if faces.iter().any(|f| f.source_image == reference) => {
                    tracing::warn!(path = %path.display(), "upload is referenced by an enrolled face, keeping it");
                }
                Ok(_) => images.remove(&path),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "cannot check upload references, keeping it");
                }
            }
        })
        .await;
    }
}

#[derive(Serialize)]
struct SearchReply {
    query_image: String,
    #[serde(skip)]
    recorded: bool,
    candidates: Vec<facematch_core::MatchCandidate>,
}

/// Run a store or filesystem operation off the async executor.
async fn blocking<T, F>(f: F) -> Result<T, FaceMatchError>
where
    F: FnOnce() -> Result<T, FaceMatchError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| FaceMatchError::Store(format!("blocking task failed: {e}")))?
}

/// Image paths must be absolute; the daemon's working directory is not the caller's.
fn request_path(raw: &str) -> zbus::fdo::Result<PathBuf> {
    let path = PathBuf::from(raw);
    if !path.is_absolute() {
        return Err(to_fdo(FaceMatchError::InvalidArgument(format!(
            "image path must be absolute: {raw}"
        ))));
    }
    Ok(path)
}

fn page_size(limit: u32) -> usize {
    match limit {
        0 => DEFAULT_PAGE_SIZE,
        n => (n as usize).min(MAX_PAGE_SIZE),
    }
}

fn non_empty(s: &str) -> Option<String> {
    let trimmed = s.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn not_found(id: FaceId) -> FaceMatchError {
    FaceMatchError::NotFound(format!("face {id}"))
}

fn to_json<T: Serialize>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| zbus::fdo::Error::Failed(format!("serialize reply: {e}")))
}

/// Map engine errors onto standard D-Bus error names.
pub fn to_fdo(e: FaceMatchError) -> zbus::fdo::Error {
    let msg = e.to_string();
    match e {
        FaceMatchError::NotFound(_) => zbus::fdo::Error::FileNotFound(msg),
        FaceMatchError::AdapterTimeout => zbus::fdo::Error::TimedOut(msg),
        e if e.is_recoverable() => zbus::fdo::Error::InvalidArgs(msg),
        _ => {
            tracing::error!(error = %msg, "request failed");
            zbus::fdo::Error::Failed(msg)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::spawn_engine;
    use facematch_core::detector::DetectorError;
    use facematch_core::recognizer::RecognizerError;
    use facematch_core::types::{BoundingBox, Embedding, NewFace};
    use facematch_core::{FaceAnalyzer, FaceDetector, FaceEmbedder, MemoryStore};
    use image::{Rgb, RgbImage};
    use std::time::Duration;

    /// Two side-by-side faces; embedding is the first pixel, black means no face.
    struct FakeAdapter;

    impl FaceDetector for FakeAdapter {
        fn detect(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError> {
            let half = (image.width() / 2) as i32;
            let h = image.height() as i32;
            Ok(vec![BoundingBox::new(0, 2 * half, h, half, 0.95), BoundingBox::new(0, half, h, 0, 0.9)])
        }
    }

    impl FaceEmbedder for FakeAdapter {
        fn embed(&mut self, image: &RgbImage) -> Result<Option<Embedding>, RecognizerError> {
            let p = image.get_pixel(0, 0);
            if p.0 == [0, 0, 0] {
                return Ok(None);
            }
            Ok(Some(Embedding::new(vec![p[0] as f32, p[1] as f32])))
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        root: PathBuf,
        service: FaceMatchService,
        store: Arc<MemoryStore>,
        images: Arc<ImageStore>,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let store = Arc::new(MemoryStore::new(2));
        let images = Arc::new(ImageStore::new(root.join("uploads"), 1024 * 1024, vec!["png".into()]).unwrap());
        let engine = spawn_engine(
            FakeAdapter,
            FaceOrder::LeftToRight,
            store.clone(),
            images.clone(),
            Duration::from_secs(5),
        )
        .unwrap();
        let service = FaceMatchService::new(
            engine,
            store.clone(),
            images.clone(),
            SearchEngine::default(),
            5,
            FaceOrder::LeftToRight,
            FaceAnalyzer::info(),
        );
        Fixture {
            _dir: dir,
            root,
            service,
            store,
            images,
        }
    }

    fn write_png(path: &Path, image: RgbImage) -> String {
        image.save(path).unwrap();
        path.to_string_lossy().into_owned()
    }

    fn uploads(images: &ImageStore) -> Vec<PathBuf> {
        let mut files: Vec<PathBuf> = std::fs::read_dir(images.upload_dir())
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect();
        files.sort();
        files
    }

    fn face_at(source_image: &str, values: Vec<f32>) -> NewFace {
        NewFace {
            label: "alice".into(),
            description: None,
            source_image: source_image.into(),
            embedding: Embedding::new(values),
        }
    }

    #[tokio::test]
    async fn test_search_without_candidates_records_nothing() {
        let fx = fixture();
        let query = write_png(&fx.root.join("query.png"), RgbImage::from_pixel(8, 8, Rgb([3, 4, 0])));

        let reply: serde_json::Value = serde_json::from_str(&fx.service.search(&query, 0).await.unwrap()).unwrap();
        assert!(reply["candidates"].as_array().unwrap().is_empty());
        assert!(fx.store.match_history(0, 10).unwrap().is_empty());
        assert_eq!(fx.store.stats().unwrap().total_searches, 0);
        assert!(uploads(&fx.images).is_empty());
    }

    #[tokio::test]
    async fn test_search_with_candidate_records_history_and_keeps_upload() {
        let fx = fixture();
        fx.store.append(face_at("/enrolled/alice.png", vec![3.0, 4.0])).unwrap();
        let query = write_png(&fx.root.join("query.png"), RgbImage::from_pixel(8, 8, Rgb([3, 4, 0])));

        let reply: serde_json::Value = serde_json::from_str(&fx.service.search(&query, 0).await.unwrap()).unwrap();
        assert_eq!(reply["candidates"][0]["face"]["label"], "alice");
        assert_eq!(reply["candidates"][0]["is_match"], true);

        let history = fx.store.match_history(0, 10).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].query_image, reply["query_image"].as_str().unwrap());
        assert_eq!(uploads(&fx.images), [PathBuf::from(&history[0].query_image)]);
    }

    #[tokio::test]
    async fn test_search_no_face_discards_upload() {
        let fx = fixture();
        let query = write_png(&fx.root.join("blank.png"), RgbImage::new(8, 8));
        let err = fx.service.search(&query, 0).await.unwrap_err();
        assert!(matches!(err, zbus::fdo::Error::InvalidArgs(_)));
        assert!(uploads(&fx.images).is_empty());
    }

    #[tokio::test]
    async fn test_detect_returns_saved_crops_and_warning() {
        let fx = fixture();
        let group = RgbImage::from_fn(20, 10, |x, _| if x < 10 { Rgb([1, 2, 0]) } else { Rgb([3, 4, 0]) });
        let path = write_png(&fx.root.join("group.png"), group);

        let reply: serde_json::Value = serde_json::from_str(&fx.service.detect(&path).await.unwrap()).unwrap();
        assert_eq!(reply["num_faces"], 2);
        assert_eq!(reply["boxes"][0]["left"], 0);
        assert!(reply["warning"].as_str().unwrap().contains("Multiple faces detected (2)"));

        let crops = reply["crops"].as_array().unwrap();
        assert_eq!(crops.len(), 2);
        for crop in crops {
            let reference = PathBuf::from(crop["reference"].as_str().unwrap());
            assert!(reference.starts_with(fx.images.upload_dir()));
            assert!(reference.exists());
        }
        assert!(fx.store.all().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_discard_keeps_upload_referenced_by_enrolled_face() {
        let fx = fixture();
        let source = write_png(&fx.root.join("alice.png"), RgbImage::from_pixel(8, 8, Rgb([3, 4, 0])));
        let kept = fx.images.save_upload(Path::new(&source)).unwrap();
        let orphan = fx.images.save_upload(Path::new(&source)).unwrap();
        fx.store.append(face_at(&kept.to_string_lossy(), vec![3.0, 4.0])).unwrap();

        fx.service.discard_upload_unless_enrolled(kept.clone()).await;
        fx.service.discard_upload_unless_enrolled(orphan.clone()).await;

        assert!(kept.exists());
        assert!(!orphan.exists());
    }

    #[test]
    fn test_error_mapping() {
        assert!(matches!(
            to_fdo(FaceMatchError::CountMismatch { detected: 3, provided: 2 }),
            zbus::fdo::Error::InvalidArgs(_)
        ));
        assert!(matches!(
            to_fdo(FaceMatchError::NoFaceDetected),
            zbus::fdo::Error::InvalidArgs(_)
        ));
        assert!(matches!(
            to_fdo(FaceMatchError::NotFound("face 7".into())),
            zbus::fdo::Error::FileNotFound(_)
        ));
        assert!(matches!(to_fdo(FaceMatchError::AdapterTimeout), zbus::fdo::Error::TimedOut(_)));
        assert!(matches!(
            to_fdo(FaceMatchError::DimensionMismatch { expected: 512, actual: 3 }),
            zbus::fdo::Error::Failed(_)
        ));
    }

    #[test]
    fn test_request_path_must_be_absolute() {
        assert!(request_path("/tmp/face.jpg").is_ok());
        assert!(matches!(request_path("face.jpg"), Err(zbus::fdo::Error::InvalidArgs(_))));
    }

    #[test]
    fn test_page_size() {
        assert_eq!(page_size(0), DEFAULT_PAGE_SIZE);
        assert_eq!(page_size(10), 10);
        assert_eq!(page_size(1_000_000), MAX_PAGE_SIZE);
    }

    #[test]
    fn test_non_empty() {
        assert_eq!(non_empty("  "), None);
        assert_eq!(non_empty(" badge 42 ").as_deref(), Some("badge 42"));
    }
}
