use facematch_core::types::{EnrolledFace, Embedding};
use facematch_core::{
    BatchEnrollment, CropSink, DetectionPreview, FaceDetector, FaceEmbedder, FaceMatchError, FaceOrder, Pipeline,
    RecordStore, SingleEnrollment,
};
use image::RgbImage;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Pipeline(#[from] FaceMatchError),
    #[error("engine request timed out after {0:?}")]
    TimedOut(Duration),
    #[error("engine thread exited")]
    ChannelClosed,
}

impl From<EngineError> for FaceMatchError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::Pipeline(inner) => inner,
            EngineError::TimedOut(_) => FaceMatchError::AdapterTimeout,
            EngineError::ChannelClosed => FaceMatchError::AdapterFailure("engine thread exited".into()),
        }
    }
}

type Reply<T> = oneshot::Sender<Result<T, FaceMatchError>>;

/// Messages sent from D-Bus handlers to the engine thread.
enum EngineRequest {
    Preview {
        image: RgbImage,
        reply: Reply<DetectionPreview>,
    },
    Embed {
        image: RgbImage,
        reply: Reply<Embedding>,
    },
    EnrollSingle {
        image: RgbImage,
        request: SingleEnrollment,
        reply: Reply<EnrolledFace>,
    },
    EnrollBatch {
        image: RgbImage,
        source_image: String,
        labels: Vec<String>,
        reply: Reply<BatchEnrollment>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    timeout: Duration,
}

impl EngineHandle {
    /// Detect faces in label order and save a crop of each.
    pub async fn preview(&self, image: RgbImage) -> Result<DetectionPreview, EngineError> {
        self.call(|reply| EngineRequest::Preview { image, reply }).await
    }

    /// Embed the most prominent face of a query image.
    pub async fn embed(&self, image: RgbImage) -> Result<Embedding, EngineError> {
        self.call(|reply| EngineRequest::Embed { image, reply }).await
    }

    /// Enroll one identity from a whole image.
    pub async fn enroll_single(&self, image: RgbImage, request: SingleEnrollment) -> Result<EnrolledFace, EngineError> {
        self.call(|reply| EngineRequest::EnrollSingle { image, request, reply })
            .await
    }

    /// Enroll one identity per detected face, paired with `labels` by position.
    pub async fn enroll_batch(
        &self,
        image: RgbImage,
        source_image: String,
        labels: Vec<String>,
    ) -> Result<BatchEnrollment, EngineError> {
        self.call(|reply| EngineRequest::EnrollBatch {
            image,
            source_image,
            labels,
            reply,
        })
        .await
    }

    /// Send a request and wait for its reply, bounded by the adapter timeout.
    ///
    /// On timeout the reply receiver is dropped; the engine notices when it
    /// tries to answer and undoes any enrollment writes or saved crops. A reply
    /// sent just before the drop is lost without being undone.
    async fn call<T>(&self, make: impl FnOnce(Reply<T>) -> EngineRequest) -> Result<T, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let exchange = async {
            self.tx
                .send(make(reply_tx))
                .await
                .map_err(|_| EngineError::ChannelClosed)?;
            reply_rx.await.map_err(|_| EngineError::ChannelClosed)
        };

        match tokio::time::timeout(self.timeout, exchange).await {
            Ok(result) => Ok(result??),
            Err(_) => {
                tracing::warn!(timeout = ?self.timeout, "engine request timed out");
                Err(EngineError::TimedOut(self.timeout))
            }
        }
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// The adapter is moved onto the thread and only ever touched there, so
/// every detection and embedding call is serialized.
pub fn spawn_engine<M>(
    adapter: M,
    order: FaceOrder,
    store: Arc<dyn RecordStore>,
    sink: Arc<dyn CropSink>,
    timeout: Duration,
) -> std::io::Result<EngineHandle>
where
    M: FaceDetector + FaceEmbedder + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);
    let mut pipeline = Pipeline::new(adapter, order);

    std::thread::Builder::new()
        .name("facematch-engine".into())
        .spawn(move || {
            tracing::info!(?order, "engine thread started");
            while let Some(req) = rx.blocking_recv() {
                handle_request(&mut pipeline, store.as_ref(), sink.as_ref(), req);
            }
            tracing::info!("engine thread exiting");
        })?;

    Ok(EngineHandle { tx, timeout })
}

fn handle_request<M: FaceDetector + FaceEmbedder>(
    pipeline: &mut Pipeline<M>,
    store: &dyn RecordStore,
    sink: &dyn CropSink,
    req: EngineRequest,
) {
    match req {
        EngineRequest::Preview { image, reply } => {
            if let Err(Ok(preview)) = reply.send(pipeline.preview(sink, &image)) {
                tracing::warn!(crops = preview.crops.len(), "requester gone, discarding preview crops");
                for crop in &preview.crops {
                    sink.discard(&crop.reference);
                }
            }
        }
        EngineRequest::Embed { image, reply } => {
            let _ = reply.send(pipeline.embed_query(&image));
        }
        EngineRequest::EnrollSingle { image, request, reply } => {
            let result = pipeline.enroll_single(store, &image, request);
            if let Err(Ok(face)) = reply.send(result) {
                tracing::warn!(id = face.id, "requester gone, rolling back enrollment");
                rollback(store, sink, std::slice::from_ref(&face), false);
            }
        }
        EngineRequest::EnrollBatch {
            image,
            source_image,
            labels,
            reply,
        } => {
            let result = pipeline.enroll_batch(store, sink, &image, &source_image, &labels);
            if let Err(Ok(report)) = reply.send(result) {
                tracing::warn!(
                    enrolled = report.enrolled_count(),
                    "requester gone, rolling back batch enrollment"
                );
                rollback(store, sink, &report.enrolled, true);
            }
        }
    }
}

/// Undo enrollment writes whose result nobody received.
fn rollback(store: &dyn RecordStore, sink: &dyn CropSink, faces: &[EnrolledFace], owns_images: bool) {
    for face in faces {
        if let Err(e) = store.delete(face.id) {
            tracing::error!(id = face.id, error = %e, "rollback: failed to delete record");
        }
        if owns_images {
            sink.discard(&face.source_image);
        }
    }
}
