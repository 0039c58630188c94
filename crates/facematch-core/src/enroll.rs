//! Enrollment pipeline: detect → crop → embed → store.
//!
//! # Label correspondence
//!
//! Batch enrollment pairs the i-th label with the i-th detected face in
//! [`FaceOrder`]. The detector gives no ordering guarantee of its own, so the
//! order is fixed here and the boxes are handed back to the caller (see
//! [`Pipeline::preview`]) so a human can confirm the pairing before committing.
//! Only the counts are checked; spatial correspondence is the caller's call.

use crate::crop::{self, FaceCrop};
use crate::detector::FaceDetector;
use crate::error::FaceMatchError;
use crate::recognizer::FaceEmbedder;
use crate::store::{normalize_label, RecordStore};
use crate::types::{BoundingBox, EnrolledFace, Embedding, NewFace};
use image::RgbImage;
use serde::{Deserialize, Serialize};

/// Order in which detected faces are paired with supplied labels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FaceOrder {
    /// Detector output order (descending confidence).
    Detection,
    /// Left edge ascending, then top edge ascending.
    #[default]
    LeftToRight,
}

impl FaceOrder {
    pub fn apply(self, boxes: &mut [BoundingBox]) {
        if self == Self::LeftToRight {
            boxes.sort_by_key(|b| (b.left, b.top));
        }
    }
}

impl std::str::FromStr for FaceOrder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "detection" => Ok(Self::Detection),
            "left-to-right" | "ltr" => Ok(Self::LeftToRight),
            other => Err(format!("unknown face order '{other}' (expected detection or left-to-right)")),
        }
    }
}

/// Persists per-face crops produced during batch enrollment.
pub trait CropSink: Send + Sync {
    /// Store a crop and return an opaque reference to it.
    fn store_crop(&self, crop: &FaceCrop) -> Result<String, FaceMatchError>;

    /// Best-effort removal of a previously stored crop.
    fn discard(&self, reference: &str);
}

/// Request for enrolling one identity from one image.
#[derive(Debug, Clone)]
pub struct SingleEnrollment {
    pub source_image: String,
    pub label: String,
    pub description: Option<String>,
}

/// Why a batch slot was not enrolled.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "detail")]
pub enum SkipReason {
    DegenerateCrop,
    NoFaceDetected,
    AdapterFailure(String),
    /// Saving the crop or the record failed; the batch stopped here.
    StoreFailure(String),
    /// Never reached because an earlier slot stopped the batch.
    NotAttempted,
}

#[derive(Debug, Clone, Serialize)]
pub struct SkippedSlot {
    pub index: usize,
    pub label: String,
    pub reason: SkipReason,
}

/// Outcome of a batch enrollment. Enrolled slots are never rolled back.
///
/// Every submitted slot ends up in exactly one of `enrolled` or `skipped`.
#[derive(Debug, Clone, Serialize)]
pub struct BatchEnrollment {
    /// Number of labels submitted.
    pub submitted: usize,
    pub enrolled: Vec<EnrolledFace>,
    pub skipped: Vec<SkippedSlot>,
    /// Detected boxes in label order.
    pub boxes: Vec<BoundingBox>,
    /// Set when a store or sink error stopped the batch after some slots were enrolled.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aborted: Option<String>,
}

impl BatchEnrollment {
    pub fn enrolled_count(&self) -> usize {
        self.enrolled.len()
    }

    pub fn labels_enrolled(&self) -> Vec<String> {
        self.enrolled.iter().map(|f| f.label.clone()).collect()
    }

    pub fn is_complete(&self) -> bool {
        self.aborted.is_none()
    }

    fn skip(&mut self, index: usize, label: &str, reason: SkipReason) {
        self.skipped.push(SkippedSlot {
            index,
            label: label.to_string(),
            reason,
        });
    }
}

/// A saved crop of one detected face.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PreviewCrop {
    /// Position of the face in label order.
    pub index: usize,
    pub reference: String,
}

/// Detected faces in label order, with each crop saved for review.
#[derive(Debug, Clone, Serialize)]
pub struct DetectionPreview {
    pub num_faces: usize,
    pub boxes: Vec<BoundingBox>,
    pub crops: Vec<PreviewCrop>,
    /// Boxes whose crop collapsed to zero area.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub degenerate: Vec<usize>,
    /// Present when the image holds more than one face.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

/// Enrollment and query-embedding front end over an injected adapter bundle.
pub struct Pipeline<M> {
    adapter: M,
    order: FaceOrder,
}

impl<M: FaceDetector + FaceEmbedder> Pipeline<M> {
    pub fn new(adapter: M, order: FaceOrder) -> Self {
        Self { adapter, order }
    }

    pub fn order(&self) -> FaceOrder {
        self.order
    }

    /// Detect faces and return them in label order.
    pub fn detect(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, FaceMatchError> {
        let mut boxes = self.adapter.detect(image)?;
        self.order.apply(&mut boxes);
        Ok(boxes)
    }

    /// Detect faces, save a crop of each through `sink`, and report them in label order.
    ///
    /// If saving any crop fails, crops saved so far are discarded and the error returned.
    pub fn preview(&mut self, sink: &dyn CropSink, image: &RgbImage) -> Result<DetectionPreview, FaceMatchError> {
        let boxes = self.detect(image)?;
        let crops = crop::crop_faces(image, &boxes);

        let mut saved = Vec::with_capacity(crops.faces.len());
        for face_crop in &crops.faces {
            match sink.store_crop(face_crop) {
                Ok(reference) => saved.push(PreviewCrop {
                    index: face_crop.index,
                    reference,
                }),
                Err(e) => {
                    for crop in &saved {
                        sink.discard(&crop.reference);
                    }
                    return Err(e);
                }
            }
        }

        let warning = (boxes.len() > 1).then(|| {
            format!(
                "Multiple faces detected ({}). Enroll takes single-face images; \
                 use EnrollBatch with one label per face, in the order shown.",
                boxes.len()
            )
        });
        tracing::debug!(faces = boxes.len(), crops = saved.len(), "detection preview ready");
        Ok(DetectionPreview {
            num_faces: boxes.len(),
            boxes,
            crops: saved,
            degenerate: crops.degenerate,
            warning,
        })
    }

    /// Embed the most prominent face of an image.
    pub fn embed_query(&mut self, image: &RgbImage) -> Result<Embedding, FaceMatchError> {
        self.adapter.embed(image)?.ok_or(FaceMatchError::NoFaceDetected)
    }

    /// Enroll one identity from a whole image.
    ///
    /// On `NoFaceDetected` nothing is written; discarding the saved source image
    /// is up to the caller.
    pub fn enroll_single(
        &mut self,
        store: &dyn RecordStore,
        image: &RgbImage,
        request: SingleEnrollment,
    ) -> Result<EnrolledFace, FaceMatchError> {
        let label = normalize_label(&request.label)?;
        let embedding = self.embed_query(image)?;

        let face = store.append(NewFace {
            label,
            description: request.description.filter(|d| !d.trim().is_empty()),
            source_image: request.source_image,
            embedding,
        })?;

        tracing::info!(id = face.id, label = %face.label, "enrolled face");
        Ok(face)
    }

    /// Enroll one identity per detected face, pairing faces and labels by position.
    ///
    /// The count check happens before any write. After it passes, each slot
    /// succeeds or is skipped on its own. A store or sink error stops the batch:
    /// if nothing was enrolled yet it is returned as-is, otherwise the report
    /// comes back with `aborted` set and the remaining slots marked not attempted.
    pub fn enroll_batch(
        &mut self,
        store: &dyn RecordStore,
        sink: &dyn CropSink,
        image: &RgbImage,
        source_image: &str,
        labels: &[String],
    ) -> Result<BatchEnrollment, FaceMatchError> {
        let labels = labels
            .iter()
            .map(|l| normalize_label(l))
            .collect::<Result<Vec<_>, _>>()?;

        let boxes = self.detect(image)?;
        if boxes.is_empty() {
            return Err(FaceMatchError::NoFaceDetected);
        }
        if boxes.len() != labels.len() {
            return Err(FaceMatchError::CountMismatch {
                detected: boxes.len(),
                provided: labels.len(),
            });
        }

        let crops = crop::crop_faces(image, &boxes);
        let mut report = BatchEnrollment {
            submitted: labels.len(),
            enrolled: Vec::with_capacity(crops.faces.len()),
            skipped: crops
                .degenerate
                .iter()
                .map(|&index| SkippedSlot {
                    index,
                    label: labels[index].clone(),
                    reason: SkipReason::DegenerateCrop,
                })
                .collect(),
            boxes,
            aborted: None,
        };

        for (pos, face_crop) in crops.faces.iter().enumerate() {
            let label = &labels[face_crop.index];
            let embedding = match self.adapter.embed(&face_crop.image) {
                Ok(Some(embedding)) => embedding,
                Ok(None) => {
                    tracing::warn!(index = face_crop.index, %label, "no usable face in crop, skipping");
                    report.skip(face_crop.index, label, SkipReason::NoFaceDetected);
                    continue;
                }
                Err(e) => {
                    tracing::warn!(index = face_crop.index, %label, error = %e, "embedding failed, skipping");
                    report.skip(face_crop.index, label, SkipReason::AdapterFailure(e.to_string()));
                    continue;
                }
            };

            match persist_crop(store, sink, face_crop, label, embedding) {
                Ok(face) => report.enrolled.push(face),
                Err(e) if report.enrolled.is_empty() => return Err(e),
                Err(e) => {
                    tracing::error!(index = face_crop.index, %label, error = %e, "batch stopped, earlier slots kept");
                    report.skip(face_crop.index, label, SkipReason::StoreFailure(e.to_string()));
                    for rest in &crops.faces[pos + 1..] {
                        report.skip(rest.index, &labels[rest.index], SkipReason::NotAttempted);
                    }
                    report.aborted = Some(e.to_string());
                    break;
                }
            }
        }

        report.skipped.sort_by_key(|s| s.index);
        tracing::info!(
            source = source_image,
            submitted = report.submitted,
            enrolled = report.enrolled_count(),
            skipped = report.skipped.len(),
            complete = report.is_complete(),
            "batch enrollment finished"
        );
        Ok(report)
    }
}

/// Save one crop and append its record; the crop is discarded if the append fails.
fn persist_crop(
    store: &dyn RecordStore,
    sink: &dyn CropSink,
    face_crop: &FaceCrop,
    label: &str,
    embedding: Embedding,
) -> Result<EnrolledFace, FaceMatchError> {
    let crop_ref = sink.store_crop(face_crop)?;
    store
        .append(NewFace {
            label: label.to_string(),
            description: Some(format!("Auto-added from batch (face #{})", face_crop.index + 1)),
            source_image: crop_ref.clone(),
            embedding,
        })
        .inspect_err(|_| sink.discard(&crop_ref))
}
