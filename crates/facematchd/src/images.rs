//! Saved uploads and batch crops on disk.

use crate::config::Config;
use facematch_core::crop::FaceCrop;
use facematch_core::{CropSink, FaceMatchError};
use image::{ImageFormat, RgbImage};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Validates incoming images and owns the upload directory.
pub struct ImageStore {
    upload_dir: PathBuf,
    max_bytes: u64,
    allowed_extensions: Vec<String>,
}

impl ImageStore {
    pub fn new(upload_dir: PathBuf, max_bytes: u64, allowed_extensions: Vec<String>) -> Result<Self, FaceMatchError> {
        std::fs::create_dir_all(&upload_dir)
            .map_err(|e| FaceMatchError::Store(format!("create {}: {e}", upload_dir.display())))?;
        Ok(Self {
            upload_dir,
            max_bytes,
            allowed_extensions,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self, FaceMatchError> {
        Self::new(
            config.upload_dir.clone(),
            config.max_image_bytes,
            config.allowed_extensions.clone(),
        )
    }

    pub fn upload_dir(&self) -> &Path {
        &self.upload_dir
    }

    /// Check existence, extension and size. Returns the lowercase extension.
    pub fn validate(&self, path: &Path) -> Result<String, FaceMatchError> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        if !self.allowed_extensions.iter().any(|a| *a == ext) {
            return Err(FaceMatchError::InvalidImage(format!(
                "{}: extension not allowed (allowed: {})",
                path.display(),
                self.allowed_extensions.join(", ")
            )));
        }

        let meta = std::fs::metadata(path)
            .map_err(|e| FaceMatchError::InvalidImage(format!("{}: {e}", path.display())))?;
        if !meta.is_file() {
            return Err(FaceMatchError::InvalidImage(format!("{}: not a regular file", path.display())));
        }
        if meta.len() > self.max_bytes {
            return Err(FaceMatchError::InvalidImage(format!(
                "{}: {} bytes exceeds the {} byte limit",
                path.display(),
                meta.len(),
                self.max_bytes
            )));
        }
        Ok(ext)
    }

    /// Validate and decode an image into RGB.
    pub fn load(&self, path: &Path) -> Result<RgbImage, FaceMatchError> {
        self.validate(path)?;
        let img = image::open(path)
            .map_err(|e| FaceMatchError::InvalidImage(format!("{}: {e}", path.display())))?;
        Ok(img.to_rgb8())
    }

    /// Copy a validated image into the upload directory under a fresh UUID name.
    pub fn save_upload(&self, path: &Path) -> Result<PathBuf, FaceMatchError> {
        let ext = self.validate(path)?;
        let dest = self.upload_dir.join(format!("{}.{ext}", Uuid::new_v4()));
        std::fs::copy(path, &dest)
            .map_err(|e| FaceMatchError::Store(format!("save upload {}: {e}", dest.display())))?;
        tracing::debug!(src = %path.display(), dest = %dest.display(), "upload saved");
        Ok(dest)
    }

    /// Best-effort removal. Only files inside the upload directory are touched.
    pub fn remove(&self, path: &Path) {
        if !path.starts_with(&self.upload_dir) {
            tracing::debug!(path = %path.display(), "not an upload, leaving in place");
            return;
        }
        if let Err(e) = std::fs::remove_file(path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %path.display(), error = %e, "failed to remove image");
            }
        }
    }
}

impl CropSink for ImageStore {
    fn store_crop(&self, crop: &FaceCrop) -> Result<String, FaceMatchError> {
        let dest = self
            .upload_dir
            .join(format!("{}_face_{}.jpg", Uuid::new_v4(), crop.index));
        crop.image
            .save_with_format(&dest, ImageFormat::Jpeg)
            .map_err(|e| FaceMatchError::Store(format!("save crop {}: {e}", dest.display())))?;
        Ok(dest.to_string_lossy().into_owned())
    }

    fn discard(&self, reference: &str) {
        self.remove(Path::new(reference));
    }
}
