//! Upload acceptance policy and the upload pipeline.
//!
//! Files are checked against the policy before they ever reach the
//! pipeline.  Accepted selections are debounced, emptied selections are
//! dropped, and the surviving batch is written to the store in one call.

use aid_proto::config::{PipelineConfig, UploadConfig};
use aid_proto::store::{ImageId, NewImage, Store, StoreError};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info};

use crate::pipeline::{Pipeline, PipelineError};

/// A picked file: the picker's metadata plus the raw payload.
#[derive(Clone, PartialEq, Eq)]
pub struct UploadFile {
    pub name: String,
    pub mime: String,
    pub size: u64,
    pub bytes: Vec<u8>,
}

impl UploadFile {
    pub fn new(name: impl Into<String>, mime: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            mime: mime.into(),
            size: bytes.len() as u64,
            bytes,
        }
    }

    /// Read a file from disk, guessing its MIME type from the extension.
    pub async fn from_path(path: &Path) -> std::io::Result<Self> {
        let bytes = tokio::fs::read(path).await?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Ok(Self::new(name, guess_mime(path), bytes))
    }

    fn into_new_image(self) -> NewImage {
        NewImage {
            filename: self.name,
            mime: self.mime,
            bytes: self.bytes,
        }
    }
}

impl std::fmt::Debug for UploadFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadFile")
            .field("name", &self.name)
            .field("mime", &self.mime)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

pub fn guess_mime(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "bmp" => "image/bmp",
        "tif" | "tiff" => "image/tiff",
        "avif" => "image/avif",
        "heic" => "image/heic",
        "svg" => "image/svg+xml",
        _ => "application/octet-stream",
    }
}

/// Why a picked file never made it into the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("{name}: only image files can be uploaded")]
    NotAnImage { name: String },
    #[error("{name}: images must be smaller than {limit_mib} MiB")]
    TooLarge { name: String, size: u64, limit_mib: u64 },
}

#[derive(Debug, Clone, Copy)]
pub struct UploadPolicy {
    max_file_bytes: u64,
}

impl UploadPolicy {
    pub fn new(config: &UploadConfig) -> Self {
        Self {
            max_file_bytes: config.max_file_bytes,
        }
    }

    pub fn check(&self, file: &UploadFile) -> Result<(), Rejection> {
        if !file.mime.starts_with("image/") {
            return Err(Rejection::NotAnImage {
                name: file.name.clone(),
            });
        }
        if file.size >= self.max_file_bytes {
            return Err(Rejection::TooLarge {
                name: file.name.clone(),
                size: file.size,
                limit_mib: self.max_file_bytes / (1024 * 1024),
            });
        }
        Ok(())
    }

    /// Split a selection into accepted files and rejections, keeping order.
    pub fn partition(&self, files: Vec<UploadFile>) -> (Vec<UploadFile>, Vec<Rejection>) {
        let mut accepted = Vec::with_capacity(files.len());
        let mut rejected = Vec::new();
        for file in files {
            match self.check(&file) {
                Ok(()) => accepted.push(file),
                Err(rejection) => {
                    debug!("upload rejected: {}", rejection);
                    rejected.push(rejection);
                }
            }
        }
        (accepted, rejected)
    }
}

/// Result delivered to the owner of the image id field.
pub type UploadOutcome = Result<Vec<ImageId>, StoreError>;

/// `None` is a picker event with no file list at all.
pub type Selection = Option<Vec<UploadFile>>;

pub struct UploadPipeline {
    pipeline: Pipeline<Selection>,
}

impl UploadPipeline {
    /// `publish` is the single subscriber; it is not called for selections
    /// that turn out empty.
    pub fn spawn<P>(store: Arc<Store>, config: &PipelineConfig, mut publish: P) -> Self
    where
        P: FnMut(UploadOutcome) + Send + 'static,
    {
        let pipeline = Pipeline::spawn(
            "upload",
            config.debounce(),
            config.queue_depth,
            move |selection: Selection| {
                let store = Arc::clone(&store);
                async move {
                    let files = selection.filter(|files| !files.is_empty())?;
                    let batch: Vec<NewImage> =
                        files.into_iter().map(UploadFile::into_new_image).collect();
                    let count = batch.len();
                    let outcome = store.batch_save_images(batch).await;
                    match &outcome {
                        Ok(ids) => info!("upload pipeline saved {} of {} file(s)", ids.len(), count),
                        Err(e) => error!("upload pipeline failed to save {} file(s): {}", count, e),
                    }
                    Some(outcome)
                }
            },
            move |outcome: Option<UploadOutcome>| {
                if let Some(outcome) = outcome {
                    publish(outcome);
                }
            },
        );
        Self { pipeline }
    }

    pub fn select(&self, selection: Selection) -> Result<(), PipelineError> {
        self.pipeline.push(selection)
    }

    pub fn shutdown(self) {
        self.pipeline.shutdown();
    }
}
