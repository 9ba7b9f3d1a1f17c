//! Preview-load pipeline.
//!
//! The visible id list is debounced, the blobs are loaded from the store,
//! and each one is written to a temp file under the preview directory.  The
//! temp file is the transient handle: it lives in a [`PreviewRegistry`] until
//! the image is deleted, the list is reloaded, or the pipeline is torn down,
//! and dropping it removes the file.

use aid_proto::config::PipelineConfig;
use aid_proto::store::{ImageId, PreviewImage, Store, StoreError};
use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::pipeline::{Pipeline, PipelineError};

#[derive(Debug, Error)]
pub enum PreviewError {
    #[error("failed to load previews: {0}")]
    Store(#[from] StoreError),

    #[error("failed to write preview file: {0}")]
    Io(#[from] std::io::Error),

    #[error("preview task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// One transient preview file.  Released exactly once, when dropped.
#[derive(Debug)]
pub struct PreviewHandle {
    id: ImageId,
    file: NamedTempFile,
}

impl PreviewHandle {
    pub fn url(&self) -> String {
        format!("file://{}", self.file.path().display())
    }
}

impl Drop for PreviewHandle {
    fn drop(&mut self) {
        debug!("preview: releasing handle for {}", self.id);
    }
}

/// What a renderer gets for one image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreviewItem {
    pub id: ImageId,
    pub url: String,
    pub title: String,
    pub room_type: String,
}

/// Live preview handles, keyed by image id.
#[derive(Debug, Default)]
pub struct PreviewRegistry {
    handles: HashMap<ImageId, PreviewHandle>,
    closed: bool,
}

impl PreviewRegistry {
    /// Swap in a freshly loaded batch.  Every previous handle is released.
    /// After teardown the new handles are released immediately instead.
    fn replace(&mut self, batch: Vec<PreviewHandle>) -> bool {
        if self.closed {
            debug!("preview: registry closed, dropping {} new handle(s)", batch.len());
            return false;
        }
        self.handles = batch.into_iter().map(|h| (h.id.clone(), h)).collect();
        true
    }

    fn release(&mut self, id: &ImageId) -> bool {
        self.handles.remove(id).is_some()
    }

    fn close(&mut self) -> usize {
        self.closed = true;
        let released = self.handles.len();
        self.handles.clear();
        released
    }

    pub fn live(&self) -> usize {
        self.handles.len()
    }
}

pub type PreviewOutcome = Result<Vec<PreviewItem>, PreviewError>;

pub struct PreviewPipeline {
    pipeline: Pipeline<Vec<ImageId>>,
    registry: Arc<Mutex<PreviewRegistry>>,
}

impl PreviewPipeline {
    pub fn spawn<P>(
        store: Arc<Store>,
        preview_dir: PathBuf,
        config: &PipelineConfig,
        mut publish: P,
    ) -> Self
    where
        P: FnMut(PreviewOutcome) + Send + 'static,
    {
        let registry = Arc::new(Mutex::new(PreviewRegistry::default()));
        let installed = Arc::clone(&registry);

        let pipeline = Pipeline::spawn(
            "preview",
            config.debounce(),
            config.queue_depth,
            move |ids: Vec<ImageId>| {
                let store = Arc::clone(&store);
                let dir = preview_dir.clone();
                async move {
                    let images = store.get_images_for_preview(&ids).await?;
                    debug!("preview: loaded {} of {} id(s)", images.len(), ids.len());
                    let loaded =
                        tokio::task::spawn_blocking(move || materialize(&dir, images)).await??;
                    Ok::<_, PreviewError>(loaded)
                }
            },
            move |loaded: Result<Vec<(PreviewItem, PreviewHandle)>, PreviewError>| {
                match loaded {
                    Ok(loaded) => {
                        let (items, handles): (Vec<_>, Vec<_>) = loaded.into_iter().unzip();
                        if lock(&installed).replace(handles) {
                            publish(Ok(items));
                        }
                    }
                    Err(e) => {
                        error!("preview: {}", e);
                        publish(Err(e));
                    }
                }
            },
        );

        Self { pipeline, registry }
    }

    /// The visible id list changed.  Repeated ids are shown once, at their
    /// first position, so each image has a single handle.
    pub fn show(&self, mut ids: Vec<ImageId>) -> Result<(), PipelineError> {
        let mut seen = HashSet::new();
        ids.retain(|id| seen.insert(id.clone()));
        self.pipeline.push(ids)
    }

    /// Release the handle of a deleted image.
    pub fn release(&self, id: &ImageId) -> bool {
        let released = lock(&self.registry).release(id);
        if released {
            debug!("preview: released {}", id);
        }
        released
    }

    pub fn live(&self) -> usize {
        lock(&self.registry).live()
    }

    pub fn registry(&self) -> Arc<Mutex<PreviewRegistry>> {
        Arc::clone(&self.registry)
    }

    /// Stop loading and release every live handle.  A load that is still
    /// running is discarded when it finishes.
    pub fn teardown(self) {
        let released = lock(&self.registry).close();
        debug!("preview: teardown released {} handle(s)", released);
        self.pipeline.shutdown();
    }
}

fn lock(registry: &Mutex<PreviewRegistry>) -> MutexGuard<'_, PreviewRegistry> {
    registry.lock().unwrap_or_else(|poisoned| {
        warn!("preview: registry mutex poisoned, recovering");
        poisoned.into_inner()
    })
}

fn materialize(
    dir: &Path,
    images: Vec<PreviewImage>,
) -> std::io::Result<Vec<(PreviewItem, PreviewHandle)>> {
    std::fs::create_dir_all(dir)?;
    images
        .into_iter()
        .map(|image| {
            let mut file = tempfile::Builder::new()
                .prefix("preview-")
                .suffix(extension_for(&image.mime))
                .tempfile_in(dir)?;
            file.write_all(&image.blob)?;
            file.flush()?;
            let handle = PreviewHandle {
                id: image.id.clone(),
                file,
            };
            let item = PreviewItem {
                id: image.id,
                url: handle.url(),
                title: image.title,
                room_type: image.room_type,
            };
            Ok((item, handle))
        })
        .collect()
}

fn extension_for(mime: &str) -> &'static str {
    match mime {
        "image/png" => ".png",
        "image/jpeg" => ".jpg",
        "image/gif" => ".gif",
        "image/webp" => ".webp",
        "image/bmp" => ".bmp",
        "image/tiff" => ".tiff",
        "image/avif" => ".avif",
        "image/heic" => ".heic",
        "image/svg+xml" => ".svg",
        _ => ".bin",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aid_proto::store::NewImage;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    fn fast() -> PipelineConfig {
        PipelineConfig {
            debounce_ms: 20,
            queue_depth: 4,
        }
    }

    async fn setup() -> (TempDir, Arc<Store>, Vec<ImageId>) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(Store::new(dir.path().join("bench.sqlite3")));
        let ids = store
            .batch_save_images(vec![
                NewImage {
                    filename: "a.png".into(),
                    mime: "image/png".into(),
                    bytes: b"aaaa".to_vec(),
                },
                NewImage {
                    filename: "b.jpg".into(),
                    mime: "image/jpeg".into(),
                    bytes: b"bbbb".to_vec(),
                },
            ])
            .await
            .unwrap();
        (dir, store, ids)
    }

    fn spawn(
        store: Arc<Store>,
        dir: &Path,
    ) -> (PreviewPipeline, mpsc::UnboundedReceiver<PreviewOutcome>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let pipeline = PreviewPipeline::spawn(store, dir.join("previews"), &fast(), move |out| {
            let _ = tx.send(out);
        });
        (pipeline, rx)
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<PreviewOutcome>) -> Vec<PreviewItem> {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("preview load timed out")
            .expect("pipeline closed")
            .expect("preview load failed")
    }

    fn path_of(item: &PreviewItem) -> PathBuf {
        PathBuf::from(item.url.trim_start_matches("file://"))
    }

    #[tokio::test]
    async fn loads_previews_and_reload_releases_previous_batch() {
        let (dir, store, ids) = setup().await;
        let (pipeline, mut rx) = spawn(store, dir.path());

        pipeline.show(ids.clone()).unwrap();
        let first = next(&mut rx).await;
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].title, "a.png");
        assert!(first[1].url.ends_with(".jpg"));
        assert_eq!(std::fs::read(path_of(&first[0])).unwrap(), b"aaaa");

        pipeline.show(vec![ids[1].clone()]).unwrap();
        let second = next(&mut rx).await;
        assert_eq!(second.len(), 1);
        assert_eq!(pipeline.live(), 1);
        for item in &first {
            assert!(!path_of(item).exists(), "{} not released", item.id);
        }
        assert!(path_of(&second[0]).exists());
    }

    #[tokio::test]
    async fn deletion_and_teardown_release_handles() {
        let (dir, store, ids) = setup().await;
        let (pipeline, mut rx) = spawn(store, dir.path());

        pipeline.show(ids.clone()).unwrap();
        let items = next(&mut rx).await;

        assert!(pipeline.release(&ids[0]));
        assert!(!pipeline.release(&ids[0]));
        assert!(!path_of(&items[0]).exists());
        assert!(path_of(&items[1]).exists());

        let registry = pipeline.registry();
        pipeline.teardown();
        assert_eq!(registry.lock().unwrap().live(), 0);
        assert!(!path_of(&items[1]).exists());
    }

    #[tokio::test]
    async fn unknown_ids_are_skipped() {
        let (dir, store, ids) = setup().await;
        store.delete_by_id(ids[0].as_str()).await.unwrap();
        let (pipeline, mut rx) = spawn(store, dir.path());

        pipeline
            .show(vec![ids[0].clone(), ImageId::new("img_ghost_1"), ids[1].clone()])
            .unwrap();
        let items = next(&mut rx).await;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].id, ids[1]);
    }

    #[tokio::test]
    async fn repeated_ids_share_one_live_handle() {
        let (dir, store, ids) = setup().await;
        let (pipeline, mut rx) = spawn(store, dir.path());

        pipeline
            .show(vec![ids[0].clone(), ids[1].clone(), ids[0].clone()])
            .unwrap();
        let items = next(&mut rx).await;

        assert_eq!(items.len(), 2);
        assert_eq!(items[0].id, ids[0]);
        assert_eq!(pipeline.live(), 2);
        for item in &items {
            assert!(path_of(item).exists(), "{} was released early", item.id);
        }
    }

    #[test]
    fn registry_refuses_batches_after_close() {
        let mut registry = PreviewRegistry::default();
        assert_eq!(registry.close(), 0);
        assert!(!registry.replace(Vec::new()));
    }
}
