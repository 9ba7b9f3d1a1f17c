//! Local persistent store for API keys and uploaded images.
//!
//! One SQLite database with one versioned table.  Every row is an explicit
//! tagged [`Record`]: `kind` says whether it is an endpoint key or an image,
//! so enumeration never depends on how ids happen to be spelled.
//!
//! The connection is opened lazily.  All operations go through
//! [`Store::handle`], which memoizes a single in-progress open: concurrent
//! first callers await the same open, and a failed open leaves the cell
//! empty so the next caller tries again.

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

/// Bump when the table layout changes.
pub const SCHEMA_VERSION: i64 = 1;

/// Every generated image id starts with this.
pub const IMAGE_ID_PREFIX: &str = "img_";

const KIND_ENDPOINT_KEY: &str = "endpoint_key";
const KIND_IMAGE: &str = "image";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to open store at {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    #[error("storage error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("store connection mutex poisoned")]
    Poisoned,

    #[error("store schema version {found} is newer than supported {supported}")]
    SchemaVersion { found: i64, supported: i64 },

    #[error("record {id} has unknown kind {kind:?}")]
    UnknownKind { id: String, kind: String },
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Identifier of a stored image: `img_<filename>_<creation millis>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImageId(String);

impl ImageId {
    fn generate(filename: &str, created_at_ms: i64) -> Self {
        Self(format!("{IMAGE_ID_PREFIX}{filename}_{created_at_ms}"))
    }

    /// Wrap an id received from elsewhere (form state, command line).
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ImageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// API key remembered for one endpoint.  The endpoint URL is the id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointKeyRecord {
    pub endpoint_url: String,
    pub api_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRecord {
    pub id: ImageId,
    pub blob: Vec<u8>,
    pub filename: String,
    pub mime: String,
    /// The only field that changes after creation.
    pub room_type: String,
    pub created_at_ms: i64,
}

/// A row of the single record table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    EndpointKey(EndpointKeyRecord),
    Image(ImageRecord),
}

/// A file handed to [`Store::batch_save_images`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewImage {
    pub filename: String,
    pub mime: String,
    pub bytes: Vec<u8>,
}

/// What the preview grid needs to show one image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreviewImage {
    pub id: ImageId,
    pub blob: Vec<u8>,
    pub title: String,
    pub mime: String,
    pub room_type: String,
}

struct Handle {
    conn: Mutex<Connection>,
}

pub struct Store {
    path: PathBuf,
    /// Swapped for a fresh cell by `delete_database`.
    cell: Mutex<Arc<OnceCell<Arc<Handle>>>>,
    /// Last millisecond stamp handed out; keeps generated ids unique.
    clock: AtomicI64,
    opens: AtomicU64,
}

impl Store {
    /// Create a store backed by the database at `path`.  Nothing is opened
    /// until the first operation.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cell: Mutex::new(Arc::new(OnceCell::new())),
            clock: AtomicI64::new(0),
            opens: AtomicU64::new(0),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of physical opens performed so far.
    pub fn open_count(&self) -> u64 {
        self.opens.load(Ordering::SeqCst)
    }

    /// Open (or create) the database.  Safe to call concurrently and
    /// repeatedly; only the first successful call does any work.
    pub async fn open(&self) -> StoreResult<()> {
        self.handle().await.map(|_| ())
    }

    async fn handle(&self) -> StoreResult<Arc<Handle>> {
        let cell = {
            let guard = self.cell.lock().map_err(|_| StoreError::Poisoned)?;
            Arc::clone(&guard)
        };
        let handle = cell
            .get_or_try_init(|| async {
                let path = self.path.clone();
                let (conn, newest_ms) =
                    tokio::task::spawn_blocking(move || open_connection(&path)).await??;
                self.clock.fetch_max(newest_ms, Ordering::SeqCst);
                let opens = self.opens.fetch_add(1, Ordering::SeqCst) + 1;
                info!("store opened at {} (open #{})", self.path.display(), opens);
                Ok::<_, StoreError>(Arc::new(Handle {
                    conn: Mutex::new(conn),
                }))
            })
            .await?;
        Ok(Arc::clone(handle))
    }

    /// Run `op` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, op: F) -> StoreResult<T>
    where
        F: FnOnce(&mut Connection) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let handle = self.handle().await?;
        tokio::task::spawn_blocking(move || {
            let mut conn = handle.conn.lock().map_err(|_| StoreError::Poisoned)?;
            op(&mut *conn)
        })
        .await?
    }

    /// Point lookup of any record.
    pub async fn get(&self, id: &str) -> StoreResult<Option<Record>> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let row = conn
                .query_row(
                    "SELECT id, kind, endpoint_url, api_key, filename, mime, room_type, blob, created_at_ms
                     FROM records WHERE id = ?1",
                    params![id],
                    read_raw_row,
                )
                .optional()?;
            row.map(RawRow::into_record).transpose()
        })
        .await
    }

    pub async fn get_key_by_endpoint(&self, endpoint_url: &str) -> StoreResult<Option<String>> {
        match self.get(endpoint_url).await? {
            Some(Record::EndpointKey(record)) => Ok(Some(record.api_key)),
            Some(Record::Image(_)) => {
                warn!("id {} names an image, not an endpoint key", endpoint_url);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    /// Insert or overwrite the key for `endpoint_url`.
    pub async fn set_key_by_endpoint(&self, endpoint_url: &str, api_key: &str) -> StoreResult<()> {
        let endpoint_url = endpoint_url.to_string();
        let api_key = api_key.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO records (id, kind, endpoint_url, api_key)
                 VALUES (?1, ?2, ?1, ?3)
                 ON CONFLICT(id) DO UPDATE SET
                    kind = excluded.kind,
                    endpoint_url = excluded.endpoint_url,
                    api_key = excluded.api_key",
                params![endpoint_url, KIND_ENDPOINT_KEY, api_key],
            )?;
            debug!("stored key for {}", endpoint_url);
            Ok(())
        })
        .await
    }

    /// Persist one image record per file, in order, inside one transaction.
    /// Returns the generated ids in the same order; any failed insert fails
    /// the whole batch.
    pub async fn batch_save_images(&self, files: Vec<NewImage>) -> StoreResult<Vec<ImageId>> {
        if files.is_empty() {
            return Ok(Vec::new());
        }
        // Opening seeds the clock from the newest stored stamp.
        self.open().await?;
        let stamped: Vec<(ImageId, i64, NewImage)> = files
            .into_iter()
            .map(|file| {
                let created_at_ms = self.next_timestamp();
                (ImageId::generate(&file.filename, created_at_ms), created_at_ms, file)
            })
            .collect();

        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let mut ids = Vec::with_capacity(stamped.len());
            {
                let mut insert = tx.prepare(
                    "INSERT INTO records (id, kind, filename, mime, room_type, blob, created_at_ms)
                     VALUES (?1, ?2, ?3, ?4, '', ?5, ?6)",
                )?;
                for (id, created_at_ms, file) in &stamped {
                    insert.execute(params![
                        id.as_str(),
                        KIND_IMAGE,
                        file.filename,
                        file.mime,
                        file.bytes,
                        created_at_ms
                    ])?;
                    ids.push(id.clone());
                }
            }
            tx.commit()?;
            info!("saved {} image(s)", ids.len());
            Ok(ids)
        })
        .await
    }

    pub async fn get_image_by_id(&self, id: &ImageId) -> StoreResult<Option<Vec<u8>>> {
        match self.get(id.as_str()).await? {
            Some(Record::Image(record)) => Ok(Some(record.blob)),
            _ => Ok(None),
        }
    }

    /// Load preview data for `ids`, in the given order.  Ids without a
    /// matching image are skipped.
    pub async fn get_images_for_preview(&self, ids: &[ImageId]) -> StoreResult<Vec<PreviewImage>> {
        let ids = ids.to_vec();
        self.with_conn(move |conn| {
            let mut select = conn.prepare(
                "SELECT filename, mime, room_type, blob FROM records WHERE id = ?1 AND kind = ?2",
            )?;
            let mut previews = Vec::with_capacity(ids.len());
            for id in ids {
                let row = select
                    .query_row(params![id.as_str(), KIND_IMAGE], |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, Vec<u8>>(3)?,
                        ))
                    })
                    .optional()?;
                match row {
                    Some((title, mime, room_type, blob)) => previews.push(PreviewImage {
                        id,
                        blob,
                        title,
                        mime,
                        room_type,
                    }),
                    None => debug!("preview skipped missing image {}", id),
                }
            }
            Ok(previews)
        })
        .await
    }

    /// Set the room type tag of one image.  Returns `false` when the image
    /// no longer exists; that is not an error.
    pub async fn update_image_type(&self, id: &ImageId, room_type: &str) -> StoreResult<bool> {
        let id = id.clone();
        let room_type = room_type.to_string();
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE records SET room_type = ?2 WHERE id = ?1 AND kind = ?3",
                params![id.as_str(), room_type, KIND_IMAGE],
            )?;
            if changed == 0 {
                debug!("room type update skipped, {} no longer exists", id);
            }
            Ok(changed > 0)
        })
        .await
    }

    /// Delete any record by id.  Deleting a missing id succeeds.
    pub async fn delete_by_id(&self, id: &str) -> StoreResult<()> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM records WHERE id = ?1", params![id])?;
            Ok(())
        })
        .await
    }

    /// Enumerate every image and delete them one by one.  Endpoint keys
    /// are kept.  Returns how many images were deleted.
    pub async fn delete_all_images(&self) -> StoreResult<usize> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let ids = image_ids(&tx)?;
            {
                let mut delete = tx.prepare("DELETE FROM records WHERE id = ?1")?;
                for id in &ids {
                    delete.execute(params![id.as_str()])?;
                }
            }
            tx.commit()?;
            info!("deleted {} image(s)", ids.len());
            Ok(ids.len())
        })
        .await
    }

    /// All image ids in insertion order.
    pub async fn get_all_image_ids(&self) -> StoreResult<Vec<ImageId>> {
        self.with_conn(|conn| image_ids(conn)).await
    }

    /// Close the handle and remove the database from disk.  The store stays
    /// usable; the next operation creates a fresh, empty database.
    pub async fn delete_database(&self) -> StoreResult<()> {
        let previous = {
            let mut guard = self.cell.lock().map_err(|_| StoreError::Poisoned)?;
            std::mem::replace(&mut *guard, Arc::new(OnceCell::new()))
        };
        if let Ok(cell) = Arc::try_unwrap(previous) {
            if let Some(handle) = cell.into_inner() {
                close_handle(handle);
            }
        }

        for suffix in ["", "-wal", "-shm", "-journal"] {
            let mut file = self.path.clone().into_os_string();
            file.push(suffix);
            match tokio::fs::remove_file(&file).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        info!("store deleted at {}", self.path.display());
        Ok(())
    }

    fn next_timestamp(&self) -> i64 {
        let now = chrono::Utc::now().timestamp_millis();
        let mut last = self.clock.load(Ordering::SeqCst);
        loop {
            let next = now.max(last + 1);
            match self
                .clock
                .compare_exchange(last, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return next,
                Err(actual) => last = actual,
            }
        }
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("path", &self.path)
            .field("opens", &self.open_count())
            .finish()
    }
}

fn close_handle(handle: Arc<Handle>) {
    // In-flight operations still holding the handle close it when they drop.
    let Ok(handle) = Arc::try_unwrap(handle) else {
        return;
    };
    let conn = match handle.conn.into_inner() {
        Ok(conn) => conn,
        Err(poisoned) => poisoned.into_inner(),
    };
    if let Err((_, e)) = conn.close() {
        warn!("store close failed: {}", e);
    }
}

/// Open the database, creating or validating the schema.  Also returns the
/// newest image timestamp so id generation never reuses a stamp.
fn open_connection(path: &Path) -> StoreResult<(Connection, i64)> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let mut conn = Connection::open(path).map_err(|source| StoreError::Open {
        path: path.to_path_buf(),
        source,
    })?;
    init_schema(&mut conn)?;
    let newest_ms: Option<i64> = conn.query_row(
        "SELECT MAX(created_at_ms) FROM records WHERE kind = ?1",
        params![KIND_IMAGE],
        |row| row.get(0),
    )?;
    Ok((conn, newest_ms.unwrap_or(0)))
}

fn init_schema(conn: &mut Connection) -> StoreResult<()> {
    let tx = conn.transaction()?;
    let version: i64 = tx.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    if version > SCHEMA_VERSION {
        return Err(StoreError::SchemaVersion {
            found: version,
            supported: SCHEMA_VERSION,
        });
    }
    tx.execute_batch(
        "CREATE TABLE IF NOT EXISTS records (
            id              TEXT PRIMARY KEY NOT NULL,
            kind            TEXT NOT NULL CHECK (kind IN ('endpoint_key', 'image')),
            endpoint_url    TEXT,
            api_key         TEXT,
            filename        TEXT,
            mime            TEXT,
            room_type       TEXT NOT NULL DEFAULT '',
            blob            BLOB,
            created_at_ms   INTEGER
        );
        CREATE INDEX IF NOT EXISTS idx_records_kind ON records(kind);",
    )?;
    if version < SCHEMA_VERSION {
        tx.execute_batch(&format!("PRAGMA user_version = {SCHEMA_VERSION};"))?;
        debug!("store schema set to version {}", SCHEMA_VERSION);
    }
    tx.commit()?;
    Ok(())
}

fn image_ids(conn: &Connection) -> StoreResult<Vec<ImageId>> {
    let mut stmt = conn.prepare("SELECT id FROM records WHERE kind = ?1 ORDER BY rowid")?;
    let ids = stmt
        .query_map(params![KIND_IMAGE], |row| row.get::<_, String>(0))?
        .map(|id| id.map(ImageId))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ids)
}

/// Untyped row before the `kind` tag is checked.
struct RawRow {
    id: String,
    kind: String,
    endpoint_url: Option<String>,
    api_key: Option<String>,
    filename: Option<String>,
    mime: Option<String>,
    room_type: String,
    blob: Option<Vec<u8>>,
    created_at_ms: Option<i64>,
}

fn read_raw_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRow> {
    Ok(RawRow {
        id: row.get(0)?,
        kind: row.get(1)?,
        endpoint_url: row.get(2)?,
        api_key: row.get(3)?,
        filename: row.get(4)?,
        mime: row.get(5)?,
        room_type: row.get(6)?,
        blob: row.get(7)?,
        created_at_ms: row.get(8)?,
    })
}

impl RawRow {
    fn into_record(self) -> StoreResult<Record> {
        match self.kind.as_str() {
            KIND_ENDPOINT_KEY => Ok(Record::EndpointKey(EndpointKeyRecord {
                endpoint_url: self.endpoint_url.unwrap_or_else(|| self.id.clone()),
                api_key: self.api_key.unwrap_or_default(),
            })),
            KIND_IMAGE => Ok(Record::Image(ImageRecord {
                id: ImageId(self.id),
                blob: self.blob.unwrap_or_default(),
                filename: self.filename.unwrap_or_default(),
                mime: self.mime.unwrap_or_default(),
                room_type: self.room_type,
                created_at_ms: self.created_at_ms.unwrap_or_default(),
            })),
            _ => Err(StoreError::UnknownKind {
                id: self.id,
                kind: self.kind,
            }),
        }
    }
}
