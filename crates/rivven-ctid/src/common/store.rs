//! # Cursor Stores
//!
//! Persistence for [`CursorState`] records, keyed by stream.
//!
//! ## Backends
//!
//! - [`MemoryCursorStore`]: process-local, for tests and one-shot runs
//! - [`FileCursorStore`]: one JSON file per stream with atomic replace
//!
//! ## Usage
//!
//! ```ignore
//! use rivven_ctid::common::{CursorStore, FileCursorStore};
//!
//! let store = FileCursorStore::new("/var/rivven/ctid").await?;
//! if let Some(state) = store.load(&stream).await? {
//!     println!("resuming {} after {:?}", stream, state.last_address);
//! }
//! ```

use crate::common::{CursorState, Result, ScanError, StreamId};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Storage backend for cursor states.
#[async_trait]
pub trait CursorStore: Send + Sync {
    async fn save(&self, state: &CursorState) -> Result<()>;
    async fn load(&self, stream: &StreamId) -> Result<Option<CursorState>>;
    async fn delete(&self, stream: &StreamId) -> Result<()>;
    async fn list(&self) -> Result<Vec<StreamId>>;
}

/// Shared handle to a cursor store.
pub type SharedCursorStore = Arc<dyn CursorStore>;

/// In-memory cursor store.
#[derive(Debug, Default)]
pub struct MemoryCursorStore {
    states: RwLock<HashMap<StreamId, CursorState>>,
}

impl MemoryCursorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.states.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.states.read().await.is_empty()
    }
}

#[async_trait]
impl CursorStore for MemoryCursorStore {
    async fn save(&self, state: &CursorState) -> Result<()> {
        let mut states = self.states.write().await;
        states.insert(state.stream_id(), state.clone());
        Ok(())
    }

    async fn load(&self, stream: &StreamId) -> Result<Option<CursorState>> {
        let states = self.states.read().await;
        Ok(states.get(stream).cloned())
    }

    async fn delete(&self, stream: &StreamId) -> Result<()> {
        let mut states = self.states.write().await;
        states.remove(stream);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<StreamId>> {
        let states = self.states.read().await;
        let mut streams: Vec<_> = states.keys().cloned().collect();
        streams.sort();
        Ok(streams)
    }
}

/// File-backed cursor store.
///
/// Each stream's state lives in `<base_dir>/<namespace>.<name>.json` and is
/// replaced via temp file, fsync and rename, so a crash leaves either the
/// old or the new state on disk. Both parts are percent-encoded, so dots,
/// separators and non-ASCII characters in identifiers cannot collide or
/// escape the directory.
pub struct FileCursorStore {
    base_dir: PathBuf,
    cache: RwLock<HashMap<StreamId, CursorState>>,
    fsync: bool,
}

impl FileCursorStore {
    /// Open (or create) a store directory and load the states in it.
    pub async fn new(base_dir: impl AsRef<Path>) -> Result<Self> {
        Self::with_options(base_dir, true).await
    }

    pub async fn with_options(base_dir: impl AsRef<Path>, fsync: bool) -> Result<Self> {
        let base_dir = base_dir.as_ref().to_path_buf();
        fs::create_dir_all(&base_dir).await?;

        let store = Self {
            base_dir,
            cache: RwLock::new(HashMap::new()),
            fsync,
        };
        store.load_all().await?;

        Ok(store)
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn file_path(&self, stream: &StreamId) -> Result<PathBuf> {
        if stream.namespace.is_empty() || stream.name.is_empty() {
            return Err(ScanError::store(format!(
                "Invalid cursor key: {:?}",
                stream.full_name()
            )));
        }
        Ok(self.base_dir.join(format!(
            "{}.{}.json",
            encode_key_part(&stream.namespace),
            encode_key_part(&stream.name)
        )))
    }

    async fn read_file(path: &Path) -> Result<CursorState> {
        let contents = fs::read_to_string(path).await?;
        CursorState::from_json(&contents)
    }

    async fn load_all(&self) -> Result<()> {
        let mut entries = fs::read_dir(&self.base_dir).await?;

        let mut cache = self.cache.write().await;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|e| e == "json") {
                match Self::read_file(&path).await {
                    Ok(state) => {
                        let stream = state.stream_id();
                        if self.file_path(&stream).ok().as_deref() != Some(path.as_path()) {
                            warn!(
                                "Ignoring cursor {}: it belongs to {}",
                                path.display(),
                                stream
                            );
                            continue;
                        }
                        cache.insert(stream, state);
                    }
                    Err(e) => {
                        warn!("Failed to load cursor {}: {}", path.display(), e);
                    }
                }
            }
        }

        if !cache.is_empty() {
            info!(
                "Loaded {} cursors from {}",
                cache.len(),
                self.base_dir.display()
            );
        }

        Ok(())
    }
}

#[async_trait]
impl CursorStore for FileCursorStore {
    async fn save(&self, state: &CursorState) -> Result<()> {
        let stream = state.stream_id();
        let file_path = self.file_path(&stream)?;
        let temp_path = file_path.with_extension("tmp");

        let json = serde_json::to_string_pretty(state)?;

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)
            .await?;
        file.write_all(json.as_bytes()).await?;
        if self.fsync {
            file.sync_all().await?;
        }
        drop(file);

        fs::rename(&temp_path, &file_path).await?;

        self.cache.write().await.insert(stream.clone(), state.clone());

        debug!(
            "Saved cursor for {}: {:?} / {:?}",
            stream, state.last_address, state.fallback_watermark
        );
        Ok(())
    }

    async fn load(&self, stream: &StreamId) -> Result<Option<CursorState>> {
        if let Some(state) = self.cache.read().await.get(stream) {
            return Ok(Some(state.clone()));
        }

        let file_path = self.file_path(stream)?;
        if !fs::try_exists(&file_path).await? {
            return Ok(None);
        }

        let state = Self::read_file(&file_path).await?;
        if state.stream_id() != *stream {
            return Err(ScanError::store(format!(
                "Cursor {} belongs to {}, not {}",
                file_path.display(),
                state.stream_id(),
                stream
            )));
        }
        self.cache.write().await.insert(stream.clone(), state.clone());
        Ok(Some(state))
    }

    async fn delete(&self, stream: &StreamId) -> Result<()> {
        let file_path = self.file_path(stream)?;
        if fs::try_exists(&file_path).await? {
            fs::remove_file(&file_path).await?;
            info!("Deleted cursor for {}", stream);
        }

        self.cache.write().await.remove(stream);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<StreamId>> {
        let cache = self.cache.read().await;
        let mut streams: Vec<_> = cache.keys().cloned().collect();
        streams.sort();
        Ok(streams)
    }
}

/// Percent-encode everything but ASCII alphanumerics, `_` and `-`.
fn encode_key_part(part: &str) -> String {
    let mut encoded = String::with_capacity(part.len());
    for byte in part.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'_' || byte == b'-' {
            encoded.push(byte as char);
        } else {
            encoded.push_str(&format!("%{:02X}", byte));
        }
    }
    encoded
}
