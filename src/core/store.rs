//! Key-value storage for cache entries and small bits of persistent state.
//!
//! Components never reach for a global store; they receive an
//! `Arc<dyn KvStore>` at construction.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::{Mutex, RwLock};
use serde_json::Value;

use crate::plugin::{UpdaterError, UpdaterResult};

/// A string-keyed store of JSON values.
pub trait KvStore: Send + Sync {
    /// Fetch a value.
    fn get(&self, key: &str) -> UpdaterResult<Option<Value>>;

    /// Insert or replace a value.
    fn set(&self, key: &str, value: Value) -> UpdaterResult<()>;

    /// Remove a value, returning whether it existed.
    fn delete(&self, key: &str) -> UpdaterResult<bool>;

    /// All keys starting with `prefix`.
    fn keys_with_prefix(&self, prefix: &str) -> UpdaterResult<Vec<String>>;
}

/// In-memory store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<BTreeMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl KvStore for MemoryStore {
    fn get(&self, key: &str) -> UpdaterResult<Option<Value>> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn set(&self, key: &str, value: Value) -> UpdaterResult<()> {
        self.entries.write().insert(key.to_string(), value);
        Ok(())
    }

    fn delete(&self, key: &str) -> UpdaterResult<bool> {
        Ok(self.entries.write().remove(key).is_some())
    }

    fn keys_with_prefix(&self, prefix: &str) -> UpdaterResult<Vec<String>> {
        Ok(self.entries.read().keys().filter(|k| k.starts_with(prefix)).cloned().collect())
    }
}

/// Store persisted as a single JSON object on disk.
///
/// Every mutation rewrites the file through a temp file in the same
/// directory followed by a rename, so readers never see a torn file.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileStore {
    /// Open (or lazily create) the store at `path`.
    pub fn new(path: PathBuf) -> UpdaterResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                UpdaterError::fs(format!("Failed to create store directory {}", parent.display()), e)
            })?;
        }

        Ok(Self { path, lock: Mutex::new(()) })
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> UpdaterResult<BTreeMap<String, Value>> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => {
                return Err(UpdaterError::fs(format!("Failed to read {}", self.path.display()), e))
            }
        };

        match serde_json::from_str(&content) {
            Ok(map) => Ok(map),
            Err(e) => {
                // A corrupt store only holds cache data; start over rather than wedge every call.
                tracing::warn!(path = ?self.path, error = %e, "Discarding unreadable store file");
                Ok(BTreeMap::new())
            }
        }
    }

    fn save(&self, entries: &BTreeMap<String, Value>) -> UpdaterResult<()> {
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        let content =
            serde_json::to_vec_pretty(entries).map_err(|e| UpdaterError::Json(e.to_string()))?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir)
            .map_err(|e| UpdaterError::fs("Failed to create temporary store file", e))?;
        tmp.write_all(&content).map_err(|e| UpdaterError::fs("Failed to write store file", e))?;
        tmp.persist(&self.path).map_err(|e| {
            UpdaterError::fs(format!("Failed to replace {}", self.path.display()), e.error)
        })?;

        Ok(())
    }
}

impl KvStore for FileStore {
    fn get(&self, key: &str) -> UpdaterResult<Option<Value>> {
        let _guard = self.lock.lock();
        Ok(self.load()?.remove(key))
    }

    fn set(&self, key: &str, value: Value) -> UpdaterResult<()> {
        let _guard = self.lock.lock();
        let mut entries = self.load()?;
        entries.insert(key.to_string(), value);
        self.save(&entries)
    }

    fn delete(&self, key: &str) -> UpdaterResult<bool> {
        let _guard = self.lock.lock();
        let mut entries = self.load()?;
        let existed = entries.remove(key).is_some();
        if existed {
            self.save(&entries)?;
        }
        Ok(existed)
    }

    fn keys_with_prefix(&self, prefix: &str) -> UpdaterResult<Vec<String>> {
        let _guard = self.lock.lock();
        Ok(self.load()?.into_keys().filter(|k| k.starts_with(prefix)).collect())
    }
}
