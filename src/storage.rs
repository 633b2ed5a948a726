//! Key-value storage contract used for durable state.
//!
//! The fetch layer only needs `get`/`set` of string values. Two backends are
//! provided: [`MemoryStore`] for tests and ephemeral runs, and [`FileStore`]
//! which keeps a flat JSON object on disk.

use crate::error::{FetchError, Result};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

/// Key holding the persisted device identifier.
pub const DEVICE_ID_KEY: &str = "device_id";

/// Minimal durable key-value contract.
pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
}

/// Process-local store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let values = self.values.lock().unwrap_or_else(|p| p.into_inner());
        Ok(values.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut values = self.values.lock().unwrap_or_else(|p| p.into_inner());
        values.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// Store backed by a single JSON file.
///
/// The whole map is rewritten on every `set`. The in-memory copy stays
/// authoritative when a write fails.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    values: Mutex<HashMap<String, String>>,
}

impl FileStore {
    /// Opens a store, starting empty if the file is missing or unreadable.
    pub fn open<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref().to_path_buf();

        let values = match fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(values) => values,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Ignoring corrupt store file");
                    HashMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "Store file does not exist yet");
                HashMap::new()
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to read store file");
                HashMap::new()
            }
        };

        Self {
            path,
            values: Mutex::new(values),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl KvStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let values = self.values.lock().unwrap_or_else(|p| p.into_inner());
        Ok(values.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut values = self.values.lock().unwrap_or_else(|p| p.into_inner());
        values.insert(key.to_string(), value.to_string());

        let serialized = serde_json::to_string_pretty(&*values)
            .map_err(|e| FetchError::storage(e.to_string()))?;
        fs::write(&self.path, serialized).map_err(|e| {
            FetchError::storage(format!("failed to write {}: {}", self.path.display(), e))
        })
    }
}

/// Returns the persisted device identifier, creating one on first use.
///
/// Falls back to an unpersisted identifier if the store cannot be written.
pub fn device_id(store: &dyn KvStore) -> String {
    match store.get(DEVICE_ID_KEY) {
        Ok(Some(id)) if !id.is_empty() => return id,
        Ok(_) => {}
        Err(e) => warn!(error = %e, "Failed to read device id"),
    }

    let id = uuid::Uuid::new_v4().simple().to_string();
    if let Err(e) = store.set(DEVICE_ID_KEY, &id) {
        warn!(error = %e, "Failed to persist device id");
    }
    id
}
