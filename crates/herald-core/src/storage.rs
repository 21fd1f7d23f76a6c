//! Flat key -> JSON cache.
//!
//! Everything written here can be rebuilt from the relays; losing the file only
//! costs a slower start.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Failed to write store file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to serialize store entry: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Key -> JSON value store used as a cache.
pub trait LocalStore: Send + Sync {
    fn get(&self, key: &str) -> Option<Value>;
    fn put(&self, key: &str, value: Value) -> Result<(), StoreError>;
    fn remove(&self, key: &str) -> Result<(), StoreError>;
}

/// Typed helpers over any [`LocalStore`].
pub trait LocalStoreExt: LocalStore {
    /// Entries that fail to deserialize are treated as missing.
    fn get_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.get(key)?;
        match serde_json::from_value(value) {
            Ok(v) => Some(v),
            Err(e) => {
                tracing::debug!(key, error = %e, "discarding unreadable store entry");
                None
            }
        }
    }

    fn put_as<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        self.put(key, serde_json::to_value(value)?)
    }
}

impl<S: LocalStore + ?Sized> LocalStoreExt for S {}

/// Store persisted as a single JSON object on disk
pub struct JsonFileStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, Value>>,
}

impl JsonFileStore {
    pub fn new<P: AsRef<Path>>(data_dir: P) -> Self {
        let path = data_dir.as_ref().join("cache.json");
        let entries = Self::load_from_file(&path).unwrap_or_default();
        Self {
            path,
            entries: Mutex::new(entries),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load_from_file(path: &Path) -> Option<BTreeMap<String, Value>> {
        let contents = std::fs::read_to_string(path).ok()?;
        serde_json::from_str(&contents).ok()
    }

    /// Write-to-temp-then-rename so a crash mid-write never leaves a torn file.
    fn save_to_file(&self, entries: &BTreeMap<String, Value>) -> Result<(), StoreError> {
        let json = serde_json::to_string_pretty(entries)?;
        let temp = self.path.with_extension("json.tmp");
        let write_err = |source| StoreError::Write {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(write_err)?;
        }
        std::fs::write(&temp, json).map_err(write_err)?;
        std::fs::rename(&temp, &self.path).map_err(write_err)?;
        Ok(())
    }
}

impl LocalStore for JsonFileStore {
    fn get(&self, key: &str) -> Option<Value> {
        self.entries.lock().get(key).cloned()
    }

    fn put(&self, key: &str, value: Value) -> Result<(), StoreError> {
        let mut entries = self.entries.lock();
        entries.insert(key.to_string(), value);
        self.save_to_file(&entries)
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.lock();
        if entries.remove(key).is_some() {
            self.save_to_file(&entries)?;
        }
        Ok(())
    }
}

/// Non-persistent store, for read-only sessions and tests
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl LocalStore for MemoryStore {
    fn get(&self, key: &str) -> Option<Value> {
        self.entries.lock().get(key).cloned()
    }

    fn put(&self, key: &str, value: Value) -> Result<(), StoreError> {
        self.entries.lock().insert(key.to_string(), value);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.entries.lock().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::tempdir;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Entry {
        mailbox: String,
        rev: u64,
    }

    #[test]
    fn test_file_store_survives_reopen() {
        let dir = tempdir().unwrap();
        {
            let store = JsonFileStore::new(dir.path());
            let entry = Entry {
                mailbox: "mb1".to_string(),
                rev: 7,
            };
            store.put_as("ledger:mb1", &entry).unwrap();
        }

        let reopened = JsonFileStore::new(dir.path());
        let loaded: Entry = reopened.get_as("ledger:mb1").unwrap();
        assert_eq!(loaded.rev, 7);
        assert_eq!(loaded.mailbox, "mb1");
    }

    #[test]
    fn test_file_store_remove() {
        let dir = tempdir().unwrap();
        let store = JsonFileStore::new(dir.path());
        store.put("a", serde_json::json!(1)).unwrap();
        store.remove("a").unwrap();

        let reopened = JsonFileStore::new(dir.path());
        assert!(reopened.get("a").is_none());
    }

    #[test]
    fn test_corrupt_file_starts_empty() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("cache.json"), "{not json").unwrap();
        let store = JsonFileStore::new(dir.path());
        assert!(store.get("anything").is_none());
    }

    #[test]
    fn test_unreadable_entry_is_missing() {
        let store = MemoryStore::new();
        store.put("ledger:x", serde_json::json!({"rev": "nope"})).unwrap();
        assert!(store.get_as::<Entry>("ledger:x").is_none());
        assert_eq!(store.len(), 1);
    }
}
