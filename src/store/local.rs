//! Local key-value store
//!
//! The local store is a flat string-to-string namespace holding JSON
//! documents. [`MemoryKvStore`] backs tests and embedding;
//! [`FileKvStore`] persists the namespace as a single JSON object on disk.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use super::keys;
use crate::error::{MigrationError, Result};
use crate::model::ExportDataset;

/// Synchronous key-value store
pub trait KeyValueStore: Send + Sync {
    /// Read a value
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// Write a value
    fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Remove a value; removing a missing key is not an error
    fn remove(&self, key: &str) -> Result<()>;

    /// Enumerate every key
    fn keys(&self) -> Result<Vec<String>>;
}

/// JSON helpers available on every [`KeyValueStore`]
pub trait KeyValueStoreExt: KeyValueStore {
    /// Read and decode a JSON value
    fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key)? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Encode and write a JSON value
    fn set_json<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        let raw = serde_json::to_string(value)?;
        self.set(key, &raw)
    }

    /// Every key/value pair whose key satisfies `filter`
    fn entries_where(&self, filter: impl Fn(&str) -> bool) -> Result<BTreeMap<String, String>> {
        let mut entries = BTreeMap::new();
        for key in self.keys()? {
            if !filter(&key) {
                continue;
            }
            if let Some(value) = self.get(&key)? {
                entries.insert(key, value);
            }
        }
        Ok(entries)
    }
}

impl<S: KeyValueStore + ?Sized> KeyValueStoreExt for S {}

// ---------------------------------------------------------------------------
// MemoryKvStore
// ---------------------------------------------------------------------------

/// In-memory store
#[derive(Debug, Default)]
pub struct MemoryKvStore {
    entries: RwLock<BTreeMap<String, String>>,
}

impl MemoryKvStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys held
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl KeyValueStore for MemoryKvStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.entries.write().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.entries.write().remove(key);
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>> {
        Ok(self.entries.read().keys().cloned().collect())
    }
}

// ---------------------------------------------------------------------------
// FileKvStore
// ---------------------------------------------------------------------------

/// Store persisted as one JSON object, rewritten on every mutation
#[derive(Debug)]
pub struct FileKvStore {
    path: PathBuf,
    entries: RwLock<BTreeMap<String, String>>,
}

impl FileKvStore {
    /// Open a store file, creating an empty namespace if it does not exist
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let entries = if path.exists() {
            let contents = std::fs::read_to_string(&path)?;
            if contents.trim().is_empty() {
                BTreeMap::new()
            } else {
                serde_json::from_str(&contents).map_err(|e| {
                    MigrationError::Store(format!("corrupt store file {:?}: {}", path, e))
                })?
            }
        } else {
            BTreeMap::new()
        };

        debug!(path = ?path, keys = entries.len(), "opened local store");
        Ok(Self {
            path,
            entries: RwLock::new(entries),
        })
    }

    /// Location of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, entries: &BTreeMap<String, String>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let contents = serde_json::to_string_pretty(entries)?;
        let temp_path = self.path.with_extension("json.tmp");
        std::fs::write(&temp_path, contents)?;
        std::fs::rename(&temp_path, &self.path).map_err(|e| {
            let _ = std::fs::remove_file(&temp_path);
            MigrationError::Io(e)
        })
    }
}

impl KeyValueStore for FileKvStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut entries = self.entries.write();
        entries.insert(key.to_string(), value.to_string());
        self.persist(&entries)
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.write();
        if entries.remove(key).is_some() {
            self.persist(&entries)?;
        }
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>> {
        Ok(self.entries.read().keys().cloned().collect())
    }
}

/// Write every record of `dataset` into the local key scheme
pub fn write_dataset(store: &dyn KeyValueStore, dataset: &ExportDataset) -> Result<()> {
    store.set_json(keys::USERS_KEY, &dataset.users)?;
    for (uid, sessions) in &dataset.sessions {
        store.set_json(&keys::sessions_key(uid), sessions)?;
    }
    for (uid, stats) in &dataset.stats {
        store.set_json(&keys::stats_key(uid), stats)?;
    }
    for (uid, meetings) in &dataset.meetings {
        store.set_json(&keys::meetings_key(uid), meetings)?;
    }
    for (uid, session) in &dataset.active_sessions {
        store.set_json(&keys::active_session_key(uid), session)?;
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::model::UserProfile;

    #[test]
    fn test_memory_store() {
        let store = MemoryKvStore::new();
        assert!(store.is_empty());
        store.set("a", "1").unwrap();
        store.set("b", "2").unwrap();
        assert_eq!(store.get("a").unwrap(), Some("1".to_string()));
        store.remove("a").unwrap();
        store.remove("missing").unwrap();
        assert_eq!(store.keys().unwrap(), vec!["b".to_string()]);
    }

    #[test]
    fn test_json_helpers() {
        let store = MemoryKvStore::new();
        store.set_json("n", &vec![1, 2, 3]).unwrap();
        let value: Vec<i32> = store.get_json("n").unwrap().unwrap();
        assert_eq!(value, vec![1, 2, 3]);
        assert!(store.get_json::<Vec<i32>>("missing").unwrap().is_none());

        store.set("bad", "{not json").unwrap();
        assert!(store.get_json::<Vec<i32>>("bad").is_err());
    }

    #[test]
    fn test_entries_where() {
        let store = MemoryKvStore::new();
        store.set("app:users", "{}").unwrap();
        store.set("kvshift:status", "{}").unwrap();
        let entries = store.entries_where(keys::is_app_key).unwrap();
        assert_eq!(entries.len(), 1);
        assert!(entries.contains_key("app:users"));
    }

    #[test]
    fn test_file_store_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("local.json");

        {
            let store = FileKvStore::open(&path).unwrap();
            store.set("app:current_user", "\"u1\"").unwrap();
            store.set("temp", "x").unwrap();
            store.remove("temp").unwrap();
        }

        let reopened = FileKvStore::open(&path).unwrap();
        assert_eq!(
            reopened.get("app:current_user").unwrap(),
            Some("\"u1\"".to_string())
        );
        assert!(reopened.get("temp").unwrap().is_none());
    }

    #[test]
    fn test_file_store_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("local.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(
            FileKvStore::open(&path),
            Err(MigrationError::Store(_))
        ));
    }

    #[test]
    fn test_write_dataset() {
        let store = MemoryKvStore::new();
        let mut dataset = ExportDataset::new("test");
        dataset.users.insert(
            "u1".into(),
            UserProfile {
                id: "u1".into(),
                ..Default::default()
            },
        );
        dataset.sessions.insert("u1".into(), Vec::new());
        write_dataset(&store, &dataset).unwrap();

        assert!(store.get(keys::USERS_KEY).unwrap().is_some());
        assert_eq!(store.get(&keys::sessions_key("u1")).unwrap(), Some("[]".into()));
    }
}
