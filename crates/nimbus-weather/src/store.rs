//! String key/value stores backing the persisted location state.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

/// File name of the long-lived store inside the config directory
pub const STATE_FILE: &str = "state.json";

pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
}

/// Process-lifetime store; used for session-scoped values and in tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        self.values.lock().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.values.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.values.lock().remove(key);
        Ok(())
    }
}

/// Store persisted as a flat JSON object; every write rewrites the file.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    values: Mutex<HashMap<String, String>>,
}

impl FileStore {
    /// Open the store at `path`. A missing file starts empty; an unreadable one is
    /// logged and replaced on the next write.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        let values = if path.exists() {
            let json = fs::read_to_string(&path).context("Failed to read state file")?;
            match serde_json::from_str(&json) {
                Ok(values) => values,
                Err(e) => {
                    tracing::warn!("Ignoring corrupt state file {:?}: {}", path, e);
                    HashMap::new()
                }
            }
        } else {
            HashMap::new()
        };

        Ok(Self {
            path,
            values: Mutex::new(values),
        })
    }

    /// `<dir>/state.json`
    pub fn in_dir(dir: &Path) -> Result<Self> {
        Self::open(dir.join(STATE_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, values: &HashMap<String, String>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).context("Failed to create state directory")?;
        }

        let json = serde_json::to_string_pretty(values).context("Failed to serialize state")?;
        fs::write(&self.path, json).context("Failed to write state file")?;
        Ok(())
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Option<String> {
        self.values.lock().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut values = self.values.lock();
        values.insert(key.to_string(), value.to_string());
        self.persist(&values)
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut values = self.values.lock();
        if values.remove(key).is_some() {
            self.persist(&values)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_memory_store() {
        let store = MemoryStore::new();
        assert_eq!(store.get("last_city"), None);

        store.set("last_city", "Hanoi").unwrap();
        assert_eq!(store.get("last_city").as_deref(), Some("Hanoi"));

        store.remove("last_city").unwrap();
        assert_eq!(store.get("last_city"), None);
    }

    #[test]
    fn test_file_store_survives_reopen() {
        let dir = TempDir::new().unwrap();

        let store = FileStore::in_dir(dir.path()).unwrap();
        store.set("last_city", "Hue").unwrap();
        store.set("use_gps", "1").unwrap();
        drop(store);

        let reopened = FileStore::in_dir(dir.path()).unwrap();
        assert_eq!(reopened.get("last_city").as_deref(), Some("Hue"));
        assert_eq!(reopened.get("use_gps").as_deref(), Some("1"));
    }

    #[test]
    fn test_file_store_creates_parent_dirs() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("state.json");

        let store = FileStore::open(&path).unwrap();
        store.set("prev_city", "Da Nang").unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_corrupt_file_starts_empty() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(STATE_FILE), "not json").unwrap();

        let store = FileStore::in_dir(dir.path()).unwrap();
        assert_eq!(store.get("last_city"), None);

        store.set("last_city", "Hanoi").unwrap();
        let reopened = FileStore::in_dir(dir.path()).unwrap();
        assert_eq!(reopened.get("last_city").as_deref(), Some("Hanoi"));
    }
}
