/// Key-value persistence used for identity, onboarding and read markers.
/// The core only needs a few string keys, so the interface stays tiny.
use crate::error::{Result, SyncError};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

pub const IDENTITY_KEY: &str = "identity.secret_key";
pub const ONBOARDING_KEY: &str = "onboarding.completed";
const READ_MARKER_PREFIX: &str = "read_marker.";

/// Store key holding the last-read timestamp of a correspondent
pub fn read_marker_key(correspondent_hex: &str) -> String {
    format!("{}{}", READ_MARKER_PREFIX, correspondent_hex)
}

pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
    fn remove(&self, key: &str) -> Result<bool>;
}

/// In-process store; nothing survives a restart
#[derive(Clone, Default)]
pub struct MemoryStore {
    entries: Arc<Mutex<HashMap<String, String>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, String>>> {
        self.entries
            .lock()
            .map_err(|_| SyncError::Storage("memory store lock poisoned".to_string()))
    }
}

impl KvStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.lock()?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.lock()?.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<bool> {
        Ok(self.lock()?.remove(key).is_some())
    }
}

/// Store backed by a sled database in the data directory
#[derive(Clone)]
pub struct SledStore {
    db: sled::Db,
}

impl SledStore {
    pub fn open(data_dir: &Path) -> Result<Self> {
        let db_path = data_dir.join("spotlink.db");
        debug!("Opening key-value store at {:?}", db_path);

        let db = sled::open(&db_path)
            .map_err(|e| SyncError::Storage(format!("Failed to open store: {}", e)))?;

        info!("Key-value store initialized at {:?}", db_path);
        Ok(Self { db })
    }
}

impl KvStore for SledStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        match self
            .db
            .get(key.as_bytes())
            .map_err(|e| SyncError::Storage(format!("get {}: {}", key, e)))?
        {
            Some(val) => String::from_utf8(val.to_vec())
                .map(Some)
                .map_err(|e| SyncError::Storage(format!("non-utf8 value at {}: {}", key, e))),
            None => Ok(None),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.db
            .insert(key.as_bytes(), value.as_bytes())
            .map_err(|e| SyncError::Storage(format!("set {}: {}", key, e)))?;
        self.db
            .flush()
            .map_err(|e| SyncError::Storage(format!("flush: {}", e)))?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<bool> {
        let removed = self
            .db
            .remove(key.as_bytes())
            .map_err(|e| SyncError::Storage(format!("remove {}: {}", key, e)))?;
        Ok(removed.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_memory_store_basic() {
        let store = MemoryStore::new();
        assert_eq!(store.get("a").unwrap(), None);

        store.set("a", "1").unwrap();
        assert_eq!(store.get("a").unwrap(), Some("1".to_string()));

        assert!(store.remove("a").unwrap());
        assert!(!store.remove("a").unwrap());
    }

    #[test]
    fn test_sled_store_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        {
            let store = SledStore::open(temp_dir.path()).unwrap();
            store.set(ONBOARDING_KEY, "true").unwrap();
            store.set(&read_marker_key("abcd"), "90").unwrap();
        }

        let store = SledStore::open(temp_dir.path()).unwrap();
        assert_eq!(store.get(ONBOARDING_KEY).unwrap(), Some("true".to_string()));
        assert_eq!(
            store.get("read_marker.abcd").unwrap(),
            Some("90".to_string())
        );
        assert_eq!(store.get("missing").unwrap(), None);
    }
}
