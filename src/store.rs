//! Persistence collaborator
//!
//! Everything that must survive a restart (signing credentials, the offline
//! queue, drained write-buffer contents) goes through [`KeyValueStore`] as a
//! JSON string under a fixed key. The store does not interpret values.

use dashmap::DashMap;
use std::path::Path;
use tracing::debug;

use crate::error::{ConnectError, Result};

/// Storage key for the persisted signing key pair and cap secret
pub const CREDENTIALS_KEY: &str = "elohim-signing-credentials";

/// Storage key for pending offline operations
pub const OFFLINE_QUEUE_KEY: &str = "elohim-offline-queue";

/// Storage key for drained write-buffer operations
pub const WRITE_BUFFER_KEY: &str = "elohim-write-buffer";

/// String key/value persistence.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
}

/// sled-backed store for native clients.
pub struct SledStore {
    db: sled::Db,
}

impl SledStore {
    /// Open (or create) the database at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = sled::open(path.as_ref())?;
        debug!(path = %path.as_ref().display(), "Opened sled store");
        Ok(Self { db })
    }
}

impl KeyValueStore for SledStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        match self.db.get(key)? {
            Some(bytes) => String::from_utf8(bytes.to_vec())
                .map(Some)
                .map_err(|e| ConnectError::Storage(format!("Value for '{}' is not UTF-8: {}", key, e))),
            None => Ok(None),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.db.insert(key, value.as_bytes())?;
        self.db.flush()?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.db.remove(key)?;
        self.db.flush()?;
        Ok(())
    }
}

/// In-process store; contents die with the process.
#[derive(Default)]
pub struct MemoryStore {
    entries: DashMap<String, String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.get(key).map(|v| v.value().clone()))
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }
}
