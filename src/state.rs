//! Durable key/value state used by the progress ledger and the
//! cancellation flag.
//!
//! The engine only needs get/set/del of string-keyed scalar values; the
//! trait keeps the actual storage mechanics behind a seam so tests run
//! against an in-memory map while production uses a file persisted
//! atomically on every write.

use async_trait::async_trait;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::PathBuf;
use thiserror::Error;
use tokio::sync::RwLock;

/// Errors from the durable state store
#[derive(Error, Debug)]
pub enum StateError {
    /// Filesystem-level failure
    #[error("state IO error: {0}")]
    Io(#[from] std::io::Error),
    /// State file contents could not be (de)serialized
    #[error("state serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Durable string-keyed scalar storage.
///
/// Reads of unknown keys return `Ok(None)`, never an error, so a fresh
/// run starts cleanly with zeroed counters.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Read a value, `None` if the key was never written
    async fn get(&self, key: &str) -> Result<Option<String>, StateError>;
    /// Durably write a value
    async fn set(&self, key: &str, value: &str) -> Result<(), StateError>;
    /// Remove a key; removing an absent key is not an error
    async fn del(&self, key: &str) -> Result<(), StateError>;
}

/// In-memory store for tests and local development. Not durable.
#[derive(Default)]
pub struct MemoryStateStore {
    entries: RwLock<HashMap<String, String>>,
}

impl MemoryStateStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StateError> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StateError> {
        self.entries
            .write()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), StateError> {
        self.entries.write().await.remove(key);
        Ok(())
    }
}

/// File-backed store: the whole map is serialized as JSON and written via
/// a temp-file rename on every mutation, so a crash never leaves a
/// half-written state file behind.
pub struct FileStateStore {
    path: PathBuf,
    entries: RwLock<HashMap<String, String>>,
}

impl FileStateStore {
    /// Open the store, loading any state a previous process left behind.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub async fn load(path: impl Into<PathBuf>) -> Result<Self, StateError> {
        let path = path.into();
        let entries = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(StateError::Io(e)),
        };
        Ok(Self {
            path,
            entries: RwLock::new(entries),
        })
    }

    async fn persist(&self, entries: &HashMap<String, String>) -> Result<(), StateError> {
        let bytes = serde_json::to_vec_pretty(entries)?;
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StateError> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StateError> {
        // The write lock is held across persist so writes serialize and the
        // file always reflects a consistent snapshot.
        let mut entries = self.entries.write().await;
        entries.insert(key.to_string(), value.to_string());
        self.persist(&entries).await
    }

    async fn del(&self, key: &str) -> Result<(), StateError> {
        let mut entries = self.entries.write().await;
        entries.remove(key);
        self.persist(&entries).await
    }
}
