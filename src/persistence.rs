//! Durable pipeline state: pending local ops plus the recent batch ledger.
//!
//! [`FileStateStore`] keeps one `{document_id}.json` file per document in a
//! directory and caches what it has read or written.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::duplicate_detector::RecentBatchInfo;
use crate::pending::PendingLocalState;

#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),
}

/// Everything needed to rehydrate a pipeline after reload.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedRuntimeState {
    pub pending: PendingLocalState,
    pub recent_batches: Vec<RecentBatchInfo>,
}

impl PersistedRuntimeState {
    pub fn to_cbor(&self) -> Result<Vec<u8>, PersistenceError> {
        let mut buf = Vec::new();
        ciborium::into_writer(self, &mut buf)
            .map_err(|e| PersistenceError::SerializationError(e.to_string()))?;
        Ok(buf)
    }

    pub fn from_cbor(data: &[u8]) -> Result<Self, PersistenceError> {
        ciborium::from_reader(data)
            .map_err(|e| PersistenceError::DeserializationError(e.to_string()))
    }
}

pub trait StateStore {
    fn save(&mut self, document_id: &str, state: &PersistedRuntimeState)
        -> Result<(), PersistenceError>;

    fn load(&mut self, document_id: &str) -> Result<Option<PersistedRuntimeState>, PersistenceError>;

    fn remove(&mut self, document_id: &str) -> Result<(), PersistenceError>;
}

/// Keeps CBOR-encoded state in memory.
#[derive(Debug, Default)]
pub struct InMemoryStateStore {
    entries: HashMap<String, Vec<u8>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for InMemoryStateStore {
    fn save(
        &mut self,
        document_id: &str,
        state: &PersistedRuntimeState,
    ) -> Result<(), PersistenceError> {
        self.entries.insert(document_id.to_string(), state.to_cbor()?);
        Ok(())
    }

    fn load(&mut self, document_id: &str) -> Result<Option<PersistedRuntimeState>, PersistenceError> {
        self.entries
            .get(document_id)
            .map(|data| PersistedRuntimeState::from_cbor(data))
            .transpose()
    }

    fn remove(&mut self, document_id: &str) -> Result<(), PersistenceError> {
        self.entries.remove(document_id);
        Ok(())
    }
}

/// Store backed by one JSON file per document.
pub struct FileStateStore {
    storage_path: PathBuf,
    cache: HashMap<String, PersistedRuntimeState>,
}

impl FileStateStore {
    /// Create a store rooted at `storage_path` (created on first save).
    pub fn new(storage_path: PathBuf) -> Self {
        Self {
            storage_path,
            cache: HashMap::new(),
        }
    }

    pub fn storage_path(&self) -> &Path {
        &self.storage_path
    }

    fn file_for(&self, document_id: &str) -> PathBuf {
        self.storage_path.join(format!("{}.json", document_id))
    }
}

impl StateStore for FileStateStore {
    fn save(
        &mut self,
        document_id: &str,
        state: &PersistedRuntimeState,
    ) -> Result<(), PersistenceError> {
        std::fs::create_dir_all(&self.storage_path)
            .map_err(|e| PersistenceError::IoError(e.to_string()))?;
        let json = serde_json::to_string_pretty(state)
            .map_err(|e| PersistenceError::SerializationError(e.to_string()))?;
        std::fs::write(self.file_for(document_id), json)
            .map_err(|e| PersistenceError::IoError(e.to_string()))?;
        self.cache.insert(document_id.to_string(), state.clone());
        Ok(())
    }

    fn load(&mut self, document_id: &str) -> Result<Option<PersistedRuntimeState>, PersistenceError> {
        if let Some(state) = self.cache.get(document_id) {
            return Ok(Some(state.clone()));
        }

        let path = self.file_for(document_id);
        if !path.exists() {
            return Ok(None);
        }
        let data = std::fs::read(&path).map_err(|e| PersistenceError::IoError(e.to_string()))?;
        let state: PersistedRuntimeState = serde_json::from_slice(&data)
            .map_err(|e| PersistenceError::DeserializationError(e.to_string()))?;
        self.cache.insert(document_id.to_string(), state.clone());
        Ok(Some(state))
    }

    fn remove(&mut self, document_id: &str) -> Result<(), PersistenceError> {
        self.cache.remove(document_id);
        let path = self.file_for(document_id);
        if path.exists() {
            std::fs::remove_file(path).map_err(|e| PersistenceError::IoError(e.to_string()))?;
        }
        Ok(())
    }
}
