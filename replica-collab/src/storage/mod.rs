//! Pluggable document persistence.
//!
//! ```text
//! ┌───────────────┐  persistable()   ┌────────────────┐
//! │ DocumentStore │ ───────────────► │ StorageBackend │
//! │ (in-memory)   │  name → Value    ├────────────────┤
//! └───────────────┘                  │ MemoryStorage  │
//!                                    │ RocksStorage   │ (feature "rocksdb")
//!                                    └────────────────┘
//! ```
//!
//! Snapshots are whole-document upserts keyed by name, stored as
//! LZ4-compressed bincode. Calls are blocking; the store runs them on
//! `spawn_blocking`.

#[cfg(feature = "rocksdb")]
pub mod rocks;

#[cfg(feature = "rocksdb")]
pub use rocks::{RocksConfig, RocksStorage};

use replica_core::Value;
use std::collections::HashMap;
use std::sync::RwLock;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Compression error: {0}")]
    Compression(String),
    #[error("I/O error: {0}")]
    Io(String),
}

/// Document-oriented store keyed by document name.
pub trait StorageBackend: Send + Sync + 'static {
    /// `Ok(None)` when nothing is stored under `name`.
    fn load(&self, name: &str) -> Result<Option<Value>, StorageError>;

    /// Upsert the whole document.
    fn save(&self, name: &str, doc: &Value) -> Result<(), StorageError>;

    fn list(&self) -> Result<Vec<String>, StorageError>;
}

/// bincode + LZ4 snapshot encoding shared by the backends.
pub fn encode_snapshot(doc: &Value) -> Result<Vec<u8>, StorageError> {
    let raw = bincode::serde::encode_to_vec(doc, bincode::config::standard())
        .map_err(|e| StorageError::Serialization(e.to_string()))?;
    Ok(lz4_flex::compress_prepend_size(&raw))
}

pub fn decode_snapshot(bytes: &[u8]) -> Result<Value, StorageError> {
    let raw = lz4_flex::decompress_size_prepended(bytes).map_err(|e| StorageError::Compression(e.to_string()))?;
    let (doc, _) = bincode::serde::decode_from_slice(&raw, bincode::config::standard())
        .map_err(|e| StorageError::Deserialization(e.to_string()))?;
    Ok(doc)
}

/// Process-local backend. Holds compressed snapshots so sizes match what a
/// durable backend would write.
#[derive(Default)]
pub struct MemoryStorage {
    docs: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compressed size of a stored document.
    pub fn stored_bytes(&self, name: &str) -> Option<usize> {
        self.docs.read().ok()?.get(name).map(Vec::len)
    }
}

impl StorageBackend for MemoryStorage {
    fn load(&self, name: &str) -> Result<Option<Value>, StorageError> {
        let docs = self.docs.read().map_err(|e| StorageError::Io(e.to_string()))?;
        docs.get(name).map(|bytes| decode_snapshot(bytes)).transpose()
    }

    fn save(&self, name: &str, doc: &Value) -> Result<(), StorageError> {
        let bytes = encode_snapshot(doc)?;
        let mut docs = self.docs.write().map_err(|e| StorageError::Io(e.to_string()))?;
        docs.insert(name.to_string(), bytes);
        Ok(())
    }

    fn list(&self) -> Result<Vec<String>, StorageError> {
        let docs = self.docs.read().map_err(|e| StorageError::Io(e.to_string()))?;
        let mut names: Vec<String> = docs.keys().cloned().collect();
        names.sort();
        Ok(names)
    }
}
