//! RocksDB-backed document storage.
//!
//! Column families:
//! - `documents` — Whole-document snapshots (bincode + LZ4), keyed by name
//! - `metadata`  — Per-document sizes and timestamps (bincode)

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode, IteratorMode, Options,
    SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use replica_core::Value;

use super::{decode_snapshot, encode_snapshot, StorageBackend, StorageError};

const CF_DOCUMENTS: &str = "documents";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_DOCUMENTS, CF_METADATA];

#[derive(Debug, Clone)]
pub struct RocksConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 256)
    pub max_open_files: i32,
}

impl Default for RocksConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("replica_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 256,
        }
    }
}

impl RocksConfig {
    /// Small caches for tests.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
        }
    }
}

/// Stored alongside each snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub name: String,
    /// Number of saves since creation
    pub version: u64,
    pub compressed_size: u64,
    /// Seconds since epoch
    pub created_at: u64,
    pub updated_at: u64,
}

impl DocumentMetadata {
    fn new(name: &str) -> Self {
        let now = unix_secs();
        Self { name: name.to_string(), version: 0, compressed_size: 0, created_at: now, updated_at: now }
    }

    fn encode(&self) -> Result<Vec<u8>, StorageError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StorageError::Serialization(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StorageError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StorageError::Deserialization(e.to_string()))?;
        Ok(meta)
    }
}

impl From<rocksdb::Error> for StorageError {
    fn from(e: rocksdb::Error) -> Self {
        StorageError::Database(e.to_string())
    }
}

pub struct RocksStorage {
    db: DBWithThreadMode<SingleThreaded>,
    config: RocksConfig,
}

impl RocksStorage {
    /// Open the database, creating it and its column families if missing.
    pub fn open(config: RocksConfig) -> Result<Self, StorageError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(&db_opts, &config.path, cf_descriptors)?;
        log::info!("Opened RocksDB storage at {}", config.path.display());
        Ok(Self { db, config })
    }

    fn cf_options(name: &str, config: &RocksConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_max_write_buffer_number(2);

        match name {
            // values are already LZ4-compressed
            CF_DOCUMENTS => opts.set_compression_type(DBCompressionType::None),
            _ => opts.set_compression_type(DBCompressionType::Lz4),
        }
        opts.optimize_for_point_lookup(config.block_cache_size as u64);
        opts
    }

    pub fn load_metadata(&self, name: &str) -> Result<Option<DocumentMetadata>, StorageError> {
        let cf = self.cf(CF_METADATA)?;
        self.db.get_cf(cf, name.as_bytes())?.map(|b| DocumentMetadata::decode(&b)).transpose()
    }

    /// Remove a document and its metadata.
    pub fn delete(&self, name: &str) -> Result<(), StorageError> {
        let mut batch = WriteBatch::default();
        batch.delete_cf(self.cf(CF_DOCUMENTS)?, name.as_bytes());
        batch.delete_cf(self.cf(CF_METADATA)?, name.as_bytes());
        self.db.write(batch)?;
        Ok(())
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StorageError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StorageError::Database(format!("Column family '{name}' not found")))
    }
}

impl StorageBackend for RocksStorage {
    fn load(&self, name: &str) -> Result<Option<Value>, StorageError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        self.db.get_cf(cf, name.as_bytes())?.map(|b| decode_snapshot(&b)).transpose()
    }

    /// Snapshot and metadata are written in one batch.
    fn save(&self, name: &str, doc: &Value) -> Result<(), StorageError> {
        let compressed = encode_snapshot(doc)?;

        let mut meta = self.load_metadata(name)?.unwrap_or_else(|| DocumentMetadata::new(name));
        meta.version += 1;
        meta.compressed_size = compressed.len() as u64;
        meta.updated_at = unix_secs();

        let mut batch = WriteBatch::default();
        batch.put_cf(self.cf(CF_DOCUMENTS)?, name.as_bytes(), &compressed);
        batch.put_cf(self.cf(CF_METADATA)?, name.as_bytes(), meta.encode()?);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        log::debug!("Saved {name} v{} ({} bytes)", meta.version, meta.compressed_size);
        Ok(())
    }

    fn list(&self) -> Result<Vec<String>, StorageError> {
        let cf = self.cf(CF_METADATA)?;
        let mut names = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            let name = String::from_utf8(key.to_vec())
                .map_err(|e| StorageError::Deserialization(format!("Invalid document key: {e}")))?;
            names.push(name);
        }
        Ok(names)
    }
}

fn unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn open_temp() -> (tempfile::TempDir, RocksStorage) {
        let dir = tempfile::tempdir().unwrap();
        let storage = RocksStorage::open(RocksConfig::for_testing(dir.path().join("db"))).unwrap();
        (dir, storage)
    }

    #[test]
    fn test_open() {
        let (_dir, storage) = open_temp();
        assert!(storage.path().exists());
        assert!(storage.list().unwrap().is_empty());
    }

    #[test]
    fn test_save_load() {
        let (_dir, storage) = open_temp();
        let doc = Value::from(json!({"entities": {"5": {"position": [1.0, 2.0, 3.0]}}}));
        storage.save("world", &doc).unwrap();
        assert_eq!(storage.load("world").unwrap(), Some(doc));
        assert_eq!(storage.load("missing").unwrap(), None);
    }

    #[test]
    fn test_metadata_versions() {
        let (_dir, storage) = open_temp();
        let doc = Value::from(json!({"entities": {}}));
        storage.save("world", &doc).unwrap();
        storage.save("world", &doc).unwrap();
        let meta = storage.load_metadata("world").unwrap().unwrap();
        assert_eq!(meta.name, "world");
        assert_eq!(meta.version, 2);
        assert!(meta.compressed_size > 0);
    }

    #[test]
    fn test_list_and_delete() {
        let (_dir, storage) = open_temp();
        let doc = Value::from(json!({}));
        storage.save("a", &doc).unwrap();
        storage.save("b", &doc).unwrap();
        assert_eq!(storage.list().unwrap(), vec!["a".to_string(), "b".to_string()]);
        storage.delete("a").unwrap();
        assert_eq!(storage.list().unwrap(), vec!["b".to_string()]);
        assert_eq!(storage.load("a").unwrap(), None);
    }

    #[test]
    fn test_reopen_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db");
        let doc = Value::from(json!({"entities": {"1": {"name": "door"}}}));
        {
            let storage = RocksStorage::open(RocksConfig::for_testing(&path)).unwrap();
            storage.save("world", &doc).unwrap();
            storage.sync().unwrap();
        }
        let storage = RocksStorage::open(RocksConfig::for_testing(&path)).unwrap();
        assert_eq!(storage.load("world").unwrap(), Some(doc));
    }
}
