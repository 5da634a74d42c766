//! RocksDB-backed history store.
//!
//! Column families:
//! - `transactions` — One committed transaction per key (bincode + LZ4),
//!   keyed by `<name_len:u16 BE><name><version:u64 BE>` so a document's
//!   history is one contiguous, version-ordered key range
//! - `metadata`     — Document metadata (bincode: version, timestamps), keyed by name
//!
//! Performance targets:
//! - Open (10k docs): <100ms (bloom filters + block cache)
//! - Append (1 transaction): <50μs
//! - Load (10k transactions): <20ms
//!
//! Reference: Kleppmann — DDIA, Chapter 3 (LSM Trees, SSTables)

use log::{debug, info};
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tandem_core::{Change, Transaction, Version};

use super::{DocumentMetadata, HistoryStore, StoreError};

/// Column family names.
const CF_TRANSACTIONS: &str = "transactions";
const CF_METADATA: &str = "metadata";

/// All column family names for initialization.
const COLUMN_FAMILIES: &[&str] = &[CF_TRANSACTIONS, CF_METADATA];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 256MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every append (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 64MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("tandem_data"),
            block_cache_size: 256 * 1024 * 1024, // 256MB
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 64 * 1024 * 1024, // 64MB
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches, temp directory).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024, // 8MB
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024, // 4MB
        }
    }
}

impl DocumentMetadata {
    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        Ok(meta)
    }
}

/// RocksDB-backed history store.
///
/// Appends write every transaction plus the bumped metadata in one
/// `WriteBatch`, so a failed or rejected append leaves no trace.
pub struct RocksHistoryStore {
    /// RocksDB instance
    db: DBWithThreadMode<SingleThreaded>,
    /// Store configuration
    config: StoreConfig,
    /// Serializes the version check with the batch write
    append_lock: Mutex<()>,
}

impl RocksHistoryStore {
    /// Open the store at the configured path.
    ///
    /// Creates the database and column families if they don't exist.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.set_max_total_wal_size(128 * 1024 * 1024); // 128MB WAL limit
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        info!("Opened history store at {}", config.path.display());

        Ok(Self {
            db,
            config,
            append_lock: Mutex::new(()),
        })
    }

    /// Build column-family-specific options.
    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024); // 16KB blocks
        opts.set_block_based_table_factory(&block_opts);

        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_TRANSACTIONS => {
                // Values are already LZ4 framed
                opts.set_compression_type(DBCompressionType::None);
                opts.set_max_write_buffer_number(4);
            }
            CF_METADATA => {
                // Small values, frequent reads
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }

        opts
    }

    /// Get the database path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    // ─── Metadata ─────────────────────────────────────────────────────

    fn load_metadata(&self, doc_name: &str) -> Result<Option<DocumentMetadata>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(cf, doc_name.as_bytes())? {
            Some(bytes) => Ok(Some(DocumentMetadata::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    // ─── Transactions ─────────────────────────────────────────────────

    fn encode_transaction(tx: &Transaction) -> Result<Vec<u8>, StoreError> {
        let bytes = bincode::serde::encode_to_vec(tx, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))?;
        Ok(lz4_flex::compress_prepend_size(&bytes))
    }

    fn decode_transaction(value: &[u8]) -> Result<Transaction, StoreError> {
        let bytes = lz4_flex::decompress_size_prepended(value)
            .map_err(|e| StoreError::CompressionError(e.to_string()))?;
        let (tx, _) = bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
            .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        Ok(tx)
    }

    /// Keys of every stored transaction of `doc_name`, in version order.
    fn transaction_keys(&self, doc_name: &str) -> Result<Vec<Box<[u8]>>, StoreError> {
        let cf = self.cf(CF_TRANSACTIONS)?;
        let prefix = Self::doc_prefix(doc_name)?;
        let mut keys = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::From(&prefix, Direction::Forward)) {
            let (key, _) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            keys.push(key);
        }
        Ok(keys)
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, ()>, StoreError> {
        self.append_lock.lock().map_err(|_| StoreError::LockPoisoned)
    }

    fn write_options(&self) -> WriteOptions {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        write_opts
    }

    /// Get a column family handle.
    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{name}' not found")))
    }

    /// Length-prefixed document name, so no name is a key prefix of another.
    fn doc_prefix(doc_name: &str) -> Result<Vec<u8>, StoreError> {
        let len = u16::try_from(doc_name.len())
            .map_err(|_| StoreError::SerializationError("Document name too long".into()))?;
        let mut key = Vec::with_capacity(2 + doc_name.len() + 8);
        key.extend_from_slice(&len.to_be_bytes());
        key.extend_from_slice(doc_name.as_bytes());
        Ok(key)
    }

    /// Build a transaction key: prefix + version (8 bytes big-endian).
    fn transaction_key(doc_name: &str, version: Version) -> Result<Vec<u8>, StoreError> {
        let mut key = Self::doc_prefix(doc_name)?;
        key.extend_from_slice(&version.to_be_bytes());
        Ok(key)
    }
}

impl HistoryStore for RocksHistoryStore {
    fn load(&self, doc_name: &str) -> Result<Change, StoreError> {
        if self.load_metadata(doc_name)?.is_none() {
            let _guard = self.lock()?;
            // Re-check under the lock; another caller may have created it.
            if self.load_metadata(doc_name)?.is_none() {
                let cf_meta = self.cf(CF_METADATA)?;
                let meta = DocumentMetadata::new(doc_name);
                self.db
                    .put_cf_opt(cf_meta, doc_name.as_bytes(), meta.encode()?, &self.write_options())?;
                debug!("Created empty history for '{doc_name}'");
            }
            return Ok(Change::empty(0));
        }

        let cf = self.cf(CF_TRANSACTIONS)?;
        let prefix = Self::doc_prefix(doc_name)?;
        let mut transactions = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::From(&prefix, Direction::Forward)) {
            let (key, value) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            transactions.push(Self::decode_transaction(&value)?);
        }

        debug!("Loaded {} transactions for '{doc_name}'", transactions.len());
        Ok(Change::new(0, transactions))
    }

    fn on_new_change(&self, doc_name: &str, change: &Change) -> Result<Version, StoreError> {
        let _guard = self.lock()?;

        let mut meta = self
            .load_metadata(doc_name)?
            .unwrap_or_else(|| DocumentMetadata::new(doc_name));
        if change.start != meta.version {
            return Err(StoreError::StartMismatch {
                doc_name: doc_name.to_string(),
                expected: meta.version,
                got: change.start,
            });
        }

        let cf_tx = self.cf(CF_TRANSACTIONS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let mut batch = WriteBatch::default();
        for (i, tx) in change.transactions.iter().enumerate() {
            let key = Self::transaction_key(doc_name, change.start + i as Version)?;
            batch.put_cf(cf_tx, key, Self::encode_transaction(tx)?);
        }
        meta.touch(change.end());
        batch.put_cf(cf_meta, doc_name.as_bytes(), meta.encode()?);

        self.db.write_opt(batch, &self.write_options())?;
        Ok(meta.version)
    }

    fn version(&self, doc_name: &str) -> Result<Version, StoreError> {
        Ok(self.load_metadata(doc_name)?.map_or(0, |m| m.version))
    }

    fn metadata(&self, doc_name: &str) -> Result<Option<DocumentMetadata>, StoreError> {
        self.load_metadata(doc_name)
    }

    fn list_documents(&self) -> Result<Vec<String>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let mut names = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            let name = String::from_utf8(key.to_vec())
                .map_err(|_| StoreError::DeserializationError("Invalid document name key".into()))?;
            names.push(name);
        }
        Ok(names)
    }

    fn delete_document(&self, doc_name: &str) -> Result<(), StoreError> {
        let _guard = self.lock()?;
        let cf_tx = self.cf(CF_TRANSACTIONS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let mut batch = WriteBatch::default();
        for key in self.transaction_keys(doc_name)? {
            batch.delete_cf(cf_tx, &key);
        }
        batch.delete_cf(cf_meta, doc_name.as_bytes());
        self.db.write_opt(batch, &self.write_options())?;

        info!("Deleted document '{doc_name}'");
        Ok(())
    }

    fn drop_database(&self) -> Result<(), StoreError> {
        let _guard = self.lock()?;

        let mut batch = WriteBatch::default();
        let mut count = 0u64;
        for name in COLUMN_FAMILIES {
            let cf = self.cf(name)?;
            for item in self.db.iterator_cf(cf, IteratorMode::Start) {
                let (key, _) = item?;
                batch.delete_cf(cf, &key);
                count += 1;
            }
        }
        if count > 0 {
            self.db.write_opt(batch, &self.write_options())?;
        }

        info!("Dropped history database ({count} keys)");
        Ok(())
    }

    fn on_close(&self) -> Result<(), StoreError> {
        for name in COLUMN_FAMILIES {
            self.db.flush_cf(self.cf(name)?)?;
        }
        Ok(())
    }
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_core::{text_items, AnnotateMethod, Range};
    use tempfile::{tempdir, TempDir};

    fn open_temp() -> (TempDir, RocksHistoryStore) {
        let dir = tempdir().unwrap();
        let store = RocksHistoryStore::open(StoreConfig::for_testing(dir.path())).unwrap();
        (dir, store)
    }

    fn typing(count: usize) -> Vec<Transaction> {
        (0..count)
            .map(|i| Transaction::insertion(i, i, text_items("x")).unwrap().with_author(1))
            .collect()
    }

    #[test]
    fn test_store_open_close() {
        let (_dir, store) = open_temp();
        assert!(store.path().exists());
        store.on_close().unwrap();
    }

    #[test]
    fn test_load_unknown_creates_record() {
        let (_dir, store) = open_temp();
        assert_eq!(store.load("fresh").unwrap(), Change::empty(0));
        let meta = store.metadata("fresh").unwrap().unwrap();
        assert_eq!(meta.version, 0);
        assert!(meta.created_at > 0);
        assert_eq!(store.list_documents().unwrap(), vec!["fresh".to_string()]);
    }

    #[test]
    fn test_append_roundtrip_preserves_transactions() {
        let (_dir, store) = open_temp();
        let doc = text_items("bold move");
        let annotate = Transaction::annotation(doc.len(), Range::new(0, 4), AnnotateMethod::Set, "b")
            .unwrap()
            .with_author(2);
        let change = Change::new(0, vec![annotate.clone()]);

        assert_eq!(store.on_new_change("doc", &change).unwrap(), 1);
        let loaded = store.load("doc").unwrap();
        assert_eq!(loaded.transactions, vec![annotate]);
    }

    #[test]
    fn test_versions_are_monotonic() {
        let (_dir, store) = open_temp();
        let txs = typing(300);
        let mut start = 0;
        for chunk in txs.chunks(7) {
            let change = Change::new(start, chunk.to_vec());
            start = store.on_new_change("doc", &change).unwrap();
        }
        assert_eq!(start, 300);
        assert_eq!(store.version("doc").unwrap(), 300);
        // Keys must sort numerically past 255.
        assert_eq!(store.load("doc").unwrap().transactions, txs);
    }

    #[test]
    fn test_start_mismatch_writes_nothing() {
        let (_dir, store) = open_temp();
        store.on_new_change("doc", &Change::new(0, typing(2))).unwrap();
        let before = store.load("doc").unwrap();
        let meta_before = store.metadata("doc").unwrap();

        let err = store.on_new_change("doc", &Change::new(5, typing(1))).unwrap_err();
        assert!(matches!(err, StoreError::StartMismatch { expected: 2, got: 5, .. }));
        assert_eq!(store.load("doc").unwrap(), before);
        assert_eq!(store.metadata("doc").unwrap(), meta_before);
    }

    #[test]
    fn test_prefix_names_do_not_collide() {
        let (_dir, store) = open_temp();
        store.on_new_change("ab", &Change::new(0, typing(1))).unwrap();
        store.on_new_change("abc", &Change::new(0, typing(2))).unwrap();
        assert_eq!(store.load("ab").unwrap().len(), 1);
        assert_eq!(store.load("abc").unwrap().len(), 2);
    }

    #[test]
    fn test_delete_document() {
        let (_dir, store) = open_temp();
        store.on_new_change("gone", &Change::new(0, typing(3))).unwrap();
        store.on_new_change("kept", &Change::new(0, typing(1))).unwrap();

        store.delete_document("gone").unwrap();
        assert_eq!(store.version("gone").unwrap(), 0);
        assert_eq!(store.list_documents().unwrap(), vec!["kept".to_string()]);
        assert_eq!(store.load("gone").unwrap(), Change::empty(0));
        assert_eq!(store.load("kept").unwrap().len(), 1);
    }

    #[test]
    fn test_drop_database() {
        let (_dir, store) = open_temp();
        for name in ["a", "b", "c"] {
            store.on_new_change(name, &Change::new(0, typing(2))).unwrap();
        }
        store.drop_database().unwrap();
        for name in ["a", "b", "c"] {
            assert_eq!(store.load(name).unwrap(), Change::empty(0));
        }
    }

    #[test]
    fn test_history_survives_reopen() {
        let dir = tempdir().unwrap();
        let config = StoreConfig::for_testing(dir.path());
        {
            let store = RocksHistoryStore::open(config.clone()).unwrap();
            store.on_new_change("doc", &Change::new(0, typing(4))).unwrap();
            store.on_close().unwrap();
        }
        let store = RocksHistoryStore::open(config).unwrap();
        assert_eq!(store.version("doc").unwrap(), 4);
        assert_eq!(store.load("doc").unwrap().transactions, typing(4));
    }

    #[test]
    fn test_store_config_default() {
        let config = StoreConfig::default();
        assert_eq!(config.block_cache_size, 256 * 1024 * 1024);
        assert_eq!(config.bloom_filter_bits, 10);
        assert!(!config.sync_writes);
    }

    #[test]
    fn test_store_error_display() {
        let err = StoreError::StartMismatch {
            doc_name: "Bar".into(),
            expected: 0,
            got: 44,
        };
        assert!(err.to_string().contains("Start mismatch"));

        let err = StoreError::DatabaseError("test".into());
        assert!(err.to_string().contains("Database error"));
    }
}
