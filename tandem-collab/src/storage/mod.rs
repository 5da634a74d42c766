//! Persistent, append-only transaction history per document.
//!
//! Architecture:
//! ```text
//! ┌──────────────┐  on_new_change(doc, change)  ┌─────────────────────┐
//! │ DocumentActor│ ───────────────────────────► │ dyn HistoryStore    │
//! │ (per doc)    │ ◄─────────────────────────── │                     │
//! └──────────────┘  load(doc) → Change{start:0} ├─────────────────────┤
//!                                               │ MemoryHistoryStore  │
//!                                               │ RocksHistoryStore   │
//!                                               │  CF "transactions"  │
//!                                               │  CF "metadata"      │
//!                                               └─────────────────────┘
//! ```
//!
//! Appends are optimistic: a change is accepted only when its `start`
//! equals the stored version, and is written in a single atomic batch.
//!
//! Reference: Kleppmann — Designing Data-Intensive Applications, Chapter 7 (Optimistic Concurrency)

pub mod memory;
pub mod rocks;

pub use memory::MemoryHistoryStore;
pub use rocks::{RocksHistoryStore, StoreConfig};

use serde::{Deserialize, Serialize};
use std::time::SystemTime;
use tandem_core::{Change, Version};

/// Storage errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Append rejected: the change does not start at the stored version.
    StartMismatch {
        doc_name: String,
        expected: Version,
        got: Version,
    },
    /// RocksDB internal error
    DatabaseError(String),
    /// Serialization failed
    SerializationError(String),
    /// Deserialization failed
    DeserializationError(String),
    /// Compression error
    CompressionError(String),
    /// A writer panicked while holding the store lock
    LockPoisoned,
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::StartMismatch { doc_name, expected, got } => write!(
                f,
                "Start mismatch for '{doc_name}': stored version is {expected}, change starts at {got}"
            ),
            StoreError::DatabaseError(e) => write!(f, "Database error: {e}"),
            StoreError::SerializationError(e) => write!(f, "Serialization error: {e}"),
            StoreError::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            StoreError::CompressionError(e) => write!(f, "Compression error: {e}"),
            StoreError::LockPoisoned => write!(f, "Store lock poisoned"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

/// Per-document bookkeeping kept next to the transaction log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub doc_name: String,
    /// Number of committed transactions
    pub version: Version,
    /// Creation timestamp (seconds since epoch)
    pub created_at: u64,
    /// Last append timestamp (seconds since epoch)
    pub updated_at: u64,
}

impl DocumentMetadata {
    pub(crate) fn new(doc_name: &str) -> Self {
        let now = now_secs();
        Self {
            doc_name: doc_name.to_string(),
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub(crate) fn touch(&mut self, version: Version) {
        self.version = version;
        self.updated_at = now_secs();
    }
}

pub(crate) fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Durable history backend shared by every document actor.
///
/// Calls are synchronous; each document's actor is the only writer for
/// that document, but implementations must still tolerate concurrent
/// appends from a stale actor and reject them with `StartMismatch`.
pub trait HistoryStore: Send + Sync {
    /// Full history as `Change { start: 0, .. }`. Unknown documents are
    /// created empty.
    fn load(&self, doc_name: &str) -> Result<Change, StoreError>;

    /// Append `change` iff `change.start` equals the stored version.
    /// Returns the new version. On mismatch nothing is written.
    fn on_new_change(&self, doc_name: &str, change: &Change) -> Result<Version, StoreError>;

    /// Stored version, 0 for unknown documents.
    fn version(&self, doc_name: &str) -> Result<Version, StoreError>;

    fn metadata(&self, doc_name: &str) -> Result<Option<DocumentMetadata>, StoreError>;

    /// Names of every known document.
    fn list_documents(&self) -> Result<Vec<String>, StoreError>;

    /// Remove one document and its history.
    fn delete_document(&self, doc_name: &str) -> Result<(), StoreError>;

    /// Remove every document.
    fn drop_database(&self) -> Result<(), StoreError>;

    /// Flush pending writes before shutdown.
    fn on_close(&self) -> Result<(), StoreError>;
}
