//! In-process history store for tests and ephemeral servers.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tandem_core::{Change, Transaction, Version};

use super::{DocumentMetadata, HistoryStore, StoreError};

#[derive(Debug)]
struct DocumentRecord {
    transactions: Vec<Transaction>,
    metadata: DocumentMetadata,
}

impl DocumentRecord {
    fn new(doc_name: &str) -> Self {
        Self {
            transactions: Vec::new(),
            metadata: DocumentMetadata::new(doc_name),
        }
    }
}

/// History store backed by a mutex-guarded map.
#[derive(Debug, Default)]
pub struct MemoryHistoryStore {
    documents: Mutex<HashMap<String, DocumentRecord>>,
}

impl MemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, DocumentRecord>>, StoreError> {
        self.documents.lock().map_err(|_| StoreError::LockPoisoned)
    }
}

impl HistoryStore for MemoryHistoryStore {
    fn load(&self, doc_name: &str) -> Result<Change, StoreError> {
        let mut docs = self.lock()?;
        let record = docs
            .entry(doc_name.to_string())
            .or_insert_with(|| DocumentRecord::new(doc_name));
        Ok(Change::new(0, record.transactions.clone()))
    }

    fn on_new_change(&self, doc_name: &str, change: &Change) -> Result<Version, StoreError> {
        let mut docs = self.lock()?;
        let record = docs
            .entry(doc_name.to_string())
            .or_insert_with(|| DocumentRecord::new(doc_name));

        let stored = record.transactions.len() as Version;
        if change.start != stored {
            return Err(StoreError::StartMismatch {
                doc_name: doc_name.to_string(),
                expected: stored,
                got: change.start,
            });
        }

        record.transactions.extend(change.transactions.iter().cloned());
        let version = record.transactions.len() as Version;
        record.metadata.touch(version);
        Ok(version)
    }

    fn version(&self, doc_name: &str) -> Result<Version, StoreError> {
        Ok(self
            .lock()?
            .get(doc_name)
            .map_or(0, |r| r.transactions.len() as Version))
    }

    fn metadata(&self, doc_name: &str) -> Result<Option<DocumentMetadata>, StoreError> {
        Ok(self.lock()?.get(doc_name).map(|r| r.metadata.clone()))
    }

    fn list_documents(&self) -> Result<Vec<String>, StoreError> {
        let mut names: Vec<String> = self.lock()?.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    fn delete_document(&self, doc_name: &str) -> Result<(), StoreError> {
        self.lock()?.remove(doc_name);
        Ok(())
    }

    fn drop_database(&self) -> Result<(), StoreError> {
        self.lock()?.clear();
        Ok(())
    }

    fn on_close(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_core::text_items;

    fn tx(len: usize, s: &str) -> Transaction {
        Transaction::insertion(len, len, text_items(s)).unwrap()
    }

    #[test]
    fn test_load_creates_empty_record() {
        let store = MemoryHistoryStore::new();
        assert_eq!(store.load("doc").unwrap(), Change::empty(0));
        assert_eq!(store.list_documents().unwrap(), vec!["doc".to_string()]);
        assert_eq!(store.metadata("doc").unwrap().unwrap().version, 0);
    }

    #[test]
    fn test_append_and_version() {
        let store = MemoryHistoryStore::new();
        let v = store
            .on_new_change("doc", &Change::new(0, vec![tx(0, "a"), tx(1, "b")]))
            .unwrap();
        assert_eq!(v, 2);
        assert_eq!(store.version("doc").unwrap(), 2);
        assert_eq!(store.load("doc").unwrap().len(), 2);
    }

    #[test]
    fn test_start_mismatch_leaves_store_unchanged() {
        let store = MemoryHistoryStore::new();
        store.on_new_change("doc", &Change::new(0, vec![tx(0, "a")])).unwrap();
        let before = store.load("doc").unwrap();

        let err = store
            .on_new_change("doc", &Change::new(0, vec![tx(0, "z")]))
            .unwrap_err();
        assert_eq!(
            err,
            StoreError::StartMismatch {
                doc_name: "doc".into(),
                expected: 1,
                got: 0,
            }
        );
        assert_eq!(store.load("doc").unwrap(), before);
    }

    #[test]
    fn test_drop_database() {
        let store = MemoryHistoryStore::new();
        store.on_new_change("a", &Change::new(0, vec![tx(0, "x")])).unwrap();
        store.on_new_change("b", &Change::new(0, vec![tx(0, "y")])).unwrap();
        store.drop_database().unwrap();
        assert_eq!(store.load("a").unwrap(), Change::empty(0));
        assert_eq!(store.load("b").unwrap(), Change::empty(0));
    }
}
