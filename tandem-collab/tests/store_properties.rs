//! History store properties, checked against both backends.
//!
//! Every check takes `&dyn HistoryStore` so the in-memory and RocksDB
//! stores are held to the same contract.

use tandem_collab::storage::{HistoryStore, MemoryHistoryStore, RocksHistoryStore, StoreConfig, StoreError};
use tandem_core::{text_items, Change, Transaction};
use tempfile::TempDir;

/// Typing `s` at the end of a document of length `len`.
fn typed(len: usize, s: &str) -> Transaction {
    Transaction::insertion(len, len, text_items(s)).unwrap()
}

/// One transaction per chunk, each appended after the previous.
fn typing(start: u64, mut len: usize, chunks: &[&str]) -> Change {
    let transactions = chunks
        .iter()
        .map(|chunk| {
            let tx = typed(len, chunk);
            len += chunk.chars().count();
            tx
        })
        .collect();
    Change::new(start, transactions)
}

fn rocks() -> (TempDir, RocksHistoryStore) {
    let dir = tempfile::tempdir().unwrap();
    let store = RocksHistoryStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
    (dir, store)
}

fn foo_bar_scenario(store: &dyn HistoryStore) {
    let first = typing(0, 0, &["W", "o", "rld"]);
    assert_eq!(store.on_new_change("Foo", &first).unwrap(), 3);

    let second = Change::new(
        3,
        vec![
            Transaction::insertion(5, 0, text_items("H")).unwrap(),
            Transaction::insertion(6, 1, text_items("e")).unwrap(),
            Transaction::insertion(7, 2, text_items("l")).unwrap(),
            Transaction::insertion(8, 3, text_items("l")).unwrap(),
            Transaction::insertion(9, 4, text_items("o")).unwrap(),
            Transaction::insertion(10, 5, text_items(" ")).unwrap(),
        ],
    );
    assert_eq!(store.on_new_change("Foo", &second).unwrap(), 9);

    let loaded = store.load("Foo").unwrap();
    assert_eq!(loaded.start, 0);
    assert_eq!(loaded.len(), 9);
    let mut expected = first.transactions.clone();
    expected.extend(second.transactions.iter().cloned());
    assert_eq!(loaded.transactions, expected);
    let doc = loaded.apply_to(&[]).unwrap();
    assert_eq!(tandem_core::plain_text(&doc), "Hello World");

    let bar = typing(44, 0, &["x", "y"]);
    let err = store.on_new_change("Bar", &bar).unwrap_err();
    assert_eq!(
        err,
        StoreError::StartMismatch {
            doc_name: "Bar".into(),
            expected: 0,
            got: 44,
        }
    );
    assert_eq!(store.load("Bar").unwrap(), Change::empty(0));
}

fn monotonic_version(store: &dyn HistoryStore) {
    let sizes = [1usize, 4, 2, 7];
    let mut len = 0;
    let mut version = 0u64;
    for n in sizes {
        let chunks: Vec<String> = (0..n).map(|i| ((b'a' + i as u8) as char).to_string()).collect();
        let refs: Vec<&str> = chunks.iter().map(String::as_str).collect();
        version = store.on_new_change("doc", &typing(version, len, &refs)).unwrap();
        len += n;
    }
    let loaded = store.load("doc").unwrap();
    assert_eq!(loaded.start, 0);
    assert_eq!(loaded.len(), sizes.iter().sum::<usize>());
    assert_eq!(store.version("doc").unwrap(), version);
}

fn optimistic_concurrency(store: &dyn HistoryStore) {
    store.on_new_change("doc", &typing(0, 0, &["a", "b"])).unwrap();
    let before = store.load("doc").unwrap();

    for start in [0u64, 1, 3, 100] {
        let result = store.on_new_change("doc", &typing(start, 2, &["z"]));
        assert!(matches!(result, Err(StoreError::StartMismatch { expected: 2, .. })));
        assert_eq!(store.load("doc").unwrap(), before);
    }
}

fn reset_idempotence(store: &dyn HistoryStore) {
    for name in ["a", "b", "c"] {
        store.on_new_change(name, &typing(0, 0, &["x"])).unwrap();
    }
    store.drop_database().unwrap();
    store.drop_database().unwrap();
    for name in ["a", "b", "c"] {
        assert_eq!(store.load(name).unwrap(), Change::empty(0));
    }
}

fn document_isolation(store: &dyn HistoryStore) {
    let bar_before = store.load("Bar").unwrap();
    store.on_new_change("Foo", &typing(0, 0, &["one", "two"])).unwrap();
    store.on_new_change("Foo", &typing(2, 6, &["three"])).unwrap();
    assert_eq!(store.load("Bar").unwrap(), bar_before);
    assert_eq!(store.version("Bar").unwrap(), 0);
}

fn delete_document(store: &dyn HistoryStore) {
    store.on_new_change("gone", &typing(0, 0, &["x"])).unwrap();
    store.on_new_change("kept", &typing(0, 0, &["y"])).unwrap();
    store.delete_document("gone").unwrap();
    assert_eq!(store.list_documents().unwrap(), vec!["kept".to_string()]);
    assert_eq!(store.version("gone").unwrap(), 0);
    assert_eq!(store.version("kept").unwrap(), 1);
}

macro_rules! both_stores {
    ($($name:ident),* $(,)?) => {
        mod memory {
            $(
                #[test]
                fn $name() {
                    super::$name(&super::MemoryHistoryStore::new());
                }
            )*
        }

        mod rocks {
            $(
                #[test]
                fn $name() {
                    let (_dir, store) = super::rocks();
                    super::$name(&store);
                }
            )*
        }
    };
}

both_stores!(
    foo_bar_scenario,
    monotonic_version,
    optimistic_concurrency,
    reset_idempotence,
    document_isolation,
    delete_document,
);

#[test]
fn test_rocks_history_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("db");
    let change = typing(0, 0, &["Hello", ", ", "world"]);

    {
        let store = RocksHistoryStore::open(StoreConfig::for_testing(&path)).unwrap();
        store.on_new_change("doc", &change).unwrap();
        store.on_close().unwrap();
    }

    let store = RocksHistoryStore::open(StoreConfig::for_testing(&path)).unwrap();
    assert_eq!(store.load("doc").unwrap(), change);
    assert_eq!(store.metadata("doc").unwrap().unwrap().version, 3);
    store.on_new_change("doc", &typing(3, 12, &["!"])).unwrap();
    assert_eq!(store.version("doc").unwrap(), 4);
}
