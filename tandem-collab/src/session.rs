//! Per-document collaboration state: history, materialized document and
//! the author registry.
//!
//! A session is owned by exactly one document actor (see [`crate::service`]);
//! nothing else mutates it.

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tandem_core::{AuthorId, Change, ChangeError, Item, Version};

/// Secret token length in bytes (128 bits).
const TOKEN_BYTES: usize = 16;

/// Public author fields, as broadcast to the room.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorData {
    pub name: String,
    pub color: String,
}

/// One author of a document, including server-side secrets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Author {
    pub name: String,
    pub color: String,
    /// Transactions rejected by rebase over the author's lifetime
    pub rejections: u64,
    /// Pending change the author must reconcile before continuing
    pub continue_base: Option<Change>,
    /// Resumption secret, never broadcast
    pub token: String,
    pub active: bool,
}

impl Author {
    /// Fresh author with empty display data and a random token.
    pub fn new() -> Self {
        Self {
            name: String::new(),
            color: String::new(),
            rejections: 0,
            continue_base: None,
            token: generate_token(),
            active: true,
        }
    }

    pub fn data(&self) -> AuthorData {
        AuthorData {
            name: self.name.clone(),
            color: self.color.clone(),
        }
    }
}

impl Default for Author {
    fn default() -> Self {
        Self::new()
    }
}

/// 128-bit token from the OS CSPRNG, hex encoded.
fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Serializable view of a session without secrets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub doc_name: String,
    pub version: Version,
    pub history: Change,
    pub authors: BTreeMap<AuthorId, AuthorData>,
}

/// One document's history plus its authors.
#[derive(Debug)]
pub struct CollaborationSession {
    doc_name: String,
    history: Change,
    document: Vec<Item>,
    authors: BTreeMap<AuthorId, Author>,
    next_author_id: AuthorId,
}

impl CollaborationSession {
    pub fn new(doc_name: impl Into<String>) -> Self {
        Self {
            doc_name: doc_name.into(),
            history: Change::empty(0),
            document: Vec::new(),
            authors: BTreeMap::new(),
            next_author_id: 1,
        }
    }

    /// Session over a stored history, replaying it to materialize the document.
    pub fn from_history(doc_name: impl Into<String>, history: Change) -> Result<Self, ChangeError> {
        let mut session = Self::new(doc_name);
        session.replace_history(history)?;
        Ok(session)
    }

    pub fn doc_name(&self) -> &str {
        &self.doc_name
    }

    pub fn history(&self) -> &Change {
        &self.history
    }

    pub fn document(&self) -> &[Item] {
        &self.document
    }

    pub fn version(&self) -> Version {
        self.history.end()
    }

    // ─── Authors ──────────────────────────────────────────────────────

    /// Register a new author and return its id.
    pub fn add_author(&mut self) -> AuthorId {
        let id = self.next_author_id;
        self.next_author_id += 1;
        self.authors.insert(id, Author::new());
        id
    }

    pub fn author(&self, id: AuthorId) -> Option<&Author> {
        self.authors.get(&id)
    }

    pub fn author_mut(&mut self, id: AuthorId) -> Option<&mut Author> {
        self.authors.get_mut(&id)
    }

    /// True when `id` exists and `token` matches its secret.
    pub fn verify_token(&self, id: AuthorId, token: &str) -> bool {
        self.authors.get(&id).is_some_and(|a| a.token == token)
    }

    /// Public data of every active author.
    pub fn get_active_authors(&self) -> BTreeMap<AuthorId, AuthorData> {
        self.authors
            .iter()
            .filter(|(_, a)| a.active)
            .map(|(id, a)| (*id, a.data()))
            .collect()
    }

    // ─── History ──────────────────────────────────────────────────────

    /// Committed transactions from version `start` onwards.
    pub fn history_since(&self, start: Version) -> Result<Change, ChangeError> {
        self.history.most_recent(start)
    }

    /// Longest prefix of `change` that applies to the current document,
    /// and the document after it.
    pub fn apply_prefix(&self, change: &Change) -> (Change, Vec<Item>) {
        let mut document = self.document.clone();
        let mut applied = Change::empty(change.start);
        for tx in &change.transactions {
            match tx.apply(&document) {
                Ok(next) => {
                    document = next;
                    applied.push(tx.clone());
                }
                Err(_) => break,
            }
        }
        (applied, document)
    }

    /// Append a committed change whose effect on the document is `document`.
    pub fn record(&mut self, change: Change, document: Vec<Item>) -> Result<(), ChangeError> {
        self.history.concat(change)?;
        self.document = document;
        Ok(())
    }

    /// Replace the history (e.g. after reloading from the store). Authors are kept.
    pub fn replace_history(&mut self, history: Change) -> Result<(), ChangeError> {
        if history.start != 0 {
            return Err(ChangeError::StartMismatch {
                expected: 0,
                got: history.start,
            });
        }
        self.document = history.apply_to(&[])?;
        self.history = history;
        Ok(())
    }

    /// Reset history and document; every author's pending change is dropped.
    pub fn clear_history(&mut self) {
        self.history = Change::empty(0);
        self.document.clear();
        for author in self.authors.values_mut() {
            author.continue_base = None;
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            doc_name: self.doc_name.clone(),
            version: self.version(),
            history: self.history.clone(),
            authors: self.get_active_authors(),
        }
    }
}
