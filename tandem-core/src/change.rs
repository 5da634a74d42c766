//! Versioned batches of transactions and the rebase step.
//!
//! ```text
//!  version:   0    1    2    3    4    5
//!  history:   ├─T0─┼─T1─┼─T2─┼─T3─┤
//!  incoming:            ├─U0─┼─U1─┤          start = 2
//!
//!  rebase_onto(history[2..4]):
//!  result:                        ├─U0'┼─U1'┤ start = 4
//! ```
//!
//! Each incoming transaction is transposed past every committed one in
//! order. The first one whose modified range overlaps a committed edit is
//! rejected along with everything after it, since later transactions were
//! authored on top of it.

use log::debug;
use serde::{Deserialize, Serialize};

use crate::item::Item;
use crate::transaction::{Transaction, TransactionError};

/// Number of transactions committed to a document since creation.
pub type Version = u64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeError {
    /// `compose`/`concat` on changes that do not follow each other.
    NotContiguous { expected: Version, got: Version },
    /// `rebase_onto` against history that starts elsewhere.
    StartMismatch { expected: Version, got: Version },
    /// Requested version lies outside the change.
    OutOfRange { version: Version, start: Version, end: Version },
    /// A transaction failed to apply or compose.
    Transaction { version: Version, source: TransactionError },
    /// JSON encoding or decoding failed.
    Serialization(String),
}

impl std::fmt::Display for ChangeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotContiguous { expected, got } => {
                write!(f, "Changes are not contiguous: expected start {expected}, got {got}")
            }
            Self::StartMismatch { expected, got } => {
                write!(f, "Rebase base mismatch: expected start {expected}, got {got}")
            }
            Self::OutOfRange { version, start, end } => {
                write!(f, "Version {version} outside change [{start}, {end}]")
            }
            Self::Transaction { version, source } => {
                write!(f, "Transaction at version {version}: {source}")
            }
            Self::Serialization(e) => write!(f, "Serialization error: {e}"),
        }
    }
}

impl std::error::Error for ChangeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Transaction { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// An ordered, contiguous run of transactions anchored at `start`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Change {
    pub start: Version,
    pub transactions: Vec<Transaction>,
}

/// Outcome of [`Change::rebase_onto`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RebaseResult {
    /// Every transaction was rebased.
    Applied(Change),
    /// A prefix was rebased; the rest conflicted.
    PartiallyApplied { rebased: Change, rejected: Change },
    /// The first transaction already conflicted.
    Rejected { rejected: Change },
}

impl RebaseResult {
    pub fn rebased(&self) -> Option<&Change> {
        match self {
            RebaseResult::Applied(change) | RebaseResult::PartiallyApplied { rebased: change, .. } => Some(change),
            RebaseResult::Rejected { .. } => None,
        }
    }

    pub fn rejected(&self) -> Option<&Change> {
        match self {
            RebaseResult::Applied(_) => None,
            RebaseResult::PartiallyApplied { rejected, .. } | RebaseResult::Rejected { rejected } => Some(rejected),
        }
    }

    pub fn rejected_count(&self) -> usize {
        self.rejected().map_or(0, Change::len)
    }

    /// Split into the accepted and rejected parts.
    pub fn into_parts(self) -> (Option<Change>, Option<Change>) {
        match self {
            RebaseResult::Applied(change) => (Some(change), None),
            RebaseResult::PartiallyApplied { rebased, rejected } => (Some(rebased), Some(rejected)),
            RebaseResult::Rejected { rejected } => (None, Some(rejected)),
        }
    }
}

impl Change {
    pub fn new(start: Version, transactions: Vec<Transaction>) -> Self {
        Self { start, transactions }
    }

    /// Change with no transactions at `start`.
    pub fn empty(start: Version) -> Self {
        Self::new(start, Vec::new())
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    /// Version reached after applying this change.
    pub fn end(&self) -> Version {
        self.start.saturating_add(self.transactions.len() as Version)
    }

    pub fn push(&mut self, transaction: Transaction) {
        self.transactions.push(transaction);
    }

    /// Concatenation of `self` followed by `other`.
    pub fn compose(&self, other: &Change) -> Result<Change, ChangeError> {
        let mut composed = self.clone();
        composed.concat(other.clone())?;
        Ok(composed)
    }

    /// Append `other` in place.
    pub fn concat(&mut self, other: Change) -> Result<(), ChangeError> {
        if other.start != self.end() {
            return Err(ChangeError::NotContiguous {
                expected: self.end(),
                got: other.start,
            });
        }
        self.transactions.extend(other.transactions);
        Ok(())
    }

    /// The first `len` transactions.
    pub fn truncate(&self, len: usize) -> Change {
        Change::new(self.start, self.transactions.iter().take(len).cloned().collect())
    }

    /// Transactions from version `start` onwards.
    pub fn most_recent(&self, start: Version) -> Result<Change, ChangeError> {
        if start < self.start || start > self.end() {
            return Err(ChangeError::OutOfRange {
                version: start,
                start: self.start,
                end: self.end(),
            });
        }
        let skip = (start - self.start) as usize;
        Ok(Change::new(start, self.transactions[skip..].to_vec()))
    }

    /// Apply every transaction in order to `doc`.
    pub fn apply_to(&self, doc: &[Item]) -> Result<Vec<Item>, ChangeError> {
        let mut current = doc.to_vec();
        for (i, tx) in self.transactions.iter().enumerate() {
            current = tx.apply(&current).map_err(|source| ChangeError::Transaction {
                version: self.start + i as Version,
                source,
            })?;
        }
        Ok(current)
    }

    /// Compose all transactions into one. `None` for an empty change.
    pub fn squash(&self) -> Result<Option<Transaction>, ChangeError> {
        let mut iter = self.transactions.iter().enumerate();
        let Some((_, first)) = iter.next() else {
            return Ok(None);
        };
        let mut acc = first.clone();
        for (i, tx) in iter {
            acc = acc.compose(tx).map_err(|source| ChangeError::Transaction {
                version: self.start + i as Version,
                source,
            })?;
        }
        Ok(Some(acc))
    }

    /// Rebase onto `committed`, which holds everything accepted since `self.start`.
    pub fn rebase_onto(&self, committed: &Change) -> Result<RebaseResult, ChangeError> {
        if committed.start != self.start {
            return Err(ChangeError::StartMismatch {
                expected: committed.start,
                got: self.start,
            });
        }

        // `base` always holds the committed history transformed to apply
        // after the transactions of `self` accepted so far.
        let mut base = committed.transactions.clone();
        let mut rebased = Vec::with_capacity(self.transactions.len());
        let mut rejected_from = None;

        'outer: for (i, tx) in self.transactions.iter().enumerate() {
            let mut moved = tx.clone();
            let mut next_base = Vec::with_capacity(base.len());
            for c in &base {
                match Transaction::transpose(c, &moved) {
                    Some((c2, t2)) => {
                        next_base.push(c2);
                        moved = t2;
                    }
                    None => {
                        rejected_from = Some(i);
                        break 'outer;
                    }
                }
            }
            rebased.push(moved);
            base = next_base;
        }

        let rebased = Change::new(committed.end(), rebased);
        Ok(match rejected_from {
            None => RebaseResult::Applied(rebased),
            Some(i) => {
                let rejected = Change::new(self.start + i as Version, self.transactions[i..].to_vec());
                debug!(
                    "Rebase conflict at version {}: {} of {} transactions rejected",
                    rejected.start,
                    rejected.len(),
                    self.len()
                );
                if rebased.is_empty() {
                    RebaseResult::Rejected { rejected }
                } else {
                    RebaseResult::PartiallyApplied { rebased, rejected }
                }
            }
        })
    }

    /// JSON wire form: `{ "start": n, "transactions": [...] }`.
    pub fn serialize(&self) -> Result<String, ChangeError> {
        serde_json::to_string(self).map_err(|e| ChangeError::Serialization(e.to_string()))
    }

    pub fn deserialize(data: &str) -> Result<Change, ChangeError> {
        serde_json::from_str(data).map_err(|e| ChangeError::Serialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::{plain_text, text_items};
    use crate::range::Range;

    fn insert(doc: &[Item], offset: usize, s: &str) -> Transaction {
        Transaction::insertion(doc.len(), offset, text_items(s)).unwrap()
    }

    fn remove(doc: &[Item], from: usize, to: usize) -> Transaction {
        Transaction::replacement(doc, Range::new(from, to), Vec::new()).unwrap()
    }

    #[test]
    fn test_compose_requires_contiguity() {
        let a = Change::new(0, vec![Transaction::noop(0); 3]);
        let b = Change::new(3, vec![Transaction::noop(0); 2]);
        let c = a.compose(&b).unwrap();
        assert_eq!(c.start, 0);
        assert_eq!(c.end(), 5);

        let gap = Change::new(4, vec![Transaction::noop(0)]);
        assert_eq!(
            a.compose(&gap),
            Err(ChangeError::NotContiguous { expected: 3, got: 4 })
        );
    }

    #[test]
    fn test_most_recent_and_truncate() {
        let change = Change::new(2, vec![Transaction::noop(0); 4]);
        assert_eq!(change.most_recent(4).unwrap(), Change::new(4, vec![Transaction::noop(0); 2]));
        assert!(change.most_recent(6).unwrap().is_empty());
        assert!(change.most_recent(1).is_err());
        assert!(change.most_recent(7).is_err());
        assert_eq!(change.truncate(1).len(), 1);
    }

    #[test]
    fn test_rebase_applies_disjoint_edits() {
        let base = text_items("Hello world");
        let committed_tx = insert(&base, 0, "Say: ");
        let committed = Change::new(0, vec![committed_tx]);

        let t0 = insert(&base, 11, "!");
        let mid = t0.apply(&base).unwrap();
        let t1 = insert(&mid, 12, "?");
        let incoming = Change::new(0, vec![t0, t1]);

        let result = incoming.rebase_onto(&committed).unwrap();
        let rebased = match &result {
            RebaseResult::Applied(change) => change.clone(),
            other => panic!("Expected Applied, got {other:?}"),
        };
        assert_eq!(rebased.start, 1);
        assert_eq!(result.rejected_count(), 0);

        let doc = committed.apply_to(&base).unwrap();
        let doc = rebased.apply_to(&doc).unwrap();
        assert_eq!(plain_text(&doc), "Say: Hello world!?");
    }

    #[test]
    fn test_rebase_rejects_overlap_and_tail() {
        let base = text_items("abcdefgh");
        let committed = Change::new(0, vec![remove(&base, 2, 5)]);

        let t0 = insert(&base, 7, "X");
        let mid = t0.apply(&base).unwrap();
        let t1 = remove(&mid, 3, 4);
        let mid2 = t1.apply(&mid).unwrap();
        let t2 = insert(&mid2, 0, "Y");
        let incoming = Change::new(0, vec![t0, t1, t2]);

        let result = incoming.rebase_onto(&committed).unwrap();
        match &result {
            RebaseResult::PartiallyApplied { rebased, rejected } => {
                assert_eq!(rebased.start, 1);
                assert_eq!(rebased.len(), 1);
                assert_eq!(rejected.start, 1);
                assert_eq!(rejected.len(), 2);
            }
            other => panic!("Expected PartiallyApplied, got {other:?}"),
        }
        assert_eq!(result.rejected_count(), 2);
    }

    #[test]
    fn test_rebase_fully_rejected() {
        let base = text_items("abc");
        let committed = Change::new(0, vec![remove(&base, 0, 2)]);
        let incoming = Change::new(0, vec![remove(&base, 1, 3)]);
        let result = incoming.rebase_onto(&committed).unwrap();
        assert!(matches!(result, RebaseResult::Rejected { .. }));
        assert!(result.rebased().is_none());
    }

    #[test]
    fn test_rebase_onto_empty_history() {
        let base = text_items("abc");
        let incoming = Change::new(5, vec![insert(&base, 1, "z")]);
        let result = incoming.rebase_onto(&Change::empty(5)).unwrap();
        assert_eq!(result, RebaseResult::Applied(incoming));
    }

    #[test]
    fn test_rebase_start_mismatch() {
        let incoming = Change::new(2, Vec::new());
        assert_eq!(
            incoming.rebase_onto(&Change::empty(3)),
            Err(ChangeError::StartMismatch { expected: 3, got: 2 })
        );
    }

    #[test]
    fn test_rebase_is_deterministic() {
        let base = text_items("one two three");
        let committed = Change::new(0, vec![insert(&base, 4, "and ")]);
        let incoming = Change::new(0, vec![insert(&base, 13, "!")]);
        let first = incoming.rebase_onto(&committed).unwrap();
        let second = incoming.rebase_onto(&committed).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_squash_matches_apply() {
        let base = text_items("abc");
        let t0 = insert(&base, 3, "d");
        let mid = t0.apply(&base).unwrap();
        let t1 = remove(&mid, 0, 1);
        let change = Change::new(0, vec![t0, t1]);

        let squashed = change.squash().unwrap().unwrap();
        assert_eq!(squashed.apply(&base).unwrap(), change.apply_to(&base).unwrap());
        assert_eq!(Change::empty(0).squash().unwrap(), None);
    }

    #[test]
    fn test_wire_format_roundtrip() {
        let base = text_items("hi");
        let change = Change::new(7, vec![insert(&base, 2, "!").with_author(3)]);
        let json = change.serialize().unwrap();
        assert!(json.starts_with(r#"{"start":7,"transactions":[{"author":3,"operations":"#));
        assert_eq!(Change::deserialize(&json).unwrap(), change);
        assert!(Change::deserialize("{\"start\":\"x\"}").is_err());
    }
}
