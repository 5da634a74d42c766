//! Primitive operations that make up a transaction.

use serde::{Deserialize, Serialize};

use crate::item::Item;

/// Whether an annotate marker adds or removes its annotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AnnotateMethod {
    Set,
    Clear,
}

impl AnnotateMethod {
    pub fn inverse(self) -> Self {
        match self {
            AnnotateMethod::Set => AnnotateMethod::Clear,
            AnnotateMethod::Clear => AnnotateMethod::Set,
        }
    }
}

/// Which end of an annotated span a marker denotes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Boundary {
    Start,
    Stop,
}

/// One step of a transaction, walked left to right over the input document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Operation {
    /// Keep the next `n` items.
    Retain(usize),
    /// Insert items at the cursor.
    Insert(Vec<Item>),
    /// Remove the given items, which must match the document exactly.
    Remove(Vec<Item>),
    /// Change one attribute of the next retained element.
    Attribute {
        key: String,
        from: Option<String>,
        to: Option<String>,
    },
    /// Open or close an annotated span over the retained items that follow.
    Annotate {
        method: AnnotateMethod,
        boundary: Boundary,
        annotation: String,
    },
}

impl Operation {
    /// Items consumed from the input document.
    pub fn input_len(&self) -> usize {
        match self {
            Operation::Retain(n) => *n,
            Operation::Remove(items) => items.len(),
            _ => 0,
        }
    }

    /// Items produced in the output document.
    pub fn output_len(&self) -> usize {
        match self {
            Operation::Retain(n) => *n,
            Operation::Insert(items) => items.len(),
            _ => 0,
        }
    }

    pub fn is_retain(&self) -> bool {
        matches!(self, Operation::Retain(_))
    }

    /// Length-bearing ops move the cursor; attribute and annotate ops are markers.
    pub fn is_marker(&self) -> bool {
        matches!(self, Operation::Attribute { .. } | Operation::Annotate { .. })
    }

    /// Operation that undoes this one.
    pub fn invert(&self) -> Operation {
        match self {
            Operation::Retain(n) => Operation::Retain(*n),
            Operation::Insert(items) => Operation::Remove(items.clone()),
            Operation::Remove(items) => Operation::Insert(items.clone()),
            Operation::Attribute { key, from, to } => Operation::Attribute {
                key: key.clone(),
                from: to.clone(),
                to: from.clone(),
            },
            Operation::Annotate {
                method,
                boundary,
                annotation,
            } => Operation::Annotate {
                method: method.inverse(),
                boundary: *boundary,
                annotation: annotation.clone(),
            },
        }
    }

    /// Try to fold `next` into `self`. Returns `false` when they cannot merge.
    pub(crate) fn try_merge(&mut self, next: &Operation) -> bool {
        match (self, next) {
            (Operation::Retain(a), Operation::Retain(b)) => {
                *a += *b;
                true
            }
            (Operation::Insert(a), Operation::Insert(b)) => {
                a.extend(b.iter().cloned());
                true
            }
            (Operation::Remove(a), Operation::Remove(b)) => {
                a.extend(b.iter().cloned());
                true
            }
            (
                Operation::Attribute { key, to, .. },
                Operation::Attribute {
                    key: next_key,
                    from: next_from,
                    to: next_to,
                },
            ) if key == next_key && to == next_from => {
                *to = next_to.clone();
                true
            }
            _ => false,
        }
    }
}
