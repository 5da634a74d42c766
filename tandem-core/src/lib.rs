//! # tandem-core — Linear document model for Tandem
//!
//! Pure data model with no I/O: documents are flat item sequences, edits
//! are invertible [`Transaction`]s, and versioned batches of them are
//! [`Change`]s that can be composed and rebased.
//!
//! ## Layers
//!
//! ```text
//! ┌───────────────────────────────────────────┐
//! │ Change      start + [Transaction]         │  compose, rebase_onto
//! ├───────────────────────────────────────────┤
//! │ Transaction [Operation]                   │  apply, invert, compose,
//! │                                           │  translate_range, transpose
//! ├───────────────────────────────────────────┤
//! │ Operation   Retain │ Insert │ Remove │    │
//! │             Attribute │ Annotate          │
//! ├───────────────────────────────────────────┤
//! │ Item        Text │ Open │ Close           │
//! └───────────────────────────────────────────┘
//! ```

pub mod change;
pub mod item;
pub mod operation;
pub mod range;
pub mod transaction;

/// Numeric author identity, allocated per document session.
pub type AuthorId = u64;

pub use change::{Change, ChangeError, RebaseResult, Version};
pub use item::{plain_text, text_items, Item};
pub use operation::{AnnotateMethod, Boundary, Operation};
pub use range::Range;
pub use transaction::{Transaction, TransactionBuilder, TransactionError};
