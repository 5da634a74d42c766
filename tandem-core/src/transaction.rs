//! Atomic, invertible edits to the linear document.
//!
//! A [`Transaction`] is an ordered list of [`Operation`]s walked left to
//! right over its input document:
//!
//! ```text
//! input:   H  e  l  l  o  ␣  w  o  r  l  d
//!          └─Retain(5)──┘  └Remove┘ └Retain(4)┘
//!                         Insert("W")
//! output:  H  e  l  l  o  ␣  W  o  r  l  d
//! ```
//!
//! Retain and Remove together consume exactly the input length. Attribute
//! and Annotate operations are zero-width markers: an attribute change
//! targets the next retained element, an annotate span applies to the items
//! retained between its start and stop markers.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::item::Item;
use crate::operation::{AnnotateMethod, Boundary, Operation};
use crate::range::Range;
use crate::AuthorId;

/// Errors raised when a transaction does not fit the document it is applied to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionError {
    /// Retain/Remove lengths do not add up to the document length.
    LengthMismatch { expected: usize, got: usize },
    /// An operation reaches past the end of the document.
    OutOfBounds { offset: usize, len: usize },
    /// Removed items differ from the document content.
    RemoveMismatch { offset: usize },
    /// An attribute change targets something other than an opening element.
    AttributeTarget { offset: usize },
    /// The attribute's current value differs from the expected `from` value.
    AttributeMismatch { offset: usize, key: String },
    /// An attribute change is not followed by a retain of its element.
    DanglingAttribute,
    /// Set on an already-annotated item, or clear on an unannotated one.
    AnnotationConflict { offset: usize, annotation: String },
    /// Annotate markers do not pair up.
    UnbalancedAnnotation { annotation: String },
    /// Two transactions cannot be composed because they do not line up.
    Incompatible(String),
}

impl std::fmt::Display for TransactionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LengthMismatch { expected, got } => {
                write!(f, "Length mismatch: document has {expected} items, transaction covers {got}")
            }
            Self::OutOfBounds { offset, len } => {
                write!(f, "Operation at {offset} reaches past document end ({len})")
            }
            Self::RemoveMismatch { offset } => {
                write!(f, "Removed content does not match document at {offset}")
            }
            Self::AttributeTarget { offset } => {
                write!(f, "Attribute change at {offset} does not target an element")
            }
            Self::AttributeMismatch { offset, key } => {
                write!(f, "Attribute '{key}' at {offset} does not have the expected value")
            }
            Self::DanglingAttribute => write!(f, "Attribute change is not followed by a retain"),
            Self::AnnotationConflict { offset, annotation } => {
                write!(f, "Annotation '{annotation}' conflicts with item at {offset}")
            }
            Self::UnbalancedAnnotation { annotation } => {
                write!(f, "Unbalanced annotate markers for '{annotation}'")
            }
            Self::Incompatible(e) => write!(f, "Incompatible transactions: {e}"),
        }
    }
}

impl std::error::Error for TransactionError {}

/// An atomic edit to the linear document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Author who submitted the edit, stamped by the server on commit.
    pub author: Option<AuthorId>,
    pub operations: Vec<Operation>,
}

impl Transaction {
    /// Build a transaction, merging adjacent operations.
    pub fn new(operations: Vec<Operation>) -> Self {
        let mut builder = TransactionBuilder::new();
        for op in operations {
            builder.push(op);
        }
        builder.build()
    }

    pub fn builder() -> TransactionBuilder {
        TransactionBuilder::new()
    }

    pub fn with_author(mut self, author: AuthorId) -> Self {
        self.author = Some(author);
        self
    }

    /// Transaction that retains a whole document of `len` items.
    pub fn noop(len: usize) -> Self {
        Self::builder().retain(len).build()
    }

    /// Insert `items` at `offset` in a document of `doc_len` items.
    pub fn insertion(doc_len: usize, offset: usize, items: Vec<Item>) -> Result<Self, TransactionError> {
        if offset > doc_len {
            return Err(TransactionError::OutOfBounds { offset, len: doc_len });
        }
        Ok(Self::builder()
            .retain(offset)
            .insert(items)
            .retain(doc_len - offset)
            .build())
    }

    /// Replace the items covered by `range` with `items`.
    pub fn replacement(doc: &[Item], range: Range, items: Vec<Item>) -> Result<Self, TransactionError> {
        if range.end() > doc.len() {
            return Err(TransactionError::OutOfBounds {
                offset: range.end(),
                len: doc.len(),
            });
        }
        Ok(Self::builder()
            .retain(range.start())
            .remove(doc[range.start()..range.end()].to_vec())
            .insert(items)
            .retain(doc.len() - range.end())
            .build())
    }

    /// Set or clear `annotation` over `range`.
    pub fn annotation(
        doc_len: usize,
        range: Range,
        method: AnnotateMethod,
        annotation: impl Into<String>,
    ) -> Result<Self, TransactionError> {
        if range.end() > doc_len {
            return Err(TransactionError::OutOfBounds {
                offset: range.end(),
                len: doc_len,
            });
        }
        let annotation = annotation.into();
        Ok(Self::builder()
            .retain(range.start())
            .annotate(method, Boundary::Start, annotation.clone())
            .retain(range.len())
            .annotate(method, Boundary::Stop, annotation)
            .retain(doc_len - range.end())
            .build())
    }

    /// Change attribute `key` of the element at `offset` to `to`.
    pub fn attribute_change(
        doc: &[Item],
        offset: usize,
        key: impl Into<String>,
        to: Option<String>,
    ) -> Result<Self, TransactionError> {
        let key = key.into();
        let from = match doc.get(offset) {
            Some(Item::Open { attributes, .. }) => attributes.get(&key).cloned(),
            Some(_) => return Err(TransactionError::AttributeTarget { offset }),
            None => {
                return Err(TransactionError::OutOfBounds {
                    offset,
                    len: doc.len(),
                })
            }
        };
        Ok(Self::builder()
            .retain(offset)
            .attribute(key, from, to)
            .retain(doc.len() - offset)
            .build())
    }

    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    /// Length of the document this transaction applies to.
    ///
    /// Saturates for transactions that fail [`validate`](Self::validate).
    pub fn input_len(&self) -> usize {
        self.operations
            .iter()
            .fold(0usize, |acc, op| acc.saturating_add(op.input_len()))
    }

    /// Length of the document this transaction produces.
    pub fn output_len(&self) -> usize {
        self.operations
            .iter()
            .fold(0usize, |acc, op| acc.saturating_add(op.output_len()))
    }

    /// Check that the input and output lengths fit in a `usize`.
    ///
    /// Transactions decoded from the wire skip the builder, so a hostile
    /// `Retain` can be arbitrarily large.
    pub fn validate(&self) -> Result<(), TransactionError> {
        self.operations
            .iter()
            .try_fold((0usize, 0usize), |(input, output), op| {
                match (input.checked_add(op.input_len()), output.checked_add(op.output_len())) {
                    (Some(input), Some(output)) => Ok((input, output)),
                    _ => Err(TransactionError::OutOfBounds {
                        offset: input,
                        len: usize::MAX,
                    }),
                }
            })
            .map(|_| ())
    }

    pub fn length_difference(&self) -> isize {
        self.output_len() as isize - self.input_len() as isize
    }

    /// True when the transaction only retains.
    pub fn is_noop(&self) -> bool {
        self.operations.iter().all(Operation::is_retain)
    }

    /// Apply to `doc`, producing the new document.
    pub fn apply(&self, doc: &[Item]) -> Result<Vec<Item>, TransactionError> {
        self.validate()?;
        let mut out = Vec::with_capacity(doc.len().saturating_add(self.output_len().saturating_sub(self.input_len())));
        let mut offset = 0usize;
        let mut active = ActiveAnnotations::default();
        let mut pending: Vec<(&String, &Option<String>, &Option<String>)> = Vec::new();

        for op in &self.operations {
            match op {
                Operation::Retain(n) => {
                    let end = match offset.checked_add(*n) {
                        Some(end) if end <= doc.len() => end,
                        _ => return Err(TransactionError::OutOfBounds { offset, len: doc.len() }),
                    };
                    for (i, item) in doc[offset..end].iter().enumerate() {
                        let mut item = item.clone();
                        if i == 0 {
                            for (key, from, to) in pending.drain(..) {
                                set_attribute(&mut item, key, from, to, offset)?;
                            }
                        }
                        active.apply(&mut item, offset + i)?;
                        out.push(item);
                    }
                    offset = end;
                }
                Operation::Insert(items) => {
                    if !pending.is_empty() {
                        return Err(TransactionError::DanglingAttribute);
                    }
                    out.extend(items.iter().cloned());
                }
                Operation::Remove(items) => {
                    if !pending.is_empty() {
                        return Err(TransactionError::DanglingAttribute);
                    }
                    let end = match offset.checked_add(items.len()) {
                        Some(end) if end <= doc.len() => end,
                        _ => return Err(TransactionError::OutOfBounds { offset, len: doc.len() }),
                    };
                    if doc[offset..end] != items[..] {
                        return Err(TransactionError::RemoveMismatch { offset });
                    }
                    offset = end;
                }
                Operation::Attribute { key, from, to } => pending.push((key, from, to)),
                Operation::Annotate {
                    method,
                    boundary,
                    annotation,
                } => active.mark(*method, *boundary, annotation)?,
            }
        }

        if !pending.is_empty() {
            return Err(TransactionError::DanglingAttribute);
        }
        active.finish()?;
        if offset != doc.len() {
            return Err(TransactionError::LengthMismatch {
                expected: doc.len(),
                got: offset,
            });
        }
        Ok(out)
    }

    /// Transaction that undoes this one.
    pub fn invert(&self) -> Transaction {
        let mut builder = TransactionBuilder::new();
        builder.author = self.author;
        for op in &self.operations {
            builder.push(op.invert());
        }
        builder.build()
    }

    /// Compose with `other`, which must apply to this transaction's output.
    ///
    /// Applying the result is equivalent to applying `self` then `other`.
    pub fn compose(&self, other: &Transaction) -> Result<Transaction, TransactionError> {
        self.validate()?;
        other.validate()?;
        let mut a = OpCursor::new(&self.operations);
        let mut b = OpCursor::new(&other.operations);
        let mut out = TransactionBuilder::new();
        out.author = if self.author == other.author { self.author } else { None };

        let mut a_attrs: Vec<(String, Option<String>, Option<String>)> = Vec::new();
        let mut b_attrs: Vec<(String, Option<String>, Option<String>)> = Vec::new();
        let mut layers = AnnotationLayers::default();

        loop {
            // Removals and markers of the first transaction don't consume its output.
            match a.peek() {
                Some(Operation::Remove(_)) => {
                    if !a_attrs.is_empty() {
                        return Err(TransactionError::DanglingAttribute);
                    }
                    let n = a.remaining();
                    out.push(Operation::Remove(a.take_items(n)));
                    continue;
                }
                Some(Operation::Attribute { key, from, to }) => {
                    a_attrs.push((key.clone(), from.clone(), to.clone()));
                    a.skip_marker();
                    continue;
                }
                Some(Operation::Annotate { method, boundary, annotation }) => {
                    layers.mark(Layer::First, *method, *boundary, annotation, &mut out)?;
                    a.skip_marker();
                    continue;
                }
                _ => {}
            }

            // Insertions and markers of the second transaction don't consume its input.
            match b.peek() {
                Some(Operation::Insert(_)) => {
                    if !b_attrs.is_empty() {
                        return Err(TransactionError::DanglingAttribute);
                    }
                    let n = b.remaining();
                    out.push(Operation::Insert(b.take_items(n)));
                    continue;
                }
                Some(Operation::Attribute { key, from, to }) => {
                    b_attrs.push((key.clone(), from.clone(), to.clone()));
                    b.skip_marker();
                    continue;
                }
                Some(Operation::Annotate { method, boundary, annotation }) => {
                    layers.mark(Layer::Second, *method, *boundary, annotation, &mut out)?;
                    b.skip_marker();
                    continue;
                }
                _ => {}
            }

            let (a_op, b_op) = match (a.peek(), b.peek()) {
                (None, None) => break,
                (Some(a_op), Some(b_op)) => (a_op, b_op),
                _ => {
                    return Err(TransactionError::LengthMismatch {
                        expected: self.output_len(),
                        got: other.input_len(),
                    })
                }
            };
            let k = a.remaining().min(b.remaining());

            match (a_op, b_op) {
                (Operation::Retain(_), Operation::Retain(_)) => {
                    for (key, from, to) in a_attrs.drain(..).chain(b_attrs.drain(..)) {
                        out.push(Operation::Attribute { key, from, to });
                    }
                    a.advance(k);
                    b.advance(k);
                    out.push(Operation::Retain(k));
                }
                (Operation::Retain(_), Operation::Remove(_)) => {
                    if !b_attrs.is_empty() {
                        return Err(TransactionError::DanglingAttribute);
                    }
                    a.advance(k);
                    let mut removed = b.take_items(k);
                    // Restore the items to the form the first transaction saw.
                    if let Some(first) = removed.first_mut() {
                        for (key, from, to) in a_attrs.drain(..).rev() {
                            unset_attribute(first, &key, &from, &to)?;
                        }
                    }
                    for item in removed.iter_mut() {
                        layers.unapply_first(item)?;
                    }
                    out.push(Operation::Remove(removed));
                }
                (Operation::Insert(_), Operation::Retain(_)) => {
                    if !a_attrs.is_empty() {
                        return Err(TransactionError::DanglingAttribute);
                    }
                    b.advance(k);
                    let mut inserted = a.take_items(k);
                    // Bake the second transaction's changes into the new items.
                    if let Some(first) = inserted.first_mut() {
                        for (key, from, to) in b_attrs.drain(..) {
                            set_attribute(first, &key, &from, &to, 0)?;
                        }
                    }
                    for item in inserted.iter_mut() {
                        layers.apply_second(item)?;
                    }
                    out.push(Operation::Insert(inserted));
                }
                (Operation::Insert(_), Operation::Remove(_)) => {
                    if !a_attrs.is_empty() || !b_attrs.is_empty() {
                        return Err(TransactionError::DanglingAttribute);
                    }
                    let inserted = a.take_items(k);
                    let removed = b.take_items(k);
                    if inserted != removed {
                        return Err(TransactionError::Incompatible(
                            "second transaction removes content the first did not insert".into(),
                        ));
                    }
                }
                _ => {
                    return Err(TransactionError::Incompatible(
                        "unexpected operation pairing".into(),
                    ))
                }
            }
        }

        if !a_attrs.is_empty() || !b_attrs.is_empty() {
            return Err(TransactionError::DanglingAttribute);
        }
        layers.finish()?;
        Ok(out.build())
    }

    /// Map an input offset to the corresponding output offset.
    ///
    /// An insertion exactly at `offset` lands before the result when
    /// `after_insertion` is true. Offsets inside a removal clamp to the
    /// point where the removal happened.
    pub fn translate_offset(&self, offset: usize, after_insertion: bool) -> usize {
        let mut input = 0usize;
        let mut output = 0usize;
        for op in &self.operations {
            match op {
                Operation::Retain(n) => {
                    if offset < input.saturating_add(*n) {
                        return output.saturating_add(offset - input);
                    }
                    input = input.saturating_add(*n);
                    output = output.saturating_add(*n);
                }
                Operation::Insert(items) => {
                    if offset == input && !after_insertion {
                        return output;
                    }
                    output = output.saturating_add(items.len());
                }
                Operation::Remove(items) => {
                    if offset < input.saturating_add(items.len()) {
                        return output;
                    }
                    input = input.saturating_add(items.len());
                }
                Operation::Attribute { .. } | Operation::Annotate { .. } => {}
            }
        }
        output.saturating_add(offset.saturating_sub(input))
    }

    /// Map a selection through this transaction.
    ///
    /// Insertions before the range shift it forward. An insertion exactly at
    /// a boundary shifts that boundary only when
    /// `exclude_insertion_at_boundary` is false.
    ///
    /// Both ends use the same bias. A non-collapsed range therefore cannot
    /// grow over an insertion at its start while excluding one at its end:
    /// with `exclude_insertion_at_boundary` false, text inserted at `from`
    /// moves the whole range past it.
    pub fn translate_range(&self, range: Range, exclude_insertion_at_boundary: bool) -> Range {
        let after = !exclude_insertion_at_boundary;
        Range::new(
            self.translate_offset(range.from, after),
            self.translate_offset(range.to, after),
        )
    }

    /// Input range touched by anything other than a retain.
    ///
    /// `None` for a transaction that only retains.
    pub fn modified_range(&self) -> Option<Range> {
        let mut offset = 0usize;
        let mut start: Option<usize> = None;
        let mut end = 0usize;
        for op in &self.operations {
            match op {
                Operation::Retain(n) => offset = offset.saturating_add(*n),
                Operation::Insert(_) | Operation::Annotate { .. } => {
                    start.get_or_insert(offset);
                    end = end.max(offset);
                }
                Operation::Remove(items) => {
                    start.get_or_insert(offset);
                    offset = offset.saturating_add(items.len());
                    end = end.max(offset);
                }
                Operation::Attribute { .. } => {
                    start.get_or_insert(offset);
                    end = end.max(offset.saturating_add(1));
                }
            }
        }
        start.map(|s| Range::new(s, end.max(s)))
    }

    /// Reorder two transactions that apply to the same document.
    ///
    /// Returns `(a', b')` where `a'` applies after `b` and `b'` after `a`, so
    /// that `a · b'` and `b · a'` produce the same document. Returns `None`
    /// when the modified ranges overlap. When `a` ends exactly where `b`
    /// starts (two insertions at one offset included), `a` comes first.
    /// Transactions that fail [`validate`](Self::validate) never transpose.
    pub fn transpose(a: &Transaction, b: &Transaction) -> Option<(Transaction, Transaction)> {
        if a.validate().is_err() || b.validate().is_err() || a.input_len() != b.input_len() {
            return None;
        }
        let da = a.length_difference();
        let db = b.length_difference();

        let (ra, rb) = match (a.modified_range(), b.modified_range()) {
            (None, _) => {
                return Some((Transaction::noop(b.output_len()).with_author_opt(a.author), b.clone()))
            }
            (_, None) => {
                return Some((a.clone(), Transaction::noop(a.output_len()).with_author_opt(b.author)))
            }
            (Some(ra), Some(rb)) => (ra, rb),
        };

        let (a_lead, a_core, a_trail) = a.split();
        let (b_lead, b_core, b_trail) = b.split();

        if ra.end() <= rb.start() {
            let a2 = Self::rebuild(a.author, a_lead, a_core, a_trail.checked_add_signed(db)?);
            let b2 = Self::rebuild(b.author, b_lead.checked_add_signed(da)?, b_core, b_trail);
            Some((a2, b2))
        } else if rb.end() <= ra.start() {
            let a2 = Self::rebuild(a.author, a_lead.checked_add_signed(db)?, a_core, a_trail);
            let b2 = Self::rebuild(b.author, b_lead, b_core, b_trail.checked_add_signed(da)?);
            Some((a2, b2))
        } else {
            None
        }
    }

    fn with_author_opt(mut self, author: Option<AuthorId>) -> Self {
        self.author = author;
        self
    }

    /// Split into leading retain, the operations between, and trailing retain.
    fn split(&self) -> (usize, &[Operation], usize) {
        let first = self.operations.iter().position(|op| !op.is_retain());
        let last = self.operations.iter().rposition(|op| !op.is_retain());
        match (first, last) {
            (Some(first), Some(last)) => {
                let lead = self.operations[..first].iter().map(Operation::input_len).sum();
                let trail = self.operations[last + 1..].iter().map(Operation::input_len).sum();
                (lead, &self.operations[first..=last], trail)
            }
            _ => (self.input_len(), &[], 0),
        }
    }

    fn rebuild(author: Option<AuthorId>, lead: usize, core: &[Operation], trail: usize) -> Transaction {
        let mut builder = TransactionBuilder::new();
        builder.author = author;
        builder.push(Operation::Retain(lead));
        for op in core {
            builder.push(op.clone());
        }
        builder.push(Operation::Retain(trail));
        builder.build()
    }
}

/// Incremental transaction construction with operation merging.
#[derive(Debug, Default)]
pub struct TransactionBuilder {
    ops: Vec<Operation>,
    author: Option<AuthorId>,
}

impl TransactionBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn author(mut self, author: AuthorId) -> Self {
        self.author = Some(author);
        self
    }

    pub fn retain(mut self, n: usize) -> Self {
        self.push(Operation::Retain(n));
        self
    }

    pub fn insert(mut self, items: Vec<Item>) -> Self {
        self.push(Operation::Insert(items));
        self
    }

    pub fn remove(mut self, items: Vec<Item>) -> Self {
        self.push(Operation::Remove(items));
        self
    }

    pub fn attribute(mut self, key: impl Into<String>, from: Option<String>, to: Option<String>) -> Self {
        self.push(Operation::Attribute {
            key: key.into(),
            from,
            to,
        });
        self
    }

    pub fn annotate(mut self, method: AnnotateMethod, boundary: Boundary, annotation: impl Into<String>) -> Self {
        self.push(Operation::Annotate {
            method,
            boundary,
            annotation: annotation.into(),
        });
        self
    }

    /// Append an operation, dropping empty ones and merging with the tail.
    ///
    /// A removal directly after an insertion is moved in front of it, so
    /// replacements always read remove-then-insert.
    pub fn push(&mut self, op: Operation) {
        match &op {
            Operation::Retain(0) => return,
            Operation::Insert(items) | Operation::Remove(items) if items.is_empty() => return,
            Operation::Attribute { from, to, .. } if from == to => return,
            _ => {}
        }

        // An annotate span that covers nothing.
        if let (
            Operation::Annotate {
                method,
                boundary: Boundary::Stop,
                annotation,
            },
            Some(Operation::Annotate {
                method: last_method,
                boundary: Boundary::Start,
                annotation: last_annotation,
            }),
        ) = (&op, self.ops.last())
        {
            if method == last_method && annotation == last_annotation {
                self.ops.pop();
                return;
            }
        }

        if matches!(op, Operation::Remove(_)) && matches!(self.ops.last(), Some(Operation::Insert(_))) {
            let insert_at = self.ops.len() - 1;
            if insert_at > 0 && self.ops[insert_at - 1].try_merge(&op) {
                return;
            }
            self.ops.insert(insert_at, op);
            return;
        }

        if let Some(last) = self.ops.last_mut() {
            if last.try_merge(&op) {
                if let Operation::Attribute { from, to, .. } = last {
                    if from == to {
                        self.ops.pop();
                    }
                }
                return;
            }
        }
        self.ops.push(op);
    }

    pub fn build(self) -> Transaction {
        Transaction {
            author: self.author,
            operations: self.ops,
        }
    }
}

// ─── Helpers ──────────────────────────────────────────────────────────

fn set_attribute(
    item: &mut Item,
    key: &str,
    from: &Option<String>,
    to: &Option<String>,
    offset: usize,
) -> Result<(), TransactionError> {
    match item {
        Item::Open { attributes, .. } => {
            if attributes.get(key) != from.as_ref() {
                return Err(TransactionError::AttributeMismatch {
                    offset,
                    key: key.to_string(),
                });
            }
            match to {
                Some(value) => attributes.insert(key.to_string(), value.clone()),
                None => attributes.remove(key),
            };
            Ok(())
        }
        _ => Err(TransactionError::AttributeTarget { offset }),
    }
}

fn unset_attribute(
    item: &mut Item,
    key: &str,
    from: &Option<String>,
    to: &Option<String>,
) -> Result<(), TransactionError> {
    set_attribute(item, key, to, from, 0)
}

fn annotate_item(
    item: &mut Item,
    method: AnnotateMethod,
    annotation: &str,
    offset: usize,
) -> Result<(), TransactionError> {
    if let Item::Text { annotations, .. } = item {
        let ok = match method {
            AnnotateMethod::Set => annotations.insert(annotation.to_string()),
            AnnotateMethod::Clear => annotations.remove(annotation),
        };
        if !ok {
            return Err(TransactionError::AnnotationConflict {
                offset,
                annotation: annotation.to_string(),
            });
        }
    }
    Ok(())
}

/// Annotate spans open at the current point of a walk.
#[derive(Debug, Default)]
struct ActiveAnnotations {
    open: BTreeMap<String, AnnotateMethod>,
}

impl ActiveAnnotations {
    fn mark(&mut self, method: AnnotateMethod, boundary: Boundary, annotation: &str) -> Result<(), TransactionError> {
        let balanced = match boundary {
            Boundary::Start => self.open.insert(annotation.to_string(), method).is_none(),
            Boundary::Stop => self.open.remove(annotation) == Some(method),
        };
        if balanced {
            Ok(())
        } else {
            Err(TransactionError::UnbalancedAnnotation {
                annotation: annotation.to_string(),
            })
        }
    }

    fn apply(&self, item: &mut Item, offset: usize) -> Result<(), TransactionError> {
        for (annotation, method) in &self.open {
            annotate_item(item, *method, annotation, offset)?;
        }
        Ok(())
    }

    fn unapply(&self, item: &mut Item) -> Result<(), TransactionError> {
        for (annotation, method) in &self.open {
            annotate_item(item, method.inverse(), annotation, 0)?;
        }
        Ok(())
    }

    fn finish(&self) -> Result<(), TransactionError> {
        match self.open.keys().next() {
            Some(annotation) => Err(TransactionError::UnbalancedAnnotation {
                annotation: annotation.clone(),
            }),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Layer {
    First,
    Second,
}

/// Annotate spans of both sides of a composition, plus the spans emitted
/// into the composed output. Opposite spans on one annotation cancel where
/// they overlap.
#[derive(Debug, Default)]
struct AnnotationLayers {
    first: ActiveAnnotations,
    second: ActiveAnnotations,
    emitted: BTreeMap<String, AnnotateMethod>,
}

impl AnnotationLayers {
    fn mark(
        &mut self,
        layer: Layer,
        method: AnnotateMethod,
        boundary: Boundary,
        annotation: &str,
        out: &mut TransactionBuilder,
    ) -> Result<(), TransactionError> {
        match layer {
            Layer::First => self.first.mark(method, boundary, annotation)?,
            Layer::Second => self.second.mark(method, boundary, annotation)?,
        }

        let desired = match (self.first.open.get(annotation), self.second.open.get(annotation)) {
            (Some(x), Some(y)) if x != y => None,
            (Some(m), _) | (None, Some(m)) => Some(*m),
            (None, None) => None,
        };
        let current = self.emitted.get(annotation).copied();
        if current != desired {
            if let Some(m) = current {
                out.push(Operation::Annotate {
                    method: m,
                    boundary: Boundary::Stop,
                    annotation: annotation.to_string(),
                });
                self.emitted.remove(annotation);
            }
            if let Some(m) = desired {
                out.push(Operation::Annotate {
                    method: m,
                    boundary: Boundary::Start,
                    annotation: annotation.to_string(),
                });
                self.emitted.insert(annotation.to_string(), m);
            }
        }
        Ok(())
    }

    fn unapply_first(&self, item: &mut Item) -> Result<(), TransactionError> {
        self.first.unapply(item)
    }

    fn apply_second(&self, item: &mut Item) -> Result<(), TransactionError> {
        self.second.apply(item, 0)
    }

    fn finish(&self) -> Result<(), TransactionError> {
        self.first.finish()?;
        self.second.finish()
    }
}

/// Walks an operation list, allowing length ops to be consumed piecewise.
struct OpCursor<'a> {
    ops: &'a [Operation],
    index: usize,
    offset: usize,
}

impl<'a> OpCursor<'a> {
    fn new(ops: &'a [Operation]) -> Self {
        Self { ops, index: 0, offset: 0 }
    }

    fn span(op: &Operation) -> usize {
        match op {
            Operation::Retain(n) => *n,
            Operation::Insert(items) | Operation::Remove(items) => items.len(),
            _ => 0,
        }
    }

    /// Current operation, skipping zero-length length ops.
    fn peek(&mut self) -> Option<&'a Operation> {
        while let Some(op) = self.ops.get(self.index) {
            if !op.is_marker() && Self::span(op) == self.offset {
                self.index += 1;
                self.offset = 0;
                continue;
            }
            return Some(op);
        }
        None
    }

    fn remaining(&self) -> usize {
        self.ops
            .get(self.index)
            .map_or(0, |op| Self::span(op).saturating_sub(self.offset))
    }

    fn skip_marker(&mut self) {
        self.index += 1;
        self.offset = 0;
    }

    fn advance(&mut self, n: usize) {
        self.offset = self.offset.saturating_add(n);
    }

    fn take_items(&mut self, n: usize) -> Vec<Item> {
        let items = match self.ops.get(self.index) {
            Some(Operation::Insert(items)) | Some(Operation::Remove(items)) => self
                .offset
                .checked_add(n)
                .and_then(|end| items.get(self.offset..end))
                .map(<[Item]>::to_vec)
                .unwrap_or_default(),
            _ => Vec::new(),
        };
        self.advance(n);
        items
    }
}
