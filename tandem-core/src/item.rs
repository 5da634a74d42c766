//! Linear document items.
//!
//! A document is a flat sequence of [`Item`]s: text characters (each carrying
//! its own annotation set) interleaved with element open/close markers.
//!
//! ```text
//! ┌──────────────┬─────┬─────┬─────┬───────────────┐
//! │ Open(para)   │ 'H' │ 'i' │ '!' │ Close(para)   │
//! └──────────────┴─────┴─────┴─────┴───────────────┘
//!   offset 0       1     2     3     4
//! ```

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// A single unit of the linear document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Item {
    /// One character with the annotations applied to it.
    Text {
        ch: char,
        annotations: BTreeSet<String>,
    },
    /// Element opening marker. Attribute values are opaque strings.
    Open {
        kind: String,
        attributes: BTreeMap<String, String>,
    },
    /// Element closing marker.
    Close { kind: String },
}

impl Item {
    /// Plain, unannotated character.
    pub fn text(ch: char) -> Self {
        Item::Text {
            ch,
            annotations: BTreeSet::new(),
        }
    }

    /// Character carrying the given annotations.
    pub fn annotated<I, S>(ch: char, annotations: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Item::Text {
            ch,
            annotations: annotations.into_iter().map(Into::into).collect(),
        }
    }

    /// Opening marker without attributes.
    pub fn open(kind: impl Into<String>) -> Self {
        Item::Open {
            kind: kind.into(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn close(kind: impl Into<String>) -> Self {
        Item::Close { kind: kind.into() }
    }

    /// The character, if this is a text item.
    pub fn as_char(&self) -> Option<char> {
        match self {
            Item::Text { ch, .. } => Some(*ch),
            _ => None,
        }
    }

    /// Whether this item is an element marker rather than text.
    pub fn is_element(&self) -> bool {
        !matches!(self, Item::Text { .. })
    }
}

/// Build plain text items from a string.
pub fn text_items(s: &str) -> Vec<Item> {
    s.chars().map(Item::text).collect()
}

/// Concatenate the characters of a document, skipping element markers.
pub fn plain_text(items: &[Item]) -> String {
    items.iter().filter_map(Item::as_char).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_items_roundtrip() {
        let items = text_items("héllo");
        assert_eq!(items.len(), 5);
        assert_eq!(plain_text(&items), "héllo");
    }

    #[test]
    fn test_plain_text_skips_elements() {
        let mut doc = vec![Item::open("paragraph")];
        doc.extend(text_items("Hi"));
        doc.push(Item::close("paragraph"));
        assert_eq!(plain_text(&doc), "Hi");
        assert!(doc[0].is_element());
        assert!(!doc[1].is_element());
    }

    #[test]
    fn test_annotated_item() {
        let item = Item::annotated('b', ["bold", "italic"]);
        match item {
            Item::Text { ch, annotations } => {
                assert_eq!(ch, 'b');
                assert!(annotations.contains("bold"));
                assert!(annotations.contains("italic"));
            }
            other => panic!("Expected text item, got {other:?}"),
        }
    }

    #[test]
    fn test_item_json_shape() {
        let json = serde_json::to_string(&Item::close("heading")).unwrap();
        assert_eq!(json, r#"{"close":{"kind":"heading"}}"#);
    }
}
