//! Dataset documents and identifier helpers.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Identifier prefix for draft variants of a document.
pub const DRAFTS_PREFIX: &str = "drafts.";

/// Identifier prefix reserved for non-document bookkeeping events
/// (transaction markers and the like).
pub const SYSTEM_PREFIX: &str = "_.";

/// A document in the mirrored dataset.
///
/// Only `_id` and `_rev` are interpreted; everything else is opaque
/// payload carried through unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Document identifier, unique within the dataset.
    #[serde(rename = "_id")]
    pub id: String,
    /// Revision marker assigned by the origin server.
    #[serde(rename = "_rev", skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
    /// Opaque payload fields.
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl Document {
    /// Creates a document with the given identifier and no payload.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            rev: None,
            payload: Map::new(),
        }
    }

    /// Sets the revision marker.
    pub fn with_rev(mut self, rev: impl Into<String>) -> Self {
        self.rev = Some(rev.into());
        self
    }

    /// Sets a payload field.
    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.payload.insert(key.into(), value);
        self
    }

    /// Returns true if this document is a draft variant.
    pub fn is_draft(&self) -> bool {
        is_draft_id(&self.id)
    }

    /// The logical (published) identifier shared by a draft/published pair.
    pub fn published_id(&self) -> &str {
        published_id(&self.id)
    }

    /// Returns a copy presented under its published identifier.
    ///
    /// Used by the overlay projection; the stored document keeps its
    /// true identifier.
    pub fn as_published(&self) -> Document {
        let mut doc = self.clone();
        doc.id = published_id(&self.id).to_string();
        doc
    }
}

/// Returns true if the identifier marks a draft variant.
pub fn is_draft_id(id: &str) -> bool {
    id.starts_with(DRAFTS_PREFIX)
}

/// Returns true if the identifier is reserved for system bookkeeping.
pub fn is_system_id(id: &str) -> bool {
    id.starts_with(SYSTEM_PREFIX)
}

/// Maps an identifier to its canonical published form.
///
/// Strips the draft prefix when present; already-published identifiers
/// are returned unchanged. Deterministic and total.
pub fn published_id(id: &str) -> &str {
    id.strip_prefix(DRAFTS_PREFIX).unwrap_or(id)
}
