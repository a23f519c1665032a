//! Incremental change notifications.

use crate::document::is_system_id;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single change notification from the live feed.
///
/// Events for a given identifier arrive in origin-send order; the
/// mirror never reorders them, it only decides when an event becomes
/// applicable relative to the bulk snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationEvent {
    /// Identifier of the affected document.
    pub document_id: String,
    /// Revision the event's patch was computed against.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_rev: Option<String>,
    /// Patch description, absent for events carrying no effects.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub effects: Option<MutationEffects>,
}

/// The effects carried by a mutation event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationEffects {
    /// Opaque patch operations, interpreted only by the patch applier.
    pub apply: Value,
}

impl MutationEvent {
    /// Creates an event applying `patch` against `previous_rev`.
    pub fn patch(
        document_id: impl Into<String>,
        previous_rev: impl Into<String>,
        patch: Value,
    ) -> Self {
        Self {
            document_id: document_id.into(),
            previous_rev: Some(previous_rev.into()),
            effects: Some(MutationEffects { apply: patch }),
        }
    }

    /// Creates an event carrying no effects.
    pub fn empty(document_id: impl Into<String>) -> Self {
        Self {
            document_id: document_id.into(),
            previous_rev: None,
            effects: None,
        }
    }

    /// Returns true if this event is reserved system bookkeeping and
    /// must never mutate the collection.
    pub fn is_system(&self) -> bool {
        is_system_id(&self.document_id)
    }
}
