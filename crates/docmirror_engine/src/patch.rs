//! Patch application seam.

use docmirror_protocol::Document;
use serde_json::Value;

/// Applies a single patch operation set to a document value.
///
/// Implementations must be pure functions: same inputs, same output,
/// no side effects. `None` denotes absence on both sides — applying
/// against `None` signals creation, returning `None` signals deletion.
pub trait PatchApplier: Send + Sync + 'static {
    /// Computes the new document value from the current one and an
    /// opaque patch description.
    fn apply(&self, current: Option<&Document>, patch: &Value) -> Option<Document>;
}

/// A reference applier interpreting a minimal patch vocabulary.
///
/// Recognized operations, processed in this order:
/// - `"create"`: a full document object replacing the current value
/// - `"set"`: field/value pairs written into the payload (`"_id"` and
///   `"_rev"` address the identifier and revision marker)
/// - `"unset"`: payload field names to remove
/// - `"delete"`: `true` removes the document
///
/// Real deployments typically inject an applier for their origin's
/// native patch format; this one exists for tests and simple feeds.
#[derive(Debug, Clone, Copy, Default)]
pub struct ValuePatchApplier;

impl PatchApplier for ValuePatchApplier {
    fn apply(&self, current: Option<&Document>, patch: &Value) -> Option<Document> {
        // An unrecognized patch leaves the current value untouched
        let Some(ops) = patch.as_object() else {
            return current.cloned();
        };

        let created: Option<Document> = ops
            .get("create")
            .and_then(|value| serde_json::from_value(value.clone()).ok());
        let mut doc = created.or_else(|| current.cloned())?;

        if let Some(fields) = ops.get("set").and_then(Value::as_object) {
            for (key, value) in fields {
                match key.as_str() {
                    "_id" => {
                        if let Some(id) = value.as_str() {
                            doc.id = id.to_string();
                        }
                    }
                    "_rev" => doc.rev = value.as_str().map(str::to_string),
                    _ => {
                        doc.payload.insert(key.clone(), value.clone());
                    }
                }
            }
        }

        if let Some(fields) = ops.get("unset").and_then(Value::as_array) {
            for key in fields.iter().filter_map(Value::as_str) {
                doc.payload.remove(key);
            }
        }

        if ops.get("delete").and_then(Value::as_bool) == Some(true) {
            return None;
        }

        Some(doc)
    }
}
