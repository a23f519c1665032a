//! Draft-over-published overlay projection.

use docmirror_protocol::Document;
use std::collections::HashMap;

/// Projects the collection down to one representative per logical
/// document, where logical identity is the published identifier.
///
/// Drafts always win and are presented as if published (their `_id`
/// rewritten for external consumers only). A published document shows
/// only when no draft exists for the same logical identifier. Output
/// order follows the first encounter of each logical identifier in the
/// input; a later draft replaces the value in its slot without moving
/// it.
///
/// Pure and stateless, recomputed on every update.
pub fn overlay(documents: &[Document]) -> Vec<Document> {
    let mut visible: Vec<Document> = Vec::with_capacity(documents.len());
    let mut slots: HashMap<String, usize> = HashMap::new();

    for doc in documents {
        let logical = doc.published_id();
        if doc.is_draft() {
            match slots.get(logical) {
                Some(&slot) => visible[slot] = doc.as_published(),
                None => {
                    slots.insert(logical.to_string(), visible.len());
                    visible.push(doc.as_published());
                }
            }
        } else if !slots.contains_key(logical) {
            slots.insert(logical.to_string(), visible.len());
            visible.push(doc.clone());
        }
    }

    visible
}
