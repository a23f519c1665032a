//! Initial reconciliation of buffered mutations against the snapshot.

use crate::patch::PatchApplier;
use docmirror_protocol::{is_system_id, Document, MutationEvent};
use std::collections::HashMap;
use tracing::warn;

/// Outcome of replaying the pending buffer against a snapshot.
#[derive(Debug, Default)]
pub struct ReplayOutcome {
    /// The reconciled, authoritative document sequence.
    pub documents: Vec<Document>,
    /// Events applied from the pivot onward.
    pub applied: u64,
    /// Events discarded as already reflected in the snapshot.
    pub discarded: u64,
    /// Mutation groups whose document was absent from the snapshot.
    pub missing_documents: u64,
}

/// Replays buffered mutation events against the fetched snapshot.
///
/// Events are grouped by document identifier, arrival order preserved
/// within each group. Per group, the pivot is the first event whose
/// `previousRev` equals the snapshot document's `_rev`; everything
/// strictly before it describes state already folded into the snapshot
/// and is discarded. From the pivot onward, each event carrying effects
/// is applied in order, threading the result forward. Reconciled
/// documents replace the original in place; a chain that deletes the
/// document removes it from the sequence.
///
/// Groups with no matching snapshot document are skipped and counted —
/// a recoverable anomaly, not a fatal one.
pub fn replay<P: PatchApplier>(
    applier: &P,
    snapshot: Vec<Document>,
    pending: Vec<MutationEvent>,
) -> ReplayOutcome {
    // Slots keep positions stable while groups reconcile independently.
    // Duplicate snapshot identifiers collapse to their first position
    // with the last value, matching `IndexedCollection::from_documents`.
    let mut positions: HashMap<String, usize> = HashMap::new();
    let mut slots: Vec<Option<Document>> = Vec::new();
    for doc in snapshot {
        match positions.get(&doc.id) {
            Some(&pos) => slots[pos] = Some(doc),
            None => {
                positions.insert(doc.id.clone(), slots.len());
                slots.push(Some(doc));
            }
        }
    }

    // Group by document identifier, arrival order preserved
    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, Vec<MutationEvent>> = HashMap::new();
    for event in pending {
        if is_system_id(&event.document_id) {
            continue;
        }
        groups
            .entry(event.document_id.clone())
            .or_insert_with(|| {
                order.push(event.document_id.clone());
                Vec::new()
            })
            .push(event);
    }

    let mut outcome = ReplayOutcome::default();

    for id in order {
        let group = match groups.remove(&id) {
            Some(group) => group,
            None => continue,
        };

        let Some(&pos) = positions.get(&id) else {
            warn!(document_id = %id, "mutation received for missing document");
            outcome.missing_documents += 1;
            continue;
        };

        let snapshot_rev = slots[pos].as_ref().and_then(|doc| doc.rev.clone());
        let mut current = slots[pos].take();
        let mut found_pivot = false;

        for event in group {
            found_pivot = found_pivot || event.previous_rev == snapshot_rev;
            if !found_pivot {
                outcome.discarded += 1;
                continue;
            }
            if let Some(effects) = &event.effects {
                current = applier.apply(current.as_ref(), &effects.apply);
                outcome.applied += 1;
            }
        }

        slots[pos] = current;
    }

    outcome.documents = slots.into_iter().flatten().collect();
    outcome
}
