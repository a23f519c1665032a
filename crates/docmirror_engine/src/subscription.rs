//! The subscription handle returned to callers.

use crate::error::{MirrorError, MirrorResult};
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::{oneshot, watch};

/// The observable state of a mirror subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MirrorState {
    /// Awaiting the change feed and/or the bulk snapshot.
    Connecting,
    /// The collection reached a consistent state and is tracking the feed.
    Live,
    /// The transport reported an error; the mirror keeps its last state
    /// and recovers when the feed resumes.
    Degraded,
    /// The subscription failed and will make no further progress.
    Failed,
}

impl MirrorState {
    /// Returns true once the collection holds a consistent state.
    pub fn is_ready(&self) -> bool {
        matches!(self, MirrorState::Live | MirrorState::Degraded)
    }

    /// Returns true if the subscription can make no further progress.
    pub fn is_failed(&self) -> bool {
        matches!(self, MirrorState::Failed)
    }
}

/// Counters describing a subscription's activity.
#[derive(Debug, Clone, Default)]
pub struct MirrorStats {
    /// Events buffered while awaiting the snapshot.
    pub events_buffered: u64,
    /// Events applied to the collection (replay and live).
    pub events_applied: u64,
    /// Buffered events discarded as already reflected in the snapshot.
    pub events_discarded: u64,
    /// Events ignored (system bookkeeping or carrying no effects).
    pub events_ignored: u64,
    /// Mutation groups whose document was missing from the snapshot.
    pub missing_documents: u64,
    /// Transport errors reported by the change feed.
    pub transport_errors: u64,
    /// Most recent error message, if any.
    pub last_error: Option<String>,
}

/// Handle to a mirrored dataset subscription.
///
/// Dropping the handle unsubscribes. After `unsubscribe`, no further
/// update callbacks fire, except for one already in flight at the
/// moment of the call.
#[derive(Debug)]
pub struct MirrorSubscription {
    shutdown: Option<oneshot::Sender<()>>,
    loaded_rx: watch::Receiver<Option<MirrorResult<()>>>,
    state_rx: watch::Receiver<MirrorState>,
    stats: Arc<RwLock<MirrorStats>>,
}

impl MirrorSubscription {
    pub(crate) fn new(
        shutdown: Option<oneshot::Sender<()>>,
        loaded_rx: watch::Receiver<Option<MirrorResult<()>>>,
        state_rx: watch::Receiver<MirrorState>,
        stats: Arc<RwLock<MirrorStats>>,
    ) -> Self {
        Self {
            shutdown,
            loaded_rx,
            state_rx,
            stats,
        }
    }

    /// Stops the subscription and closes the change feed. Idempotent.
    pub fn unsubscribe(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }

    /// Completes when the collection first reaches a consistent state.
    ///
    /// Resolves `Ok(())` exactly once the snapshot has been reconciled
    /// (or fetched, in non-listening mode). Rejects on fetch failure,
    /// buffer overflow, or shutdown before readiness.
    pub async fn loaded(&self) -> MirrorResult<()> {
        let mut loaded = self.loaded_rx.clone();
        let outcome = match loaded.wait_for(Option::is_some).await {
            Ok(ready) => (*ready).clone(),
            Err(_) => None,
        };
        outcome.unwrap_or(Err(MirrorError::Closed))
    }

    /// The current subscription state.
    pub fn state(&self) -> MirrorState {
        *self.state_rx.borrow()
    }

    /// A watch channel of state transitions, including the degraded
    /// signal on transport errors.
    pub fn state_changes(&self) -> watch::Receiver<MirrorState> {
        self.state_rx.clone()
    }

    /// A snapshot of the subscription's counters.
    pub fn stats(&self) -> MirrorStats {
        self.stats.read().clone()
    }
}

impl Drop for MirrorSubscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
