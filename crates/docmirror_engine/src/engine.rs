//! The reconciliation engine.
//!
//! One spawned task owns the collection, the pending buffer, and the
//! readiness state; the outside world reaches it only through channels.
//! That makes the buffer/replay/apply mutual exclusion structural: no
//! incoming event can interleave with a half-finished transition.

use crate::config::MirrorConfig;
use crate::error::{MirrorError, MirrorResult};
use crate::overlay::overlay;
use crate::patch::PatchApplier;
use crate::replay::replay;
use crate::store::IndexedCollection;
use crate::subscription::{MirrorState, MirrorStats, MirrorSubscription};
use crate::transport::{ChangeListener, DocumentFetcher, ListenerEvent};
use docmirror_protocol::{Document, MutationEvent};
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};

/// The dependency-injected collaborators of a subscription.
///
/// The engine performs no I/O of its own: the fetcher issues the bulk
/// snapshot request, the listener opens the push connection, and the
/// applier interprets patch descriptions.
pub struct Collaborators<F, L, P> {
    /// Bulk fetch implementation.
    pub fetcher: F,
    /// Change feed implementation.
    pub listener: L,
    /// Patch applier implementation.
    pub applier: P,
}

/// Starts mirroring a dataset.
///
/// In non-listening mode this performs a single bulk fetch, delivers it
/// through `on_update`, and resolves `loaded`; `unsubscribe` is a no-op.
///
/// In listening mode the change feed is opened and the bulk fetch is
/// issued concurrently, as soon as this function is called. Events
/// arriving before the snapshot are buffered; the feed's open signal
/// gates consumption of the fetch result; once it resolves, the buffer
/// is replayed against the snapshot to produce the authoritative
/// collection, after which events apply directly. Every delivered
/// update passes through the draft overlay when enabled.
pub fn sync<F, L, P, U>(
    config: MirrorConfig,
    on_update: U,
    collaborators: Collaborators<F, L, P>,
) -> MirrorSubscription
where
    F: DocumentFetcher,
    L: ChangeListener,
    P: PatchApplier,
    U: FnMut(&[Document]) + Send + 'static,
{
    let (loaded_tx, loaded_rx) = watch::channel(None);
    let (state_tx, state_rx) = watch::channel(MirrorState::Connecting);
    let stats = Arc::new(RwLock::new(MirrorStats::default()));

    let Collaborators {
        fetcher,
        listener,
        applier,
    } = collaborators;

    if !config.listen {
        tokio::spawn(one_shot_fetch(config, on_update, fetcher, loaded_tx, state_tx));
        return MirrorSubscription::new(None, loaded_rx, state_rx, Arc::clone(&stats));
    }

    let events = match listener.open(&config.project_id, &config.dataset) {
        Ok(events) => events,
        Err(err) => {
            stats.write().last_error = Some(err.to_string());
            let _ = state_tx.send(MirrorState::Failed);
            let _ = loaded_tx.send(Some(Err(err)));
            return MirrorSubscription::new(None, loaded_rx, state_rx, Arc::clone(&stats));
        }
    };

    // The fetch starts now, not when the feed opens; its result is only
    // consumed once the open signal arrives.
    let (fetch_tx, fetch_rx) = oneshot::channel();
    {
        let project_id = config.project_id.clone();
        let dataset = config.dataset.clone();
        tokio::spawn(async move {
            let result = fetcher.fetch(&project_id, &dataset).await;
            let _ = fetch_tx.send(result);
        });
    }

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let actor = MirrorActor {
        config,
        applier,
        on_update,
        store: IndexedCollection::new(),
        buffer: Vec::new(),
        live: false,
        open_seen: false,
        stats: Arc::clone(&stats),
        state_tx,
        loaded_tx,
    };
    tokio::spawn(actor.run(events, fetch_rx, shutdown_rx));

    MirrorSubscription::new(Some(shutdown_tx), loaded_rx, state_rx, stats)
}

/// Non-listening mode: one fetch, one update, done.
async fn one_shot_fetch<F, U>(
    config: MirrorConfig,
    mut on_update: U,
    fetcher: F,
    loaded_tx: watch::Sender<Option<MirrorResult<()>>>,
    state_tx: watch::Sender<MirrorState>,
) where
    F: DocumentFetcher,
    U: FnMut(&[Document]) + Send + 'static,
{
    match fetcher.fetch(&config.project_id, &config.dataset).await {
        Ok(documents) => {
            if config.overlay_drafts {
                on_update(&overlay(&documents));
            } else {
                on_update(&documents);
            }
            let _ = state_tx.send(MirrorState::Live);
            let _ = loaded_tx.send(Some(Ok(())));
        }
        Err(err) => {
            let _ = state_tx.send(MirrorState::Failed);
            let _ = loaded_tx.send(Some(Err(err)));
        }
    }
}

/// Single owner of all mutable subscription state.
struct MirrorActor<P, U> {
    config: MirrorConfig,
    applier: P,
    on_update: U,
    store: IndexedCollection,
    buffer: Vec<MutationEvent>,
    /// True once the collection is authoritative (snapshot reconciled).
    live: bool,
    open_seen: bool,
    stats: Arc<RwLock<MirrorStats>>,
    state_tx: watch::Sender<MirrorState>,
    loaded_tx: watch::Sender<Option<MirrorResult<()>>>,
}

impl<P, U> MirrorActor<P, U>
where
    P: PatchApplier,
    U: FnMut(&[Document]) + Send + 'static,
{
    async fn run(
        mut self,
        mut events: mpsc::Receiver<ListenerEvent>,
        mut fetch_rx: oneshot::Receiver<MirrorResult<Vec<Document>>>,
        mut shutdown_rx: oneshot::Receiver<()>,
    ) {
        let mut fetch_pending = true;

        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    debug!(dataset = %self.config.dataset, "subscription closed");
                    break;
                }
                event = events.recv() => match event {
                    Some(event) => {
                        if !self.handle_listener_event(event) {
                            break;
                        }
                    }
                    None => {
                        self.handle_feed_closed();
                        break;
                    }
                },
                result = &mut fetch_rx, if self.open_seen && fetch_pending => {
                    fetch_pending = false;
                    self.handle_fetch_result(result.unwrap_or_else(|_| {
                        Err(MirrorError::Fetch("bulk fetch task dropped".into()))
                    }));
                }
            }
        }
    }

    /// Returns false when the subscription must stop.
    fn handle_listener_event(&mut self, event: ListenerEvent) -> bool {
        match event {
            ListenerEvent::Open => {
                debug!(dataset = %self.config.dataset, "change feed open");
                self.open_seen = true;
                if self.live {
                    // A reconnect after degradation
                    self.set_state(MirrorState::Live);
                }
                true
            }
            ListenerEvent::Error(message) => {
                warn!(dataset = %self.config.dataset, error = %message, "change feed error");
                {
                    let mut stats = self.stats.write();
                    stats.transport_errors += 1;
                    stats.last_error = Some(message);
                }
                self.set_state(MirrorState::Degraded);
                true
            }
            ListenerEvent::Mutation(event) => {
                if event.is_system() {
                    self.stats.write().events_ignored += 1;
                    return true;
                }
                if self.live {
                    self.apply_live(event);
                    true
                } else {
                    self.buffer_event(event)
                }
            }
        }
    }

    /// Buffers a pre-snapshot event, failing on overflow.
    fn buffer_event(&mut self, event: MutationEvent) -> bool {
        if self.buffer.len() >= self.config.buffer_capacity {
            self.fail(MirrorError::BufferOverflow {
                capacity: self.config.buffer_capacity,
            });
            return false;
        }
        self.buffer.push(event);
        self.stats.write().events_buffered += 1;
        true
    }

    /// Applies a post-snapshot event directly to the collection.
    fn apply_live(&mut self, event: MutationEvent) {
        let Some(effects) = event.effects else {
            self.stats.write().events_ignored += 1;
            return;
        };

        let current = self.store.get(&event.document_id);
        let next = self.applier.apply(current, &effects.apply);
        self.store.commit(&event.document_id, next);
        self.stats.write().events_applied += 1;

        if self.state() == MirrorState::Degraded {
            self.set_state(MirrorState::Live);
        }
        self.notify();
    }

    /// Reconciles the snapshot with the pending buffer.
    fn handle_fetch_result(&mut self, result: MirrorResult<Vec<Document>>) {
        let snapshot = match result {
            Ok(snapshot) => snapshot,
            Err(err) => {
                // Readiness is lost for good; the feed stays open and
                // events keep buffering until the capacity check fails
                // the subscription. Retry policy belongs to the caller.
                warn!(dataset = %self.config.dataset, error = %err, "bulk fetch failed");
                self.stats.write().last_error = Some(err.to_string());
                let _ = self.loaded_tx.send(Some(Err(err)));
                return;
            }
        };

        let pending = std::mem::take(&mut self.buffer);
        debug!(
            dataset = %self.config.dataset,
            snapshot = snapshot.len(),
            buffered = pending.len(),
            "reconciling snapshot"
        );

        let outcome = replay(&self.applier, snapshot, pending);
        {
            let mut stats = self.stats.write();
            stats.events_applied += outcome.applied;
            stats.events_discarded += outcome.discarded;
            stats.missing_documents += outcome.missing_documents;
        }

        self.store = IndexedCollection::from_documents(outcome.documents);
        self.live = true;
        self.set_state(MirrorState::Live);
        self.notify();
        let _ = self.loaded_tx.send(Some(Ok(())));
    }

    /// The feed ended without an unsubscribe: terminal for this
    /// subscription, since reconnecting is the transport's job.
    fn handle_feed_closed(&mut self) {
        if self.live {
            warn!(dataset = %self.config.dataset, "change feed closed; mirror is frozen");
            self.set_state(MirrorState::Degraded);
        } else {
            self.fail(MirrorError::Transport("change feed closed".into()));
        }
    }

    /// Fails the subscription: rejects `loaded` if still pending.
    fn fail(&mut self, err: MirrorError) {
        warn!(dataset = %self.config.dataset, error = %err, "subscription failed");
        self.stats.write().last_error = Some(err.to_string());
        if self.loaded_tx.borrow().is_none() {
            let _ = self.loaded_tx.send(Some(Err(err)));
        }
        self.set_state(MirrorState::Failed);
    }

    /// Delivers the visible collection to the caller.
    fn notify(&mut self) {
        if self.config.overlay_drafts {
            let visible = overlay(self.store.documents());
            (self.on_update)(&visible);
        } else {
            (self.on_update)(self.store.documents());
        }
    }

    fn state(&self) -> MirrorState {
        *self.state_tx.borrow()
    }

    fn set_state(&self, state: MirrorState) {
        let _ = self.state_tx.send(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch::ValuePatchApplier;
    use crate::transport::{ScriptedFetcher, ScriptedListener, StaticFetcher};
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn doc(id: &str, rev: &str) -> Document {
        Document::new(id).with_rev(rev)
    }

    /// Callback capturing every update in order, plus a channel to
    /// await deliveries without sleeping.
    fn recording_callback() -> (
        impl FnMut(&[Document]) + Send + 'static,
        UnboundedReceiver<Vec<Document>>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            move |docs: &[Document]| {
                let _ = tx.send(docs.to_vec());
            },
            rx,
        )
    }

    fn listening_config() -> MirrorConfig {
        MirrorConfig::new("proj", "blog").with_listen(true)
    }

    fn set_patch(id: &str, previous_rev: &str, rev: &str, field: &str, value: i64) -> MutationEvent {
        MutationEvent::patch(id, previous_rev, json!({"set": {"_rev": rev, field: value}}))
    }

    fn create_patch(id: &str, rev: &str) -> MutationEvent {
        MutationEvent {
            document_id: id.to_string(),
            previous_rev: None,
            effects: Some(docmirror_protocol::MutationEffects {
                apply: json!({"create": {"_id": id, "_rev": rev}}),
            }),
        }
    }

    #[tokio::test]
    async fn non_listening_mode_fetches_once() {
        let (on_update, mut updates) = recording_callback();
        let mut subscription = sync(
            MirrorConfig::new("proj", "blog"),
            on_update,
            Collaborators {
                fetcher: StaticFetcher::new(vec![doc("a", "r1")]),
                listener: ScriptedListener::new(1).1,
                applier: ValuePatchApplier,
            },
        );

        subscription.loaded().await.unwrap();
        assert_eq!(subscription.state(), MirrorState::Live);

        let delivered = updates.recv().await.unwrap();
        assert_eq!(delivered, vec![doc("a", "r1")]);

        // unsubscribe is a no-op in non-listening mode
        subscription.unsubscribe();
    }

    #[tokio::test]
    async fn events_before_snapshot_are_buffered_and_replayed() {
        let (on_update, mut updates) = recording_callback();
        let (resolve_fetch, fetcher) = ScriptedFetcher::new();
        let (feed, listener) = ScriptedListener::new(16);

        let subscription = sync(
            listening_config(),
            on_update,
            Collaborators {
                fetcher,
                listener,
                applier: ValuePatchApplier,
            },
        );

        // Events race ahead of both the open signal and the snapshot
        feed.send(ListenerEvent::Mutation(set_patch("a", "r0", "r1", "stale", 1)))
            .await
            .unwrap();
        feed.send(ListenerEvent::Mutation(set_patch("a", "r1", "r2", "fresh", 2)))
            .await
            .unwrap();
        feed.send(ListenerEvent::Open).await.unwrap();
        resolve_fetch.send(Ok(vec![doc("a", "r1")])).unwrap();

        subscription.loaded().await.unwrap();

        let delivered = updates.recv().await.unwrap();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].rev.as_deref(), Some("r2"));
        assert_eq!(delivered[0].payload.get("fresh"), Some(&json!(2)));
        // The pre-pivot event was already reflected in the snapshot
        assert!(!delivered[0].payload.contains_key("stale"));

        let stats = subscription.stats();
        assert_eq!(stats.events_buffered, 2);
        assert_eq!(stats.events_discarded, 1);
        assert_eq!(stats.events_applied, 1);
    }

    #[tokio::test]
    async fn events_after_snapshot_apply_directly() {
        let (on_update, mut updates) = recording_callback();
        let (feed, listener) = ScriptedListener::new(16);

        let subscription = sync(
            listening_config(),
            on_update,
            Collaborators {
                fetcher: StaticFetcher::new(vec![]),
                listener,
                applier: ValuePatchApplier,
            },
        );

        feed.send(ListenerEvent::Open).await.unwrap();
        subscription.loaded().await.unwrap();
        assert!(updates.recv().await.unwrap().is_empty());

        // insert
        feed.send(ListenerEvent::Mutation(create_patch("x", "r1")))
            .await
            .unwrap();
        let delivered = updates.recv().await.unwrap();
        assert_eq!(delivered, vec![doc("x", "r1")]);

        // replace in place
        feed.send(ListenerEvent::Mutation(set_patch("x", "r1", "r2", "n", 1)))
            .await
            .unwrap();
        let delivered = updates.recv().await.unwrap();
        assert_eq!(delivered[0].rev.as_deref(), Some("r2"));
        assert_eq!(delivered[0].payload.get("n"), Some(&json!(1)));

        // delete
        feed.send(ListenerEvent::Mutation(MutationEvent::patch(
            "x",
            "r2",
            json!({"delete": true}),
        )))
        .await
        .unwrap();
        let delivered = updates.recv().await.unwrap();
        assert!(delivered.is_empty());
    }

    #[tokio::test]
    async fn system_prefixed_events_never_mutate() {
        let (on_update, mut updates) = recording_callback();
        let (feed, listener) = ScriptedListener::new(16);

        let subscription = sync(
            listening_config(),
            on_update,
            Collaborators {
                fetcher: StaticFetcher::new(vec![doc("a", "r1")]),
                listener,
                applier: ValuePatchApplier,
            },
        );

        feed.send(ListenerEvent::Open).await.unwrap();
        subscription.loaded().await.unwrap();
        updates.recv().await.unwrap();

        feed.send(ListenerEvent::Mutation(MutationEvent::patch(
            "_.txn.9f2",
            "r1",
            json!({"create": {"_id": "_.txn.9f2"}}),
        )))
        .await
        .unwrap();
        // A normal event afterwards proves the system event was skipped
        feed.send(ListenerEvent::Mutation(set_patch("a", "r1", "r2", "n", 1)))
            .await
            .unwrap();

        let delivered = updates.recv().await.unwrap();
        let ids: Vec<&str> = delivered.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["a"]);
        assert_eq!(subscription.stats().events_ignored, 1);
    }

    #[tokio::test]
    async fn overlay_merges_draft_and_published() {
        let (on_update, mut updates) = recording_callback();
        let (feed, listener) = ScriptedListener::new(16);

        let subscription = sync(
            listening_config().with_overlay_drafts(true),
            on_update,
            Collaborators {
                fetcher: StaticFetcher::new(vec![
                    Document::new("drafts.p1").with_rev("r1").with_field("v", json!("draft")),
                    Document::new("p1").with_rev("r1").with_field("v", json!("published")),
                ]),
                listener,
                applier: ValuePatchApplier,
            },
        );

        feed.send(ListenerEvent::Open).await.unwrap();
        subscription.loaded().await.unwrap();

        let delivered = updates.recv().await.unwrap();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].id, "p1");
        assert_eq!(delivered[0].payload.get("v"), Some(&json!("draft")));
    }

    #[tokio::test]
    async fn fetch_failure_rejects_loaded_and_keeps_buffering() {
        let (on_update, mut updates) = recording_callback();
        let (resolve_fetch, fetcher) = ScriptedFetcher::new();
        let (feed, listener) = ScriptedListener::new(16);

        let subscription = sync(
            listening_config(),
            on_update,
            Collaborators {
                fetcher,
                listener,
                applier: ValuePatchApplier,
            },
        );

        feed.send(ListenerEvent::Open).await.unwrap();
        resolve_fetch
            .send(Err(MirrorError::Fetch("503".into())))
            .unwrap();

        assert_eq!(
            subscription.loaded().await,
            Err(MirrorError::Fetch("503".into()))
        );

        // The subscription is still open; events keep buffering against
        // a snapshot that will never arrive
        feed.send(ListenerEvent::Mutation(set_patch("a", "r1", "r2", "n", 1)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(subscription.stats().events_buffered, 1);
        assert!(updates.try_recv().is_err());
    }

    #[tokio::test]
    async fn buffer_overflow_fails_the_subscription() {
        let (on_update, _updates) = recording_callback();
        let (_resolve_fetch, fetcher) = ScriptedFetcher::new();
        let (feed, listener) = ScriptedListener::new(16);

        let subscription = sync(
            listening_config().with_buffer_capacity(2),
            on_update,
            Collaborators {
                fetcher,
                listener,
                applier: ValuePatchApplier,
            },
        );

        for i in 0..3 {
            feed.send(ListenerEvent::Mutation(set_patch("a", "r0", "r1", "n", i)))
                .await
                .unwrap();
        }

        assert_eq!(
            subscription.loaded().await,
            Err(MirrorError::BufferOverflow { capacity: 2 })
        );
        assert_eq!(subscription.state(), MirrorState::Failed);
    }

    #[tokio::test]
    async fn transport_errors_surface_as_degraded() {
        let (on_update, mut updates) = recording_callback();
        let (feed, listener) = ScriptedListener::new(16);

        let subscription = sync(
            listening_config(),
            on_update,
            Collaborators {
                fetcher: StaticFetcher::new(vec![doc("a", "r1")]),
                listener,
                applier: ValuePatchApplier,
            },
        );

        feed.send(ListenerEvent::Open).await.unwrap();
        subscription.loaded().await.unwrap();
        updates.recv().await.unwrap();

        let mut states = subscription.state_changes();
        feed.send(ListenerEvent::Error("connection reset".into()))
            .await
            .unwrap();
        states
            .wait_for(|state| *state == MirrorState::Degraded)
            .await
            .unwrap();
        assert_eq!(subscription.stats().transport_errors, 1);

        // Applying an event after the feed resumes restores Live
        feed.send(ListenerEvent::Mutation(set_patch("a", "r1", "r2", "n", 1)))
            .await
            .unwrap();
        states
            .wait_for(|state| *state == MirrorState::Live)
            .await
            .unwrap();
        updates.recv().await.unwrap();
    }

    #[tokio::test]
    async fn unsubscribe_terminates_callbacks_and_closes_the_feed() {
        let (on_update, mut updates) = recording_callback();
        let (feed, listener) = ScriptedListener::new(16);

        let mut subscription = sync(
            listening_config(),
            on_update,
            Collaborators {
                fetcher: StaticFetcher::new(vec![doc("a", "r1")]),
                listener,
                applier: ValuePatchApplier,
            },
        );

        feed.send(ListenerEvent::Open).await.unwrap();
        subscription.loaded().await.unwrap();
        updates.recv().await.unwrap();

        subscription.unsubscribe();

        // The feed closes once the actor drops its receiver; events sent
        // before that point are the documented in-flight caveat and are
        // not asserted on. Eventually sends must fail.
        let mut closed = false;
        for _ in 0..50 {
            if feed
                .send(ListenerEvent::Mutation(set_patch("a", "r1", "r2", "n", 1)))
                .await
                .is_err()
            {
                closed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(closed, "change feed was not closed by unsubscribe");

        // Drain anything already in flight, then confirm silence
        tokio::time::sleep(Duration::from_millis(20)).await;
        while updates.try_recv().is_ok() {}
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(updates.try_recv().is_err());
    }

    #[tokio::test]
    async fn unsubscribe_before_readiness_rejects_loaded_with_closed() {
        let (on_update, mut updates) = recording_callback();
        let (_resolve_fetch, fetcher) = ScriptedFetcher::new();
        let (_feed, listener) = ScriptedListener::new(4);

        let mut subscription = sync(
            listening_config(),
            on_update,
            Collaborators {
                fetcher,
                listener,
                applier: ValuePatchApplier,
            },
        );

        // Shut down while the snapshot is still pending
        subscription.unsubscribe();

        assert_eq!(subscription.loaded().await, Err(MirrorError::Closed));
        // The actor is gone, so the callback can never fire again
        assert!(updates.recv().await.is_none());
    }

    #[tokio::test]
    async fn listener_open_failure_fails_the_subscription() {
        struct BrokenListener;
        impl ChangeListener for BrokenListener {
            fn open(
                &self,
                _project_id: &str,
                _dataset: &str,
            ) -> MirrorResult<mpsc::Receiver<ListenerEvent>> {
                Err(MirrorError::Transport("no route".into()))
            }
        }

        let (on_update, _updates) = recording_callback();
        let subscription = sync(
            listening_config(),
            on_update,
            Collaborators {
                fetcher: StaticFetcher::new(vec![]),
                listener: BrokenListener,
                applier: ValuePatchApplier,
            },
        );

        assert_eq!(
            subscription.loaded().await,
            Err(MirrorError::Transport("no route".into()))
        );
        assert_eq!(subscription.state(), MirrorState::Failed);
    }

    #[tokio::test]
    async fn snapshot_ready_before_open_still_waits_for_open() {
        let (on_update, mut updates) = recording_callback();
        let (feed, listener) = ScriptedListener::new(16);

        let subscription = sync(
            listening_config(),
            on_update,
            Collaborators {
                // Resolves immediately, long before the feed opens
                fetcher: StaticFetcher::new(vec![doc("a", "r1")]),
                listener,
                applier: ValuePatchApplier,
            },
        );

        // Buffered while the fetch result sits unconsumed
        feed.send(ListenerEvent::Mutation(set_patch("a", "r1", "r2", "n", 7)))
            .await
            .unwrap();
        feed.send(ListenerEvent::Open).await.unwrap();

        subscription.loaded().await.unwrap();
        let delivered = updates.recv().await.unwrap();
        assert_eq!(delivered[0].rev.as_deref(), Some("r2"));
        assert_eq!(delivered[0].payload.get("n"), Some(&json!(7)));
        assert_eq!(subscription.stats().events_buffered, 1);
    }
}
