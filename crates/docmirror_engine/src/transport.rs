//! Collaborator seams: bulk fetch and the live change feed.

use crate::error::{MirrorError, MirrorResult};
use docmirror_protocol::{Document, MutationEvent};
use std::future::Future;
use tokio::sync::{mpsc, oneshot};

/// An event delivered by the change feed.
///
/// Per-message decode failures are the listener's concern: a message
/// that fails to decode is simply never delivered, leaving the
/// connection and the pending buffer unaffected.
#[derive(Debug)]
pub enum ListenerEvent {
    /// The feed connection is established; mutation delivery follows.
    Open,
    /// A decoded change notification.
    Mutation(MutationEvent),
    /// A transport-level error. The transport is expected to reconnect
    /// transparently; the engine surfaces this as a degraded state.
    Error(String),
}

/// Opens a persistent push connection scoped to a dataset.
///
/// Implementations decode inbound messages into [`ListenerEvent`]s and
/// deliver them in arrival order. Dropping the returned receiver closes
/// the connection.
pub trait ChangeListener: Send + Sync + 'static {
    /// Opens the change feed for the given dataset.
    fn open(
        &self,
        project_id: &str,
        dataset: &str,
    ) -> MirrorResult<mpsc::Receiver<ListenerEvent>>;
}

/// Issues the one-shot bulk fetch for a dataset.
pub trait DocumentFetcher: Send + Sync + 'static {
    /// Fetches the full document collection.
    fn fetch(
        &self,
        project_id: &str,
        dataset: &str,
    ) -> impl Future<Output = MirrorResult<Vec<Document>>> + Send;
}

/// A fetcher returning a fixed snapshot, resolving immediately.
#[derive(Debug, Clone, Default)]
pub struct StaticFetcher {
    documents: Vec<Document>,
}

impl StaticFetcher {
    /// Creates a fetcher serving the given snapshot.
    pub fn new(documents: Vec<Document>) -> Self {
        Self { documents }
    }
}

impl DocumentFetcher for StaticFetcher {
    fn fetch(
        &self,
        _project_id: &str,
        _dataset: &str,
    ) -> impl Future<Output = MirrorResult<Vec<Document>>> + Send {
        let documents = self.documents.clone();
        async move { Ok(documents) }
    }
}

/// A fetcher whose resolution is controlled by the test.
///
/// The fetch suspends until the paired sender delivers a result,
/// allowing change events to race ahead of the snapshot.
#[derive(Debug)]
pub struct ScriptedFetcher {
    slot: parking_lot::Mutex<Option<oneshot::Receiver<MirrorResult<Vec<Document>>>>>,
}

impl ScriptedFetcher {
    /// Creates a scripted fetcher and the sender resolving it.
    pub fn new() -> (oneshot::Sender<MirrorResult<Vec<Document>>>, Self) {
        let (tx, rx) = oneshot::channel();
        (
            tx,
            Self {
                slot: parking_lot::Mutex::new(Some(rx)),
            },
        )
    }
}

impl DocumentFetcher for ScriptedFetcher {
    fn fetch(
        &self,
        _project_id: &str,
        _dataset: &str,
    ) -> impl Future<Output = MirrorResult<Vec<Document>>> + Send {
        let receiver = self.slot.lock().take();
        async move {
            match receiver {
                Some(rx) => rx
                    .await
                    .unwrap_or_else(|_| Err(MirrorError::Fetch("fetch script dropped".into()))),
                None => Err(MirrorError::Fetch("fetch already consumed".into())),
            }
        }
    }
}

/// A change listener scripted from a channel, for tests.
///
/// The test keeps the sender and feeds `Open`, `Mutation`, and `Error`
/// events at the timings under test.
#[derive(Debug)]
pub struct ScriptedListener {
    feed: parking_lot::Mutex<Option<mpsc::Receiver<ListenerEvent>>>,
}

impl ScriptedListener {
    /// Creates a scripted listener and the sender feeding it.
    pub fn new(capacity: usize) -> (mpsc::Sender<ListenerEvent>, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            tx,
            Self {
                feed: parking_lot::Mutex::new(Some(rx)),
            },
        )
    }
}

impl ChangeListener for ScriptedListener {
    fn open(
        &self,
        _project_id: &str,
        _dataset: &str,
    ) -> MirrorResult<mpsc::Receiver<ListenerEvent>> {
        self.feed
            .lock()
            .take()
            .ok_or_else(|| MirrorError::Transport("listener already opened".into()))
    }
}
