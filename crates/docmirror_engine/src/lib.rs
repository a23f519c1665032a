//! # docmirror Engine
//!
//! Reconciliation engine for live-mirrored remote document datasets.
//!
//! This crate provides:
//! - The `sync` entry point: bulk fetch raced against a live change feed
//! - Pending-event buffering and pivot replay against the snapshot
//! - Incremental apply with insert/replace/delete semantics
//! - Draft-over-published overlay projection
//! - A subscription handle with readiness, state, and stats
//!
//! ## Architecture
//!
//! The engine performs no I/O itself. Callers inject three
//! collaborators: a [`DocumentFetcher`] for the one-shot bulk fetch, a
//! [`ChangeListener`] producing decoded change events, and a
//! [`PatchApplier`] interpreting patch descriptions. In listening mode
//! both the fetch and the feed start as soon as `sync` is invoked;
//! events arriving before the snapshot are buffered and replayed from
//! the pivot — the first event whose previous revision matches the
//! snapshot document — so nothing is lost, duplicated, or applied out
//! of order.
//!
//! ## Key invariants
//!
//! - The ordered sequence and the identifier index are two views of one
//!   set, kept in lockstep by every mutation
//! - Events are never processed out of arrival order
//! - All subscription state is owned by a single task; buffer, replay,
//!   and apply can never interleave
//! - The pending buffer is bounded; overflow fails the subscription
//!   explicitly instead of growing without limit

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod engine;
mod error;
mod overlay;
mod patch;
mod replay;
mod store;
mod subscription;
mod transport;

pub use config::{MirrorConfig, DEFAULT_BUFFER_CAPACITY};
pub use engine::{sync, Collaborators};
pub use error::{MirrorError, MirrorResult};
pub use overlay::overlay;
pub use patch::{PatchApplier, ValuePatchApplier};
pub use replay::{replay, ReplayOutcome};
pub use store::IndexedCollection;
pub use subscription::{MirrorState, MirrorStats, MirrorSubscription};
pub use transport::{
    ChangeListener, DocumentFetcher, ListenerEvent, ScriptedFetcher, ScriptedListener,
    StaticFetcher,
};
