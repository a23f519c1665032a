//! Error types for the mirror engine.

use thiserror::Error;

/// Result type for mirror operations.
pub type MirrorResult<T> = Result<T, MirrorError>;

/// Errors that can occur while mirroring a dataset.
///
/// Per-message decode failures and transient transport errors are not
/// represented here: the former are skipped by the listener before they
/// reach the engine, the latter are surfaced as a degraded state on the
/// subscription instead of failing it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MirrorError {
    /// The bulk fetch failed; the subscription never reached its first
    /// consistent state.
    #[error("bulk fetch failed: {0}")]
    Fetch(String),

    /// The change feed could not be opened or was lost before the
    /// snapshot arrived.
    #[error("transport error: {0}")]
    Transport(String),

    /// The pending buffer filled up before the snapshot arrived.
    #[error("pending buffer overflow: {capacity} events buffered before the snapshot arrived")]
    BufferOverflow {
        /// Configured buffer capacity that was exceeded.
        capacity: usize,
    },

    /// The subscription was shut down before readiness.
    #[error("subscription closed")]
    Closed,
}
