//! # docmirror Protocol
//!
//! Wire and data types for docmirror dataset mirroring.
//!
//! This crate provides:
//! - `Document` for dataset records (`_id` / `_rev` plus opaque payload)
//! - `MutationEvent` for incremental change notifications
//! - Draft/published identifier helpers
//! - Reserved system-prefix helpers
//!
//! This is a pure data crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod document;
mod mutation;

pub use document::{is_draft_id, is_system_id, published_id, Document, DRAFTS_PREFIX, SYSTEM_PREFIX};
pub use mutation::{MutationEffects, MutationEvent};
