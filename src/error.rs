// src/error.rs
//
// Typed error surface for the store, per spec.md §7. The coordinator loops
// and worker harness consume this through `anyhow::Result` at their call
// sites but the store itself returns this enum so callers can match on
// `StoreConflict` and retry, or on `InvalidTransition` and pick another
// candidate, without string-matching an opaque error.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found")]
    NotFound,

    #[error("invalid transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("node busy")]
    NodeBusy,

    #[error("node unavailable")]
    NodeUnavailable,

    #[error("store conflict after retries")]
    StoreConflict,

    #[error("capability mismatch")]
    CapabilityMismatch,

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;
