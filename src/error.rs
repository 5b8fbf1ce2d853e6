//! Typed error taxonomy for the retrieval engine.
//!
//! Query-time failures are always surfaced as a typed outcome to the caller.
//! Reads of absent ids are *not* errors: they produce empty results. Background
//! failures (eviction, heartbeats) are logged and retried, never propagated
//! into this taxonomy.

use thiserror::Error;

/// Errors the engine can return to a caller.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A vector's length does not match the index's fixed dimension.
    /// During batch ingestion this rejects only the offending record.
    #[error("dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    /// The query exceeded its deadline. Downstream search and ranking were
    /// abandoned; the caller never hangs.
    #[error("query exceeded deadline of {deadline_ms} ms")]
    Timeout { deadline_ms: u64 },

    /// The request queue is saturated; fail fast instead of queuing unboundedly.
    #[error("request queue full ({capacity} pending)")]
    Overload { capacity: usize },

    /// Every registered worker is Unhealthy (or none is registered).
    #[error("no available worker")]
    NoAvailableWorker,

    /// Snapshot file could not be read or failed validation.
    #[error("snapshot format error: {0}")]
    SnapshotFormat(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Convenience alias used throughout the engine surface.
pub type EngineResult<T> = Result<T, EngineError>;
