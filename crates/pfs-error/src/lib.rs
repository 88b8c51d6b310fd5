#![forbid(unsafe_code)]
//! Error types for poolfs.
//!
//! # Error Taxonomy
//!
//! `PoolError` is the single user-facing error type returned by the
//! repository facade, the accounting layer, and the store decorators.
//! Each variant documents its recovery posture:
//!
//! | Variant | Recoverable? | Typical cause |
//! |---------|--------------|---------------|
//! | `Io` | maybe | disk failure under metadata or blob store |
//! | `ResourceUnavailable` | yes (retry/reduce) | space shortage or allocation timeout |
//! | `DuplicateEntry` | no | creation of an already-known replica |
//! | `NotFound` | no | operation on an unknown replica |
//! | `IllegalTransition` | no | state change not permitted by the lifecycle table |
//! | `CorruptReplica` | operator | on-disk bytes contradict authoritative size/checksum |
//! | `NamespaceTimeout` | yes (retry) | namespace authority did not answer in time |
//! | `NamespaceUnavailable` | yes (retry) | namespace authority failed with a transient error |
//! | `InvalidArgument` | no | programming error (bad sizes, bad expiry) |
//! | `Busy` | yes (wait) | replica is mid-transfer |
//! | `Closed` | no | repository or store used after shutdown |
//! | `Metadata` | operator | persisted record does not parse |
//!
//! ## Design Constraints
//!
//! - This crate MUST NOT depend on other poolfs crates (no cyclic deps);
//!   identifiers and states appear here as their string renderings.
//! - All string payloads are owned (`String`) so errors can cross thread
//!   boundaries without lifetime entanglement.
//! - Accounting and cache-layer errors are never swallowed; reconciliation
//!   absorbs only the namespace errors the healing algorithm maps to a
//!   local repair action.

use thiserror::Error;

/// Unified error type for all poolfs operations.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Operating system I/O error (wraps `std::io::Error`).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Space could not be allocated within the given constraints.
    ///
    /// Raised for a synchronous shortage (`try_allocate`, fail-fast
    /// allocation) and for a timed-out blocking allocation. Callers may
    /// retry later or reduce demand.
    #[error("resource unavailable: {0}")]
    ResourceUnavailable(String),

    /// Attempted creation of a replica that already exists.
    #[error("entry already exists: {0}")]
    DuplicateEntry(String),

    /// Replica (or other named object) is not in the repository.
    #[error("not found: {0}")]
    NotFound(String),

    /// Requested state change is not permitted from the current state.
    #[error("illegal transition for {id}: {from} -> {to}")]
    IllegalTransition {
        id: String,
        from: String,
        to: String,
    },

    /// On-disk content disagrees irreconcilably with the authoritative
    /// size or checksum. The replica is quarantined as broken, never
    /// silently deleted, so the evidence stays available for operators.
    #[error("corrupt replica {id}: {detail}")]
    CorruptReplica { id: String, detail: String },

    /// The namespace authority did not answer in time.
    #[error("namespace timeout: {0}")]
    NamespaceTimeout(String),

    /// The namespace authority failed with an error other than
    /// not-found/timeout.
    #[error("namespace unavailable: {0}")]
    NamespaceUnavailable(String),

    /// Programming error: negative/overflowing sizes, invalid expiry,
    /// shrinking total space below used space, unknown consumer keys.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The replica is mid-transfer and cannot be opened yet.
    #[error("replica is busy: {0}")]
    Busy(String),

    /// The repository or store has been shut down.
    #[error("closed: {0}")]
    Closed(String),

    /// A persisted metadata record could not be decoded.
    #[error("metadata error: {0}")]
    Metadata(String),
}

/// Result alias using `PoolError`.
pub type Result<T> = std::result::Result<T, PoolError>;
