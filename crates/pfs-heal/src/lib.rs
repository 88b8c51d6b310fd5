#![forbid(unsafe_code)]
//! Consistency reconciliation for the poolfs replica repository.
//!
//! Three independent sources of truth can disagree after a crash: the
//! bytes on disk, the local metadata, and the external namespace. The
//! [`ConsistentStore`] decorator detects the disagreement on every load
//! and repairs it: reconstructing missing records, completing
//! interrupted uploads, dropping replicas the namespace no longer knows,
//! and quarantining anything irreconcilable as broken.

mod checksum;
mod consistent;
mod namespace;
mod policy;

pub use checksum::{Blake3ChecksumModule, ChecksumModule};
pub use consistent::ConsistentStore;
pub use namespace::{AttributeUpdate, NamespaceClient, NamespaceOutcome};
pub use policy::{DefaultStatePolicy, ReplicaStatePolicy};
