#![forbid(unsafe_code)]
//! Space accounting and allocation strategies.
//!
//! Two allocation strategies share the [`Allocator`] seam:
//!
//! 1. [`SpaceLedger`]: the pool's bookkeeping of total/used/precious/
//!    removable/requested space with simple broadcast wait/notify
//!    allocation. Any waiter may win freed space; starvation of large
//!    requests under sustained small-request pressure is an accepted,
//!    documented property.
//! 2. [`FairAllocator`]: a per-consumer allocation table where each
//!    blocked call owns a private wait condition and freed space wakes
//!    the first registered waiter it can satisfy. Strictly fairer under
//!    uniform workloads, at the cost of per-waiter bookkeeping.
//!
//! Callers never lock either object externally; every operation is
//! atomic with respect to the others.

mod fair;
mod ledger;

pub use fair::{FairAllocator, FairHandle, SpaceRequestListener};
pub use ledger::{LedgerSnapshot, SpaceLedger};

use pfs_error::Result;

/// Allocation strategy seam.
///
/// Transfer handles reserve space through this trait so that the broadcast
/// ledger strategy and the fair per-waiter strategy can be substituted
/// without changing callers.
pub trait Allocator: Send + Sync {
    /// Reserve `size` bytes, blocking until the reservation is possible.
    fn allocate(&self, size: u64) -> Result<()>;

    /// Release `size` bytes previously reserved through this allocator.
    fn free(&self, size: u64) -> Result<()>;
}
