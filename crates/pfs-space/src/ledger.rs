//! Pool space ledger with blocking broadcast-wakeup allocation.

use crate::Allocator;
use parking_lot::{Condvar, Mutex};
use pfs_error::{PoolError, Result};
use tracing::warn;

#[derive(Debug, Clone, Copy, Default)]
struct LedgerState {
    total: u64,
    used: u64,
    precious: u64,
    removable: u64,
    requested: u64,
    last_lru: i64,
}

impl LedgerState {
    fn free(&self) -> u64 {
        self.total - self.used
    }
}

/// Point-in-time copy of the ledger counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerSnapshot {
    pub total: u64,
    pub used: u64,
    pub free: u64,
    pub precious: u64,
    pub removable: u64,
    pub requested: u64,
    /// Epoch millis of the least-recently-used still-cached replica,
    /// or 0 when unknown.
    pub last_lru: i64,
}

/// The single source of truth for a pool's space accounting.
///
/// All operations are atomic with respect to each other; `used <= total`
/// holds after every mutation. [`SpaceLedger::allocate`] is the only
/// blocking operation: it registers the request in the `requested`
/// counter, waits for space with broadcast wakeups, and always
/// deregisters on exit.
///
/// Wakeups are broadcast to every waiter, so whichever waiter is
/// scheduled first wins the freed space regardless of request size or
/// arrival order. A large request can therefore be starved indefinitely
/// by sustained small-request traffic. [`crate::FairAllocator`] is the
/// strategy to reach for when that matters.
#[derive(Debug)]
pub struct SpaceLedger {
    state: Mutex<LedgerState>,
    changed: Condvar,
}

impl SpaceLedger {
    #[must_use]
    pub fn new(total: u64) -> Self {
        Self {
            state: Mutex::new(LedgerState {
                total,
                ..LedgerState::default()
            }),
            changed: Condvar::new(),
        }
    }

    #[must_use]
    pub fn total(&self) -> u64 {
        self.state.lock().total
    }

    #[must_use]
    pub fn used(&self) -> u64 {
        self.state.lock().used
    }

    #[must_use]
    pub fn free_space(&self) -> u64 {
        self.state.lock().free()
    }

    #[must_use]
    pub fn precious(&self) -> u64 {
        self.state.lock().precious
    }

    #[must_use]
    pub fn removable(&self) -> u64 {
        self.state.lock().removable
    }

    #[must_use]
    pub fn requested(&self) -> u64 {
        self.state.lock().requested
    }

    /// Resize the pool. Fails if the new total is below the space already
    /// in use; wakes all waiters otherwise.
    pub fn set_total(&self, total: u64) -> Result<()> {
        let mut state = self.state.lock();
        if total < state.used {
            return Err(PoolError::InvalidArgument(format!(
                "cannot shrink total to {total}: {} bytes in use",
                state.used
            )));
        }
        state.total = total;
        drop(state);
        self.changed.notify_all();
        Ok(())
    }

    /// Release `size` bytes unconditionally. Waiters re-check against the
    /// post-release state once scheduled.
    pub fn free_now(&self, size: u64) -> Result<()> {
        let mut state = self.state.lock();
        if size > state.used {
            return Err(PoolError::InvalidArgument(format!(
                "cannot free {size}: only {} bytes in use",
                state.used
            )));
        }
        state.used -= size;
        drop(state);
        self.changed.notify_all();
        Ok(())
    }

    /// Reserve `size` bytes iff they are free right now.
    #[must_use]
    pub fn try_allocate(&self, size: u64) -> bool {
        let mut state = self.state.lock();
        if size <= state.free() {
            state.used += size;
            true
        } else {
            false
        }
    }

    /// Reserve `size` bytes, blocking until the pool can satisfy the
    /// request.
    ///
    /// The request is visible in [`SpaceLedger::requested`] for as long
    /// as the call is pending and is deregistered on every exit path.
    pub fn allocate(&self, size: u64) -> Result<()> {
        let mut state = self.state.lock();
        state.requested = state.requested.checked_add(size).ok_or_else(|| {
            PoolError::InvalidArgument(format!("requested-space counter overflow adding {size}"))
        })?;

        while size > state.free() {
            self.changed.notify_all();
            self.changed.wait(&mut state);
        }
        state.used += size;
        state.requested -= size;
        Ok(())
    }

    /// Signed adjustment of the removable-space category. Does not change
    /// `used`.
    pub fn adjust_removable(&self, delta: i64) {
        let mut state = self.state.lock();
        state.removable = apply_delta("removable", state.removable, delta);
    }

    /// Signed adjustment of the precious-space category. Does not change
    /// `used`.
    pub fn adjust_precious(&self, delta: i64) {
        let mut state = self.state.lock();
        state.precious = apply_delta("precious", state.precious, delta);
    }

    /// Record the access time of the least-recently-used still-cached
    /// replica. Wakes waiters when the value changes.
    pub fn set_lru(&self, timestamp: i64) {
        let mut state = self.state.lock();
        if state.last_lru != timestamp {
            state.last_lru = timestamp;
            drop(state);
            self.changed.notify_all();
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> LedgerSnapshot {
        let state = self.state.lock();
        LedgerSnapshot {
            total: state.total,
            used: state.used,
            free: state.free(),
            precious: state.precious,
            removable: state.removable,
            requested: state.requested,
            last_lru: state.last_lru,
        }
    }
}

impl Allocator for SpaceLedger {
    fn allocate(&self, size: u64) -> Result<()> {
        SpaceLedger::allocate(self, size)
    }

    fn free(&self, size: u64) -> Result<()> {
        self.free_now(size)
    }
}

fn apply_delta(category: &str, current: u64, delta: i64) -> u64 {
    let next = if delta >= 0 {
        current.checked_add(delta.unsigned_abs())
    } else {
        current.checked_sub(delta.unsigned_abs())
    };
    next.unwrap_or_else(|| {
        warn!(category, current, delta, "space category adjustment out of range; clamping");
        if delta >= 0 { u64::MAX } else { 0 }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::sync::{Arc, Barrier};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn free_tracks_total_minus_used_through_mixed_operations() {
        let ledger = SpaceLedger::new(100);
        assert!(ledger.try_allocate(40));
        assert_eq!(ledger.free_space(), 60);

        ledger.allocate(10).expect("allocate");
        assert_eq!(ledger.used(), 50);
        assert_eq!(ledger.free_space(), 50);

        ledger.free_now(30).expect("free");
        assert_eq!(ledger.used(), 20);
        assert_eq!(ledger.free_space(), ledger.total() - ledger.used());

        ledger.set_total(25).expect("shrink above used");
        assert_eq!(ledger.free_space(), 5);
        assert!(ledger.used() <= ledger.total());
    }

    #[test]
    fn set_total_below_used_is_rejected() {
        let ledger = SpaceLedger::new(100);
        assert!(ledger.try_allocate(60));
        let err = ledger.set_total(50).expect_err("must reject");
        assert!(matches!(err, PoolError::InvalidArgument(_)));
        assert_eq!(ledger.total(), 100);
    }

    #[test]
    fn free_more_than_used_is_rejected() {
        let ledger = SpaceLedger::new(100);
        assert!(ledger.try_allocate(10));
        let err = ledger.free_now(11).expect_err("must reject");
        assert!(matches!(err, PoolError::InvalidArgument(_)));
        assert_eq!(ledger.used(), 10);
    }

    #[test]
    fn concurrent_try_allocate_never_oversubscribes() {
        const THREADS: u64 = 8;
        const SLICE: u64 = 128;
        let ledger = Arc::new(SpaceLedger::new(THREADS * SLICE));
        let barrier = Arc::new(Barrier::new(THREADS as usize));

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let ledger = Arc::clone(&ledger);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    ledger.try_allocate(SLICE)
                })
            })
            .collect();

        let successes = handles
            .into_iter()
            .map(std::thread::JoinHandle::join)
            .filter(|r| matches!(r, Ok(true)))
            .count();
        assert_eq!(successes, THREADS as usize);
        assert!(!ledger.try_allocate(1));
        assert_eq!(ledger.free_space(), 0);
    }

    #[test]
    fn blocking_allocate_registers_and_deregisters_request() {
        let ledger = Arc::new(SpaceLedger::new(10));
        assert!(ledger.try_allocate(8));

        let waiter = {
            let ledger = Arc::clone(&ledger);
            thread::spawn(move || ledger.allocate(5))
        };

        // Wait until the request shows up in the requested counter.
        let mut spins = 0;
        while ledger.requested() != 5 {
            thread::sleep(Duration::from_millis(1));
            spins += 1;
            assert!(spins < 5000, "waiter never registered its request");
        }

        ledger.free_now(8).expect("free");
        waiter.join().expect("join").expect("allocate");
        assert_eq!(ledger.requested(), 0);
        assert_eq!(ledger.used(), 5);
    }

    /// Demonstrates (not prevents) the documented starvation property:
    /// a blocked large request makes no progress while smaller callers
    /// keep cycling the pool's free space below the large request's need.
    #[test]
    fn blocked_large_request_can_be_preempted_by_small_cycles() {
        let ledger = Arc::new(SpaceLedger::new(10));
        assert!(ledger.try_allocate(6));

        let (done_tx, done_rx) = mpsc::channel();
        let waiter = {
            let ledger = Arc::clone(&ledger);
            thread::spawn(move || {
                let result = ledger.allocate(5);
                done_tx.send(()).ok();
                result
            })
        };

        while ledger.requested() != 5 {
            thread::sleep(Duration::from_millis(1));
        }

        for _ in 0..50 {
            if ledger.try_allocate(4) {
                ledger.free_now(4).expect("free");
            }
            thread::sleep(Duration::from_millis(1));
        }
        assert!(
            done_rx.try_recv().is_err(),
            "large request proceeded although small cycles held the pool below its need"
        );

        ledger.free_now(6).expect("release");
        done_rx
            .recv_timeout(Duration::from_secs(10))
            .expect("large request served once space truly freed");
        waiter.join().expect("join").expect("allocate");
        assert_eq!(ledger.used(), 5);
    }

    #[test]
    fn category_adjustments_do_not_change_used() {
        let ledger = SpaceLedger::new(100);
        assert!(ledger.try_allocate(50));

        ledger.adjust_precious(30);
        ledger.adjust_removable(20);
        assert_eq!(ledger.precious(), 30);
        assert_eq!(ledger.removable(), 20);
        assert_eq!(ledger.used(), 50);

        ledger.adjust_precious(-30);
        ledger.adjust_removable(-25); // clamped at zero
        assert_eq!(ledger.precious(), 0);
        assert_eq!(ledger.removable(), 0);
    }

    #[test]
    fn snapshot_reflects_lru_timestamp() {
        let ledger = SpaceLedger::new(100);
        ledger.set_lru(12_345);
        let snap = ledger.snapshot();
        assert_eq!(snap.last_lru, 12_345);
        assert_eq!(snap.total, 100);
        assert_eq!(snap.free, 100);
    }
}
