//! Per-consumer allocation table with ordered, per-waiter wakeup.

use crate::Allocator;
use parking_lot::{Condvar, Mutex, RwLock};
use pfs_error::{PoolError, Result};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Callback invoked when an allocation cannot be satisfied immediately.
///
/// Listeners are told the shortfall so they can reclaim space proactively
/// (typically by triggering eviction) before the caller starts waiting.
pub trait SpaceRequestListener: Send + Sync {
    fn space_requested(&self, shortfall: u64);
}

/// One blocked allocation. Each waiter owns a private condition variable
/// that is only ever signalled when its own request would fit.
struct Waiter {
    size: u64,
    granted: AtomicBool,
    fits: Condvar,
}

impl Waiter {
    fn new(size: u64) -> Self {
        Self {
            size,
            granted: AtomicBool::new(false),
            fits: Condvar::new(),
        }
    }
}

struct FairState {
    total: u64,
    used: u64,
    allocations: HashMap<String, u64>,
    waiters: VecDeque<Arc<Waiter>>,
}

impl FairState {
    fn free(&self) -> u64 {
        self.total - self.used
    }

    /// Scan waiters in FIFO registration order and grant every request
    /// that fits the space still free after earlier grants in this pass.
    /// Space is committed at grant time so a woken waiter cannot lose it
    /// to a faster caller.
    fn grant_fitting_waiters(&mut self) {
        let mut index = 0;
        while index < self.waiters.len() {
            if self.waiters[index].size <= self.free() {
                if let Some(waiter) = self.waiters.remove(index) {
                    self.used += waiter.size;
                    waiter.granted.store(true, Ordering::Relaxed);
                    waiter.fits.notify_one();
                }
            } else {
                index += 1;
            }
        }
    }

    fn drop_waiter(&mut self, target: &Arc<Waiter>) {
        self.waiters.retain(|w| !Arc::ptr_eq(w, target));
    }
}

/// Keyed allocation table with FIFO-suitability wakeup.
///
/// Every consumer (keyed by an opaque string) accumulates an allocation;
/// blocked callers are queued in registration order and freed space wakes
/// the first queued waiter whose request now fits. This approximates
/// first-come-first-served without letting an oversized request at the
/// head block smaller requests behind it.
pub struct FairAllocator {
    state: Mutex<FairState>,
    listeners: RwLock<Vec<Arc<dyn SpaceRequestListener>>>,
}

impl FairAllocator {
    #[must_use]
    pub fn new(total: u64) -> Self {
        Self {
            state: Mutex::new(FairState {
                total,
                used: 0,
                allocations: HashMap::new(),
                waiters: VecDeque::new(),
            }),
            listeners: RwLock::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn total_space(&self) -> u64 {
        self.state.lock().total
    }

    #[must_use]
    pub fn free_space(&self) -> u64 {
        self.state.lock().free()
    }

    #[must_use]
    pub fn used_space(&self) -> u64 {
        self.state.lock().used
    }

    /// Bytes currently allocated to `key`, if the consumer is known.
    #[must_use]
    pub fn allocation(&self, key: &str) -> Option<u64> {
        self.state.lock().allocations.get(key).copied()
    }

    /// Number of blocked allocation calls.
    #[must_use]
    pub fn pending_requests(&self) -> usize {
        self.state.lock().waiters.len()
    }

    pub fn add_space_request_listener(&self, listener: Arc<dyn SpaceRequestListener>) {
        self.listeners.write().push(listener);
    }

    pub fn remove_space_request_listener(&self, listener: &Arc<dyn SpaceRequestListener>) {
        self.listeners.write().retain(|l| !Arc::ptr_eq(l, listener));
    }

    /// Reserve `size` additional bytes for `key`.
    ///
    /// Allocations accumulate: a consumer that allocates twice holds the
    /// sum. When the request cannot be satisfied immediately, registered
    /// listeners are told the shortfall, then the call waits on its own
    /// condition until the request fits or `timeout` elapses. `None`
    /// waits forever; a zero timeout fails fast.
    pub fn allocate(&self, key: &str, size: u64, timeout: Option<Duration>) -> Result<()> {
        let mut state = self.state.lock();
        if size <= state.free() && state.waiters.is_empty() {
            state.used += size;
            Self::record(&mut state, key, size)?;
            return Ok(());
        }

        if timeout == Some(Duration::ZERO) {
            return Err(PoolError::ResourceUnavailable(format!(
                "requested {size} for {key}, free {}",
                state.free()
            )));
        }

        let waiter = Arc::new(Waiter::new(size));
        state.waiters.push_back(Arc::clone(&waiter));
        let shortfall = size.saturating_sub(state.free());
        drop(state);

        debug!(key, size, shortfall, "allocation blocked; requesting reclaim");
        self.notify_space_requested(shortfall);

        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock();
        // A free() may have granted us between dropping and re-taking
        // the lock; an explicit pass also covers space freed by the
        // listeners above.
        state.grant_fitting_waiters();
        loop {
            if waiter.granted.load(Ordering::Relaxed) {
                Self::record(&mut state, key, size)?;
                return Ok(());
            }
            match deadline {
                None => waiter.fits.wait(&mut state),
                Some(deadline) => {
                    if waiter.fits.wait_until(&mut state, deadline).timed_out() {
                        if waiter.granted.load(Ordering::Relaxed) {
                            Self::record(&mut state, key, size)?;
                            return Ok(());
                        }
                        state.drop_waiter(&waiter);
                        return Err(PoolError::ResourceUnavailable(format!(
                            "timed out waiting for {size} bytes for {key}"
                        )));
                    }
                }
            }
        }
    }

    /// Release the consumer's entire allocation.
    pub fn free(&self, key: &str) -> Result<()> {
        let mut state = self.state.lock();
        let Some(amount) = state.allocations.remove(key) else {
            return Err(PoolError::InvalidArgument(format!(
                "unknown allocation consumer: {key}"
            )));
        };
        state.used -= amount;
        state.grant_fitting_waiters();
        Ok(())
    }

    /// Release `size` of the consumer's allocation without dropping the
    /// consumer itself.
    pub fn release(&self, key: &str, size: u64) -> Result<()> {
        let mut state = self.state.lock();
        let Some(amount) = state.allocations.get_mut(key) else {
            return Err(PoolError::InvalidArgument(format!(
                "unknown allocation consumer: {key}"
            )));
        };
        if size > *amount {
            return Err(PoolError::InvalidArgument(format!(
                "cannot release {size} from {key}: holds {amount}"
            )));
        }
        *amount -= size;
        state.used -= size;
        state.grant_fitting_waiters();
        Ok(())
    }

    /// Reconcile the consumer's allocation to exactly `expected_size`,
    /// growing (blocking) or shrinking (immediate) as needed.
    pub fn reallocate(&self, key: &str, expected_size: u64) -> Result<()> {
        let current = {
            let state = self.state.lock();
            state.allocations.get(key).copied().unwrap_or(0)
        };
        if expected_size == current {
            Ok(())
        } else if expected_size > current {
            self.allocate(key, expected_size - current, None)
        } else {
            self.release(key, current - expected_size)
        }
    }

    /// Resize the allocator. Fails if the requested total is below the
    /// space currently allocated.
    pub fn set_total_space(&self, space: u64) -> Result<()> {
        let mut state = self.state.lock();
        if space < state.used {
            return Err(PoolError::ResourceUnavailable(format!(
                "cannot shrink total to {space}: {} bytes allocated",
                state.used
            )));
        }
        state.total = space;
        state.grant_fitting_waiters();
        Ok(())
    }

    /// [`Allocator`] adapter bound to one consumer key.
    #[must_use]
    pub fn handle(self: &Arc<Self>, key: impl Into<String>) -> FairHandle {
        FairHandle {
            allocator: Arc::clone(self),
            key: key.into(),
        }
    }

    fn record(state: &mut FairState, key: &str, size: u64) -> Result<()> {
        let slot = state.allocations.entry(key.to_owned()).or_insert(0);
        *slot = slot.checked_add(size).ok_or_else(|| {
            PoolError::InvalidArgument(format!("allocation counter overflow for {key}"))
        })?;
        Ok(())
    }

    fn notify_space_requested(&self, shortfall: u64) {
        let listeners: Vec<_> = self.listeners.read().iter().cloned().collect();
        for listener in listeners {
            listener.space_requested(shortfall);
        }
    }
}

impl std::fmt::Debug for FairAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("FairAllocator")
            .field("total", &state.total)
            .field("used", &state.used)
            .field("consumers", &state.allocations.len())
            .field("waiters", &state.waiters.len())
            .finish()
    }
}

/// [`Allocator`] strategy over a [`FairAllocator`], bound to one consumer
/// key. `allocate` waits forever (matching the ledger strategy's
/// contract); `free` releases part of this consumer's allocation.
#[derive(Clone)]
pub struct FairHandle {
    allocator: Arc<FairAllocator>,
    key: String,
}

impl Allocator for FairHandle {
    fn allocate(&self, size: u64) -> Result<()> {
        self.allocator.allocate(&self.key, size, None)
    }

    fn free(&self, size: u64) -> Result<()> {
        self.allocator.release(&self.key, size)
    }
}
