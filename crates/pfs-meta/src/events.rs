//! Change events and listener dispatch.

use crate::record::CacheEntry;
use parking_lot::RwLock;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::error;

/// A replica moved between lifecycle states.
#[derive(Debug, Clone)]
pub struct StateChangeEvent {
    pub old: CacheEntry,
    pub new: CacheEntry,
}

/// A replica's access time changed.
#[derive(Debug, Clone)]
pub struct EntryChangeEvent {
    pub entry: CacheEntry,
}

/// A replica's sticky records changed.
#[derive(Debug, Clone)]
pub struct StickyChangeEvent {
    pub entry: CacheEntry,
}

/// Observer of replica lifecycle changes.
///
/// Listeners are invoked synchronously on the mutating thread, after the
/// record's lock has been released. They must not call back into the
/// record that produced the event.
pub trait StateChangeListener: Send + Sync {
    fn state_changed(&self, event: &StateChangeEvent);

    fn access_time_changed(&self, _event: &EntryChangeEvent) {}

    fn sticky_changed(&self, _event: &StickyChangeEvent) {}
}

/// Routes lifecycle events to registered listeners in registration order.
///
/// Each invocation is isolated: a panicking listener is caught and
/// logged, and the remaining listeners are still notified.
#[derive(Default)]
pub struct EventBroadcaster {
    listeners: RwLock<Vec<Arc<dyn StateChangeListener>>>,
}

impl EventBroadcaster {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_listener(&self, listener: Arc<dyn StateChangeListener>) {
        self.listeners.write().push(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn StateChangeListener>) {
        self.listeners.write().retain(|l| !Arc::ptr_eq(l, listener));
    }

    pub fn state_changed(&self, event: &StateChangeEvent) {
        self.dispatch(|listener| listener.state_changed(event), "state change");
    }

    pub fn access_time_changed(&self, event: &EntryChangeEvent) {
        self.dispatch(|listener| listener.access_time_changed(event), "access time");
    }

    pub fn sticky_changed(&self, event: &StickyChangeEvent) {
        self.dispatch(|listener| listener.sticky_changed(event), "sticky change");
    }

    fn dispatch(&self, invoke: impl Fn(&Arc<dyn StateChangeListener>), kind: &str) {
        let listeners: Vec<_> = self.listeners.read().iter().cloned().collect();
        for listener in &listeners {
            if catch_unwind(AssertUnwindSafe(|| invoke(listener))).is_err() {
                error!(kind, "listener panicked during dispatch; continuing with remaining listeners");
            }
        }
    }
}

impl std::fmt::Debug for EventBroadcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBroadcaster")
            .field("listeners", &self.listeners.read().len())
            .finish()
    }
}
