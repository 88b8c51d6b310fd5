//! Single-instance, single-flight metadata cache.

use crate::record::{CacheEntry, ReplicaRecord};
use crate::store::MetaDataStore;
use parking_lot::{Condvar, Mutex};
use pfs_error::{PoolError, Result};
use pfs_types::ReplicaId;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

struct CacheState {
    /// Ids known to the inner store but not read yet. Seeded once at
    /// construction.
    unread: HashSet<ReplicaId>,
    /// Records read so far. Holding the `Arc` here is what makes the
    /// instance canonical.
    cached: HashMap<ReplicaId, Arc<ReplicaRecord>>,
    /// Ids with a load or record-mutating operation in flight. Doubles
    /// as the per-id mutual exclusion for create/remove/close; it must
    /// not be reused for any other synchronization.
    loading: HashSet<ReplicaId>,
    closed: bool,
}

/// Caching decorator over a [`MetaDataStore`].
///
/// Guarantees:
/// 1. every caller observes the *same* [`ReplicaRecord`] instance for a
///    given id;
/// 2. the inner store's `get` runs at most once per id, no matter how
///    many callers race (single-flight; racing callers block until the
///    load completes);
/// 3. `create`, `remove`, and `close` never run concurrently with a load
///    (or each other) for the same id.
///
/// The inner store may be slow; loads run outside the cache lock, and
/// waiters are woken unconditionally when a load finishes, whether it
/// produced a record, an absence, or an error.
pub struct MetaDataCache {
    inner: Arc<dyn MetaDataStore>,
    state: Mutex<CacheState>,
    load_done: Condvar,
}

impl MetaDataCache {
    /// Wrap `inner`, seeding the id universe from its listing.
    pub fn new(inner: Arc<dyn MetaDataStore>) -> Result<Self> {
        let unread = inner.list()?.into_iter().collect();
        Ok(Self {
            inner,
            state: Mutex::new(CacheState {
                unread,
                cached: HashMap::new(),
                loading: HashSet::new(),
                closed: false,
            }),
            load_done: Condvar::new(),
        })
    }

    fn finish(&self, id: &ReplicaId) {
        let mut state = self.state.lock();
        state.loading.remove(id);
        drop(state);
        self.load_done.notify_all();
    }
}

impl MetaDataStore for MetaDataCache {
    fn list(&self) -> Result<Vec<ReplicaId>> {
        let state = self.state.lock();
        if state.closed {
            return Err(PoolError::Closed("metadata cache".into()));
        }
        let mut ids: Vec<_> = state
            .unread
            .iter()
            .chain(state.cached.keys())
            .copied()
            .collect();
        ids.sort_unstable();
        ids.dedup();
        Ok(ids)
    }

    fn get(&self, id: &ReplicaId) -> Result<Option<Arc<ReplicaRecord>>> {
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return Err(PoolError::Closed("metadata cache".into()));
            }
            if let Some(record) = state.cached.get(id) {
                return Ok(Some(record.clone()));
            }
            if state.loading.contains(id) {
                self.load_done.wait(&mut state);
                continue;
            }
            if !state.unread.contains(id) {
                return Ok(None);
            }
            break;
        }
        state.loading.insert(*id);
        drop(state);

        // The load runs without the cache lock; `finish` runs on every
        // exit so waiters never hang on a failed load.
        let result = self.inner.get(id);
        {
            let mut state = self.state.lock();
            match &result {
                Ok(Some(record)) => {
                    state.unread.remove(id);
                    state.cached.insert(*id, record.clone());
                }
                Ok(None) => {
                    state.unread.remove(id);
                }
                // A failed load leaves the id unread; a later call may
                // retry against a recovered store.
                Err(_) => {}
            }
        }
        self.finish(id);
        result
    }

    fn create(&self, id: &ReplicaId) -> Result<Arc<ReplicaRecord>> {
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return Err(PoolError::Closed("metadata cache".into()));
            }
            if !state.loading.contains(id) {
                break;
            }
            self.load_done.wait(&mut state);
        }
        if state.cached.contains_key(id) || state.unread.contains(id) {
            return Err(PoolError::DuplicateEntry(id.to_string()));
        }
        state.loading.insert(*id);
        drop(state);

        let result = self.inner.create(id);
        if let Ok(record) = &result {
            self.state.lock().cached.insert(*id, record.clone());
        }
        self.finish(id);
        result
    }

    fn create_from(&self, entry: &CacheEntry) -> Result<Arc<ReplicaRecord>> {
        let id = entry.id;
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return Err(PoolError::Closed("metadata cache".into()));
            }
            if !state.loading.contains(&id) {
                break;
            }
            self.load_done.wait(&mut state);
        }
        if state.cached.contains_key(&id) || state.unread.contains(&id) {
            return Err(PoolError::DuplicateEntry(id.to_string()));
        }
        state.loading.insert(id);
        drop(state);

        let result = self.inner.create_from(entry);
        if let Ok(record) = &result {
            self.state.lock().cached.insert(id, record.clone());
        }
        self.finish(&id);
        result
    }

    fn remove(&self, id: &ReplicaId) -> Result<()> {
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return Err(PoolError::Closed("metadata cache".into()));
            }
            if !state.loading.contains(id) {
                break;
            }
            self.load_done.wait(&mut state);
        }
        state.loading.insert(*id);
        drop(state);

        let result = self.inner.remove(id);
        if result.is_ok() {
            let mut state = self.state.lock();
            state.cached.remove(id);
            state.unread.remove(id);
        }
        self.finish(id);
        result
    }

    fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        while !state.loading.is_empty() {
            self.load_done.wait(&mut state);
        }
        state.cached.clear();
        state.unread.clear();
        drop(state);
        self.inner.close();
    }
}

impl std::fmt::Debug for MetaDataCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MetaDataCache")
            .field("unread", &state.unread.len())
            .field("cached", &state.cached.len())
            .field("loading", &state.loading.len())
            .field("closed", &state.closed)
            .finish()
    }
}
