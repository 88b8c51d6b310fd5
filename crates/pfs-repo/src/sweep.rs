//! Eviction ordering and the removability policy.

use pfs_error::Result;
use pfs_meta::CacheEntry;
use pfs_types::{EntryState, ReplicaId};
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// Policy deciding which replicas may be garbage collected.
pub trait SpaceSweeperPolicy: Send + Sync {
    /// Whether `entry` may be evicted at time `now`.
    fn is_removable(&self, entry: &CacheEntry, now: i64) -> Result<bool>;
}

/// Default policy: a replica is removable iff it is resident as `Cached`
/// (so not precious and not mid-transfer) and carries no valid pin.
#[derive(Debug, Default)]
pub struct LruSweeper;

impl SpaceSweeperPolicy for LruSweeper {
    fn is_removable(&self, entry: &CacheEntry, now: i64) -> Result<bool> {
        Ok(entry.state == EntryState::Cached && !entry.is_sticky_at(now))
    }
}

/// Total order over replicas used to select eviction victims.
///
/// Removable replicas sort before non-removable ones, then least recently
/// used first, with the identifier as the deterministic tie-break.
/// Removability is asked of the policy fresh for every comparison; a
/// policy failure counts as "not removable".
pub struct EvictionOrder {
    policy: Arc<dyn SpaceSweeperPolicy>,
}

impl EvictionOrder {
    #[must_use]
    pub fn new(policy: Arc<dyn SpaceSweeperPolicy>) -> Self {
        Self { policy }
    }

    #[must_use]
    pub fn compare(&self, a: &CacheEntry, b: &CacheEntry, now: i64) -> Ordering {
        let a_removable = self.policy.is_removable(a, now).unwrap_or(false);
        let b_removable = self.policy.is_removable(b, now).unwrap_or(false);
        (!a_removable)
            .cmp(&!b_removable)
            .then_with(|| a.last_accessed_at.cmp(&b.last_accessed_at))
            .then_with(|| a.id.cmp(&b.id))
    }

    pub fn sort(&self, entries: &mut [CacheEntry], now: i64) {
        entries.sort_by(|a, b| self.compare(a, b, now));
    }
}

/// Index of currently-removable replicas ordered by access time, backing
/// the ledger's removable-space counter and LRU timestamp.
#[derive(Debug, Default)]
pub struct RemovableSet {
    by_age: BTreeSet<(i64, ReplicaId)>,
    index: HashMap<ReplicaId, (i64, u64)>,
}

impl RemovableSet {
    /// Track `id` as removable. Returns `true` if the id was not tracked
    /// before; a re-insert only refreshes the access time.
    pub fn insert(&mut self, id: ReplicaId, last_accessed_at: i64, size: u64) -> bool {
        match self.index.insert(id, (last_accessed_at, size)) {
            None => {
                self.by_age.insert((last_accessed_at, id));
                true
            }
            Some((previous_atime, _)) => {
                self.by_age.remove(&(previous_atime, id));
                self.by_age.insert((last_accessed_at, id));
                false
            }
        }
    }

    /// Stop tracking `id`, returning its size if it was tracked.
    pub fn remove(&mut self, id: &ReplicaId) -> Option<u64> {
        let (atime, size) = self.index.remove(id)?;
        self.by_age.remove(&(atime, *id));
        Some(size)
    }

    /// Access time of the least-recently-used removable replica.
    #[must_use]
    pub fn oldest_atime(&self) -> Option<i64> {
        self.by_age.iter().next().map(|(atime, _)| *atime)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.index.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pfs_types::StickyRecord;

    fn entry(n: u8, state: EntryState, atime: i64) -> CacheEntry {
        let mut bytes = [0_u8; pfs_types::REPLICA_ID_BYTES];
        bytes[11] = n;
        CacheEntry {
            id: ReplicaId::from_bytes(bytes),
            size: 100,
            state,
            storage_info: None,
            sticky: Vec::new(),
            link_count: 0,
            created_at: 0,
            last_accessed_at: atime,
        }
    }

    #[test]
    fn removable_before_non_removable_then_lru_then_id() {
        let order = EvictionOrder::new(Arc::new(LruSweeper));
        let a = entry(1, EntryState::Cached, 1);
        let b = entry(2, EntryState::Precious, 0);
        let c = entry(3, EntryState::Cached, 2);

        let mut entries = vec![b.clone(), c.clone(), a.clone()];
        order.sort(&mut entries, 10);
        let ids: Vec<_> = entries.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![a.id, c.id, b.id]);

        // Stable under repeated sorts.
        order.sort(&mut entries, 10);
        let again: Vec<_> = entries.iter().map(|e| e.id).collect();
        assert_eq!(again, ids);
    }

    #[test]
    fn id_breaks_access_time_ties() {
        let order = EvictionOrder::new(Arc::new(LruSweeper));
        let first = entry(1, EntryState::Cached, 5);
        let second = entry(2, EntryState::Cached, 5);
        assert_eq!(order.compare(&first, &second, 10), Ordering::Less);
        assert_eq!(order.compare(&second, &first, 10), Ordering::Greater);
        assert_eq!(order.compare(&first, &first, 10), Ordering::Equal);
    }

    #[test]
    fn sticky_entries_are_not_removable() {
        let sweeper = LruSweeper;
        let mut pinned = entry(1, EntryState::Cached, 0);
        pinned.sticky.push(StickyRecord::new("system", 100));

        assert!(!sweeper.is_removable(&pinned, 50).expect("policy"));
        assert!(sweeper.is_removable(&pinned, 100).expect("policy"), "expired pin no longer protects");
    }

    #[test]
    fn transfer_and_broken_states_are_not_removable() {
        let sweeper = LruSweeper;
        for state in [
            EntryState::New,
            EntryState::FromClient,
            EntryState::FromStore,
            EntryState::FromPool,
            EntryState::Precious,
            EntryState::Broken,
            EntryState::Removed,
            EntryState::Destroyed,
        ] {
            assert!(!sweeper.is_removable(&entry(1, state, 0), 10).expect("policy"));
        }
        assert!(sweeper
            .is_removable(&entry(1, EntryState::Cached, 0), 10)
            .expect("policy"));
    }

    #[test]
    fn policy_failure_counts_as_not_removable() {
        struct FailingPolicy;
        impl SpaceSweeperPolicy for FailingPolicy {
            fn is_removable(&self, _entry: &CacheEntry, _now: i64) -> Result<bool> {
                Err(pfs_error::PoolError::NamespaceUnavailable("probe failed".into()))
            }
        }

        let order = EvictionOrder::new(Arc::new(FailingPolicy));
        let a = entry(1, EntryState::Cached, 0);
        let b = entry(2, EntryState::Cached, 1);
        // Neither is removable; LRU and id still give a total order.
        assert_eq!(order.compare(&a, &b, 10), Ordering::Less);
    }

    #[test]
    fn removable_set_tracks_oldest_and_sizes() {
        let mut set = RemovableSet::default();
        let a = entry(1, EntryState::Cached, 30);
        let b = entry(2, EntryState::Cached, 10);

        assert!(set.insert(a.id, a.last_accessed_at, a.size));
        assert!(set.insert(b.id, b.last_accessed_at, b.size));
        assert_eq!(set.oldest_atime(), Some(10));
        assert_eq!(set.len(), 2);

        // Refreshing the access time reorders without double-counting.
        assert!(!set.insert(b.id, 50, b.size));
        assert_eq!(set.oldest_atime(), Some(30));

        assert_eq!(set.remove(&a.id), Some(100));
        assert_eq!(set.remove(&a.id), None);
        assert_eq!(set.oldest_atime(), Some(50));
    }
}
