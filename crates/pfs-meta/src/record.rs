//! The canonical in-memory replica record.

use crate::events::{EntryChangeEvent, EventBroadcaster, StateChangeEvent, StickyChangeEvent};
use parking_lot::Mutex;
use pfs_error::{PoolError, Result};
use pfs_types::{EntryState, ReplicaId, StickyRecord, StorageInfo, STICKY_FOREVER};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Persisted fields of one replica record.
///
/// This is the round-trip schema: whatever a store writes must decode
/// back into an identical `RecordData`. `link_count` is runtime-only
/// (open descriptors) and deliberately not persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordData {
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_info: Option<StorageInfo>,
    pub state: EntryState,
    #[serde(default)]
    pub sticky: Vec<StickyRecord>,
    #[serde(skip)]
    pub link_count: u32,
    pub created_at: i64,
    pub last_accessed_at: i64,
}

impl RecordData {
    /// Fresh record for a replica first seen at `now` (epoch millis).
    #[must_use]
    pub fn new(now: i64) -> Self {
        Self {
            size: 0,
            storage_info: None,
            state: EntryState::New,
            sticky: Vec::new(),
            link_count: 0,
            created_at: now,
            last_accessed_at: now,
        }
    }
}

/// Write-back seam a record uses to persist its own mutations.
pub trait RecordPersister: Send + Sync {
    fn persist(&self, id: &ReplicaId, data: &RecordData) -> Result<()>;
}

/// Persister that keeps records in memory only.
#[derive(Debug, Default)]
pub struct NoopPersister;

impl RecordPersister for NoopPersister {
    fn persist(&self, _id: &ReplicaId, _data: &RecordData) -> Result<()> {
        Ok(())
    }
}

/// Immutable snapshot of a replica record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheEntry {
    pub id: ReplicaId,
    pub size: u64,
    pub state: EntryState,
    pub storage_info: Option<StorageInfo>,
    pub sticky: Vec<StickyRecord>,
    pub link_count: u32,
    pub created_at: i64,
    pub last_accessed_at: i64,
}

impl CacheEntry {
    /// Whether any pin is in force at time `now`.
    #[must_use]
    pub fn is_sticky_at(&self, now: i64) -> bool {
        self.sticky.iter().any(|record| record.is_valid_at(now))
    }
}

/// The process-wide canonical record for one replica.
///
/// Exactly one instance exists per identifier (guaranteed by
/// [`crate::MetaDataCache`]). Mutation goes through the methods below,
/// which hold the record's own lock, persist through the owning store,
/// and then notify listeners. Listeners are invoked after the lock is
/// released and must not mutate the record they were notified about.
pub struct ReplicaRecord {
    id: ReplicaId,
    inner: Mutex<RecordData>,
    persister: Arc<dyn RecordPersister>,
    events: Arc<EventBroadcaster>,
}

impl ReplicaRecord {
    #[must_use]
    pub fn new(
        id: ReplicaId,
        data: RecordData,
        persister: Arc<dyn RecordPersister>,
        events: Arc<EventBroadcaster>,
    ) -> Self {
        Self {
            id,
            inner: Mutex::new(data),
            persister,
            events,
        }
    }

    #[must_use]
    pub fn id(&self) -> ReplicaId {
        self.id
    }

    #[must_use]
    pub fn state(&self) -> EntryState {
        self.inner.lock().state
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.inner.lock().size
    }

    #[must_use]
    pub fn snapshot(&self) -> CacheEntry {
        let data = self.inner.lock();
        Self::entry_of(self.id, &data)
    }

    /// Move the record to `state`, persist, and notify listeners.
    ///
    /// Setting the current state again is a no-op. This method performs
    /// no legality checking; the repository facade owns the transition
    /// table.
    pub fn set_state(&self, state: EntryState) -> Result<()> {
        let (old, new) = {
            let mut data = self.inner.lock();
            if data.state == state {
                return Ok(());
            }
            let old = Self::entry_of(self.id, &data);
            data.state = state;
            // A destroyed record's backing document is already gone;
            // persisting would resurrect it.
            if state != EntryState::Destroyed {
                self.persister.persist(&self.id, &data)?;
            }
            (old, Self::entry_of(self.id, &data))
        };
        self.events.state_changed(&StateChangeEvent { old, new });
        Ok(())
    }

    /// Set the authoritative local size. No event; space accounting is
    /// the allocator's business.
    pub fn set_size(&self, size: u64) -> Result<()> {
        let mut data = self.inner.lock();
        if data.size == size {
            return Ok(());
        }
        data.size = size;
        self.persister.persist(&self.id, &data)
    }

    /// Replace the cached namespace descriptor.
    pub fn set_storage_info(&self, info: StorageInfo) -> Result<()> {
        let mut data = self.inner.lock();
        if data.storage_info.as_ref() == Some(&info) {
            return Ok(());
        }
        data.storage_info = Some(info);
        self.persister.persist(&self.id, &data)
    }

    /// Record an access at `now` and notify listeners.
    pub fn touch(&self, now: i64) -> Result<()> {
        let entry = {
            let mut data = self.inner.lock();
            data.last_accessed_at = now;
            self.persister.persist(&self.id, &data)?;
            Self::entry_of(self.id, &data)
        };
        self.events.access_time_changed(&EntryChangeEvent { entry });
        Ok(())
    }

    /// Add, extend, or clear the pin owned by `owner`.
    ///
    /// Without `overwrite`, an existing pin is only ever extended, never
    /// shortened. An already-expired `expire_at` clears the owner's pin.
    /// Returns whether anything changed.
    pub fn set_sticky(
        &self,
        owner: &str,
        expire_at: i64,
        overwrite: bool,
        now: i64,
    ) -> Result<bool> {
        if expire_at < STICKY_FOREVER {
            return Err(PoolError::InvalidArgument(format!(
                "sticky expiration must be -1 or non-negative, got {expire_at}"
            )));
        }

        let entry = {
            let mut data = self.inner.lock();
            if !apply_sticky(&mut data.sticky, owner, expire_at, overwrite, now) {
                return Ok(false);
            }
            self.persister.persist(&self.id, &data)?;
            Self::entry_of(self.id, &data)
        };
        self.events.sticky_changed(&StickyChangeEvent { entry });
        Ok(true)
    }

    /// Drop every pin that has expired by `now`, returning the removed
    /// records.
    pub fn remove_expired_sticky(&self, now: i64) -> Result<Vec<StickyRecord>> {
        let (removed, entry) = {
            let mut data = self.inner.lock();
            let (keep, removed): (Vec<_>, Vec<_>) = data
                .sticky
                .drain(..)
                .partition(|record| record.is_valid_at(now));
            data.sticky = keep;
            if removed.is_empty() {
                return Ok(removed);
            }
            self.persister.persist(&self.id, &data)?;
            (removed, Self::entry_of(self.id, &data))
        };
        self.events.sticky_changed(&StickyChangeEvent { entry });
        Ok(removed)
    }

    /// Increment the open-descriptor count.
    pub fn inc_link(&self) -> u32 {
        let mut data = self.inner.lock();
        data.link_count += 1;
        data.link_count
    }

    /// Decrement the open-descriptor count, saturating at zero.
    pub fn dec_link(&self) -> u32 {
        let mut data = self.inner.lock();
        data.link_count = data.link_count.saturating_sub(1);
        data.link_count
    }

    #[must_use]
    pub fn link_count(&self) -> u32 {
        self.inner.lock().link_count
    }

    fn entry_of(id: ReplicaId, data: &RecordData) -> CacheEntry {
        CacheEntry {
            id,
            size: data.size,
            state: data.state,
            storage_info: data.storage_info.clone(),
            sticky: data.sticky.clone(),
            link_count: data.link_count,
            created_at: data.created_at,
            last_accessed_at: data.last_accessed_at,
        }
    }
}

impl std::fmt::Debug for ReplicaRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let data = self.inner.lock();
        f.debug_struct("ReplicaRecord")
            .field("id", &self.id)
            .field("state", &data.state)
            .field("size", &data.size)
            .field("sticky", &data.sticky.len())
            .finish()
    }
}

fn apply_sticky(
    records: &mut Vec<StickyRecord>,
    owner: &str,
    expire_at: i64,
    overwrite: bool,
    now: i64,
) -> bool {
    let still_valid = expire_at == STICKY_FOREVER || expire_at > now;
    match records.iter().position(|record| record.owner == owner) {
        Some(index) => {
            let current = records[index].expire_at;
            let extends = current != STICKY_FOREVER
                && (expire_at == STICKY_FOREVER || expire_at > current);
            if !overwrite && !extends {
                return false;
            }
            if current == expire_at {
                return false;
            }
            if still_valid {
                records[index] = StickyRecord::new(owner, expire_at);
            } else {
                records.remove(index);
            }
            true
        }
        None => {
            if still_valid {
                records.push(StickyRecord::new(owner, expire_at));
                true
            } else {
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> ReplicaRecord {
        let id = ReplicaId::from_bytes([1; 12]);
        ReplicaRecord::new(
            id,
            RecordData::new(100),
            Arc::new(NoopPersister),
            Arc::new(EventBroadcaster::new()),
        )
    }

    #[test]
    fn snapshot_reflects_mutations() {
        let rec = record();
        rec.set_size(42).expect("size");
        rec.set_state(EntryState::Cached).expect("state");
        rec.touch(500).expect("touch");

        let entry = rec.snapshot();
        assert_eq!(entry.size, 42);
        assert_eq!(entry.state, EntryState::Cached);
        assert_eq!(entry.last_accessed_at, 500);
        assert_eq!(entry.created_at, 100);
    }

    #[test]
    fn set_state_to_same_state_is_a_no_op() {
        let rec = record();
        rec.set_state(EntryState::Cached).expect("first");
        rec.set_state(EntryState::Cached).expect("second");
        assert_eq!(rec.state(), EntryState::Cached);
    }

    #[test]
    fn sticky_extends_but_never_shortens_without_overwrite() {
        let rec = record();
        assert!(rec.set_sticky("system", 1_000, false, 0).expect("add"));
        assert!(!rec.set_sticky("system", 500, false, 0).expect("shorten refused"));
        assert!(rec.set_sticky("system", 2_000, false, 0).expect("extend"));
        assert!(rec
            .set_sticky("system", STICKY_FOREVER, false, 0)
            .expect("extend to forever"));
        assert!(!rec.set_sticky("system", 9_999, false, 0).expect("forever wins"));

        assert!(rec.set_sticky("system", 500, true, 0).expect("overwrite shortens"));
        let entry = rec.snapshot();
        assert_eq!(entry.sticky, vec![StickyRecord::new("system", 500)]);
    }

    #[test]
    fn sticky_with_past_expiry_clears_the_pin() {
        let rec = record();
        assert!(rec.set_sticky("ops", 1_000, false, 0).expect("add"));
        assert!(rec.set_sticky("ops", 10, true, 500).expect("clear via past expiry"));
        assert!(rec.snapshot().sticky.is_empty());

        // Setting an already-expired pin on a clean record changes nothing.
        assert!(!rec.set_sticky("ops", 10, true, 500).expect("no-op"));
    }

    #[test]
    fn sticky_rejects_expiry_below_forever() {
        let rec = record();
        let err = rec.set_sticky("ops", -2, false, 0).expect_err("reject");
        assert!(matches!(err, PoolError::InvalidArgument(_)));
    }

    #[test]
    fn expired_pins_are_swept() {
        let rec = record();
        rec.set_sticky("a", 100, false, 0).expect("a");
        rec.set_sticky("b", STICKY_FOREVER, false, 0).expect("b");
        rec.set_sticky("c", 300, false, 0).expect("c");

        let removed = rec.remove_expired_sticky(200).expect("sweep");
        assert_eq!(removed, vec![StickyRecord::new("a", 100)]);
        let entry = rec.snapshot();
        assert_eq!(entry.sticky.len(), 2);
        assert!(entry.is_sticky_at(200));
    }

    #[test]
    fn link_count_tracks_open_descriptors() {
        let rec = record();
        assert_eq!(rec.inc_link(), 1);
        assert_eq!(rec.inc_link(), 2);
        assert_eq!(rec.dec_link(), 1);
        assert_eq!(rec.dec_link(), 0);
        assert_eq!(rec.dec_link(), 0);
    }

    #[test]
    fn record_data_round_trips_as_json() {
        let mut data = RecordData::new(7);
        data.size = 1024;
        data.state = EntryState::Precious;
        data.sticky.push(StickyRecord::forever("system"));
        data.link_count = 3; // not persisted

        let json = serde_json::to_string(&data).expect("serialize");
        let back: RecordData = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back.size, data.size);
        assert_eq!(back.state, data.state);
        assert_eq!(back.sticky, data.sticky);
        assert_eq!(back.link_count, 0);
    }
}
