#![forbid(unsafe_code)]
//! The repository facade of a poolfs storage-pool node.
//!
//! A [`Repository`] combines the store chain (file metadata →
//! reconciliation → single-flight cache), the space ledger, the eviction
//! policy, and the lifecycle state machine behind one thread-safe
//! object. There are no process-wide singletons: construct the object
//! graph once at startup with [`Repository::builder`] and pass the
//! handle to collaborators (it clones cheaply).
//!
//! Lifecycle: `build()` wires the store chain and accounting listener,
//! [`Repository::load`] scans the inventory (reconciling every replica
//! on the way) and opens the repository, [`Repository::close`] shuts the
//! chain down. `open_replica`, `get_entry`, `state_of`, and `set_sticky`
//! may be called while loading is still in progress; everything else
//! requires the open state.

mod handle;
mod sweep;

pub use handle::{OpenFlags, ReadDescriptor, WriteDescriptor};
pub use sweep::{EvictionOrder, LruSweeper, RemovableSet, SpaceSweeperPolicy};

use parking_lot::{Mutex, RwLock};
use pfs_error::{PoolError, Result};
use pfs_heal::{
    ChecksumModule, ConsistentStore, DefaultStatePolicy, NamespaceClient, NamespaceOutcome,
    ReplicaStatePolicy,
};
use pfs_meta::{
    CacheEntry, EntryChangeEvent, EventBroadcaster, MetaDataCache, MetaDataStore, ReplicaRecord,
    StateChangeEvent, StateChangeListener, StickyChangeEvent,
};
use pfs_space::{Allocator, SpaceLedger};
use pfs_store::BlobStore;
use pfs_types::{now_millis, EntryState, ReplicaId, SpaceRecord, StickyRecord};
use std::collections::HashSet;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Default always-removable gap reported to the pool manager: a quarter
/// of the pool, capped at 4 GiB.
pub const DEFAULT_GAP: u64 = 4 << 30;

/// Current state of the repository itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepoState {
    Initialized,
    Loading,
    Open,
    Failed,
    Closed,
}

impl fmt::Display for RepoState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Initialized => "initialized",
            Self::Loading => "loading",
            Self::Open => "open",
            Self::Failed => "failed",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// How the pool should react to an internal fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultAction {
    /// Stop accepting writes but keep serving reads.
    Readonly,
    /// Take the pool out of service.
    Disabled,
}

/// Internal repository fault pushed to fault listeners.
#[derive(Debug, Clone)]
pub struct FaultEvent {
    pub source: String,
    pub action: FaultAction,
    pub message: String,
}

pub trait FaultListener: Send + Sync {
    fn fault_occurred(&self, event: &FaultEvent);
}

// ── Accounting listener ─────────────────────────────────────────────────────

/// The repository's own event listener, registered before any external
/// listener so the ledger is updated first.
///
/// Precious accounting is idempotent per replica through a membership
/// set; removable accounting maintains the age-ordered index backing the
/// ledger's LRU timestamp; a transition to `Removed` clears the
/// namespace location; `Destroyed` gives the replica's bytes back to the
/// pool.
struct AccountingHook {
    ledger: Arc<SpaceLedger>,
    namespace: Arc<dyn NamespaceClient>,
    sweeper: Arc<dyn SpaceSweeperPolicy>,
    precious: Mutex<HashSet<ReplicaId>>,
    removable: Mutex<RemovableSet>,
}

fn signed(size: u64) -> i64 {
    i64::try_from(size).unwrap_or(i64::MAX)
}

impl AccountingHook {
    fn update_removable(&self, entry: &CacheEntry) {
        let now = now_millis();
        let removable = self.sweeper.is_removable(entry, now).unwrap_or(false);
        let mut set = self.removable.lock();
        if removable {
            if set.insert(entry.id, entry.last_accessed_at, entry.size) {
                self.ledger.adjust_removable(signed(entry.size));
            }
        } else if let Some(size) = set.remove(&entry.id) {
            self.ledger.adjust_removable(-signed(size));
        }
        self.ledger.set_lru(set.oldest_atime().unwrap_or(0));
    }

    fn update_precious(&self, old: &CacheEntry, new: &CacheEntry) {
        if new.state == EntryState::Precious {
            if self.precious.lock().insert(new.id) {
                self.ledger.adjust_precious(signed(new.size));
            }
        } else if self.precious.lock().remove(&new.id) {
            self.ledger.adjust_precious(-signed(old.size));
        }
    }

    /// Startup accounting for one scanned replica. A replica the ledger
    /// cannot absorb (pool oversubscribed) is logged and left
    /// unaccounted; the pool starts anyway.
    fn account_scanned(&self, entry: &CacheEntry) {
        if entry.state.is_terminal() || entry.state == EntryState::New {
            return;
        }
        if entry.size > 0 && !self.ledger.try_allocate(entry.size) {
            warn!(
                id = %entry.id,
                size = entry.size,
                "pool oversubscribed; replica not accounted as used space"
            );
        }
        if entry.state == EntryState::Precious && self.precious.lock().insert(entry.id) {
            self.ledger.adjust_precious(signed(entry.size));
        }
        self.update_removable(entry);
    }
}

impl StateChangeListener for AccountingHook {
    fn state_changed(&self, event: &StateChangeEvent) {
        self.update_precious(&event.old, &event.new);
        self.update_removable(&event.new);

        match event.new.state {
            EntryState::Removed => {
                if event.old.state != EntryState::New {
                    info!(id = %event.new.id, "removing replica");
                }
                match self.namespace.clear_location(&event.new.id) {
                    NamespaceOutcome::Found(()) | NamespaceOutcome::NotFound => {}
                    NamespaceOutcome::Timeout => {
                        warn!(id = %event.new.id, "timeout clearing namespace location");
                    }
                    NamespaceOutcome::Other(err) => {
                        warn!(id = %event.new.id, %err, "failed to clear namespace location");
                    }
                }
            }
            EntryState::Destroyed => {
                // Freed only after the data file is gone, the mirror
                // image of allocate-before-write.
                if event.old.size > 0 {
                    if let Err(err) = self.ledger.free_now(event.old.size) {
                        warn!(id = %event.new.id, %err, "destroy of unaccounted replica");
                    }
                }
            }
            _ => {}
        }
    }

    fn access_time_changed(&self, event: &EntryChangeEvent) {
        self.update_removable(&event.entry);
    }

    fn sticky_changed(&self, event: &StickyChangeEvent) {
        self.update_removable(&event.entry);
    }
}

// ── Builder ─────────────────────────────────────────────────────────────────

/// Assembles a [`Repository`] object graph.
///
/// The event broadcaster must be the same instance the metadata store
/// was constructed with, so that record mutations reach the repository's
/// accounting listener.
pub struct RepositoryBuilder {
    events: Option<Arc<EventBroadcaster>>,
    meta: Option<Arc<dyn MetaDataStore>>,
    import: Option<Arc<dyn MetaDataStore>>,
    blob: Option<Arc<dyn BlobStore>>,
    namespace: Option<Arc<dyn NamespaceClient>>,
    checksum: Option<Arc<dyn ChecksumModule>>,
    policy: Arc<dyn ReplicaStatePolicy>,
    sweeper: Arc<dyn SpaceSweeperPolicy>,
    allocator: Option<Arc<dyn Allocator>>,
    capacity: u64,
    gap: Option<u64>,
}

impl RepositoryBuilder {
    pub fn events(mut self, events: Arc<EventBroadcaster>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn meta_store(mut self, store: Arc<dyn MetaDataStore>) -> Self {
        self.meta = Some(store);
        self
    }

    /// Legacy metadata store consulted when a record is missing.
    pub fn import_store(mut self, store: Arc<dyn MetaDataStore>) -> Self {
        self.import = Some(store);
        self
    }

    pub fn blob_store(mut self, store: Arc<dyn BlobStore>) -> Self {
        self.blob = Some(store);
        self
    }

    pub fn namespace(mut self, namespace: Arc<dyn NamespaceClient>) -> Self {
        self.namespace = Some(namespace);
        self
    }

    pub fn checksum_module(mut self, module: Arc<dyn ChecksumModule>) -> Self {
        self.checksum = Some(module);
        self
    }

    pub fn state_policy(mut self, policy: Arc<dyn ReplicaStatePolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn sweeper(mut self, sweeper: Arc<dyn SpaceSweeperPolicy>) -> Self {
        self.sweeper = sweeper;
        self
    }

    /// Allocation strategy for transfers. Defaults to the repository's
    /// own space ledger; a substitute must draw from the same ledger the
    /// repository accounts against.
    pub fn allocator(mut self, allocator: Arc<dyn Allocator>) -> Self {
        self.allocator = Some(allocator);
        self
    }

    /// Pool capacity in bytes.
    pub fn capacity(mut self, capacity: u64) -> Self {
        self.capacity = capacity;
        self
    }

    /// Override the reported always-removable gap.
    pub fn gap(mut self, gap: u64) -> Self {
        self.gap = Some(gap);
        self
    }

    pub fn build(self) -> Result<Repository> {
        let events = self
            .events
            .ok_or_else(|| PoolError::InvalidArgument("event broadcaster not set".into()))?;
        let meta = self
            .meta
            .ok_or_else(|| PoolError::InvalidArgument("metadata store not set".into()))?;
        let blob = self
            .blob
            .ok_or_else(|| PoolError::InvalidArgument("blob store not set".into()))?;
        let namespace = self
            .namespace
            .ok_or_else(|| PoolError::InvalidArgument("namespace client not set".into()))?;

        let ledger = Arc::new(SpaceLedger::new(self.capacity));
        let hook = Arc::new(AccountingHook {
            ledger: ledger.clone(),
            namespace: namespace.clone(),
            sweeper: self.sweeper.clone(),
            precious: Mutex::new(HashSet::new()),
            removable: Mutex::new(RemovableSet::default()),
        });
        // First listener: ledger updates precede external notification.
        events.add_listener(hook.clone());

        let mut consistent =
            ConsistentStore::new(meta, blob.clone(), namespace.clone(), self.policy);
        if let Some(module) = self.checksum {
            consistent = consistent.with_checksum(module);
        }
        if let Some(import) = self.import {
            consistent = consistent.with_import(import);
        }
        let store = Arc::new(MetaDataCache::new(Arc::new(consistent))?);

        let allocator = self
            .allocator
            .unwrap_or_else(|| ledger.clone() as Arc<dyn Allocator>);

        Ok(Repository {
            inner: Arc::new(RepoInner {
                state: RwLock::new(RepoState::Initialized),
                progress: Mutex::new(0.0),
                store,
                blob,
                namespace,
                ledger,
                allocator,
                events,
                hook,
                sweeper: self.sweeper,
                fault_listeners: RwLock::new(Vec::new()),
                gap: self.gap,
            }),
        })
    }
}

// ── Repository ──────────────────────────────────────────────────────────────

struct RepoInner {
    state: RwLock<RepoState>,
    /// Loading progress in [0, 1].
    progress: Mutex<f32>,
    store: Arc<MetaDataCache>,
    blob: Arc<dyn BlobStore>,
    namespace: Arc<dyn NamespaceClient>,
    ledger: Arc<SpaceLedger>,
    allocator: Arc<dyn Allocator>,
    events: Arc<EventBroadcaster>,
    hook: Arc<AccountingHook>,
    sweeper: Arc<dyn SpaceSweeperPolicy>,
    fault_listeners: RwLock<Vec<Arc<dyn FaultListener>>>,
    gap: Option<u64>,
}

/// The public contract of the replica repository. Cheap to clone; all
/// clones share one state.
#[derive(Clone)]
pub struct Repository {
    inner: Arc<RepoInner>,
}

impl Repository {
    #[must_use]
    pub fn builder() -> RepositoryBuilder {
        RepositoryBuilder {
            events: None,
            meta: None,
            import: None,
            blob: None,
            namespace: None,
            checksum: None,
            policy: Arc::new(DefaultStatePolicy),
            sweeper: Arc::new(LruSweeper),
            allocator: None,
            capacity: 0,
            gap: None,
        }
    }

    #[must_use]
    pub fn state(&self) -> RepoState {
        *self.inner.state.read()
    }

    /// Loading progress in [0, 1]; meaningful while [`RepoState::Loading`].
    #[must_use]
    pub fn load_progress(&self) -> f32 {
        *self.inner.progress.lock()
    }

    #[must_use]
    pub fn ledger(&self) -> &Arc<SpaceLedger> {
        &self.inner.ledger
    }

    pub(crate) fn allocator(&self) -> &Arc<dyn Allocator> {
        &self.inner.allocator
    }

    pub(crate) fn blob(&self) -> &Arc<dyn BlobStore> {
        &self.inner.blob
    }

    pub(crate) fn namespace(&self) -> &Arc<dyn NamespaceClient> {
        &self.inner.namespace
    }

    fn assert_open(&self) -> Result<()> {
        let state = self.state();
        if state == RepoState::Open {
            Ok(())
        } else {
            Err(PoolError::Closed(format!(
                "operation not allowed while repository is {state}"
            )))
        }
    }

    fn assert_initialized(&self) -> Result<()> {
        match self.state() {
            RepoState::Initialized | RepoState::Loading | RepoState::Open => Ok(()),
            state => Err(PoolError::Closed(format!(
                "operation not allowed while repository is {state}"
            ))),
        }
    }

    fn set_repo_state(&self, from: &[RepoState], to: RepoState) -> Result<()> {
        let mut state = self.inner.state.write();
        if from.contains(&*state) {
            *state = to;
            Ok(())
        } else {
            Err(PoolError::Closed(format!(
                "cannot move repository from {} to {to}",
                *state
            )))
        }
    }

    /// Generate the inventory: reconcile every replica the store chain
    /// knows about and rebuild the space accounting, then open the
    /// repository. May be called exactly once.
    pub fn load(&self) -> Result<()> {
        self.set_repo_state(&[RepoState::Initialized], RepoState::Loading)?;

        let result = self.scan_inventory();
        match &result {
            Ok(()) => {
                self.set_repo_state(&[RepoState::Loading], RepoState::Open)?;
                info!("done generating inventory");
            }
            Err(err) => {
                error!(%err, "inventory generation failed");
                let _ = self.set_repo_state(&[RepoState::Loading], RepoState::Failed);
            }
        }
        result
    }

    fn scan_inventory(&self) -> Result<()> {
        let ids = self.inner.store.list()?;
        let total = ids.len();
        info!(files = total, "checking meta data");

        for (index, id) in ids.iter().enumerate() {
            match self.read_with_timeout_retry(id)? {
                Some(record) => {
                    let entry = record.snapshot();
                    debug!(%id, state = %entry.state, "scanned");
                    self.inner.hook.account_scanned(&entry);
                }
                None => debug!(%id, "disappeared during scan"),
            }
            #[allow(clippy::cast_precision_loss)]
            let progress = (index + 1) as f32 / total.max(1) as f32;
            *self.inner.progress.lock() = progress;
        }
        Ok(())
    }

    /// Namespace timeouts during the startup scan are retried forever:
    /// failing would leave the pool dead, while the namespace manager is
    /// expected to come up eventually.
    fn read_with_timeout_retry(&self, id: &ReplicaId) -> Result<Option<Arc<ReplicaRecord>>> {
        loop {
            match self.inner.store.get(id) {
                Err(PoolError::NamespaceTimeout(detail)) => {
                    warn!(%id, %detail, "namespace timeout during scan; retrying");
                    thread::sleep(Duration::from_secs(1));
                }
                other => return other,
            }
        }
    }

    /// All replica ids known to the repository.
    pub fn replicas(&self) -> Result<Vec<ReplicaId>> {
        self.assert_open()?;
        self.inner.store.list()
    }

    fn record(&self, id: &ReplicaId) -> Result<Arc<ReplicaRecord>> {
        self.inner
            .store
            .get(id)?
            .ok_or_else(|| PoolError::NotFound(id.to_string()))
    }

    /// Create a replica and hand back the write descriptor for its
    /// transfer.
    ///
    /// `transfer_state` must be one of the inbound-transfer states and
    /// `target_state` one of the resident states. The pins in `sticky`
    /// are applied at commit time, before the final state transition.
    pub fn create_replica(
        &self,
        id: ReplicaId,
        info: pfs_types::StorageInfo,
        transfer_state: EntryState,
        target_state: EntryState,
        sticky: Vec<StickyRecord>,
    ) -> Result<WriteDescriptor> {
        self.assert_open()?;
        if !transfer_state.is_transfer() {
            return Err(PoolError::InvalidArgument(format!(
                "invalid initial state: {transfer_state}"
            )));
        }
        if !target_state.is_resident() {
            return Err(PoolError::InvalidArgument(format!(
                "invalid target state: {target_state}"
            )));
        }

        info!(%id, "creating new entry");
        match self.inner.store.create(&id) {
            Ok(record) => {
                record.set_storage_info(info)?;
                let path = match self.inner.blob.create(&id) {
                    Ok(path) => path,
                    Err(err) => {
                        let _ = self.inner.store.remove(&id);
                        return Err(err);
                    }
                };
                record.set_state(transfer_state)?;
                Ok(WriteDescriptor::new(
                    self.clone(),
                    record,
                    path,
                    transfer_state,
                    target_state,
                    sticky,
                ))
            }
            Err(PoolError::DuplicateEntry(detail)) => {
                // Somebody assumed we don't have the file; make sure the
                // namespace knows we do.
                if let NamespaceOutcome::Other(err) = self.inner.namespace.register_location(&id) {
                    warn!(%id, %err, "failed to re-register existing replica");
                }
                Err(PoolError::DuplicateEntry(detail))
            }
            Err(err) => Err(err),
        }
    }

    /// Open a resident replica for reading.
    pub fn open_replica(&self, id: ReplicaId, flags: OpenFlags) -> Result<ReadDescriptor> {
        self.assert_initialized()?;

        match self.record(&id) {
            Ok(record) => match record.state() {
                EntryState::New
                | EntryState::FromClient
                | EntryState::FromStore
                | EntryState::FromPool => {
                    Err(PoolError::Busy(format!("replica {id} is incomplete")))
                }
                EntryState::Broken => Err(PoolError::CorruptReplica {
                    id: id.to_string(),
                    detail: "replica is quarantined".into(),
                }),
                EntryState::Removed | EntryState::Destroyed => {
                    Err(PoolError::NotFound(format!("replica {id} has been removed")))
                }
                EntryState::Cached | EntryState::Precious => {
                    record.inc_link();
                    if !flags.no_atime {
                        record.touch(now_millis())?;
                    }
                    let path = self.inner.blob.path(&id);
                    Ok(ReadDescriptor::new(self.clone(), record, path))
                }
            },
            Err(PoolError::NotFound(detail)) => {
                // A stale registration in the namespace: record a
                // tombstone so the location gets cleared.
                match self.inner.store.create(&id) {
                    Ok(record) => {
                        let _ = record.set_state(EntryState::Removed);
                    }
                    Err(PoolError::DuplicateEntry(_)) => {
                        // Created concurrently after all; try again.
                        return self.open_replica(id, flags);
                    }
                    Err(err) => {
                        self.fault(
                            FaultAction::Readonly,
                            format!("internal repository error: {err}"),
                        );
                    }
                }
                Err(PoolError::NotFound(detail))
            }
            Err(err) => Err(err),
        }
    }

    /// Snapshot of one replica's metadata.
    pub fn get_entry(&self, id: &ReplicaId) -> Result<CacheEntry> {
        self.assert_initialized()?;
        let record = self.record(id)?;
        let entry = record.snapshot();
        if entry.state == EntryState::New {
            return Err(PoolError::NotFound(format!("replica {id} is incomplete")));
        }
        Ok(entry)
    }

    /// Lifecycle state of one replica; unknown replicas report `New`.
    pub fn state_of(&self, id: &ReplicaId) -> Result<EntryState> {
        self.assert_initialized()?;
        match self.record(id) {
            Ok(record) => Ok(record.state()),
            Err(PoolError::NotFound(_)) => Ok(EntryState::New),
            Err(err) => Err(err),
        }
    }

    /// Change a replica's lifecycle state.
    ///
    /// Legal direct transitions: removal is idempotent from `New`/
    /// `Removed`/`Destroyed` (and from unknown replicas); the resident
    /// states and `Broken` move freely among themselves and to
    /// `Removed`. Everything else fails with `IllegalTransition`.
    pub fn set_state(&self, id: &ReplicaId, state: EntryState) -> Result<()> {
        self.assert_open()?;

        match self.record(id) {
            Ok(record) => {
                let source = record.state();
                match source {
                    EntryState::New | EntryState::Removed | EntryState::Destroyed => {
                        if state == EntryState::Removed {
                            // Gone or going; that is all we wanted.
                            return Ok(());
                        }
                    }
                    EntryState::Precious | EntryState::Cached | EntryState::Broken => match state {
                        EntryState::Removed => {
                            record.set_state(state)?;
                            self.destroy_when_unreferenced(&record)?;
                            return Ok(());
                        }
                        EntryState::Cached | EntryState::Precious | EntryState::Broken => {
                            record.set_state(state)?;
                            return Ok(());
                        }
                        _ => {}
                    },
                    _ => {}
                }
                Err(PoolError::IllegalTransition {
                    id: id.to_string(),
                    from: source.to_string(),
                    to: state.to_string(),
                })
            }
            Err(PoolError::NotFound(_)) => {
                // The replica disappeared before the change; fine if we
                // wanted it gone, an error otherwise.
                if state == EntryState::Removed {
                    Ok(())
                } else {
                    Err(PoolError::IllegalTransition {
                        id: id.to_string(),
                        from: EntryState::New.to_string(),
                        to: state.to_string(),
                    })
                }
            }
            Err(err) => Err(err),
        }
    }

    /// Add or update the pin owned by `owner`.
    pub fn set_sticky(
        &self,
        id: &ReplicaId,
        owner: &str,
        expire_at: i64,
        overwrite: bool,
    ) -> Result<()> {
        self.assert_initialized()?;

        let record = match self.record(id) {
            Ok(record) => record,
            Err(PoolError::NotFound(detail)) => {
                // A sticky request for a missing file usually means a
                // stale registration; record a tombstone to clear it.
                match self.inner.store.create(id) {
                    Ok(record) => {
                        let _ = record.set_state(EntryState::Removed);
                    }
                    Err(PoolError::DuplicateEntry(_)) => {
                        return self.set_sticky(id, owner, expire_at, overwrite);
                    }
                    Err(err) => {
                        self.fault(
                            FaultAction::Readonly,
                            format!("internal repository error: {err}"),
                        );
                    }
                }
                return Err(PoolError::NotFound(detail));
            }
            Err(err) => return Err(err),
        };

        match record.state() {
            EntryState::New
            | EntryState::FromClient
            | EntryState::FromStore
            | EntryState::FromPool => Err(PoolError::Busy(format!("replica {id} is incomplete"))),
            EntryState::Removed | EntryState::Destroyed => {
                Err(PoolError::NotFound(format!("replica {id} has been removed")))
            }
            EntryState::Broken | EntryState::Precious | EntryState::Cached => {
                record.set_sticky(owner, expire_at, overwrite, now_millis())?;
                Ok(())
            }
        }
    }

    /// Drop expired pins across the whole inventory. The hosting daemon
    /// calls this on its maintenance timer; removability and listener
    /// notifications follow from the sticky-change events.
    pub fn expire_sticky_flags(&self, now: i64) -> Result<()> {
        self.assert_open()?;
        for id in self.inner.store.list()? {
            if let Some(record) = self.inner.store.get(&id)? {
                let removed = record.remove_expired_sticky(now)?;
                if !removed.is_empty() {
                    debug!(%id, count = removed.len(), "expired sticky flags");
                }
            }
        }
        Ok(())
    }

    /// Current space accounting, including the LRU age and the
    /// always-removable gap.
    #[must_use]
    pub fn space_record(&self) -> SpaceRecord {
        let snapshot = self.inner.ledger.snapshot();
        let lru_seconds = if snapshot.last_lru > 0 {
            u64::try_from((now_millis() - snapshot.last_lru).max(0)).unwrap_or(0) / 1000
        } else {
            0
        };
        let gap = self
            .inner
            .gap
            .unwrap_or_else(|| (snapshot.total / 4).min(DEFAULT_GAP));
        SpaceRecord {
            total: snapshot.total,
            free: snapshot.free,
            precious: snapshot.precious,
            removable: snapshot.removable,
            lru_seconds,
            gap,
        }
    }

    /// Resize the pool (operator command). Fails when shrinking below
    /// the space already used.
    pub fn set_total_space(&self, total: u64) -> Result<()> {
        info!(total, "adjusting pool size");
        self.inner.ledger.set_total(total)
    }

    /// Entries eligible for consideration by the sweeper, best victims
    /// first.
    pub fn eviction_candidates(&self, now: i64) -> Result<Vec<CacheEntry>> {
        self.assert_open()?;
        let mut entries = Vec::new();
        for id in self.inner.store.list()? {
            if let Some(record) = self.inner.store.get(&id)? {
                let entry = record.snapshot();
                if entry.state != EntryState::New && !entry.state.is_terminal() {
                    entries.push(entry);
                }
            }
        }
        EvictionOrder::new(self.inner.sweeper.clone()).sort(&mut entries, now);
        Ok(entries)
    }

    pub fn add_listener(&self, listener: Arc<dyn StateChangeListener>) {
        self.inner.events.add_listener(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn StateChangeListener>) {
        self.inner.events.remove_listener(listener);
    }

    pub fn add_fault_listener(&self, listener: Arc<dyn FaultListener>) {
        self.inner.fault_listeners.write().push(listener);
    }

    pub fn remove_fault_listener(&self, listener: &Arc<dyn FaultListener>) {
        self.inner
            .fault_listeners
            .write()
            .retain(|l| !Arc::ptr_eq(l, listener));
    }

    /// Shut down: waits out in-flight loads, clears the cache, and
    /// closes the store chain.
    pub fn close(&self) {
        let mut state = self.inner.state.write();
        if *state == RepoState::Closed {
            return;
        }
        *state = RepoState::Closed;
        drop(state);
        self.inner.store.close();
    }

    /// Destroy a removed replica once nothing references it: delete the
    /// data and metadata, then account the freed space.
    pub(crate) fn destroy(&self, record: &Arc<ReplicaRecord>) -> Result<()> {
        let id = record.id();
        debug!(%id, "destroying replica");
        // The file goes first; the Destroyed event then frees the
        // space, so the ledger never understates what is on disk.
        self.inner.store.remove(&id)?;
        record.set_state(EntryState::Destroyed)?;
        Ok(())
    }

    fn destroy_when_unreferenced(&self, record: &Arc<ReplicaRecord>) -> Result<()> {
        if record.link_count() == 0 {
            self.destroy(record)
        } else {
            // Readers still hold the replica; the last descriptor to
            // close performs the destruction.
            Ok(())
        }
    }

    fn fault(&self, action: FaultAction, message: String) {
        error!(?action, %message, "repository fault");
        let event = FaultEvent {
            source: "repository".into(),
            action,
            message,
        };
        let listeners: Vec<_> = self.inner.fault_listeners.read().iter().cloned().collect();
        for listener in &listeners {
            if catch_unwind(AssertUnwindSafe(|| listener.fault_occurred(&event))).is_err() {
                error!("fault listener panicked during dispatch");
            }
        }
    }
}

impl fmt::Debug for Repository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Repository")
            .field("state", &self.state())
            .field("ledger", &self.inner.ledger.snapshot())
            .finish()
    }
}
