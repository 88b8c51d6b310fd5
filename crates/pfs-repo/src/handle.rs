//! Transfer handles: the write and read descriptors handed to movers.

use crate::Repository;
use parking_lot::Mutex;
use pfs_error::{PoolError, Result};
use pfs_heal::{AttributeUpdate, NamespaceOutcome};
use pfs_meta::{CacheEntry, ReplicaRecord};
use pfs_types::{now_millis, EntryState, ReplicaId, StickyRecord};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::warn;

/// Flags for opening a replica for reading.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenFlags {
    /// Do not update the access time on open.
    pub no_atime: bool,
}

/// Handle for writing a new replica.
///
/// Space is reserved through the repository's allocator as the transfer
/// proceeds; `commit` settles the reservation against the bytes actually
/// on disk, publishes attributes for client uploads, applies the target
/// pins, and performs the final state transition. Dropping an
/// uncommitted handle releases the reservation and quarantines the
/// replica as broken, mirroring an aborted transfer.
impl std::fmt::Debug for WriteDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteDescriptor")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

pub struct WriteDescriptor {
    repo: Repository,
    record: Arc<ReplicaRecord>,
    path: PathBuf,
    transfer_state: EntryState,
    target_state: EntryState,
    sticky: Vec<StickyRecord>,
    allocated: Mutex<u64>,
    committed: AtomicBool,
}

impl WriteDescriptor {
    pub(crate) fn new(
        repo: Repository,
        record: Arc<ReplicaRecord>,
        path: PathBuf,
        transfer_state: EntryState,
        target_state: EntryState,
        sticky: Vec<StickyRecord>,
    ) -> Self {
        Self {
            repo,
            record,
            path,
            transfer_state,
            target_state,
            sticky,
            allocated: Mutex::new(0),
            committed: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn id(&self) -> ReplicaId {
        self.record.id()
    }

    /// File the mover writes replica data into.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn entry(&self) -> CacheEntry {
        self.record.snapshot()
    }

    /// Reserve `size` additional bytes for this transfer, blocking under
    /// space pressure.
    pub fn allocate(&self, size: u64) -> Result<()> {
        self.repo.allocator().allocate(size)?;
        let mut allocated = self.allocated.lock();
        *allocated += size;
        Ok(())
    }

    /// Finish the transfer: settle the reservation to the on-disk
    /// length, publish size and location, apply pins, and move the
    /// replica to its target state.
    pub fn commit(&self) -> Result<()> {
        let id = self.id();
        let length = self.repo.blob().len(&id)?.unwrap_or(0);

        {
            let mut allocated = self.allocated.lock();
            if length > *allocated {
                self.repo.allocator().allocate(length - *allocated)?;
            } else if length < *allocated {
                self.repo.allocator().free(*allocated - length)?;
            }
            *allocated = length;
        }

        self.record.set_size(length)?;

        if self.transfer_state == EntryState::FromClient {
            namespace_result(
                self.repo
                    .namespace()
                    .update_attributes(&id, AttributeUpdate::size(length)),
                &id,
                "publishing size",
            )?;
            if let Some(info) = self.record.snapshot().storage_info {
                self.record.set_storage_info(info.with_file_size(length))?;
            }
        }
        namespace_result(
            self.repo.namespace().register_location(&id),
            &id,
            "registering location",
        )?;

        // Pins first, so the replica is never eviction-eligible between
        // reaching its target state and being protected.
        let now = now_millis();
        for sticky in &self.sticky {
            self.record
                .set_sticky(&sticky.owner, sticky.expire_at, true, now)?;
        }
        self.record.set_state(self.target_state)?;
        self.committed.store(true, Ordering::Release);
        Ok(())
    }
}

impl Drop for WriteDescriptor {
    fn drop(&mut self) {
        if self.committed.load(Ordering::Acquire) {
            return;
        }
        warn!(id = %self.id(), "transfer dropped without commit; quarantining replica");
        let allocated = *self.allocated.lock();
        if allocated > 0 {
            if let Err(err) = self.repo.allocator().free(allocated) {
                warn!(id = %self.id(), %err, "failed to release reservation of aborted transfer");
            }
        }
        if let Err(err) = self.record.set_state(EntryState::Broken) {
            warn!(id = %self.id(), %err, "failed to quarantine aborted transfer");
        }
    }
}

fn namespace_result(outcome: NamespaceOutcome<()>, id: &ReplicaId, action: &str) -> Result<()> {
    match outcome {
        NamespaceOutcome::Found(()) => Ok(()),
        NamespaceOutcome::NotFound => Err(PoolError::NotFound(format!(
            "{action} for {id}: file not in namespace"
        ))),
        NamespaceOutcome::Timeout => {
            Err(PoolError::NamespaceTimeout(format!("{action} for {id}")))
        }
        NamespaceOutcome::Other(err) => Err(PoolError::NamespaceUnavailable(format!(
            "{action} for {id}: {err}"
        ))),
    }
}

/// Handle for reading a resident replica.
///
/// Holding the handle pins the replica's data on disk: a concurrent
/// removal only destroys the blob once the last reader is gone.
impl std::fmt::Debug for ReadDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadDescriptor")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

pub struct ReadDescriptor {
    repo: Repository,
    record: Arc<ReplicaRecord>,
    path: PathBuf,
}

impl ReadDescriptor {
    pub(crate) fn new(repo: Repository, record: Arc<ReplicaRecord>, path: PathBuf) -> Self {
        Self { repo, record, path }
    }

    #[must_use]
    pub fn id(&self) -> ReplicaId {
        self.record.id()
    }

    /// File the mover reads replica data from.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn entry(&self) -> CacheEntry {
        self.record.snapshot()
    }
}

impl Drop for ReadDescriptor {
    fn drop(&mut self) {
        let links = self.record.dec_link();
        if links == 0 && self.record.state() == EntryState::Removed {
            if let Err(err) = self.repo.destroy(&self.record) {
                warn!(id = %self.id(), %err, "failed to destroy removed replica after last close");
            }
        }
    }
}
