#![forbid(unsafe_code)]
//! poolfs public API facade.
//!
//! Re-exports the replica-repository surface through one crate. This is
//! the crate downstream consumers (pool daemon, CLI, tests) depend on.

pub use pfs_error::{PoolError, Result};
pub use pfs_heal::{
    AttributeUpdate, Blake3ChecksumModule, ChecksumModule, ConsistentStore, DefaultStatePolicy,
    NamespaceClient, NamespaceOutcome, ReplicaStatePolicy,
};
pub use pfs_meta::{
    CacheEntry, EntryChangeEvent, EventBroadcaster, FileMetaStore, MemMetaStore, MetaDataCache,
    MetaDataStore, NoopPersister, RecordData, RecordPersister, ReplicaRecord, StateChangeEvent,
    StateChangeListener, StickyChangeEvent,
};
pub use pfs_repo::{
    EvictionOrder, FaultAction, FaultEvent, FaultListener, LruSweeper, OpenFlags, ReadDescriptor,
    RepoState, Repository, RepositoryBuilder, SpaceSweeperPolicy, WriteDescriptor, DEFAULT_GAP,
};
pub use pfs_space::{Allocator, FairAllocator, FairHandle, SpaceLedger, SpaceRequestListener};
pub use pfs_store::{hash_blob, BlobStore, DirBlobStore};
pub use pfs_types::{
    now_millis, AccessLatency, Checksum, ChecksumKind, EntryState, ReplicaId, RetentionPolicy,
    SpaceRecord, StickyRecord, StorageInfo, STICKY_FOREVER,
};
