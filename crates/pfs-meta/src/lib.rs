#![forbid(unsafe_code)]
//! Replica metadata: records, change events, stores, and the cache.
//!
//! The layering mirrors the repository's store chain:
//!
//! ```text
//! MetaDataCache ── single canonical instance + single-flight loads
//!   └─ (reconciling decorator, see pfs-heal)
//!        └─ FileMetaStore ── one JSON document per replica
//! ```
//!
//! A [`ReplicaRecord`] is the process-wide canonical representation of
//! one replica's metadata. Callers only ever hold shared references; the
//! record's own lock guards mutation, and every mutation persists through
//! the owning store and is announced through the [`EventBroadcaster`].

mod cache;
mod events;
mod record;
mod store;

pub use cache::MetaDataCache;
pub use events::{
    EntryChangeEvent, EventBroadcaster, StateChangeEvent, StateChangeListener, StickyChangeEvent,
};
pub use record::{CacheEntry, NoopPersister, RecordData, RecordPersister, ReplicaRecord};
pub use store::{FileMetaStore, MemMetaStore, MetaDataStore};
