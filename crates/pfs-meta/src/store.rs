//! Metadata stores: the trait and the file/memory implementations.

use crate::events::EventBroadcaster;
use crate::record::{CacheEntry, NoopPersister, RecordData, RecordPersister, ReplicaRecord};
use parking_lot::Mutex;
use pfs_error::{PoolError, Result};
use pfs_types::{now_millis, ReplicaId};
use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::warn;

/// Persisted-metadata abstraction for the pool's replicas.
///
/// Implementations hand out [`ReplicaRecord`] instances; uniqueness of
/// the in-memory instance per identifier is the cache decorator's job,
/// not the store's.
pub trait MetaDataStore: Send + Sync {
    /// All replica ids known to this store.
    fn list(&self) -> Result<Vec<ReplicaId>>;

    /// Load the record for `id`, or `None` if unknown.
    fn get(&self, id: &ReplicaId) -> Result<Option<Arc<ReplicaRecord>>>;

    /// Create a fresh record in state `New`. Fails with `DuplicateEntry`
    /// if one already exists.
    fn create(&self, id: &ReplicaId) -> Result<Arc<ReplicaRecord>>;

    /// Create a record pre-populated from `entry` (import path). Fails
    /// with `DuplicateEntry` if one already exists.
    fn create_from(&self, entry: &CacheEntry) -> Result<Arc<ReplicaRecord>>;

    /// Delete the record. Deleting an absent record is not an error.
    fn remove(&self, id: &ReplicaId) -> Result<()>;

    /// Release resources. Operations after close may fail.
    fn close(&self);
}

// ── File-backed store ───────────────────────────────────────────────────────

/// One JSON document per replica under `<root>/meta/<id>.json`, replaced
/// atomically via a temp-file rename on every mutation.
#[derive(Debug)]
pub struct FileMetaStore {
    meta_dir: PathBuf,
    persister: Arc<FilePersister>,
    events: Arc<EventBroadcaster>,
}

#[derive(Debug)]
struct FilePersister {
    meta_dir: PathBuf,
}

impl FilePersister {
    fn record_path(&self, id: &ReplicaId) -> PathBuf {
        self.meta_dir.join(format!("{id}.json"))
    }
}

impl RecordPersister for FilePersister {
    fn persist(&self, id: &ReplicaId, data: &RecordData) -> Result<()> {
        let body = serde_json::to_vec_pretty(data)
            .map_err(|err| PoolError::Metadata(format!("encoding record {id}: {err}")))?;
        let path = self.record_path(id);
        let tmp = self.meta_dir.join(format!("{id}.json.tmp"));
        fs::write(&tmp, body)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }
}

impl FileMetaStore {
    pub fn open(root: impl AsRef<Path>, events: Arc<EventBroadcaster>) -> Result<Self> {
        let meta_dir = root.as_ref().join("meta");
        fs::create_dir_all(&meta_dir)?;
        Ok(Self {
            persister: Arc::new(FilePersister {
                meta_dir: meta_dir.clone(),
            }),
            meta_dir,
            events,
        })
    }

    fn record_path(&self, id: &ReplicaId) -> PathBuf {
        self.persister.record_path(id)
    }

    fn build(&self, id: ReplicaId, data: RecordData) -> Arc<ReplicaRecord> {
        Arc::new(ReplicaRecord::new(
            id,
            data,
            self.persister.clone() as Arc<dyn RecordPersister>,
            self.events.clone(),
        ))
    }

    fn create_with(&self, id: ReplicaId, data: RecordData) -> Result<Arc<ReplicaRecord>> {
        let path = self.record_path(&id);
        if path.exists() {
            return Err(PoolError::DuplicateEntry(id.to_string()));
        }
        self.persister.persist(&id, &data)?;
        Ok(self.build(id, data))
    }
}

impl MetaDataStore for FileMetaStore {
    fn list(&self) -> Result<Vec<ReplicaId>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.meta_dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let Some(stem) = name.strip_suffix(".json") else {
                continue;
            };
            match stem.parse::<ReplicaId>() {
                Ok(id) => ids.push(id),
                Err(err) => {
                    warn!(file = %name, %err, "ignoring foreign file in meta directory");
                }
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }

    fn get(&self, id: &ReplicaId) -> Result<Option<Arc<ReplicaRecord>>> {
        let body = match fs::read(self.record_path(id)) {
            Ok(body) => body,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let data: RecordData = serde_json::from_slice(&body)
            .map_err(|err| PoolError::Metadata(format!("decoding record {id}: {err}")))?;
        Ok(Some(self.build(*id, data)))
    }

    fn create(&self, id: &ReplicaId) -> Result<Arc<ReplicaRecord>> {
        self.create_with(*id, RecordData::new(now_millis()))
    }

    fn create_from(&self, entry: &CacheEntry) -> Result<Arc<ReplicaRecord>> {
        self.create_with(
            entry.id,
            RecordData {
                size: entry.size,
                storage_info: entry.storage_info.clone(),
                state: entry.state,
                sticky: entry.sticky.clone(),
                link_count: 0,
                created_at: entry.created_at,
                last_accessed_at: entry.last_accessed_at,
            },
        )
    }

    fn remove(&self, id: &ReplicaId) -> Result<()> {
        match fs::remove_file(self.record_path(id)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn close(&self) {}
}

// ── In-memory store ─────────────────────────────────────────────────────────

/// Memory-only store, used in tests and as a legacy-import source.
#[derive(Debug, Default)]
pub struct MemMetaStore {
    records: Mutex<HashMap<ReplicaId, Arc<ReplicaRecord>>>,
    events: Arc<EventBroadcaster>,
}

impl MemMetaStore {
    #[must_use]
    pub fn new(events: Arc<EventBroadcaster>) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            events,
        }
    }
}

impl MetaDataStore for MemMetaStore {
    fn list(&self) -> Result<Vec<ReplicaId>> {
        let mut ids: Vec<_> = self.records.lock().keys().copied().collect();
        ids.sort_unstable();
        Ok(ids)
    }

    fn get(&self, id: &ReplicaId) -> Result<Option<Arc<ReplicaRecord>>> {
        Ok(self.records.lock().get(id).cloned())
    }

    fn create(&self, id: &ReplicaId) -> Result<Arc<ReplicaRecord>> {
        let mut records = self.records.lock();
        if records.contains_key(id) {
            return Err(PoolError::DuplicateEntry(id.to_string()));
        }
        let record = Arc::new(ReplicaRecord::new(
            *id,
            RecordData::new(now_millis()),
            Arc::new(NoopPersister),
            self.events.clone(),
        ));
        records.insert(*id, record.clone());
        Ok(record)
    }

    fn create_from(&self, entry: &CacheEntry) -> Result<Arc<ReplicaRecord>> {
        let mut records = self.records.lock();
        if records.contains_key(&entry.id) {
            return Err(PoolError::DuplicateEntry(entry.id.to_string()));
        }
        let record = Arc::new(ReplicaRecord::new(
            entry.id,
            RecordData {
                size: entry.size,
                storage_info: entry.storage_info.clone(),
                state: entry.state,
                sticky: entry.sticky.clone(),
                link_count: 0,
                created_at: entry.created_at,
                last_accessed_at: entry.last_accessed_at,
            },
            Arc::new(NoopPersister),
            self.events.clone(),
        ));
        records.insert(entry.id, record.clone());
        Ok(record)
    }

    fn remove(&self, id: &ReplicaId) -> Result<()> {
        self.records.lock().remove(id);
        Ok(())
    }

    fn close(&self) {
        self.records.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pfs_types::{EntryState, StickyRecord};
    use tempfile::TempDir;

    fn id(n: u8) -> ReplicaId {
        let mut bytes = [0_u8; pfs_types::REPLICA_ID_BYTES];
        bytes[11] = n;
        ReplicaId::from_bytes(bytes)
    }

    #[test]
    fn file_store_round_trips_records() {
        let dir = TempDir::new().expect("tempdir");
        let events = Arc::new(EventBroadcaster::new());
        let store = FileMetaStore::open(dir.path(), events.clone()).expect("open");

        let record = store.create(&id(1)).expect("create");
        record.set_size(2048).expect("size");
        record.set_state(EntryState::Precious).expect("state");
        record
            .set_sticky("system", -1, false, 0)
            .expect("sticky");

        // A second store over the same directory reads the same data back.
        let reopened = FileMetaStore::open(dir.path(), events).expect("reopen");
        let loaded = reopened.get(&id(1)).expect("get").expect("present");
        let entry = loaded.snapshot();
        assert_eq!(entry.size, 2048);
        assert_eq!(entry.state, EntryState::Precious);
        assert_eq!(entry.sticky, vec![StickyRecord::forever("system")]);
    }

    #[test]
    fn file_store_rejects_duplicate_creation() {
        let dir = TempDir::new().expect("tempdir");
        let store =
            FileMetaStore::open(dir.path(), Arc::new(EventBroadcaster::new())).expect("open");
        store.create(&id(2)).expect("first");
        let err = store.create(&id(2)).expect_err("second");
        assert!(matches!(err, PoolError::DuplicateEntry(_)));
    }

    #[test]
    fn file_store_lists_only_record_files() {
        let dir = TempDir::new().expect("tempdir");
        let store =
            FileMetaStore::open(dir.path(), Arc::new(EventBroadcaster::new())).expect("open");
        store.create(&id(3)).expect("create");
        fs::write(dir.path().join("meta").join("notes.txt"), b"x").expect("write");

        assert_eq!(store.list().expect("list"), vec![id(3)]);
    }

    #[test]
    fn file_store_remove_is_idempotent() {
        let dir = TempDir::new().expect("tempdir");
        let store =
            FileMetaStore::open(dir.path(), Arc::new(EventBroadcaster::new())).expect("open");
        store.create(&id(4)).expect("create");
        store.remove(&id(4)).expect("remove");
        store.remove(&id(4)).expect("remove again");
        assert!(store.get(&id(4)).expect("get").is_none());
    }

    #[test]
    fn file_store_surfaces_undecodable_records() {
        let dir = TempDir::new().expect("tempdir");
        let store =
            FileMetaStore::open(dir.path(), Arc::new(EventBroadcaster::new())).expect("open");
        fs::write(
            dir.path().join("meta").join(format!("{}.json", id(5))),
            b"not json",
        )
        .expect("write garbage");

        let err = store.get(&id(5)).expect_err("must fail");
        assert!(matches!(err, PoolError::Metadata(_)));
    }

    #[test]
    fn mem_store_create_from_imports_entries() {
        let store = MemMetaStore::new(Arc::new(EventBroadcaster::new()));
        let source = store.create(&id(6)).expect("create");
        source.set_size(10).expect("size");
        source.set_state(EntryState::Cached).expect("state");

        let target = MemMetaStore::new(Arc::new(EventBroadcaster::new()));
        let imported = target.create_from(&source.snapshot()).expect("import");
        assert_eq!(imported.snapshot().size, 10);
        assert_eq!(imported.snapshot().state, EntryState::Cached);

        let err = target.create_from(&source.snapshot()).expect_err("dup");
        assert!(matches!(err, PoolError::DuplicateEntry(_)));
    }
}
