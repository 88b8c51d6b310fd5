#![forbid(unsafe_code)]
//! Blob-store boundary.
//!
//! The repository core treats replica data as opaque, size-bearing blobs
//! keyed by [`ReplicaId`]. This crate defines that boundary
//! ([`BlobStore`]) and provides [`DirBlobStore`], a flat-directory
//! implementation where each replica is one file named by its id. The
//! core never interprets blob contents except to read their length and,
//! when a checksum policy is configured, to hash them.

use pfs_error::{PoolError, Result};
use pfs_types::{Checksum, ChecksumKind, ReplicaId};
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Opaque byte container keyed by replica identifier.
pub trait BlobStore: Send + Sync {
    /// All replica ids with a blob on disk.
    fn list(&self) -> Result<Vec<ReplicaId>>;

    /// Length of the blob in bytes, or `None` if no blob exists.
    fn len(&self, id: &ReplicaId) -> Result<Option<u64>>;

    /// Create an empty blob. Fails with `DuplicateEntry` if one exists.
    fn create(&self, id: &ReplicaId) -> Result<PathBuf>;

    /// Location of the blob's backing file, whether or not it exists.
    /// Transfer handles read and write replica data through this path.
    fn path(&self, id: &ReplicaId) -> PathBuf;

    /// Delete the blob. Deleting an absent blob is not an error.
    fn remove(&self, id: &ReplicaId) -> Result<()>;

    /// Bytes still available for new blobs.
    fn free_space(&self) -> u64;

    /// Configured capacity in bytes.
    fn total_space(&self) -> u64;

    /// Whether the store can currently service reads and writes.
    fn health_check(&self) -> bool;
}

/// Flat-directory blob store: one file per replica under `<root>/data/`,
/// named by the replica id's hex rendering.
#[derive(Debug)]
pub struct DirBlobStore {
    data_dir: PathBuf,
    capacity: u64,
}

impl DirBlobStore {
    /// Open (creating if needed) the store under `root` with a configured
    /// capacity. The capacity is an accounting limit, not a filesystem
    /// quota; enforcement is the space ledger's job.
    pub fn open(root: impl AsRef<Path>, capacity: u64) -> Result<Self> {
        let data_dir = root.as_ref().join("data");
        fs::create_dir_all(&data_dir)?;
        Ok(Self { data_dir, capacity })
    }

    fn used_bytes(&self) -> Result<u64> {
        let mut used = 0_u64;
        for entry in fs::read_dir(&self.data_dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                used = used.saturating_add(entry.metadata()?.len());
            }
        }
        Ok(used)
    }
}

impl BlobStore for DirBlobStore {
    fn list(&self) -> Result<Vec<ReplicaId>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.data_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name();
            match name.to_string_lossy().parse::<ReplicaId>() {
                Ok(id) => ids.push(id),
                Err(err) => {
                    warn!(file = %name.to_string_lossy(), %err, "ignoring foreign file in data directory");
                }
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }

    fn len(&self, id: &ReplicaId) -> Result<Option<u64>> {
        match fs::metadata(self.path(id)) {
            Ok(meta) => Ok(Some(meta.len())),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn create(&self, id: &ReplicaId) -> Result<PathBuf> {
        let path = self.path(id);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(_) => Ok(path),
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                Err(PoolError::DuplicateEntry(id.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    fn path(&self, id: &ReplicaId) -> PathBuf {
        self.data_dir.join(id.to_string())
    }

    fn remove(&self, id: &ReplicaId) -> Result<()> {
        match fs::remove_file(self.path(id)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn free_space(&self) -> u64 {
        self.used_bytes()
            .map_or(0, |used| self.capacity.saturating_sub(used))
    }

    fn total_space(&self) -> u64 {
        self.capacity
    }

    fn health_check(&self) -> bool {
        let probe = self.data_dir.join(".probe");
        let ok = fs::write(&probe, b"ok").is_ok()
            && fs::read(&probe).map_or(false, |bytes| bytes == b"ok");
        let _ = fs::remove_file(&probe);
        ok
    }
}

/// Hash a blob's contents with blake3, streaming to bound memory use.
pub fn hash_blob(path: &Path) -> Result<Checksum> {
    let mut file = File::open(path)?;
    let mut hasher = blake3::Hasher::new();
    let mut buf = vec![0_u8; 64 * 1024];
    loop {
        let read = file.read(&mut buf)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(Checksum {
        algorithm: ChecksumKind::Blake3,
        value: hasher.finalize().to_hex().to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn id(n: u8) -> ReplicaId {
        let mut bytes = [0_u8; pfs_types::REPLICA_ID_BYTES];
        bytes[11] = n;
        ReplicaId::from_bytes(bytes)
    }

    #[test]
    fn create_list_len_remove_round_trip() {
        let dir = TempDir::new().expect("tempdir");
        let store = DirBlobStore::open(dir.path(), 1 << 20).expect("open");

        let path = store.create(&id(1)).expect("create");
        fs::write(&path, b"0123456789").expect("write");

        assert_eq!(store.len(&id(1)).expect("len"), Some(10));
        assert_eq!(store.len(&id(2)).expect("len absent"), None);
        assert_eq!(store.list().expect("list"), vec![id(1)]);

        store.remove(&id(1)).expect("remove");
        assert_eq!(store.len(&id(1)).expect("len after remove"), None);
        store.remove(&id(1)).expect("second remove is a no-op");
    }

    #[test]
    fn duplicate_create_is_rejected() {
        let dir = TempDir::new().expect("tempdir");
        let store = DirBlobStore::open(dir.path(), 1 << 20).expect("open");

        store.create(&id(7)).expect("first create");
        let err = store.create(&id(7)).expect_err("second create");
        assert!(matches!(err, PoolError::DuplicateEntry(_)));
    }

    #[test]
    fn foreign_files_are_ignored_in_listing() {
        let dir = TempDir::new().expect("tempdir");
        let store = DirBlobStore::open(dir.path(), 1 << 20).expect("open");
        store.create(&id(3)).expect("create");
        fs::write(dir.path().join("data").join("README"), b"not a replica").expect("write");

        assert_eq!(store.list().expect("list"), vec![id(3)]);
    }

    #[test]
    fn free_space_reflects_stored_bytes() {
        let dir = TempDir::new().expect("tempdir");
        let store = DirBlobStore::open(dir.path(), 100).expect("open");
        let path = store.create(&id(4)).expect("create");
        let mut file = OpenOptions::new().write(true).open(path).expect("open blob");
        file.write_all(&[0_u8; 30]).expect("fill");
        drop(file);

        assert_eq!(store.total_space(), 100);
        assert_eq!(store.free_space(), 70);
    }

    #[test]
    fn health_check_probes_the_data_directory() {
        let dir = TempDir::new().expect("tempdir");
        let store = DirBlobStore::open(dir.path(), 1 << 20).expect("open");
        assert!(store.health_check());
    }

    #[test]
    fn hash_blob_is_stable_for_known_content() {
        let dir = TempDir::new().expect("tempdir");
        let store = DirBlobStore::open(dir.path(), 1 << 20).expect("open");
        let path = store.create(&id(5)).expect("create");
        fs::write(&path, b"poolfs").expect("write");

        let first = hash_blob(&path).expect("hash");
        let second = hash_blob(&path).expect("hash again");
        assert_eq!(first, second);
        assert_eq!(first.algorithm, ChecksumKind::Blake3);
        assert_eq!(first.value.len(), 64);
    }
}
