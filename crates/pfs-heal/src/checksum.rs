//! Optional content-checksum verification.

use pfs_error::{PoolError, Result};
use pfs_store::{hash_blob, BlobStore};
use pfs_types::{Checksum, ChecksumKind, ReplicaId};

/// Checksum policy seam. When configured on the reconciler, replica
/// content is hashed during repair and compared against the expected
/// value from the namespace descriptor.
pub trait ChecksumModule: Send + Sync {
    /// Hash the blob and, when `expected` is given, verify it. A
    /// mismatch is a hard consistency failure.
    fn verify_or_compute(
        &self,
        id: &ReplicaId,
        blob: &dyn BlobStore,
        expected: Option<&Checksum>,
    ) -> Result<Checksum>;
}

/// Blake3-based checksum module.
#[derive(Debug, Default)]
pub struct Blake3ChecksumModule;

impl ChecksumModule for Blake3ChecksumModule {
    fn verify_or_compute(
        &self,
        id: &ReplicaId,
        blob: &dyn BlobStore,
        expected: Option<&Checksum>,
    ) -> Result<Checksum> {
        let computed = hash_blob(&blob.path(id))?;
        if let Some(expected) = expected {
            if expected.algorithm != ChecksumKind::Blake3 {
                return Err(PoolError::InvalidArgument(format!(
                    "unsupported checksum algorithm for {id}: {:?}",
                    expected.algorithm
                )));
            }
            if !expected.value.eq_ignore_ascii_case(&computed.value) {
                return Err(PoolError::CorruptReplica {
                    id: id.to_string(),
                    detail: format!(
                        "checksum mismatch: expected {}, computed {}",
                        expected.value, computed.value
                    ),
                });
            }
        }
        Ok(computed)
    }
}
