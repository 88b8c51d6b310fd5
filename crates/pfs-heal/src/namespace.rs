//! Boundary to the external namespace authority.

use pfs_types::{AccessLatency, ReplicaId, RetentionPolicy, StorageInfo};

/// Outcome of one namespace call, matched exhaustively by the healing
/// logic: "not found" and "timeout" map to local repair actions and are
/// never folded into a generic error.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use]
pub enum NamespaceOutcome<T> {
    Found(T),
    NotFound,
    Timeout,
    Other(String),
}

/// Attribute changes to push to the namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttributeUpdate {
    pub size: Option<u64>,
    pub access_latency: Option<AccessLatency>,
    pub retention_policy: Option<RetentionPolicy>,
}

impl AttributeUpdate {
    #[must_use]
    pub fn size(size: u64) -> Self {
        Self {
            size: Some(size),
            ..Self::default()
        }
    }
}

/// The cluster-wide service of record for file existence, size, and
/// placement. The repository only ever talks to it through this trait;
/// the wire protocol lives elsewhere.
pub trait NamespaceClient: Send + Sync {
    fn fetch_storage_info(&self, id: &ReplicaId) -> NamespaceOutcome<StorageInfo>;

    /// Record that this pool holds a replica of `id`.
    fn register_location(&self, id: &ReplicaId) -> NamespaceOutcome<()>;

    /// Record that this pool no longer holds a replica of `id`.
    fn clear_location(&self, id: &ReplicaId) -> NamespaceOutcome<()>;

    fn update_attributes(&self, id: &ReplicaId, update: AttributeUpdate) -> NamespaceOutcome<()>;
}
