//! Pluggable policy deciding what a repaired replica becomes.

use pfs_types::{AccessLatency, EntryState, RetentionPolicy, StickyRecord, StorageInfo};

/// Maps a namespace descriptor to the state and pins a repaired replica
/// should end up with. Consulted by the reconciler when it promotes a
/// replica out of a transfer state.
pub trait ReplicaStatePolicy: Send + Sync {
    /// Target resident state, `Cached` or `Precious`.
    fn target_state(&self, info: &StorageInfo) -> EntryState;

    /// Pins to apply before the replica reaches its target state.
    fn sticky_records(&self, info: &StorageInfo) -> Vec<StickyRecord>;
}

/// Default policy:
/// custodial files become precious (they still owe a copy to the backing
/// tier), everything else is cached; online files get a system-owned pin
/// so eviction cannot undercut the promised latency.
#[derive(Debug, Default)]
pub struct DefaultStatePolicy;

impl ReplicaStatePolicy for DefaultStatePolicy {
    fn target_state(&self, info: &StorageInfo) -> EntryState {
        match info.retention_policy {
            RetentionPolicy::Custodial => EntryState::Precious,
            RetentionPolicy::Replica => EntryState::Cached,
        }
    }

    fn sticky_records(&self, info: &StorageInfo) -> Vec<StickyRecord> {
        match info.access_latency {
            AccessLatency::Online => vec![StickyRecord::forever("system")],
            AccessLatency::Nearline => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(latency: AccessLatency, retention: RetentionPolicy) -> StorageInfo {
        StorageInfo::new(1, latency, retention, "tape:archive")
    }

    #[test]
    fn custodial_files_become_precious() {
        let policy = DefaultStatePolicy;
        assert_eq!(
            policy.target_state(&info(AccessLatency::Nearline, RetentionPolicy::Custodial)),
            EntryState::Precious
        );
        assert_eq!(
            policy.target_state(&info(AccessLatency::Online, RetentionPolicy::Replica)),
            EntryState::Cached
        );
    }

    #[test]
    fn online_files_get_a_system_pin() {
        let policy = DefaultStatePolicy;
        assert_eq!(
            policy.sticky_records(&info(AccessLatency::Online, RetentionPolicy::Replica)),
            vec![StickyRecord::forever("system")]
        );
        assert!(policy
            .sticky_records(&info(AccessLatency::Nearline, RetentionPolicy::Custodial))
            .is_empty());
    }
}
