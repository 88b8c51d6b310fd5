#![forbid(unsafe_code)]
//! Core value types for the poolfs replica repository.
//!
//! Everything here is a plain value: identifiers, lifecycle states, sticky
//! pins, namespace-side storage descriptors, and space snapshots. The types
//! carry no behavior beyond validation and trivial derived queries, so that
//! every other crate can depend on this one without dragging in locks or
//! I/O.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Number of raw bytes in a [`ReplicaId`] (rendered as twice as many hex
/// nibbles).
pub const REPLICA_ID_BYTES: usize = 12;

/// Sticky expiration value meaning "never expires".
pub const STICKY_FOREVER: i64 = -1;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdParseError {
    #[error("replica id must be {expected} hex digits, got {actual}")]
    BadLength { expected: usize, actual: usize },
    #[error("replica id contains a non-hex digit at position {position}")]
    BadDigit { position: usize },
}

/// Opaque, globally-unique replica identifier.
///
/// A fixed-width token, totally ordered by byte value, rendered as 24
/// lowercase hex digits. One replica id names one file in the namespace;
/// it is the key for every map in the repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ReplicaId([u8; REPLICA_ID_BYTES]);

impl ReplicaId {
    #[must_use]
    pub fn from_bytes(bytes: [u8; REPLICA_ID_BYTES]) -> Self {
        Self(bytes)
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; REPLICA_ID_BYTES] {
        &self.0
    }

    /// Parse from a 24-digit hex string.
    pub fn from_hex(text: &str) -> Result<Self, IdParseError> {
        let digits = text.as_bytes();
        if digits.len() != 2 * REPLICA_ID_BYTES {
            return Err(IdParseError::BadLength {
                expected: 2 * REPLICA_ID_BYTES,
                actual: digits.len(),
            });
        }

        let mut bytes = [0_u8; REPLICA_ID_BYTES];
        for (i, pair) in digits.chunks_exact(2).enumerate() {
            let hi = hex_value(pair[0]).ok_or(IdParseError::BadDigit { position: 2 * i })?;
            let lo = hex_value(pair[1]).ok_or(IdParseError::BadDigit {
                position: 2 * i + 1,
            })?;
            bytes[i] = (hi << 4) | lo;
        }
        Ok(Self(bytes))
    }
}

fn hex_value(digit: u8) -> Option<u8> {
    match digit {
        b'0'..=b'9' => Some(digit - b'0'),
        b'a'..=b'f' => Some(digit - b'a' + 10),
        b'A'..=b'F' => Some(digit - b'A' + 10),
        _ => None,
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl FromStr for ReplicaId {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl Serialize for ReplicaId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ReplicaId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Self::from_hex(&text).map_err(D::Error::custom)
    }
}

/// Lifecycle state of one replica.
///
/// `New` is the just-created placeholder, the three `From*` states are
/// inbound transfers (client upload, restore from the backing store, and
/// pool-to-pool copy), `Cached`/`Precious` are the resident states,
/// `Broken` is quarantine after a consistency failure, and
/// `Removed`/`Destroyed` are the terminal states of deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryState {
    New,
    FromClient,
    FromStore,
    FromPool,
    Cached,
    Precious,
    Broken,
    Removed,
    Destroyed,
}

impl EntryState {
    /// Whether the replica holds complete, servable data.
    #[must_use]
    pub fn is_resident(self) -> bool {
        matches!(self, Self::Cached | Self::Precious)
    }

    /// Whether the replica is currently receiving data.
    #[must_use]
    pub fn is_transfer(self) -> bool {
        matches!(self, Self::FromClient | Self::FromStore | Self::FromPool)
    }

    /// Whether the replica has been (or is being) deleted.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Removed | Self::Destroyed)
    }
}

impl fmt::Display for EntryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::New => "new",
            Self::FromClient => "from_client",
            Self::FromStore => "from_store",
            Self::FromPool => "from_pool",
            Self::Cached => "cached",
            Self::Precious => "precious",
            Self::Broken => "broken",
            Self::Removed => "removed",
            Self::Destroyed => "destroyed",
        };
        f.write_str(name)
    }
}

/// A named, optionally time-bounded pin preventing eviction.
///
/// Many owners may pin the same replica; records are value-equal by
/// `(owner, expire_at)`. `expire_at` is epoch milliseconds, or
/// [`STICKY_FOREVER`] for a pin that never expires.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StickyRecord {
    pub owner: String,
    pub expire_at: i64,
}

impl StickyRecord {
    #[must_use]
    pub fn new(owner: impl Into<String>, expire_at: i64) -> Self {
        Self {
            owner: owner.into(),
            expire_at,
        }
    }

    /// Pin that never expires.
    #[must_use]
    pub fn forever(owner: impl Into<String>) -> Self {
        Self::new(owner, STICKY_FOREVER)
    }

    /// Whether the pin is still in force at time `t` (epoch millis).
    #[must_use]
    pub fn is_valid_at(&self, t: i64) -> bool {
        self.expire_at == STICKY_FOREVER || self.expire_at > t
    }
}

/// Access latency the namespace promises for a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessLatency {
    /// A replica must stay on disk.
    Online,
    /// The file may live on the backing tier only.
    Nearline,
}

/// Retention policy the namespace records for a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionPolicy {
    /// The file must eventually reach the backing tier.
    Custodial,
    /// Disk copies are sufficient.
    Replica,
}

/// Content checksum, hex-encoded.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Checksum {
    pub algorithm: ChecksumKind,
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChecksumKind {
    Blake3,
}

/// Cached copy of the namespace-side metadata for one file.
///
/// `file_size` is the size the namespace has on record; during an upload it
/// may still be zero while the local replica already has bytes on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageInfo {
    pub file_size: u64,
    pub access_latency: AccessLatency,
    pub retention_policy: RetentionPolicy,
    pub storage_class: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<Checksum>,
}

impl StorageInfo {
    #[must_use]
    pub fn new(
        file_size: u64,
        access_latency: AccessLatency,
        retention_policy: RetentionPolicy,
        storage_class: impl Into<String>,
    ) -> Self {
        Self {
            file_size,
            access_latency,
            retention_policy,
            storage_class: storage_class.into(),
            checksum: None,
        }
    }

    /// Copy of this descriptor with the declared file size replaced.
    #[must_use]
    pub fn with_file_size(&self, file_size: u64) -> Self {
        Self {
            file_size,
            ..self.clone()
        }
    }
}

/// Point-in-time view of the pool's space accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpaceRecord {
    pub total: u64,
    pub free: u64,
    pub precious: u64,
    pub removable: u64,
    /// Age in seconds of the least-recently-used still-cached replica.
    pub lru_seconds: u64,
    /// Space the pool aims to keep readily reclaimable.
    pub gap: u64,
}

/// Current wall-clock time as epoch milliseconds.
///
/// Saturates to zero for clocks set before the epoch rather than failing;
/// timestamps in this crate are advisory ordering hints, not durability
/// tokens.
#[must_use]
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
}
