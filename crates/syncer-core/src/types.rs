//! Core data model for the service-registry synchronizer
//!
//! All types here are serialized with postcard, both on the wire and in the
//! local state store. Field order matters for canonical encoding.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

/// 32-byte fixed-size array used for checksums.
pub type Bytes32 = [u8; 32];

// =============================================================================
// IDENTITY TYPES (newtypes for type safety)
// =============================================================================

/// Identifier of a registry cluster (one service center deployment)
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClusterId(pub String);

/// Identifier of a synchronizer process, unique within the gossip overlay
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub String);

/// Identifier of a service inside its owning cluster
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceId(pub String);

macro_rules! string_id {
    ($name:ident) => {
        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

string_id!(ClusterId);
string_id!(NodeId);
string_id!(ServiceId);

/// Current wall-clock time in unix millis
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// =============================================================================
// SERVICE RECORDS
// =============================================================================

/// One registered instance of a service
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct Instance {
    pub instance_id: String,
    /// MUST be sorted and deduped before checksumming
    pub endpoints: Vec<String>,
}

/// A service's registration data plus its instances.
///
/// `provenance` names the cluster that owns the record. Only that cluster
/// ever updates it; every other cluster holds a read-only replica.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceRecord {
    pub service_id: ServiceId,
    pub provenance: ClusterId,
    /// Export version at which the record last changed
    pub version: u64,
    /// Last modification time (unix millis)
    pub modified_at: u64,
    pub attributes: BTreeMap<String, String>,
    /// MUST be sorted by instance_id before checksumming
    pub instances: Vec<Instance>,
}

impl ServiceRecord {
    /// Create an unversioned record owned by `provenance`
    pub fn new(service_id: impl Into<String>, provenance: ClusterId) -> Self {
        Self {
            service_id: ServiceId::new(service_id),
            provenance,
            version: 0,
            modified_at: 0,
            attributes: BTreeMap::new(),
            instances: Vec::new(),
        }
    }

    /// Builder-style attribute setter
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Builder-style instance setter
    pub fn with_instance(mut self, instance_id: impl Into<String>, endpoints: Vec<String>) -> Self {
        self.instances.push(Instance {
            instance_id: instance_id.into(),
            endpoints,
        });
        self
    }

    /// Namespace key of this record: (service id, provenance)
    pub fn key(&self) -> ReplicaKey {
        ReplicaKey {
            service_id: self.service_id.clone(),
            provenance: self.provenance.clone(),
        }
    }

    /// Whether two records carry the same registration content,
    /// ignoring version and modification time.
    pub fn same_content(&self, other: &ServiceRecord) -> bool {
        self.service_id == other.service_id
            && self.provenance == other.provenance
            && self.attributes == other.attributes
            && self.instances == other.instances
    }
}

/// Key of one record namespace. Records from different owners never collide.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReplicaKey {
    pub service_id: ServiceId,
    pub provenance: ClusterId,
}

impl fmt::Display for ReplicaKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.service_id, self.provenance)
    }
}

// =============================================================================
// SNAPSHOTS
// =============================================================================

/// Whether a snapshot is the owner's complete state or a delta
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum SnapshotKind {
    /// Complete state; replicas not listed have been removed by the owner
    Full,
    /// Only changes after `since`
    Delta { since: u64 },
}

/// Removal of a service by its owner
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct Tombstone {
    pub service_id: ServiceId,
    /// Export version at which the service disappeared
    pub version: u64,
}

/// Unchecksummed snapshot content (hashed to produce the checksum)
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SnapshotBody {
    pub cluster: ClusterId,
    pub version: u64,
    pub kind: SnapshotKind,
    /// MUST be sorted by service_id
    pub records: Vec<ServiceRecord>,
    /// MUST be sorted by service_id
    pub removed: Vec<Tombstone>,
}

/// Point-in-time export of one cluster's records. Immutable once produced.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Snapshot {
    pub body: SnapshotBody,
    /// BLAKE3 over the canonical bytes of `body`
    pub checksum: Bytes32,
}

impl Snapshot {
    pub fn cluster(&self) -> &ClusterId {
        &self.body.cluster
    }

    pub fn version(&self) -> u64 {
        self.body.version
    }

    pub fn kind(&self) -> SnapshotKind {
        self.body.kind
    }

    pub fn records(&self) -> &[ServiceRecord] {
        &self.body.records
    }

    pub fn removed(&self) -> &[Tombstone] {
        &self.body.removed
    }

    pub fn is_full(&self) -> bool {
        matches!(self.body.kind, SnapshotKind::Full)
    }
}

// =============================================================================
// CHECKPOINTS AND EVENTS
// =============================================================================

/// Durable marker of the last snapshot version merged from a peer cluster
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Checkpoint {
    pub peer: ClusterId,
    pub last_merged_version: u64,
    /// Unix millis of the last successful merge (0 = never)
    pub last_merge_timestamp: u64,
}

impl Checkpoint {
    /// Checkpoint for a peer we have never merged from
    pub fn empty(peer: ClusterId) -> Self {
        Self {
            peer,
            last_merged_version: 0,
            last_merge_timestamp: 0,
        }
    }
}

/// Gossip notification that a cluster minted a new export version
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct SyncEvent {
    pub cluster: ClusterId,
    pub version: u64,
}

/// Gossip user-event name carrying a postcard-encoded [`SyncEvent`]
pub const SYNC_EVENT_NAME: &str = "sync";

// =============================================================================
// MEMBERSHIP
// =============================================================================

/// Liveness of a synchronizer node as seen by the gossip overlay
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum MemberState {
    Alive,
    Failed,
    Left,
}

impl fmt::Display for MemberState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemberState::Alive => write!(f, "alive"),
            MemberState::Failed => write!(f, "failed"),
            MemberState::Left => write!(f, "left"),
        }
    }
}

/// A synchronizer process participating in the gossip overlay
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Node {
    pub id: NodeId,
    /// Advertised pull RPC address
    pub rpc_addr: SocketAddr,
    /// Cluster this node synchronizes on behalf of
    pub cluster: ClusterId,
    /// Scope tags used to decide which peers are sync partners
    pub tags: BTreeSet<String>,
    pub state: MemberState,
}

impl Node {
    pub fn is_alive(&self) -> bool {
        self.state == MemberState::Alive
    }

    /// Whether this node falls inside a sync scope. An empty scope admits everyone.
    pub fn in_scope(&self, scope: &BTreeSet<String>) -> bool {
        scope.is_empty() || self.tags.iter().any(|tag| scope.contains(tag))
    }
}
