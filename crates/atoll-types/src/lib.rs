//! Shared types and identifiers for atoll.
//!
//! This crate defines the core types used across the atoll workspace:
//! node identity ([`NodeId`], [`NodeIdentity`], [`NodeRole`]),
//! membership views ([`View`], [`ViewId`], [`ViewDiff`]),
//! the hybrid logical clock ([`HybridClock`], [`HlcTimestamp`]),
//! the persisted cluster shape ([`ClusterShape`]) and the intra-node
//! event bus ([`events`]).

use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

mod clock;
pub mod events;
mod view;

pub use clock::{HlcTimestamp, HybridClock};
pub use events::{Event, EventBus, EventReceiver, MembershipEvent, PartitionsChanged};
pub use view::{View, ViewDiff, ViewId};

// ---------------------------------------------------------------------------
// Node identifier
// ---------------------------------------------------------------------------

/// Opaque 128-bit identifier for a cluster node.
///
/// Generated once per process instance and persisted so that restarts reuse
/// the same id. Ordering is lexicographic over the raw bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct NodeId([u8; 16]);

impl NodeId {
    /// The all-zero id, used as the creator of the empty sentinel view.
    pub const NIL: NodeId = NodeId([0u8; 16]);

    /// Generate a fresh random id.
    pub fn random() -> Self {
        Self(rand::random())
    }

    /// Derive an id by hashing arbitrary data with BLAKE3 (truncated to 128 bits).
    pub fn from_data(data: &[u8]) -> Self {
        let hash = blake3::hash(data);
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&hash.as_bytes()[..16]);
        Self(bytes)
    }

    /// Return the raw 16-byte representation.
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Stable 32-bit hash of this id, identical on every node.
    ///
    /// Used as the node half of the rendezvous weight input.
    pub fn hash32(&self) -> u32 {
        let hash = blake3::hash(&self.0);
        let bytes: [u8; 4] = [
            hash.as_bytes()[0],
            hash.as_bytes()[1],
            hash.as_bytes()[2],
            hash.as_bytes()[3],
        ];
        u32::from_le_bytes(bytes)
    }

    /// First eight hex characters, for compact log output.
    pub fn short(&self) -> String {
        self.0[..4].iter().map(|b| format!("{b:02x}")).collect()
    }
}

impl From<[u8; 16]> for NodeId {
    fn from(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for NodeId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.short())
    }
}

// ---------------------------------------------------------------------------
// Node identity
// ---------------------------------------------------------------------------

/// Attribute key under which the numeric power weight is stored.
pub const POWER_WEIGHT_ATTR: &str = "power";

/// Role a node plays in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum NodeRole {
    /// A worker that owns partitions and may be elected coordinator.
    #[default]
    Worker,
    /// A client-only member: sees views but is ranked after workers.
    Client,
}

impl NodeRole {
    /// Rank used when ordering members: higher ranks sort first.
    pub fn rank(self) -> u8 {
        match self {
            NodeRole::Worker => 1,
            NodeRole::Client => 0,
        }
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeRole::Worker => f.write_str("worker"),
            NodeRole::Client => f.write_str("client"),
        }
    }
}

/// Identity of a cluster member: a stable id plus descriptive attributes.
///
/// Two identities are equal (and hash equally) when their ids are equal;
/// the descriptive fields may be refreshed across restarts without changing
/// who the node is.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeIdentity {
    /// Stable unique identifier.
    pub id: NodeId,
    /// Host name the process runs on.
    pub host: String,
    /// Process start time, unix milliseconds.
    pub started_at: u64,
    /// Role of the node.
    pub role: NodeRole,
    /// Arbitrary descriptive attributes (e.g. `power`, `rack`).
    pub attributes: BTreeMap<String, Vec<u8>>,
}

impl NodeIdentity {
    /// Create an identity with no attributes.
    pub fn new(id: NodeId, host: impl Into<String>, role: NodeRole) -> Self {
        Self {
            id,
            host: host.into(),
            started_at: 0,
            role,
            attributes: BTreeMap::new(),
        }
    }

    /// Set the process start time.
    pub fn with_started_at(mut self, started_at: u64) -> Self {
        self.started_at = started_at;
        self
    }

    /// Set the power weight attribute.
    pub fn with_power_weight(mut self, weight: f64) -> Self {
        self.attributes
            .insert(POWER_WEIGHT_ATTR.to_string(), weight.to_string().into_bytes());
        self
    }

    /// Set an arbitrary attribute.
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Numeric power weight; missing or unparseable values read as `0.0`.
    pub fn power_weight(&self) -> f64 {
        self.attribute_str(POWER_WEIGHT_ATTR)
            .and_then(|s| s.trim().parse::<f64>().ok())
            .filter(|w| w.is_finite())
            .unwrap_or(0.0)
    }

    /// Return an attribute value as UTF-8, if present and valid.
    pub fn attribute_str(&self, key: &str) -> Option<&str> {
        self.attributes
            .get(key)
            .and_then(|v| std::str::from_utf8(v).ok())
    }
}

impl PartialEq for NodeIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for NodeIdentity {}

impl Hash for NodeIdentity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id.short(), self.host)
    }
}

// ---------------------------------------------------------------------------
// Cluster shape
// ---------------------------------------------------------------------------

/// The parameters that must agree across every member of a cluster.
///
/// Persisted on first start; a node refuses to start if its configuration
/// disagrees with the persisted shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterShape {
    /// Name of the cluster.
    pub cluster_name: String,
    /// Fixed number of logical partitions.
    pub partition_count: u32,
    /// Number of backup replicas per partition.
    pub backup_count: u32,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
