//! Membership views.
//!
//! A [`View`] is an immutable, ordered snapshot of the cluster's members,
//! identified by a totally ordered [`ViewId`]. Element 0 is the coordinator.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{HlcTimestamp, NodeId, NodeIdentity};

/// Identifier of a membership view: creator plus hybrid-logical timestamp.
///
/// Orders by timestamp first, then by creator id, so two views minted at the
/// same logical instant by different creators still compare totally.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ViewId {
    /// When the view was created.
    pub timestamp: HlcTimestamp,
    /// The node that created the view (normally the coordinator).
    pub creator: NodeId,
}

impl ViewId {
    /// Length of the sortable key encoding.
    pub const KEY_LEN: usize = 24;

    /// The id of the empty sentinel view.
    pub const EMPTY: ViewId = ViewId {
        timestamp: HlcTimestamp::ZERO,
        creator: NodeId::NIL,
    };

    /// Create a view id.
    pub fn new(timestamp: HlcTimestamp, creator: NodeId) -> Self {
        Self { timestamp, creator }
    }

    /// Encode as `timestamp (8 bytes BE) ++ creator (16 bytes)`.
    ///
    /// Big-endian keeps byte order equal to `ViewId` order.
    pub fn to_key(&self) -> [u8; Self::KEY_LEN] {
        let mut key = [0u8; Self::KEY_LEN];
        key[..8].copy_from_slice(&self.timestamp.as_u64().to_be_bytes());
        key[8..].copy_from_slice(self.creator.as_bytes());
        key
    }

    /// Decode a key produced by [`to_key`](Self::to_key).
    pub fn from_key(key: &[u8]) -> Option<Self> {
        if key.len() != Self::KEY_LEN {
            return None;
        }
        let ts: [u8; 8] = key[..8].try_into().ok()?;
        let creator: [u8; 16] = key[8..].try_into().ok()?;
        Some(Self {
            timestamp: HlcTimestamp::from_u64(u64::from_be_bytes(ts)),
            creator: NodeId::from(creator),
        })
    }
}

impl fmt::Display for ViewId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.creator.short(), self.timestamp)
    }
}

impl fmt::Debug for ViewId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ViewId({self})")
    }
}

/// An ordered snapshot of cluster membership.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RawView")]
pub struct View {
    id: ViewId,
    members: Vec<NodeIdentity>,
}

/// Wire form of a [`View`]; decoded views go through [`View::new`].
#[derive(Serialize, Deserialize)]
struct RawView {
    id: ViewId,
    members: Vec<NodeIdentity>,
}

impl From<RawView> for View {
    fn from(raw: RawView) -> Self {
        View::new(raw.id, raw.members)
    }
}

impl View {
    /// Build a view, dropping duplicate members (first occurrence wins).
    pub fn new(id: ViewId, members: Vec<NodeIdentity>) -> Self {
        let mut seen = HashSet::with_capacity(members.len());
        let members = members
            .into_iter()
            .filter(|m| seen.insert(m.id))
            .collect();
        Self { id, members }
    }

    /// The sentinel "no view accepted yet".
    pub fn empty() -> Self {
        Self {
            id: ViewId::EMPTY,
            members: Vec::new(),
        }
    }

    /// Whether this is the empty sentinel view.
    pub fn is_empty_view(&self) -> bool {
        self.id == ViewId::EMPTY && self.members.is_empty()
    }

    /// The view identifier.
    pub fn id(&self) -> ViewId {
        self.id
    }

    /// Members in order; element 0 is the coordinator.
    pub fn members(&self) -> &[NodeIdentity] {
        &self.members
    }

    /// The coordinator, if the view has any members.
    pub fn coordinator(&self) -> Option<&NodeIdentity> {
        self.members.first()
    }

    /// Number of members.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Whether the view has no members.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Whether a node is a member of this view.
    pub fn contains(&self, id: &NodeId) -> bool {
        self.members.iter().any(|m| &m.id == id)
    }

    /// Look up a member by id.
    pub fn member(&self, id: &NodeId) -> Option<&NodeIdentity> {
        self.members.iter().find(|m| &m.id == id)
    }

    /// Member ids in view order.
    pub fn member_ids(&self) -> Vec<NodeId> {
        self.members.iter().map(|m| m.id).collect()
    }

    /// Compute which members joined and left between `old` and `new`.
    pub fn diff(old: &View, new: &View) -> ViewDiff {
        let old_ids: HashSet<NodeId> = old.members.iter().map(|m| m.id).collect();
        let new_ids: HashSet<NodeId> = new.members.iter().map(|m| m.id).collect();
        ViewDiff {
            joined: new
                .members
                .iter()
                .filter(|m| !old_ids.contains(&m.id))
                .cloned()
                .collect(),
            left: old
                .members
                .iter()
                .filter(|m| !new_ids.contains(&m.id))
                .cloned()
                .collect(),
        }
    }
}

/// Symmetric difference between two views.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ViewDiff {
    /// Members present in the new view but not the old one.
    pub joined: Vec<NodeIdentity>,
    /// Members present in the old view but not the new one.
    pub left: Vec<NodeIdentity>,
}

impl ViewDiff {
    /// Whether membership is unchanged.
    pub fn is_empty(&self) -> bool {
        self.joined.is_empty() && self.left.is_empty()
    }

    /// Ids of joined members.
    pub fn joined_ids(&self) -> Vec<NodeId> {
        self.joined.iter().map(|m| m.id).collect()
    }

    /// Ids of departed members.
    pub fn left_ids(&self) -> Vec<NodeId> {
        self.left.iter().map(|m| m.id).collect()
    }
}
