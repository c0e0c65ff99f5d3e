//! The seam between the engine and a group-communication transport.
//!
//! A transport delivers membership notifications through a
//! [`MembershipListener`] and exposes the few primitives the engine needs
//! through [`Channel`]. The engine never depends on a concrete transport;
//! [`LocalNetwork`](crate::LocalNetwork) is the in-process implementation.

use std::sync::Arc;

use atoll_cluster::{JoinAuthenticator, JoinToken, MembershipPolicy};
use atoll_types::{HlcTimestamp, NodeId, NodeIdentity, View};
use bytes::Bytes;

use crate::EngineError;

/// Where a message goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    /// Every other member of the current view.
    Broadcast,
    /// A single member.
    Node(NodeId),
}

/// Everything a transport needs to admit a node into a cluster.
#[derive(Clone)]
pub struct ConnectRequest {
    /// Cluster to join.
    pub cluster_name: String,
    /// Identity of the joining node.
    pub identity: NodeIdentity,
    /// Join token presented to the coordinator.
    pub token: JoinToken,
    /// Verifies other joiners' tokens while this node is coordinator.
    pub authenticator: JoinAuthenticator,
    /// Ordering strategy installed into the transport.
    pub policy: Arc<dyn MembershipPolicy>,
}

impl std::fmt::Debug for ConnectRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectRequest")
            .field("cluster_name", &self.cluster_name)
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}

/// Callbacks from the transport.
///
/// Called on transport threads; implementations must not block.
pub trait MembershipListener: Send + Sync {
    /// A new view was installed.
    fn on_view_accepted(&self, view: View);

    /// The local node completed its join.
    fn on_joined(&self);

    /// The local node left the group.
    fn on_left(&self);

    /// The channel was closed.
    fn on_channel_closed(&self);

    /// Produce this node's topology snapshot for a joiner.
    fn get_state(&self) -> Option<Vec<u8>>;

    /// Receive the coordinator's topology snapshot.
    fn set_state(&self, state: Vec<u8>);

    /// An application message from another member.
    fn on_message(&self, _from: NodeId, _payload: Bytes) {}
}

/// Operations the engine performs on the transport.
#[async_trait::async_trait]
pub trait Channel: Send + Sync {
    /// Join the cluster named in `request`.
    ///
    /// Fails with [`EngineError::JoinRejected`] if the coordinator refuses
    /// the token.
    async fn connect(
        &self,
        request: ConnectRequest,
        listener: Arc<dyn MembershipListener>,
    ) -> Result<(), EngineError>;

    /// Send an application message.
    async fn send(&self, destination: Destination, payload: Bytes) -> Result<(), EngineError>;

    /// The local node's address, once connected.
    fn local_address(&self) -> Option<NodeId>;

    /// Ask the coordinator for its topology snapshot.
    ///
    /// The snapshot arrives through [`MembershipListener::set_state`].
    async fn request_state(&self) -> Result<(), EngineError>;

    /// Leave the group and release the channel.
    async fn close(&self) -> Result<(), EngineError>;

    /// Fold a timestamp this node already knows about into the transport's
    /// view clock, so later views order after it.
    fn witness(&self, _timestamp: HlcTimestamp) {}
}
