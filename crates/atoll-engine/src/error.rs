//! Error types for the engine.

use std::time::Duration;

use atoll_cluster::JoinRejection;
use atoll_types::NodeId;

/// Errors that can occur while running a cluster node.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Configuration, placement or topology error.
    #[error("cluster error: {0}")]
    Cluster(#[from] atoll_cluster::ClusterError),

    /// Failed to access the metadata store.
    #[error("metadata error: {0}")]
    Meta(#[from] atoll_meta::MetaError),

    /// The coordinator refused our join token.
    #[error("join rejected: {0}")]
    JoinRejected(JoinRejection),

    /// The coordinator's topology snapshot did not arrive in time.
    #[error("timed out after {0:?} waiting to join")]
    JoinTimeout(Duration),

    /// The channel has not been connected.
    #[error("not connected")]
    NotConnected,

    /// The transport channel closed while joining.
    #[error("channel closed")]
    ChannelClosed,

    /// The dispatcher task has stopped.
    #[error("service stopped")]
    ServiceStopped,

    /// A destination node is not reachable from this node.
    #[error("node unreachable: {0}")]
    Unreachable(NodeId),

    /// Any other transport-level failure.
    #[error("transport error: {0}")]
    Transport(String),
}
