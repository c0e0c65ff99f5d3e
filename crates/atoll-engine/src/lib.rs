//! Runtime side of atoll: transport seam, event dispatch and the node facade.
//!
//! A transport implements [`Channel`] and reports membership changes to a
//! [`MembershipListener`]. The [`EventDispatcher`] is that listener: it
//! queues callbacks without blocking the transport and applies them, one at
//! a time and in delivery order, to the partition table and the topology
//! history. [`ClusterNode`] wires everything together and is what
//! applications hold.
//!
//! [`LocalNetwork`] is an in-process transport used by the daemon and by
//! tests.

pub mod dispatcher;
mod error;
mod local;
mod node;
mod transport;


use atoll_types::{Event, NodeId};
use bytes::Bytes;

pub use dispatcher::{DispatcherHandle, DispatcherOptions, DispatcherState, EventDispatcher};
pub use error::EngineError;
pub use local::{LocalChannel, LocalNetwork};
pub use node::{ClusterNode, ClusterNodeBuilder};
pub use transport::{Channel, ConnectRequest, Destination, MembershipListener};

/// An application message received from another member.
#[derive(Clone, Debug)]
pub struct ClusterMessage {
    /// Sender.
    pub from: NodeId,
    /// Opaque payload.
    pub payload: Bytes,
}
impl Event for ClusterMessage {}
