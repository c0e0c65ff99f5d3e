//! Type-safe event bus for intra-node pub/sub.
//!
//! The [`EventBus`] lets the dispatcher publish typed notifications
//! ([`MembershipEvent`], [`PartitionsChanged`]) and lets any component
//! subscribe to just the event types it cares about.
//!
//! Internally the bus keeps a `HashMap<TypeId, Box<dyn Any>>` where each
//! value is a `tokio::sync::broadcast::Sender<E>`. Channels are created
//! lazily on the first `subscribe()` for a given type.
//!
//! ```rust
//! use atoll_types::events::{EventBus, MembershipEvent};
//! use atoll_types::NodeId;
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let bus = EventBus::new();
//! let mut rx = bus.subscribe::<MembershipEvent>();
//!
//! bus.emit(MembershipEvent::Left { node_id: NodeId::from([1u8; 16]) });
//!
//! let event = rx.recv().await.unwrap();
//! assert!(matches!(event, MembershipEvent::Left { .. }));
//! # });
//! ```

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;
use tracing::warn;

use crate::{NodeId, View, ViewId};

/// Per-type broadcast buffer.
const DEFAULT_CHANNEL_CAPACITY: usize = 256;

// ---------------------------------------------------------------------------
// Event trait
// ---------------------------------------------------------------------------

/// Marker trait for all events that can travel through the [`EventBus`].
pub trait Event: Any + Send + Sync + Clone + std::fmt::Debug + 'static {}

// ---------------------------------------------------------------------------
// Event types
// ---------------------------------------------------------------------------

/// Membership notifications published by the dispatcher.
#[derive(Clone, Debug)]
pub enum MembershipEvent {
    /// A new view was accepted and applied to the partition table.
    ViewChanged {
        /// The accepted view.
        view: View,
        /// Id of the view it replaced.
        previous: ViewId,
        /// Members that joined with this view.
        joined: Vec<NodeId>,
        /// Members that left with this view.
        left: Vec<NodeId>,
    },
    /// The local node completed its join.
    Joined {
        /// The local node.
        node_id: NodeId,
    },
    /// The local node left the cluster.
    Left {
        /// The local node.
        node_id: NodeId,
    },
    /// The underlying transport channel was closed.
    ChannelClosed {
        /// The local node.
        node_id: NodeId,
    },
}
impl Event for MembershipEvent {}

/// The partition table was recomputed for a new view.
#[derive(Clone, Debug)]
pub struct PartitionsChanged {
    /// View the table now reflects.
    pub view_id: ViewId,
    /// View the table reflected before.
    pub previous_view_id: ViewId,
    /// Partitions whose owner list changed, ascending.
    pub changed: Vec<u32>,
}
impl Event for PartitionsChanged {}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

struct EventBusInner {
    /// One `broadcast::Sender<E>` per event type, boxed as `Any`.
    channels: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

/// Typed, clonable pub/sub bus. Clones share the same channels.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Mutex<EventBusInner>>,
}

impl EventBus {
    /// Create a new empty event bus.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(EventBusInner {
                channels: HashMap::new(),
            })),
        }
    }

    /// Emit an event to all current subscribers of type `E`.
    ///
    /// Non-blocking: with no subscribers the event is dropped.
    pub fn emit<E: Event>(&self, event: E) {
        let type_id = TypeId::of::<E>();
        let inner = self.inner.lock().expect("event bus lock poisoned");

        if let Some(sender) = inner
            .channels
            .get(&type_id)
            .and_then(|boxed| boxed.downcast_ref::<broadcast::Sender<E>>())
        {
            // Err only means there are no live receivers.
            let _ = sender.send(event);
        }
    }

    /// Subscribe to events of type `E`.
    ///
    /// Only events emitted after this call are delivered.
    pub fn subscribe<E: Event>(&self) -> EventReceiver<E> {
        let type_id = TypeId::of::<E>();
        let mut inner = self.inner.lock().expect("event bus lock poisoned");

        let entry = inner.channels.entry(type_id).or_insert_with(|| {
            let (tx, _) = broadcast::channel::<E>(DEFAULT_CHANNEL_CAPACITY);
            Box::new(tx)
        });
        let sender = entry
            .downcast_ref::<broadcast::Sender<E>>()
            .expect("type mismatch in event bus");

        EventReceiver {
            rx: sender.subscribe(),
        }
    }

    /// Drop every channel, closing all receivers.
    pub fn close(&self) {
        self.inner
            .lock()
            .expect("event bus lock poisoned")
            .channels
            .clear();
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock().expect("event bus lock poisoned");
        f.debug_struct("EventBus")
            .field("channel_count", &inner.channels.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// EventReceiver
// ---------------------------------------------------------------------------

/// Typed receiver for a specific event type.
pub struct EventReceiver<E: Event> {
    rx: broadcast::Receiver<E>,
}

impl<E: Event> EventReceiver<E> {
    /// Wait for the next event.
    ///
    /// Returns `None` once the bus has been closed or dropped. Lagged events
    /// are skipped with a warning.
    pub async fn recv(&mut self) -> Option<E> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(
                        skipped = n,
                        event_type = std::any::type_name::<E>(),
                        "event receiver lagged"
                    );
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Return the next event if one is already buffered.
    pub fn try_recv(&mut self) -> Option<E> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
