//! Ordered, single-consumer membership event pipeline.
//!
//! Transport callbacks land in a [`DispatcherSink`], which pushes them into a
//! bounded queue without ever blocking: when the queue is full the event is
//! dropped and logged, since a later view supersedes an earlier one. A single
//! consumer task drains the queue in order and, for each accepted view,
//! records it in the [`TopologyStore`], recomputes the partition table and
//! publishes [`PartitionsChanged`] and [`MembershipEvent::ViewChanged`].
//!
//! Lifecycle, published through [`DispatcherState`]:
//!
//! ```text
//! Init → Connecting → [AwaitingCoordinatorView] → Running → Closing → Closed
//! ```
//!
//! Views that arrive before `Running` are buffered and applied in order once
//! the local node has joined and (unless it is the coordinator itself) merged
//! the coordinator's topology snapshot.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use arc_swap::ArcSwap;
use atoll_cluster::{MetadataUpdater, TopologyStore};
use atoll_types::{EventBus, MembershipEvent, NodeIdentity, PartitionsChanged, View};
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::transport::{Channel, ConnectRequest, MembershipListener};
use crate::{ClusterMessage, EngineError};

/// Lifecycle state of a node's dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherState {
    /// Created, not yet connecting.
    Init,
    /// Connecting to the transport.
    Connecting,
    /// Joined as a non-coordinator; waiting for the coordinator's snapshot.
    AwaitingCoordinatorView,
    /// Applying events.
    Running,
    /// Draining the queue before release.
    Closing,
    /// Stopped; transport released.
    Closed,
}

/// Tuning for the dispatcher.
#[derive(Debug, Clone)]
pub struct DispatcherOptions {
    /// Capacity of the inbound queue.
    pub queue_capacity: usize,
    /// How long to wait for the join to complete.
    pub join_sync_timeout: Duration,
    /// Upper bound on draining at shutdown.
    pub shutdown_timeout: Duration,
}

impl DispatcherOptions {
    /// Options derived from the cluster configuration.
    pub fn from_config(config: &atoll_cluster::ClusterConfig) -> Self {
        Self {
            queue_capacity: config.event_queue_capacity.max(1),
            join_sync_timeout: config.join_sync_timeout,
            shutdown_timeout: config.shutdown_timeout,
        }
    }
}

#[derive(Debug)]
enum InboundEvent {
    ViewAccepted(View),
    Joined,
    Left,
    ChannelClosed,
    StateReceived(Vec<u8>),
}

// ---------------------------------------------------------------------------
// Producer side
// ---------------------------------------------------------------------------

/// Non-blocking producer half, handed to the transport as its listener.
pub struct DispatcherSink {
    tx: mpsc::Sender<InboundEvent>,
    accepting: AtomicBool,
    dropped: AtomicU64,
    topology: Arc<TopologyStore>,
    bus: EventBus,
}

impl DispatcherSink {
    fn push(&self, event: InboundEvent) {
        if !self.accepting.load(Ordering::Acquire) {
            debug!(?event, "dispatcher closing, ignoring event");
            return;
        }
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(?event, dropped, "dispatcher queue full, dropping event");
            }
            Err(mpsc::error::TrySendError::Closed(event)) => {
                debug!(?event, "dispatcher stopped, dropping event");
            }
        }
    }

    /// Number of events dropped because the queue was full.
    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl MembershipListener for DispatcherSink {
    fn on_view_accepted(&self, view: View) {
        self.push(InboundEvent::ViewAccepted(view));
    }

    fn on_joined(&self) {
        self.push(InboundEvent::Joined);
    }

    fn on_left(&self) {
        self.push(InboundEvent::Left);
    }

    fn on_channel_closed(&self) {
        self.push(InboundEvent::ChannelClosed);
    }

    fn get_state(&self) -> Option<Vec<u8>> {
        match self.topology.snapshot_bytes() {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                error!(error = %e, "failed to encode topology snapshot");
                None
            }
        }
    }

    fn set_state(&self, state: Vec<u8>) {
        self.push(InboundEvent::StateReceived(state));
    }

    fn on_message(&self, from: atoll_types::NodeId, payload: Bytes) {
        self.bus.emit(ClusterMessage { from, payload });
    }
}

// ---------------------------------------------------------------------------
// Consumer side
// ---------------------------------------------------------------------------

/// Builds and starts the dispatcher for one node.
pub struct EventDispatcher {
    local: NodeIdentity,
    metadata: Arc<dyn MetadataUpdater>,
    topology: Arc<TopologyStore>,
    bus: EventBus,
    current: Arc<ArcSwap<View>>,
    options: DispatcherOptions,
}

impl EventDispatcher {
    /// Create a dispatcher applying views to `metadata` and `topology`.
    pub fn new(
        local: NodeIdentity,
        metadata: Arc<dyn MetadataUpdater>,
        topology: Arc<TopologyStore>,
        bus: EventBus,
        options: DispatcherOptions,
    ) -> Self {
        Self {
            local,
            metadata,
            topology,
            bus,
            current: Arc::new(ArcSwap::from_pointee(View::empty())),
            options,
        }
    }

    /// Connect through `channel` and run until the node is `Running`.
    ///
    /// Fails if the join is rejected, the channel closes while joining, or
    /// the coordinator's snapshot does not arrive within the join timeout.
    pub async fn start(
        self,
        channel: Arc<dyn Channel>,
        request: ConnectRequest,
    ) -> Result<DispatcherHandle, EngineError> {
        let (tx, rx) = mpsc::channel(self.options.queue_capacity);
        let (state_tx, state_rx) = watch::channel(DispatcherState::Init);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (ready_tx, ready_rx) = oneshot::channel();

        let sink = Arc::new(DispatcherSink {
            tx,
            accepting: AtomicBool::new(true),
            dropped: AtomicU64::new(0),
            topology: self.topology.clone(),
            bus: self.bus.clone(),
        });

        let consumer = Consumer {
            local: self.local,
            metadata: self.metadata,
            topology: self.topology,
            bus: self.bus,
            current: self.current.clone(),
            channel: channel.clone(),
            sink: sink.clone(),
            state_tx,
            options: self.options,
        };
        consumer.set_state(DispatcherState::Connecting);
        let task = tokio::spawn(consumer.run(rx, ready_tx, shutdown_rx));

        let handle = DispatcherHandle {
            sink: sink.clone(),
            state_rx,
            shutdown_tx,
            task: Some(task),
            current: self.current,
        };

        if let Err(e) = channel.connect(request, sink).await {
            warn!(error = %e, "connect failed");
            handle.abort().await;
            return Err(e);
        }

        match ready_rx.await {
            Ok(Ok(())) => Ok(handle),
            Ok(Err(e)) => {
                if let Err(close_err) = channel.close().await {
                    warn!(error = %close_err, "failed to close channel after failed join");
                }
                handle.abort().await;
                Err(e)
            }
            Err(_) => Err(EngineError::ServiceStopped),
        }
    }
}

struct Consumer {
    local: NodeIdentity,
    metadata: Arc<dyn MetadataUpdater>,
    topology: Arc<TopologyStore>,
    bus: EventBus,
    current: Arc<ArcSwap<View>>,
    channel: Arc<dyn Channel>,
    sink: Arc<DispatcherSink>,
    state_tx: watch::Sender<DispatcherState>,
    options: DispatcherOptions,
}

impl Consumer {
    fn set_state(&self, state: DispatcherState) {
        debug!(node_id = %self.local.id, ?state, "dispatcher state");
        self.state_tx.send_replace(state);
    }

    async fn run(
        self,
        mut rx: mpsc::Receiver<InboundEvent>,
        ready_tx: oneshot::Sender<Result<(), EngineError>>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let backlog = match self.join(&mut rx, &mut shutdown_rx).await {
            Ok(backlog) => backlog,
            Err(e) => {
                error!(node_id = %self.local.id, error = %e, "join failed");
                self.sink.accepting.store(false, Ordering::Release);
                self.set_state(DispatcherState::Closed);
                let _ = ready_tx.send(Err(e));
                return;
            }
        };

        self.set_state(DispatcherState::Running);
        for view in backlog {
            self.apply_view(view);
        }
        info!(
            node_id = %self.local.id,
            view_id = %self.current.load().id(),
            "dispatcher running"
        );
        self.bus.emit(MembershipEvent::Joined {
            node_id: self.local.id,
        });
        let _ = ready_tx.send(Ok(()));

        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.changed() => break,
                event = rx.recv() => match event {
                    Some(event) => self.handle(event),
                    None => break,
                },
            }
        }

        self.close(rx).await;
    }

    /// Wait until joined and synced, buffering views.
    async fn join(
        &self,
        rx: &mut mpsc::Receiver<InboundEvent>,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> Result<Vec<View>, EngineError> {
        let deadline = Instant::now() + self.options.join_sync_timeout;
        let mut backlog: Vec<View> = Vec::new();
        let mut joined = false;
        let mut synced = false;

        loop {
            if joined && synced {
                return Ok(backlog);
            }

            let event = tokio::select! {
                biased;
                _ = shutdown_rx.changed() => return Err(EngineError::ServiceStopped),
                event = tokio::time::timeout_at(deadline, rx.recv()) => event,
            };

            match event {
                Err(_) => {
                    return Err(EngineError::JoinTimeout(self.options.join_sync_timeout));
                }
                Ok(None) => return Err(EngineError::ServiceStopped),
                Ok(Some(InboundEvent::ViewAccepted(view))) => backlog.push(view),
                Ok(Some(InboundEvent::Joined)) => {
                    joined = true;
                    let coordinator = backlog
                        .last()
                        .and_then(|v| v.coordinator())
                        .is_some_and(|c| c.id == self.local.id);
                    if coordinator {
                        debug!(node_id = %self.local.id, "joined as coordinator");
                        synced = true;
                    } else {
                        self.set_state(DispatcherState::AwaitingCoordinatorView);
                        self.channel.request_state().await?;
                    }
                }
                Ok(Some(InboundEvent::StateReceived(bytes))) => {
                    self.merge_snapshot(&bytes)?;
                    debug!(
                        node_id = %self.local.id,
                        views = self.topology.len(),
                        "merged coordinator topology"
                    );
                    synced = true;
                }
                Ok(Some(InboundEvent::Left | InboundEvent::ChannelClosed)) => {
                    return Err(EngineError::ChannelClosed);
                }
            }
        }
    }

    fn handle(&self, event: InboundEvent) {
        let node_id = self.local.id;
        match event {
            InboundEvent::ViewAccepted(view) => self.apply_view(view),
            InboundEvent::Joined => self.bus.emit(MembershipEvent::Joined { node_id }),
            InboundEvent::Left => self.bus.emit(MembershipEvent::Left { node_id }),
            InboundEvent::ChannelClosed => {
                self.bus.emit(MembershipEvent::ChannelClosed { node_id })
            }
            InboundEvent::StateReceived(bytes) => {
                if let Err(e) = self.merge_snapshot(&bytes) {
                    warn!(error = %e, "failed to merge topology snapshot");
                }
            }
        }
    }

    /// Merge a received history and move the view clock past it.
    fn merge_snapshot(&self, bytes: &[u8]) -> Result<(), EngineError> {
        self.topology.merge_snapshot(bytes)?;
        if let Some(latest) = self.topology.latest() {
            self.channel.witness(latest.id().timestamp);
        }
        Ok(())
    }

    fn apply_view(&self, view: View) {
        let old = self.current.load_full();
        if view.id() <= old.id() {
            debug!(view_id = %view.id(), current = %old.id(), "skipping stale view");
            return;
        }

        if let Err(e) = self.topology.record(&view) {
            warn!(view_id = %view.id(), error = %e, "view applied without durable history");
        }

        let delta = match self.metadata.update(&old, &view) {
            Ok(delta) => delta,
            Err(e) => {
                error!(view_id = %view.id(), error = %e, "repartition failed");
                return;
            }
        };

        let diff = View::diff(&old, &view);
        info!(
            view_id = %view.id(),
            members = view.len(),
            joined = diff.joined.len(),
            left = diff.left.len(),
            changed_partitions = delta.changed.len(),
            "view applied"
        );

        let view = Arc::new(view);
        self.current.store(view.clone());

        self.bus.emit(PartitionsChanged {
            view_id: delta.view_id,
            previous_view_id: delta.previous_view_id,
            changed: delta.changed,
        });
        self.bus.emit(MembershipEvent::ViewChanged {
            view: (*view).clone(),
            previous: old.id(),
            joined: diff.joined_ids(),
            left: diff.left_ids(),
        });
    }

    async fn close(self, mut rx: mpsc::Receiver<InboundEvent>) {
        self.set_state(DispatcherState::Closing);
        self.sink.accepting.store(false, Ordering::Release);
        rx.close();

        let deadline = Instant::now() + self.options.shutdown_timeout;
        let mut drained = 0usize;
        loop {
            // A ready queue never trips the timeout below; check explicitly.
            if Instant::now() >= deadline {
                warn!(drained, "shutdown deadline reached, abandoning queued events");
                break;
            }
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(event)) => {
                    self.handle(event);
                    drained += 1;
                }
                Ok(None) => break,
                Err(_) => {
                    warn!(drained, "shutdown deadline reached, abandoning queued events");
                    break;
                }
            }
        }

        if let Err(e) = self.channel.close().await {
            warn!(error = %e, "failed to close channel");
        }
        self.bus.emit(MembershipEvent::Left {
            node_id: self.local.id,
        });
        self.set_state(DispatcherState::Closed);
        info!(node_id = %self.local.id, drained, "dispatcher closed");
    }
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Control handle for a running dispatcher.
pub struct DispatcherHandle {
    sink: Arc<DispatcherSink>,
    state_rx: watch::Receiver<DispatcherState>,
    shutdown_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
    current: Arc<ArcSwap<View>>,
}

impl DispatcherHandle {
    /// Current lifecycle state.
    pub fn state(&self) -> DispatcherState {
        *self.state_rx.borrow()
    }

    /// Watch lifecycle transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<DispatcherState> {
        self.state_rx.clone()
    }

    /// The last applied view.
    pub fn current_view(&self) -> Arc<View> {
        self.current.load_full()
    }

    /// Shared pointer to the last applied view.
    pub fn current(&self) -> Arc<ArcSwap<View>> {
        self.current.clone()
    }

    /// The listener handed to the transport.
    pub fn sink(&self) -> Arc<DispatcherSink> {
        self.sink.clone()
    }

    /// Number of events dropped under back-pressure.
    pub fn dropped_events(&self) -> u64 {
        self.sink.dropped_events()
    }

    /// Stop accepting events, drain the queue, release the channel.
    pub async fn shutdown(mut self) -> Result<(), EngineError> {
        let _ = self.shutdown_tx.send(true);
        if let Some(task) = self.task.take() {
            task.await.map_err(|_| EngineError::ServiceStopped)?;
        }
        Ok(())
    }

    async fn abort(mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for DispatcherHandle {
    fn drop(&mut self) {
        if self.task.is_some() {
            let _ = self.shutdown_tx.send(true);
        }
    }
}
