//! [`ClusterNode`]: the collaborator-facing facade over one cluster member.
//!
//! A `ClusterNode` owns the partition table, the topology history and the
//! dispatcher for a single node, and exposes lookups and change
//! notifications to the application.

use std::future::Future;
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use atoll_cluster::{
    ClusterConfig, ClusterMetadata, DefaultMembershipPolicy, JoinAuthenticator, MembershipPolicy,
    NeighborhoodSource, TopologyStore, check_shape,
};
use atoll_meta::MetaStore;
use atoll_placement::PartitionMapper;
use atoll_types::{
    EventBus, EventReceiver, HlcTimestamp, MembershipEvent, NodeIdentity, PartitionsChanged, View,
};
use bytes::Bytes;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::dispatcher::{
    DispatcherHandle, DispatcherOptions, DispatcherSink, DispatcherState, EventDispatcher,
};
use crate::transport::{Channel, ConnectRequest, Destination};
use crate::{ClusterMessage, EngineError};

/// Builder for a [`ClusterNode`].
pub struct ClusterNodeBuilder {
    config: ClusterConfig,
    identity: NodeIdentity,
    meta: Option<Arc<MetaStore>>,
    policy: Arc<dyn MembershipPolicy>,
    mapper: PartitionMapper,
    neighborhoods: Option<NeighborhoodSource>,
}

impl ClusterNodeBuilder {
    /// Persist topology and shape in `meta`. Without it history is
    /// in-memory only.
    pub fn meta(mut self, meta: Arc<MetaStore>) -> Self {
        self.meta = Some(meta);
        self
    }

    /// Install a membership ordering policy.
    pub fn policy(mut self, policy: Arc<dyn MembershipPolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Install a partition mapper (with its predicates).
    pub fn mapper(mut self, mapper: PartitionMapper) -> Self {
        self.mapper = mapper;
        self
    }

    /// Derive failure-domain neighborhoods from each view.
    pub fn neighborhoods(mut self, source: NeighborhoodSource) -> Self {
        self.neighborhoods = Some(source);
        self
    }

    /// Validate, recover state, connect and wait until the node is running.
    pub async fn start(self, channel: Arc<dyn Channel>) -> Result<ClusterNode, EngineError> {
        let config = self.config;
        config.validate()?;

        let topology = match &self.meta {
            Some(meta) => {
                check_shape(meta, &config)?;
                TopologyStore::open(meta.clone(), config.retention_count)?
            }
            None => TopologyStore::in_memory(config.retention_count),
        };
        let topology = Arc::new(topology);
        if let Some(latest) = topology.latest() {
            // The wall clock may be behind what was persisted before restart.
            channel.witness(latest.id().timestamp);
        }

        let mut metadata =
            ClusterMetadata::new(config.partition_count, config.backup_count, self.mapper)?;
        if let Some(source) = self.neighborhoods {
            metadata = metadata.with_neighborhoods(move |view| source(view));
        }
        let metadata = Arc::new(metadata);

        let authenticator = JoinAuthenticator::from_config(&config);
        let request = ConnectRequest {
            cluster_name: config.cluster_name.clone(),
            identity: self.identity.clone(),
            token: authenticator.issue(),
            authenticator,
            policy: self.policy,
        };

        let bus = EventBus::new();
        let dispatcher = EventDispatcher::new(
            self.identity.clone(),
            metadata.clone(),
            topology.clone(),
            bus.clone(),
            DispatcherOptions::from_config(&config),
        );

        info!(
            node_id = %self.identity.id,
            cluster = %config.cluster_name,
            partitions = config.partition_count,
            backups = config.backup_count,
            recovered_views = topology.len(),
            "starting cluster node"
        );
        let handle = dispatcher.start(channel.clone(), request).await?;

        Ok(ClusterNode {
            config,
            identity: self.identity,
            metadata,
            topology,
            bus,
            channel,
            current: handle.current(),
            state: handle.subscribe_state(),
            sink: handle.sink(),
            handle: Mutex::new(Some(handle)),
        })
    }
}

/// A running cluster member.
pub struct ClusterNode {
    config: ClusterConfig,
    identity: NodeIdentity,
    metadata: Arc<ClusterMetadata>,
    topology: Arc<TopologyStore>,
    bus: EventBus,
    channel: Arc<dyn Channel>,
    current: Arc<ArcSwap<View>>,
    state: watch::Receiver<DispatcherState>,
    sink: Arc<DispatcherSink>,
    /// Taken on shutdown.
    handle: Mutex<Option<DispatcherHandle>>,
}

impl ClusterNode {
    /// Start configuring a node.
    pub fn builder(config: ClusterConfig, identity: NodeIdentity) -> ClusterNodeBuilder {
        ClusterNodeBuilder {
            config,
            identity,
            meta: None,
            policy: Arc::new(DefaultMembershipPolicy),
            mapper: PartitionMapper::new(),
            neighborhoods: None,
        }
    }

    /// Start a node with the default policy and mapper.
    pub async fn start(
        config: ClusterConfig,
        identity: NodeIdentity,
        channel: Arc<dyn Channel>,
        meta: Option<Arc<MetaStore>>,
    ) -> Result<Self, EngineError> {
        let mut builder = Self::builder(config, identity);
        if let Some(meta) = meta {
            builder = builder.meta(meta);
        }
        builder.start(channel).await
    }

    // ------------------------------------------------------------------
    // Membership
    // ------------------------------------------------------------------

    /// The last applied view.
    pub fn current_view(&self) -> Arc<View> {
        self.current.load_full()
    }

    /// This node's identity.
    pub fn local_identity(&self) -> &NodeIdentity {
        &self.identity
    }

    /// Whether this node coordinates its current view.
    pub fn is_coordinator(&self) -> bool {
        self.current_view()
            .coordinator()
            .is_some_and(|c| c.id == self.identity.id)
    }

    /// Dispatcher lifecycle state.
    pub fn state(&self) -> DispatcherState {
        *self.state.borrow()
    }

    /// The cluster configuration this node runs with.
    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    // ------------------------------------------------------------------
    // Partitions
    // ------------------------------------------------------------------

    /// Partition owning `key`.
    pub fn map_key_to_partition(&self, key: &[u8]) -> u32 {
        self.metadata.partition_for_key(key)
    }

    /// Owners of `partition`, primary first.
    pub fn nodes_for_partition(&self, partition: u32) -> Result<Vec<NodeIdentity>, EngineError> {
        Ok(self.metadata.nodes_for_partition(partition)?)
    }

    /// Primary owner of `partition`.
    pub fn primary_for_partition(
        &self,
        partition: u32,
    ) -> Result<Option<NodeIdentity>, EngineError> {
        Ok(self.metadata.primary_for_partition(partition)?)
    }

    /// The partition table.
    pub fn metadata(&self) -> &Arc<ClusterMetadata> {
        &self.metadata
    }

    // ------------------------------------------------------------------
    // Topology
    // ------------------------------------------------------------------

    /// The view in force at `ts`.
    pub fn view_as_of(&self, ts: HlcTimestamp) -> Option<View> {
        self.topology.as_of(ts)
    }

    /// The view history.
    pub fn topology(&self) -> &Arc<TopologyStore> {
        &self.topology
    }

    // ------------------------------------------------------------------
    // Notifications
    // ------------------------------------------------------------------

    /// Subscribe to partition table changes.
    pub fn subscribe_partitions(&self) -> EventReceiver<PartitionsChanged> {
        self.bus.subscribe()
    }

    /// Subscribe to membership events.
    pub fn subscribe_membership(&self) -> EventReceiver<MembershipEvent> {
        self.bus.subscribe()
    }

    /// Subscribe to application messages from other members.
    pub fn subscribe_messages(&self) -> EventReceiver<ClusterMessage> {
        self.bus.subscribe()
    }

    /// Run `listener` for every partition table change.
    ///
    /// The listener task ends when the node shuts down.
    pub fn on_partitions_changed<F, Fut>(&self, listener: F) -> JoinHandle<()>
    where
        F: Fn(PartitionsChanged) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut rx = self.subscribe_partitions();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                listener(event).await;
            }
        })
    }

    /// Run `listener` for every membership event.
    ///
    /// The listener task ends when the node shuts down.
    pub fn on_membership_event<F, Fut>(&self, listener: F) -> JoinHandle<()>
    where
        F: Fn(MembershipEvent) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut rx = self.subscribe_membership();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                listener(event).await;
            }
        })
    }

    // ------------------------------------------------------------------
    // Messaging & lifecycle
    // ------------------------------------------------------------------

    /// Send an application message through the transport.
    pub async fn send(&self, destination: Destination, payload: Bytes) -> Result<(), EngineError> {
        if self.state() != DispatcherState::Running {
            return Err(EngineError::ServiceStopped);
        }
        self.channel.send(destination, payload).await
    }

    /// Events dropped under back-pressure since start.
    pub fn dropped_events(&self) -> u64 {
        self.sink.dropped_events()
    }

    /// Leave the cluster, drain pending events and release the transport.
    ///
    /// Idempotent.
    pub async fn shutdown(&self) -> Result<(), EngineError> {
        let handle = self.handle.lock().expect("node lock poisoned").take();
        let Some(handle) = handle else {
            return Ok(());
        };
        info!(node_id = %self.identity.id, "shutting down cluster node");
        let result = handle.shutdown().await;
        if let Err(e) = &result {
            warn!(node_id = %self.identity.id, error = %e, "dispatcher did not stop cleanly");
        }
        self.bus.close();
        result
    }
}

impl std::fmt::Debug for ClusterNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterNode")
            .field("node_id", &self.identity.id)
            .field("cluster", &self.config.cluster_name)
            .field("state", &self.state())
            .finish()
    }
}
