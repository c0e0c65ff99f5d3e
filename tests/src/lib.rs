//! Shared test harness for atoll integration tests.
//!
//! Provides [`TestCluster`]: N nodes on one in-process [`LocalNetwork`],
//! each with its own metadata store, plus helpers to add, stop, restart,
//! crash and partition nodes.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use atoll_cluster::{ClusterConfig, IdentityGenerator};
use atoll_engine::{ClusterNode, EngineError, LocalNetwork};
use atoll_meta::MetaStore;
use atoll_types::{NodeId, NodeIdentity, NodeRole};

/// How long [`wait_for`] polls before giving up.
const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// One node slot: its store survives restarts, the node does not.
struct Slot {
    meta: Arc<MetaStore>,
    weight: f64,
    node: Option<ClusterNode>,
    id: NodeId,
}

/// An in-process cluster of [`ClusterNode`]s.
pub struct TestCluster {
    network: LocalNetwork,
    config: ClusterConfig,
    slots: Vec<Slot>,
}

impl TestCluster {
    /// Start `n` nodes with [`ClusterConfig::test_config`].
    pub async fn new(n: usize) -> Self {
        Self::with_config(n, ClusterConfig::test_config()).await
    }

    /// Start `n` nodes sharing `config`.
    pub async fn with_config(n: usize, config: ClusterConfig) -> Self {
        let mut cluster = Self {
            network: LocalNetwork::new(),
            config,
            slots: Vec::with_capacity(n),
        };
        for _ in 0..n {
            cluster.add_node().await;
        }
        cluster.wait_for_members(n).await;
        cluster
    }

    /// The shared configuration.
    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// The underlying network.
    pub fn network(&self) -> &LocalNetwork {
        &self.network
    }

    /// Number of slots, running or not.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the cluster has no slots.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// The node in slot `i`. Panics if it is stopped.
    pub fn node(&self, i: usize) -> &ClusterNode {
        self.slots[i]
            .node
            .as_ref()
            .unwrap_or_else(|| panic!("node {i} is not running"))
    }

    /// Id of the node in slot `i`, running or not.
    pub fn id(&self, i: usize) -> NodeId {
        self.slots[i].id
    }

    /// The metadata store of slot `i`.
    pub fn meta(&self, i: usize) -> &Arc<MetaStore> {
        &self.slots[i].meta
    }

    /// Slots whose node is running.
    pub fn running(&self) -> Vec<usize> {
        (0..self.slots.len())
            .filter(|&i| self.slots[i].node.is_some())
            .collect()
    }

    /// Add and start a node with power weight 1.0. Returns its slot.
    pub async fn add_node(&mut self) -> usize {
        self.add_weighted_node(1.0).await
    }

    /// Add and start a node with the given power weight.
    pub async fn add_weighted_node(&mut self, weight: f64) -> usize {
        let meta = Arc::new(MetaStore::open_temporary().expect("open temporary store"));
        let slot = self.slots.len();
        let node = self
            .start_node(&meta, slot, weight)
            .await
            .unwrap_or_else(|e| panic!("node {slot} failed to start: {e}"));
        self.slots.push(Slot {
            meta,
            weight,
            id: node.local_identity().id,
            node: Some(node),
        });
        slot
    }

    /// Gracefully stop the node in slot `i`.
    pub async fn stop(&mut self, i: usize) {
        if let Some(node) = self.slots[i].node.take() {
            node.shutdown().await.expect("clean shutdown");
        }
    }

    /// Start the node in slot `i` again over its existing store.
    pub async fn restart(&mut self, i: usize) -> Result<(), EngineError> {
        let config = self.config.clone();
        self.restart_with(i, config).await
    }

    /// Restart slot `i` with a different configuration.
    pub async fn restart_with(&mut self, i: usize, config: ClusterConfig) -> Result<(), EngineError> {
        self.stop(i).await;
        let meta = self.slots[i].meta.clone();
        let identity = slot_identity(&meta, i, self.slots[i].weight);
        let node = ClusterNode::start(config, identity, self.network.channel(), Some(meta)).await?;
        self.slots[i].node = Some(node);
        Ok(())
    }

    /// Remove slot `i` from the network without telling it.
    ///
    /// The node keeps running with a stale view.
    pub fn crash(&self, i: usize) {
        self.network.crash(&self.id(i));
    }

    /// Partition the network into the given groups of slots.
    pub fn split(&self, groups: &[&[usize]]) {
        let groups: Vec<Vec<NodeId>> = groups
            .iter()
            .map(|g| g.iter().map(|&i| self.id(i)).collect())
            .collect();
        self.network.split(&groups);
    }

    /// Merge every partition back together.
    pub fn heal(&self) {
        self.network.heal().expect("heal");
    }

    /// Wait until every running node in `slots` sees exactly those members
    /// in the same view.
    pub async fn wait_for_group(&self, slots: &[usize]) {
        let mut expected: Vec<NodeId> = slots.iter().map(|&i| self.id(i)).collect();
        expected.sort();
        wait_for("group to converge", || {
            let views: Vec<_> = slots.iter().map(|&i| self.node(i).current_view()).collect();
            views.iter().all(|v| {
                let mut ids = v.member_ids();
                ids.sort();
                ids == expected && v.id() == views[0].id()
            })
        })
        .await;
    }

    /// Wait until every running node sees `n` members in the same view.
    pub async fn wait_for_members(&self, n: usize) {
        let running = self.running();
        wait_for("cluster to converge", || {
            let views: Vec<_> = running.iter().map(|&i| self.node(i).current_view()).collect();
            views.iter().all(|v| v.len() == n && v.id() == views[0].id())
        })
        .await;
    }

    /// Stop every running node.
    pub async fn shutdown(&mut self) {
        for i in 0..self.slots.len() {
            self.stop(i).await;
        }
    }

    async fn start_node(
        &self,
        meta: &Arc<MetaStore>,
        slot: usize,
        weight: f64,
    ) -> Result<ClusterNode, EngineError> {
        let identity = slot_identity(meta, slot, weight);
        ClusterNode::start(
            self.config.clone(),
            identity,
            self.network.channel(),
            Some(meta.clone()),
        )
        .await
    }
}

fn slot_identity(meta: &MetaStore, slot: usize, weight: f64) -> NodeIdentity {
    let template = NodeIdentity::new(NodeId::NIL, format!("host-{slot}"), NodeRole::Worker)
        .with_power_weight(weight);
    IdentityGenerator::load_or_create(meta, &format!("slot-{slot}"), template)
        .expect("load or create identity")
}

/// Poll `check` until it holds, panicking after a few seconds.
pub async fn wait_for(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Run `f` and fail if it takes longer than `secs`.
pub async fn within<T>(secs: u64, f: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(secs), f)
        .await
        .expect("operation timed out")
}
