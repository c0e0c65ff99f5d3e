//! In-process group transport.
//!
//! [`LocalNetwork`] hosts one cluster inside a single process. Every node
//! gets its own [`LocalChannel`]; the network admits joiners after checking
//! their token with the coordinator's authenticator, orders members with the
//! installed [`MembershipPolicy`], stamps views with a shared
//! [`HybridClock`] and delivers callbacks in view order.
//!
//! Failure injection for tests: [`crash`](LocalNetwork::crash) removes a node
//! as a suspect without telling it, [`split`](LocalNetwork::split) partitions
//! the cluster into subviews and [`heal`](LocalNetwork::heal) merges them
//! back with [`MembershipPolicy::merge`].

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use atoll_cluster::{JoinAuthenticator, MembershipPolicy};
use atoll_types::{HlcTimestamp, HybridClock, NodeId, NodeIdentity, View, ViewId};
use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::transport::{Channel, ConnectRequest, Destination, MembershipListener};
use crate::EngineError;

struct Endpoint {
    identity: NodeIdentity,
    listener: Arc<dyn MembershipListener>,
    policy: Arc<dyn MembershipPolicy>,
    authenticator: JoinAuthenticator,
}

#[derive(Default)]
struct NetworkState {
    endpoints: HashMap<NodeId, Endpoint>,
    /// Current view of each connected group; more than one only while split.
    subviews: Vec<View>,
}

impl NetworkState {
    fn subview_of(&self, id: &NodeId) -> Option<usize> {
        self.subviews.iter().position(|v| v.contains(id))
    }

    fn coordinator_endpoint(&self, subview: usize) -> Option<&Endpoint> {
        self.subviews
            .get(subview)
            .and_then(|v| v.coordinator())
            .and_then(|c| self.endpoints.get(&c.id))
    }

    /// Replace subview `index` with `members`, delivering the new view.
    fn install(&mut self, clock: &HybridClock, index: usize, members: Vec<NodeIdentity>) -> View {
        let creator = members.first().map(|m| m.id).unwrap_or(NodeId::NIL);
        let view = View::new(ViewId::new(clock.tick(), creator), members);
        debug!(view_id = %view.id(), members = view.len(), "installing view");
        for member in view.members() {
            if let Some(endpoint) = self.endpoints.get(&member.id) {
                endpoint.listener.on_view_accepted(view.clone());
            }
        }
        if view.is_empty() {
            self.subviews.remove(index);
        } else {
            self.subviews[index] = view.clone();
        }
        view
    }

    /// Policy used to reorder subview `index`: its coordinator's, or any.
    fn policy_for(&self, index: usize) -> Option<Arc<dyn MembershipPolicy>> {
        self.coordinator_endpoint(index)
            .or_else(|| self.endpoints.values().next())
            .map(|e| e.policy.clone())
    }
}

/// Shared in-process network hosting one cluster.
#[derive(Clone, Default)]
pub struct LocalNetwork {
    state: Arc<Mutex<NetworkState>>,
    clock: Arc<HybridClock>,
}

impl LocalNetwork {
    /// Create an empty network.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an unconnected channel on this network.
    pub fn channel(&self) -> Arc<LocalChannel> {
        Arc::new(LocalChannel {
            network: self.clone(),
            local: Mutex::new(None),
        })
    }

    /// Ids of every connected node.
    pub fn connected(&self) -> Vec<NodeId> {
        let state = self.lock();
        let mut ids: Vec<NodeId> = state.endpoints.keys().copied().collect();
        ids.sort();
        ids
    }

    /// The current subviews (one unless the network is split).
    pub fn subviews(&self) -> Vec<View> {
        self.lock().subviews.clone()
    }

    /// Remove `node` as a suspect without notifying it.
    ///
    /// The remaining members receive a new view; the crashed node's listener
    /// hears nothing, as if its process had died.
    pub fn crash(&self, node: &NodeId) {
        let mut state = self.lock();
        let Some(index) = state.subview_of(node) else {
            return;
        };
        let Some(policy) = state.policy_for(index) else {
            return;
        };
        state.endpoints.remove(node);
        let members = policy.reconcile(state.subviews[index].members(), &[], &[], &[*node]);
        warn!(node_id = %node, "node crashed");
        state.install(&self.clock, index, members);
    }

    /// Partition the cluster.
    ///
    /// Each group becomes its own subview with its own coordinator. Nodes
    /// not listed in any group end up together in a final group.
    pub fn split(&self, groups: &[Vec<NodeId>]) {
        let mut state = self.lock();
        let everyone: Vec<NodeIdentity> = state
            .subviews
            .iter()
            .flat_map(|v| v.members().iter().cloned())
            .collect();
        let Some(policy) = state.policy_for(0) else {
            return;
        };

        let listed: HashSet<NodeId> = groups.iter().flatten().copied().collect();
        let mut partitions: Vec<HashSet<NodeId>> = groups
            .iter()
            .map(|g| g.iter().copied().collect())
            .collect();
        let rest: HashSet<NodeId> = everyone
            .iter()
            .map(|m| m.id)
            .filter(|id| !listed.contains(id))
            .collect();
        if !rest.is_empty() {
            partitions.push(rest);
        }

        state.subviews = Vec::new();
        for group in partitions {
            let suspects: Vec<NodeId> = everyone
                .iter()
                .map(|m| m.id)
                .filter(|id| !group.contains(id))
                .collect();
            let members = policy.reconcile(&everyone, &[], &[], &suspects);
            if members.is_empty() {
                continue;
            }
            state.subviews.push(View::empty());
            let index = state.subviews.len() - 1;
            state.install(&self.clock, index, members);
        }
        info!(subviews = state.subviews.len(), "network split");
    }

    /// Merge every subview back into one view.
    pub fn heal(&self) -> Result<(), EngineError> {
        let mut state = self.lock();
        if state.subviews.len() < 2 {
            return Ok(());
        }
        let Some(policy) = state.policy_for(0) else {
            return Ok(());
        };
        let subviews: Vec<Vec<NodeIdentity>> = state
            .subviews
            .iter()
            .map(|v| v.members().to_vec())
            .collect();
        let merged = policy.merge(&subviews)?;
        state.subviews = vec![View::empty()];
        let view = state.install(&self.clock, 0, merged);
        info!(view_id = %view.id(), members = view.len(), "network healed");
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, NetworkState> {
        self.state.lock().expect("network lock poisoned")
    }

    fn join(
        &self,
        request: ConnectRequest,
        listener: Arc<dyn MembershipListener>,
    ) -> Result<(), EngineError> {
        let mut state = self.lock();
        let id = request.identity.id;
        if state.endpoints.contains_key(&id) {
            return Err(EngineError::Transport(format!("node {id} already connected")));
        }

        if let Some(coordinator) = state.coordinator_endpoint(0) {
            coordinator
                .authenticator
                .verify(&request.token)
                .map_err(EngineError::JoinRejected)?;
        }

        let joiner = request.identity.clone();
        state.endpoints.insert(
            id,
            Endpoint {
                identity: request.identity,
                listener: listener.clone(),
                policy: request.policy.clone(),
                authenticator: request.authenticator,
            },
        );

        if state.subviews.is_empty() {
            state.subviews.push(View::empty());
        }
        let policy = state.policy_for(0).unwrap_or(request.policy);
        let members = policy.reconcile(state.subviews[0].members(), &[joiner], &[], &[]);
        let view = state.install(&self.clock, 0, members);
        listener.on_joined();
        info!(node_id = %id, view_id = %view.id(), members = view.len(), "node joined");
        Ok(())
    }

    fn leave(&self, id: &NodeId) {
        let mut state = self.lock();
        let Some(index) = state.subview_of(id) else {
            return;
        };
        let policy = state.policy_for(index);
        let Some(endpoint) = state.endpoints.remove(id) else {
            return;
        };
        if let Some(policy) = policy {
            let members = policy.reconcile(state.subviews[index].members(), &[], &[*id], &[]);
            state.install(&self.clock, index, members);
        }
        endpoint.listener.on_left();
        endpoint.listener.on_channel_closed();
        info!(node_id = %endpoint.identity.id, "node left");
    }

    fn transfer_state(&self, id: &NodeId) -> Result<(), EngineError> {
        let state = self.lock();
        let index = state.subview_of(id).ok_or(EngineError::NotConnected)?;
        let coordinator = state
            .coordinator_endpoint(index)
            .ok_or(EngineError::NotConnected)?;
        let requester = state.endpoints.get(id).ok_or(EngineError::NotConnected)?;
        if coordinator.identity.id == *id {
            return Ok(());
        }
        match coordinator.listener.get_state() {
            Some(snapshot) => {
                requester.listener.set_state(snapshot);
                Ok(())
            }
            None => Err(EngineError::Transport(
                "coordinator has no state to transfer".into(),
            )),
        }
    }

    fn deliver(&self, from: &NodeId, destination: Destination, payload: Bytes) -> Result<(), EngineError> {
        let state = self.lock();
        let index = state.subview_of(from).ok_or(EngineError::NotConnected)?;
        let view = &state.subviews[index];
        match destination {
            Destination::Broadcast => {
                for member in view.members().iter().filter(|m| &m.id != from) {
                    if let Some(endpoint) = state.endpoints.get(&member.id) {
                        endpoint.listener.on_message(*from, payload.clone());
                    }
                }
                Ok(())
            }
            Destination::Node(target) => {
                if !view.contains(&target) {
                    return Err(EngineError::Unreachable(target));
                }
                let endpoint = state
                    .endpoints
                    .get(&target)
                    .ok_or(EngineError::Unreachable(target))?;
                endpoint.listener.on_message(*from, payload);
                Ok(())
            }
        }
    }
}

impl std::fmt::Debug for LocalNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("LocalNetwork")
            .field("endpoints", &state.endpoints.len())
            .field("subviews", &state.subviews.len())
            .finish()
    }
}

/// One node's handle on a [`LocalNetwork`].
pub struct LocalChannel {
    network: LocalNetwork,
    local: Mutex<Option<NodeId>>,
}

impl LocalChannel {
    fn local(&self) -> Result<NodeId, EngineError> {
        self.local
            .lock()
            .expect("channel lock poisoned")
            .ok_or(EngineError::NotConnected)
    }
}

#[async_trait::async_trait]
impl Channel for LocalChannel {
    async fn connect(
        &self,
        request: ConnectRequest,
        listener: Arc<dyn MembershipListener>,
    ) -> Result<(), EngineError> {
        {
            let mut local = self.local.lock().expect("channel lock poisoned");
            if local.is_some() {
                return Err(EngineError::Transport("channel already connected".into()));
            }
            // Set before joining: the listener may request state right away.
            *local = Some(request.identity.id);
        }
        if let Err(e) = self.network.join(request, listener) {
            *self.local.lock().expect("channel lock poisoned") = None;
            return Err(e);
        }
        Ok(())
    }

    async fn send(&self, destination: Destination, payload: Bytes) -> Result<(), EngineError> {
        let from = self.local()?;
        self.network.deliver(&from, destination, payload)
    }

    fn local_address(&self) -> Option<NodeId> {
        *self.local.lock().expect("channel lock poisoned")
    }

    async fn request_state(&self) -> Result<(), EngineError> {
        let id = self.local()?;
        self.network.transfer_state(&id)
    }

    async fn close(&self) -> Result<(), EngineError> {
        let id = self.local.lock().expect("channel lock poisoned").take();
        if let Some(id) = id {
            self.network.leave(&id);
        }
        Ok(())
    }

    fn witness(&self, timestamp: HlcTimestamp) {
        self.network.clock.witness(timestamp);
    }
}
