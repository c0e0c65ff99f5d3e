//! Integration test: cluster formation.
//!
//! Verifies that N nodes form one view and compute identical partition
//! tables independently.

use std::collections::HashSet;

use atoll_cluster::{ClusterConfig, JoinRejection};
use atoll_engine::{ClusterNode, EngineError};
use atoll_integration_tests::TestCluster;
use atoll_types::{NodeId, NodeIdentity, NodeRole};

fn owner_ids(node: &ClusterNode, partition: u32) -> Vec<NodeId> {
    node.nodes_for_partition(partition)
        .unwrap()
        .iter()
        .map(|n| n.id)
        .collect()
}

/// Start 5 nodes, verify all 5 see the same view with the first node as
/// coordinator.
#[tokio::test]
async fn test_5_node_cluster_formation() {
    let mut c = TestCluster::new(5).await;

    let view = c.node(0).current_view();
    assert_eq!(view.len(), 5);
    assert_eq!(view.coordinator().unwrap().id, c.id(0));
    for i in 0..5 {
        assert_eq!(c.node(i).current_view().id(), view.id(), "node {i} view");
        assert_eq!(c.node(i).is_coordinator(), i == 0);
    }

    c.shutdown().await;
}

/// Every node computes the same table without exchanging it.
#[tokio::test]
async fn test_5_node_tables_agree() {
    let mut c = TestCluster::new(5).await;
    let partitions = c.config().partition_count;

    for p in 0..partitions {
        let reference = owner_ids(c.node(0), p);
        for i in 1..5 {
            assert_eq!(owner_ids(c.node(i), p), reference, "partition {p} on node {i}");
        }
    }

    c.shutdown().await;
}

/// With one backup, every partition has two distinct owners from the view.
#[tokio::test]
async fn test_every_partition_has_primary_and_backup() {
    let mut c = TestCluster::new(4).await;
    let members: HashSet<NodeId> = c.node(0).current_view().member_ids().into_iter().collect();

    let table = c.node(0).metadata().snapshot();
    assert_eq!(table.len(), c.config().partition_count as usize);
    for partition in table.partitions() {
        let owners: HashSet<NodeId> = partition.nodes.iter().map(|n| n.id).collect();
        assert_eq!(partition.nodes.len(), 2, "partition {}", partition.number);
        assert_eq!(owners.len(), 2, "owners must be distinct");
        assert!(owners.is_subset(&members));
    }

    c.shutdown().await;
}

/// Backups beyond the member count clamp to every member once.
#[tokio::test]
async fn test_backup_count_clamps_to_members() {
    let config = ClusterConfig::test_config().with_backup_count(5);
    let mut c = TestCluster::with_config(3, config).await;

    for p in 0..c.config().partition_count {
        assert_eq!(c.node(1).nodes_for_partition(p).unwrap().len(), 3);
    }

    c.shutdown().await;
}

/// Keys map to the same partition and owners on every node.
#[tokio::test]
async fn test_key_routing_agrees() {
    let mut c = TestCluster::new(3).await;

    for k in 0..100 {
        let key = format!("user:{k}");
        let partition = c.node(0).map_key_to_partition(key.as_bytes());
        assert!(partition < c.config().partition_count);
        for i in 1..3 {
            assert_eq!(c.node(i).map_key_to_partition(key.as_bytes()), partition);
        }
        let primary = c.node(2).primary_for_partition(partition).unwrap().unwrap();
        assert_eq!(owner_ids(c.node(0), partition)[0], primary.id);
    }

    c.shutdown().await;
}

/// Every node's history ends with the view it is running.
#[tokio::test]
async fn test_history_matches_current_view() {
    let mut c = TestCluster::new(3).await;

    for i in 0..3 {
        let node = c.node(i);
        assert_eq!(node.topology().latest().unwrap().id(), node.current_view().id());
    }
    // The coordinator saw all three views; later joiners received them.
    assert_eq!(c.node(0).topology().len(), 3);
    assert_eq!(c.node(2).topology().len(), 3);

    c.shutdown().await;
}

/// A node configured with another secret cannot join.
#[tokio::test]
async fn test_join_with_wrong_secret_refused() {
    let mut c = TestCluster::new(2).await;

    let config = ClusterConfig {
        shared_auth_key: b"not-the-secret".to_vec(),
        ..c.config().clone()
    };
    let stranger = NodeIdentity::new(NodeId::random(), "stranger", NodeRole::Worker);
    let result = ClusterNode::start(config, stranger, c.network().channel(), None).await;
    assert!(matches!(
        result,
        Err(EngineError::JoinRejected(JoinRejection::BadSignature))
    ));
    assert_eq!(c.node(0).current_view().len(), 2);

    c.shutdown().await;
}

/// A node from a differently-named cluster cannot join.
#[tokio::test]
async fn test_join_with_other_cluster_name_refused() {
    let mut c = TestCluster::new(1).await;

    let config = ClusterConfig {
        cluster_name: "elsewhere".into(),
        ..c.config().clone()
    };
    let stranger = NodeIdentity::new(NodeId::random(), "stranger", NodeRole::Worker);
    let result = ClusterNode::start(config, stranger, c.network().channel(), None).await;
    assert!(matches!(
        result,
        Err(EngineError::JoinRejected(JoinRejection::ClusterNameMismatch { .. }))
    ));

    c.shutdown().await;
}
