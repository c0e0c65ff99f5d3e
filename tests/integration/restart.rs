//! Integration test: restarts over persisted state.
//!
//! A node keeps its id and view history across restarts, and refuses to
//! start if the cluster shape it persisted no longer matches its config.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use atoll_cluster::{ClusterConfig, ClusterError, JoinRejection, TopologyStore};
use atoll_engine::{ClusterNode, EngineError, LocalNetwork};
use atoll_integration_tests::TestCluster;
use atoll_meta::MetaStore;
use atoll_types::{HlcTimestamp, NodeId, NodeIdentity, NodeRole, View, ViewId};

#[tokio::test]
async fn test_restart_keeps_identity_and_history() {
    let mut c = TestCluster::new(2).await;
    let id = c.id(1);
    let first_views: Vec<_> = c.node(1).topology().history().iter().map(|v| v.id()).collect();

    c.restart(1).await.unwrap();
    c.wait_for_members(2).await;

    assert_eq!(c.node(1).local_identity().id, id);
    let history: Vec<_> = c.node(1).topology().history().iter().map(|v| v.id()).collect();
    for old in &first_views {
        assert!(history.contains(old), "view {old} lost across restart");
    }
    // Leave and rejoin add two views.
    assert_eq!(history.len(), first_views.len() + 2);
    assert_eq!(history[0], c.node(1).current_view().id());

    c.shutdown().await;
}

#[tokio::test]
async fn test_restart_with_new_partition_count_refused() {
    let mut c = TestCluster::with_config(1, ClusterConfig::test_config().with_partition_count(8)).await;

    let changed = c.config().clone().with_partition_count(32);
    let err = c.restart_with(0, changed).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::Cluster(ClusterError::ShapeChanged {
            persisted_partitions: 8,
            configured_partitions: 32,
            ..
        })
    ));

    // The original shape still starts.
    c.restart(0).await.unwrap();
    c.shutdown().await;
}

#[tokio::test]
async fn test_backup_count_change_persisted_but_checked_at_join() {
    let mut c = TestCluster::new(2).await;

    // A lone node may change its backup count; the new shape is persisted.
    c.stop(1).await;
    let changed = c.config().clone().with_backup_count(2);
    c.restart_with(0, changed.clone()).await.unwrap();
    assert_eq!(c.meta(0).get_shape().unwrap().unwrap().backup_count, 2);

    // A joiner still configured with the old count is refused.
    let err = c.restart(1).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::JoinRejected(JoinRejection::BackupCountMismatch { .. })
    ));

    c.restart_with(1, changed).await.unwrap();
    c.wait_for_members(2).await;
    c.shutdown().await;
}

#[tokio::test]
async fn test_history_bounded_by_retention() {
    let config = ClusterConfig::test_config().with_retention_count(3);
    let mut c = TestCluster::with_config(5, config).await;

    // Node 0 saw five views but keeps only the newest three, on disk too.
    let history = c.node(0).topology().history();
    assert_eq!(history.len(), 3);
    assert_eq!(history[0].len(), 5);
    assert_eq!(c.meta(0).view_count().unwrap(), 3);

    c.shutdown().await;
}

/// History persisted while the wall clock ran ahead must not swallow the
/// views accepted after restart.
#[tokio::test]
async fn test_restart_behind_persisted_history_keeps_new_views() {
    let config = ClusterConfig::test_config();
    let meta = Arc::new(MetaStore::open_temporary().unwrap());
    let local = NodeIdentity::new(NodeId::random(), "host-0", NodeRole::Worker);

    let hour_ahead = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_millis() as u64
        + 3_600_000;
    {
        let store = TopologyStore::open(meta.clone(), config.retention_count).unwrap();
        for i in 0..config.retention_count as u64 {
            let id = ViewId::new(HlcTimestamp::new(hour_ahead + i, 0), local.id);
            store.record(&View::new(id, vec![local.clone()])).unwrap();
        }
    }

    let network = LocalNetwork::new();
    let node = ClusterNode::start(config.clone(), local, network.channel(), Some(meta.clone()))
        .await
        .unwrap();

    let current = node.current_view();
    assert!(current.id().timestamp > HlcTimestamp::new(hour_ahead, 0));
    assert_eq!(node.topology().latest().unwrap().id(), current.id());
    assert_eq!(node.view_as_of(current.id().timestamp).unwrap().id(), current.id());
    assert_eq!(node.topology().len(), config.retention_count);
    assert!(meta.list_views().unwrap().iter().any(|v| v.id() == current.id()));

    node.shutdown().await.unwrap();
}
