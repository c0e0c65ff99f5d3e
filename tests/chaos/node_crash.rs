//! Chaos test: node crashes.
//!
//! A crashed node is removed as a suspect without being told. Survivors
//! install a new view, repartition around the hole, and keep admitting
//! joiners even when the coordinator was the one that died.

use atoll_integration_tests::TestCluster;
use atoll_types::NodeId;

#[tokio::test]
#[ntest::timeout(30000)]
async fn test_crashed_node_removed_from_tables() {
    let mut c = TestCluster::new(4).await;
    let victim = c.id(2);
    let stale = c.node(2).current_view().id();

    c.crash(2);
    c.wait_for_group(&[0, 1, 3]).await;

    for i in [0, 1, 3] {
        assert!(!c.node(i).current_view().contains(&victim));
        for partition in c.node(i).metadata().snapshot().partitions() {
            assert!(
                partition.nodes.iter().all(|n| n.id != victim),
                "node {i} still routes partition {} to the crashed node",
                partition.number
            );
            assert_eq!(partition.nodes.len(), 2);
        }
    }

    // The victim never heard about its own removal.
    assert_eq!(c.node(2).current_view().id(), stale);
    assert_eq!(c.node(2).current_view().len(), 4);

    c.shutdown().await;
}

#[tokio::test]
#[ntest::timeout(30000)]
async fn test_coordinator_crash_elects_successor() {
    let mut c = TestCluster::new(4).await;
    assert!(c.node(0).is_coordinator());

    c.crash(0);
    let survivors = [1, 2, 3];
    c.wait_for_group(&survivors).await;

    // Equal weights: the lowest id takes over.
    let expected = survivors.iter().map(|&i| c.id(i)).min().unwrap();
    for i in survivors {
        let view = c.node(i).current_view();
        assert_eq!(view.coordinator().unwrap().id, expected);
        assert_eq!(c.node(i).is_coordinator(), c.id(i) == expected);
    }

    // The new coordinator admits joiners and hands them its history.
    let joiner = c.add_node().await;
    c.wait_for_group(&[1, 2, 3, joiner]).await;
    let latest = c.node(joiner).topology().latest().unwrap();
    assert_eq!(latest.id(), c.node(1).current_view().id());
    assert!(c.node(joiner).topology().len() > 1);

    c.shutdown().await;
}

#[tokio::test]
#[ntest::timeout(30000)]
async fn test_successive_crashes_leave_last_node_owning_everything() {
    let mut c = TestCluster::new(3).await;

    c.crash(1);
    c.wait_for_group(&[0, 2]).await;
    c.crash(0);
    c.wait_for_group(&[2]).await;

    let last: NodeId = c.id(2);
    assert!(c.node(2).is_coordinator());
    for p in 0..c.config().partition_count {
        let owners = c.node(2).nodes_for_partition(p).unwrap();
        assert_eq!(owners.len(), 1, "backups clamp to the only member");
        assert_eq!(owners[0].id, last);
    }

    c.shutdown().await;
}
