//! Integration test: rebalancing on membership change.
//!
//! Rendezvous placement moves a partition only when the joining node
//! outranks one of its owners, or when one of its owners leaves.

use std::collections::{BTreeSet, HashMap};

use atoll_integration_tests::{TestCluster, wait_for};
use atoll_types::NodeId;

fn table(c: &TestCluster, i: usize) -> HashMap<u32, Vec<NodeId>> {
    c.node(i)
        .metadata()
        .snapshot()
        .partitions()
        .iter()
        .map(|p| (p.number, p.nodes.iter().map(|n| n.id).collect()))
        .collect()
}

/// Adding a node changes exactly the partitions it now owns.
#[tokio::test]
#[ntest::timeout(30000)]
async fn test_join_moves_only_displaced_partitions() {
    let mut c = TestCluster::new(3).await;
    let before = table(&c, 0);

    let mut events = c.node(0).subscribe_partitions();
    let joiner = c.add_node().await;
    c.wait_for_members(4).await;
    let after = table(&c, 0);
    let new_id = c.id(joiner);

    let mut moved = BTreeSet::new();
    for (p, owners) in &after {
        if owners.contains(&new_id) {
            moved.insert(*p);
        } else {
            assert_eq!(owners, &before[p], "partition {p} moved without the new node");
        }
    }

    let event = events.recv().await.unwrap();
    assert_eq!(event.view_id, c.node(0).current_view().id());
    let changed: BTreeSet<u32> = event.changed.into_iter().collect();
    assert_eq!(changed, moved);

    c.shutdown().await;
}

/// A graceful leave hands the leaver's partitions to survivors only.
#[tokio::test]
#[ntest::timeout(30000)]
async fn test_leave_rebalances_to_survivors() {
    let mut c = TestCluster::new(4).await;
    let before = table(&c, 0);
    let leaver = c.id(2);

    c.stop(2).await;
    c.wait_for_members(3).await;

    for i in [0, 1, 3] {
        let after = table(&c, i);
        for (p, owners) in &after {
            assert!(!owners.contains(&leaver), "node {i} still routes {p} to the leaver");
            assert_eq!(owners.len(), 2);
            if !before[p].contains(&leaver) {
                assert_eq!(owners, &before[p], "partition {p} moved needlessly");
            }
        }
    }

    c.shutdown().await;
}

/// When the coordinator leaves, the heaviest survivor takes over.
#[tokio::test]
#[ntest::timeout(30000)]
async fn test_heaviest_survivor_becomes_coordinator() {
    let mut c = TestCluster::new(1).await;
    let light = c.add_weighted_node(0.5).await;
    let heavy = c.add_weighted_node(4.0).await;
    c.wait_for_members(3).await;

    // Coordinator is pinned while it lives; the rest order by weight.
    let members = c.node(0).current_view().member_ids();
    assert_eq!(members, vec![c.id(0), c.id(heavy), c.id(light)]);

    c.stop(0).await;
    wait_for("heavy node to coordinate", || c.node(heavy).is_coordinator()).await;
    assert!(!c.node(light).is_coordinator());

    c.shutdown().await;
}

/// Closure listeners observe every repartition in order.
#[tokio::test]
#[ntest::timeout(30000)]
async fn test_partition_listener_sees_each_view() {
    let mut c = TestCluster::new(1).await;

    let seen = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
    let listener = c.node(0).on_partitions_changed({
        let seen = seen.clone();
        move |event| {
            let seen = seen.clone();
            async move {
                seen.lock().unwrap().push(event.view_id);
            }
        }
    });

    c.add_node().await;
    c.add_node().await;
    c.wait_for_members(3).await;
    wait_for("listener to see two views", || seen.lock().unwrap().len() == 2).await;

    let ids = seen.lock().unwrap().clone();
    assert!(ids[0] < ids[1]);
    assert_eq!(ids[1], c.node(0).current_view().id());

    c.shutdown().await;
    listener.await.unwrap();
}
