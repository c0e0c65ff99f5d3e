//! Chaos test: network partition.
//!
//! 6-node cluster split 3 vs 3. Each side elects its own coordinator and
//! repartitions over its own members. Healing merges the subviews and every
//! node converges on one table again.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use atoll_integration_tests::{TestCluster, within};
use atoll_types::NodeId;

#[tokio::test]
#[ntest::timeout(30000)]
async fn test_split_brain_and_heal() {
    let mut c = TestCluster::new(6).await;
    let side_a = [0, 1, 2];
    let side_b = [3, 4, 5];

    // --- Phase 1: split ---
    c.split(&[&side_a, &side_b]);
    c.wait_for_group(&side_a).await;
    c.wait_for_group(&side_b).await;

    // Side A keeps the original coordinator; side B elects one of its own.
    assert!(c.node(0).is_coordinator());
    let b_coordinator = c.node(3).current_view().coordinator().unwrap().id;
    let b_ids: HashSet<NodeId> = side_b.iter().map(|&i| c.id(i)).collect();
    assert!(b_ids.contains(&b_coordinator));
    assert_eq!(
        side_b.iter().filter(|&&i| c.node(i).is_coordinator()).count(),
        1
    );

    // --- Phase 2: each side only routes to itself ---
    for (side, ids) in [
        (&side_a, side_a.iter().map(|&i| c.id(i)).collect::<HashSet<_>>()),
        (&side_b, b_ids.clone()),
    ] {
        for &i in side.iter() {
            for partition in c.node(i).metadata().snapshot().partitions() {
                assert!(
                    partition.nodes.iter().all(|n| ids.contains(&n.id)),
                    "node {i} routes partition {} across the split",
                    partition.number
                );
            }
        }
    }

    // --- Phase 3: heal ---
    c.heal();
    c.wait_for_members(6).await;

    let view = c.node(0).current_view();
    assert_eq!(c.network().subviews().len(), 1);
    assert_eq!(
        (0..6).filter(|&i| c.node(i).is_coordinator()).count(),
        1,
        "exactly one coordinator after heal"
    );
    let reference = c.node(0).metadata().snapshot();
    for i in 1..6 {
        assert_eq!(c.node(i).current_view().id(), view.id());
        let table = c.node(i).metadata().snapshot();
        for (a, b) in reference.partitions().iter().zip(table.partitions()) {
            let left: Vec<NodeId> = a.nodes.iter().map(|n| n.id).collect();
            let right: Vec<NodeId> = b.nodes.iter().map(|n| n.id).collect();
            assert_eq!(left, right, "partition {} on node {i}", a.number);
        }
    }

    c.shutdown().await;
}

/// A lone node owns everything while cut off, then rejoins on heal.
#[tokio::test]
#[ntest::timeout(30000)]
async fn test_uneven_split_heal_restores_single_view() {
    let mut c = TestCluster::new(5).await;

    c.split(&[&[0], &[1, 2, 3, 4]]);
    c.wait_for_group(&[0]).await;
    c.wait_for_group(&[1, 2, 3, 4]).await;
    assert_eq!(c.node(0).current_view().len(), 1);

    // A lone node owns every partition of its side.
    let lone = c.id(0);
    for p in 0..c.config().partition_count {
        let owners = c.node(0).nodes_for_partition(p).unwrap();
        assert_eq!(owners.len(), 1);
        assert_eq!(owners[0].id, lone);
    }

    c.heal();
    c.wait_for_members(5).await;
    c.shutdown().await;
}

/// Lookups keep answering with a full table while views churn.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ntest::timeout(30000)]
async fn test_lookups_never_block_during_churn() {
    let mut c = TestCluster::new(3).await;
    let partitions = c.config().partition_count;
    let metadata = c.node(0).metadata().clone();

    let stop = Arc::new(AtomicBool::new(false));
    let reads = Arc::new(AtomicUsize::new(0));
    let mut readers = Vec::new();
    for _ in 0..4 {
        let metadata = metadata.clone();
        let stop = stop.clone();
        let reads = reads.clone();
        readers.push(tokio::task::spawn_blocking(move || {
            while !stop.load(Ordering::Relaxed) {
                let table = metadata.snapshot();
                assert_eq!(table.len(), partitions as usize);
                for partition in table.partitions() {
                    // Every owner list is internally consistent with its view.
                    assert!(!partition.nodes.is_empty());
                }
                reads.fetch_add(1, Ordering::Relaxed);
            }
        }));
    }

    for _ in 0..3 {
        let slot = c.add_node().await;
        c.split(&[&[0, 1], &[2]]);
        c.heal();
        c.stop(slot).await;
    }
    let running = c.running().len();
    c.wait_for_members(running).await;

    stop.store(true, Ordering::Relaxed);
    for reader in readers {
        within(5, reader).await.unwrap();
    }
    assert!(reads.load(Ordering::Relaxed) > 0);

    c.shutdown().await;
}
