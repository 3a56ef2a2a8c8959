//! Interruption and resume E2E tests for cluster-tree.
//!
//! A build interrupted at any point and resumed must produce the same tree
//! an uninterrupted build produces, without duplicate or missing nodes.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Duration;
use pretty_assertions::assert_eq;
use tokio_util::sync::CancellationToken;

use e2e_tests::{
    axis_centers, blob_vectors, tree_config, tree_shape, InterruptingPartitioner, TestHarness,
};
use tree_builder::{ConsistencyValidator, FrontierTracker, TreeNavigator};
use tree_types::{ItemId, NodeStatus, TreeConfig};

fn corpus() -> Vec<(ItemId, Vec<f32>)> {
    blob_vectors(&axis_centers(6, 3, 25.0), 30, 1.5, 99)
}

fn config() -> TreeConfig {
    tree_config(20, 3, 6)
}

fn assert_consistent(harness: &TestHarness) {
    let report = ConsistencyValidator::new(harness.storage.clone(), Duration::seconds(3600))
        .validate()
        .unwrap();
    assert!(report.is_consistent(), "violations: {:?}", report.violations);
}

fn build_uninterrupted() -> TestHarness {
    let harness = TestHarness::new();
    harness.load_vectors(&corpus());
    let builder = harness.builder(config());
    builder.init("testwiki").unwrap();
    builder.run_until_complete().unwrap();
    harness
}

/// Seven items: the first run splits the root only; the resumed run adds
/// no further children to it.
#[test]
fn test_resume_after_root_split_creates_no_duplicates() {
    let harness = TestHarness::new();
    harness.load_vectors(&[
        (1, vec![0.0, 0.1]),
        (2, vec![0.1, 0.0]),
        (3, vec![0.2, 0.1]),
        (4, vec![0.1, 0.2]),
        (5, vec![10.0, 10.1]),
        (6, vec![10.1, 10.0]),
        (7, vec![10.2, 10.2]),
    ]);

    let first = harness.builder(tree_config(5, 2, 3));
    let root_id = first.init("testwiki").unwrap();
    let report = first.run(1).unwrap();
    assert_eq!(report.expanded, 1);
    drop(first);
    assert_consistent(&harness);

    let second = harness.builder(tree_config(5, 2, 3));
    assert_eq!(second.init("testwiki").unwrap(), root_id);
    let report = second.run_until_complete().unwrap();
    assert_eq!(report.expanded, 0);

    let nav = TreeNavigator::new(harness.storage.clone());
    assert_eq!(nav.get_children(root_id).unwrap().len(), 2);
    assert_eq!(nav.stats().unwrap().node_count, 3);
    assert_consistent(&harness);
}

/// Batches of one node at a time build the same tree as one long run.
#[test]
fn test_batched_build_matches_uninterrupted() {
    let reference = build_uninterrupted();

    let harness = TestHarness::new();
    harness.load_vectors(&corpus());
    harness.builder(config()).init("testwiki").unwrap();

    let mut invocations = 0;
    loop {
        // A fresh builder per invocation, as a new process would have
        let report = harness.builder(config()).run(1).unwrap();
        if report.claimed == 0 {
            break;
        }
        invocations += 1;
        assert_consistent(&harness);
        assert!(invocations < 10_000, "build did not converge");
    }

    assert_eq!(tree_shape(&harness.storage), tree_shape(&reference.storage));
}

/// Cancellation mid-batch releases unprocessed claims; resuming completes
/// the same tree.
#[test]
fn test_cancelled_build_resumes_to_same_tree() {
    let reference = build_uninterrupted();

    let harness = TestHarness::new();
    harness.load_vectors(&corpus());
    harness.builder(config()).init("testwiki").unwrap();

    for interrupt_after in [1, 2, 3] {
        let cancel = CancellationToken::new();
        let partitioner = Arc::new(InterruptingPartitioner::new(cancel.clone(), interrupt_after));
        let builder = harness
            .builder_with(config(), partitioner)
            .with_cancellation(cancel);
        let report = builder.run_until_complete().unwrap();

        let stats = TreeNavigator::new(harness.storage.clone()).stats().unwrap();
        assert!(report.cancelled || stats.complete);
        assert_eq!(stats.claimed_count, 0, "cancelled run left claims behind");
        assert_consistent(&harness);
    }

    harness.builder(config()).run_until_complete().unwrap();
    assert_eq!(tree_shape(&harness.storage), tree_shape(&reference.storage));
}

/// A worker that claimed nodes and died leaves claims that block nobody
/// else's progress and are recovered by a sweep.
#[test]
fn test_crashed_worker_claims_are_swept() {
    let reference = build_uninterrupted();

    let harness = TestHarness::new();
    harness.load_vectors(&corpus());
    let builder = harness.builder(config());
    builder.init("testwiki").unwrap();
    builder.run(1).unwrap();

    // Claim the whole frontier and never process it
    let crashed = FrontierTracker::new(harness.storage.clone(), config());
    let stranded = crashed.next_batch(100).unwrap();
    assert!(!stranded.is_empty());
    drop(crashed);
    assert_consistent(&harness);

    // A fresh claim is not stale yet; nothing left to take
    let report = harness.builder(config()).run(100).unwrap();
    assert_eq!(report.claimed, 0);

    std::thread::sleep(StdDuration::from_millis(5));
    let sweeper = FrontierTracker::new(harness.storage.clone(), config());
    let mut released = sweeper.sweep_stale_claims(Duration::zero()).unwrap();
    released.sort_unstable();
    assert_eq!(released, stranded);

    for node_id in &stranded {
        let node = harness.storage.get_node(*node_id).unwrap().unwrap();
        assert_eq!(node.status, NodeStatus::Expandable);
    }

    harness.builder(config()).run_until_complete().unwrap();
    assert_consistent(&harness);
    assert_eq!(tree_shape(&harness.storage), tree_shape(&reference.storage));
}

/// After the root split, a fresh tracker hands out exactly the root's
/// expandable children in creation order.
#[test]
fn test_resumed_frontier_is_root_children() {
    let harness = TestHarness::new();
    harness.load_vectors(&corpus());
    let builder = harness.builder(config());
    let root_id = builder.init("testwiki").unwrap();
    assert_eq!(builder.run(1).unwrap().expanded, 1);
    drop(builder);

    let nav = TreeNavigator::new(harness.storage.clone());
    let children = nav.get_children(root_id).unwrap();
    assert!(children.len() >= 2);
    assert!(children.iter().all(|c| c.status == NodeStatus::Expandable));
    let mut child_ids: Vec<u64> = children.iter().map(|c| c.node_id).collect();
    child_ids.sort_unstable();

    let resumed = FrontierTracker::new(harness.storage.clone(), config());
    assert_eq!(resumed.next_batch(100).unwrap(), child_ids);
    assert!(resumed.next_batch(100).unwrap().is_empty());
}

/// Two workers on one store never take the same node.
#[test]
fn test_workers_claim_disjoint_batches() {
    let harness = TestHarness::new();
    harness.load_vectors(&corpus());
    let builder = harness.builder(config());
    builder.init("testwiki").unwrap();
    builder.run(1).unwrap();

    let first = FrontierTracker::new(harness.storage.clone(), config());
    let second = first.worker();
    assert_ne!(first.run_id(), second.run_id());

    let handles: Vec<_> = [first, second]
        .into_iter()
        .map(|tracker| std::thread::spawn(move || tracker.next_batch(2).unwrap()))
        .collect();
    let mut claimed: Vec<u64> = handles
        .into_iter()
        .flat_map(|h| h.join().unwrap())
        .collect();
    let total = claimed.len();
    claimed.sort_unstable();
    claimed.dedup();
    assert_eq!(claimed.len(), total, "a node was claimed twice");
}

/// Limit zero changes nothing.
#[test]
fn test_limit_zero_is_noop() {
    let harness = TestHarness::new();
    harness.load_vectors(&corpus());
    let builder = harness.builder(config());
    builder.init("testwiki").unwrap();

    let before = tree_shape(&harness.storage);
    let report = builder.run(0).unwrap();
    assert_eq!(report.claimed, 0);
    assert_eq!(tree_shape(&harness.storage), before);
}
