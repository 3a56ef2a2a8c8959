//! End-to-end test infrastructure for cluster-tree.
//!
//! Provides a shared TestHarness and helper functions for E2E tests
//! covering init, incremental builds, interruption and repair.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio_util::sync::CancellationToken;

use tree_builder::{
    KMeansPartitioner, PartitionError, Partitioner, Partitioning, StorageVectorStore, TreeBuilder,
};
use tree_storage::Storage;
use tree_types::{ItemId, NodeStatus, TreeConfig};

/// Shared test harness for E2E tests.
pub struct TestHarness {
    /// Keeps temp dir alive for the lifetime of the harness
    pub _temp_dir: tempfile::TempDir,
    /// Shared storage instance
    pub storage: Arc<Storage>,
}

impl TestHarness {
    /// Create a new test harness with temp directory and storage.
    pub fn new() -> Self {
        let temp_dir = tempfile::TempDir::new().expect("Failed to create temp dir");
        let storage =
            Arc::new(Storage::open(temp_dir.path()).expect("Failed to open test storage"));
        Self {
            _temp_dir: temp_dir,
            storage,
        }
    }

    /// Store clustering vectors for `(item_id, vector)` pairs.
    pub fn load_vectors(&self, vectors: &[(ItemId, Vec<f32>)]) {
        for (item_id, vector) in vectors {
            self.storage
                .put_vector(*item_id, vector)
                .expect("Failed to put vector");
        }
    }

    /// A builder over the stored vectors with the k-means partitioner.
    pub fn builder(&self, config: TreeConfig) -> TreeBuilder {
        self.builder_with(config, Arc::new(KMeansPartitioner::default()))
    }

    pub fn builder_with(&self, config: TreeConfig, partitioner: Arc<dyn Partitioner>) -> TreeBuilder {
        let vectors = Arc::new(StorageVectorStore::new(Arc::clone(&self.storage)));
        TreeBuilder::new(Arc::clone(&self.storage), vectors, partitioner, config)
            .expect("Failed to create builder")
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

/// Small tree config: explicit threshold, branching factor and depth limit.
pub fn tree_config(leaf_threshold: u64, branching_factor: usize, max_depth: u32) -> TreeConfig {
    TreeConfig {
        leaf_threshold,
        branching_factor,
        max_depth,
        ..Default::default()
    }
}

/// Gaussian-ish blobs around well separated centers.
///
/// Item ids run from 1 in blob order. Noise is uniform in +/-`spread`.
pub fn blob_vectors(
    centers: &[Vec<f32>],
    per_blob: usize,
    spread: f32,
    seed: u64,
) -> Vec<(ItemId, Vec<f32>)> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut vectors = Vec::with_capacity(centers.len() * per_blob);
    let mut next_id: ItemId = 1;
    for center in centers {
        for _ in 0..per_blob {
            let vector = center
                .iter()
                .map(|c| c + rng.random_range(-spread..=spread))
                .collect();
            vectors.push((next_id, vector));
            next_id += 1;
        }
    }
    vectors
}

/// Evenly spaced centers along each axis of a `dim`-dimensional space.
pub fn axis_centers(count: usize, dim: usize, scale: f32) -> Vec<Vec<f32>> {
    (0..count)
        .map(|i| {
            let mut center = vec![0.0; dim];
            center[i % dim] = scale * (1 + i / dim) as f32;
            center
        })
        .collect()
}

/// Node shape: depth, status, member count and the items it holds.
pub type NodeShape = (u32, String, u64, Vec<ItemId>);

/// Canonical shape of a tree, independent of node ids, sorted.
///
/// Expanded nodes hold no items; their member count still tells them apart.
pub fn tree_shape(storage: &Storage) -> Vec<NodeShape> {
    let nodes = storage.list_nodes().expect("Failed to list nodes");
    let mut members: HashMap<u64, Vec<ItemId>> = HashMap::new();
    storage
        .for_each_member(|node_id, item_id| members.entry(node_id).or_default().push(item_id))
        .expect("Failed to scan members");

    let mut shape: Vec<NodeShape> = nodes
        .into_iter()
        .map(|node| {
            let mut items = members.remove(&node.node_id).unwrap_or_default();
            items.sort_unstable();
            (node.depth, node.status.to_string(), node.member_count, items)
        })
        .collect();
    shape.sort();
    shape
}

/// Count nodes with the given status.
pub fn count_status(storage: &Storage, status: NodeStatus) -> usize {
    storage
        .list_nodes()
        .expect("Failed to list nodes")
        .iter()
        .filter(|n| n.status == status)
        .count()
}

/// Partitioner that fires a cancellation token after a number of calls.
///
/// Simulates an operator interrupt landing in the middle of a batch.
pub struct InterruptingPartitioner {
    inner: KMeansPartitioner,
    cancel: CancellationToken,
    calls: AtomicUsize,
    interrupt_after: usize,
}

impl InterruptingPartitioner {
    pub fn new(cancel: CancellationToken, interrupt_after: usize) -> Self {
        Self {
            inner: KMeansPartitioner::default(),
            cancel,
            calls: AtomicUsize::new(0),
            interrupt_after,
        }
    }
}

impl Partitioner for InterruptingPartitioner {
    fn partition(
        &self,
        vectors: &[Vec<f32>],
        k: usize,
        seed: u64,
    ) -> Result<Partitioning, PartitionError> {
        let result = self.inner.partition(vectors, k, seed);
        if self.calls.fetch_add(1, Ordering::SeqCst) + 1 >= self.interrupt_after {
            self.cancel.cancel();
        }
        result
    }
}
