//! Tree builder.
//!
//! Each invocation claims up to `limit` frontier nodes and processes them
//! in creation order:
//!
//! 1. Leaf-sized nodes (member count at or below the threshold, or depth at
//!    the maximum) are marked leaf.
//! 2. Otherwise the members' vectors are partitioned into at most k
//!    clusters with the node's own seed.
//! 3. A split with a single cluster marks the node leaf instead.
//! 4. The children are committed in one atomic expansion.
//! 5. Each child is immediately leaf-marked or left expandable.
//!
//! Commits are per node. A failure on one node releases only that node's
//! claim; storage and vector store failures abort the invocation.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use tree_storage::Storage;
use tree_types::{ItemId, NodeId, NodeStatus, TreeConfig};

use crate::allocator::{NodeAllocator, Partition};
use crate::centroids::CentroidBackfill;
use crate::error::TreeError;
use crate::frontier::FrontierTracker;
use crate::partition::{node_seed, PartitionError, Partitioner, Partitioning};
use crate::silhouette::silhouette_score;
use crate::vectors::VectorStore;

/// A node whose processing failed and whose claim was released.
#[derive(Debug, Clone, Serialize)]
pub struct NodeFailure {
    pub node_id: NodeId,
    pub error: String,
}

/// Outcome of one or more builder invocations.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BuildReport {
    pub run_id: String,
    /// Frontier nodes claimed
    pub claimed: usize,
    /// Nodes split into children
    pub expanded: usize,
    /// Nodes that became leaves (claimed nodes and new children)
    pub leaves: usize,
    /// Children created by expansions
    pub children_created: usize,
    /// New children left on the frontier
    pub enqueued: usize,
    /// Splits that found no separation
    pub degenerate: usize,
    /// Splits rejected by the silhouette gate
    pub low_quality: usize,
    /// Members excluded from partitioning for lack of a vector
    pub missing_vectors: usize,
    /// Members excluded for a non-finite value or a stray dimension
    pub malformed_vectors: usize,
    /// Nodes leaf-marked because they had nothing to partition
    pub anomalies: usize,
    pub failures: Vec<NodeFailure>,
    /// Stopped early on cancellation
    pub cancelled: bool,
}

impl BuildReport {
    fn new(run_id: &str) -> Self {
        Self {
            run_id: run_id.to_string(),
            ..Default::default()
        }
    }

    fn absorb(&mut self, other: BuildReport) {
        self.claimed += other.claimed;
        self.expanded += other.expanded;
        self.leaves += other.leaves;
        self.children_created += other.children_created;
        self.enqueued += other.enqueued;
        self.degenerate += other.degenerate;
        self.low_quality += other.low_quality;
        self.missing_vectors += other.missing_vectors;
        self.malformed_vectors += other.malformed_vectors;
        self.anomalies += other.anomalies;
        self.failures.extend(other.failures);
        self.cancelled |= other.cancelled;
    }
}

/// Orchestrates incremental, resumable tree construction.
pub struct TreeBuilder {
    storage: Arc<Storage>,
    vectors: Arc<dyn VectorStore>,
    partitioner: Arc<dyn Partitioner>,
    config: TreeConfig,
    allocator: NodeAllocator,
    frontier: FrontierTracker,
    cancel: CancellationToken,
}

impl TreeBuilder {
    pub fn new(
        storage: Arc<Storage>,
        vectors: Arc<dyn VectorStore>,
        partitioner: Arc<dyn Partitioner>,
        config: TreeConfig,
    ) -> Result<Self, TreeError> {
        config.validate().map_err(TreeError::InvalidConfig)?;
        Ok(Self {
            allocator: NodeAllocator::new(Arc::clone(&storage)),
            frontier: FrontierTracker::new(Arc::clone(&storage), config.clone()),
            storage,
            vectors,
            partitioner,
            config,
            cancel: CancellationToken::new(),
        })
    }

    /// Stop between nodes once `cancel` fires.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn run_id(&self) -> &str {
        self.frontier.run_id()
    }

    pub fn allocator(&self) -> &NodeAllocator {
        &self.allocator
    }

    pub fn frontier(&self) -> &FrontierTracker {
        &self.frontier
    }

    /// Allocate the root over every vectorized item. Idempotent.
    #[instrument(skip(self))]
    pub fn init(&self, corpus: &str) -> Result<NodeId, TreeError> {
        if self.allocator.root_id()?.is_some() {
            let root_id = self.allocator.allocate_root(&[], corpus)?;
            debug!(root_id, "Tree already initialized");
            return Ok(root_id);
        }

        let item_ids = self.vectors.item_ids()?;
        if item_ids.is_empty() {
            return Err(TreeError::EmptyCorpus);
        }

        let root_id = self.allocator.allocate_root(&item_ids, corpus)?;
        let status = self.frontier.mark_expandable(root_id)?;
        CentroidBackfill::new(self.allocator.clone(), Arc::clone(&self.vectors))
            .fill_node(root_id)?;

        info!(root_id, items = item_ids.len(), %status, "Initialized tree");
        Ok(root_id)
    }

    /// Claim and process up to `limit` frontier nodes.
    ///
    /// `limit = 0` and an empty frontier are both no-ops.
    #[instrument(skip(self), fields(run_id = %self.run_id()))]
    pub fn run(&self, limit: usize) -> Result<BuildReport, TreeError> {
        let mut report = BuildReport::new(self.run_id());
        if limit == 0 {
            return Ok(report);
        }
        if self.cancel.is_cancelled() {
            report.cancelled = true;
            return Ok(report);
        }

        let claimed = self.frontier.next_batch(limit)?;
        report.claimed = claimed.len();
        if claimed.is_empty() {
            debug!("Frontier empty");
            return Ok(report);
        }
        info!(claimed = claimed.len(), "Processing frontier batch");

        for (position, &node_id) in claimed.iter().enumerate() {
            if self.cancel.is_cancelled() {
                info!(remaining = claimed.len() - position, "Cancelled, releasing claims");
                self.release_all(&claimed[position..]);
                report.cancelled = true;
                break;
            }

            match self.process_node(node_id, &mut report) {
                Ok(()) => {}
                Err(e) if e.is_node_local() => {
                    warn!(node_id, error = %e, "Node failed, releasing claim");
                    self.frontier.release(node_id)?;
                    report.failures.push(NodeFailure {
                        node_id,
                        error: e.to_string(),
                    });
                }
                Err(e) => {
                    error!(node_id, error = %e, "Aborting run");
                    self.release_all(&claimed[position..]);
                    return Err(e);
                }
            }
        }

        info!(
            expanded = report.expanded,
            leaves = report.leaves,
            children = report.children_created,
            failures = report.failures.len(),
            "Run complete"
        );
        Ok(report)
    }

    /// Repeat [`TreeBuilder::run`] with the configured batch limit until
    /// the frontier is empty, a run makes no progress, or cancellation.
    pub fn run_until_complete(&self) -> Result<BuildReport, TreeError> {
        let mut total = BuildReport::new(self.run_id());
        loop {
            let report = self.run(self.config.batch_limit)?;
            let claimed = report.claimed;
            let progressed = report.expanded + report.leaves > 0;
            let cancelled = report.cancelled;
            total.absorb(report);

            if claimed == 0 || cancelled {
                break;
            }
            if !progressed {
                warn!("No progress in last run, stopping");
                break;
            }
        }
        Ok(total)
    }

    /// Best-effort release of claims this run will not process.
    fn release_all(&self, node_ids: &[NodeId]) {
        for &node_id in node_ids {
            if let Err(e) = self.frontier.release(node_id) {
                warn!(node_id, error = %e, "Failed to release claim; sweep will recover it");
            }
        }
    }

    fn process_node(&self, node_id: NodeId, report: &mut BuildReport) -> Result<(), TreeError> {
        let node = self
            .storage
            .get_node(node_id)?
            .ok_or(TreeError::NodeNotFound(node_id))?;
        if node.status != NodeStatus::Claimed {
            return Err(TreeError::InvalidState {
                node_id,
                status: node.status,
                operation: "expand",
            });
        }

        if self.config.is_leaf_sized(node.member_count, node.depth) {
            self.frontier.mark_leaf(node_id)?;
            report.leaves += 1;
            return Ok(());
        }

        let members = self.storage.get_members(node_id, None)?;
        if members.is_empty() {
            warn!(node_id, member_count = node.member_count, "Node has no indexed members");
            self.frontier.mark_leaf(node_id)?;
            report.anomalies += 1;
            report.leaves += 1;
            return Ok(());
        }

        let LoadedVectors {
            item_ids,
            vectors,
            excluded,
            missing,
            malformed,
        } = self.load_vectors(node_id, &members)?;
        report.missing_vectors += missing;
        report.malformed_vectors += malformed;
        if vectors.len() < 2 {
            warn!(node_id, usable = vectors.len(), "Too few vectors to split");
            self.frontier.mark_leaf(node_id)?;
            report.anomalies += 1;
            report.leaves += 1;
            return Ok(());
        }

        let k = self.config.target_k(vectors.len() as u64);
        let seed = node_seed(self.config.seed, node_id);
        let partitioning = self.partition(node_id, &vectors, k, seed)?;

        if partitioning.is_degenerate() {
            info!(node_id, members = vectors.len(), k, "No separation found, marking leaf");
            self.frontier.mark_leaf(node_id)?;
            report.degenerate += 1;
            report.leaves += 1;
            return Ok(());
        }

        if let Some(min) = self.config.min_silhouette {
            if let Some(score) = silhouette_score(
                &vectors,
                &partitioning.assignment,
                self.config.silhouette_sample_size,
                seed,
            ) {
                if score < min {
                    info!(node_id, score, min, "Split below silhouette gate, marking leaf");
                    self.frontier.mark_leaf(node_id)?;
                    report.low_quality += 1;
                    report.leaves += 1;
                    return Ok(());
                }
            }
        }

        let partitions = group_members(&item_ids, partitioning, excluded);
        debug!(node_id, k, clusters = partitions.len(), "Partitioned node");

        let children =
            self.allocator
                .allocate_claimed_children(node_id, self.run_id(), partitions)?;
        report.expanded += 1;
        report.children_created += children.len();

        for child_id in children {
            match self.frontier.mark_expandable(child_id)? {
                NodeStatus::Leaf => report.leaves += 1,
                _ => report.enqueued += 1,
            }
        }
        Ok(())
    }

    /// Split members into usable vectors and excluded items.
    ///
    /// A usable vector is finite and has the node's common dimension (the
    /// most frequent one). Everything else is excluded from partitioning
    /// and logged per item; excluded items still follow their node.
    fn load_vectors(&self, node_id: NodeId, members: &[ItemId]) -> Result<LoadedVectors, TreeError> {
        let loaded = self.vectors.get_vectors(members)?;
        let dim = common_dimension(&loaded);

        let mut result = LoadedVectors {
            item_ids: Vec::with_capacity(members.len()),
            vectors: Vec::with_capacity(members.len()),
            ..Default::default()
        };
        for (&item, vector) in members.iter().zip(loaded) {
            match vector {
                Some(v) if Some(v.len()) == dim && v.iter().all(|x| x.is_finite()) => {
                    result.item_ids.push(item);
                    result.vectors.push(v);
                }
                Some(v) => {
                    warn!(
                        node_id,
                        item_id = item,
                        len = v.len(),
                        expected = dim,
                        "Malformed vector, item excluded from partitioning"
                    );
                    result.malformed += 1;
                    result.excluded.push(item);
                }
                None => {
                    result.missing += 1;
                    result.excluded.push(item);
                }
            }
        }

        if result.missing > 0 {
            warn!(
                node_id,
                missing = result.missing,
                "Members without vectors excluded from partitioning"
            );
        }
        Ok(result)
    }

    fn partition(
        &self,
        node_id: NodeId,
        vectors: &[Vec<f32>],
        k: usize,
        seed: u64,
    ) -> Result<Partitioning, TreeError> {
        let partitioning = self
            .partitioner
            .partition(vectors, k, seed)
            .map_err(|source| TreeError::Partition { node_id, source })?;

        let clusters = partitioning.centroids.len();
        if partitioning.assignment.len() != vectors.len()
            || partitioning.assignment.iter().any(|&c| c >= clusters)
        {
            return Err(TreeError::Partition {
                node_id,
                source: PartitionError::Backend(format!(
                    "assignment covers {} of {} vectors with {} centroids",
                    partitioning.assignment.len(),
                    vectors.len(),
                    clusters
                )),
            });
        }
        Ok(partitioning.compact())
    }
}

/// Member vectors of one node, split by usability.
#[derive(Debug, Default)]
struct LoadedVectors {
    item_ids: Vec<ItemId>,
    vectors: Vec<Vec<f32>>,
    /// Members without a usable vector
    excluded: Vec<ItemId>,
    missing: usize,
    malformed: usize,
}

/// Most frequent length among finite vectors; ties go to the smaller length.
fn common_dimension(vectors: &[Option<Vec<f32>>]) -> Option<usize> {
    let mut counts: HashMap<usize, usize> = HashMap::new();
    for v in vectors.iter().flatten() {
        if !v.is_empty() && v.iter().all(|x| x.is_finite()) {
            *counts.entry(v.len()).or_default() += 1;
        }
    }
    counts
        .into_iter()
        .max_by(|(len_a, n_a), (len_b, n_b)| n_a.cmp(n_b).then(len_b.cmp(len_a)))
        .map(|(len, _)| len)
}

/// Group item ids by cluster. Items without a vector join the largest
/// cluster so that the children still cover the parent exactly.
fn group_members(
    item_ids: &[ItemId],
    partitioning: Partitioning,
    missing: Vec<ItemId>,
) -> Vec<Partition> {
    let mut partitions: Vec<Partition> = partitioning
        .centroids
        .into_iter()
        .map(|centroid| Partition::new(centroid, Vec::new()))
        .collect();
    for (&item, &cluster) in item_ids.iter().zip(&partitioning.assignment) {
        partitions[cluster].member_ids.push(item);
    }

    if !missing.is_empty() {
        if let Some(largest) = partitions.iter_mut().max_by_key(|p| p.len()) {
            largest.member_ids.extend(missing);
        }
    }
    partitions
}
