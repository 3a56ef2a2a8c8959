//! Frontier tracking.
//!
//! The frontier is a persisted queue: one entry per expandable or claimed
//! node, keyed by node id so that scan order is creation order. Claims are
//! written to the store, so a restarted process sees exactly which nodes
//! an earlier run still held. Claims are never revoked automatically; a
//! claim older than the staleness window is released by an explicit sweep.

use std::sync::Arc;

use chrono::{Duration, Utc};
use tracing::{debug, info, instrument, warn};
use ulid::Ulid;

use tree_storage::Storage;
use tree_types::{FrontierEntry, NodeId, NodeStatus, TreeConfig};

use crate::error::TreeError;

/// Persisted work queue with claim/release semantics.
pub struct FrontierTracker {
    storage: Arc<Storage>,
    config: TreeConfig,
    run_id: String,
}

impl FrontierTracker {
    /// Create a tracker with a fresh run id.
    pub fn new(storage: Arc<Storage>, config: TreeConfig) -> Self {
        Self {
            storage,
            config,
            run_id: Ulid::new().to_string(),
        }
    }

    /// A tracker for another worker: same store, new run id. Claims are
    /// selected under the store's write lock, so workers never share one.
    pub fn worker(&self) -> Self {
        Self {
            storage: Arc::clone(&self.storage),
            config: self.config.clone(),
            run_id: Ulid::new().to_string(),
        }
    }

    /// Id recorded on every claim this tracker takes.
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Fail unless this run holds the claim on `node_id`. Call with the
    /// write lock held.
    pub(crate) fn check_owner(&self, node_id: NodeId) -> Result<(), TreeError> {
        ensure_claim_owner(&self.storage, node_id, &self.run_id)
    }

    /// Claim up to `limit` expandable nodes in creation order.
    ///
    /// Each returned node is claimed before this returns, so no other
    /// worker can select it until it is released.
    #[instrument(skip(self), fields(run_id = %self.run_id))]
    pub fn next_batch(&self, limit: usize) -> Result<Vec<NodeId>, TreeError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let _guard = self.storage.write_lock();
        let now = Utc::now();
        let mut batch = self.storage.batch();
        let mut claimed = Vec::with_capacity(limit);
        let mut cursor = 0;

        // Skipped entries do not count against the limit
        while claimed.len() < limit {
            let candidates = self.storage.scan_frontier_from(
                cursor,
                Some(limit - claimed.len()),
                |e| !e.is_claimed(),
            )?;
            if candidates.is_empty() {
                break;
            }

            for mut entry in candidates {
                cursor = entry.node_id + 1;
                let Some(mut node) = self.storage.get_node(entry.node_id)? else {
                    warn!(node_id = entry.node_id, "Frontier entry without node, skipping");
                    continue;
                };
                if node.status != NodeStatus::Expandable {
                    warn!(
                        node_id = node.node_id,
                        status = %node.status,
                        "Frontier entry disagrees with node status, skipping"
                    );
                    continue;
                }

                node.transition(NodeStatus::Claimed)?;
                entry.claim(&self.run_id, now);
                batch.put_node(&node)?;
                batch.put_frontier(&entry)?;
                claimed.push(node.node_id);
            }
        }
        self.storage.commit(batch)?;

        debug!(claimed = claimed.len(), "Claimed frontier batch");
        Ok(claimed)
    }

    /// Make a node a leaf and drop it from the frontier.
    ///
    /// Marking an existing leaf again is a no-op. A claimed node can only
    /// be marked by the run holding the claim.
    #[instrument(skip(self))]
    pub fn mark_leaf(&self, node_id: NodeId) -> Result<(), TreeError> {
        let _guard = self.storage.write_lock();
        self.mark_leaf_locked(node_id)
    }

    fn mark_leaf_locked(&self, node_id: NodeId) -> Result<(), TreeError> {
        let mut node = self
            .storage
            .get_node(node_id)?
            .ok_or(TreeError::NodeNotFound(node_id))?;

        match node.status {
            NodeStatus::Leaf => return Ok(()),
            NodeStatus::Expanded => {
                return Err(TreeError::InvalidState {
                    node_id,
                    status: node.status,
                    operation: "mark leaf",
                })
            }
            NodeStatus::Claimed => self.check_owner(node_id)?,
            NodeStatus::Expandable => {}
        }

        node.transition(NodeStatus::Leaf)?;
        let mut batch = self.storage.batch();
        batch.put_node(&node)?;
        batch.delete_frontier(node_id)?;
        self.storage.commit(batch)?;

        debug!(member_count = node.member_count, depth = node.depth, "Marked leaf");
        Ok(())
    }

    /// Creation-time decision for a new node: leaf-sized nodes become
    /// leaves at once, the rest stay expandable. Returns the resulting
    /// status. Nodes that already left the expandable state keep theirs.
    #[instrument(skip(self))]
    pub fn mark_expandable(&self, node_id: NodeId) -> Result<NodeStatus, TreeError> {
        let _guard = self.storage.write_lock();
        let node = self
            .storage
            .get_node(node_id)?
            .ok_or(TreeError::NodeNotFound(node_id))?;

        if node.status != NodeStatus::Expandable {
            return Ok(node.status);
        }

        if self.config.is_leaf_sized(node.member_count, node.depth) {
            self.mark_leaf_locked(node_id)?;
            return Ok(NodeStatus::Leaf);
        }

        if self.storage.get_frontier_entry(node_id)?.is_none() {
            let mut batch = self.storage.batch();
            batch.put_frontier(&FrontierEntry::new(node_id, node.depth))?;
            self.storage.commit(batch)?;
        }
        Ok(NodeStatus::Expandable)
    }

    /// Return a node claimed by this run to the expandable state. Returns
    /// false when the node is not claimed, or is claimed by another run.
    #[instrument(skip(self))]
    pub fn release(&self, node_id: NodeId) -> Result<bool, TreeError> {
        let _guard = self.storage.write_lock();
        match self.check_owner(node_id) {
            Ok(()) => self.release_locked(node_id),
            Err(TreeError::ClaimLost { holder, .. }) => {
                if holder.is_some() {
                    warn!(?holder, "Claim held by another run, not releasing");
                }
                Ok(false)
            }
            Err(TreeError::NodeNotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn release_locked(&self, node_id: NodeId) -> Result<bool, TreeError> {
        let Some(mut node) = self.storage.get_node(node_id)? else {
            return Ok(false);
        };
        if node.status != NodeStatus::Claimed {
            return Ok(false);
        }

        let mut entry = self
            .storage
            .get_frontier_entry(node_id)?
            .unwrap_or_else(|| FrontierEntry::new(node_id, node.depth));
        entry.release();
        node.transition(NodeStatus::Expandable)?;

        let mut batch = self.storage.batch();
        batch.put_node(&node)?;
        batch.put_frontier(&entry)?;
        self.storage.commit(batch)?;

        debug!("Released claim");
        Ok(true)
    }

    /// Release every claim older than `staleness`. Returns the released ids.
    #[instrument(skip(self))]
    pub fn sweep_stale_claims(&self, staleness: Duration) -> Result<Vec<NodeId>, TreeError> {
        let _guard = self.storage.write_lock();
        let now = Utc::now();
        let stale = self
            .storage
            .scan_frontier(None, |e| e.is_stale(now, staleness))?;

        let mut released = Vec::with_capacity(stale.len());
        for entry in stale {
            if self.release_locked(entry.node_id)? {
                released.push(entry.node_id);
            } else {
                // Entry claimed but node is not; reset the entry alone
                let mut entry = entry;
                entry.release();
                let mut batch = self.storage.batch();
                batch.put_frontier(&entry)?;
                self.storage.commit(batch)?;
            }
        }

        if !released.is_empty() {
            info!(released = released.len(), "Swept stale claims");
        }
        Ok(released)
    }

    /// Current frontier, claimed entries included, in creation order.
    pub fn pending(&self) -> Result<Vec<FrontierEntry>, TreeError> {
        Ok(self.storage.scan_frontier(None, |_| true)?)
    }
}

/// Fail unless `run_id` holds the claim on `node_id`.
pub(crate) fn ensure_claim_owner(
    storage: &Storage,
    node_id: NodeId,
    run_id: &str,
) -> Result<(), TreeError> {
    let node = storage
        .get_node(node_id)?
        .ok_or(TreeError::NodeNotFound(node_id))?;
    let holder = storage
        .get_frontier_entry(node_id)?
        .filter(|e| e.is_claimed())
        .and_then(|e| e.claimed_by);
    if node.status == NodeStatus::Claimed && holder.as_deref() == Some(run_id) {
        return Ok(());
    }
    Err(TreeError::ClaimLost {
        node_id,
        run_id: run_id.to_string(),
        holder,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::{NodeAllocator, Partition};
    use tempfile::TempDir;

    fn setup(config: TreeConfig) -> (NodeAllocator, FrontierTracker, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let storage = Arc::new(Storage::open(temp_dir.path()).unwrap());
        (
            NodeAllocator::new(Arc::clone(&storage)),
            FrontierTracker::new(storage, config),
            temp_dir,
        )
    }

    fn small_config() -> TreeConfig {
        TreeConfig {
            leaf_threshold: 2,
            branching_factor: 2,
            max_depth: 3,
            ..Default::default()
        }
    }

    #[test]
    fn test_next_batch_claims_in_creation_order() {
        let (allocator, frontier, _temp) = setup(small_config());
        let root = allocator.allocate_root(&[1, 2, 3, 4, 5, 6], "enwiki").unwrap();
        let children = allocator
            .allocate_children(
                root,
                vec![
                    Partition::new(vec![0.0], vec![1, 2, 3]),
                    Partition::new(vec![1.0], vec![4, 5, 6]),
                ],
            )
            .unwrap();

        let claimed = frontier.next_batch(10).unwrap();
        assert_eq!(claimed, children);

        let node = allocator.get_node(children[0]).unwrap().unwrap();
        assert_eq!(node.status, NodeStatus::Claimed);

        // Claimed nodes are not handed out twice
        assert!(frontier.worker().next_batch(10).unwrap().is_empty());
    }

    #[test]
    fn test_next_batch_zero_is_noop() {
        let (allocator, frontier, _temp) = setup(small_config());
        let root = allocator.allocate_root(&[1, 2, 3], "enwiki").unwrap();
        assert!(frontier.next_batch(0).unwrap().is_empty());
        assert_eq!(
            allocator.get_node(root).unwrap().unwrap().status,
            NodeStatus::Expandable
        );
    }

    #[test]
    fn test_mark_expandable_decides_leaf_at_threshold() {
        let (allocator, frontier, _temp) = setup(small_config());
        let root = allocator.allocate_root(&[1, 2, 3], "enwiki").unwrap();
        let children = allocator
            .allocate_children(
                root,
                vec![
                    Partition::new(vec![0.0], vec![1, 2]),
                    Partition::new(vec![1.0], vec![3]),
                ],
            )
            .unwrap();

        for child in &children {
            assert_eq!(frontier.mark_expandable(*child).unwrap(), NodeStatus::Leaf);
            assert!(frontier
                .storage
                .get_frontier_entry(*child)
                .unwrap()
                .is_none());
        }
        // Decision is never revisited
        assert_eq!(
            frontier.mark_expandable(children[0]).unwrap(),
            NodeStatus::Leaf
        );
        assert_eq!(frontier.mark_expandable(root).unwrap(), NodeStatus::Expanded);
    }

    #[test]
    fn test_mark_expandable_keeps_large_nodes_queued() {
        let (allocator, frontier, _temp) = setup(small_config());
        let root = allocator.allocate_root(&[1, 2, 3], "enwiki").unwrap();
        assert_eq!(
            frontier.mark_expandable(root).unwrap(),
            NodeStatus::Expandable
        );
        assert!(frontier.storage.get_frontier_entry(root).unwrap().is_some());
    }

    #[test]
    fn test_release_returns_node_to_frontier() {
        let (allocator, frontier, _temp) = setup(small_config());
        let root = allocator.allocate_root(&[1, 2, 3], "enwiki").unwrap();
        assert_eq!(frontier.next_batch(1).unwrap(), vec![root]);

        assert!(frontier.release(root).unwrap());
        assert!(!frontier.release(root).unwrap());
        assert_eq!(frontier.next_batch(1).unwrap(), vec![root]);
    }

    #[test]
    fn test_mark_leaf_rejects_expanded() {
        let (allocator, frontier, _temp) = setup(small_config());
        let root = allocator.allocate_root(&[1, 2], "enwiki").unwrap();
        allocator
            .allocate_children(
                root,
                vec![
                    Partition::new(vec![0.0], vec![1]),
                    Partition::new(vec![1.0], vec![2]),
                ],
            )
            .unwrap();
        assert!(matches!(
            frontier.mark_leaf(root).unwrap_err(),
            TreeError::InvalidState { .. }
        ));
    }

    #[test]
    fn test_sweep_releases_only_stale_claims() {
        let (allocator, frontier, _temp) = setup(small_config());
        let root = allocator.allocate_root(&[1, 2, 3], "enwiki").unwrap();
        frontier.next_batch(1).unwrap();

        assert!(frontier
            .sweep_stale_claims(Duration::seconds(3600))
            .unwrap()
            .is_empty());

        assert_eq!(
            frontier.sweep_stale_claims(Duration::seconds(-1)).unwrap(),
            vec![root]
        );
        assert_eq!(
            allocator.get_node(root).unwrap().unwrap().status,
            NodeStatus::Expandable
        );
    }

    #[test]
    fn test_swept_claim_cannot_be_finished_by_old_run() {
        let (allocator, frontier, _temp) = setup(small_config());
        let root = allocator.allocate_root(&[1, 2, 3], "enwiki").unwrap();
        let stale = frontier.worker();
        assert_eq!(stale.next_batch(1).unwrap(), vec![root]);

        frontier.sweep_stale_claims(Duration::seconds(-1)).unwrap();
        let current = frontier.worker();
        assert_eq!(current.next_batch(1).unwrap(), vec![root]);

        let err = stale.mark_leaf(root).unwrap_err();
        match err {
            TreeError::ClaimLost { holder, .. } => {
                assert_eq!(holder.as_deref(), Some(current.run_id()))
            }
            other => panic!("expected ClaimLost, got {other:?}"),
        }
        assert!(!stale.release(root).unwrap());
        assert_eq!(
            allocator.get_node(root).unwrap().unwrap().status,
            NodeStatus::Claimed
        );

        current.mark_leaf(root).unwrap();
        assert_eq!(
            allocator.get_node(root).unwrap().unwrap().status,
            NodeStatus::Leaf
        );
    }

    #[test]
    fn test_next_batch_fills_limit_past_mismatched_entries() {
        let (allocator, frontier, _temp) = setup(small_config());
        let root = allocator.allocate_root(&[1, 2, 3, 4, 5, 6, 7, 8, 9], "enwiki").unwrap();
        let children = allocator
            .allocate_children(
                root,
                vec![
                    Partition::new(vec![0.0], vec![1, 2, 3]),
                    Partition::new(vec![1.0], vec![4, 5, 6]),
                    Partition::new(vec![2.0], vec![7, 8, 9]),
                ],
            )
            .unwrap();

        // First child's entry outlives its leaf transition
        let mut leaf = allocator.get_node(children[0]).unwrap().unwrap();
        leaf.transition(NodeStatus::Leaf).unwrap();
        frontier.storage.put_node(&leaf).unwrap();

        let claimed = frontier.next_batch(2).unwrap();
        assert_eq!(claimed, vec![children[1], children[2]]);
    }
}
