//! Centroid backfill.
//!
//! Children get their centroid from the partitioner when they are
//! created. The root, and any node written by older tooling, starts
//! without one; the backfill computes the mean of the node's member
//! vectors in fixed-size chunks.

use std::sync::Arc;

use tracing::{debug, info, warn};

use tree_types::NodeId;

use crate::allocator::NodeAllocator;
use crate::error::TreeError;
use crate::vectors::VectorStore;

const CHUNK_SIZE: usize = 1024;

/// Fills in missing node centroids from member vectors.
pub struct CentroidBackfill {
    allocator: NodeAllocator,
    vectors: Arc<dyn VectorStore>,
}

impl CentroidBackfill {
    pub fn new(allocator: NodeAllocator, vectors: Arc<dyn VectorStore>) -> Self {
        Self { allocator, vectors }
    }

    /// Mean of the member vectors under `node_id`, or `None` when no member
    /// has a vector.
    pub fn compute_centroid(&self, node_id: NodeId) -> Result<Option<Vec<f32>>, TreeError> {
        let members = self.allocator.get_members(node_id, None)?;

        let mut sum: Vec<f64> = Vec::new();
        let mut count = 0usize;
        let mut missing = 0usize;
        for chunk in members.chunks(CHUNK_SIZE) {
            for vector in self.vectors.get_vectors(chunk)? {
                let Some(vector) = vector else {
                    missing += 1;
                    continue;
                };
                if sum.is_empty() {
                    sum = vec![0.0; vector.len()];
                }
                if vector.len() != sum.len() || vector.iter().any(|v| !v.is_finite()) {
                    missing += 1;
                    continue;
                }
                for (s, v) in sum.iter_mut().zip(&vector) {
                    *s += *v as f64;
                }
                count += 1;
            }
        }

        if missing > 0 {
            warn!(node_id, missing, "Members without usable vectors skipped");
        }
        if count == 0 {
            return Ok(None);
        }
        Ok(Some(sum.into_iter().map(|s| (s / count as f64) as f32).collect()))
    }

    /// Compute and store the centroid of one node if it has none.
    /// Returns whether a centroid was written.
    pub fn fill_node(&self, node_id: NodeId) -> Result<bool, TreeError> {
        let node = self
            .allocator
            .get_node(node_id)?
            .ok_or(TreeError::NodeNotFound(node_id))?;
        if node.centroid.is_some() {
            return Ok(false);
        }

        let Some(centroid) = self.compute_centroid(node_id)? else {
            return Ok(false);
        };

        // Re-read under the write lock; status may have moved on meanwhile
        let _guard = self.allocator.storage().write_lock();
        let mut node = self
            .allocator
            .get_node(node_id)?
            .ok_or(TreeError::NodeNotFound(node_id))?;
        if node.centroid.is_some() {
            return Ok(false);
        }
        node.centroid = Some(centroid);
        self.allocator.storage().put_node(&node)?;
        debug!(node_id, "Filled centroid");
        Ok(true)
    }

    /// Fill every node that lacks a centroid. Returns how many were written.
    pub fn fill_missing(&self) -> Result<usize, TreeError> {
        let missing: Vec<NodeId> = self
            .allocator
            .storage()
            .list_nodes()?
            .into_iter()
            .filter(|n| n.centroid.is_none())
            .map(|n| n.node_id)
            .collect();

        let mut filled = 0;
        for node_id in missing {
            if self.fill_node(node_id)? {
                filled += 1;
            }
        }
        info!(filled, "Centroid backfill complete");
        Ok(filled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vectors::InMemoryVectorStore;
    use tempfile::TempDir;
    use tree_storage::Storage;

    #[test]
    fn test_backfill_root_centroid() {
        let temp_dir = TempDir::new().unwrap();
        let storage = Arc::new(Storage::open(temp_dir.path()).unwrap());
        let allocator = NodeAllocator::new(storage);
        let root = allocator.allocate_root(&[1, 2, 3], "enwiki").unwrap();

        let vectors: InMemoryVectorStore = vec![
            (1, vec![0.0, 2.0]),
            (2, vec![2.0, 4.0]),
            (3, vec![f32::NAN, 1.0]),
        ]
        .into_iter()
        .collect();
        let backfill = CentroidBackfill::new(allocator.clone(), Arc::new(vectors));

        assert_eq!(backfill.fill_missing().unwrap(), 1);
        let node = allocator.get_node(root).unwrap().unwrap();
        assert_eq!(node.centroid, Some(vec![1.0, 3.0]));

        // Already filled
        assert!(!backfill.fill_node(root).unwrap());
    }

    #[test]
    fn test_backfill_keeps_concurrent_label() {
        let temp_dir = TempDir::new().unwrap();
        let storage = Arc::new(Storage::open(temp_dir.path()).unwrap());
        let allocator = NodeAllocator::new(Arc::clone(&storage));
        let items: Vec<u64> = (1..=2000).collect();
        let root = allocator.allocate_root(&items, "enwiki").unwrap();
        let vectors: InMemoryVectorStore = items.iter().map(|&i| (i, vec![i as f32, 1.0])).collect();
        let backfill = CentroidBackfill::new(allocator.clone(), Arc::new(vectors));

        let labeler = {
            let allocator = allocator.clone();
            std::thread::spawn(move || {
                for i in 0..100 {
                    allocator.set_label(root, Some(format!("label-{i}"))).unwrap();
                }
            })
        };
        assert!(backfill.fill_node(root).unwrap());
        labeler.join().unwrap();

        let node = allocator.get_node(root).unwrap().unwrap();
        assert_eq!(node.label.as_deref(), Some("label-99"));
        assert_eq!(node.centroid, Some(vec![1000.5, 1.0]));
    }
}
