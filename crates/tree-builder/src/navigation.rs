//! Read-only navigation over the tree.
//!
//! These are the accessors the labeling stage and the navigation API use.
//! Expansions commit atomically, so every read sees a whole tree.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;

use tree_storage::Storage;
use tree_types::{ClusterNode, ItemId, NodeId, NodeStatus};

use crate::allocator::NodeAllocator;
use crate::error::TreeError;

/// Shape of the tree at a glance.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TreeStats {
    pub root_id: Option<NodeId>,
    pub corpus: Option<String>,
    pub node_count: u64,
    pub expandable_count: u64,
    pub claimed_count: u64,
    pub leaf_count: u64,
    pub expanded_count: u64,
    pub item_count: u64,
    pub max_depth: u32,
    /// Node count at each depth
    pub nodes_per_depth: BTreeMap<u32, u64>,
    pub labeled_count: u64,
    /// Root exists and nothing is left on the frontier
    pub complete: bool,
}

/// Read accessors for navigation and labeling.
pub struct TreeNavigator {
    allocator: NodeAllocator,
}

impl TreeNavigator {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self {
            allocator: NodeAllocator::new(storage),
        }
    }

    pub fn get_root(&self) -> Result<Option<ClusterNode>, TreeError> {
        match self.allocator.root_id()? {
            Some(root_id) => self.allocator.get_node(root_id),
            None => Ok(None),
        }
    }

    pub fn get_node(&self, node_id: NodeId) -> Result<Option<ClusterNode>, TreeError> {
        self.allocator.get_node(node_id)
    }

    pub fn get_children(&self, node_id: NodeId) -> Result<Vec<ClusterNode>, TreeError> {
        self.allocator.get_children(node_id)
    }

    pub fn get_members(
        &self,
        node_id: NodeId,
        limit: Option<usize>,
    ) -> Result<Vec<ItemId>, TreeError> {
        self.allocator.get_members(node_id, limit)
    }

    pub fn get_parent(&self, node_id: NodeId) -> Result<Option<ClusterNode>, TreeError> {
        let node = self.require(node_id)?;
        match node.parent_id {
            Some(parent_id) => self.allocator.get_node(parent_id),
            None => Ok(None),
        }
    }

    /// Other children of the node's parent. Empty for the root.
    pub fn get_siblings(&self, node_id: NodeId) -> Result<Vec<ClusterNode>, TreeError> {
        let node = self.require(node_id)?;
        let Some(parent_id) = node.parent_id else {
            return Ok(Vec::new());
        };
        Ok(self
            .allocator
            .get_children(parent_id)?
            .into_iter()
            .filter(|c| c.node_id != node_id)
            .collect())
    }

    /// Ancestor chain from the root down to the node's parent.
    pub fn get_ancestors(&self, node_id: NodeId) -> Result<Vec<ClusterNode>, TreeError> {
        let node = self.require(node_id)?;
        let mut ancestors = Vec::with_capacity(node.depth as usize);
        let mut current = node.parent_id;
        while let Some(id) = current {
            let parent = self.require(id)?;
            current = parent.parent_id;
            ancestors.push(parent);
            if ancestors.len() > node.depth as usize {
                return Err(TreeError::AtomicityViolation {
                    node_id,
                    detail: "ancestor chain longer than node depth".to_string(),
                });
            }
        }
        ancestors.reverse();
        Ok(ancestors)
    }

    /// Node currently holding the item: its leaf once the tree is complete.
    pub fn get_leaf_for_item(&self, item_id: ItemId) -> Result<Option<ClusterNode>, TreeError> {
        match self.allocator.storage().get_assignment(item_id)? {
            Some(node_id) => self.allocator.get_node(node_id),
            None => Ok(None),
        }
    }

    /// Nodes in creation order, optionally filtered by depth and status.
    pub fn list_nodes(
        &self,
        depth: Option<u32>,
        status: Option<NodeStatus>,
    ) -> Result<Vec<ClusterNode>, TreeError> {
        Ok(self
            .allocator
            .storage()
            .list_nodes()?
            .into_iter()
            .filter(|n| depth.map_or(true, |d| n.depth == d))
            .filter(|n| status.map_or(true, |s| n.status == s))
            .collect())
    }

    pub fn set_label(&self, node_id: NodeId, label: Option<String>) -> Result<(), TreeError> {
        self.allocator.set_label(node_id, label)
    }

    pub fn stats(&self) -> Result<TreeStats, TreeError> {
        let mut stats = TreeStats {
            root_id: self.allocator.root_id()?,
            corpus: self.allocator.corpus()?,
            ..Default::default()
        };

        for node in self.allocator.storage().list_nodes()? {
            stats.node_count += 1;
            stats.max_depth = stats.max_depth.max(node.depth);
            *stats.nodes_per_depth.entry(node.depth).or_default() += 1;
            if node.label.is_some() {
                stats.labeled_count += 1;
            }
            match node.status {
                NodeStatus::Expandable => stats.expandable_count += 1,
                NodeStatus::Claimed => stats.claimed_count += 1,
                NodeStatus::Leaf => stats.leaf_count += 1,
                NodeStatus::Expanded => stats.expanded_count += 1,
            }
            if node.is_root() {
                stats.item_count = node.member_count;
            }
        }
        stats.complete =
            stats.root_id.is_some() && stats.expandable_count == 0 && stats.claimed_count == 0;
        Ok(stats)
    }

    fn require(&self, node_id: NodeId) -> Result<ClusterNode, TreeError> {
        self.allocator
            .get_node(node_id)?
            .ok_or(TreeError::NodeNotFound(node_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::Partition;
    use tempfile::TempDir;

    fn build_two_level_tree() -> (TreeNavigator, Vec<NodeId>, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let storage = Arc::new(Storage::open(temp_dir.path()).unwrap());
        let allocator = NodeAllocator::new(Arc::clone(&storage));
        let root = allocator.allocate_root(&[1, 2, 3, 4], "enwiki").unwrap();
        let children = allocator
            .allocate_children(
                root,
                vec![
                    Partition::new(vec![0.0], vec![1, 2]),
                    Partition::new(vec![1.0], vec![3, 4]),
                ],
            )
            .unwrap();
        let grandchildren = allocator
            .allocate_children(
                children[1],
                vec![
                    Partition::new(vec![0.9], vec![3]),
                    Partition::new(vec![1.1], vec![4]),
                ],
            )
            .unwrap();

        let mut ids = vec![root];
        ids.extend(children);
        ids.extend(grandchildren);
        (TreeNavigator::new(storage), ids, temp_dir)
    }

    #[test]
    fn test_parent_siblings_ancestors() {
        let (nav, ids, _temp) = build_two_level_tree();
        let (root, a, b, b1, b2) = (ids[0], ids[1], ids[2], ids[3], ids[4]);

        assert_eq!(nav.get_root().unwrap().unwrap().node_id, root);
        assert!(nav.get_parent(root).unwrap().is_none());
        assert_eq!(nav.get_parent(b1).unwrap().unwrap().node_id, b);

        let siblings: Vec<_> = nav.get_siblings(b1).unwrap().iter().map(|n| n.node_id).collect();
        assert_eq!(siblings, vec![b2]);
        assert!(nav.get_siblings(root).unwrap().is_empty());

        let ancestors: Vec<_> = nav
            .get_ancestors(b2)
            .unwrap()
            .iter()
            .map(|n| n.node_id)
            .collect();
        assert_eq!(ancestors, vec![root, b]);

        assert_eq!(nav.get_leaf_for_item(1).unwrap().unwrap().node_id, a);
        assert_eq!(nav.get_leaf_for_item(4).unwrap().unwrap().node_id, b2);
        assert!(nav.get_leaf_for_item(42).unwrap().is_none());
    }

    #[test]
    fn test_list_nodes_filters() {
        let (nav, _ids, _temp) = build_two_level_tree();
        assert_eq!(nav.list_nodes(None, None).unwrap().len(), 5);
        assert_eq!(nav.list_nodes(Some(2), None).unwrap().len(), 2);
        assert_eq!(
            nav.list_nodes(None, Some(NodeStatus::Expanded)).unwrap().len(),
            2
        );
    }

    #[test]
    fn test_stats() {
        let (nav, ids, _temp) = build_two_level_tree();
        nav.set_label(ids[1], Some("Physics".to_string())).unwrap();

        let stats = nav.stats().unwrap();
        assert_eq!(stats.node_count, 5);
        assert_eq!(stats.expanded_count, 2);
        assert_eq!(stats.expandable_count, 3);
        assert_eq!(stats.item_count, 4);
        assert_eq!(stats.max_depth, 2);
        assert_eq!(stats.nodes_per_depth.get(&1), Some(&2));
        assert_eq!(stats.labeled_count, 1);
        assert_eq!(stats.corpus.as_deref(), Some("enwiki"));
        assert!(!stats.complete);
    }
}
