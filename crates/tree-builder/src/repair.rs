//! Repair of validator findings.
//!
//! Every pass is idempotent: running repair on a consistent tree writes
//! nothing, and running it twice in a row leaves the second run with
//! nothing to do.
//!
//! Repairs, in order:
//! - stale claims are released
//! - children hanging under an unexpanded parent are rolled back into the
//!   parent, whose generation is bumped so the expansion is redone cleanly
//! - expansion records are rebuilt from the nodes they describe
//! - assignment edges are pointed back at the node indexing the item
//! - frontier entries are recreated, released or dropped to match node status

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use tree_storage::Storage;
use tree_types::{
    ClusterNode, ExpansionRecord, FrontierEntry, FrontierStatus, ItemId, NodeId, NodeStatus,
    TreeConfig,
};

use crate::error::TreeError;
use crate::frontier::FrontierTracker;
use crate::validator::children_by_parent;

/// What a repair pass changed.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RepairReport {
    pub released_claims: usize,
    pub rolled_back_nodes: usize,
    pub rebuilt_expansions: usize,
    pub removed_expansions: usize,
    pub retargeted_edges: usize,
    pub frontier_fixes: usize,
    /// Problems repair cannot fix on its own
    pub unresolved: Vec<String>,
}

impl RepairReport {
    pub fn is_noop(&self) -> bool {
        self.released_claims == 0
            && self.rolled_back_nodes == 0
            && self.rebuilt_expansions == 0
            && self.removed_expansions == 0
            && self.retargeted_edges == 0
            && self.frontier_fixes == 0
    }
}

/// Fixes what the consistency validator reports.
pub struct Repairer {
    storage: Arc<Storage>,
    config: TreeConfig,
}

impl Repairer {
    pub fn new(storage: Arc<Storage>, config: TreeConfig) -> Self {
        Self { storage, config }
    }

    pub fn repair(&self) -> Result<RepairReport, TreeError> {
        let mut report = RepairReport::default();

        let frontier = FrontierTracker::new(Arc::clone(&self.storage), self.config.clone());
        report.released_claims = frontier
            .sweep_stale_claims(self.config.claim_staleness())?
            .len();

        self.roll_back_orphans(&mut report)?;
        self.rebuild_expansions(&mut report)?;
        self.retarget_edges(&mut report)?;
        self.fix_frontier(&mut report)?;

        if report.is_noop() {
            info!("Nothing to repair");
        } else {
            info!(?report, "Repair complete");
        }
        for problem in &report.unresolved {
            warn!(problem = %problem, "Unresolved");
        }
        Ok(report)
    }

    fn load_nodes(&self) -> Result<BTreeMap<NodeId, ClusterNode>, TreeError> {
        Ok(self
            .storage
            .list_nodes()?
            .into_iter()
            .map(|n| (n.node_id, n))
            .collect())
    }

    /// Children of a parent that never reached `expanded` are the visible
    /// half of an interrupted expansion. Their whole subtree is removed and
    /// its items return to the parent.
    fn roll_back_orphans(&self, report: &mut RepairReport) -> Result<(), TreeError> {
        let nodes = self.load_nodes()?;
        let children = children_by_parent(&nodes);

        let mut orphan_parents: Vec<NodeId> = Vec::new();
        for node in nodes.values() {
            let Some(parent_id) = node.parent_id else {
                continue;
            };
            match nodes.get(&parent_id) {
                None => report.unresolved.push(format!(
                    "node {} names missing parent {}",
                    node.node_id, parent_id
                )),
                Some(parent) if parent.status != NodeStatus::Expanded => {
                    if !orphan_parents.contains(&parent_id) {
                        orphan_parents.push(parent_id);
                    }
                }
                Some(_) => {}
            }
        }

        // A parent already swept into an outer rollback is gone
        let mut removed: HashSet<NodeId> = HashSet::new();
        for parent_id in orphan_parents {
            if removed.contains(&parent_id) {
                continue;
            }
            let Some(mut parent) = self.storage.get_node(parent_id)? else {
                continue;
            };

            let mut subtree = Vec::new();
            let mut stack: Vec<NodeId> = children.get(&parent_id).cloned().unwrap_or_default();
            while let Some(id) = stack.pop() {
                if !removed.insert(id) {
                    continue;
                }
                subtree.push(id);
                if let Some(grandchildren) = children.get(&id) {
                    stack.extend(grandchildren);
                }
            }

            let mut batch = self.storage.batch();
            for &node_id in &subtree {
                for item in self.storage.get_members(node_id, None)? {
                    batch.delete_member(node_id, item)?;
                    batch.put_member(parent_id, item)?;
                    batch.put_assignment(item, parent_id)?;
                }
                batch.delete_node(node_id)?;
                batch.delete_frontier(node_id)?;
                batch.delete_expansion(node_id)?;
            }
            parent.generation += 1;
            parent.child_count = 0;
            batch.put_node(&parent)?;
            batch.delete_expansion(parent_id)?;
            self.storage.commit(batch)?;

            warn!(
                parent_id,
                removed = subtree.len(),
                generation = parent.generation,
                "Rolled back interrupted expansion"
            );
            report.rolled_back_nodes += subtree.len();
        }
        Ok(())
    }

    fn rebuild_expansions(&self, report: &mut RepairReport) -> Result<(), TreeError> {
        let nodes = self.load_nodes()?;
        let children = children_by_parent(&nodes);
        let records: HashMap<NodeId, ExpansionRecord> = self
            .storage
            .list_expansions()?
            .into_iter()
            .map(|r| (r.parent_id, r))
            .collect();

        let mut batch = self.storage.batch();
        for (parent_id, record) in &records {
            let expanded = nodes
                .get(parent_id)
                .is_some_and(|n| n.status == NodeStatus::Expanded);
            if !expanded {
                batch.delete_expansion(*parent_id)?;
                report.removed_expansions += 1;
            } else if record.child_ids.is_empty() {
                report
                    .unresolved
                    .push(format!("expansion record for {} lists no children", parent_id));
            }
        }

        for node in nodes.values().filter(|n| n.status == NodeStatus::Expanded) {
            let actual = children.get(&node.node_id).cloned().unwrap_or_default();
            if actual.is_empty() {
                report
                    .unresolved
                    .push(format!("expanded node {} has no children", node.node_id));
                continue;
            }

            let children_total: u64 = actual
                .iter()
                .filter_map(|id| nodes.get(id))
                .map(|c| c.member_count)
                .sum();
            let up_to_date = records.get(&node.node_id).is_some_and(|r| {
                r.child_ids == actual
                    && r.generation == node.generation
                    && r.member_total == node.member_count
            });
            if up_to_date && node.child_count as usize == actual.len() {
                continue;
            }
            if children_total != node.member_count {
                report.unresolved.push(format!(
                    "children of {} hold {} items, node holds {}",
                    node.node_id, children_total, node.member_count
                ));
                continue;
            }

            let mut parent = node.clone();
            parent.child_count = actual.len() as u32;
            batch.put_node(&parent)?;
            batch.put_expansion(&ExpansionRecord::new(
                node.node_id,
                node.generation,
                actual,
                node.member_count,
            ))?;
            report.rebuilt_expansions += 1;
        }

        self.storage.commit(batch)?;
        Ok(())
    }

    /// The member index is written in the same batch as the edges, so it is
    /// the reference for where an item lives.
    fn retarget_edges(&self, report: &mut RepairReport) -> Result<(), TreeError> {
        let nodes = self.load_nodes()?;

        let mut indexed: HashMap<ItemId, NodeId> = HashMap::new();
        self.storage.for_each_member(|node_id, item_id| {
            indexed.insert(item_id, node_id);
        })?;
        let mut assigned: HashMap<ItemId, NodeId> = HashMap::new();
        self.storage.for_each_assignment(|item_id, node_id| {
            assigned.insert(item_id, node_id);
        })?;

        let mut batch = self.storage.batch();
        for (&item_id, &node_id) in &indexed {
            if assigned.get(&item_id) == Some(&node_id) {
                continue;
            }
            match nodes.get(&node_id) {
                Some(node) if node.status.holds_items() => {
                    batch.put_assignment(item_id, node_id)?;
                    report.retargeted_edges += 1;
                }
                _ => report.unresolved.push(format!(
                    "item {} indexed under node {} which cannot hold items",
                    item_id, node_id
                )),
            }
        }
        for (item_id, node_id) in &assigned {
            if !indexed.contains_key(item_id) {
                report.unresolved.push(format!(
                    "item {} assigned to {} but not indexed anywhere",
                    item_id, node_id
                ));
            }
        }
        self.storage.commit(batch)?;
        Ok(())
    }

    fn fix_frontier(&self, report: &mut RepairReport) -> Result<(), TreeError> {
        let nodes = self.load_nodes()?;
        let entries: HashMap<NodeId, FrontierEntry> = self
            .storage
            .scan_frontier(None, |_| true)?
            .into_iter()
            .map(|e| (e.node_id, e))
            .collect();

        let mut batch = self.storage.batch();
        for (node_id, entry) in &entries {
            let on_frontier = nodes.get(node_id).is_some_and(|n| n.status.is_frontier());
            if !on_frontier {
                batch.delete_frontier(*node_id)?;
                report.frontier_fixes += 1;
            } else if entry.is_claimed() && entry.claimed_by.is_none() {
                report
                    .unresolved
                    .push(format!("claim on {} has no owner", node_id));
            }
        }

        for node in nodes.values().filter(|n| n.status.is_frontier()) {
            let entry = entries.get(&node.node_id);
            let consistent = match (node.status, entry.map(|e| e.status)) {
                (NodeStatus::Expandable, Some(FrontierStatus::Expandable)) => true,
                (NodeStatus::Claimed, Some(FrontierStatus::Claimed)) => true,
                _ => false,
            };
            if consistent {
                continue;
            }

            // Without a matching entry a claim cannot be trusted; release it
            let mut node = node.clone();
            if node.status == NodeStatus::Claimed {
                node.transition(NodeStatus::Expandable)?;
                batch.put_node(&node)?;
            }
            let mut entry = entry
                .cloned()
                .unwrap_or_else(|| FrontierEntry::new(node.node_id, node.depth));
            entry.release();
            batch.put_frontier(&entry)?;
            report.frontier_fixes += 1;
        }

        self.storage.commit(batch)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::{NodeAllocator, Partition};
    use crate::validator::ConsistencyValidator;
    use chrono::Duration;
    use tempfile::TempDir;

    fn setup() -> (NodeAllocator, Repairer, ConsistencyValidator, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let storage = Arc::new(Storage::open(temp_dir.path()).unwrap());
        let config = TreeConfig {
            leaf_threshold: 2,
            branching_factor: 2,
            ..Default::default()
        };
        (
            NodeAllocator::new(Arc::clone(&storage)),
            Repairer::new(Arc::clone(&storage), config),
            ConsistencyValidator::new(storage, Duration::seconds(3600)),
            temp_dir,
        )
    }

    #[test]
    fn test_repair_on_consistent_tree_is_noop() {
        let (allocator, repairer, _validator, _temp) = setup();
        let root = allocator.allocate_root(&[1, 2, 3], "enwiki").unwrap();
        allocator
            .allocate_children(
                root,
                vec![
                    Partition::new(vec![0.0], vec![1]),
                    Partition::new(vec![1.0], vec![2, 3]),
                ],
            )
            .unwrap();

        let report = repairer.repair().unwrap();
        assert!(report.is_noop(), "{:?}", report);
        assert!(report.unresolved.is_empty());
    }

    #[test]
    fn test_rolls_back_orphaned_children() {
        let (allocator, repairer, validator, _temp) = setup();
        let root = allocator.allocate_root(&[1, 2, 3], "enwiki").unwrap();
        let storage = allocator.storage();

        // Child written and item moved, parent never flipped
        let mut batch = storage.batch();
        batch
            .put_node(&ClusterNode::new(7, Some(root), 1, 1).with_status(NodeStatus::Leaf))
            .unwrap();
        batch.delete_member(root, 3).unwrap();
        batch.put_member(7, 3).unwrap();
        batch.put_assignment(3, 7).unwrap();
        storage.commit(batch).unwrap();
        assert!(!validator.validate().unwrap().is_consistent());

        let report = repairer.repair().unwrap();
        assert_eq!(report.rolled_back_nodes, 1);

        let root_node = allocator.get_node(root).unwrap().unwrap();
        assert_eq!(root_node.generation, 1);
        assert_eq!(storage.get_assignment(3).unwrap(), Some(root));
        assert!(allocator.get_node(7).unwrap().is_none());

        let validation = validator.validate().unwrap();
        assert!(validation.is_consistent(), "{:?}", validation.violations);
        assert!(repairer.repair().unwrap().is_noop());
    }

    #[test]
    fn test_nested_orphans_roll_back_once() {
        let (allocator, repairer, validator, _temp) = setup();
        let root = allocator.allocate_root(&[1, 2, 3, 4], "enwiki").unwrap();
        let storage = allocator.storage();

        // Child 7 itself half-expanded into 8 before the root was flipped
        let mut batch = storage.batch();
        batch
            .put_node(&ClusterNode::new(7, Some(root), 1, 2).with_status(NodeStatus::Expandable))
            .unwrap();
        batch.put_frontier(&FrontierEntry::new(7, 1)).unwrap();
        batch
            .put_node(&ClusterNode::new(8, Some(7), 2, 2).with_status(NodeStatus::Leaf))
            .unwrap();
        for item in [3, 4] {
            batch.delete_member(root, item).unwrap();
            batch.put_member(8, item).unwrap();
            batch.put_assignment(item, 8).unwrap();
        }
        storage.commit(batch).unwrap();

        let report = repairer.repair().unwrap();
        assert_eq!(report.rolled_back_nodes, 2);

        assert!(allocator.get_node(7).unwrap().is_none());
        assert!(allocator.get_node(8).unwrap().is_none());
        assert!(storage.get_frontier_entry(7).unwrap().is_none());
        assert_eq!(allocator.get_node(root).unwrap().unwrap().generation, 1);
        for item in 1..=4 {
            assert_eq!(storage.get_assignment(item).unwrap(), Some(root));
        }

        let validation = validator.validate().unwrap();
        assert!(validation.is_consistent(), "{:?}", validation.violations);
        assert!(repairer.repair().unwrap().is_noop());
    }

    #[test]
    fn test_rebuilds_missing_expansion_record() {
        let (allocator, repairer, validator, _temp) = setup();
        let root = allocator.allocate_root(&[1, 2], "enwiki").unwrap();
        let children = allocator
            .allocate_children(
                root,
                vec![
                    Partition::new(vec![0.0], vec![1]),
                    Partition::new(vec![1.0], vec![2]),
                ],
            )
            .unwrap();

        let storage = allocator.storage();
        let mut batch = storage.batch();
        batch.delete_expansion(root).unwrap();
        storage.commit(batch).unwrap();

        let report = repairer.repair().unwrap();
        assert_eq!(report.rebuilt_expansions, 1);
        assert_eq!(storage.get_expansion(root).unwrap().unwrap().child_ids, children);
        assert!(validator.validate().unwrap().is_consistent());
    }

    #[test]
    fn test_retargets_edge_and_restores_frontier_entry() {
        let (allocator, repairer, validator, _temp) = setup();
        let root = allocator.allocate_root(&[1, 2, 3], "enwiki").unwrap();
        let storage = allocator.storage();

        let mut batch = storage.batch();
        batch.put_assignment(2, 999).unwrap();
        batch.delete_frontier(root).unwrap();
        storage.commit(batch).unwrap();

        let report = repairer.repair().unwrap();
        assert_eq!(report.retargeted_edges, 1);
        assert_eq!(report.frontier_fixes, 1);
        assert_eq!(storage.get_assignment(2).unwrap(), Some(root));
        assert!(storage.get_frontier_entry(root).unwrap().is_some());
        assert!(validator.validate().unwrap().is_consistent());
    }
}
