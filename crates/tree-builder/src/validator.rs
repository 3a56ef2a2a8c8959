//! Consistency validation.
//!
//! A read-only audit of the persisted tree. Every check scans the column
//! families directly instead of going through the builder, so it also
//! catches damage done by tools other than the builder.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{Duration, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use tree_storage::db::META_ROOT_ID;
use tree_storage::Storage;
use tree_types::{ClusterNode, FrontierStatus, ItemId, NodeId, NodeStatus};

use crate::error::TreeError;

/// One broken invariant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Violation {
    #[error("No root node")]
    NoRoot,

    #[error("Multiple root nodes: {node_ids:?}")]
    MultipleRoots { node_ids: Vec<NodeId> },

    #[error("Recorded root {recorded} is not the root node {found}")]
    RootMismatch { recorded: NodeId, found: NodeId },

    #[error("Root {node_id} has depth {depth}")]
    RootDepth { node_id: NodeId, depth: u32 },

    #[error("Node {node_id} names missing parent {parent_id}")]
    MissingParent { node_id: NodeId, parent_id: NodeId },

    #[error("Node {node_id} has depth {depth}, parent depth is {parent_depth}")]
    DepthMismatch {
        node_id: NodeId,
        depth: u32,
        parent_depth: u32,
    },

    #[error("Node {node_id} is on a parent cycle")]
    Cycle { node_id: NodeId },

    #[error("Node {node_id} hangs under {parent_id}, which is {parent_status}")]
    ChildOfUnexpanded {
        node_id: NodeId,
        parent_id: NodeId,
        parent_status: NodeStatus,
    },

    #[error("Expanded node {node_id} has no expansion record")]
    MissingExpansionRecord { node_id: NodeId },

    #[error("Expansion record for {node_id} disagrees with the tree: {detail}")]
    ExpansionMismatch { node_id: NodeId, detail: String },

    #[error("Children of {node_id} hold {children_total} items, node holds {member_count}")]
    ChildTotalMismatch {
        node_id: NodeId,
        member_count: u64,
        children_total: u64,
    },

    #[error("Node {node_id} is {status} but not on the frontier")]
    MissingFrontierEntry { node_id: NodeId, status: NodeStatus },

    #[error("Frontier entry for {node_id} does not match a frontier node")]
    StrayFrontierEntry { node_id: NodeId },

    #[error("Frontier entry for {node_id} is {entry_claimed}, node is {status}")]
    FrontierStatusMismatch {
        node_id: NodeId,
        entry_claimed: &'static str,
        status: NodeStatus,
    },

    #[error("Node {node_id} claimed by {claimed_by} for {age_secs}s")]
    StaleClaim {
        node_id: NodeId,
        claimed_by: String,
        age_secs: i64,
    },

    #[error("Item {item_id} assigned to missing node {node_id}")]
    EdgeToMissingNode { item_id: ItemId, node_id: NodeId },

    #[error("Item {item_id} assigned to expanded node {node_id}")]
    EdgeToExpandedNode { item_id: ItemId, node_id: NodeId },

    #[error("Item {item_id} is indexed under {indexed:?} but assigned to {assigned}")]
    EdgeIndexMismatch {
        item_id: ItemId,
        assigned: NodeId,
        indexed: Option<NodeId>,
    },

    #[error("Node {node_id} counts {member_count} members, {edges} edges point at it")]
    EdgeCountMismatch {
        node_id: NodeId,
        member_count: u64,
        edges: u64,
    },

    #[error("{edges} assignment edges, root holds {root_members} items")]
    ItemCountMismatch { edges: u64, root_members: u64 },
}

/// Result of a validation pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ValidationReport {
    pub violations: Vec<Violation>,
    pub node_count: u64,
    pub leaf_count: u64,
    pub frontier_count: u64,
    pub item_count: u64,
    /// No node left on the frontier
    pub complete: bool,
}

impl ValidationReport {
    pub fn is_consistent(&self) -> bool {
        self.violations.is_empty()
    }
}

/// Read-only audit of the tree invariants.
pub struct ConsistencyValidator {
    storage: Arc<Storage>,
    staleness: Duration,
}

impl ConsistencyValidator {
    pub fn new(storage: Arc<Storage>, staleness: Duration) -> Self {
        Self { storage, staleness }
    }

    pub fn validate(&self) -> Result<ValidationReport, TreeError> {
        let nodes: BTreeMap<NodeId, ClusterNode> = self
            .storage
            .list_nodes()?
            .into_iter()
            .map(|n| (n.node_id, n))
            .collect();

        let mut report = ValidationReport {
            node_count: nodes.len() as u64,
            leaf_count: nodes.values().filter(|n| n.is_leaf()).count() as u64,
            ..Default::default()
        };
        let mut violations = Vec::new();

        if !nodes.is_empty() {
            self.check_root(&nodes, &mut violations)?;
        }
        check_structure(&nodes, &mut violations);
        self.check_expansions(&nodes, &mut violations)?;
        report.frontier_count = self.check_frontier(&nodes, &mut violations)?;
        report.item_count = self.check_edges(&nodes, &mut violations)?;
        report.complete = !nodes.is_empty() && report.frontier_count == 0;

        if violations.is_empty() {
            info!(nodes = report.node_count, items = report.item_count, "Tree is consistent");
        } else {
            warn!(violations = violations.len(), "Tree has violations");
        }
        report.violations = violations;
        Ok(report)
    }

    fn check_root(
        &self,
        nodes: &BTreeMap<NodeId, ClusterNode>,
        violations: &mut Vec<Violation>,
    ) -> Result<(), TreeError> {
        let roots: Vec<&ClusterNode> = nodes.values().filter(|n| n.is_root()).collect();
        match roots.as_slice() {
            [] => violations.push(Violation::NoRoot),
            [root] => {
                if root.depth != 0 {
                    violations.push(Violation::RootDepth {
                        node_id: root.node_id,
                        depth: root.depth,
                    });
                }
                if let Some(recorded) = self.storage.get_meta_u64(META_ROOT_ID)? {
                    if recorded != root.node_id {
                        violations.push(Violation::RootMismatch {
                            recorded,
                            found: root.node_id,
                        });
                    }
                }
            }
            many => violations.push(Violation::MultipleRoots {
                node_ids: many.iter().map(|n| n.node_id).collect(),
            }),
        }
        Ok(())
    }

    fn check_expansions(
        &self,
        nodes: &BTreeMap<NodeId, ClusterNode>,
        violations: &mut Vec<Violation>,
    ) -> Result<(), TreeError> {
        let children = children_by_parent(nodes);
        let records: HashMap<NodeId, _> = self
            .storage
            .list_expansions()?
            .into_iter()
            .map(|r| (r.parent_id, r))
            .collect();

        for node in nodes.values() {
            let actual = children.get(&node.node_id).cloned().unwrap_or_default();
            let record = records.get(&node.node_id);

            if node.status != NodeStatus::Expanded {
                if record.is_some() {
                    violations.push(Violation::ExpansionMismatch {
                        node_id: node.node_id,
                        detail: format!("record exists but node is {}", node.status),
                    });
                }
                continue;
            }

            let Some(record) = record else {
                violations.push(Violation::MissingExpansionRecord {
                    node_id: node.node_id,
                });
                continue;
            };

            if record.child_ids != actual {
                violations.push(Violation::ExpansionMismatch {
                    node_id: node.node_id,
                    detail: format!("record lists {:?}, tree has {:?}", record.child_ids, actual),
                });
            }
            if record.generation != node.generation {
                violations.push(Violation::ExpansionMismatch {
                    node_id: node.node_id,
                    detail: format!(
                        "record generation {}, node generation {}",
                        record.generation, node.generation
                    ),
                });
            }
            if node.child_count as usize != actual.len() {
                violations.push(Violation::ExpansionMismatch {
                    node_id: node.node_id,
                    detail: format!("child_count {}, tree has {}", node.child_count, actual.len()),
                });
            }

            let children_total: u64 = actual
                .iter()
                .filter_map(|id| nodes.get(id))
                .map(|c| c.member_count)
                .sum();
            if children_total != node.member_count || record.member_total != node.member_count {
                violations.push(Violation::ChildTotalMismatch {
                    node_id: node.node_id,
                    member_count: node.member_count,
                    children_total,
                });
            }
        }

        for parent_id in records.keys() {
            if !nodes.contains_key(parent_id) {
                violations.push(Violation::ExpansionMismatch {
                    node_id: *parent_id,
                    detail: "record for missing node".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Returns the number of frontier entries.
    fn check_frontier(
        &self,
        nodes: &BTreeMap<NodeId, ClusterNode>,
        violations: &mut Vec<Violation>,
    ) -> Result<u64, TreeError> {
        let now = Utc::now();
        let entries = self.storage.scan_frontier(None, |_| true)?;
        let entry_ids: HashMap<NodeId, usize> = entries
            .iter()
            .enumerate()
            .map(|(i, e)| (e.node_id, i))
            .collect();

        for entry in &entries {
            let Some(node) = nodes.get(&entry.node_id) else {
                violations.push(Violation::StrayFrontierEntry {
                    node_id: entry.node_id,
                });
                continue;
            };

            let expected = match node.status {
                NodeStatus::Expandable => FrontierStatus::Expandable,
                NodeStatus::Claimed => FrontierStatus::Claimed,
                NodeStatus::Leaf | NodeStatus::Expanded => {
                    violations.push(Violation::StrayFrontierEntry {
                        node_id: entry.node_id,
                    });
                    continue;
                }
            };
            if entry.status != expected {
                violations.push(Violation::FrontierStatusMismatch {
                    node_id: entry.node_id,
                    entry_claimed: if entry.is_claimed() {
                        "claimed"
                    } else {
                        "unclaimed"
                    },
                    status: node.status,
                });
            }

            if entry.is_stale(now, self.staleness) {
                violations.push(Violation::StaleClaim {
                    node_id: entry.node_id,
                    claimed_by: entry.claimed_by.clone().unwrap_or_default(),
                    age_secs: entry
                        .claimed_at
                        .map(|at| (now - at).num_seconds())
                        .unwrap_or_default(),
                });
            }
        }

        for node in nodes.values() {
            if node.status.is_frontier() && !entry_ids.contains_key(&node.node_id) {
                violations.push(Violation::MissingFrontierEntry {
                    node_id: node.node_id,
                    status: node.status,
                });
            }
        }
        Ok(entries.len() as u64)
    }

    /// Returns the number of assignment edges.
    fn check_edges(
        &self,
        nodes: &BTreeMap<NodeId, ClusterNode>,
        violations: &mut Vec<Violation>,
    ) -> Result<u64, TreeError> {
        let mut indexed: HashMap<ItemId, NodeId> = HashMap::new();
        self.storage.for_each_member(|node_id, item_id| {
            indexed.insert(item_id, node_id);
        })?;

        let mut edge_counts: HashMap<NodeId, u64> = HashMap::new();
        let mut edges = 0u64;
        self.storage.for_each_assignment(|item_id, node_id| {
            edges += 1;
            match nodes.get(&node_id) {
                None => violations.push(Violation::EdgeToMissingNode { item_id, node_id }),
                Some(node) if !node.status.holds_items() => {
                    violations.push(Violation::EdgeToExpandedNode { item_id, node_id })
                }
                Some(_) => *edge_counts.entry(node_id).or_default() += 1,
            }
            let index_node = indexed.get(&item_id).copied();
            if index_node != Some(node_id) {
                violations.push(Violation::EdgeIndexMismatch {
                    item_id,
                    assigned: node_id,
                    indexed: index_node,
                });
            }
        })?;

        for node in nodes.values().filter(|n| n.status.holds_items()) {
            let count = edge_counts.get(&node.node_id).copied().unwrap_or_default();
            if count != node.member_count {
                violations.push(Violation::EdgeCountMismatch {
                    node_id: node.node_id,
                    member_count: node.member_count,
                    edges: count,
                });
            }
        }

        if let Some(root) = nodes.values().find(|n| n.is_root()) {
            if edges != root.member_count {
                violations.push(Violation::ItemCountMismatch {
                    edges,
                    root_members: root.member_count,
                });
            }
        }
        Ok(edges)
    }
}

/// Child ids per parent, in creation order.
pub(crate) fn children_by_parent(
    nodes: &BTreeMap<NodeId, ClusterNode>,
) -> HashMap<NodeId, Vec<NodeId>> {
    let mut children: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
    for node in nodes.values() {
        if let Some(parent_id) = node.parent_id {
            children.entry(parent_id).or_default().push(node.node_id);
        }
    }
    children
}

fn check_structure(nodes: &BTreeMap<NodeId, ClusterNode>, violations: &mut Vec<Violation>) {
    for node in nodes.values() {
        let Some(parent_id) = node.parent_id else {
            continue;
        };
        let Some(parent) = nodes.get(&parent_id) else {
            violations.push(Violation::MissingParent {
                node_id: node.node_id,
                parent_id,
            });
            continue;
        };

        if node.depth != parent.depth + 1 {
            violations.push(Violation::DepthMismatch {
                node_id: node.node_id,
                depth: node.depth,
                parent_depth: parent.depth,
            });
        }
        if parent.status != NodeStatus::Expanded {
            violations.push(Violation::ChildOfUnexpanded {
                node_id: node.node_id,
                parent_id,
                parent_status: parent.status,
            });
        }
    }

    // Walk up from every node; a chain longer than the node count loops
    for node in nodes.values() {
        let mut current = node.parent_id;
        let mut steps = 0usize;
        while let Some(id) = current {
            steps += 1;
            if steps > nodes.len() {
                violations.push(Violation::Cycle {
                    node_id: node.node_id,
                });
                break;
            }
            current = nodes.get(&id).and_then(|n| n.parent_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::{NodeAllocator, Partition};
    use crate::frontier::FrontierTracker;
    use tempfile::TempDir;
    use tree_types::TreeConfig;

    fn setup() -> (NodeAllocator, FrontierTracker, ConsistencyValidator, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let storage = Arc::new(Storage::open(temp_dir.path()).unwrap());
        let config = TreeConfig {
            leaf_threshold: 2,
            branching_factor: 2,
            ..Default::default()
        };
        (
            NodeAllocator::new(Arc::clone(&storage)),
            FrontierTracker::new(Arc::clone(&storage), config),
            ConsistencyValidator::new(storage, Duration::seconds(3600)),
            temp_dir,
        )
    }

    #[test]
    fn test_empty_store_is_consistent() {
        let (_allocator, _frontier, validator, _temp) = setup();
        let report = validator.validate().unwrap();
        assert!(report.is_consistent());
        assert!(!report.complete);
    }

    #[test]
    fn test_partial_tree_is_consistent() {
        let (allocator, frontier, validator, _temp) = setup();
        let root = allocator.allocate_root(&[1, 2, 3, 4, 5], "enwiki").unwrap();
        let children = allocator
            .allocate_children(
                root,
                vec![
                    Partition::new(vec![0.0], vec![1, 2]),
                    Partition::new(vec![1.0], vec![3, 4, 5]),
                ],
            )
            .unwrap();
        for child in children {
            frontier.mark_expandable(child).unwrap();
        }
        frontier.next_batch(1).unwrap();

        let report = validator.validate().unwrap();
        assert!(report.is_consistent(), "{:?}", report.violations);
        assert_eq!(report.node_count, 3);
        assert_eq!(report.leaf_count, 1);
        assert_eq!(report.item_count, 5);
        assert!(!report.complete);
    }

    #[test]
    fn test_detects_damaged_records() {
        let (allocator, _frontier, validator, _temp) = setup();
        let root = allocator.allocate_root(&[1, 2], "enwiki").unwrap();
        let storage = allocator.storage();

        // Orphan child under an unexpanded root, with a bad depth
        let mut batch = storage.batch();
        batch
            .put_node(&ClusterNode::new(50, Some(root), 3, 1).with_status(NodeStatus::Leaf))
            .unwrap();
        batch.put_assignment(2, 50).unwrap();
        storage.commit(batch).unwrap();

        let report = validator.validate().unwrap();
        let v = &report.violations;
        assert!(v.contains(&Violation::DepthMismatch {
            node_id: 50,
            depth: 3,
            parent_depth: 0
        }));
        assert!(v.iter().any(|x| matches!(x, Violation::ChildOfUnexpanded { node_id: 50, .. })));
        assert!(v.iter().any(|x| matches!(x, Violation::EdgeIndexMismatch { item_id: 2, .. })));
        assert!(v.contains(&Violation::EdgeCountMismatch {
            node_id: root,
            member_count: 2,
            edges: 1
        }));
    }

    #[test]
    fn test_detects_stale_claim() {
        let (allocator, frontier, _validator, _temp) = setup();
        allocator.allocate_root(&[1, 2, 3], "enwiki").unwrap();
        frontier.next_batch(1).unwrap();

        let strict = ConsistencyValidator::new(Arc::clone(allocator.storage()), Duration::seconds(-1));
        let report = strict.validate().unwrap();
        assert!(report
            .violations
            .iter()
            .any(|v| matches!(v, Violation::StaleClaim { .. })));
    }

    #[test]
    fn test_violation_display() {
        let v = Violation::EdgeToExpandedNode {
            item_id: 3,
            node_id: 1,
        };
        assert_eq!(v.to_string(), "Item 3 assigned to expanded node 1");
    }
}
