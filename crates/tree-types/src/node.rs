//! Cluster node types.
//!
//! The cluster tree is a strict tree rooted at a single depth-0 node:
//! Root -> Topic -> Subtopic -> ... -> Leaf
//!
//! Each node moves through a small state machine:
//!
//! ```text
//! expandable --claim--> claimed --expand--> expanded
//!     |                   |  \
//!     |                   |   --leaf------> leaf
//!     |                   --release--> expandable
//!     --leaf------------> leaf
//! ```
//!
//! `leaf` and `expanded` are terminal.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::TypesError;

/// Stable node identifier. Issued monotonically, never reused.
pub type NodeId = u64;

/// Identifier of a clustered item (an encyclopedia page id).
pub type ItemId = u64;

/// Number of member ids kept on each node for downstream labelers.
pub const SAMPLE_ITEM_LIMIT: usize = 10;

/// Lifecycle status of a cluster node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    /// Eligible for expansion on a future pass
    Expandable,
    /// Selected by a running builder, not yet committed
    Claimed,
    /// Terminal: never split
    Leaf,
    /// Terminal: split into children
    Expanded,
}

impl NodeStatus {
    /// Terminal states never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, NodeStatus::Leaf | NodeStatus::Expanded)
    }

    /// Whether the node is part of the frontier.
    pub fn is_frontier(&self) -> bool {
        matches!(self, NodeStatus::Expandable | NodeStatus::Claimed)
    }

    /// Whether an assignment edge may point at a node in this state.
    pub fn holds_items(&self) -> bool {
        !matches!(self, NodeStatus::Expanded)
    }

    /// Check whether `self -> next` is a legal transition.
    pub fn can_transition_to(&self, next: NodeStatus) -> bool {
        use NodeStatus::*;
        matches!(
            (self, next),
            (Expandable, Claimed)
                | (Expandable, Leaf)
                | (Expandable, Expanded)
                | (Claimed, Expandable)
                | (Claimed, Leaf)
                | (Claimed, Expanded)
        )
    }

    /// Short code used in key prefixes and CLI output.
    pub fn code(&self) -> &'static str {
        match self {
            NodeStatus::Expandable => "expandable",
            NodeStatus::Claimed => "claimed",
            NodeStatus::Leaf => "leaf",
            NodeStatus::Expanded => "expanded",
        }
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

/// A node of the cluster tree.
///
/// Node records are what the navigation API and the 3-D renderer read.
/// `node_id`, `parent_id` and `depth` never change after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterNode {
    /// Stable identifier
    pub node_id: NodeId,

    /// Parent node, `None` only for the root
    pub parent_id: Option<NodeId>,

    /// Root is 0; children are parent depth + 1
    pub depth: u32,

    /// Number of items under this node
    pub member_count: u64,

    /// Representative vector (mean of members); absent until computed
    #[serde(default)]
    pub centroid: Option<Vec<f32>>,

    /// Current lifecycle status
    pub status: NodeStatus,

    /// Number of children (non-zero only once expanded)
    #[serde(default)]
    pub child_count: u32,

    /// Expansion attempt counter; part of the expansion idempotency key
    #[serde(default)]
    pub generation: u32,

    /// First few member ids, for labelers
    #[serde(default)]
    pub sample_item_ids: Vec<ItemId>,

    /// Topic label written by the labeling stage
    #[serde(default)]
    pub label: Option<String>,

    /// Creation time
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
}

impl ClusterNode {
    /// Create a node with the given placement. Status starts as expandable;
    /// callers decide the initial status with [`ClusterNode::with_status`].
    pub fn new(node_id: NodeId, parent_id: Option<NodeId>, depth: u32, member_count: u64) -> Self {
        Self {
            node_id,
            parent_id,
            depth,
            member_count,
            centroid: None,
            status: NodeStatus::Expandable,
            child_count: 0,
            generation: 0,
            sample_item_ids: Vec::new(),
            label: None,
            created_at: Utc::now(),
        }
    }

    /// Create a root node with a placeholder id (the allocator assigns the real one).
    pub fn root(member_count: u64) -> Self {
        Self::new(0, None, 0, member_count)
    }

    pub fn with_status(mut self, status: NodeStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_centroid(mut self, centroid: Vec<f32>) -> Self {
        self.centroid = Some(centroid);
        self
    }

    pub fn with_samples(mut self, items: &[ItemId]) -> Self {
        self.sample_item_ids = items.iter().take(SAMPLE_ITEM_LIMIT).copied().collect();
        self
    }

    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    pub fn is_leaf(&self) -> bool {
        self.status == NodeStatus::Leaf
    }

    /// Move to `next`, rejecting transitions the state machine forbids.
    pub fn transition(&mut self, next: NodeStatus) -> Result<(), TypesError> {
        if !self.status.can_transition_to(next) {
            return Err(TypesError::InvalidTransition {
                node_id: self.node_id,
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    /// Serialize to JSON bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserialize from JSON bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Placement of one item: the node currently holding it.
///
/// Every item in the corpus has exactly one edge. It targets the deepest
/// node containing the item, which is never an expanded node; once the
/// tree is complete every edge targets a leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignmentEdge {
    pub item_id: ItemId,
    pub node_id: NodeId,
}

impl AssignmentEdge {
    pub fn new(item_id: ItemId, node_id: NodeId) -> Self {
        Self { item_id, node_id }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(NodeStatus::Leaf.is_terminal());
        assert!(NodeStatus::Expanded.is_terminal());
        assert!(!NodeStatus::Expandable.is_terminal());
        assert!(!NodeStatus::Claimed.is_terminal());
    }

    #[test]
    fn test_terminal_states_never_transition() {
        for terminal in [NodeStatus::Leaf, NodeStatus::Expanded] {
            for next in [
                NodeStatus::Expandable,
                NodeStatus::Claimed,
                NodeStatus::Leaf,
                NodeStatus::Expanded,
            ] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn test_claim_release_cycle() {
        let mut node = ClusterNode::new(3, Some(1), 1, 40);
        node.transition(NodeStatus::Claimed).unwrap();
        node.transition(NodeStatus::Expandable).unwrap();
        node.transition(NodeStatus::Claimed).unwrap();
        node.transition(NodeStatus::Expanded).unwrap();

        let err = node.transition(NodeStatus::Leaf).unwrap_err();
        assert!(err.to_string().contains("expanded -> leaf"));
    }

    #[test]
    fn test_samples_are_capped() {
        let items: Vec<ItemId> = (0..25).collect();
        let node = ClusterNode::new(1, None, 0, 25).with_samples(&items);
        assert_eq!(node.sample_item_ids.len(), SAMPLE_ITEM_LIMIT);
        assert_eq!(node.sample_item_ids[0], 0);
    }

    #[test]
    fn test_node_serialization() {
        let node = ClusterNode::new(9, Some(2), 3, 120)
            .with_status(NodeStatus::Leaf)
            .with_centroid(vec![0.5, -0.25]);
        let bytes = node.to_bytes().unwrap();
        let decoded = ClusterNode::from_bytes(&bytes).unwrap();

        assert_eq!(decoded.node_id, 9);
        assert_eq!(decoded.parent_id, Some(2));
        assert_eq!(decoded.status, NodeStatus::Leaf);
        assert_eq!(decoded.centroid, Some(vec![0.5, -0.25]));
    }

    #[test]
    fn test_status_serializes_snake_case() {
        let json = serde_json::to_string(&NodeStatus::Expandable).unwrap();
        assert_eq!(json, "\"expandable\"");
    }

    #[test]
    fn test_expanded_holds_no_items() {
        assert!(!NodeStatus::Expanded.holds_items());
        assert!(NodeStatus::Leaf.holds_items());
        assert!(NodeStatus::Claimed.holds_items());
    }
}
