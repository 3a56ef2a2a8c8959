//! Tree construction error types.

use thiserror::Error;

use tree_types::{NodeId, NodeStatus};

use crate::partition::PartitionError;
use crate::vectors::VectorStoreError;

/// Errors that can occur while building or auditing the tree.
#[derive(Debug, Error)]
pub enum TreeError {
    /// Storage error; aborts the whole invocation
    #[error("Storage error: {0}")]
    Storage(#[from] tree_storage::StorageError),

    /// Domain record error
    #[error(transparent)]
    Types(#[from] tree_types::TypesError),

    /// Vector store unreachable; aborts the whole invocation
    #[error("Vector store error: {0}")]
    VectorStore(#[from] VectorStoreError),

    /// Partition primitive failed for one node; that node is retried later
    #[error("Partition failed for node {node_id}: {source}")]
    Partition {
        node_id: NodeId,
        #[source]
        source: PartitionError,
    },

    /// Node not found
    #[error("Node not found: {0}")]
    NodeNotFound(NodeId),

    /// Operation not allowed in the node's current status
    #[error("Node {node_id} is {status}, cannot {operation}")]
    InvalidState {
        node_id: NodeId,
        status: NodeStatus,
        operation: &'static str,
    },

    /// Partitions do not cover the parent's membership
    #[error("Partitions for node {node_id} hold {found} items, expected {expected}")]
    PartitionMismatch {
        node_id: NodeId,
        expected: u64,
        found: u64,
    },

    /// The claim was swept and is no longer held by this run
    #[error("Node {node_id} is no longer claimed by run {run_id} (held by {holder:?})")]
    ClaimLost {
        node_id: NodeId,
        run_id: String,
        holder: Option<String>,
    },

    /// Half-committed state found; run repair
    #[error("Atomicity violation at node {node_id}: {detail}")]
    AtomicityViolation { node_id: NodeId, detail: String },

    /// No item has a clustering vector yet
    #[error("Corpus has no vectorized items")]
    EmptyCorpus,

    /// Store was initialized for a different corpus
    #[error("Store holds corpus {stored:?}, not {requested:?}")]
    CorpusMismatch { stored: String, requested: String },

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl TreeError {
    /// Errors confined to a single node; the invocation continues.
    pub fn is_node_local(&self) -> bool {
        matches!(
            self,
            TreeError::Partition { .. }
                | TreeError::PartitionMismatch { .. }
                | TreeError::InvalidState { .. }
                | TreeError::ClaimLost { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TreeError::InvalidState {
            node_id: 4,
            status: NodeStatus::Leaf,
            operation: "expand",
        };
        assert_eq!(err.to_string(), "Node 4 is leaf, cannot expand");

        let err = TreeError::Partition {
            node_id: 9,
            source: PartitionError::EmptyInput,
        };
        assert!(err.to_string().contains("node 9"));
        assert!(err.is_node_local());

        let err = TreeError::ClaimLost {
            node_id: 3,
            run_id: "a".to_string(),
            holder: Some("b".to_string()),
        };
        assert!(err.is_node_local());

        let err = TreeError::EmptyCorpus;
        assert!(!err.is_node_local());
    }
}
