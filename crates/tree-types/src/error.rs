//! Error types shared by the cluster tree crates.

use thiserror::Error;

use crate::node::{NodeId, NodeStatus};

/// Errors raised while loading settings or manipulating domain records.
#[derive(Debug, Error)]
pub enum TypesError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A status change the node state machine does not allow
    #[error("Invalid status transition for node {node_id}: {from} -> {to}")]
    InvalidTransition {
        node_id: NodeId,
        from: NodeStatus,
        to: NodeStatus,
    },
}
