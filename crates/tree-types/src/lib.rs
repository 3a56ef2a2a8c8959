//! # tree-types
//!
//! Shared domain types for the cluster tree.
//!
//! This crate defines the records every other crate reads and writes:
//! - Cluster nodes and their status state machine
//! - Frontier entries (expandable and claimed nodes)
//! - Assignment edges from items to the node currently holding them
//! - Expansion records written when a node is split into children
//! - Settings: layered configuration
//!
//! ## Usage
//!
//! ```rust
//! use tree_types::{ClusterNode, NodeStatus};
//!
//! let root = ClusterNode::root(7);
//! assert_eq!(root.status, NodeStatus::Expandable);
//! ```

pub mod config;
pub mod error;
pub mod expansion;
pub mod frontier;
pub mod node;

pub use config::{staleness_window, KMeansConfig, Settings, TreeConfig, MAX_CLAIM_STALENESS_SECS};
pub use error::TypesError;
pub use expansion::ExpansionRecord;
pub use frontier::{FrontierEntry, FrontierStatus};
pub use node::{AssignmentEdge, ClusterNode, ItemId, NodeId, NodeStatus, SAMPLE_ITEM_LIMIT};
