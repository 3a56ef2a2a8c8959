//! # tree-builder
//!
//! Recursive hierarchical clustering of a vectorized corpus into a
//! navigable tree of topic clusters, built incrementally across many
//! invocations.
//!
//! ## Components
//! - [`VectorStore`]: read-only access to clustering-input vectors
//! - [`Partitioner`]: splits a node's vectors into at most k clusters
//!   ([`KMeansPartitioner`] is the built-in implementation)
//! - [`NodeAllocator`]: issues stable node ids and commits expansions atomically
//! - [`FrontierTracker`]: persisted work queue with claim/release semantics
//! - [`TreeBuilder`]: pulls claimed nodes up to a budget and expands them
//! - [`ConsistencyValidator`]: read-only audit of the tree invariants
//! - [`Repairer`]: fixes what the validator reports, idempotently
//!
//! Every node expansion is a single RocksDB write batch: new children,
//! retargeted edges and the parent's flip to `expanded` become visible
//! together or not at all.

pub mod allocator;
pub mod builder;
pub mod centroids;
pub mod error;
pub mod frontier;
pub mod kmeans;
pub mod navigation;
pub mod partition;
pub mod repair;
pub mod silhouette;
pub mod validator;
pub mod vectors;

pub use allocator::{NodeAllocator, Partition};
pub use builder::{BuildReport, NodeFailure, TreeBuilder};
pub use centroids::CentroidBackfill;
pub use error::TreeError;
pub use frontier::FrontierTracker;
pub use kmeans::KMeansPartitioner;
pub use navigation::{TreeNavigator, TreeStats};
pub use partition::{PartitionError, Partitioner, Partitioning};
pub use repair::{RepairReport, Repairer};
pub use validator::{ConsistencyValidator, ValidationReport, Violation};
pub use vectors::{InMemoryVectorStore, StorageVectorStore, VectorStore, VectorStoreError};
