//! Storage layer for the cluster tree.
//!
//! Provides RocksDB-backed storage with:
//! - Column family isolation for nodes, frontier, edges and vectors
//! - Zero-padded numeric keys so iteration order equals creation order
//! - Atomic multi-record writes via [`StoreBatch`]
//! - A persisted node id counter that never hands out an id twice

pub mod codec;
pub mod column_families;
pub mod db;
pub mod error;
pub mod keys;

pub use db::{Storage, StorageStats, StoreBatch};
pub use error::StorageError;
pub use keys::{ItemKey, MemberKey, NodeKey};
