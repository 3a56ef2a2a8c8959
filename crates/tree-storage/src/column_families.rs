//! Column family definitions for RocksDB.
//!
//! Each column family isolates data with different access patterns:
//! - nodes: cluster node records (default compaction)
//! - frontier: expandable/claimed queue, iterated in creation order
//! - assignments: item -> holding node edges
//! - members: node -> item reverse index for loading a node's members
//! - expansions: per-parent expansion records
//! - vectors: clustering-input vectors (compressed, read-mostly)
//! - vectors_3d: visualization vectors, stored for downstream readers only
//! - meta: counters and corpus metadata

use rocksdb::{ColumnFamilyDescriptor, Options};

/// Column family name for cluster node records
pub const CF_NODES: &str = "nodes";

/// Column family name for the frontier queue
pub const CF_FRONTIER: &str = "frontier";

/// Column family name for item -> node assignment edges
pub const CF_ASSIGNMENTS: &str = "assignments";

/// Column family name for the node -> item reverse index
pub const CF_MEMBERS: &str = "members";

/// Column family name for expansion records
pub const CF_EXPANSIONS: &str = "expansions";

/// Column family name for clustering-input vectors
pub const CF_VECTORS: &str = "vectors";

/// Column family name for 3-D visualization vectors
pub const CF_VECTORS_3D: &str = "vectors_3d";

/// Column family name for counters and metadata
pub const CF_META: &str = "meta";

/// All column family names
pub const ALL_CF_NAMES: &[&str] = &[
    CF_NODES,
    CF_FRONTIER,
    CF_ASSIGNMENTS,
    CF_MEMBERS,
    CF_EXPANSIONS,
    CF_VECTORS,
    CF_VECTORS_3D,
    CF_META,
];

/// Vectors are written once and read many times
fn vectors_options() -> Options {
    let mut opts = Options::default();
    opts.set_compression_type(rocksdb::DBCompressionType::Zstd);
    opts
}

/// Build all column family descriptors
pub fn build_cf_descriptors() -> Vec<ColumnFamilyDescriptor> {
    vec![
        ColumnFamilyDescriptor::new(CF_NODES, Options::default()),
        ColumnFamilyDescriptor::new(CF_FRONTIER, Options::default()),
        ColumnFamilyDescriptor::new(CF_ASSIGNMENTS, Options::default()),
        ColumnFamilyDescriptor::new(CF_MEMBERS, Options::default()),
        ColumnFamilyDescriptor::new(CF_EXPANSIONS, Options::default()),
        ColumnFamilyDescriptor::new(CF_VECTORS, vectors_options()),
        ColumnFamilyDescriptor::new(CF_VECTORS_3D, vectors_options()),
        ColumnFamilyDescriptor::new(CF_META, Options::default()),
    ]
}
