//! CLI argument parsing for cluster-tree.
//!
//! CLI flags override all other config sources.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Cluster Tree
///
/// Builds a navigable topic tree over a vectorized corpus, a batch of
/// frontier nodes per invocation.
#[derive(Parser, Debug)]
#[command(name = "cluster-tree")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to config file (overrides default ~/.config/cluster-tree/config.toml)
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// Set log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    pub log_level: Option<String>,

    /// Override database path
    #[arg(long, global = true)]
    pub db_path: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Load clustering vectors from a JSONL file
    Import {
        /// File with one {"item_id", "vector", "vector_3d"} object per line
        path: PathBuf,
    },

    /// Allocate the root over every vectorized item
    Init {
        /// Corpus name (default from config)
        #[arg(long)]
        corpus: Option<String>,
    },

    /// Expand frontier nodes
    Build {
        /// Frontier nodes to process (default from config)
        #[arg(short = 'n', long)]
        limit: Option<usize>,

        /// Keep running batches until the frontier is empty
        #[arg(long, conflicts_with = "limit")]
        all: bool,
    },

    /// Audit tree invariants
    Validate {
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Fix what validate reports
    Repair,

    /// Release claims older than the staleness window
    SweepClaims {
        /// Staleness window in seconds (default from config)
        #[arg(long)]
        older_than: Option<u64>,
    },

    /// Compute missing node centroids
    Centroids,

    /// Show tree progress
    Status,

    /// Show a node
    Node {
        node_id: u64,
    },

    /// List a node's children
    Children {
        node_id: u64,
    },

    /// List items under a node
    Members {
        node_id: u64,

        /// Maximum results
        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,
    },

    /// Set or clear a node label
    Label {
        node_id: u64,

        /// Label text
        #[arg(required_unless_present = "clear")]
        text: Option<String>,

        /// Remove the label
        #[arg(long)]
        clear: bool,
    },

    /// Configuration commands
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },

    /// Administrative commands
    Admin {
        #[command(subcommand)]
        command: AdminCommands,
    },
}

#[derive(Subcommand, Debug, Clone)]
pub enum ConfigCommands {
    /// Print the effective configuration as TOML
    Show,
}

/// Admin subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum AdminCommands {
    /// Show database statistics
    Stats,

    /// Trigger RocksDB compaction
    Compact,
}
