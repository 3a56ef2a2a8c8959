//! Cluster tree CLI library exports.
//!
//! # Modules
//!
//! - `cli`: Command-line argument parsing with clap
//! - `commands`: Command implementations (init, build, validate, repair, ...)
//! - `import`: JSONL vector import

pub mod cli;
pub mod commands;
pub mod import;

pub use cli::{AdminCommands, Cli, Commands, ConfigCommands};
pub use commands::{
    handle_admin, handle_build, handle_centroids, handle_config, handle_import, handle_init,
    handle_label, handle_repair, handle_sweep_claims, handle_validate, init_logging,
    load_settings, show_children, show_members, show_node, show_status,
};
pub use import::{import_vectors, ImportStats};
