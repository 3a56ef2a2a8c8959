//! Cluster Tree
//!
//! Builds a hierarchical topic tree over a vectorized corpus. Each `build`
//! invocation expands a bounded batch of frontier nodes and can be stopped
//! at any point; the next invocation resumes from the persisted frontier.
//!
//! # Usage
//!
//! ```bash
//! cluster-tree import vectors.jsonl
//! cluster-tree init --corpus enwiki
//! cluster-tree build --limit 200
//! cluster-tree validate
//! ```
//!
//! # Configuration
//!
//! Configuration is loaded in order (later sources override earlier):
//! 1. Built-in defaults
//! 2. Config file (~/.config/cluster-tree/config.toml)
//! 3. Environment variables (CLUSTER_TREE__*)
//! 4. CLI flags

use anyhow::Result;
use clap::Parser;

use tree_cli::{
    handle_admin, handle_build, handle_centroids, handle_config, handle_import, handle_init,
    handle_label, handle_repair, handle_sweep_claims, handle_validate, init_logging,
    load_settings, show_children, show_members, show_node, show_status, Cli, Commands,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = load_settings(
        cli.config.as_deref(),
        cli.db_path.as_deref(),
        cli.log_level.as_deref(),
    )?;
    init_logging(&settings.log_level)?;

    match cli.command {
        Commands::Import { path } => handle_import(&settings, &path)?,
        Commands::Init { corpus } => handle_init(&settings, corpus.as_deref())?,
        Commands::Build { limit, all } => handle_build(&settings, limit, all).await?,
        Commands::Validate { json } => handle_validate(&settings, json)?,
        Commands::Repair => handle_repair(&settings)?,
        Commands::SweepClaims { older_than } => handle_sweep_claims(&settings, older_than)?,
        Commands::Centroids => handle_centroids(&settings)?,
        Commands::Status => show_status(&settings)?,
        Commands::Node { node_id } => show_node(&settings, node_id)?,
        Commands::Children { node_id } => show_children(&settings, node_id)?,
        Commands::Members { node_id, limit } => show_members(&settings, node_id, limit)?,
        Commands::Label {
            node_id,
            text,
            clear,
        } => handle_label(&settings, node_id, text, clear)?,
        Commands::Config { command } => handle_config(&settings, command)?,
        Commands::Admin { command } => handle_admin(&settings, command)?,
    }

    Ok(())
}
