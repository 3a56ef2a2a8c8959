//! Command implementations for cluster-tree.
//!
//! Every command opens the store, does its work and exits. `build` is the
//! only long-running one; Ctrl+C stops it between nodes and releases any
//! claims it has not started on.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;

use tree_builder::{
    CentroidBackfill, ConsistencyValidator, FrontierTracker, KMeansPartitioner, NodeAllocator,
    Repairer, StorageVectorStore, TreeBuilder, TreeNavigator,
};
use tree_storage::Storage;
use tree_types::{staleness_window, ClusterNode, Settings};

use crate::cli::{AdminCommands, ConfigCommands};
use crate::import::import_vectors;

/// Load settings and apply CLI overrides (highest precedence).
pub fn load_settings(
    config_path: Option<&str>,
    db_path_override: Option<&str>,
    log_level_override: Option<&str>,
) -> Result<Settings> {
    let mut settings = Settings::load(config_path).context("Failed to load configuration")?;
    if let Some(db_path) = db_path_override {
        settings.db_path = db_path.to_string();
    }
    if let Some(log_level) = log_level_override {
        settings.log_level = log_level.to_string();
    }
    Ok(settings)
}

/// Initialize logging. `RUST_LOG` wins over the configured level.
pub fn init_logging(log_level: &str) -> Result<()> {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;
    Ok(())
}

fn open_storage(settings: &Settings) -> Result<Arc<Storage>> {
    let db_path = settings.expanded_db_path();
    if let Some(parent) = db_path.parent() {
        fs::create_dir_all(parent).context("Failed to create database directory")?;
    }
    let storage = Storage::open(&db_path).context("Failed to open storage")?;
    Ok(Arc::new(storage))
}

fn create_builder(
    settings: &Settings,
    storage: Arc<Storage>,
    cancel: CancellationToken,
) -> Result<TreeBuilder> {
    let vectors = Arc::new(StorageVectorStore::new(Arc::clone(&storage)));
    let partitioner = Arc::new(
        KMeansPartitioner::new(settings.tree.kmeans.clone()).with_cancellation(cancel.clone()),
    );
    let builder = TreeBuilder::new(storage, vectors, partitioner, settings.tree.clone())?
        .with_cancellation(cancel);
    Ok(builder)
}

/// Import clustering vectors from a JSONL file.
pub fn handle_import(settings: &Settings, path: &Path) -> Result<()> {
    let storage = open_storage(settings)?;
    let stats = import_vectors(&storage, path)?;
    println!(
        "Imported {} vectors ({} with 3-D placement), skipped {}, malformed {}",
        stats.imported, stats.with_3d, stats.skipped, stats.malformed
    );
    Ok(())
}

/// Allocate the root. Safe to run again.
pub fn handle_init(settings: &Settings, corpus: Option<&str>) -> Result<()> {
    let corpus = corpus.unwrap_or(&settings.corpus);
    let storage = open_storage(settings)?;
    let builder = create_builder(settings, storage, CancellationToken::new())?;
    let root_id = builder.init(corpus)?;
    let root = builder
        .allocator()
        .get_node(root_id)?
        .context("Root vanished after init")?;
    println!(
        "Root {} over {} items ({}), corpus {}",
        root_id, root.member_count, root.status, corpus
    );
    Ok(())
}

/// Run one batch, or batches until the frontier drains with `all`.
pub async fn handle_build(settings: &Settings, limit: Option<usize>, all: bool) -> Result<()> {
    let storage = open_storage(settings)?;
    let cancel = CancellationToken::new();
    let builder = create_builder(settings, storage, cancel.clone())?;
    let limit = limit.unwrap_or(settings.tree.batch_limit);

    let watcher = cancel.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C, stopping after current node...");
            watcher.cancel();
        }
    });

    info!(run_id = builder.run_id(), limit, all, "Starting build");
    let report = tokio::task::spawn_blocking(move || {
        if all {
            builder.run_until_complete()
        } else {
            builder.run(limit)
        }
    })
    .await
    .context("Build task panicked")??;

    println!("Run {}", report.run_id);
    println!("  Claimed:          {}", report.claimed);
    println!("  Expanded:         {}", report.expanded);
    println!("  Children created: {}", report.children_created);
    println!("  Leaves:           {}", report.leaves);
    println!("  Still expandable: {}", report.enqueued);
    if report.degenerate + report.low_quality > 0 {
        println!(
            "  Unsplittable:     {} degenerate, {} below silhouette gate",
            report.degenerate, report.low_quality
        );
    }
    if report.missing_vectors > 0 {
        println!("  Missing vectors:  {}", report.missing_vectors);
    }
    if report.malformed_vectors > 0 {
        println!("  Malformed vectors: {}", report.malformed_vectors);
    }
    if report.anomalies > 0 {
        println!("  Anomalies:        {}", report.anomalies);
    }
    for failure in &report.failures {
        println!("  Failed node {}: {}", failure.node_id, failure.error);
    }
    if report.cancelled {
        println!("Cancelled; unprocessed claims were released");
    }
    Ok(())
}

/// Audit the tree. Fails when any invariant is broken.
pub fn handle_validate(settings: &Settings, json: bool) -> Result<()> {
    let storage = open_storage(settings)?;
    let validator = ConsistencyValidator::new(storage, settings.tree.claim_staleness());
    let report = validator.validate()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!(
            "{} nodes, {} leaves, {} items, {} on frontier{}",
            report.node_count,
            report.leaf_count,
            report.item_count,
            report.frontier_count,
            if report.complete { " (complete)" } else { "" }
        );
        for violation in &report.violations {
            println!("  VIOLATION: {}", violation);
        }
    }

    if !report.is_consistent() {
        anyhow::bail!("{} violations found", report.violations.len());
    }
    Ok(())
}

pub fn handle_repair(settings: &Settings) -> Result<()> {
    let storage = open_storage(settings)?;
    let report = Repairer::new(storage, settings.tree.clone()).repair()?;

    if report.is_noop() {
        println!("Nothing to repair");
    } else {
        println!("Released claims:     {}", report.released_claims);
        println!("Rolled back nodes:   {}", report.rolled_back_nodes);
        println!("Rebuilt expansions:  {}", report.rebuilt_expansions);
        println!("Removed expansions:  {}", report.removed_expansions);
        println!("Retargeted edges:    {}", report.retargeted_edges);
        println!("Frontier fixes:      {}", report.frontier_fixes);
    }
    for problem in &report.unresolved {
        println!("  UNRESOLVED: {}", problem);
    }
    Ok(())
}

pub fn handle_sweep_claims(settings: &Settings, older_than: Option<u64>) -> Result<()> {
    let storage = open_storage(settings)?;
    let staleness = match older_than {
        Some(secs) => staleness_window(secs),
        None => settings.tree.claim_staleness(),
    };
    let frontier = FrontierTracker::new(storage, settings.tree.clone());
    let released = frontier.sweep_stale_claims(staleness)?;
    println!("Released {} stale claims", released.len());
    for node_id in released {
        println!("  {}", node_id);
    }
    Ok(())
}

pub fn handle_centroids(settings: &Settings) -> Result<()> {
    let storage = open_storage(settings)?;
    let vectors = Arc::new(StorageVectorStore::new(Arc::clone(&storage)));
    let filled = CentroidBackfill::new(NodeAllocator::new(storage), vectors).fill_missing()?;
    println!("Filled {} centroids", filled);
    Ok(())
}

pub fn show_status(settings: &Settings) -> Result<()> {
    let storage = open_storage(settings)?;
    let stats = TreeNavigator::new(storage).stats()?;

    let Some(root_id) = stats.root_id else {
        println!("No tree yet; run `cluster-tree init`");
        return Ok(());
    };
    println!(
        "Corpus {} (root {})",
        stats.corpus.as_deref().unwrap_or("?"),
        root_id
    );
    println!("  Items:      {}", stats.item_count);
    println!("  Nodes:      {}", stats.node_count);
    println!("  Expanded:   {}", stats.expanded_count);
    println!("  Leaves:     {}", stats.leaf_count);
    println!("  Expandable: {}", stats.expandable_count);
    println!("  Claimed:    {}", stats.claimed_count);
    println!("  Labeled:    {}", stats.labeled_count);
    println!("  Max depth:  {}", stats.max_depth);
    for (depth, count) in &stats.nodes_per_depth {
        println!("    depth {}: {} nodes", depth, count);
    }
    println!(
        "  State:      {}",
        if stats.complete { "complete" } else { "in progress" }
    );
    Ok(())
}

fn print_node(node: &ClusterNode) {
    println!("Node {}", node.node_id);
    match node.parent_id {
        Some(parent) => println!("  Parent:   {}", parent),
        None => println!("  Parent:   (root)"),
    }
    println!("  Depth:    {}", node.depth);
    println!("  Status:   {}", node.status);
    println!("  Members:  {}", node.member_count);
    if node.child_count > 0 {
        println!("  Children: {}", node.child_count);
    }
    if let Some(label) = &node.label {
        println!("  Label:    {}", label);
    }
    if let Some(centroid) = &node.centroid {
        println!("  Centroid: {} dims", centroid.len());
    }
    if !node.sample_item_ids.is_empty() {
        println!("  Sample:   {:?}", node.sample_item_ids);
    }
    println!("  Created:  {}", node.created_at.to_rfc3339());
}

pub fn show_node(settings: &Settings, node_id: u64) -> Result<()> {
    let storage = open_storage(settings)?;
    match TreeNavigator::new(storage).get_node(node_id)? {
        Some(node) => print_node(&node),
        None => println!("Node {} not found", node_id),
    }
    Ok(())
}

pub fn show_children(settings: &Settings, node_id: u64) -> Result<()> {
    let storage = open_storage(settings)?;
    let children = TreeNavigator::new(storage).get_children(node_id)?;
    if children.is_empty() {
        println!("Node {} has no children", node_id);
    }
    for child in children {
        println!(
            "{:>10}  {:<10}  {:>8} members  {}",
            child.node_id,
            child.status.to_string(),
            child.member_count,
            child.label.as_deref().unwrap_or("")
        );
    }
    Ok(())
}

pub fn show_members(settings: &Settings, node_id: u64, limit: usize) -> Result<()> {
    let storage = open_storage(settings)?;
    let members = TreeNavigator::new(storage).get_members(node_id, Some(limit))?;
    for item in &members {
        println!("{}", item);
    }
    Ok(())
}

pub fn handle_label(settings: &Settings, node_id: u64, text: Option<String>, clear: bool) -> Result<()> {
    let storage = open_storage(settings)?;
    let label = if clear { None } else { text };
    TreeNavigator::new(storage).set_label(node_id, label.clone())?;
    match label {
        Some(label) => println!("Labeled node {}: {}", node_id, label),
        None => println!("Cleared label of node {}", node_id),
    }
    Ok(())
}

pub fn handle_config(settings: &Settings, command: ConfigCommands) -> Result<()> {
    match command {
        ConfigCommands::Show => {
            let rendered =
                toml::to_string_pretty(settings).context("Failed to render configuration")?;
            print!("{}", rendered);
        }
    }
    Ok(())
}

pub fn handle_admin(settings: &Settings, command: AdminCommands) -> Result<()> {
    let storage = open_storage(settings)?;
    match command {
        AdminCommands::Stats => {
            let stats = storage.get_stats()?;
            println!("Database Statistics:");
            println!("  Nodes:       {}", stats.node_count);
            println!("  Frontier:    {}", stats.frontier_count);
            println!("  Assignments: {}", stats.assignment_count);
            println!("  Expansions:  {}", stats.expansion_count);
            println!("  Vectors:     {}", stats.vector_count);
            println!("  Disk usage:  {} bytes", stats.disk_usage_bytes);
        }
        AdminCommands::Compact => {
            storage.flush()?;
            storage.compact()?;
            println!("Compaction complete");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_settings(temp_dir: &TempDir) -> Settings {
        Settings {
            db_path: temp_dir.path().join("db").to_string_lossy().to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_init_without_vectors_fails() {
        let temp_dir = TempDir::new().unwrap();
        let settings = test_settings(&temp_dir);
        let err = handle_init(&settings, None).unwrap_err();
        assert!(err.to_string().contains("no vectorized items"));
    }

    #[test]
    fn test_init_validate_status() {
        let temp_dir = TempDir::new().unwrap();
        let settings = test_settings(&temp_dir);
        {
            let storage = open_storage(&settings).unwrap();
            for item in 1..=3u64 {
                storage.put_vector(item, &[item as f32, 0.0]).unwrap();
            }
        }

        handle_init(&settings, Some("testwiki")).unwrap();
        handle_validate(&settings, false).unwrap();
        show_status(&settings).unwrap();
        handle_config(&settings, ConfigCommands::Show).unwrap();
    }

    #[test]
    fn test_label_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let settings = test_settings(&temp_dir);
        {
            let storage = open_storage(&settings).unwrap();
            storage.put_vector(1, &[1.0]).unwrap();
        }
        handle_init(&settings, None).unwrap();

        handle_label(&settings, 1, Some("All".to_string()), false).unwrap();
        let storage = open_storage(&settings).unwrap();
        assert_eq!(
            storage.get_node(1).unwrap().unwrap().label.as_deref(),
            Some("All")
        );
    }

    #[tokio::test]
    async fn test_build_all_completes_tree() {
        let temp_dir = TempDir::new().unwrap();
        let mut settings = test_settings(&temp_dir);
        settings.tree.leaf_threshold = 3;
        settings.tree.branching_factor = 2;
        {
            let storage = open_storage(&settings).unwrap();
            for item in 1..=8u64 {
                let base = if item <= 4 { 0.0 } else { 50.0 };
                storage.put_vector(item, &[base + item as f32, base]).unwrap();
            }
        }

        handle_init(&settings, None).unwrap();
        handle_build(&settings, None, true).await.unwrap();
        handle_validate(&settings, false).unwrap();

        let storage = open_storage(&settings).unwrap();
        let stats = TreeNavigator::new(storage).stats().unwrap();
        assert!(stats.complete);
        assert!(stats.leaf_count >= 2);
    }

    #[test]
    fn test_load_settings_overrides() {
        let settings = load_settings(None, Some("/tmp/override"), Some("debug")).unwrap();
        assert_eq!(settings.db_path, "/tmp/override");
        assert_eq!(settings.log_level, "debug");
    }
}
