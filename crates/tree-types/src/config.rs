//! Configuration loading for the cluster tree.
//!
//! Layered config: defaults -> config file -> env vars -> CLI flags.
//! The default config file lives at `~/.config/cluster-tree/config.toml`.

use config::{Config, Environment, File};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::TypesError;

/// K-means settings for the partition primitive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KMeansConfig {
    /// Lloyd iterations per fit
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,

    /// Stop once no centroid moves farther than this
    #[serde(default = "default_tolerance")]
    pub tolerance: f32,

    /// Fit centroids on at most this many members, then assign everyone
    #[serde(default = "default_fit_sample_size")]
    pub fit_sample_size: usize,

    /// Abort a fit that runs longer than this many seconds
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

fn default_max_iterations() -> usize {
    50
}

fn default_tolerance() -> f32 {
    1e-4
}

fn default_fit_sample_size() -> usize {
    10_000
}

impl Default for KMeansConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            tolerance: default_tolerance(),
            fit_sample_size: default_fit_sample_size(),
            timeout_secs: None,
        }
    }
}

/// Tree construction parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeConfig {
    /// Nodes with at most this many members become leaves (inclusive)
    #[serde(default = "default_leaf_threshold")]
    pub leaf_threshold: u64,

    /// Maximum number of children per split
    #[serde(default = "default_branching_factor")]
    pub branching_factor: usize,

    /// Nodes at this depth become leaves regardless of size
    #[serde(default = "default_max_depth")]
    pub max_depth: u32,

    /// Default number of frontier nodes processed per invocation
    #[serde(default = "default_batch_limit")]
    pub batch_limit: usize,

    /// Base seed; each node mixes in its own id
    #[serde(default = "default_seed")]
    pub seed: u64,

    /// Claims older than this are revocable by a sweep
    #[serde(default = "default_claim_staleness_secs")]
    pub claim_staleness_secs: u64,

    /// Splits with a lower sampled silhouette become leaves instead
    #[serde(default)]
    pub min_silhouette: Option<f32>,

    /// Points sampled when scoring a split
    #[serde(default = "default_silhouette_sample_size")]
    pub silhouette_sample_size: usize,

    #[serde(default)]
    pub kmeans: KMeansConfig,
}

fn default_leaf_threshold() -> u64 {
    50
}

fn default_branching_factor() -> usize {
    50
}

fn default_max_depth() -> u32 {
    10
}

fn default_batch_limit() -> usize {
    100
}

fn default_seed() -> u64 {
    42
}

/// Largest staleness window chrono can represent in whole seconds.
pub const MAX_CLAIM_STALENESS_SECS: u64 = (i64::MAX / 1000) as u64;

/// Staleness window for `secs`, saturating at the largest representable span.
pub fn staleness_window(secs: u64) -> chrono::Duration {
    i64::try_from(secs)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .unwrap_or(chrono::Duration::MAX)
}

fn default_claim_staleness_secs() -> u64 {
    3600
}

fn default_silhouette_sample_size() -> usize {
    2000
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            leaf_threshold: default_leaf_threshold(),
            branching_factor: default_branching_factor(),
            max_depth: default_max_depth(),
            batch_limit: default_batch_limit(),
            seed: default_seed(),
            claim_staleness_secs: default_claim_staleness_secs(),
            min_silhouette: None,
            silhouette_sample_size: default_silhouette_sample_size(),
            kmeans: KMeansConfig::default(),
        }
    }
}

impl TreeConfig {
    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.leaf_threshold == 0 {
            return Err("leaf_threshold must be > 0".to_string());
        }
        if self.branching_factor < 2 {
            return Err(format!(
                "branching_factor must be >= 2, got {}",
                self.branching_factor
            ));
        }
        if let Some(min) = self.min_silhouette {
            if !(-1.0..=1.0).contains(&min) {
                return Err(format!("min_silhouette must be -1.0..=1.0, got {}", min));
            }
        }
        if self.claim_staleness_secs > MAX_CLAIM_STALENESS_SECS {
            return Err(format!(
                "claim_staleness_secs must be <= {}, got {}",
                MAX_CLAIM_STALENESS_SECS, self.claim_staleness_secs
            ));
        }
        if self.kmeans.max_iterations == 0 {
            return Err("kmeans.max_iterations must be > 0".to_string());
        }
        if self.kmeans.fit_sample_size == 0 {
            return Err("kmeans.fit_sample_size must be > 0".to_string());
        }
        Ok(())
    }

    /// Target child count for a node of `member_count` items.
    ///
    /// Aims for leaf-sized children without exceeding the branching factor.
    pub fn target_k(&self, member_count: u64) -> usize {
        let wanted = member_count.div_ceil(self.leaf_threshold.max(1)) as usize;
        wanted.clamp(2, self.branching_factor.max(2))
    }

    /// Whether a node with this size and depth must be a leaf.
    pub fn is_leaf_sized(&self, member_count: u64, depth: u32) -> bool {
        member_count <= self.leaf_threshold || depth >= self.max_depth
    }

    pub fn claim_staleness(&self) -> chrono::Duration {
        staleness_window(self.claim_staleness_secs)
    }
}

/// Main application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Path to RocksDB storage directory
    #[serde(default = "default_db_path")]
    pub db_path: String,

    /// Corpus name (e.g. a wiki namespace); recorded in the store
    #[serde(default = "default_corpus")]
    pub corpus: String,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Tree construction parameters
    #[serde(default)]
    pub tree: TreeConfig,
}

fn default_db_path() -> String {
    ProjectDirs::from("", "", "cluster-tree")
        .map(|p| p.data_local_dir().join("db"))
        .unwrap_or_else(|| PathBuf::from("./data"))
        .to_string_lossy()
        .to_string()
}

fn default_corpus() -> String {
    "enwiki".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            corpus: default_corpus(),
            log_level: default_log_level(),
            tree: TreeConfig::default(),
        }
    }
}

impl Settings {
    /// Load settings with layered precedence:
    /// 1. Built-in defaults
    /// 2. Config file (~/.config/cluster-tree/config.toml)
    /// 3. CLI-specified config file (optional)
    /// 4. Environment variables (CLUSTER_TREE__*)
    ///
    /// CLI flags should be applied by the caller after this returns.
    pub fn load(cli_config_path: Option<&str>) -> Result<Self, TypesError> {
        let config_dir = ProjectDirs::from("", "", "cluster-tree")
            .map(|p| p.config_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));

        let default_config_path = config_dir.join("config");

        let mut builder = Config::builder()
            .set_default("db_path", default_db_path())
            .map_err(|e| TypesError::Config(e.to_string()))?
            .set_default("corpus", default_corpus())
            .map_err(|e| TypesError::Config(e.to_string()))?
            .set_default("log_level", default_log_level())
            .map_err(|e| TypesError::Config(e.to_string()))?
            .add_source(File::with_name(&default_config_path.to_string_lossy()).required(false));

        if let Some(path) = cli_config_path {
            builder = builder.add_source(File::with_name(path).required(true));
        }

        // Format: CLUSTER_TREE__DB_PATH, CLUSTER_TREE__TREE__LEAF_THRESHOLD, etc.
        builder = builder.add_source(
            Environment::with_prefix("CLUSTER_TREE")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder
            .build()
            .map_err(|e| TypesError::Config(e.to_string()))?;

        let settings: Settings = config
            .try_deserialize()
            .map_err(|e| TypesError::Config(e.to_string()))?;

        settings.tree.validate().map_err(TypesError::Config)?;
        Ok(settings)
    }

    /// Expand `~` and environment variables in db_path
    pub fn expanded_db_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.db_path).into_owned())
    }
}
