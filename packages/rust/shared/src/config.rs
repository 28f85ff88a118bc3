//! Application configuration for DocGraph.
//!
//! User config lives at `~/.docgraph/docgraph.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{DocGraphError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "docgraph.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".docgraph";

// ---------------------------------------------------------------------------
// Config structs (matching docgraph.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Model bridge settings.
    #[serde(default)]
    pub bridge: BridgeConfig,

    #[serde(default)]
    pub clustering: ClusteringConfig,

    #[serde(default)]
    pub claims: ClaimsConfig,

    /// Outbound call tracking.
    #[serde(default)]
    pub tracker: TrackerConfig,
}

/// `[database]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path of the libSQL database file.
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> String {
    "var/docgraph.db".into()
}

/// `[bridge]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Command that runs the bridge (e.g. `bun`).
    #[serde(default = "default_bridge_cmd")]
    pub command: String,

    /// Bridge script path, relative to `working_dir`.
    #[serde(default = "default_bridge_script")]
    pub script: String,

    /// Working directory for the bridge subprocess. Empty means the current directory.
    #[serde(default)]
    pub working_dir: String,

    /// Model used for embeddings.
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,

    /// Model used for resolution decisions.
    #[serde(default = "default_decision_model")]
    pub decision_model: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            command: default_bridge_cmd(),
            script: default_bridge_script(),
            working_dir: String::new(),
            embedding_model: default_embedding_model(),
            decision_model: default_decision_model(),
        }
    }
}

fn default_bridge_cmd() -> String {
    "bun".into()
}
fn default_bridge_script() -> String {
    "packages/ts/model-bridge/src/bridge.ts".into()
}
fn default_embedding_model() -> String {
    "openai/text-embedding-3-small".into()
}
fn default_decision_model() -> String {
    "moonshotai/kimi-k2.5".into()
}

/// `[clustering]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusteringConfig {
    /// Maximum cosine distance between neighbours.
    #[serde(default = "default_eps")]
    pub eps: f32,

    /// Minimum neighbourhood size for a core point.
    #[serde(default = "default_min_samples")]
    pub min_samples: usize,

    /// Persisted candidates offered to the decision call per cluster.
    #[serde(default = "default_similar_limit")]
    pub similar_existing_limit: usize,

    /// Candidates further than this are not offered.
    #[serde(default = "default_similar_distance")]
    pub similar_existing_max_distance: f32,
}

impl Default for ClusteringConfig {
    fn default() -> Self {
        Self {
            eps: default_eps(),
            min_samples: default_min_samples(),
            similar_existing_limit: default_similar_limit(),
            similar_existing_max_distance: default_similar_distance(),
        }
    }
}

fn default_eps() -> f32 {
    0.25
}
fn default_min_samples() -> usize {
    1
}
fn default_similar_limit() -> usize {
    5
}
fn default_similar_distance() -> f32 {
    0.35
}

/// `[claims]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimsConfig {
    /// Statements closer than this are duplicates.
    #[serde(default = "default_duplicate_threshold")]
    pub duplicate_threshold: f32,

    /// Statements closer than this talk about the same thing and may conflict.
    #[serde(default = "default_conflict_threshold")]
    pub conflict_threshold: f32,

    /// Claim-type pairs that contradict each other.
    #[serde(default = "default_opposing_types")]
    pub opposing_types: Vec<(String, String)>,
}

impl Default for ClaimsConfig {
    fn default() -> Self {
        Self {
            duplicate_threshold: default_duplicate_threshold(),
            conflict_threshold: default_conflict_threshold(),
            opposing_types: default_opposing_types(),
        }
    }
}

fn default_duplicate_threshold() -> f32 {
    0.15
}
fn default_conflict_threshold() -> f32 {
    0.35
}
fn default_opposing_types() -> Vec<(String, String)> {
    vec![
        ("capability".into(), "limitation".into()),
        ("supports".into(), "does_not_support".into()),
        ("recommendation".into(), "warning".into()),
    ]
}

/// `[tracker]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerConfig {
    /// Sliding window length for rate queries.
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,

    /// Upper bound on records kept in the window.
    #[serde(default = "default_max_window_records")]
    pub max_window_records: usize,

    /// Call rate above which the provider is assumed to throttle.
    #[serde(default = "default_throttle_rate")]
    pub throttle_calls_per_minute: f64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            window_secs: default_window_secs(),
            max_window_records: default_max_window_records(),
            throttle_calls_per_minute: default_throttle_rate(),
        }
    }
}

fn default_window_secs() -> u64 {
    60
}
fn default_max_window_records() -> usize {
    10_000
}
fn default_throttle_rate() -> f64 {
    500.0
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.docgraph/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| DocGraphError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.docgraph/docgraph.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| DocGraphError::io(path, e))?;

    let config: AppConfig = toml::from_str(&content).map_err(|e| {
        DocGraphError::config(format!("failed to parse {}: {e}", path.display()))
    })?;
    config.validate()?;
    Ok(config)
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| DocGraphError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| DocGraphError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| DocGraphError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

impl AppConfig {
    /// Reject values the engine cannot work with.
    pub fn validate(&self) -> Result<()> {
        if !(self.clustering.eps > 0.0 && self.clustering.eps <= 2.0) {
            return Err(DocGraphError::config(format!(
                "clustering.eps must be in (0, 2], got {}",
                self.clustering.eps
            )));
        }
        if self.clustering.min_samples == 0 {
            return Err(DocGraphError::config("clustering.min_samples must be >= 1"));
        }
        if self.claims.duplicate_threshold < 0.0 || self.claims.conflict_threshold < 0.0 {
            return Err(DocGraphError::config("claim thresholds must be non-negative"));
        }
        if self.tracker.window_secs == 0 {
            return Err(DocGraphError::config("tracker.window_secs must be >= 1"));
        }
        Ok(())
    }
}
