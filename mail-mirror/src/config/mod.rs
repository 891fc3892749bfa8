use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::Duration;
use tracing::info;

use crate::error::{MirrorError, Result};

/// Global configuration instance
static CONFIG: OnceCell<RwLock<MirrorConfig>> = OnceCell::new();

/// 8 GiB, the hard ceiling for a single shard file.
pub const DEFAULT_MAX_SHARD_SIZE: u64 = 8 * 1024 * 1024 * 1024;

/// Upper bound on concurrent per-shard operations in one fan-out
pub const MAX_FANOUT_CONCURRENCY: usize = 10;

/// Upper bound on concurrent remote fetches within one page
pub const MAX_FETCH_CONCURRENCY: usize = 5;

/// Mirror configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MirrorConfig {
    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub fanout: FanoutConfig,

    #[serde(default)]
    pub sync: SyncSettings,
}

/// Where shards live and how large they may grow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root directory for the control database and shard files
    pub data_dir: Option<PathBuf>,

    /// Shards at or over this size stop receiving new threads
    #[serde(default = "default_max_shard_size")]
    pub max_shard_size_bytes: u64,
}

/// Cross-shard fan-out limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FanoutConfig {
    /// Maximum shards touched concurrently by parallel-reduce and race-first
    #[serde(default = "default_fanout_concurrency")]
    pub max_concurrency: usize,
}

/// Remote folder synchronization settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSettings {
    /// Threads requested per remote listing page
    #[serde(default = "default_max_page_count")]
    pub max_page_count: u32,

    /// Follow next-page tokens; when false only the first page is synced
    #[serde(default = "default_true")]
    pub loop_enabled: bool,

    /// Pause between pages, against provider rate limits
    #[serde(default = "default_page_delay_ms")]
    pub page_delay_ms: u64,

    /// How often the coordinator polls a page job
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Poll budget per page before the page is declared timed out
    #[serde(default = "default_poll_max_attempts")]
    pub poll_max_attempts: u32,

    /// Concurrent latest-message fetches within one page
    #[serde(default = "default_fetch_concurrency")]
    pub fetch_concurrency: usize,
}

fn default_max_shard_size() -> u64 {
    DEFAULT_MAX_SHARD_SIZE
}

fn default_fanout_concurrency() -> usize {
    10
}

fn default_max_page_count() -> u32 {
    20
}

fn default_true() -> bool {
    true
}

fn default_page_delay_ms() -> u64 {
    1000
}

fn default_poll_interval_ms() -> u64 {
    5000
}

fn default_poll_max_attempts() -> u32 {
    60
}

fn default_fetch_concurrency() -> usize {
    5
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            max_shard_size_bytes: default_max_shard_size(),
        }
    }
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_fanout_concurrency(),
        }
    }
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            max_page_count: default_max_page_count(),
            loop_enabled: true,
            page_delay_ms: default_page_delay_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            poll_max_attempts: default_poll_max_attempts(),
            fetch_concurrency: default_fetch_concurrency(),
        }
    }
}

impl SyncSettings {
    pub fn page_delay(&self) -> Duration {
        Duration::from_millis(self.page_delay_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl MirrorConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: MirrorConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(1..=MAX_FANOUT_CONCURRENCY).contains(&self.fanout.max_concurrency) {
            return Err(MirrorError::Config(format!(
                "fanout.max_concurrency must be between 1 and {}",
                MAX_FANOUT_CONCURRENCY
            )));
        }
        if !(1..=MAX_FETCH_CONCURRENCY).contains(&self.sync.fetch_concurrency) {
            return Err(MirrorError::Config(format!(
                "sync.fetch_concurrency must be between 1 and {}",
                MAX_FETCH_CONCURRENCY
            )));
        }
        if self.sync.max_page_count == 0 {
            return Err(MirrorError::Config(
                "sync.max_page_count must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Resolved data directory, falling back to the platform data dir
    pub fn data_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.storage.data_dir {
            return Ok(dir.clone());
        }
        dirs::data_local_dir()
            .map(|d| d.join("mail-mirror"))
            .ok_or_else(|| MirrorError::Config("Failed to determine data directory".into()))
    }
}

/// Get default config paths
pub fn default_config_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    if let Some(config_dir) = dirs::config_dir() {
        paths.push(config_dir.join("mail-mirror").join("config.toml"));
    }

    if let Some(home_dir) = dirs::home_dir() {
        paths.push(
            home_dir
                .join(".config")
                .join("mail-mirror")
                .join("config.toml"),
        );
    }

    paths
}

/// Initialize configuration from default paths
pub fn init_config() -> Result<()> {
    info!("Initializing configuration from default paths");

    for path in default_config_paths() {
        if path.exists() {
            info!("Found config at: {:?}", path);
            return init_config_from_path(&path);
        }
    }

    info!("No config file found, using defaults");
    set_config(MirrorConfig::default())
}

/// Initialize configuration from a specific path
pub fn init_config_from_path(path: &Path) -> Result<()> {
    info!("Loading configuration from: {:?}", path);

    let content = fs::read_to_string(path)
        .map_err(|e| MirrorError::Config(format!("Failed to read config: {}", e)))?;

    set_config(MirrorConfig::from_toml_str(&content)?)
}

fn set_config(config: MirrorConfig) -> Result<()> {
    match CONFIG.get() {
        Some(lock) => {
            let mut guard = lock
                .write()
                .map_err(|e| MirrorError::Config(format!("Failed to lock config: {}", e)))?;
            *guard = config;
        }
        None => {
            CONFIG.set(RwLock::new(config)).ok();
        }
    }
    Ok(())
}

/// Snapshot of the global configuration (defaults when never initialized)
pub fn get_config() -> MirrorConfig {
    CONFIG
        .get()
        .and_then(|lock| lock.read().ok().map(|c| c.clone()))
        .unwrap_or_default()
}
