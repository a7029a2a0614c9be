//! Configuration management for replisearch
//!
//! Handles loading, saving, and validating configuration from TOML files.

mod defaults;

pub use defaults::*;

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Relational store configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Catalog file (relative paths resolve against the config directory)
    #[serde(default = "default_catalog_path")]
    pub catalog_path: String,

    /// Search index client configuration
    #[serde(default)]
    pub index: IndexConfig,

    /// Full resync configuration
    #[serde(default)]
    pub sync: SyncConfig,

    /// Change queue / incremental consumer configuration
    #[serde(default)]
    pub queue: QueueConfig,

    /// Unified query router configuration
    #[serde(default)]
    pub router: RouterConfig,

    /// Automatic secondary indexing configuration
    #[serde(default)]
    pub indexing: IndexingConfig,

    /// Paths configuration (internal, not user-editable)
    #[serde(skip)]
    pub paths: PathsConfig,
}

/// Relational store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// sqlx connection URL of the main database
    #[serde(default = "default_database_url")]
    pub url: String,

    /// Additional databases attached under a schema name
    #[serde(default)]
    pub attach: BTreeMap<String, String>,
}

/// Whether the search index is used at all
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexMode {
    /// Never call the index; searches go to the relational engine
    Disabled,
    /// Use the index, trip the breaker on connectivity failures
    Enabled,
    /// Use the index and never disable it, re-probing on every failure
    Forced,
}

impl FromStr for IndexMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "force" | "forced" => Ok(IndexMode::Forced),
            "true" | "1" | "yes" | "on" | "enabled" => Ok(IndexMode::Enabled),
            "false" | "0" | "no" | "off" | "disabled" | "" => Ok(IndexMode::Disabled),
            other => Err(Error::Config(format!("Unknown index mode: {}", other))),
        }
    }
}

impl std::fmt::Display for IndexMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IndexMode::Disabled => write!(f, "disabled"),
            IndexMode::Enabled => write!(f, "enabled"),
            IndexMode::Forced => write!(f, "forced"),
        }
    }
}

/// Search index client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Base URL of the index REST API
    #[serde(default = "default_index_url")]
    pub url: String,

    #[serde(default = "default_index_mode")]
    pub mode: IndexMode,

    /// Re-enable a tripped client once the cooldown has elapsed
    #[serde(default = "default_index_auto_reconnect")]
    pub auto_reconnect: bool,

    #[serde(default = "default_index_retry_delay_ms")]
    pub retry_delay_ms: u64,

    #[serde(default = "default_index_health_timeout_ms")]
    pub health_timeout_ms: u64,

    #[serde(default = "default_index_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Index name used when a catalog entry does not set one
    #[serde(default = "default_index_name")]
    pub default_index: String,

    #[serde(default = "default_index_cache_ttl_ms")]
    pub cache_ttl_ms: u64,

    #[serde(default = "default_index_cache_capacity")]
    pub cache_capacity: usize,
}

impl IndexConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_millis(self.health_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }
}

/// Full resync configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Overrides every catalog batch size when set
    #[serde(default = "default_sync_batch_size_override")]
    pub batch_size_override: Option<usize>,

    /// Batch size when the catalog entry has none
    #[serde(default = "default_sync_batch_size")]
    pub default_batch_size: usize,
}

impl SyncConfig {
    /// Resolve the page size for a table: override, then catalog, then default
    pub fn resolve_batch_size(&self, catalog_batch: Option<usize>) -> usize {
        self.batch_size_override
            .or(catalog_batch.filter(|size| *size > 0))
            .unwrap_or(self.default_batch_size)
    }
}

/// Change queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Schema (attached database) that owns the queue table
    #[serde(default = "default_queue_schema")]
    pub schema: String,

    #[serde(default = "default_queue_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_queue_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl QueueConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Unified query router configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Delay before the secondary engine is started alongside the primary
    #[serde(default = "default_router_race_delay_ms")]
    pub race_delay_ms: u64,

    #[serde(default = "default_router_prefer_index_engine")]
    pub prefer_index_engine: bool,

    #[serde(default = "default_router_default_limit")]
    pub default_limit: usize,

    #[serde(default = "default_router_max_limit")]
    pub max_limit: usize,
}

impl RouterConfig {
    pub fn race_delay(&self) -> Duration {
        Duration::from_millis(self.race_delay_ms)
    }
}

/// Automatic secondary indexing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexingConfig {
    /// Tables (bare or schema-qualified) never indexed, on top of the built-in list
    #[serde(default)]
    pub exclusions: Vec<String>,

    /// Tables indexed even though they are not in the catalog
    #[serde(default)]
    pub extra_tables: Vec<String>,

    #[serde(default = "default_indexing_max_prefix_length")]
    pub max_prefix_length: u32,
}

/// Internal paths configuration
#[derive(Debug, Clone, Default)]
pub struct PathsConfig {
    /// Base directory for replisearch data
    pub base_dir: PathBuf,

    /// Path to config file
    pub config_file: PathBuf,

    /// Resolved catalog file
    pub catalog_file: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            catalog_path: default_catalog_path(),
            index: IndexConfig::default(),
            sync: SyncConfig::default(),
            queue: QueueConfig::default(),
            router: RouterConfig::default(),
            indexing: IndexingConfig::default(),
            paths: PathsConfig::default(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            attach: BTreeMap::new(),
        }
    }
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            url: default_index_url(),
            mode: default_index_mode(),
            auto_reconnect: default_index_auto_reconnect(),
            retry_delay_ms: default_index_retry_delay_ms(),
            health_timeout_ms: default_index_health_timeout_ms(),
            request_timeout_ms: default_index_request_timeout_ms(),
            default_index: default_index_name(),
            cache_ttl_ms: default_index_cache_ttl_ms(),
            cache_capacity: default_index_cache_capacity(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size_override: default_sync_batch_size_override(),
            default_batch_size: default_sync_batch_size(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            schema: default_queue_schema(),
            batch_size: default_queue_batch_size(),
            poll_interval_ms: default_queue_poll_interval_ms(),
        }
    }
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            race_delay_ms: default_router_race_delay_ms(),
            prefer_index_engine: default_router_prefer_index_engine(),
            default_limit: default_router_default_limit(),
            max_limit: default_router_max_limit(),
        }
    }
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            exclusions: Vec::new(),
            extra_tables: Vec::new(),
            max_prefix_length: default_indexing_max_prefix_length(),
        }
    }
}

impl Config {
    /// Get the default base directory for replisearch (~/.replisearch)
    pub fn default_base_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".replisearch")
    }

    /// Get the default config file path
    pub fn default_config_path() -> PathBuf {
        Self::default_base_dir().join("config.toml")
    }

    fn resolve_paths(&mut self, config_file: &Path) {
        let base = config_file.parent().unwrap_or(Path::new(".")).to_path_buf();
        let catalog = PathBuf::from(&self.catalog_path);
        let catalog_file = if catalog.is_absolute() {
            catalog
        } else {
            base.join(catalog)
        };
        self.paths = PathsConfig {
            config_file: config_file.to_path_buf(),
            catalog_file,
            base_dir: base,
        };
    }

    /// Load configuration from a specific file path
    pub fn load(config_path: &Path) -> Result<Self> {
        debug!("Loading config from {:?}", config_path);

        if !config_path.exists() {
            return Err(Error::Config(format!(
                "Config file not found: {}",
                config_path.display()
            )));
        }

        let content = std::fs::read_to_string(config_path)?;
        let mut config: Config = toml::from_str(&content)?;
        config.resolve_paths(config_path);

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a base directory, falling back to defaults
    pub fn load_from(base_dir: Option<PathBuf>) -> Result<Self> {
        let base = base_dir.unwrap_or_else(Self::default_base_dir);
        let config_file = base.join("config.toml");

        let mut config = if config_file.exists() {
            debug!("Loading config from {:?}", config_file);
            let content = std::fs::read_to_string(&config_file)?;
            toml::from_str::<Config>(&content)?
        } else {
            debug!("No config file found, using defaults");
            Config::default()
        };
        config.resolve_paths(&config_file);

        Ok(config)
    }

    /// Fresh default configuration rooted at `base_dir`
    pub fn init(base_dir: &Path) -> Self {
        let mut config = Config::default();
        config.resolve_paths(&base_dir.join("config.toml"));
        config
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.paths.config_file.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(&self.paths.config_file, content)?;
        info!("Saved config to {:?}", self.paths.config_file);
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.sync.default_batch_size == 0 || self.sync.batch_size_override == Some(0) {
            return Err(Error::Config("sync batch sizes must be positive".to_string()));
        }

        if self.queue.batch_size == 0 {
            return Err(Error::Config("queue.batch_size must be positive".to_string()));
        }

        if self.queue.poll_interval_ms == 0 {
            return Err(Error::Config(
                "queue.poll_interval_ms must be positive".to_string(),
            ));
        }

        if self.router.default_limit == 0 || self.router.default_limit > self.router.max_limit {
            return Err(Error::Config(
                "router.default_limit must be between 1 and router.max_limit".to_string(),
            ));
        }

        if self.index.mode != IndexMode::Disabled {
            url::Url::parse(&self.index.url)
                .map_err(|e| Error::Config(format!("Invalid index URL: {}", e)))?;
        }

        if self.indexing.max_prefix_length == 0 {
            return Err(Error::Config(
                "indexing.max_prefix_length must be positive".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.router.race_delay_ms, 75);
        assert_eq!(config.index.health_timeout_ms, 5_000);
        assert_eq!(config.index.retry_delay_ms, 15_000);
        assert_eq!(config.index.default_index, "global_search");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_save_load() {
        let tmp = TempDir::new().unwrap();
        let mut config = Config::init(tmp.path());
        config.index.default_index = "people_search".to_string();
        config.router.race_delay_ms = 120;

        config.save().unwrap();
        assert!(config.paths.config_file.exists());

        let loaded = Config::load(&tmp.path().join("config.toml")).unwrap();
        assert_eq!(loaded.index.default_index, "people_search");
        assert_eq!(loaded.router.race_delay_ms, 120);
        assert_eq!(loaded.paths.catalog_file, tmp.path().join("catalog.toml"));
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(&path, "[router]\nprefer_index_engine = false\n").unwrap();

        let loaded = Config::load(&path).unwrap();
        assert!(!loaded.router.prefer_index_engine);
        assert_eq!(loaded.router.default_limit, 20);
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();

        config.queue.batch_size = 0;
        assert!(config.validate().is_err());
        config.queue.batch_size = 50;
        assert!(config.validate().is_ok());

        config.router.default_limit = config.router.max_limit + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_index_mode_parsing() {
        assert_eq!("TRUE".parse::<IndexMode>().unwrap(), IndexMode::Enabled);
        assert_eq!("1".parse::<IndexMode>().unwrap(), IndexMode::Enabled);
        assert_eq!("FORCE".parse::<IndexMode>().unwrap(), IndexMode::Forced);
        assert_eq!("false".parse::<IndexMode>().unwrap(), IndexMode::Disabled);
        assert!("sometimes".parse::<IndexMode>().is_err());
    }

    #[test]
    fn test_batch_size_resolution() {
        let mut sync = SyncConfig {
            batch_size_override: None,
            default_batch_size: 500,
        };
        assert_eq!(sync.resolve_batch_size(Some(200)), 200);
        assert_eq!(sync.resolve_batch_size(None), 500);
        assert_eq!(sync.resolve_batch_size(Some(0)), 500);

        sync.batch_size_override = Some(50);
        assert_eq!(sync.resolve_batch_size(Some(200)), 50);
    }
}
