use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub item_properties: ItemPropertiesConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub partial_loading: PartialLoadingConfig,
    #[serde(default)]
    pub credentials: CredentialsConfig,
    /// Raw source definitions, in configuration order.
    #[serde(default)]
    pub data_sources: Vec<Map<String, Value>>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ItemPropertiesConfig {
    #[serde(default = "default_id_key")]
    pub id_key: String,
}

impl Default for ItemPropertiesConfig {
    fn default() -> Self {
        Self {
            id_key: default_id_key(),
        }
    }
}

fn default_id_key() -> String {
    "id".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct OutputConfig {
    #[serde(default = "default_output_dir")]
    pub dir: PathBuf,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: default_output_dir(),
        }
    }
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("annotation_output")
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
    /// Default entry lifetime; `<= 0` means entries never expire.
    #[serde(default = "default_ttl_seconds")]
    pub ttl_seconds: i64,
    #[serde(default = "default_max_size_mb")]
    pub max_size_mb: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cache_dir: default_cache_dir(),
            ttl_seconds: default_ttl_seconds(),
            max_size_mb: default_max_size_mb(),
        }
    }
}

impl CacheConfig {
    pub fn max_size_bytes(&self) -> u64 {
        self.max_size_mb.saturating_mul(1024 * 1024)
    }
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from(".ingest_cache")
}
fn default_ttl_seconds() -> i64 {
    3600
}
fn default_max_size_mb() -> u64 {
    500
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct PartialLoadingConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_initial_count")]
    pub initial_count: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Fraction of loaded items that must be annotated before auto-loading.
    #[serde(default = "default_auto_load_threshold")]
    pub auto_load_threshold: f64,
    #[serde(default = "default_true")]
    pub auto_load_enabled: bool,
}

impl Default for PartialLoadingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            initial_count: default_initial_count(),
            batch_size: default_batch_size(),
            auto_load_threshold: default_auto_load_threshold(),
            auto_load_enabled: true,
        }
    }
}

fn default_initial_count() -> usize {
    1000
}
fn default_batch_size() -> usize {
    500
}
fn default_auto_load_threshold() -> f64 {
    0.8
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct CredentialsConfig {
    /// Optional dotenv-style file consulted after the process environment.
    #[serde(default)]
    pub env_file: Option<PathBuf>,
}

impl Config {
    /// Check value ranges that serde defaults cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.item_properties.id_key.trim().is_empty() {
            anyhow::bail!("item_properties.id_key must not be empty");
        }

        let partial = &self.partial_loading;
        if partial.initial_count == 0 {
            anyhow::bail!("partial_loading.initial_count must be >= 1");
        }
        if partial.batch_size == 0 {
            anyhow::bail!("partial_loading.batch_size must be >= 1");
        }
        if !(0.0..=1.0).contains(&partial.auto_load_threshold) {
            anyhow::bail!("partial_loading.auto_load_threshold must be in [0.0, 1.0]");
        }

        if self.cache.enabled && self.cache.max_size_mb == 0 {
            anyhow::bail!("cache.max_size_mb must be > 0 when the cache is enabled");
        }

        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config = parse_config(&content)?;

    Ok(config)
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    config.validate()?;
    Ok(config)
}
