//! TOML configuration.
//!
//! Every section except `[db]` and `[source]` has defaults, so a minimal
//! file only names the database and the ITSM gateway. See
//! `config/itsm-sync.example.toml` for all keys.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use itsm_sync_core::models::Category;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    pub source: SourceConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    /// Seconds between scheduled `run_all` invocations.
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Seconds between hard-delete reconciliation passes.
    #[serde(default = "default_reconcile_interval_secs")]
    pub reconcile_interval_secs: u64,
    /// Age after which a `running` lock is treated as abandoned.
    #[serde(default = "default_lock_timeout_minutes")]
    pub lock_timeout_minutes: i64,
    #[serde(default = "default_categories")]
    pub categories: Vec<String>,
    #[serde(default = "default_embed_batch_size")]
    pub embed_batch_size: usize,
    #[serde(default = "default_reconcile_batch_size")]
    pub reconcile_batch_size: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            reconcile_interval_secs: default_reconcile_interval_secs(),
            lock_timeout_minutes: default_lock_timeout_minutes(),
            categories: default_categories(),
            embed_batch_size: default_embed_batch_size(),
            reconcile_batch_size: default_reconcile_batch_size(),
        }
    }
}

fn default_interval_secs() -> u64 {
    900
}
fn default_reconcile_interval_secs() -> u64 {
    604_800
}
fn default_lock_timeout_minutes() -> i64 {
    60
}
fn default_categories() -> Vec<String> {
    Category::valid_names().into_iter().map(String::from).collect()
}
fn default_embed_batch_size() -> usize {
    32
}
fn default_reconcile_batch_size() -> usize {
    100
}

impl SyncConfig {
    /// Configured categories, parsed. Fails on the first unknown name.
    pub fn parsed_categories(&self) -> Result<Vec<Category>> {
        let mut out = Vec::with_capacity(self.categories.len());
        for name in &self.categories {
            let category: Category = name.parse()?;
            if !out.contains(&category) {
                out.push(category);
            }
        }
        Ok(out)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
        }
    }
}

fn default_max_tokens() -> usize {
    250
}

#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    /// Base URL of the ITSM REST gateway, e.g. `https://itsm.example.com/api/v1`.
    pub base_url: String,
    /// Environment variable holding the bearer token. Unset or empty means
    /// no `Authorization` header.
    #[serde(default = "default_token_env")]
    pub token_env: String,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_token_env() -> String {
    "ITSM_API_TOKEN".to_string()
}
fn default_page_size() -> usize {
    200
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_dims")]
    pub dims: usize,
    /// Provider base URL. Defaults to the public OpenAI API or a local Ollama.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            dims: default_dims(),
            url: None,
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
        }
    }
}

fn default_provider() -> String {
    "ollama".to_string()
}
fn default_model() -> String {
    "nomic-embed-text".to_string()
}
fn default_dims() -> usize {
    768
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7341".to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

/// Parse and validate configuration text.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.chunking.max_tokens == 0 {
        bail!("chunking.max_tokens must be > 0");
    }

    if config.sync.lock_timeout_minutes <= 0 {
        bail!("sync.lock_timeout_minutes must be > 0");
    }
    if config.sync.interval_secs == 0 {
        bail!("sync.interval_secs must be > 0");
    }
    if config.sync.reconcile_interval_secs == 0 {
        bail!("sync.reconcile_interval_secs must be > 0");
    }
    if config.sync.embed_batch_size == 0 {
        bail!("sync.embed_batch_size must be > 0");
    }
    if config.sync.reconcile_batch_size == 0 {
        bail!("sync.reconcile_batch_size must be > 0");
    }
    if config.sync.categories.is_empty() {
        bail!("sync.categories must name at least one category");
    }
    config
        .sync
        .parsed_categories()
        .context("sync.categories is invalid")?;

    if config.source.base_url.trim().is_empty() {
        bail!("source.base_url must not be empty");
    }
    if config.source.page_size == 0 {
        bail!("source.page_size must be > 0");
    }

    match config.embedding.provider.as_str() {
        "openai" | "ollama" => {}
        other => bail!(
            "Unknown embedding provider: '{}'. Must be openai or ollama.",
            other
        ),
    }
    if config.embedding.dims == 0 {
        bail!(
            "embedding.dims must be > 0 when provider is '{}'",
            config.embedding.provider
        );
    }
    if config.embedding.model.trim().is_empty() {
        bail!("embedding.model must not be empty");
    }

    Ok(())
}
