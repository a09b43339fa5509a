//! TOML configuration.
//!
//! ```toml
//! [db]
//! path = "./data/slink.sqlite"
//!
//! [schema]
//! path = "./schema/mschema.json"
//!
//! [embedding]
//! provider = "openai"            # disabled | openai | ollama | hashing | local
//! model = "text-embedding-3-small"
//! dims = 1536
//! batch_size = 100
//! concurrency = 4
//!
//! [filter]
//! top_k_tables = 20
//! top_k_columns = 20
//! similarity_threshold = 0.6
//! fk_hops = 1
//!
//! [reranker]
//! enabled = true
//! url = "http://localhost:8080"
//! ```
//!
//! Every section except `[db]` and `[schema]` is optional.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use schema_linker_core::filter::{FilterParams, RerankSettings};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub schema: SchemaConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub filter: FilterConfig,
    #[serde(default)]
    pub reranker: RerankerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SchemaConfig {
    /// M-Schema JSON document.
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL for HTTP providers.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Batches embedded in parallel during precompute.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            concurrency: default_concurrency(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    100
}
fn default_concurrency() -> usize {
    4
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct FilterConfig {
    #[serde(default = "default_top_k")]
    pub top_k_tables: usize,
    #[serde(default = "default_top_k")]
    pub top_k_columns: usize,
    #[serde(default = "default_threshold")]
    pub similarity_threshold: f32,
    #[serde(default = "default_fk_hops")]
    pub fk_hops: usize,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            top_k_tables: default_top_k(),
            top_k_columns: default_top_k(),
            similarity_threshold: default_threshold(),
            fk_hops: default_fk_hops(),
        }
    }
}

fn default_top_k() -> usize {
    20
}
fn default_threshold() -> f32 {
    0.6
}
fn default_fk_hops() -> usize {
    1
}

impl FilterConfig {
    pub fn params(&self) -> FilterParams {
        FilterParams {
            top_k_tables: self.top_k_tables,
            top_k_columns_per_table: self.top_k_columns,
            similarity_threshold: self.similarity_threshold,
            fk_hops: self.fk_hops,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RerankerConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_reranker_provider")]
    pub provider: String,
    /// Base URL of a `/rerank` endpoint.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_candidate_pool")]
    pub candidate_pool: usize,
    #[serde(default = "default_rerank_top_k")]
    pub top_k_tables: usize,
    #[serde(default = "default_rerank_top_k")]
    pub top_k_columns: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Secondary `/rerank` endpoint consulted when the primary is unsure.
    #[serde(default)]
    pub fallback_url: Option<String>,
    #[serde(default = "default_fallback_threshold")]
    pub fallback_threshold: f32,
}

impl Default for RerankerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            provider: default_reranker_provider(),
            url: None,
            model: None,
            candidate_pool: default_candidate_pool(),
            top_k_tables: default_rerank_top_k(),
            top_k_columns: default_rerank_top_k(),
            timeout_secs: default_timeout_secs(),
            fallback_url: None,
            fallback_threshold: default_fallback_threshold(),
        }
    }
}

fn default_reranker_provider() -> String {
    "http".to_string()
}
fn default_candidate_pool() -> usize {
    20
}
fn default_rerank_top_k() -> usize {
    10
}
fn default_fallback_threshold() -> f32 {
    0.7
}

impl RerankerConfig {
    pub fn settings(&self) -> RerankSettings {
        RerankSettings {
            candidate_pool: self.candidate_pool,
            top_k_tables: self.top_k_tables,
            top_k_columns: self.top_k_columns,
        }
    }
}

/// Read, parse and validate a config file.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config = parse_config(&content)?;
    Ok(config)
}

/// Parse and validate config text.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    config
        .filter
        .params()
        .validate()
        .context("invalid [filter] section")?;

    let embedding = &config.embedding;
    match embedding.provider.as_str() {
        "disabled" | "hashing" | "local" => {}
        "openai" | "ollama" => {
            if embedding.model.is_none() {
                bail!(
                    "embedding.model must be specified when provider is '{}'",
                    embedding.provider
                );
            }
            if embedding.dims.is_none() {
                bail!(
                    "embedding.dims must be specified when provider is '{}'",
                    embedding.provider
                );
            }
        }
        other => bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, ollama, hashing, or local.",
            other
        ),
    }
    if embedding.dims == Some(0) {
        bail!("embedding.dims must be > 0");
    }
    if embedding.batch_size == 0 {
        bail!("embedding.batch_size must be > 0");
    }
    if embedding.concurrency == 0 {
        bail!("embedding.concurrency must be > 0");
    }

    let reranker = &config.reranker;
    if reranker.enabled {
        if reranker.provider != "http" {
            bail!(
                "Unknown reranker provider: '{}'. Must be http.",
                reranker.provider
            );
        }
        if reranker.url.is_none() {
            bail!("reranker.url must be specified when the reranker is enabled");
        }
        if reranker.candidate_pool == 0 || reranker.top_k_tables == 0 || reranker.top_k_columns == 0 {
            bail!("reranker.candidate_pool, top_k_tables and top_k_columns must be > 0");
        }
        if !(0.0..=1.0).contains(&reranker.fallback_threshold) {
            bail!("reranker.fallback_threshold must be in [0.0, 1.0]");
        }
    }

    Ok(())
}
