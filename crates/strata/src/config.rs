//! Configuration parsing and validation.
//!
//! Strata is configured via a TOML file (default: `config/strata.toml`).
//! Every section except `[db]` is optional and falls back to the defaults
//! below.
//!
//! # Example
//!
//! ```toml
//! [db]
//! path = "./data/strata.sqlite"
//!
//! [chunking]
//! target_tokens = 512
//! overlap_fraction = 0.15
//!
//! [retrieval]
//! candidate_k = 50
//! final_limit = 10
//!
//! [retrieval.strategy.exact]
//! lexical = 0.7
//! vector = 0.2
//! graph = 0.1
//!
//! [embedding]
//! provider = "ollama"
//! model = "nomic-embed-text"
//! dims = 768
//!
//! [extraction]
//! provider = "heuristic"
//!
//! [policy]
//! allowed_roots = ["~/notes", "~/src"]
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use strata_core::chunk::ChunkerConfig;
use strata_core::classify::{QueryClass, StrategyTable, StrategyWeights};
use strata_core::search::SearchConfig;

/// Top-level configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub extraction: ExtractionConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_target_tokens")]
    pub target_tokens: usize,
    #[serde(default = "default_overlap_fraction")]
    pub overlap_fraction: f64,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            target_tokens: default_target_tokens(),
            overlap_fraction: default_overlap_fraction(),
        }
    }
}

fn default_target_tokens() -> usize {
    512
}
fn default_overlap_fraction() -> f64 {
    0.15
}

impl ChunkingConfig {
    pub fn chunker_config(&self) -> ChunkerConfig {
        ChunkerConfig {
            target_tokens: self.target_tokens,
            overlap_fraction: self.overlap_fraction as f32,
        }
    }
}

/// One row of the strategy table as written in TOML.
#[derive(Debug, Deserialize, Clone, Copy)]
pub struct WeightsConfig {
    #[serde(default)]
    pub lexical: f64,
    #[serde(default)]
    pub vector: f64,
    #[serde(default)]
    pub graph: f64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_candidate_k")]
    pub candidate_k: usize,
    #[serde(default = "default_rank_constant")]
    pub rank_constant: f64,
    #[serde(default = "default_final_limit")]
    pub final_limit: usize,
    #[serde(default = "default_mmr_lambda")]
    pub mmr_lambda: f64,
    #[serde(default = "default_mmr_candidates")]
    pub mmr_candidates: usize,
    #[serde(default = "default_store_timeout_ms")]
    pub store_timeout_ms: u64,
    #[serde(default = "default_true")]
    pub rerank: bool,
    #[serde(default = "default_rerank_top")]
    pub rerank_top: usize,
    #[serde(default = "default_rerank_timeout_ms")]
    pub rerank_timeout_ms: u64,
    #[serde(default = "default_latency_budget_ms")]
    pub latency_budget_ms: u64,
    /// Per-class weight overrides keyed by class name (`exact`, `entity`, ...).
    #[serde(default)]
    pub strategy: HashMap<String, WeightsConfig>,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            candidate_k: default_candidate_k(),
            rank_constant: default_rank_constant(),
            final_limit: default_final_limit(),
            mmr_lambda: default_mmr_lambda(),
            mmr_candidates: default_mmr_candidates(),
            store_timeout_ms: default_store_timeout_ms(),
            rerank: true,
            rerank_top: default_rerank_top(),
            rerank_timeout_ms: default_rerank_timeout_ms(),
            latency_budget_ms: default_latency_budget_ms(),
            strategy: HashMap::new(),
        }
    }
}

fn default_candidate_k() -> usize {
    50
}
fn default_rank_constant() -> f64 {
    60.0
}
fn default_final_limit() -> usize {
    10
}
fn default_mmr_lambda() -> f64 {
    0.7
}
fn default_mmr_candidates() -> usize {
    30
}
fn default_store_timeout_ms() -> u64 {
    1500
}
fn default_true() -> bool {
    true
}
fn default_rerank_top() -> usize {
    10
}
fn default_rerank_timeout_ms() -> u64 {
    800
}
fn default_latency_budget_ms() -> u64 {
    2500
}

impl RetrievalConfig {
    pub fn search_config(&self) -> SearchConfig {
        SearchConfig {
            candidate_k: self.candidate_k,
            rank_constant: self.rank_constant,
            final_limit: self.final_limit,
            mmr_lambda: self.mmr_lambda,
            mmr_candidates: self.mmr_candidates,
            store_timeout: Duration::from_millis(self.store_timeout_ms),
            rerank: self.rerank,
            rerank_top: self.rerank_top,
            rerank_timeout: Duration::from_millis(self.rerank_timeout_ms),
            latency_budget: Duration::from_millis(self.latency_budget_ms),
        }
    }

    /// The default strategy table with configured rows swapped in. Assumes
    /// [`load_config`] already validated the rows.
    pub fn strategy_table(&self) -> Result<StrategyTable> {
        let mut table = StrategyTable::default();
        for (name, w) in &self.strategy {
            let class: QueryClass = name
                .parse()
                .with_context(|| format!("retrieval.strategy.{}", name))?;
            table = table.with_override(class, StrategyWeights::new(w.lexical, w.vector, w.graph));
        }
        Ok(table)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Base URL for the `ollama` provider.
    #[serde(default)]
    pub url: Option<String>,
    /// Seconds a failed provider is left alone before it is probed again.
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
            url: None,
            cooldown_secs: default_cooldown_secs(),
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_cooldown_secs() -> u64 {
    30
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExtractionConfig {
    #[serde(default = "default_extraction_provider")]
    pub provider: String,
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f32,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            provider: default_extraction_provider(),
            min_confidence: default_min_confidence(),
        }
    }
}

fn default_extraction_provider() -> String {
    "heuristic".to_string()
}
fn default_min_confidence() -> f32 {
    0.3
}

impl ExtractionConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
        }
    }
}

fn default_workers() -> usize {
    strata_core::sync::DEFAULT_WORKERS
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct PolicyConfig {
    /// Roots under which sources may be registered. Empty allows any
    /// readable path. A leading `~/` is expanded to the home directory.
    #[serde(default)]
    pub allowed_roots: Vec<PathBuf>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_filter")]
    pub filter: String,
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
            format: default_log_format(),
        }
    }
}

fn default_log_filter() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "pretty".to_string()
}

/// Parse and validate a configuration from TOML text.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

fn validate(config: &Config) -> Result<()> {
    // Validate chunking
    if config.chunking.target_tokens == 0 {
        anyhow::bail!("chunking.target_tokens must be > 0");
    }
    if !(0.0..=0.5).contains(&config.chunking.overlap_fraction) {
        anyhow::bail!("chunking.overlap_fraction must be in [0.0, 0.5]");
    }

    // Validate retrieval
    let retrieval = &config.retrieval;
    if retrieval.final_limit < 1 {
        anyhow::bail!("retrieval.final_limit must be >= 1");
    }
    if retrieval.candidate_k < 1 {
        anyhow::bail!("retrieval.candidate_k must be >= 1");
    }
    if !retrieval.rank_constant.is_finite() || retrieval.rank_constant <= 0.0 {
        anyhow::bail!("retrieval.rank_constant must be > 0");
    }
    if !(0.0..=1.0).contains(&retrieval.mmr_lambda) {
        anyhow::bail!("retrieval.mmr_lambda must be in [0.0, 1.0]");
    }
    for (name, w) in &retrieval.strategy {
        if name.parse::<QueryClass>().is_err() {
            anyhow::bail!(
                "Unknown query class in retrieval.strategy: '{}'. Must be exact, entity, conceptual, factual, or exploratory.",
                name
            );
        }
        if let Err(e) = StrategyWeights::new(w.lexical, w.vector, w.graph).validate() {
            anyhow::bail!("retrieval.strategy.{}: {}", name, e);
        }
    }

    // Validate embedding
    let embedding = &config.embedding;
    match embedding.provider.as_str() {
        "disabled" | "openai" | "ollama" | "local" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, ollama, or local.",
            other
        ),
    }
    if embedding.is_enabled() {
        if embedding.dims.is_none() || embedding.dims == Some(0) {
            anyhow::bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                embedding.provider
            );
        }
        if embedding.model.is_none() && embedding.provider != "local" {
            anyhow::bail!(
                "embedding.model must be specified when provider is '{}'",
                embedding.provider
            );
        }
        if embedding.batch_size == 0 {
            anyhow::bail!("embedding.batch_size must be > 0");
        }
    }

    // Validate extraction
    match config.extraction.provider.as_str() {
        "disabled" | "heuristic" => {}
        other => anyhow::bail!(
            "Unknown extraction provider: '{}'. Must be disabled or heuristic.",
            other
        ),
    }
    if !(0.0..=1.0).contains(&config.extraction.min_confidence) {
        anyhow::bail!("extraction.min_confidence must be in [0.0, 1.0]");
    }

    if config.sync.workers == 0 {
        anyhow::bail!("sync.workers must be >= 1");
    }

    match config.logging.format.as_str() {
        "pretty" | "json" => {}
        other => anyhow::bail!("Unknown logging.format: '{}'. Must be pretty or json.", other),
    }

    Ok(())
}

/// Default configuration written by `strata init`.
pub const DEFAULT_CONFIG: &str = r#"[db]
path = "./data/strata.sqlite"

[chunking]
target_tokens = 512
overlap_fraction = 0.15

[retrieval]
candidate_k = 50
rank_constant = 60
final_limit = 10
mmr_lambda = 0.7
mmr_candidates = 30
store_timeout_ms = 1500
rerank = true
rerank_top = 10
rerank_timeout_ms = 800
latency_budget_ms = 2500

[embedding]
provider = "disabled"
# provider = "ollama"
# model = "nomic-embed-text"
# dims = 768
# url = "http://localhost:11434"

[extraction]
provider = "heuristic"
min_confidence = 0.3

[sync]
workers = 4

[policy]
allowed_roots = []

[logging]
filter = "info"
format = "pretty"
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_uses_defaults() {
        let config = parse_config("[db]\npath = \"x.sqlite\"\n").unwrap();
        assert_eq!(config.chunking.target_tokens, 512);
        assert_eq!(config.retrieval.candidate_k, 50);
        assert_eq!(config.retrieval.search_config().rank_constant, 60.0);
        assert!(!config.embedding.is_enabled());
        assert!(config.extraction.is_enabled());
        assert_eq!(config.sync.workers, 4);
    }

    #[test]
    fn default_config_parses() {
        let config = parse_config(DEFAULT_CONFIG).unwrap();
        assert_eq!(config.retrieval.latency_budget_ms, 2500);
        assert_eq!(config.logging.format, "pretty");
    }

    #[test]
    fn strategy_override_must_sum_to_one() {
        let ok = parse_config(
            "[db]\npath = \"x\"\n[retrieval.strategy.exact]\nlexical = 1.0\n",
        )
        .unwrap();
        let table = ok.retrieval.strategy_table().unwrap();
        assert_eq!(table.weights(QueryClass::Exact).lexical, 1.0);

        let err = parse_config(
            "[db]\npath = \"x\"\n[retrieval.strategy.exact]\nlexical = 0.5\nvector = 0.2\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("sum to 1.0"));

        let err = parse_config(
            "[db]\npath = \"x\"\n[retrieval.strategy.vibes]\nlexical = 1.0\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("Unknown query class"));
    }

    #[test]
    fn enabled_embedding_needs_dims_and_model() {
        let err = parse_config("[db]\npath = \"x\"\n[embedding]\nprovider = \"openai\"\n")
            .unwrap_err();
        assert!(err.to_string().contains("embedding.dims"));
        let err = parse_config(
            "[db]\npath = \"x\"\n[embedding]\nprovider = \"openai\"\ndims = 8\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("embedding.model"));
        let err = parse_config("[db]\npath = \"x\"\n[embedding]\nprovider = \"magic\"\n")
            .unwrap_err();
        assert!(err.to_string().contains("Unknown embedding provider"));
    }

    #[test]
    fn rejects_out_of_range_values() {
        for bad in [
            "[chunking]\ntarget_tokens = 0",
            "[chunking]\noverlap_fraction = 0.9",
            "[retrieval]\nmmr_lambda = 2.0",
            "[retrieval]\nfinal_limit = 0",
            "[sync]\nworkers = 0",
            "[logging]\nformat = \"xml\"",
        ] {
            let text = format!("[db]\npath = \"x\"\n{bad}\n");
            assert!(parse_config(&text).is_err(), "accepted: {bad}");
        }
    }
}
