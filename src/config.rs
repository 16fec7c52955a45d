use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub db: DbConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub dedup: DedupConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub synthesis: SynthesisConfig,
    #[serde(default)]
    pub resilience: ResilienceConfig,
    #[serde(default)]
    pub query: QueryConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./data/askdocs.sqlite"),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LimitsConfig {
    /// Maximum accepted upload size in bytes.
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: i64,
    /// Maximum accepted query length in characters.
    #[serde(default = "default_max_query_chars")]
    pub max_query_chars: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_file_bytes: default_max_file_bytes(),
            max_query_chars: default_max_query_chars(),
        }
    }
}

fn default_max_file_bytes() -> i64 {
    50 * 1024 * 1024
}
fn default_max_query_chars() -> usize {
    1000
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    /// Target chunk size in characters.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Characters of trailing context carried into the next chunk.
    #[serde(default = "default_overlap")]
    pub overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            overlap: default_overlap(),
        }
    }
}

fn default_chunk_size() -> usize {
    1000
}
fn default_overlap() -> usize {
    200
}

#[derive(Debug, Deserialize, Clone)]
pub struct DedupConfig {
    /// Reuse stored embeddings for chunks with an identical fingerprint
    /// instead of re-calling the embedding provider.
    #[serde(default = "default_true")]
    pub reuse_chunk_embeddings: bool,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            reuse_chunk_embeddings: true,
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_model")]
    pub model: String,
    #[serde(default = "default_dims")]
    pub dims: usize,
    /// Provider maximum batch size; larger inputs are split into ordered
    /// sub-batches.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Sliding-window request budget toward the provider.
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: usize,
    /// Longest a call will wait for budget before failing with
    /// `RateLimitExceeded`.
    #[serde(default = "default_max_budget_wait_secs")]
    pub max_budget_wait_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model: default_embedding_model(),
            dims: default_dims(),
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
            requests_per_minute: default_requests_per_minute(),
            max_budget_wait_secs: default_max_budget_wait_secs(),
        }
    }
}

fn default_embedding_model() -> String {
    "text-embedding-004".to_string()
}
fn default_dims() -> usize {
    768
}
fn default_batch_size() -> usize {
    16
}
fn default_max_retries() -> u32 {
    3
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_requests_per_minute() -> usize {
    120
}
fn default_max_budget_wait_secs() -> u64 {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    #[serde(default = "default_generation_model")]
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_top_p")]
    pub top_p: f64,
    #[serde(default = "default_top_k")]
    pub top_k: u32,
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            model: default_generation_model(),
            temperature: default_temperature(),
            top_p: default_top_p(),
            top_k: default_top_k(),
            max_output_tokens: default_max_output_tokens(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_generation_model() -> String {
    "gemini-2.0-flash".to_string()
}
fn default_temperature() -> f64 {
    0.3
}
fn default_top_p() -> f64 {
    0.8
}
fn default_top_k() -> u32 {
    40
}
fn default_max_output_tokens() -> u32 {
    2048
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k_results")]
    pub top_k: usize,
    /// Results below this cosine similarity are excluded entirely.
    #[serde(default = "default_min_similarity")]
    pub min_similarity: f32,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k_results(),
            min_similarity: default_min_similarity(),
        }
    }
}

fn default_top_k_results() -> usize {
    5
}
fn default_min_similarity() -> f32 {
    0.7
}

#[derive(Debug, Deserialize, Clone)]
pub struct SynthesisConfig {
    /// Maximum total context length; lowest-ranked chunks are dropped
    /// first beyond this budget.
    #[serde(default = "default_max_context_chars")]
    pub max_context_chars: usize,
    /// Citations are limited to this many of the top chunks actually used.
    #[serde(default = "default_max_sources")]
    pub max_sources: usize,
    #[serde(default = "default_similarity_weight")]
    pub similarity_weight: f32,
    #[serde(default = "default_structure_weight")]
    pub structure_weight: f32,
    /// Ceiling applied to confidence when the answer hedges.
    #[serde(default = "default_hedge_cap")]
    pub hedge_cap: f32,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            max_context_chars: default_max_context_chars(),
            max_sources: default_max_sources(),
            similarity_weight: default_similarity_weight(),
            structure_weight: default_structure_weight(),
            hedge_cap: default_hedge_cap(),
        }
    }
}

fn default_max_context_chars() -> usize {
    6000
}
fn default_max_sources() -> usize {
    3
}
fn default_similarity_weight() -> f32 {
    0.75
}
fn default_structure_weight() -> f32 {
    0.25
}
fn default_hedge_cap() -> f32 {
    0.25
}

#[derive(Debug, Deserialize, Clone)]
pub struct ResilienceConfig {
    /// Consecutive failures before a circuit opens.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: usize,
    /// Cooldown before an open circuit allows a half-open probe.
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    /// Per-client request allowance within the window.
    #[serde(default = "default_rate_limit_requests")]
    pub rate_limit_requests: usize,
    #[serde(default = "default_rate_limit_window_secs")]
    pub rate_limit_window_secs: u64,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown_secs: default_cooldown_secs(),
            rate_limit_requests: default_rate_limit_requests(),
            rate_limit_window_secs: default_rate_limit_window_secs(),
        }
    }
}

fn default_failure_threshold() -> usize {
    5
}
fn default_cooldown_secs() -> u64 {
    30
}
fn default_rate_limit_requests() -> usize {
    100
}
fn default_rate_limit_window_secs() -> u64 {
    3600
}

#[derive(Debug, Deserialize, Clone)]
pub struct QueryConfig {
    /// End-to-end deadline for one query.
    #[serde(default = "default_query_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_query_timeout_secs(),
        }
    }
}

fn default_query_timeout_secs() -> u64 {
    30
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    if config.limits.max_file_bytes <= 0 {
        anyhow::bail!("limits.max_file_bytes must be > 0");
    }

    if config.chunking.chunk_size == 0 {
        anyhow::bail!("chunking.chunk_size must be > 0");
    }
    if config.chunking.overlap >= config.chunking.chunk_size {
        anyhow::bail!("chunking.overlap must be smaller than chunking.chunk_size");
    }

    if config.embedding.dims == 0 {
        anyhow::bail!("embedding.dims must be > 0");
    }
    if config.embedding.batch_size == 0 {
        anyhow::bail!("embedding.batch_size must be > 0");
    }

    if config.retrieval.top_k == 0 {
        anyhow::bail!("retrieval.top_k must be >= 1");
    }
    if !(-1.0..=1.0).contains(&config.retrieval.min_similarity) {
        anyhow::bail!("retrieval.min_similarity must be in [-1.0, 1.0]");
    }

    if config.synthesis.similarity_weight < 0.0 || config.synthesis.structure_weight < 0.0 {
        anyhow::bail!("synthesis weights must be non-negative");
    }
    if !(0.0..=1.0).contains(&config.synthesis.hedge_cap) {
        anyhow::bail!("synthesis.hedge_cap must be in [0.0, 1.0]");
    }

    if config.resilience.failure_threshold == 0 {
        anyhow::bail!("resilience.failure_threshold must be >= 1");
    }
    if config.resilience.rate_limit_requests == 0 {
        anyhow::bail!("resilience.rate_limit_requests must be >= 1");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        assert!(validate(&config).is_ok());
        assert_eq!(config.chunking.chunk_size, 1000);
        assert_eq!(config.chunking.overlap, 200);
        assert_eq!(config.retrieval.top_k, 5);
        assert_eq!(config.resilience.rate_limit_requests, 100);
    }

    #[test]
    fn empty_toml_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert!(validate(&config).is_ok());
        assert_eq!(config.embedding.dims, 768);
    }

    #[test]
    fn rejects_overlap_at_least_chunk_size() {
        let mut config = Config::default();
        config.chunking.overlap = config.chunking.chunk_size;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn rejects_out_of_range_similarity() {
        let mut config = Config::default();
        config.retrieval.min_similarity = 1.5;
        assert!(validate(&config).is_err());
    }
}
