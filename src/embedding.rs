//! Embedding provider abstraction and the batching gateway.
//!
//! Defines the [`EmbeddingProvider`] capability trait, the
//! [`GeminiEmbedder`] REST implementation, and the [`EmbeddingGateway`]
//! that every caller goes through. The gateway:
//!
//! - splits inputs into provider-sized sub-batches and reassembles results
//!   in input order;
//! - enforces a sliding-window request budget toward the provider,
//!   sleeping until capacity frees (up to a bounded wait) before failing
//!   with `RateLimitExceeded`;
//! - retries transient provider errors with exponential backoff
//!   (1s, 2s, 4s … capped) and surfaces non-transient errors immediately;
//! - routes every call through the embedding circuit breaker;
//! - validates that responses carry one vector per input at the configured
//!   dimensionality.
//!
//! Also provides the vector utilities used for BLOB storage:
//! [`cosine_similarity`], [`vec_to_blob`], [`blob_to_vec`].

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::config::EmbeddingConfig;
use crate::error::{PipelineError, Result};
use crate::resilience::CircuitBreaker;

/// Capability interface for embedding backends.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Model identifier (e.g. `"text-embedding-004"`).
    fn model_name(&self) -> &str;
    /// Vector dimensionality (e.g. `768`).
    fn dims(&self) -> usize;
    /// Embed a batch of texts, one vector per input, in input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Sliding-window request budget toward the provider.
#[derive(Debug)]
struct RequestBudget {
    limit: usize,
    window: Duration,
    history: VecDeque<Instant>,
}

impl RequestBudget {
    fn new(limit: usize, window: Duration) -> Self {
        Self {
            limit,
            window,
            history: VecDeque::new(),
        }
    }

    /// Admit one request, or report how long until capacity frees.
    fn try_acquire(&mut self) -> Option<Duration> {
        let now = Instant::now();
        while self
            .history
            .front()
            .is_some_and(|t| now.duration_since(*t) >= self.window)
        {
            self.history.pop_front();
        }

        if self.limit > 0 && self.history.len() >= self.limit {
            let wait = self
                .history
                .front()
                .map(|t| self.window.saturating_sub(now.duration_since(*t)))
                .unwrap_or(self.window);
            return Some(wait.max(Duration::from_millis(1)));
        }

        self.history.push_back(now);
        None
    }
}

/// Batching, budgeted, breaker-guarded front to an embedding provider.
pub struct EmbeddingGateway {
    provider: Arc<dyn EmbeddingProvider>,
    breaker: Arc<CircuitBreaker>,
    budget: Mutex<RequestBudget>,
    config: EmbeddingConfig,
}

impl EmbeddingGateway {
    pub fn new(
        provider: Arc<dyn EmbeddingProvider>,
        breaker: Arc<CircuitBreaker>,
        config: EmbeddingConfig,
    ) -> Self {
        let budget = Mutex::new(RequestBudget::new(
            config.requests_per_minute,
            Duration::from_secs(60),
        ));
        Self {
            provider,
            breaker,
            budget,
            config,
        }
    }

    pub fn model_name(&self) -> &str {
        self.provider.model_name()
    }

    pub fn dims(&self) -> usize {
        self.config.dims
    }

    /// Embed texts, preserving input order across sub-batches.
    pub async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let mut vectors = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.config.batch_size) {
            self.acquire_budget().await?;
            let batch_vectors = self.call_with_retry(batch).await?;
            vectors.extend(batch_vectors);
        }
        Ok(vectors)
    }

    /// Embed a single query string.
    pub async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed(std::slice::from_ref(&text.to_string())).await?;
        vectors.pop().ok_or_else(|| PipelineError::EmbeddingProvider {
            message: "empty embedding response".to_string(),
            transient: false,
        })
    }

    /// Block (bounded) until the sliding-window budget admits a request.
    async fn acquire_budget(&self) -> Result<()> {
        let max_wait = Duration::from_secs(self.config.max_budget_wait_secs);
        let mut waited = Duration::ZERO;

        loop {
            let wait = self.budget.lock().unwrap().try_acquire();
            let Some(wait) = wait else {
                return Ok(());
            };

            if waited + wait > max_wait {
                warn!("embedding request budget exhausted");
                return Err(PipelineError::RateLimitExceeded {
                    retry_after_secs: wait.as_secs().max(1),
                });
            }
            debug!(wait_ms = wait.as_millis() as u64, "waiting for embedding budget");
            tokio::time::sleep(wait).await;
            waited += wait;
        }
    }

    async fn call_with_retry(&self, batch: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut attempt: u32 = 0;

        loop {
            self.breaker.try_acquire()?;

            match self.provider.embed(batch).await {
                Ok(vectors) => {
                    self.validate(batch.len(), &vectors)?;
                    self.breaker.record_success();
                    return Ok(vectors);
                }
                Err(e) => {
                    self.breaker.record_failure();
                    if e.is_transient() && attempt < self.config.max_retries {
                        attempt += 1;
                        let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                        warn!(
                            attempt,
                            delay_secs = delay.as_secs(),
                            error = %e,
                            "transient embedding failure, backing off"
                        );
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    return Err(e);
                }
            }
        }
    }

    fn validate(&self, expected_count: usize, vectors: &[Vec<f32>]) -> Result<()> {
        if vectors.len() != expected_count {
            return Err(PipelineError::EmbeddingProvider {
                message: format!(
                    "provider returned {} vectors for {} inputs",
                    vectors.len(),
                    expected_count
                ),
                transient: false,
            });
        }
        for v in vectors {
            if v.len() != self.config.dims {
                return Err(PipelineError::DimensionMismatch {
                    expected: self.config.dims,
                    got: v.len(),
                });
            }
        }
        Ok(())
    }
}

// ============ Gemini provider ============

/// Embedding provider for the Gemini `batchEmbedContents` REST endpoint.
///
/// Requires the `GEMINI_API_KEY` environment variable at construction.
pub struct GeminiEmbedder {
    model: String,
    dims: usize,
    api_key: String,
    endpoint: String,
    client: reqwest::Client,
}

impl GeminiEmbedder {
    pub fn from_env(config: &EmbeddingConfig) -> Result<Self> {
        let api_key = std::env::var("GEMINI_API_KEY").map_err(|_| {
            PipelineError::validation("GEMINI_API_KEY environment variable not set")
        })?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| PipelineError::EmbeddingProvider {
                message: e.to_string(),
                transient: false,
            })?;

        Ok(Self {
            model: config.model.clone(),
            dims: config.dims,
            api_key,
            endpoint: "https://generativelanguage.googleapis.com/v1beta".to_string(),
            client,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for GeminiEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let requests: Vec<serde_json::Value> = texts
            .iter()
            .map(|t| {
                serde_json::json!({
                    "model": format!("models/{}", self.model),
                    "content": { "parts": [{ "text": t }] },
                })
            })
            .collect();
        let body = serde_json::json!({ "requests": requests });

        let url = format!(
            "{}/models/{}:batchEmbedContents?key={}",
            self.endpoint, self.model, self.api_key
        );

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| PipelineError::EmbeddingProvider {
                message: format!("request failed: {}", e),
                transient: true,
            })?;

        let status = response.status();
        if !status.is_success() {
            let transient = status.as_u16() == 429 || status.is_server_error();
            let body_text = response.text().await.unwrap_or_default();
            return Err(PipelineError::EmbeddingProvider {
                message: format!("API error {}: {}", status, body_text),
                transient,
            });
        }

        let json: serde_json::Value =
            response
                .json()
                .await
                .map_err(|e| PipelineError::EmbeddingProvider {
                    message: format!("invalid response body: {}", e),
                    transient: false,
                })?;

        parse_gemini_embeddings(&json)
    }
}

/// Parse the `embeddings[].values` arrays from a Gemini batch response.
fn parse_gemini_embeddings(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let embeddings = json
        .get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| PipelineError::EmbeddingProvider {
            message: "invalid response: missing embeddings array".to_string(),
            transient: false,
        })?;

    let mut vectors = Vec::with_capacity(embeddings.len());
    for item in embeddings {
        let values = item
            .get("values")
            .and_then(|v| v.as_array())
            .ok_or_else(|| PipelineError::EmbeddingProvider {
                message: "invalid response: missing values".to_string(),
                transient: false,
            })?;
        vectors.push(
            values
                .iter()
                .map(|v| v.as_f64().unwrap_or(0.0) as f32)
                .collect(),
        );
    }
    Ok(vectors)
}

// ============ Vector utilities ============

/// Encode a float vector as little-endian f32 bytes for BLOB storage.
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Cosine similarity in `[-1.0, 1.0]`; 0.0 for empty or mismatched vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }
    dot / denom
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct SequencedEmbedder {
        dims: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl EmbeddingProvider for SequencedEmbedder {
        fn model_name(&self) -> &str {
            "sequenced"
        }
        fn dims(&self) -> usize {
            self.dims
        }
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(texts
                .iter()
                .map(|t| {
                    let tag: f32 = t.parse().unwrap_or(0.0);
                    let mut v = vec![0.0; self.dims];
                    v[0] = tag;
                    v
                })
                .collect())
        }
    }

    struct FailingEmbedder {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl EmbeddingProvider for FailingEmbedder {
        fn model_name(&self) -> &str {
            "failing"
        }
        fn dims(&self) -> usize {
            4
        }
        async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(PipelineError::EmbeddingProvider {
                message: "boom".to_string(),
                transient: false,
            })
        }
    }

    fn gateway_config(dims: usize, batch_size: usize) -> EmbeddingConfig {
        EmbeddingConfig {
            dims,
            batch_size,
            max_retries: 0,
            requests_per_minute: 0,
            max_budget_wait_secs: 0,
            ..EmbeddingConfig::default()
        }
    }

    fn breaker(threshold: usize) -> Arc<CircuitBreaker> {
        Arc::new(CircuitBreaker::new(
            "embedding",
            threshold,
            Duration::from_secs(600),
        ))
    }

    #[tokio::test]
    async fn batches_preserve_input_order() {
        let provider = Arc::new(SequencedEmbedder {
            dims: 4,
            calls: AtomicUsize::new(0),
        });
        let gateway = EmbeddingGateway::new(provider.clone(), breaker(5), gateway_config(4, 3));

        let texts: Vec<String> = (0..10).map(|i| i.to_string()).collect();
        let vectors = gateway.embed(&texts).await.unwrap();

        assert_eq!(vectors.len(), 10);
        for (i, v) in vectors.iter().enumerate() {
            assert_eq!(v[0], i as f32);
        }
        // 10 inputs at batch size 3 → 4 provider calls.
        assert_eq!(provider.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn empty_input_is_a_no_op() {
        let provider = Arc::new(SequencedEmbedder {
            dims: 4,
            calls: AtomicUsize::new(0),
        });
        let gateway = EmbeddingGateway::new(provider.clone(), breaker(5), gateway_config(4, 3));
        let vectors = gateway.embed(&[]).await.unwrap();
        assert!(vectors.is_empty());
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn wrong_dimensionality_is_rejected() {
        let provider = Arc::new(SequencedEmbedder {
            dims: 4,
            calls: AtomicUsize::new(0),
        });
        // Gateway expects 8 dims; provider produces 4.
        let gateway = EmbeddingGateway::new(provider, breaker(5), gateway_config(8, 3));
        let err = gateway.embed(&["1".to_string()]).await.unwrap_err();
        assert!(matches!(err, PipelineError::DimensionMismatch { .. }));
    }

    #[tokio::test]
    async fn breaker_trips_and_blocks_provider_calls() {
        let provider = Arc::new(FailingEmbedder {
            calls: AtomicUsize::new(0),
        });
        let gateway = EmbeddingGateway::new(provider.clone(), breaker(3), gateway_config(4, 3));

        for _ in 0..3 {
            let err = gateway.embed(&["x".to_string()]).await.unwrap_err();
            assert!(matches!(err, PipelineError::EmbeddingProvider { .. }));
        }
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);

        // Circuit is open: the next call fails fast without a provider call.
        let err = gateway.embed(&["x".to_string()]).await.unwrap_err();
        assert!(matches!(err, PipelineError::ServiceUnavailable { .. }));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn budget_rejects_when_wait_bound_is_zero() {
        let provider = Arc::new(SequencedEmbedder {
            dims: 4,
            calls: AtomicUsize::new(0),
        });
        let config = EmbeddingConfig {
            dims: 4,
            batch_size: 1,
            requests_per_minute: 1,
            max_budget_wait_secs: 0,
            max_retries: 0,
            ..EmbeddingConfig::default()
        };
        let gateway = EmbeddingGateway::new(provider, breaker(5), config);

        gateway.embed(&["1".to_string()]).await.unwrap();
        let err = gateway.embed(&["2".to_string()]).await.unwrap_err();
        assert!(matches!(err, PipelineError::RateLimitExceeded { .. }));
    }

    #[test]
    fn vec_blob_round_trip() {
        let vec = vec![1.0f32, -2.5, 3.125, 0.0, -0.001];
        assert_eq!(blob_to_vec(&vec_to_blob(&vec)), vec);
    }

    #[test]
    fn cosine_identical_vectors() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_orthogonal_vectors() {
        let a = vec![1.0, 0.0];
        let b = vec![0.0, 1.0];
        assert!(cosine_similarity(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn cosine_mismatched_lengths() {
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
    }

    #[test]
    fn parse_gemini_embeddings_response() {
        let json = serde_json::json!({
            "embeddings": [
                { "values": [0.1, 0.2] },
                { "values": [0.3, 0.4] },
            ]
        });
        let vectors = parse_gemini_embeddings(&json).unwrap();
        assert_eq!(vectors.len(), 2);
        assert_eq!(vectors[1], vec![0.3f32, 0.4]);
    }

    #[test]
    fn parse_gemini_embeddings_rejects_malformed() {
        let json = serde_json::json!({ "nope": [] });
        assert!(parse_gemini_embeddings(&json).is_err());
    }
}
