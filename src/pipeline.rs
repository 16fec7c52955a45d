//! Top-level facade wiring the pipeline together.
//!
//! [`Pipeline`] owns the store, the provider gateways, and the shared
//! resilience state (one circuit breaker per external dependency class
//! plus the per-client rate limiter), all constructed once in
//! [`Pipeline::new`] and injected by reference — there are no ambient
//! globals, so tests can build fully isolated instances.
//!
//! The two operations exposed to callers are [`Pipeline::ingest`]
//! (asynchronous; returns a status handle immediately) and
//! [`Pipeline::query`] (bounded by an end-to-end deadline).

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::dedup::fingerprint_bytes;
use crate::embedding::{EmbeddingGateway, EmbeddingProvider};
use crate::error::{PipelineError, Result};
use crate::extract::TextExtractor;
use crate::generation::GenerationProvider;
use crate::ingest::{IngestHandle, Ingestor};
use crate::models::{Answer, ContentKind, CorpusStats, Document, ProcessingStatus};
use crate::resilience::{CircuitBreaker, ClientRateLimiter};
use crate::retrieval::RetrievalEngine;
use crate::store::VectorStore;
use crate::synthesis::Synthesizer;

/// Per-query overrides; unset fields fall back to configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryOptions {
    pub top_k: Option<usize>,
    pub min_similarity: Option<f32>,
}

pub struct Pipeline {
    config: Config,
    store: Arc<dyn VectorStore>,
    limiter: Arc<ClientRateLimiter>,
    retrieval: RetrievalEngine,
    synthesizer: Arc<Synthesizer>,
    ingestor: Ingestor,
}

impl Pipeline {
    pub fn new(
        config: Config,
        store: Arc<dyn VectorStore>,
        extractor: Arc<dyn TextExtractor>,
        embedder: Arc<dyn EmbeddingProvider>,
        generator: Arc<dyn GenerationProvider>,
    ) -> Self {
        let cooldown = Duration::from_secs(config.resilience.cooldown_secs);
        let threshold = config.resilience.failure_threshold;
        let embedding_breaker = Arc::new(CircuitBreaker::new(
            "embedding provider",
            threshold,
            cooldown,
        ));
        let generation_breaker = Arc::new(CircuitBreaker::new(
            "generation provider",
            threshold,
            cooldown,
        ));
        let store_breaker = Arc::new(CircuitBreaker::new("vector store", threshold, cooldown));

        let gateway = Arc::new(EmbeddingGateway::new(
            embedder,
            embedding_breaker,
            config.embedding.clone(),
        ));
        let limiter = Arc::new(ClientRateLimiter::new(
            config.resilience.rate_limit_requests,
            Duration::from_secs(config.resilience.rate_limit_window_secs),
        ));
        let retrieval =
            RetrievalEngine::new(gateway.clone(), store.clone(), store_breaker.clone());
        let synthesizer = Arc::new(Synthesizer::new(
            generator,
            generation_breaker,
            config.synthesis.clone(),
            config.generation.max_retries,
        ));
        let ingestor = Ingestor::new(
            store.clone(),
            extractor,
            gateway,
            store_breaker,
            config.chunking.clone(),
            config.dedup.clone(),
        );

        Self {
            config,
            store,
            limiter,
            retrieval,
            synthesizer,
            ingestor,
        }
    }

    /// Validate an upload, persist its document row as `pending`, and
    /// start background ingestion. Returns immediately with a handle.
    pub async fn ingest(
        &self,
        client: &str,
        bytes: Vec<u8>,
        file_name: &str,
        content_type: &str,
    ) -> Result<IngestHandle> {
        self.limiter.check(client)?;

        let kind = ContentKind::from_mime(content_type).ok_or_else(|| {
            PipelineError::validation(format!(
                "unsupported content type: {} (supported: pdf, pptx)",
                content_type
            ))
        })?;
        if file_name.trim().is_empty() {
            return Err(PipelineError::validation("file name is required"));
        }
        if bytes.is_empty() {
            return Err(PipelineError::validation("uploaded file is empty"));
        }
        if bytes.len() as i64 > self.config.limits.max_file_bytes {
            return Err(PipelineError::validation(format!(
                "file too large: {} bytes (maximum {})",
                bytes.len(),
                self.config.limits.max_file_bytes
            )));
        }

        let now = chrono::Utc::now().timestamp();
        let document = Document {
            id: Uuid::new_v4().to_string(),
            file_name: file_name.trim().to_string(),
            content_type: kind,
            byte_size: bytes.len() as i64,
            page_count: None,
            status: ProcessingStatus::Pending,
            fingerprint: fingerprint_bytes(&bytes),
            metadata: serde_json::json!({}),
            created_at: now,
            updated_at: now,
        };
        self.store.insert_document(&document).await?;
        info!(document_id = %document.id, file_name = %document.file_name, "ingestion started");

        Ok(self.ingestor.spawn(document, bytes))
    }

    pub async fn get_status(&self, document_id: &str) -> Result<ProcessingStatus> {
        let doc = self
            .store
            .get_document(document_id)
            .await?
            .ok_or_else(|| PipelineError::NotFound {
                id: document_id.to_string(),
            })?;
        Ok(doc.status)
    }

    /// Answer a question against the corpus, bounded by the configured
    /// end-to-end deadline.
    pub async fn query(&self, client: &str, text: &str, options: QueryOptions) -> Result<Answer> {
        self.limiter.check(client)?;
        let query = validate_query(text, self.config.limits.max_query_chars)?;

        let top_k = options.top_k.unwrap_or(self.config.retrieval.top_k);
        let min_similarity = options
            .min_similarity
            .unwrap_or(self.config.retrieval.min_similarity);
        let timeout_secs = self.config.query.timeout_secs;

        let start = Instant::now();
        let work = async {
            let results = self.retrieval.retrieve(&query, top_k, min_similarity).await?;
            self.synthesizer.synthesize(&query, &results).await
        };

        let mut answer = match tokio::time::timeout(Duration::from_secs(timeout_secs), work).await
        {
            Ok(result) => result?,
            Err(_) => {
                warn!(timeout_secs, "query deadline exceeded");
                return Err(PipelineError::Timeout { timeout_secs });
            }
        };

        answer.processing_time = start.elapsed().as_secs_f64();
        info!(
            confidence = answer.confidence,
            sources = answer.sources.len(),
            elapsed_secs = answer.processing_time,
            "query answered"
        );
        Ok(answer)
    }

    /// Delete a document and cascade its chunks and embeddings. A
    /// deletion racing an in-flight ingestion is detected by the
    /// ingestion task before its final commit.
    pub async fn delete_document(&self, document_id: &str) -> Result<bool> {
        self.store.delete_document(document_id).await
    }

    pub async fn list_documents(&self, limit: i64) -> Result<Vec<Document>> {
        self.store.list_documents(limit).await
    }

    pub async fn stats(&self) -> Result<CorpusStats> {
        self.store.stats().await
    }
}

/// Normalize and bound a query string: whitespace collapsed, control
/// characters removed, length checked.
fn validate_query(text: &str, max_chars: usize) -> Result<String> {
    let cleaned: String = text
        .chars()
        .filter(|c| !c.is_control() || c.is_whitespace())
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");

    if cleaned.chars().count() < 3 {
        return Err(PipelineError::validation(
            "query too short (minimum 3 characters)",
        ));
    }
    if cleaned.chars().count() > max_chars {
        return Err(PipelineError::validation(format!(
            "query too long (maximum {} characters)",
            max_chars
        )));
    }
    Ok(cleaned)
}
