//! Ingestion orchestration.
//!
//! Drives one document through extraction → deduplication → chunking →
//! embedding → storage as a background task, tracking the monotonic
//! processing-status state machine (`pending → processing → completed |
//! failed`). The triggering caller gets an [`IngestHandle`] immediately
//! and polls status, or awaits [`IngestHandle::wait_until_done`].
//!
//! Any sub-step failure before the final commit marks the document
//! `failed` with the error recorded in its metadata; chunks and
//! embeddings land in one all-or-nothing store write, so a failed
//! document never leaves orphans. If the document is deleted while
//! ingestion is running, the task detects it before the commit and
//! abandons the write.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::chunker::chunk_pages;
use crate::config::{ChunkingConfig, DedupConfig};
use crate::dedup::Deduplicator;
use crate::embedding::EmbeddingGateway;
use crate::error::{PipelineError, Result};
use crate::extract::TextExtractor;
use crate::models::{Document, Embedding, ProcessingStatus};
use crate::resilience::CircuitBreaker;
use crate::store::VectorStore;

/// Handle to one in-flight ingestion.
#[derive(Debug)]
pub struct IngestHandle {
    document_id: String,
    task: JoinHandle<ProcessingStatus>,
}

impl IngestHandle {
    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    /// Non-blocking check: has the background task finished?
    pub fn poll(&self) -> bool {
        self.task.is_finished()
    }

    /// Await the terminal status, failing with `Timeout` past the
    /// deadline. The background task keeps running after a timeout;
    /// status remains observable through the store.
    pub async fn wait_until_done(self, timeout: Duration) -> Result<ProcessingStatus> {
        match tokio::time::timeout(timeout, self.task).await {
            Err(_) => Err(PipelineError::Timeout {
                timeout_secs: timeout.as_secs(),
            }),
            Ok(Ok(status)) => Ok(status),
            Ok(Err(e)) => Err(PipelineError::store(format!("ingestion task failed: {e}"))),
        }
    }
}

/// Spawns and runs background ingestion tasks.
pub struct Ingestor {
    store: Arc<dyn VectorStore>,
    extractor: Arc<dyn TextExtractor>,
    gateway: Arc<EmbeddingGateway>,
    store_breaker: Arc<CircuitBreaker>,
    chunking: ChunkingConfig,
    dedup: DedupConfig,
}

impl Ingestor {
    pub fn new(
        store: Arc<dyn VectorStore>,
        extractor: Arc<dyn TextExtractor>,
        gateway: Arc<EmbeddingGateway>,
        store_breaker: Arc<CircuitBreaker>,
        chunking: ChunkingConfig,
        dedup: DedupConfig,
    ) -> Self {
        Self {
            store,
            extractor,
            gateway,
            store_breaker,
            chunking,
            dedup,
        }
    }

    /// Start processing a validated, already-persisted document.
    pub fn spawn(&self, document: Document, bytes: Vec<u8>) -> IngestHandle {
        let document_id = document.id.clone();
        let worker = Worker {
            store: self.store.clone(),
            extractor: self.extractor.clone(),
            gateway: self.gateway.clone(),
            store_breaker: self.store_breaker.clone(),
            chunking: self.chunking.clone(),
            dedup: self.dedup.clone(),
        };

        let task = tokio::spawn(async move { worker.run(document, bytes).await });

        IngestHandle { document_id, task }
    }
}

struct Worker {
    store: Arc<dyn VectorStore>,
    extractor: Arc<dyn TextExtractor>,
    gateway: Arc<EmbeddingGateway>,
    store_breaker: Arc<CircuitBreaker>,
    chunking: ChunkingConfig,
    dedup: DedupConfig,
}

impl Worker {
    async fn run(&self, document: Document, bytes: Vec<u8>) -> ProcessingStatus {
        let id = document.id.clone();
        let file_name = document.file_name.clone();

        match self.process(document, bytes).await {
            Ok(status) => {
                info!(document_id = %id, file_name = %file_name, %status, "ingestion finished");
                status
            }
            Err(PipelineError::NotFound { .. }) => {
                info!(document_id = %id, "document deleted during ingestion, abandoning");
                ProcessingStatus::Failed
            }
            Err(e) => {
                warn!(document_id = %id, error = %e, "ingestion failed");
                if let Err(update_err) = self
                    .store
                    .update_status(&id, ProcessingStatus::Failed, Some(&e.to_string()))
                    .await
                {
                    warn!(document_id = %id, error = %update_err, "failed to record failure");
                }
                ProcessingStatus::Failed
            }
        }
    }

    async fn process(&self, document: Document, bytes: Vec<u8>) -> Result<ProcessingStatus> {
        let id = document.id.clone();

        self.store
            .update_status(&id, ProcessingStatus::Processing, None)
            .await?;

        // Document-level dedup runs before extraction, chunking, and
        // embedding so a duplicate upload costs no further work.
        let dedup = Deduplicator::new(self.store.clone());
        if let Some(existing) = dedup.is_duplicate(&document.fingerprint).await? {
            info!(document_id = %id, duplicate_of = %existing, "duplicate document, short-circuiting");
            self.store
                .annotate(&id, "duplicate_of", serde_json::json!(existing))
                .await?;
            self.store
                .update_status(&id, ProcessingStatus::Completed, None)
                .await?;
            return Ok(ProcessingStatus::Completed);
        }

        // Extraction is CPU-bound; keep it off the async workers.
        let extractor = self.extractor.clone();
        let kind = document.content_type;
        let pages = tokio::task::spawn_blocking(move || extractor.extract(&bytes, kind))
            .await
            .map_err(|e| PipelineError::extraction(format!("extraction task failed: {e}")))??;

        if pages.iter().all(|p| p.text.trim().is_empty()) {
            return Err(PipelineError::extraction(
                "document contains no extractable text",
            ));
        }
        self.store.set_page_count(&id, pages.len() as i64).await?;

        let chunks = chunk_pages(&id, &pages, &self.chunking);
        if chunks.is_empty() {
            return Err(PipelineError::extraction(
                "extracted text produced no chunks",
            ));
        }

        // Chunk-level reuse: fingerprints that already have a stored
        // vector skip the provider call.
        let mut vectors: Vec<Option<Vec<f32>>> = vec![None; chunks.len()];
        if self.dedup.reuse_chunk_embeddings {
            for (i, chunk) in chunks.iter().enumerate() {
                vectors[i] = dedup.existing_chunk_embedding(&chunk.fingerprint).await?;
            }
        }

        let missing: Vec<usize> = (0..chunks.len()).filter(|i| vectors[*i].is_none()).collect();
        if !missing.is_empty() {
            let texts: Vec<String> = missing.iter().map(|&i| chunks[i].text.clone()).collect();
            let embedded = self.gateway.embed(&texts).await?;
            for (&i, vector) in missing.iter().zip(embedded) {
                vectors[i] = Some(vector);
            }
        }

        let model = self.gateway.model_name().to_string();
        let embeddings: Vec<Embedding> = chunks
            .iter()
            .zip(vectors)
            .map(|(chunk, vector)| Embedding {
                id: Uuid::new_v4().to_string(),
                chunk_id: chunk.id.clone(),
                document_id: chunk.document_id.clone(),
                vector: vector.unwrap_or_default(),
                model: model.clone(),
            })
            .collect();

        // The document may have been deleted while we were embedding.
        if self.store.get_document(&id).await?.is_none() {
            return Err(PipelineError::NotFound { id });
        }

        self.store_breaker.try_acquire()?;
        match self.store.insert_chunks(&id, &chunks, &embeddings).await {
            Ok(()) => self.store_breaker.record_success(),
            Err(e) => {
                if !matches!(e, PipelineError::NotFound { .. }) {
                    self.store_breaker.record_failure();
                }
                return Err(e);
            }
        }

        self.store
            .update_status(&id, ProcessingStatus::Completed, None)
            .await?;
        Ok(ProcessingStatus::Completed)
    }
}
