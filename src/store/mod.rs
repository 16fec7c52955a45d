//! Storage abstraction for the corpus.
//!
//! The [`VectorStore`] trait defines every persistence operation the
//! pipeline needs — document rows, bulk chunk+embedding writes, duplicate
//! lookups, cosine-similarity search, and cascade deletion — enabling
//! pluggable backends. [`sqlite::SqliteStore`] is the default;
//! [`memory::MemoryStore`] backs tests.
//!
//! Implementations must be `Send + Sync` and must guarantee that a
//! document's chunk set is never observed partially written: chunks and
//! embeddings for one document land in a single transaction, and search
//! only surfaces chunks of documents whose status is `completed`.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{Chunk, CorpusStats, Document, Embedding, ProcessingStatus, RetrievalResult};

/// Abstract storage backend.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`insert_document`](VectorStore::insert_document) | Create a document row |
/// | [`get_document`](VectorStore::get_document) | Point read by id |
/// | [`list_documents`](VectorStore::list_documents) | Recent documents |
/// | [`update_status`](VectorStore::update_status) | Advance the processing state machine |
/// | [`set_page_count`](VectorStore::set_page_count) | Record page count after extraction |
/// | [`annotate`](VectorStore::annotate) | Merge one key into document metadata |
/// | [`find_by_fingerprint`](VectorStore::find_by_fingerprint) | Document-level dedup lookup |
/// | [`find_chunk_embedding`](VectorStore::find_chunk_embedding) | Chunk-level embedding reuse |
/// | [`insert_chunks`](VectorStore::insert_chunks) | All-or-nothing chunk+embedding write |
/// | [`search`](VectorStore::search) | Top-k cosine similarity over completed documents |
/// | [`delete_document`](VectorStore::delete_document) | Cascade delete |
/// | [`stats`](VectorStore::stats) | Corpus counters |
#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn insert_document(&self, doc: &Document) -> Result<()>;

    async fn get_document(&self, id: &str) -> Result<Option<Document>>;

    async fn list_documents(&self, limit: i64) -> Result<Vec<Document>>;

    /// Advance the document's status. Transitions must respect the
    /// monotonic state machine; `error` is recorded into document
    /// metadata when moving to `failed`.
    async fn update_status(
        &self,
        id: &str,
        status: ProcessingStatus,
        error: Option<&str>,
    ) -> Result<()>;

    async fn set_page_count(&self, id: &str, page_count: i64) -> Result<()>;

    /// Merge one key/value into the document's metadata mapping.
    async fn annotate(&self, id: &str, key: &str, value: serde_json::Value) -> Result<()>;

    /// Id of a completed document with this fingerprint, if any.
    async fn find_by_fingerprint(&self, fingerprint: &str) -> Result<Option<String>>;

    /// A stored embedding vector for any chunk with this fingerprint.
    async fn find_chunk_embedding(&self, fingerprint: &str) -> Result<Option<Vec<f32>>>;

    /// Persist a document's chunks and embeddings together,
    /// all-or-nothing. Fails with `NotFound` if the document row has
    /// disappeared (deletion mid-ingestion) and `DimensionMismatch` if a
    /// vector disagrees with the configured dimensionality.
    async fn insert_chunks(
        &self,
        document_id: &str,
        chunks: &[Chunk],
        embeddings: &[Embedding],
    ) -> Result<()>;

    /// Top-k cosine-similarity search over chunks of completed documents.
    /// Results are ordered by descending similarity, ties broken by
    /// ascending chunk index then document id; results below
    /// `min_similarity` are excluded entirely.
    async fn search(
        &self,
        query_vec: &[f32],
        top_k: usize,
        min_similarity: f32,
    ) -> Result<Vec<RetrievalResult>>;

    /// Delete a document and cascade its chunks and embeddings.
    /// Returns `false` if no such document existed.
    async fn delete_document(&self, id: &str) -> Result<bool>;

    async fn stats(&self) -> Result<CorpusStats>;
}

/// Shared ordering for search results: descending similarity, then
/// ascending chunk index, then document id.
pub(crate) fn rank_results(results: &mut Vec<RetrievalResult>, top_k: usize, min_similarity: f32) {
    results.retain(|r| r.similarity >= min_similarity);
    results.sort_by(|a, b| {
        b.similarity
            .partial_cmp(&a.similarity)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.chunk_index.cmp(&b.chunk_index))
            .then(a.document_id.cmp(&b.document_id))
    });
    results.truncate(top_k);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(doc: &str, index: i64, similarity: f32) -> RetrievalResult {
        RetrievalResult {
            chunk_id: format!("{doc}-{index}"),
            document_id: doc.to_string(),
            text: String::new(),
            similarity,
            document_name: doc.to_string(),
            page_number: None,
            chunk_index: index,
        }
    }

    #[test]
    fn ranking_is_descending_with_threshold() {
        let mut results = vec![
            result("a", 0, 0.4),
            result("a", 1, 0.9),
            result("b", 0, 0.7),
        ];
        rank_results(&mut results, 10, 0.5);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].similarity, 0.9);
        assert_eq!(results[1].similarity, 0.7);
    }

    #[test]
    fn ties_break_by_chunk_index_then_document() {
        let mut results = vec![
            result("b", 2, 0.8),
            result("a", 2, 0.8),
            result("a", 1, 0.8),
        ];
        rank_results(&mut results, 10, 0.0);
        assert_eq!(results[0].chunk_index, 1);
        assert_eq!(results[1].document_id, "a");
        assert_eq!(results[2].document_id, "b");
    }

    #[test]
    fn truncates_to_top_k() {
        let mut results = vec![
            result("a", 0, 0.9),
            result("a", 1, 0.8),
            result("a", 2, 0.7),
        ];
        rank_results(&mut results, 2, 0.0);
        assert_eq!(results.len(), 2);
    }
}
