//! In-memory [`VectorStore`] implementation for tests.
//!
//! Uses `HashMap` and `Vec` behind `std::sync::RwLock`. Vector search is
//! brute-force cosine similarity over all stored vectors, restricted to
//! completed documents like the SQLite backend.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use crate::embedding::cosine_similarity;
use crate::error::{PipelineError, Result};
use crate::models::{Chunk, CorpusStats, Document, Embedding, ProcessingStatus, RetrievalResult};

use super::{rank_results, VectorStore};

/// In-memory store used by unit and integration tests.
pub struct MemoryStore {
    dims: usize,
    docs: RwLock<HashMap<String, Document>>,
    chunks: RwLock<Vec<Chunk>>,
    embeddings: RwLock<Vec<Embedding>>,
}

impl MemoryStore {
    pub fn new(dims: usize) -> Self {
        Self {
            dims,
            docs: RwLock::new(HashMap::new()),
            chunks: RwLock::new(Vec::new()),
            embeddings: RwLock::new(Vec::new()),
        }
    }
}

#[async_trait]
impl VectorStore for MemoryStore {
    async fn insert_document(&self, doc: &Document) -> Result<()> {
        let mut docs = self.docs.write().unwrap();
        if docs.contains_key(&doc.id) {
            return Err(PipelineError::store(format!(
                "document {} already exists",
                doc.id
            )));
        }
        docs.insert(doc.id.clone(), doc.clone());
        Ok(())
    }

    async fn get_document(&self, id: &str) -> Result<Option<Document>> {
        Ok(self.docs.read().unwrap().get(id).cloned())
    }

    async fn list_documents(&self, limit: i64) -> Result<Vec<Document>> {
        let docs = self.docs.read().unwrap();
        let mut all: Vec<Document> = docs.values().cloned().collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        all.truncate(limit.max(0) as usize);
        Ok(all)
    }

    async fn update_status(
        &self,
        id: &str,
        status: ProcessingStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let mut docs = self.docs.write().unwrap();
        let doc = docs
            .get_mut(id)
            .ok_or_else(|| PipelineError::NotFound { id: id.to_string() })?;

        if !doc.status.can_transition_to(status) {
            return Err(PipelineError::store(format!(
                "illegal status transition {} -> {}",
                doc.status, status
            )));
        }

        doc.status = status;
        doc.updated_at = chrono::Utc::now().timestamp();
        if let Some(message) = error {
            if let serde_json::Value::Object(map) = &mut doc.metadata {
                map.insert(
                    "error".to_string(),
                    serde_json::Value::String(message.to_string()),
                );
            }
        }
        Ok(())
    }

    async fn set_page_count(&self, id: &str, page_count: i64) -> Result<()> {
        let mut docs = self.docs.write().unwrap();
        let doc = docs
            .get_mut(id)
            .ok_or_else(|| PipelineError::NotFound { id: id.to_string() })?;
        doc.page_count = Some(page_count);
        doc.updated_at = chrono::Utc::now().timestamp();
        Ok(())
    }

    async fn annotate(&self, id: &str, key: &str, value: serde_json::Value) -> Result<()> {
        let mut docs = self.docs.write().unwrap();
        let doc = docs
            .get_mut(id)
            .ok_or_else(|| PipelineError::NotFound { id: id.to_string() })?;
        if let serde_json::Value::Object(map) = &mut doc.metadata {
            map.insert(key.to_string(), value);
        }
        doc.updated_at = chrono::Utc::now().timestamp();
        Ok(())
    }

    async fn find_by_fingerprint(&self, fingerprint: &str) -> Result<Option<String>> {
        let docs = self.docs.read().unwrap();
        let mut matches: Vec<&Document> = docs
            .values()
            .filter(|d| d.fingerprint == fingerprint && d.status == ProcessingStatus::Completed)
            .collect();
        matches.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(matches.first().map(|d| d.id.clone()))
    }

    async fn find_chunk_embedding(&self, fingerprint: &str) -> Result<Option<Vec<f32>>> {
        let chunks = self.chunks.read().unwrap();
        let embeddings = self.embeddings.read().unwrap();
        for chunk in chunks.iter() {
            if chunk.fingerprint == fingerprint {
                if let Some(e) = embeddings.iter().find(|e| e.chunk_id == chunk.id) {
                    return Ok(Some(e.vector.clone()));
                }
            }
        }
        Ok(None)
    }

    async fn insert_chunks(
        &self,
        document_id: &str,
        chunks: &[Chunk],
        embeddings: &[Embedding],
    ) -> Result<()> {
        if chunks.len() != embeddings.len() {
            return Err(PipelineError::store(format!(
                "{} chunks paired with {} embeddings",
                chunks.len(),
                embeddings.len()
            )));
        }
        for e in embeddings {
            if e.vector.len() != self.dims {
                return Err(PipelineError::DimensionMismatch {
                    expected: self.dims,
                    got: e.vector.len(),
                });
            }
        }

        let docs = self.docs.read().unwrap();
        if !docs.contains_key(document_id) {
            return Err(PipelineError::NotFound {
                id: document_id.to_string(),
            });
        }
        drop(docs);

        let mut stored_chunks = self.chunks.write().unwrap();
        let mut stored_embeddings = self.embeddings.write().unwrap();
        stored_chunks.extend(chunks.iter().cloned());
        stored_embeddings.extend(embeddings.iter().cloned());
        Ok(())
    }

    async fn search(
        &self,
        query_vec: &[f32],
        top_k: usize,
        min_similarity: f32,
    ) -> Result<Vec<RetrievalResult>> {
        let docs = self.docs.read().unwrap();
        let chunks = self.chunks.read().unwrap();
        let embeddings = self.embeddings.read().unwrap();

        let mut results: Vec<RetrievalResult> = Vec::new();
        for embedding in embeddings.iter() {
            let Some(doc) = docs.get(&embedding.document_id) else {
                continue;
            };
            if doc.status != ProcessingStatus::Completed {
                continue;
            }
            let Some(chunk) = chunks.iter().find(|c| c.id == embedding.chunk_id) else {
                continue;
            };

            results.push(RetrievalResult {
                chunk_id: chunk.id.clone(),
                document_id: chunk.document_id.clone(),
                text: chunk.text.clone(),
                similarity: cosine_similarity(query_vec, &embedding.vector),
                document_name: doc.file_name.clone(),
                page_number: chunk.page_number,
                chunk_index: chunk.chunk_index,
            });
        }

        rank_results(&mut results, top_k, min_similarity);
        Ok(results)
    }

    async fn delete_document(&self, id: &str) -> Result<bool> {
        let mut docs = self.docs.write().unwrap();
        let existed = docs.remove(id).is_some();
        if existed {
            self.chunks.write().unwrap().retain(|c| c.document_id != id);
            self.embeddings
                .write()
                .unwrap()
                .retain(|e| e.document_id != id);
        }
        Ok(existed)
    }

    async fn stats(&self) -> Result<CorpusStats> {
        Ok(CorpusStats {
            documents: self.docs.read().unwrap().len() as u64,
            chunks: self.chunks.read().unwrap().len() as u64,
            embeddings: self.embeddings.read().unwrap().len() as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    use crate::models::ContentKind;

    fn document(id: &str, fingerprint: &str) -> Document {
        let now = chrono::Utc::now().timestamp();
        Document {
            id: id.to_string(),
            file_name: format!("{id}.pdf"),
            content_type: ContentKind::Pdf,
            byte_size: 64,
            page_count: None,
            status: ProcessingStatus::Pending,
            fingerprint: fingerprint.to_string(),
            metadata: serde_json::json!({}),
            created_at: now,
            updated_at: now,
        }
    }

    fn chunk(doc: &str, index: i64, fingerprint: &str) -> Chunk {
        Chunk {
            id: Uuid::new_v4().to_string(),
            document_id: doc.to_string(),
            chunk_index: index,
            text: format!("chunk {index}"),
            page_number: Some(1),
            start_char: 0,
            end_char: 8,
            token_count: 2,
            fingerprint: fingerprint.to_string(),
        }
    }

    fn embedding(chunk: &Chunk, vector: Vec<f32>) -> Embedding {
        Embedding {
            id: Uuid::new_v4().to_string(),
            chunk_id: chunk.id.clone(),
            document_id: chunk.document_id.clone(),
            vector,
            model: "test".to_string(),
        }
    }

    async fn complete(store: &MemoryStore, id: &str) {
        store
            .update_status(id, ProcessingStatus::Processing, None)
            .await
            .unwrap();
        store
            .update_status(id, ProcessingStatus::Completed, None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn search_excludes_incomplete_documents() {
        let store = MemoryStore::new(2);
        store.insert_document(&document("d1", "f1")).await.unwrap();

        let c = chunk("d1", 0, "cf1");
        let e = embedding(&c, vec![1.0, 0.0]);
        store.insert_chunks("d1", &[c], &[e]).await.unwrap();

        // Still pending: invisible to readers.
        let results = store.search(&[1.0, 0.0], 5, 0.0).await.unwrap();
        assert!(results.is_empty());

        complete(&store, "d1").await;
        let results = store.search(&[1.0, 0.0], 5, 0.0).await.unwrap();
        assert_eq!(results.len(), 1);
        assert!((results[0].similarity - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn rejects_dimension_mismatch() {
        let store = MemoryStore::new(3);
        store.insert_document(&document("d1", "f1")).await.unwrap();
        let c = chunk("d1", 0, "cf1");
        let e = embedding(&c, vec![1.0, 0.0]);
        let err = store.insert_chunks("d1", &[c], &[e]).await.unwrap_err();
        assert!(matches!(err, PipelineError::DimensionMismatch { .. }));
    }

    #[tokio::test]
    async fn insert_chunks_requires_document() {
        let store = MemoryStore::new(2);
        let c = chunk("ghost", 0, "cf1");
        let e = embedding(&c, vec![1.0, 0.0]);
        let err = store.insert_chunks("ghost", &[c], &[e]).await.unwrap_err();
        assert!(matches!(err, PipelineError::NotFound { .. }));
    }

    #[tokio::test]
    async fn delete_cascades_chunks_and_embeddings() {
        let store = MemoryStore::new(2);
        store.insert_document(&document("d1", "f1")).await.unwrap();
        let c = chunk("d1", 0, "cf1");
        let e = embedding(&c, vec![0.5, 0.5]);
        store.insert_chunks("d1", &[c], &[e]).await.unwrap();
        complete(&store, "d1").await;

        assert!(store.delete_document("d1").await.unwrap());
        let stats = store.stats().await.unwrap();
        assert_eq!(stats.documents, 0);
        assert_eq!(stats.chunks, 0);
        assert_eq!(stats.embeddings, 0);
        assert!(!store.delete_document("d1").await.unwrap());
    }

    #[tokio::test]
    async fn fingerprint_lookup_sees_only_completed() {
        let store = MemoryStore::new(2);
        store.insert_document(&document("d1", "same")).await.unwrap();
        assert!(store.find_by_fingerprint("same").await.unwrap().is_none());

        complete(&store, "d1").await;
        assert_eq!(
            store.find_by_fingerprint("same").await.unwrap(),
            Some("d1".to_string())
        );
    }

    #[tokio::test]
    async fn status_transitions_are_enforced() {
        let store = MemoryStore::new(2);
        store.insert_document(&document("d1", "f1")).await.unwrap();
        complete(&store, "d1").await;

        let err = store
            .update_status("d1", ProcessingStatus::Processing, None)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Store { .. }));
    }

    #[tokio::test]
    async fn failure_message_lands_in_metadata() {
        let store = MemoryStore::new(2);
        store.insert_document(&document("d1", "f1")).await.unwrap();
        store
            .update_status("d1", ProcessingStatus::Processing, None)
            .await
            .unwrap();
        store
            .update_status("d1", ProcessingStatus::Failed, Some("extraction failed"))
            .await
            .unwrap();

        let doc = store.get_document("d1").await.unwrap().unwrap();
        assert_eq!(doc.status, ProcessingStatus::Failed);
        assert_eq!(doc.metadata["error"], "extraction failed");
    }

    #[tokio::test]
    async fn chunk_embedding_reuse_lookup() {
        let store = MemoryStore::new(2);
        store.insert_document(&document("d1", "f1")).await.unwrap();
        let c = chunk("d1", 0, "shared-fp");
        let e = embedding(&c, vec![0.25, 0.75]);
        store.insert_chunks("d1", &[c], &[e]).await.unwrap();

        let found = store.find_chunk_embedding("shared-fp").await.unwrap();
        assert_eq!(found, Some(vec![0.25, 0.75]));
        assert!(store.find_chunk_embedding("other").await.unwrap().is_none());
    }
}
