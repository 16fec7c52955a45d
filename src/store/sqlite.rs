//! SQLite-backed [`VectorStore`] implementation.
//!
//! Embedding vectors are stored as little-endian f32 BLOBs; similarity
//! search decodes and scores them in Rust (brute-force cosine over the
//! completed portion of the corpus). Chunk and embedding writes for one
//! document share a single transaction so readers never observe a partial
//! chunk set.

use async_trait::async_trait;
use sqlx::{Row, SqlitePool};

use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use crate::error::{PipelineError, Result};
use crate::models::{
    Chunk, ContentKind, CorpusStats, Document, Embedding, ProcessingStatus, RetrievalResult,
};

use super::{rank_results, VectorStore};

pub struct SqliteStore {
    pool: SqlitePool,
    dims: usize,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool, dims: usize) -> Self {
        Self { pool, dims }
    }
}

fn row_to_document(row: &sqlx::sqlite::SqliteRow) -> Result<Document> {
    let content_type: String = row.get("content_type");
    let status: String = row.get("processing_status");
    let metadata_json: String = row.get("metadata_json");

    Ok(Document {
        id: row.get("id"),
        file_name: row.get("file_name"),
        content_type: ContentKind::from_mime(&content_type).ok_or_else(|| {
            PipelineError::store(format!("unknown content type in store: {}", content_type))
        })?,
        byte_size: row.get("byte_size"),
        page_count: row.get("page_count"),
        status: ProcessingStatus::parse(&status)
            .ok_or_else(|| PipelineError::store(format!("unknown status in store: {}", status)))?,
        fingerprint: row.get("fingerprint"),
        metadata: serde_json::from_str(&metadata_json).unwrap_or(serde_json::json!({})),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

#[async_trait]
impl VectorStore for SqliteStore {
    async fn insert_document(&self, doc: &Document) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO documents (id, file_name, content_type, byte_size, page_count,
                                   processing_status, fingerprint, metadata_json,
                                   created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&doc.id)
        .bind(&doc.file_name)
        .bind(doc.content_type.as_mime())
        .bind(doc.byte_size)
        .bind(doc.page_count)
        .bind(doc.status.as_str())
        .bind(&doc.fingerprint)
        .bind(doc.metadata.to_string())
        .bind(doc.created_at)
        .bind(doc.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_document(&self, id: &str) -> Result<Option<Document>> {
        let row = sqlx::query("SELECT * FROM documents WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_document(&r)).transpose()
    }

    async fn list_documents(&self, limit: i64) -> Result<Vec<Document>> {
        let rows = sqlx::query("SELECT * FROM documents ORDER BY created_at DESC, id ASC LIMIT ?")
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_document).collect()
    }

    async fn update_status(
        &self,
        id: &str,
        status: ProcessingStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT processing_status, metadata_json FROM documents WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| PipelineError::NotFound { id: id.to_string() })?;

        let current_str: String = row.get("processing_status");
        let current = ProcessingStatus::parse(&current_str).ok_or_else(|| {
            PipelineError::store(format!("unknown status in store: {}", current_str))
        })?;
        if !current.can_transition_to(status) {
            return Err(PipelineError::store(format!(
                "illegal status transition {} -> {}",
                current, status
            )));
        }

        let metadata_json: String = row.get("metadata_json");
        let mut metadata: serde_json::Value =
            serde_json::from_str(&metadata_json).unwrap_or(serde_json::json!({}));
        if let Some(message) = error {
            if let serde_json::Value::Object(map) = &mut metadata {
                map.insert(
                    "error".to_string(),
                    serde_json::Value::String(message.to_string()),
                );
            }
        }

        sqlx::query(
            "UPDATE documents SET processing_status = ?, metadata_json = ?, updated_at = ? WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(metadata.to_string())
        .bind(chrono::Utc::now().timestamp())
        .bind(id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn set_page_count(&self, id: &str, page_count: i64) -> Result<()> {
        let result = sqlx::query("UPDATE documents SET page_count = ?, updated_at = ? WHERE id = ?")
            .bind(page_count)
            .bind(chrono::Utc::now().timestamp())
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(PipelineError::NotFound { id: id.to_string() });
        }
        Ok(())
    }

    async fn annotate(&self, id: &str, key: &str, value: serde_json::Value) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT metadata_json FROM documents WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| PipelineError::NotFound { id: id.to_string() })?;

        let metadata_json: String = row.get("metadata_json");
        let mut metadata: serde_json::Value =
            serde_json::from_str(&metadata_json).unwrap_or(serde_json::json!({}));
        if let serde_json::Value::Object(map) = &mut metadata {
            map.insert(key.to_string(), value);
        }

        sqlx::query("UPDATE documents SET metadata_json = ?, updated_at = ? WHERE id = ?")
            .bind(metadata.to_string())
            .bind(chrono::Utc::now().timestamp())
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn find_by_fingerprint(&self, fingerprint: &str) -> Result<Option<String>> {
        let id: Option<String> = sqlx::query_scalar(
            r#"
            SELECT id FROM documents
            WHERE fingerprint = ? AND processing_status = 'completed'
            ORDER BY created_at ASC, id ASC
            LIMIT 1
            "#,
        )
        .bind(fingerprint)
        .fetch_optional(&self.pool)
        .await?;
        Ok(id)
    }

    async fn find_chunk_embedding(&self, fingerprint: &str) -> Result<Option<Vec<f32>>> {
        let blob: Option<Vec<u8>> = sqlx::query_scalar(
            r#"
            SELECT e.vector FROM embeddings e
            JOIN chunks c ON c.id = e.chunk_id
            WHERE c.fingerprint = ?
            ORDER BY e.created_at ASC, e.id ASC
            LIMIT 1
            "#,
        )
        .bind(fingerprint)
        .fetch_optional(&self.pool)
        .await?;
        Ok(blob.map(|b| blob_to_vec(&b)))
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

        let mut tx = self.pool.begin().await?;

        // The document may have been deleted while ingestion was running.
        let exists: Option<String> = sqlx::query_scalar("SELECT id FROM documents WHERE id = ?")
            .bind(document_id)
            .fetch_optional(&mut *tx)
            .await?;
        if exists.is_none() {
            return Err(PipelineError::NotFound {
                id: document_id.to_string(),
            });
        }

        let now = chrono::Utc::now().timestamp();
        for chunk in chunks {
            sqlx::query(
                r#"
                INSERT INTO chunks (id, document_id, chunk_index, text, page_number,
                                    start_char, end_char, token_count, fingerprint)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&chunk.id)
            .bind(&chunk.document_id)
            .bind(chunk.chunk_index)
            .bind(&chunk.text)
            .bind(chunk.page_number)
            .bind(chunk.start_char)
            .bind(chunk.end_char)
            .bind(chunk.token_count)
            .bind(&chunk.fingerprint)
            .execute(&mut *tx)
            .await?;
        }

        for embedding in embeddings {
            sqlx::query(
                r#"
                INSERT INTO embeddings (id, chunk_id, document_id, vector, model, created_at)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&embedding.id)
            .bind(&embedding.chunk_id)
            .bind(&embedding.document_id)
            .bind(vec_to_blob(&embedding.vector))
            .bind(&embedding.model)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn search(
        &self,
        query_vec: &[f32],
        top_k: usize,
        min_similarity: f32,
    ) -> Result<Vec<RetrievalResult>> {
        let rows = sqlx::query(
            r#"
            SELECT e.chunk_id, e.document_id, e.vector,
                   c.text, c.page_number, c.chunk_index,
                   d.file_name
            FROM embeddings e
            JOIN chunks c ON c.id = e.chunk_id
            JOIN documents d ON d.id = e.document_id
            WHERE d.processing_status = 'completed'
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut results: Vec<RetrievalResult> = rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("vector");
                let vector = blob_to_vec(&blob);
                RetrievalResult {
                    chunk_id: row.get("chunk_id"),
                    document_id: row.get("document_id"),
                    text: row.get("text"),
                    similarity: cosine_similarity(query_vec, &vector),
                    document_name: row.get("file_name"),
                    page_number: row.get("page_number"),
                    chunk_index: row.get("chunk_index"),
                }
            })
            .collect();

        rank_results(&mut results, top_k, min_similarity);
        Ok(results)
    }

    async fn delete_document(&self, id: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM embeddings WHERE document_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM documents WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    async fn stats(&self) -> Result<CorpusStats> {
        let documents: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents")
            .fetch_one(&self.pool)
            .await?;
        let chunks: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
            .fetch_one(&self.pool)
            .await?;
        let embeddings: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM embeddings")
            .fetch_one(&self.pool)
            .await?;
        Ok(CorpusStats {
            documents: documents as u64,
            chunks: chunks as u64,
            embeddings: embeddings as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    use crate::config::DbConfig;
    use crate::{db, migrate};

    async fn test_store() -> (tempfile::TempDir, SqliteStore) {
        let tmp = tempfile::TempDir::new().unwrap();
        let db_config = DbConfig {
            path: tmp.path().join("test.sqlite"),
        };
        let pool = db::connect(&db_config).await.unwrap();
        migrate::run_migrations(&pool).await.unwrap();
        (tmp, SqliteStore::new(pool, 3))
    }

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

    fn chunk(doc: &str, index: i64) -> Chunk {
        Chunk {
            id: Uuid::new_v4().to_string(),
            document_id: doc.to_string(),
            chunk_index: index,
            text: format!("chunk {index}"),
            page_number: Some(1),
            start_char: 0,
            end_char: 8,
            token_count: 2,
            fingerprint: format!("fp-{doc}-{index}"),
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

    #[tokio::test]
    async fn document_round_trip() {
        let (_tmp, store) = test_store().await;
        store.insert_document(&document("d1", "f1")).await.unwrap();

        let doc = store.get_document("d1").await.unwrap().unwrap();
        assert_eq!(doc.file_name, "d1.pdf");
        assert_eq!(doc.status, ProcessingStatus::Pending);
        assert_eq!(doc.content_type, ContentKind::Pdf);

        assert!(store.get_document("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn search_ranks_and_filters() {
        let (_tmp, store) = test_store().await;
        store.insert_document(&document("d1", "f1")).await.unwrap();

        let c0 = chunk("d1", 0);
        let c1 = chunk("d1", 1);
        let e0 = embedding(&c0, vec![1.0, 0.0, 0.0]);
        let e1 = embedding(&c1, vec![0.0, 1.0, 0.0]);
        store
            .insert_chunks("d1", &[c0, c1], &[e0, e1])
            .await
            .unwrap();
        store
            .update_status("d1", ProcessingStatus::Processing, None)
            .await
            .unwrap();
        store
            .update_status("d1", ProcessingStatus::Completed, None)
            .await
            .unwrap();

        let results = store.search(&[1.0, 0.0, 0.0], 5, 0.5).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].chunk_index, 0);
        assert!((results[0].similarity - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn insert_rejects_wrong_dims() {
        let (_tmp, store) = test_store().await;
        store.insert_document(&document("d1", "f1")).await.unwrap();
        let c = chunk("d1", 0);
        let e = embedding(&c, vec![1.0, 0.0]);
        let err = store.insert_chunks("d1", &[c], &[e]).await.unwrap_err();
        assert!(matches!(err, PipelineError::DimensionMismatch { .. }));
    }

    #[tokio::test]
    async fn delete_cascades() {
        let (_tmp, store) = test_store().await;
        store.insert_document(&document("d1", "f1")).await.unwrap();
        let c = chunk("d1", 0);
        let e = embedding(&c, vec![1.0, 0.0, 0.0]);
        store.insert_chunks("d1", &[c], &[e]).await.unwrap();

        assert!(store.delete_document("d1").await.unwrap());
        let stats = store.stats().await.unwrap();
        assert_eq!(stats.documents, 0);
        assert_eq!(stats.chunks, 0);
        assert_eq!(stats.embeddings, 0);
    }

    #[tokio::test]
    async fn insert_chunks_fails_for_missing_document() {
        let (_tmp, store) = test_store().await;
        let c = chunk("ghost", 0);
        let e = embedding(&c, vec![1.0, 0.0, 0.0]);
        let err = store.insert_chunks("ghost", &[c], &[e]).await.unwrap_err();
        assert!(matches!(err, PipelineError::NotFound { .. }));
    }
}
