//! Query-path retrieval orchestration.
//!
//! [`RetrievalEngine`] owns no state: it embeds the query through the
//! [`EmbeddingGateway`], runs the store's cosine-similarity search, and
//! returns the ranked candidates. Failures from either collaborator
//! propagate untouched — an empty `Ok` result means "no chunk cleared the
//! threshold", never a masked error.

use std::sync::Arc;

use tracing::{debug, info};

use crate::embedding::EmbeddingGateway;
use crate::error::Result;
use crate::models::RetrievalResult;
use crate::resilience::CircuitBreaker;
use crate::store::VectorStore;

pub struct RetrievalEngine {
    gateway: Arc<EmbeddingGateway>,
    store: Arc<dyn VectorStore>,
    store_breaker: Arc<CircuitBreaker>,
}

impl RetrievalEngine {
    pub fn new(
        gateway: Arc<EmbeddingGateway>,
        store: Arc<dyn VectorStore>,
        store_breaker: Arc<CircuitBreaker>,
    ) -> Self {
        Self {
            gateway,
            store,
            store_breaker,
        }
    }

    /// Retrieve the best-matching chunks for a query.
    pub async fn retrieve(
        &self,
        query: &str,
        top_k: usize,
        min_similarity: f32,
    ) -> Result<Vec<RetrievalResult>> {
        debug!(top_k, min_similarity, "embedding query");
        let query_vec = self.gateway.embed_query(query).await?;

        self.store_breaker.try_acquire()?;
        let results = match self.store.search(&query_vec, top_k, min_similarity).await {
            Ok(results) => {
                self.store_breaker.record_success();
                results
            }
            Err(e) => {
                self.store_breaker.record_failure();
                return Err(e);
            }
        };

        if results.is_empty() {
            info!("no relevant context found for query");
        } else {
            info!(count = results.len(), "similarity search returned results");
        }
        Ok(results)
    }
}
