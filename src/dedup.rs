//! Content fingerprinting for duplicate detection.
//!
//! Fingerprints are SHA-256 hashes, hex-encoded. Document fingerprints
//! hash the raw upload bytes so a byte-identical re-upload short-circuits
//! before extraction or any provider call; chunk fingerprints hash
//! whitespace-collapsed (case-preserved) text so embedding reuse survives
//! harmless whitespace drift.
//!
//! Collisions are treated as true duplicates. The hash space is assumed
//! collision-free for practical corpus sizes; this is a documented
//! assumption, not a proof.

use sha2::{Digest, Sha256};
use std::sync::Arc;

use crate::error::Result;
use crate::store::VectorStore;

/// Fingerprint raw document bytes.
pub fn fingerprint_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Fingerprint text content, whitespace-collapsed and case-preserved.
pub fn fingerprint_text(text: &str) -> String {
    let mut hasher = Sha256::new();
    let mut first = true;
    for word in text.split_whitespace() {
        if !first {
            hasher.update(b" ");
        }
        hasher.update(word.as_bytes());
        first = false;
    }
    format!("{:x}", hasher.finalize())
}

/// Duplicate lookups against the corpus.
pub struct Deduplicator {
    store: Arc<dyn VectorStore>,
}

impl Deduplicator {
    pub fn new(store: Arc<dyn VectorStore>) -> Self {
        Self { store }
    }

    /// Returns the id of an already-completed document with this
    /// fingerprint, if any.
    pub async fn is_duplicate(&self, fingerprint: &str) -> Result<Option<String>> {
        self.store.find_by_fingerprint(fingerprint).await
    }

    /// Returns a stored embedding vector for a chunk with this
    /// fingerprint, if any, so the provider call can be skipped.
    pub async fn existing_chunk_embedding(&self, fingerprint: &str) -> Result<Option<Vec<f32>>> {
        self.store.find_chunk_embedding(fingerprint).await
    }
}
