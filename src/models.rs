//! Core data models used throughout askdocs.
//!
//! These types represent the documents, chunks, embeddings, and answers
//! that flow through the ingestion and query pipelines.

use serde::{Deserialize, Serialize};

/// Lifecycle state of an ingested document.
///
/// Transitions are one-directional: `Pending → Processing → Completed`
/// or `Pending → Processing → Failed`. There is no retry-to-pending loop;
/// retries happen inside the failing sub-step before the orchestrator
/// observes the failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl ProcessingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingStatus::Pending => "pending",
            ProcessingStatus::Processing => "processing",
            ProcessingStatus::Completed => "completed",
            ProcessingStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ProcessingStatus::Pending),
            "processing" => Some(ProcessingStatus::Processing),
            "completed" => Some(ProcessingStatus::Completed),
            "failed" => Some(ProcessingStatus::Failed),
            _ => None,
        }
    }

    /// Whether moving to `next` respects the monotonic state machine.
    pub fn can_transition_to(&self, next: ProcessingStatus) -> bool {
        matches!(
            (self, next),
            (ProcessingStatus::Pending, ProcessingStatus::Processing)
                | (ProcessingStatus::Processing, ProcessingStatus::Completed)
                | (ProcessingStatus::Processing, ProcessingStatus::Failed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProcessingStatus::Completed | ProcessingStatus::Failed
        )
    }
}

impl std::fmt::Display for ProcessingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Supported upload formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    Pdf,
    Pptx,
}

impl ContentKind {
    /// Parse a MIME type into a supported kind. Unknown types are rejected
    /// by upload validation.
    pub fn from_mime(mime: &str) -> Option<Self> {
        match mime {
            "application/pdf" => Some(ContentKind::Pdf),
            "application/vnd.openxmlformats-officedocument.presentationml.presentation" => {
                Some(ContentKind::Pptx)
            }
            _ => None,
        }
    }

    pub fn as_mime(&self) -> &'static str {
        match self {
            ContentKind::Pdf => "application/pdf",
            ContentKind::Pptx => {
                "application/vnd.openxmlformats-officedocument.presentationml.presentation"
            }
        }
    }
}

/// One page (or slide) of extracted text, before chunking.
#[derive(Debug, Clone)]
pub struct PageText {
    /// 1-based page or slide number.
    pub page_number: i64,
    pub text: String,
}

/// An uploaded document and its processing state.
#[derive(Debug, Clone)]
pub struct Document {
    pub id: String,
    pub file_name: String,
    pub content_type: ContentKind,
    pub byte_size: i64,
    pub page_count: Option<i64>,
    pub status: ProcessingStatus,
    /// SHA-256 of the raw upload bytes, for document-level dedup.
    pub fingerprint: String,
    pub metadata: serde_json::Value,
    pub created_at: i64,
    pub updated_at: i64,
}

/// A contiguous span of a document's extracted text.
///
/// Chunk indices for one document are contiguous starting at 0. Offsets
/// are character positions relative to the originating page. Chunks are
/// immutable once written and are destroyed with their document.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub chunk_index: i64,
    pub text: String,
    /// 1-based page number, or `None` when the chunk's provenance is
    /// unpaginated.
    pub page_number: Option<i64>,
    pub start_char: i64,
    pub end_char: i64,
    /// Whitespace-based token estimate.
    pub token_count: i64,
    /// SHA-256 of the normalized chunk text, for embedding reuse.
    pub fingerprint: String,
}

/// A vector representation of exactly one chunk.
#[derive(Debug, Clone)]
pub struct Embedding {
    pub id: String,
    pub chunk_id: String,
    /// Denormalized for cascade and filter efficiency.
    pub document_id: String,
    pub vector: Vec<f32>,
    pub model: String,
}

/// A chunk matched against a query, with similarity and provenance.
/// Ephemeral — never persisted.
#[derive(Debug, Clone)]
pub struct RetrievalResult {
    pub chunk_id: String,
    pub document_id: String,
    pub text: String,
    /// Cosine similarity, `1 - cosine_distance`, in `[-1, 1]`.
    pub similarity: f32,
    pub document_name: String,
    pub page_number: Option<i64>,
    pub chunk_index: i64,
}

/// A source citation attached to a synthesized answer.
#[derive(Debug, Clone, Serialize)]
pub struct SourceCitation {
    pub document_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_number: Option<i64>,
    pub similarity: f32,
}

/// A synthesized answer with citations and a confidence estimate.
#[derive(Debug, Clone, Serialize)]
pub struct Answer {
    pub answer: String,
    pub sources: Vec<SourceCitation>,
    /// Clamped to `[0, 1]`; 0.0 for the zero-context case.
    pub confidence: f32,
    /// End-to-end query time in seconds.
    pub processing_time: f64,
}

/// Corpus-level counters.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct CorpusStats {
    pub documents: u64,
    pub chunks: u64,
    pub embeddings: u64,
}
