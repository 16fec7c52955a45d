//! Error types for the askdocs pipeline.
//!
//! Uses `thiserror` with structured variants covering validation,
//! extraction, the two provider classes, resilience (circuit breaker and
//! rate limiting), timeouts, and storage.
//!
//! Provider variants carry a `transient` flag: transient failures
//! (timeouts, 429s, 5xx) are retried with backoff inside the component
//! that owns the call; non-transient failures surface immediately.

/// Top-level error type for the askdocs library.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("validation failed: {reason}")]
    Validation { reason: String },

    #[error("text extraction failed: {message}")]
    Extraction { message: String },

    #[error("embedding provider error: {message}")]
    EmbeddingProvider { message: String, transient: bool },

    #[error("generation provider error: {message}")]
    GenerationProvider { message: String, transient: bool },

    #[error("{dependency} is unavailable (circuit open)")]
    ServiceUnavailable { dependency: String },

    #[error("rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimitExceeded { retry_after_secs: u64 },

    #[error("operation timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("embedding dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("document not found: {id}")]
    NotFound { id: String },

    #[error("store error: {message}")]
    Store { message: String },
}

impl PipelineError {
    pub fn validation(reason: impl Into<String>) -> Self {
        Self::Validation {
            reason: reason.into(),
        }
    }

    pub fn extraction(message: impl Into<String>) -> Self {
        Self::Extraction {
            message: message.into(),
        }
    }

    pub fn store(message: impl Into<String>) -> Self {
        Self::Store {
            message: message.into(),
        }
    }

    /// Whether this error should be retried by the owning component.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::EmbeddingProvider {
                transient: true,
                ..
            } | Self::GenerationProvider {
                transient: true,
                ..
            }
        )
    }
}

impl From<sqlx::Error> for PipelineError {
    fn from(e: sqlx::Error) -> Self {
        Self::Store {
            message: e.to_string(),
        }
    }
}

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;
