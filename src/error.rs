//! Error taxonomy for the vault.
//!
//! Each component returns its own error enum so that callers can decide on
//! retry policy without string matching. Infrastructure failures (SQLite,
//! configuration, I/O) travel as [`anyhow::Error`] inside [`VaultError::Internal`].

use thiserror::Error;

/// Text extraction failures. Both variants are terminal for a document.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExtractError {
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),
    #[error("extraction failed: {0}")]
    ExtractionFailed(String),
}

/// Embedding capability failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EmbedError {
    /// Transient provider failure (network, rate limit, 5xx, timeout).
    #[error("embedding unavailable: {0}")]
    Unavailable(String),
    /// Permanently invalid input or provider configuration.
    #[error("embedding rejected: {0}")]
    Rejected(String),
}

impl EmbedError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, EmbedError::Unavailable(_))
    }
}

/// Vector index write failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IndexError {
    #[error("vector dimension mismatch: index holds {expected}-d vectors, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("duplicate chunk id in batch: {0}")]
    DuplicateChunk(String),
    /// The batch could not be committed; nothing was applied.
    #[error("index write failed: {0}")]
    WriteFailed(String),
}

impl IndexError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, IndexError::WriteFailed(_))
    }
}

/// Generation capability failure. Never replaced by a fabricated answer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("generation failed: {0}")]
pub struct GenerationError(pub String);

/// Errors surfaced by the query engine.
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("invalid query: {0}")]
    InvalidQuery(String),
    #[error(transparent)]
    Embedding(#[from] EmbedError),
    #[error(transparent)]
    Generation(#[from] GenerationError),
    #[error("timed out: {0}")]
    Timeout(String),
    /// The document store could not be read while checking retrieved chunks.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Errors surfaced by the [`Vault`](crate::vault::Vault) facade.
#[derive(Debug, Error)]
pub enum VaultError {
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("document not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Query(#[from] QueryError),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_classification() {
        assert!(EmbedError::Unavailable("429".into()).is_retryable());
        assert!(!EmbedError::Rejected("too long".into()).is_retryable());
        assert!(IndexError::WriteFailed("locked".into()).is_retryable());
        assert!(!IndexError::DimensionMismatch {
            expected: 3,
            actual: 4
        }
        .is_retryable());
    }

    #[test]
    fn query_error_passes_embedding_error_through() {
        let err: QueryError = EmbedError::Unavailable("rate limited".into()).into();
        assert_eq!(err.to_string(), "embedding unavailable: rate limited");
        assert!(matches!(err, QueryError::Embedding(EmbedError::Unavailable(_))));
    }
}
