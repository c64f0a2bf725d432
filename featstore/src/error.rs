use thiserror::Error;

use crate::types::EmbeddingId;

/// Errors returned by feature store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("featstore: dimension mismatch for embedding {id}: expected {expected}, got {got}")]
    DimensionMismatch {
        id: EmbeddingId,
        expected: usize,
        got: usize,
    },

    #[error("featstore: invalid vector for embedding {id}: {reason}")]
    InvalidVector { id: EmbeddingId, reason: String },

    #[error("featstore: embedding {0} already exists")]
    Duplicate(EmbeddingId),

    #[error("featstore: embedding {0} not found")]
    NotFound(EmbeddingId),

    #[error("featstore: {0}")]
    Io(String),

    #[error("featstore: invalid format: {0}")]
    InvalidFormat(String),
}
