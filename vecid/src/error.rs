use thiserror::Error;

use trackid_featstore::{EmbeddingId, StoreError};
use trackid_vecstore::VecError;

/// Errors returned by cluster engine operations.
#[derive(Debug, Error)]
pub enum VecIdError {
    #[error("vecid: dimension mismatch for embedding {id}: expected {expected}, got {got}")]
    DimensionMismatch {
        id: EmbeddingId,
        expected: usize,
        got: usize,
    },

    #[error("vecid: embedding {0} has a zero or non-finite vector")]
    InvalidVector(EmbeddingId),

    #[error("vecid: embedding {0} is not in the feature store")]
    UnknownEmbedding(EmbeddingId),

    /// A reconciliation plan was computed against an engine state that has
    /// since changed. Recompute the plan and retry.
    #[error("vecid: stale plan: computed at generation {expected}, engine is at {found}")]
    Conflict { expected: u64, found: u64 },

    #[error("vecid: reconciliation cancelled")]
    Cancelled,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Index(#[from] VecError),
}
