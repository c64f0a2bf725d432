use thiserror::Error;

#[derive(Error, Debug)]
pub enum VecError {
    #[error("vecstore: dimension mismatch: got {got}, want {want}")]
    DimensionMismatch { got: usize, want: usize },

    #[error("vecstore: batch length mismatch: {ids} ids, {vectors} vectors")]
    BatchLengthMismatch { ids: usize, vectors: usize },

    #[error("vecstore: invalid vector for id {id:?}: zero or non-finite")]
    InvalidVector { id: Option<u64> },

    #[error("vecstore: index corrupted: {0}")]
    Corrupted(String),
}
