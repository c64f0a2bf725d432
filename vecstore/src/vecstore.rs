use crate::error::VecError;

/// Match is a single result from a vector similarity search.
#[derive(Debug, Clone, PartialEq)]
pub struct Match {
    /// Identifier of the matched vector.
    pub id: u64,

    /// Normalized dot product with the query, in `[-1, 1]`.
    /// Higher values indicate higher similarity.
    pub similarity: f32,
}

/// VecIndex is the capability interface for top-k similarity search over
/// dense float32 vectors. Callers depend only on this trait; the backend is
/// picked at construction time.
///
/// All implementations must be safe for concurrent use (Send + Sync):
/// any number of concurrent searches, mutations serialized internally.
pub trait VecIndex: Send + Sync {
    /// Vector dimension accepted by this index.
    fn dim(&self) -> usize;

    /// Add or replace the vector stored under `id`. The vector is
    /// normalized before storage.
    fn insert(&self, id: u64, vector: &[f32]) -> Result<(), VecError>;

    /// Add or replace multiple vectors. Every vector is validated before
    /// any is inserted.
    fn batch_insert(&self, ids: &[u64], vectors: &[&[f32]]) -> Result<(), VecError> {
        if ids.len() != vectors.len() {
            return Err(VecError::BatchLengthMismatch {
                ids: ids.len(),
                vectors: vectors.len(),
            });
        }
        for (id, v) in ids.iter().zip(vectors.iter()) {
            if v.len() != self.dim() {
                return Err(VecError::DimensionMismatch {
                    got: v.len(),
                    want: self.dim(),
                });
            }
            if v.iter().any(|x| !x.is_finite()) || v.iter().all(|&x| x == 0.0) {
                return Err(VecError::InvalidVector { id: Some(*id) });
            }
        }
        for (id, v) in ids.iter().zip(vectors.iter()) {
            self.insert(*id, v)?;
        }
        Ok(())
    }

    /// Return at most `top_k` vectors ordered by descending similarity.
    /// An empty index yields an empty list.
    fn search(&self, query: &[f32], top_k: usize) -> Result<Vec<Match>, VecError>;

    /// Exclude `id` from all subsequent searches. Returns whether it was
    /// present. Removing an unknown id is not an error.
    fn remove(&self, id: u64) -> Result<bool, VecError>;

    /// Whether `id` is currently searchable.
    fn contains(&self, id: u64) -> bool;

    /// All searchable ids, in ascending order.
    fn ids(&self) -> Vec<u64>;

    /// Number of searchable vectors.
    fn len(&self) -> usize;

    /// Return true if the index contains no searchable vectors.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry.
    fn clear(&self);

    /// Fraction of stored entries that are removed but not yet reclaimed.
    fn deleted_fraction(&self) -> f32 {
        0.0
    }

    /// Reclaim removed entries. Returns true if a rebuild happened.
    fn compact(&self) -> Result<bool, VecError> {
        Ok(false)
    }

    /// Check internal consistency, reporting [`VecError::Corrupted`].
    fn verify(&self) -> Result<(), VecError> {
        Ok(())
    }
}
