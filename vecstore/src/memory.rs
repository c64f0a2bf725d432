use std::collections::BTreeMap;

use parking_lot::RwLock;

use trackid_featstore::vector::normalized;

use crate::cosine::similarity;
use crate::error::VecError;
use crate::vecstore::{Match, VecIndex};

/// MemoryIndex is an exact VecIndex using a brute-force similarity scan.
/// Intended for testing and small-scale use (< 10k vectors).
///
/// Removal is immediate, so there is never anything to compact.
pub struct MemoryIndex {
    dim: usize,
    vectors: RwLock<BTreeMap<u64, Vec<f32>>>,
}

impl MemoryIndex {
    /// Creates an empty index. Panics if `dim` is 0.
    pub fn new(dim: usize) -> Self {
        assert!(dim > 0, "vecstore: MemoryIndex dim must be positive");
        Self {
            dim,
            vectors: RwLock::new(BTreeMap::new()),
        }
    }

    fn check_dim(&self, got: usize) -> Result<(), VecError> {
        if got != self.dim {
            return Err(VecError::DimensionMismatch { got, want: self.dim });
        }
        Ok(())
    }
}

impl VecIndex for MemoryIndex {
    fn dim(&self) -> usize {
        self.dim
    }

    fn insert(&self, id: u64, vector: &[f32]) -> Result<(), VecError> {
        self.check_dim(vector.len())?;
        let v = normalized(vector).ok_or(VecError::InvalidVector { id: Some(id) })?;
        self.vectors.write().insert(id, v);
        Ok(())
    }

    fn search(&self, query: &[f32], top_k: usize) -> Result<Vec<Match>, VecError> {
        self.check_dim(query.len())?;
        let q = normalized(query).ok_or(VecError::InvalidVector { id: None })?;

        let vecs = self.vectors.read();
        if vecs.is_empty() || top_k == 0 {
            return Ok(vec![]);
        }

        let mut results: Vec<Match> = vecs
            .iter()
            .map(|(&id, v)| Match {
                id,
                similarity: similarity(&q, v),
            })
            .collect();

        // Descending similarity; ties resolve to the lower id.
        results.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.id.cmp(&b.id))
        });
        results.truncate(top_k);
        Ok(results)
    }

    fn remove(&self, id: u64) -> Result<bool, VecError> {
        Ok(self.vectors.write().remove(&id).is_some())
    }

    fn contains(&self, id: u64) -> bool {
        self.vectors.read().contains_key(&id)
    }

    fn ids(&self) -> Vec<u64> {
        self.vectors.read().keys().copied().collect()
    }

    fn len(&self) -> usize {
        self.vectors.read().len()
    }

    fn clear(&self) {
        self.vectors.write().clear();
    }
}
