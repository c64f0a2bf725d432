//! Durable ownership of embeddings and their cluster membership.
//!
//! The store is pure data: it never decides which cluster an embedding
//! belongs to, it only records the decision. Vectors are L2-normalized on
//! construction so that downstream similarity is a plain dot product.
//!
//! # Usage
//!
//! ```
//! use trackid_featstore::{Assignment, ClusterId, Embedding, EmbeddingId, FeatureStore, MemoryStore};
//!
//! let store = MemoryStore::new(3);
//! let emb = Embedding::new(EmbeddingId(1), vec![3.0, 4.0, 0.0], 7).unwrap();
//! store.put(emb).unwrap();
//! store
//!     .set_assignments(&[(EmbeddingId(1), Assignment::Member(ClusterId(1)))])
//!     .unwrap();
//! assert_eq!(store.cluster_members(ClusterId(1)).unwrap(), vec![EmbeddingId(1)]);
//! ```
//!
//! # Persistence
//!
//! [`FeatureStore::snapshot`] captures the embedding table together with
//! the membership table; [`write_snapshot`] / [`read_snapshot`] move it to
//! and from a compact little-endian binary format.

mod error;
mod memory;
mod snapshot;
mod types;
pub mod vector;

pub use error::StoreError;
pub use memory::MemoryStore;
pub use snapshot::{read_snapshot, write_snapshot, Snapshot};
pub use types::{Assignment, ClusterId, Embedding, EmbeddingId, Record};

/// Owns embeddings and the cluster -> members reverse mapping.
///
/// Implementations must be safe for concurrent use.
pub trait FeatureStore: Send + Sync {
    /// Vector dimension accepted by this store.
    fn dim(&self) -> usize;

    /// Inserts a new embedding as [`Assignment::Pending`].
    /// Embeddings are immutable: putting an existing id is an error.
    fn put(&self, embedding: Embedding) -> Result<(), StoreError>;

    /// Returns the record for `id`, if present.
    fn get(&self, id: EmbeddingId) -> Result<Option<Record>, StoreError>;

    /// Removes the record and its membership. Returns the removed record.
    /// Deleting a missing id is not an error.
    fn delete(&self, id: EmbeddingId) -> Result<Option<Record>, StoreError>;

    /// Returns the member ids of a cluster in ascending order.
    fn cluster_members(&self, cluster: ClusterId) -> Result<Vec<EmbeddingId>, StoreError>;

    /// Applies a batch of assignment changes atomically: either every id
    /// exists and all updates land, or nothing changes.
    fn set_assignments(&self, updates: &[(EmbeddingId, Assignment)]) -> Result<(), StoreError>;

    /// Marks an embedding as carrying a human-reviewed label.
    fn set_pinned(&self, id: EmbeddingId, pinned: bool) -> Result<(), StoreError>;

    /// Returns all records in ascending id order.
    fn all(&self) -> Result<Vec<Record>, StoreError>;

    /// Returns the number of stored embeddings.
    fn len(&self) -> Result<usize, StoreError>;

    /// Returns true if the store holds no embeddings.
    fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }

    /// Largest id ever stored that is still present.
    fn max_id(&self) -> Result<Option<EmbeddingId>, StoreError>;

    /// Captures a consistent copy of the embedding and membership tables.
    fn snapshot(&self) -> Result<Snapshot, StoreError>;

    /// Replaces the whole store content with `snapshot`.
    fn restore(&self, snapshot: Snapshot) -> Result<(), StoreError>;
}
