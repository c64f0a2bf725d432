//! Top-k similarity search over L2-normalized embeddings.
//!
//! Two interchangeable backends implement [`VecIndex`]:
//!
//! - [`MemoryIndex`]: exact brute-force scan, for small populations and tests.
//! - [`HNSW`]: hierarchical navigable small world graph, sub-linear search.
//!
//! Vectors are normalized on insert and queries are normalized before
//! search, so the reported similarity is a dot product in `[-1, 1]`.
//!
//! Both backends are single-writer / multi-reader: searches take a shared
//! lock, mutations an exclusive one. [`HNSW`] removals leave tombstones;
//! [`VecIndex::compact`] rebuilds the graph off-lock and swaps it in.

pub mod cosine;
pub mod error;
pub mod hnsw;
pub mod memory;
pub mod vecstore;

use std::sync::Arc;

use serde::Deserialize;

pub use cosine::similarity;
pub use error::VecError;
pub use hnsw::{HNSW, HNSWConfig};
pub use memory::MemoryIndex;
pub use vecstore::{Match, VecIndex};

/// Index implementation selected at construction time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Brute-force exact search.
    Exact,
    /// Approximate HNSW graph.
    #[default]
    Hnsw,
}

/// Construction parameters for [`new_index`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    pub backend: Backend,
    /// HNSW max connections per node per layer.
    pub m: usize,
    pub ef_construction: usize,
    pub ef_search: usize,
    /// Fraction of tombstoned entries that triggers compaction.
    pub compact_fraction: f32,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Hnsw,
            m: 16,
            ef_construction: 200,
            ef_search: 50,
            compact_fraction: 0.1,
        }
    }
}

/// Builds the configured backend for vectors of dimension `dim`.
pub fn new_index(dim: usize, cfg: &IndexConfig) -> Arc<dyn VecIndex> {
    match cfg.backend {
        Backend::Exact => Arc::new(MemoryIndex::new(dim)),
        Backend::Hnsw => Arc::new(HNSW::new(HNSWConfig {
            dim,
            m: cfg.m,
            ef_construction: cfg.ef_construction,
            ef_search: cfg.ef_search,
        })),
    }
}
