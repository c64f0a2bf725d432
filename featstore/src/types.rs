use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::vector::normalized;

/// Unique embedding identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EmbeddingId(pub u64);

impl fmt::Display for EmbeddingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique cluster (person) identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClusterId(pub u64);

impl fmt::Display for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:03}", self.0)
    }
}

/// One observation's identity signature. Immutable once created.
#[derive(Clone, Serialize, Deserialize)]
pub struct Embedding {
    pub id: EmbeddingId,

    /// Unit-length feature vector.
    pub vector: Vec<f32>,

    /// Detection this embedding was computed from.
    pub source_detection_id: u64,

    pub created_at: DateTime<Utc>,

    pub quality_score: Option<f32>,
}

impl Embedding {
    /// Creates an embedding, L2-normalizing `vector`.
    /// Fails if the vector is zero or has non-finite components.
    pub fn new(id: EmbeddingId, vector: Vec<f32>, source_detection_id: u64) -> Result<Self, StoreError> {
        let vector = normalized(&vector).ok_or_else(|| StoreError::InvalidVector {
            id,
            reason: "zero or non-finite vector".into(),
        })?;
        Ok(Self {
            id,
            vector,
            source_detection_id,
            created_at: Utc::now(),
            quality_score: None,
        })
    }

    pub fn with_quality(mut self, score: f32) -> Self {
        self.quality_score = Some(score);
        self
    }
}

impl fmt::Debug for Embedding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Embedding")
            .field("id", &self.id)
            .field("dim", &self.vector.len())
            .field("source_detection_id", &self.source_detection_id)
            .field("created_at", &self.created_at)
            .field("quality_score", &self.quality_score)
            .finish()
    }
}

/// Cluster membership state of a stored embedding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "cluster")]
pub enum Assignment {
    /// Stored but not yet classified.
    Pending,
    /// Member of exactly one cluster.
    Member(ClusterId),
    /// Evicted by outlier pruning.
    Outlier,
}

impl Assignment {
    pub fn cluster(&self) -> Option<ClusterId> {
        match self {
            Assignment::Member(c) => Some(*c),
            _ => None,
        }
    }
}

/// An embedding plus its membership bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    pub embedding: Embedding,
    pub assignment: Assignment,
    /// Set when the assignment was confirmed by a human reviewer.
    pub pinned: bool,
}
