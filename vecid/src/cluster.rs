use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

use trackid_featstore::{ClusterId, EmbeddingId};

/// Read-only view of one identity cluster.
#[derive(Clone, PartialEq, Serialize)]
pub struct Cluster {
    pub id: ClusterId,

    /// L2-normalized mean of the member vectors.
    pub centroid: Vec<f32>,

    pub members: Vec<EmbeddingId>,

    /// Mean similarity of members to the centroid.
    pub confidence: f32,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl fmt::Debug for Cluster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cluster")
            .field("id", &self.id)
            .field("members", &self.members.len())
            .field("confidence", &self.confidence)
            .field("centroid_len", &self.centroid.len())
            .finish()
    }
}

/// Mutable cluster state. The centroid is derived from a running sum of
/// unit member vectors, so joins and removals are O(dim).
pub(crate) struct ClusterState {
    pub(crate) id: ClusterId,
    sum: Vec<f64>,
    pub(crate) members: BTreeSet<EmbeddingId>,
    pub(crate) centroid: Vec<f32>,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) updated_at: DateTime<Utc>,
}

impl ClusterState {
    pub(crate) fn new(id: ClusterId, dim: usize) -> Self {
        let now = Utc::now();
        Self {
            id,
            sum: vec![0.0; dim],
            members: BTreeSet::new(),
            centroid: vec![0.0; dim],
            created_at: now,
            updated_at: now,
        }
    }

    pub(crate) fn add(&mut self, id: EmbeddingId, v: &[f32]) {
        if self.members.insert(id) {
            for (s, &x) in self.sum.iter_mut().zip(v) {
                *s += x as f64;
            }
        }
    }

    pub(crate) fn remove(&mut self, id: EmbeddingId, v: &[f32]) {
        if self.members.remove(&id) {
            if self.members.is_empty() {
                self.sum.iter_mut().for_each(|s| *s = 0.0);
                return;
            }
            for (s, &x) in self.sum.iter_mut().zip(v) {
                *s -= x as f64;
            }
        }
    }

    /// Recompute the running sum from scratch.
    pub(crate) fn rebuild<'a>(&mut self, vectors: impl IntoIterator<Item = &'a [f32]>) {
        self.sum.iter_mut().for_each(|s| *s = 0.0);
        for v in vectors {
            for (s, &x) in self.sum.iter_mut().zip(v) {
                *s += x as f64;
            }
        }
    }

    pub(crate) fn absorb(&mut self, other: ClusterState) {
        for (s, o) in self.sum.iter_mut().zip(other.sum) {
            *s += o;
        }
        self.members.extend(other.members);
        self.created_at = self.created_at.min(other.created_at);
    }

    fn sum_norm(&self) -> f64 {
        self.sum.iter().map(|s| s * s).sum::<f64>().sqrt()
    }

    /// Re-derive the centroid. A degenerate sum keeps the previous centroid.
    pub(crate) fn refresh(&mut self) {
        let n = self.sum_norm();
        if n > 0.0 {
            self.centroid = self.sum.iter().map(|s| (s / n) as f32).collect();
        }
        self.updated_at = Utc::now();
    }

    pub(crate) fn confidence(&self) -> f32 {
        if self.members.is_empty() {
            return 0.0;
        }
        (self.sum_norm() / self.members.len() as f64) as f32
    }

    pub(crate) fn view(&self) -> Cluster {
        Cluster {
            id: self.id,
            centroid: self.centroid.clone(),
            members: self.members.iter().copied().collect(),
            confidence: self.confidence(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}
