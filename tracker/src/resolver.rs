use trackid_featstore::ClusterId;

use crate::error::TrackerError;

/// A nearest-neighbor hit from the shared identity index.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    /// Cluster of the matched embedding. `None` while that embedding is
    /// still awaiting assignment.
    pub person: Option<ClusterId>,
    pub similarity: f32,
}

/// An embedding forwarded for asynchronous insertion and clustering.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub camera_id: String,
    pub track_id: u64,
    pub detection_id: u64,
    pub frame_timestamp: i64,
    pub embedding: Vec<f32>,
    pub quality: Option<f32>,
}

/// The tracker's view of the identity subsystem.
///
/// Every method is called from the per-frame hot path and must not block
/// on index maintenance.
pub trait IdentityResolver: Send + Sync {
    /// Top-`k` matches for `vector`, most similar first.
    fn search(&self, vector: &[f32], k: usize) -> Result<Vec<Candidate>, TrackerError>;

    /// Enqueues an observation. Returns `false` if it was dropped because
    /// the queue is full.
    fn submit(&self, observation: Observation) -> bool;

    /// Follows merges. `None` once the cluster no longer exists.
    fn canonical(&self, person: ClusterId) -> Option<ClusterId>;

    /// Reports identities seen simultaneously in one frame.
    fn note_cooccurrence(&self, _persons: &[ClusterId]) {}
}
