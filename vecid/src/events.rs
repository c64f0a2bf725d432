use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use trackid_featstore::{ClusterId, EmbeddingId};

/// Kind of topology change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterEventKind {
    Merge,
    Split,
    Create,
    Prune,
}

/// Emitted whenever the engine changes cluster topology.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterEvent {
    #[serde(rename = "type")]
    pub kind: ClusterEventKind,
    pub cluster_ids_before: Vec<ClusterId>,
    pub cluster_ids_after: Vec<ClusterId>,
    /// Embeddings whose membership changed.
    pub embedding_ids: Vec<EmbeddingId>,
    pub timestamp: DateTime<Utc>,
}

impl ClusterEvent {
    pub(crate) fn new(
        kind: ClusterEventKind,
        mut before: Vec<ClusterId>,
        mut after: Vec<ClusterId>,
        embedding_ids: Vec<EmbeddingId>,
    ) -> Self {
        before.sort_unstable();
        before.dedup();
        after.sort_unstable();
        after.dedup();
        Self {
            kind,
            cluster_ids_before: before,
            cluster_ids_after: after,
            embedding_ids,
            timestamp: Utc::now(),
        }
    }
}

/// Receives cluster events after the mutation that produced them has been
/// committed. Called outside the engine lock, in commit order.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &ClusterEvent);
}

/// Default sink: logs every event at info level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: &ClusterEvent) {
        info!(
            kind = ?event.kind,
            before = ?event.cluster_ids_before,
            after = ?event.cluster_ids_after,
            embeddings = event.embedding_ids.len(),
            "vecid: cluster event"
        );
    }
}
