use std::path::Path;

use serde::Deserialize;

use trackid_tracker::TrackerConfig;
use trackid_vecid::Config as ClusterConfig;
use trackid_vecstore::IndexConfig;

use crate::error::PipelineError;

/// Top-level configuration, one section per component.
///
/// ```yaml
/// dim: 128
/// tracker:
///   iou_gate: 0.3
///   min_hits: 3
/// index:
///   backend: hnsw
///   compact_fraction: 0.1
/// cluster:
///   cluster_threshold: 0.55
///   merge_threshold: 0.75
/// pipeline:
///   queue_capacity: 1024
/// ```
///
/// Missing keys take their defaults.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Embedding dimension. Default: 128.
    pub dim: usize,
    pub tracker: TrackerConfig,
    pub index: IndexConfig,
    pub cluster: ClusterConfig,
    pub pipeline: WorkerConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            dim: 128,
            tracker: TrackerConfig::default(),
            index: IndexConfig::default(),
            cluster: ClusterConfig::default(),
            pipeline: WorkerConfig::default(),
        }
    }
}

/// Ingest worker settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Capacity of the embedding queue. A full queue drops new
    /// observations. Default: 1024.
    pub queue_capacity: usize,

    /// Seconds between batch reconciliation passes. Default: 300.
    pub reconcile_interval_secs: u64,

    /// Seconds between index health checks and compaction. Default: 5.
    pub maintenance_interval_secs: u64,

    /// Buffered cluster events per subscriber. Default: 256.
    pub event_capacity: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            reconcile_interval_secs: 300,
            maintenance_interval_secs: 5,
            event_capacity: 256,
        }
    }
}

impl PipelineConfig {
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, PipelineError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&text)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, PipelineError> {
        let cfg: PipelineConfig = serde_yaml::from_str(text)?;
        cfg.validate()
    }

    /// Replaces zero values with defaults and rejects what cannot be
    /// defaulted.
    pub fn validate(mut self) -> Result<Self, PipelineError> {
        if self.dim == 0 {
            return Err(PipelineError::Config("dim must be positive".into()));
        }
        let d = WorkerConfig::default();
        let p = &mut self.pipeline;
        if p.queue_capacity == 0 {
            p.queue_capacity = d.queue_capacity;
        }
        if p.reconcile_interval_secs == 0 {
            p.reconcile_interval_secs = d.reconcile_interval_secs;
        }
        if p.maintenance_interval_secs == 0 {
            p.maintenance_interval_secs = d.maintenance_interval_secs;
        }
        if p.event_capacity == 0 {
            p.event_capacity = d.event_capacity;
        }
        if !(self.index.compact_fraction > 0.0 && self.index.compact_fraction < 1.0) {
            self.index.compact_fraction = IndexConfig::default().compact_fraction;
        }
        self.tracker = self.tracker.with_defaults();
        Ok(self)
    }
}
