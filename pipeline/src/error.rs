use thiserror::Error;

use trackid_featstore::StoreError;
use trackid_vecid::VecIdError;
use trackid_vecstore::VecError;

/// Errors returned by the pipeline context and worker.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("pipeline: invalid config: {0}")]
    Config(String),

    #[error("pipeline: parse config: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("pipeline: io: {0}")]
    Io(#[from] std::io::Error),

    #[error("pipeline: ingest worker already started")]
    AlreadyStarted,

    /// Every reconciliation attempt was invalidated by concurrent writes.
    #[error("pipeline: reconciliation gave up after {0} conflicting attempts")]
    Contended(usize),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Index(#[from] VecError),

    #[error(transparent)]
    Cluster(#[from] VecIdError),
}
