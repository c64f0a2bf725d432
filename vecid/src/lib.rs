//! Identity clustering over stored embeddings.
//!
//! Online, [`ClusterEngine::assign`] places each embedding into the nearest
//! cluster (or starts one) and merges clusters whose centroids converge.
//! Periodically, [`ClusterEngine::prune`] evicts outliers and
//! [`ClusterEngine::reconcile`] re-runs DBSCAN over every embedding to
//! correct drift from the greedy online pass.
//!
//! # Usage
//!
//! ```
//! use std::sync::Arc;
//! use trackid_featstore::{ClusterId, Embedding, EmbeddingId, FeatureStore, MemoryStore};
//! use trackid_vecid::{ClusterEngine, Config};
//!
//! let store = Arc::new(MemoryStore::new(3));
//! let engine = ClusterEngine::new(Config::default(), store.clone());
//!
//! let emb = Embedding::new(EmbeddingId(1), vec![1.0, 0.0, 0.0], 42)?;
//! let vector = emb.vector.clone();
//! store.put(emb)?;
//!
//! let outcome = engine.assign(EmbeddingId(1), &vector)?;
//! assert_eq!(outcome.cluster(), ClusterId(1));
//!
//! // Background pass; the closure reports cancellation.
//! let report = engine.reconcile(&|| false)?;
//! assert_eq!(report.moved, 0);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! # Design
//!
//! Membership lives in the [`FeatureStore`](trackid_featstore::FeatureStore);
//! every mutation writes the store atomically before touching engine state.
//! Retired cluster ids are kept as aliases so holders of a stale id can
//! follow [`ClusterEngine::canonical`] to the survivor.

mod cluster;
mod dbscan;
mod engine;
mod error;
mod events;
mod reconcile;

pub use cluster::Cluster;
pub use engine::{AssignOutcome, ClusterEngine, Config};
pub use error::VecIdError;
pub use events::{ClusterEvent, ClusterEventKind, EventSink, TracingSink};
pub use reconcile::{ReconcilePlan, ReconcileReport};
