//! Explicit wiring of the tracking and identity components.
//!
//! A [`Context`] owns the feature store, the identity index and the cluster
//! engine. Each camera gets its own [`TrackManager`](trackid_tracker::TrackManager)
//! from [`Context::track_manager`]; trackers search the shared index
//! directly and enqueue unresolved embeddings on a bounded channel that a
//! single [`IngestWorker`] drains. A full queue drops observations instead
//! of blocking the frame loop.
//!
//! ```no_run
//! use trackid_pipeline::{Context, PipelineConfig};
//! use trackid_tracker::{BBox, Detection};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let ctx = Context::new(PipelineConfig::from_yaml_file("trackid.yaml")?)?;
//! let worker = ctx.start()?;
//!
//! let mut cam = ctx.track_manager("lobby");
//! let det = Detection::new(1, BBox::new(10.0, 10.0, 50.0, 50.0), 0.9, "lobby", 1);
//! let frame = cam.update(&[det], 1)?;
//! println!("{} tracks", frame.updates.len());
//!
//! ctx.shutdown();
//! worker.await?;
//! # Ok(())
//! # }
//! ```

mod config;
mod context;
mod error;
mod worker;

pub use config::{PipelineConfig, WorkerConfig};
pub use context::Context;
pub use error::PipelineError;
pub use worker::IngestWorker;
