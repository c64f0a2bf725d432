//! trackid-replay - feeds a JSON-lines detection recording through
//! per-camera trackers and the shared identity pipeline.
//!
//! Track updates and cluster events are written to stdout as JSON lines;
//! logs go to stderr (`RUST_LOG`, default `info`).

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{Context as _, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use trackid_pipeline::{Context, PipelineConfig};
use trackid_tracker::{TrackManager, TrackerError};
use trackid_vecid::ClusterEvent;

mod input;

use input::{Frame, Output};

#[derive(Parser)]
#[command(name = "trackid-replay")]
#[command(about = "Replay recorded detections through the tracking pipeline")]
#[command(version)]
struct Cli {
    /// Recording to replay, one JSON frame per line ("-" for stdin)
    input: String,

    /// Pipeline config (YAML)
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Embedding dimension, overriding the config
    #[arg(long)]
    dim: Option<usize>,

    /// Restore state from this snapshot before replaying
    #[arg(long)]
    restore: Option<PathBuf>,

    /// Save state to this snapshot after replaying
    #[arg(long)]
    save: Option<PathBuf>,

    /// Run a batch reconciliation pass at the end
    #[arg(long)]
    reconcile: bool,

    /// Debug logging
    #[arg(short = 'v', long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let mut cfg = match &cli.config {
        Some(path) => PipelineConfig::from_yaml_file(path)
            .with_context(|| format!("load config {}", path.display()))?,
        None => PipelineConfig::default(),
    };
    if let Some(dim) = cli.dim {
        cfg.dim = dim;
    }

    let ctx = Context::new(cfg)?;
    if let Some(path) = &cli.restore {
        ctx.load_snapshot(path)
            .with_context(|| format!("restore {}", path.display()))?;
    }
    let mut events = ctx.subscribe();
    let worker = ctx.start()?;

    let reader: Box<dyn tokio::io::AsyncRead + Unpin> = if cli.input == "-" {
        Box::new(tokio::io::stdin())
    } else {
        Box::new(
            tokio::fs::File::open(&cli.input)
                .await
                .with_context(|| format!("open {}", cli.input))?,
        )
    };
    let mut lines = BufReader::new(reader).lines();

    let mut cameras: HashMap<String, TrackManager> = HashMap::new();
    let mut frames = 0usize;
    let mut lineno = 0usize;
    while let Some(line) = lines.next_line().await? {
        lineno += 1;
        if line.trim().is_empty() {
            continue;
        }
        let frame = match Frame::parse(&line) {
            Ok(f) => f,
            Err(err) => {
                warn!(line = lineno, error = %err, "skipping line");
                continue;
            }
        };

        let tracker = cameras
            .entry(frame.camera_id.clone())
            .or_insert_with(|| ctx.track_manager(frame.camera_id.clone()));
        match tracker.update(&frame.detections(), frame.timestamp) {
            Ok(result) => {
                for u in &result.updates {
                    Output::Track(u).print()?;
                }
            }
            Err(err @ TrackerError::OutOfOrder { .. }) => {
                warn!(line = lineno, error = %err, "frame skipped");
            }
            Err(err) => return Err(err.into()),
        }
        frames += 1;
        drain(&mut events)?;
        tokio::task::yield_now().await;
    }

    ctx.shutdown();
    worker.await.context("ingest worker panicked")?;
    drain(&mut events)?;

    if cli.reconcile {
        let pass = ctx.clone();
        let token = CancellationToken::new();
        let report = tokio::task::spawn_blocking(move || pass.reconcile(&token)).await??;
        if let Some(report) = report {
            info!(moved = report.moved, created = report.created.len(), dissolved = report.dissolved.len(), "reconciled");
        }
        drain(&mut events)?;
    }

    if let Some(path) = &cli.save {
        ctx.save_snapshot(path)
            .with_context(|| format!("save {}", path.display()))?;
    }

    info!(
        frames,
        cameras = cameras.len(),
        embeddings = ctx.store().len()?,
        clusters = ctx.engine().len(),
        "replay finished"
    );
    Ok(())
}

fn drain(events: &mut broadcast::Receiver<ClusterEvent>) -> Result<()> {
    loop {
        match events.try_recv() {
            Ok(ev) => Output::Cluster(&ev).print()?,
            Err(broadcast::error::TryRecvError::Lagged(n)) => warn!(missed = n, "cluster events dropped"),
            Err(_) => return Ok(()),
        }
    }
}
