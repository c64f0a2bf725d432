use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use trackid_tracker::Observation;

use crate::context::Context;

/// Single consumer of the ingest queue.
///
/// Observations are stored, indexed and clustered in arrival order.
/// Reconciliation and index maintenance run on blocking threads so the
/// queue keeps draining while they work; at most one of each is in
/// flight.
pub struct IngestWorker {
    ctx: Arc<Context>,
    rx: mpsc::Receiver<Observation>,
    cancel: CancellationToken,
    reconcile_job: Option<JoinHandle<()>>,
    maintain_job: Option<JoinHandle<()>>,
}

fn ticker(secs: u64) -> Interval {
    let period = Duration::from_secs(secs);
    let mut t = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    t.set_missed_tick_behavior(MissedTickBehavior::Delay);
    t
}

fn prune_if_due(ctx: &Context) {
    match ctx.engine().maybe_prune() {
        Ok(0) => {}
        Ok(evicted) => debug!(evicted, "outliers pruned"),
        Err(err) => warn!(error = %err, "prune failed"),
    }
}

fn busy(job: &Option<JoinHandle<()>>) -> bool {
    job.as_ref().is_some_and(|j| !j.is_finished())
}

impl IngestWorker {
    pub(crate) fn new(ctx: Arc<Context>, rx: mpsc::Receiver<Observation>, cancel: CancellationToken) -> Self {
        Self {
            ctx,
            rx,
            cancel,
            reconcile_job: None,
            maintain_job: None,
        }
    }

    pub async fn run(mut self) {
        let cfg = self.ctx.config().pipeline.clone();
        let mut reconcile_tick = ticker(cfg.reconcile_interval_secs);
        let mut maintain_tick = ticker(cfg.maintenance_interval_secs);
        info!(queue = cfg.queue_capacity, "ingest worker started");

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                obs = self.rx.recv() => match obs {
                    Some(obs) => self.handle(obs),
                    None => break,
                },
                _ = reconcile_tick.tick() => self.spawn_reconcile(),
                _ = maintain_tick.tick() => self.spawn_maintenance(),
            }
        }

        // Whatever was already queued is still ingested.
        let mut drained = 0usize;
        while let Ok(obs) = self.rx.try_recv() {
            self.handle(obs);
            drained += 1;
        }
        for job in [self.reconcile_job.take(), self.maintain_job.take()].into_iter().flatten() {
            if let Err(err) = job.await {
                warn!(error = %err, "background job failed");
            }
        }
        info!(drained, "ingest worker stopped");
    }

    fn handle(&mut self, obs: Observation) {
        match self.ctx.ingest(&obs) {
            Ok(_) => {}
            Err(err) => {
                warn!(
                    camera = %obs.camera_id,
                    track = obs.track_id,
                    detection = obs.detection_id,
                    error = %err,
                    "observation rejected"
                );
                return;
            }
        }
        prune_if_due(&self.ctx);
    }

    fn spawn_reconcile(&mut self) {
        if busy(&self.reconcile_job) {
            debug!("previous reconciliation still running, skipping");
            return;
        }
        let ctx = self.ctx.clone();
        let cancel = self.cancel.child_token();
        self.reconcile_job = Some(tokio::task::spawn_blocking(move || match ctx.reconcile(&cancel) {
            Ok(Some(report)) => info!(
                moved = report.moved,
                created = report.created.len(),
                dissolved = report.dissolved.len(),
                "reconciliation applied"
            ),
            Ok(None) => debug!("reconciliation cancelled"),
            Err(err) => warn!(error = %err, "reconciliation failed"),
        }));
    }

    fn spawn_maintenance(&mut self) {
        if busy(&self.maintain_job) {
            return;
        }
        let ctx = self.ctx.clone();
        self.maintain_job = Some(tokio::task::spawn_blocking(move || {
            if let Err(err) = ctx.maintain_index() {
                warn!(error = %err, "index maintenance failed");
            }
            // Time-based pruning must fire even when no ingest arrives.
            prune_if_due(&ctx);
        }));
    }
}
