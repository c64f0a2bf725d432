use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use trackid_featstore::{
    ClusterId, Embedding, EmbeddingId, FeatureStore, MemoryStore, read_snapshot, write_snapshot,
};
use trackid_tracker::{Candidate, IdentityResolver, Observation, TrackManager, TrackerError};
use trackid_vecid::{AssignOutcome, ClusterEngine, ClusterEvent, EventSink, ReconcileReport, VecIdError};
use trackid_vecstore::{VecError, VecIndex, new_index};

use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::worker::IngestWorker;

/// Plans invalidated by concurrent writes are recomputed this many times.
const RECONCILE_ATTEMPTS: usize = 3;

/// Forwards cluster events to broadcast subscribers.
struct BroadcastSink {
    tx: broadcast::Sender<ClusterEvent>,
}

impl EventSink for BroadcastSink {
    fn emit(&self, event: &ClusterEvent) {
        info!(
            kind = ?event.kind,
            before = ?event.cluster_ids_before,
            after = ?event.cluster_ids_after,
            embeddings = event.embedding_ids.len(),
            "cluster event"
        );
        // No subscribers is fine.
        let _ = self.tx.send(event.clone());
    }
}

/// Explicit owner of the shared identity state.
///
/// Built once and handed to every camera's [`TrackManager`] as its
/// [`IdentityResolver`]. Camera threads only search and enqueue; all
/// writes go through the single writer path guarded by `writer`.
pub struct Context {
    cfg: PipelineConfig,
    store: Arc<dyn FeatureStore>,
    index: RwLock<Arc<dyn VecIndex>>,
    engine: Arc<ClusterEngine>,
    events: broadcast::Sender<ClusterEvent>,
    ingest_tx: mpsc::Sender<Observation>,
    ingest_rx: Mutex<Option<mpsc::Receiver<Observation>>>,
    next_embedding: AtomicU64,
    writer: Mutex<()>,
    cancel: CancellationToken,
}

impl Context {
    /// Creates a context over an empty in-memory store.
    pub fn new(cfg: PipelineConfig) -> Result<Arc<Self>, PipelineError> {
        let cfg = cfg.validate()?;
        let store: Arc<dyn FeatureStore> = Arc::new(MemoryStore::new(cfg.dim));
        Self::with_store(cfg, store)
    }

    /// Creates a context over an existing store. Clusters and the index
    /// are rebuilt from its content.
    pub fn with_store(cfg: PipelineConfig, store: Arc<dyn FeatureStore>) -> Result<Arc<Self>, PipelineError> {
        let cfg = cfg.validate()?;
        if store.dim() != cfg.dim {
            return Err(PipelineError::Config(format!(
                "store dimension {} does not match configured dim {}",
                store.dim(),
                cfg.dim
            )));
        }

        let (events, _) = broadcast::channel(cfg.pipeline.event_capacity);
        let engine = ClusterEngine::new(cfg.cluster.clone(), store.clone())
            .with_sink(Arc::new(BroadcastSink { tx: events.clone() }));
        let (ingest_tx, ingest_rx) = mpsc::channel(cfg.pipeline.queue_capacity);

        let ctx = Arc::new(Self {
            index: RwLock::new(new_index(cfg.dim, &cfg.index)),
            engine: Arc::new(engine),
            events,
            ingest_tx,
            ingest_rx: Mutex::new(Some(ingest_rx)),
            next_embedding: AtomicU64::new(1),
            writer: Mutex::new(()),
            cancel: CancellationToken::new(),
            store,
            cfg,
        });
        if !ctx.store.is_empty()? {
            ctx.reload()?;
        }
        Ok(ctx)
    }

    /// Spawns the ingest worker on the current tokio runtime. Can be
    /// called once.
    pub fn start(self: &Arc<Self>) -> Result<JoinHandle<()>, PipelineError> {
        let rx = self.ingest_rx.lock().take().ok_or(PipelineError::AlreadyStarted)?;
        let worker = IngestWorker::new(self.clone(), rx, self.cancel.child_token());
        Ok(tokio::spawn(worker.run()))
    }

    /// Stops the worker and any background pass in flight.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.cfg
    }

    pub fn store(&self) -> &Arc<dyn FeatureStore> {
        &self.store
    }

    /// The current index. Replaced wholesale by [`Context::rebuild_index`].
    pub fn index(&self) -> Arc<dyn VecIndex> {
        self.index.read().clone()
    }

    pub fn engine(&self) -> &Arc<ClusterEngine> {
        &self.engine
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClusterEvent> {
        self.events.subscribe()
    }

    /// A tracker for `camera_id` that resolves identities through this
    /// context.
    pub fn track_manager(self: &Arc<Self>, camera_id: impl Into<String>) -> TrackManager {
        TrackManager::new(camera_id, self.cfg.tracker.clone()).with_resolver(self.clone())
    }

    /// Stores, indexes and clusters one observation. This is the single
    /// writer path the ingest worker drives; it is public for synchronous
    /// callers and tests.
    pub fn ingest(&self, obs: &Observation) -> Result<(EmbeddingId, AssignOutcome), PipelineError> {
        let id = EmbeddingId(self.next_embedding.fetch_add(1, Ordering::Relaxed));
        let mut emb = Embedding::new(id, obs.embedding.clone(), obs.detection_id)?;
        if let Some(q) = obs.quality {
            emb = emb.with_quality(q);
        }
        let vector = emb.vector.clone();

        {
            let _w = self.writer.lock();
            self.store.put(emb)?;
            if let Err(err) = self.index().insert(id.0, &vector) {
                self.store.delete(id)?;
                return Err(err.into());
            }
        }

        let outcome = self.engine.assign(id, &vector)?;
        debug!(
            embedding = %id,
            camera = %obs.camera_id,
            track = obs.track_id,
            cluster = %outcome.cluster(),
            "observation ingested"
        );
        Ok((id, outcome))
    }

    /// Removes an embedding from the cluster engine, the index and the
    /// store, in that order. Every step is idempotent, so a failed call
    /// can simply be retried. Returns whether the store held `id`.
    pub fn delete_embedding(&self, id: EmbeddingId) -> Result<bool, PipelineError> {
        let _w = self.writer.lock();
        self.engine.remove_member(id)?;
        self.index().remove(id.0)?;
        let existed = self.store.delete(id)?.is_some();
        debug!(embedding = %id, existed, "embedding deleted");
        Ok(existed)
    }

    /// Builds a fresh index from the store and swaps it in. Returns the
    /// number of indexed embeddings.
    pub fn rebuild_index(&self) -> Result<usize, PipelineError> {
        let _w = self.writer.lock();
        self.rebuild_index_locked()
    }

    fn rebuild_index_locked(&self) -> Result<usize, PipelineError> {
        let records = self.store.all()?;
        let index = new_index(self.cfg.dim, &self.cfg.index);
        let ids: Vec<u64> = records.iter().map(|r| r.embedding.id.0).collect();
        let vectors: Vec<&[f32]> = records.iter().map(|r| r.embedding.vector.as_slice()).collect();
        index.batch_insert(&ids, &vectors)?;
        *self.index.write() = index;
        info!(embeddings = ids.len(), "index rebuilt");
        Ok(ids.len())
    }

    /// Checks index integrity, rebuilding on corruption, and compacts once
    /// removals pass the configured fraction. Blocking; the worker runs it
    /// off the async threads.
    pub fn maintain_index(&self) -> Result<(), PipelineError> {
        let index = self.index();
        match index.verify() {
            Ok(()) => {}
            Err(VecError::Corrupted(reason)) => {
                warn!(%reason, "index corrupted, rebuilding from store");
                self.rebuild_index()?;
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        }

        let deleted = index.deleted_fraction();
        if deleted > self.cfg.index.compact_fraction {
            debug!(deleted, "compacting index");
            index.compact()?;
        }
        Ok(())
    }

    /// Runs one batch reconciliation pass, recomputing the plan when
    /// concurrent writes invalidate it. Returns `None` if cancelled.
    pub fn reconcile(&self, cancel: &CancellationToken) -> Result<Option<ReconcileReport>, PipelineError> {
        let is_cancelled = || cancel.is_cancelled();
        for attempt in 1..=RECONCILE_ATTEMPTS {
            let plan = match self.engine.plan_reconcile(&is_cancelled) {
                Ok(plan) => plan,
                Err(VecIdError::Cancelled) => return Ok(None),
                Err(err) => return Err(err.into()),
            };
            if is_cancelled() {
                return Ok(None);
            }
            match self.engine.apply_reconcile(plan) {
                Ok(report) => return Ok(Some(report)),
                Err(VecIdError::Conflict { expected, found }) => {
                    debug!(attempt, expected, found, "reconcile plan went stale, retrying");
                }
                Err(err) => return Err(err.into()),
            }
        }
        Err(PipelineError::Contended(RECONCILE_ATTEMPTS))
    }

    /// Writes the store (embeddings and memberships) to `path`. The file
    /// is replaced atomically.
    pub fn save_snapshot(&self, path: impl AsRef<Path>) -> Result<(), PipelineError> {
        let path = path.as_ref();
        let snap = {
            let _w = self.writer.lock();
            self.store.snapshot()?
        };
        let tmp = path.with_extension("tmp");
        {
            let mut w = BufWriter::new(File::create(&tmp)?);
            write_snapshot(&snap, &mut w)?;
            w.flush()?;
        }
        std::fs::rename(&tmp, path)?;
        info!(path = %path.display(), embeddings = snap.records.len(), "snapshot saved");
        Ok(())
    }

    /// Replaces all state with the snapshot at `path`, then rebuilds
    /// clusters and the index from it.
    pub fn load_snapshot(&self, path: impl AsRef<Path>) -> Result<(), PipelineError> {
        let path = path.as_ref();
        let snap = read_snapshot(&mut BufReader::new(File::open(path)?))?;
        if snap.dim != self.cfg.dim {
            return Err(PipelineError::Config(format!(
                "snapshot dimension {} does not match configured dim {}",
                snap.dim, self.cfg.dim
            )));
        }
        let _w = self.writer.lock();
        self.store.restore(snap)?;
        self.reload_locked()?;
        info!(path = %path.display(), "snapshot loaded");
        Ok(())
    }

    fn reload(&self) -> Result<(), PipelineError> {
        let _w = self.writer.lock();
        self.reload_locked()
    }

    fn reload_locked(&self) -> Result<(), PipelineError> {
        self.engine.restore()?;
        self.rebuild_index_locked()?;
        let next = self.store.max_id()?.map_or(1, |id| id.0 + 1);
        self.next_embedding.fetch_max(next, Ordering::Relaxed);
        Ok(())
    }

    pub(crate) fn enqueue(&self, obs: Observation) -> bool {
        match self.ingest_tx.try_send(obs) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(obs)) => {
                debug!(camera = %obs.camera_id, track = obs.track_id, "ingest queue full");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

impl IdentityResolver for Context {
    fn search(&self, vector: &[f32], k: usize) -> Result<Vec<Candidate>, TrackerError> {
        let matches = self
            .index()
            .search(vector, k)
            .map_err(|err| TrackerError::Resolver(err.to_string()))?;
        Ok(matches
            .into_iter()
            .map(|m| Candidate {
                person: self.engine.cluster_of(EmbeddingId(m.id)),
                similarity: m.similarity,
            })
            .collect())
    }

    fn submit(&self, observation: Observation) -> bool {
        self.enqueue(observation)
    }

    fn canonical(&self, person: ClusterId) -> Option<ClusterId> {
        self.engine.canonical(person)
    }

    fn note_cooccurrence(&self, persons: &[ClusterId]) {
        self.engine.note_cooccurrence(persons);
    }
}
