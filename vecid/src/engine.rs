use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use trackid_featstore::vector::{dot, normalized};
use trackid_featstore::{Assignment, ClusterId, EmbeddingId, FeatureStore};
use trackid_vecstore::{MemoryIndex, VecIndex};

use crate::cluster::{Cluster, ClusterState};
use crate::error::VecIdError;
use crate::events::{ClusterEvent, ClusterEventKind, EventSink, TracingSink};

/// Nearest centroids a merge check inspects first. The window doubles
/// while every candidate above the threshold is cannot-linked.
const MERGE_FANOUT: usize = 4;

/// Controls clustering behavior. Zero values are replaced by defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Minimum similarity to the nearest centroid for an embedding to join
    /// that cluster instead of starting a new one. Default: 0.55.
    pub cluster_threshold: f32,

    /// Centroid similarity above which two clusters are merged.
    /// Default: 0.75.
    pub merge_threshold: f32,

    /// Members whose similarity to the centroid is more than this many
    /// standard deviations below the cluster mean are evicted. Default: 2.5.
    pub outlier_sigma: f32,

    /// Run pruning after this many assignments. Default: 200.
    pub prune_every: usize,

    /// Or after this many seconds, whichever comes first. Default: 60.
    pub prune_interval_secs: u64,

    /// Clusters smaller than this are never pruned. Default: 4.
    pub min_prune_members: usize,

    /// DBSCAN neighborhood radius, as a similarity. Default: 0.55.
    pub reconcile_similarity: f32,

    /// DBSCAN minimum neighborhood size (including the point). Default: 2.
    pub reconcile_min_samples: usize,

    /// Prepended to labels (e.g. "person" -> "person:001").
    pub prefix: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cluster_threshold: 0.55,
            merge_threshold: 0.75,
            outlier_sigma: 2.5,
            prune_every: 200,
            prune_interval_secs: 60,
            min_prune_members: 4,
            reconcile_similarity: 0.55,
            reconcile_min_samples: 2,
            prefix: "person".into(),
        }
    }
}

impl Config {
    fn with_defaults(mut self) -> Self {
        let d = Config::default();
        if self.cluster_threshold == 0.0 {
            self.cluster_threshold = d.cluster_threshold;
        }
        if self.merge_threshold == 0.0 {
            self.merge_threshold = d.merge_threshold;
        }
        if self.outlier_sigma == 0.0 {
            self.outlier_sigma = d.outlier_sigma;
        }
        if self.prune_every == 0 {
            self.prune_every = d.prune_every;
        }
        if self.prune_interval_secs == 0 {
            self.prune_interval_secs = d.prune_interval_secs;
        }
        if self.min_prune_members == 0 {
            self.min_prune_members = d.min_prune_members;
        }
        if self.reconcile_similarity == 0.0 {
            self.reconcile_similarity = d.reconcile_similarity;
        }
        if self.reconcile_min_samples == 0 {
            self.reconcile_min_samples = d.reconcile_min_samples;
        }
        if self.prefix.is_empty() {
            self.prefix = d.prefix;
        }
        self
    }
}

/// Result of [`ClusterEngine::assign`]. `cluster` is always the canonical
/// id after any merge the call triggered.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AssignOutcome {
    /// Joined an existing cluster whose centroid matched with `similarity`.
    Joined { cluster: ClusterId, similarity: f32 },
    /// Started a new cluster.
    Created { cluster: ClusterId },
    /// Already a member; nothing changed.
    Existing { cluster: ClusterId },
}

impl AssignOutcome {
    pub fn cluster(&self) -> ClusterId {
        match *self {
            AssignOutcome::Joined { cluster, .. }
            | AssignOutcome::Created { cluster }
            | AssignOutcome::Existing { cluster } => cluster,
        }
    }
}

pub(crate) struct EngineInner {
    pub(crate) cfg: Config,
    pub(crate) dim: usize,
    pub(crate) clusters: BTreeMap<ClusterId, ClusterState>,
    pub(crate) membership: HashMap<EmbeddingId, ClusterId>,
    centroids: MemoryIndex,
    /// Retired cluster id -> the cluster that absorbed it.
    aliases: HashMap<ClusterId, ClusterId>,
    /// Cannot-link evidence, stored symmetrically.
    pub(crate) cannot_link: HashMap<ClusterId, BTreeSet<ClusterId>>,
    next_id: u64,
    pub(crate) generation: u64,
    since_prune: usize,
    last_prune: Instant,
}

impl EngineInner {
    pub(crate) fn canonical(&self, id: ClusterId) -> Option<ClusterId> {
        let mut cur = id;
        for _ in 0..=self.aliases.len() {
            if self.clusters.contains_key(&cur) {
                return Some(cur);
            }
            cur = *self.aliases.get(&cur)?;
        }
        None
    }

    pub(crate) fn linked(&self, a: ClusterId, b: ClusterId) -> bool {
        self.cannot_link.get(&a).is_some_and(|s| s.contains(&b))
    }

    fn link(&mut self, a: ClusterId, b: ClusterId) {
        if a == b {
            return;
        }
        self.cannot_link.entry(a).or_default().insert(b);
        self.cannot_link.entry(b).or_default().insert(a);
    }

    pub(crate) fn alloc_id(&mut self) -> ClusterId {
        let id = ClusterId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Refresh a cluster's centroid and mirror it into the centroid index.
    pub(crate) fn refresh(&mut self, id: ClusterId) -> Result<(), VecIdError> {
        if let Some(c) = self.clusters.get_mut(&id) {
            c.refresh();
            self.centroids.insert(id.0, &c.centroid)?;
        }
        Ok(())
    }

    /// Drop a cluster. With `into`, stale references resolve to that
    /// cluster and its cannot-link evidence carries over.
    pub(crate) fn retire(
        &mut self,
        old: ClusterId,
        into: Option<ClusterId>,
    ) -> Result<(), VecIdError> {
        self.clusters.remove(&old);
        self.centroids.remove(old.0)?;
        if let Some(target) = into {
            self.aliases.insert(old, target);
            for v in self.aliases.values_mut() {
                if *v == old {
                    *v = target;
                }
            }
        }
        if let Some(links) = self.cannot_link.remove(&old) {
            for other in links {
                if let Some(set) = self.cannot_link.get_mut(&other) {
                    set.remove(&old);
                }
                if let Some(target) = into {
                    self.link(target, other);
                }
            }
        }
        Ok(())
    }

    /// Nearest live centroid at or above the join threshold, skipping
    /// `except`.
    fn nearest(
        &self,
        v: &[f32],
        except: Option<ClusterId>,
    ) -> Result<Option<(ClusterId, f32)>, VecIdError> {
        let k = if except.is_some() { 2 } else { 1 };
        let threshold = self.cfg.cluster_threshold;
        Ok(self
            .centroids
            .search(v, k)?
            .into_iter()
            .map(|m| (ClusterId(m.id), m.similarity))
            .find(|&(c, _)| Some(c) != except)
            .filter(|&(_, sim)| sim >= threshold))
    }

    /// Records `id` as a member of `target` in the store, then in memory.
    /// A `target` not yet live is created.
    fn join(
        &mut self,
        store: &dyn FeatureStore,
        id: EmbeddingId,
        v: &[f32],
        target: ClusterId,
    ) -> Result<(), VecIdError> {
        store.set_assignments(&[(id, Assignment::Member(target))])?;
        let dim = self.dim;
        self.clusters
            .entry(target)
            .or_insert_with(|| ClusterState::new(target, dim))
            .add(id, v);
        self.membership.insert(id, target);
        self.refresh(target)
    }

    /// Larger cluster wins; ties go to the older id.
    fn rank(&self, a: ClusterId, b: ClusterId) -> (ClusterId, ClusterId) {
        let size = |id| self.clusters.get(&id).map_or(0, |c| c.members.len());
        match size(a).cmp(&size(b)) {
            std::cmp::Ordering::Greater => (a, b),
            std::cmp::Ordering::Less => (b, a),
            std::cmp::Ordering::Equal if a < b => (a, b),
            std::cmp::Ordering::Equal => (b, a),
        }
    }

    fn merge(
        &mut self,
        store: &dyn FeatureStore,
        winner: ClusterId,
        loser: ClusterId,
        similarity: f32,
    ) -> Result<ClusterEvent, VecIdError> {
        let moved: Vec<EmbeddingId> = self
            .clusters
            .get(&loser)
            .map(|c| c.members.iter().copied().collect())
            .unwrap_or_default();
        let updates: Vec<(EmbeddingId, Assignment)> = moved
            .iter()
            .map(|&e| (e, Assignment::Member(winner)))
            .collect();
        store.set_assignments(&updates)?;

        if let Some(absorbed) = self.clusters.remove(&loser) {
            if let Some(w) = self.clusters.get_mut(&winner) {
                w.absorb(absorbed);
            }
        }
        for &e in &moved {
            self.membership.insert(e, winner);
        }
        self.retire(loser, Some(winner))?;
        self.refresh(winner)?;
        self.generation += 1;

        info!(%winner, %loser, similarity, moved = moved.len(), "vecid: merged clusters");
        Ok(ClusterEvent::new(
            ClusterEventKind::Merge,
            vec![winner, loser],
            vec![winner],
            moved,
        ))
    }

    /// Merge `start` with every cluster whose centroid exceeds the merge
    /// threshold, following the survivor. Returns the final survivor.
    fn merge_from(
        &mut self,
        store: &dyn FeatureStore,
        start: ClusterId,
        events: &mut Vec<ClusterEvent>,
    ) -> Result<ClusterId, VecIdError> {
        let mut current = start;
        loop {
            let Some((other, similarity)) = self.merge_partner(current)? else {
                return Ok(current);
            };
            let (winner, loser) = self.rank(current, other);
            events.push(self.merge(store, winner, loser, similarity)?);
            current = winner;
        }
    }

    /// Closest cluster above the merge threshold that `id` may merge with.
    fn merge_partner(&self, id: ClusterId) -> Result<Option<(ClusterId, f32)>, VecIdError> {
        let Some(cluster) = self.clusters.get(&id) else {
            return Ok(None);
        };
        let threshold = self.cfg.merge_threshold;
        let mut k = MERGE_FANOUT;
        loop {
            let hits = self.centroids.search(&cluster.centroid, k)?;
            let exhausted = hits.len() < k
                || hits.last().is_none_or(|m| m.similarity <= threshold)
                || k >= self.clusters.len();
            let partner = hits
                .into_iter()
                .filter(|m| m.id != id.0 && m.similarity > threshold)
                .map(|m| (ClusterId(m.id), m.similarity))
                .find(|&(other, _)| !self.linked(id, other));
            if partner.is_some() || exhausted {
                return Ok(partner);
            }
            k *= 2;
        }
    }
}

/// Groups embeddings into identity clusters.
///
/// Membership is owned by the [`FeatureStore`]; the engine keeps centroids,
/// merge aliases and cannot-link evidence. Every mutation writes the store
/// first (atomically) and only then updates in-memory state, all under the
/// engine's write lock.
pub struct ClusterEngine {
    pub(crate) store: Arc<dyn FeatureStore>,
    sink: Arc<dyn EventSink>,
    pub(crate) inner: RwLock<EngineInner>,
}

impl ClusterEngine {
    /// Creates an empty engine over `store`. Call [`ClusterEngine::restore`]
    /// when the store already holds memberships.
    pub fn new(cfg: Config, store: Arc<dyn FeatureStore>) -> Self {
        let dim = store.dim();
        Self {
            inner: RwLock::new(EngineInner {
                cfg: cfg.with_defaults(),
                dim,
                clusters: BTreeMap::new(),
                membership: HashMap::new(),
                centroids: MemoryIndex::new(dim),
                aliases: HashMap::new(),
                cannot_link: HashMap::new(),
                next_id: 1,
                generation: 0,
                since_prune: 0,
                last_prune: Instant::now(),
            }),
            store,
            sink: Arc::new(TracingSink),
        }
    }

    /// Replaces the event sink.
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn config(&self) -> Config {
        self.inner.read().cfg.clone()
    }

    pub fn store(&self) -> &Arc<dyn FeatureStore> {
        &self.store
    }

    pub(crate) fn emit(&self, events: &[ClusterEvent]) {
        for ev in events {
            self.sink.emit(ev);
        }
    }

    fn prepare(&self, id: EmbeddingId, vector: &[f32]) -> Result<Vec<f32>, VecIdError> {
        let dim = self.store.dim();
        if vector.len() != dim {
            return Err(VecIdError::DimensionMismatch {
                id,
                expected: dim,
                got: vector.len(),
            });
        }
        normalized(vector).ok_or(VecIdError::InvalidVector(id))
    }

    /// Assigns a stored embedding to the nearest cluster, or starts a new
    /// one, then merges any cluster that drifted within the merge
    /// threshold. Idempotent: assigning a member again changes nothing.
    pub fn assign(&self, id: EmbeddingId, vector: &[f32]) -> Result<AssignOutcome, VecIdError> {
        let v = self.prepare(id, vector)?;
        let mut events = Vec::new();

        let outcome = {
            let mut inner = self.inner.write();
            let record = self
                .store
                .get(id)?
                .ok_or(VecIdError::UnknownEmbedding(id))?;
            // Evicted outliers are unassigned and get placed again.
            if let Assignment::Member(c) = record.assignment {
                let cluster = inner.canonical(c).unwrap_or(c);
                return Ok(AssignOutcome::Existing { cluster });
            }

            let (target, similarity, created) = match inner.nearest(&v, None)? {
                Some((c, sim)) => (c, sim, false),
                None => (inner.alloc_id(), 1.0, true),
            };

            inner.join(self.store.as_ref(), id, &v, target)?;
            if created {
                events.push(ClusterEvent::new(
                    ClusterEventKind::Create,
                    vec![],
                    vec![target],
                    vec![id],
                ));
            }
            inner.generation += 1;
            inner.since_prune += 1;

            let cluster = inner.merge_from(self.store.as_ref(), target, &mut events)?;
            debug!(embedding = %id, %cluster, similarity, created, "vecid: assigned");
            if created {
                AssignOutcome::Created { cluster }
            } else {
                AssignOutcome::Joined {
                    cluster,
                    similarity,
                }
            }
        };

        self.emit(&events);
        Ok(outcome)
    }

    /// Current cluster of an embedding.
    pub fn cluster_of(&self, id: EmbeddingId) -> Option<ClusterId> {
        self.inner.read().membership.get(&id).copied()
    }

    /// Follows merge aliases from a possibly retired id to the live cluster
    /// that absorbed it. `None` once the cluster has dissolved.
    pub fn canonical(&self, id: ClusterId) -> Option<ClusterId> {
        self.inner.read().canonical(id)
    }

    pub fn cluster(&self, id: ClusterId) -> Option<Cluster> {
        self.inner.read().clusters.get(&id).map(ClusterState::view)
    }

    /// All live clusters, by ascending id.
    pub fn clusters(&self) -> Vec<Cluster> {
        self.inner
            .read()
            .clusters
            .values()
            .map(ClusterState::view)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().clusters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Monotonic counter bumped by every mutation.
    pub fn generation(&self) -> u64 {
        self.inner.read().generation
    }

    /// Human-readable label, e.g. "person:007".
    pub fn label(&self, id: ClusterId) -> String {
        format!("{}:{}", self.inner.read().cfg.prefix, id)
    }

    /// Marks an embedding as human-reviewed. Pinned embeddings are never
    /// moved by reconciliation nor evicted by pruning.
    pub fn pin(&self, id: EmbeddingId, pinned: bool) -> Result<(), VecIdError> {
        let mut inner = self.inner.write();
        self.store.set_pinned(id, pinned)?;
        inner.generation += 1;
        Ok(())
    }

    /// Records that these clusters were observed simultaneously (for
    /// example, as distinct live tracks in one frame) and must never merge.
    pub fn note_cooccurrence(&self, clusters: &[ClusterId]) {
        let mut inner = self.inner.write();
        let live: BTreeSet<ClusterId> = clusters
            .iter()
            .filter_map(|&c| inner.canonical(c))
            .collect();
        let live: Vec<ClusterId> = live.into_iter().collect();
        for (i, &a) in live.iter().enumerate() {
            for &b in &live[i + 1..] {
                if !inner.linked(a, b) {
                    debug!(%a, %b, "vecid: cannot-link recorded");
                    inner.link(a, b);
                }
            }
        }
    }

    /// Whether two clusters carry cannot-link evidence.
    pub fn cannot_link(&self, a: ClusterId, b: ClusterId) -> bool {
        let inner = self.inner.read();
        match (inner.canonical(a), inner.canonical(b)) {
            (Some(a), Some(b)) => inner.linked(a, b),
            _ => false,
        }
    }

    /// Drops an embedding from its cluster and resets it to pending in the
    /// store. Safe to repeat. A cluster left empty is dissolved.
    pub fn remove_member(&self, id: EmbeddingId) -> Result<bool, VecIdError> {
        let mut events = Vec::new();
        let removed = {
            let mut inner = self.inner.write();
            let Some(cid) = inner.membership.get(&id).copied() else {
                return Ok(false);
            };
            if self.store.get(id)?.is_some() {
                self.store.set_assignments(&[(id, Assignment::Pending)])?;
            }

            let remaining: Vec<EmbeddingId> = inner
                .clusters
                .get(&cid)
                .map(|c| c.members.iter().copied().filter(|&e| e != id).collect())
                .unwrap_or_default();
            let mut vectors = Vec::with_capacity(remaining.len());
            for e in &remaining {
                if let Some(rec) = self.store.get(*e)? {
                    vectors.push(rec.embedding.vector);
                }
            }

            inner.membership.remove(&id);
            if remaining.is_empty() {
                inner.retire(cid, None)?;
                events.push(ClusterEvent::new(
                    ClusterEventKind::Prune,
                    vec![cid],
                    vec![],
                    vec![id],
                ));
            } else {
                if let Some(c) = inner.clusters.get_mut(&cid) {
                    c.members.remove(&id);
                    c.rebuild(vectors.iter().map(Vec::as_slice));
                }
                inner.refresh(cid)?;
                inner.merge_from(self.store.as_ref(), cid, &mut events)?;
            }
            inner.generation += 1;
            debug!(embedding = %id, cluster = %cid, "vecid: member removed");
            true
        };
        self.emit(&events);
        Ok(removed)
    }

    /// Prunes if enough assignments or time have passed since the last run.
    pub fn maybe_prune(&self) -> Result<usize, VecIdError> {
        let due = {
            let inner = self.inner.read();
            inner.since_prune >= inner.cfg.prune_every
                || inner.last_prune.elapsed()
                    >= Duration::from_secs(inner.cfg.prune_interval_secs)
        };
        if due { self.prune() } else { Ok(0) }
    }

    /// Evicts members whose similarity to their centroid is more than
    /// `outlier_sigma` standard deviations below the cluster mean. An
    /// evicted embedding moves to another cluster it matches, otherwise it
    /// is left unassigned. Shifted centroids are checked for merges.
    /// Returns the number of evicted embeddings.
    pub fn prune(&self) -> Result<usize, VecIdError> {
        let mut events = Vec::new();
        let total = {
            let mut inner = self.inner.write();
            inner.since_prune = 0;
            inner.last_prune = Instant::now();

            let sigma = inner.cfg.outlier_sigma as f64;
            let min_members = inner.cfg.min_prune_members;
            let candidates: Vec<ClusterId> = inner
                .clusters
                .values()
                .filter(|c| c.members.len() >= min_members)
                .map(|c| c.id)
                .collect();

            let mut total = 0;
            for cid in candidates {
                let Some(cluster) = inner.clusters.get(&cid) else {
                    continue;
                };
                let centroid = cluster.centroid.clone();
                let mut rows = Vec::with_capacity(cluster.members.len());
                for &e in &cluster.members {
                    if let Some(rec) = self.store.get(e)? {
                        let sim = dot(&centroid, &rec.embedding.vector) as f64;
                        rows.push((e, rec.pinned, sim, rec.embedding.vector));
                    }
                }
                if rows.len() < 2 {
                    continue;
                }

                let n = rows.len() as f64;
                let mean = rows.iter().map(|r| r.2).sum::<f64>() / n;
                let var = rows.iter().map(|r| (r.2 - mean).powi(2)).sum::<f64>() / n;
                let std = var.sqrt();
                if std < 1e-6 {
                    continue;
                }
                let cutoff = mean - sigma * std;
                let evict: Vec<&(EmbeddingId, bool, f64, Vec<f32>)> = rows
                    .iter()
                    .filter(|r| !r.1 && r.2 < cutoff)
                    .collect();
                if evict.is_empty() || evict.len() >= rows.len() {
                    continue;
                }

                let updates: Vec<(EmbeddingId, Assignment)> =
                    evict.iter().map(|r| (r.0, Assignment::Outlier)).collect();
                self.store.set_assignments(&updates)?;
                if let Some(c) = inner.clusters.get_mut(&cid) {
                    for r in &evict {
                        c.remove(r.0, &r.3);
                    }
                }
                for r in &evict {
                    inner.membership.remove(&r.0);
                }
                inner.refresh(cid)?;
                inner.generation += 1;

                let mut after = vec![cid];
                for r in &evict {
                    if let Some((target, similarity)) = inner.nearest(&r.3, Some(cid))? {
                        inner.join(self.store.as_ref(), r.0, &r.3, target)?;
                        debug!(embedding = %r.0, from = %cid, to = %target, similarity, "vecid: outlier rehomed");
                        if !after.contains(&target) {
                            after.push(target);
                        }
                    }
                }

                let ids: Vec<EmbeddingId> = evict.iter().map(|r| r.0).collect();
                info!(cluster = %cid, evicted = ids.len(), mean, std, "vecid: pruned outliers");
                total += ids.len();
                events.push(ClusterEvent::new(
                    ClusterEventKind::Prune,
                    vec![cid],
                    after.clone(),
                    ids,
                ));
                for c in after {
                    inner.merge_from(self.store.as_ref(), c, &mut events)?;
                }
            }
            total
        };
        self.emit(&events);
        Ok(total)
    }

    /// Rebuilds clusters from the memberships recorded in the store, e.g.
    /// after a snapshot restore. Aliases and cannot-link evidence are reset.
    /// Returns the number of clusters.
    pub fn restore(&self) -> Result<usize, VecIdError> {
        let mut inner = self.inner.write();
        let records = self.store.all()?;
        let dim = inner.dim;

        let mut clusters: BTreeMap<ClusterId, ClusterState> = BTreeMap::new();
        let mut membership = HashMap::new();
        for rec in &records {
            let Assignment::Member(c) = rec.assignment else {
                continue;
            };
            let state = clusters.entry(c).or_insert_with(|| {
                let mut s = ClusterState::new(c, dim);
                s.created_at = rec.embedding.created_at;
                s
            });
            state.add(rec.embedding.id, &rec.embedding.vector);
            state.created_at = state.created_at.min(rec.embedding.created_at);
            membership.insert(rec.embedding.id, c);
        }

        inner.centroids.clear();
        for state in clusters.values_mut() {
            state.refresh();
            inner.centroids.insert(state.id.0, &state.centroid)?;
        }
        let max_id = clusters.keys().next_back().map_or(0, |c| c.0);
        inner.next_id = inner.next_id.max(max_id + 1);
        inner.clusters = clusters;
        inner.membership = membership;
        inner.aliases.clear();
        inner.cannot_link.clear();
        inner.generation += 1;
        inner.since_prune = 0;

        info!(clusters = inner.clusters.len(), embeddings = records.len(), "vecid: restored");
        Ok(inner.clusters.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use trackid_featstore::{Embedding, MemoryStore};

    #[derive(Default)]
    struct Collect(Mutex<Vec<ClusterEvent>>);

    impl EventSink for Collect {
        fn emit(&self, event: &ClusterEvent) {
            self.0.lock().push(event.clone());
        }
    }

    fn setup(cfg: Config, dim: usize) -> (Arc<MemoryStore>, ClusterEngine, Arc<Collect>) {
        let store = Arc::new(MemoryStore::new(dim));
        let sink = Arc::new(Collect::default());
        let engine = ClusterEngine::new(cfg, store.clone()).with_sink(sink.clone());
        (store, engine, sink)
    }

    fn put(store: &MemoryStore, id: u64, v: &[f32]) -> Vec<f32> {
        let emb = Embedding::new(EmbeddingId(id), v.to_vec(), id).unwrap();
        let vector = emb.vector.clone();
        store.put(emb).unwrap();
        vector
    }

    fn add(store: &MemoryStore, engine: &ClusterEngine, id: u64, v: &[f32]) -> AssignOutcome {
        let vector = put(store, id, v);
        engine.assign(EmbeddingId(id), &vector).unwrap()
    }

    /// Unit vector in the xy-plane with cos(angle to x-axis) = `cos`.
    fn at_cos(cos: f32) -> [f32; 3] {
        [cos, (1.0 - cos * cos).sqrt(), 0.0]
    }

    #[test]
    fn first_embedding_creates_cluster() {
        let (store, engine, sink) = setup(Config::default(), 3);
        let out = add(&store, &engine, 1, &[1.0, 0.0, 0.0]);
        assert_eq!(out, AssignOutcome::Created { cluster: ClusterId(1) });
        assert_eq!(engine.cluster_of(EmbeddingId(1)), Some(ClusterId(1)));
        assert_eq!(store.cluster_members(ClusterId(1)).unwrap(), vec![EmbeddingId(1)]);
        assert_eq!(engine.label(ClusterId(1)), "person:001");

        let events = sink.0.lock();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, ClusterEventKind::Create);
    }

    #[test]
    fn similar_embedding_joins() {
        let (store, engine, _) = setup(Config::default(), 3);
        add(&store, &engine, 1, &[1.0, 0.0, 0.0]);
        let out = add(&store, &engine, 2, &at_cos(0.9));
        match out {
            AssignOutcome::Joined { cluster, similarity } => {
                assert_eq!(cluster, ClusterId(1));
                approx::assert_relative_eq!(similarity, 0.9, epsilon = 1e-4);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        let clusters = engine.clusters();
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].members, vec![EmbeddingId(1), EmbeddingId(2)]);
    }

    #[test]
    fn dissimilar_embedding_creates_second_cluster() {
        let (store, engine, _) = setup(Config::default(), 3);
        add(&store, &engine, 1, &[1.0, 0.0, 0.0]);
        let out = add(&store, &engine, 2, &[0.0, 0.0, 1.0]);
        assert_eq!(out, AssignOutcome::Created { cluster: ClusterId(2) });
        assert_eq!(engine.len(), 2);
    }

    #[test]
    fn singletons_above_merge_threshold_collapse() {
        // A strict join threshold forces a second singleton; the merge
        // check then collapses the pair.
        let cfg = Config {
            cluster_threshold: 0.95,
            ..Config::default()
        };
        let (store, engine, sink) = setup(cfg, 3);
        add(&store, &engine, 1, &[1.0, 0.0, 0.0]);
        let out = add(&store, &engine, 2, &at_cos(0.9));
        assert_eq!(out, AssignOutcome::Created { cluster: ClusterId(1) });

        let clusters = engine.clusters();
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].members.len(), 2);
        assert_eq!(engine.canonical(ClusterId(2)), Some(ClusterId(1)));
        assert_eq!(
            store.get(EmbeddingId(2)).unwrap().unwrap().assignment,
            Assignment::Member(ClusterId(1))
        );

        let kinds: Vec<ClusterEventKind> = sink.0.lock().iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                ClusterEventKind::Create,
                ClusterEventKind::Create,
                ClusterEventKind::Merge
            ]
        );
    }

    #[test]
    fn assign_is_idempotent() {
        let (store, engine, _) = setup(Config::default(), 3);
        let v = put(&store, 1, &[0.2, 0.5, 0.1]);
        let first = engine.assign(EmbeddingId(1), &v).unwrap();
        let gen_before = engine.generation();
        let second = engine.assign(EmbeddingId(1), &v).unwrap();

        assert_eq!(second, AssignOutcome::Existing { cluster: first.cluster() });
        assert_eq!(engine.generation(), gen_before);
        assert_eq!(engine.clusters()[0].members, vec![EmbeddingId(1)]);
    }

    #[test]
    fn assign_rejects_bad_input() {
        let (store, engine, _) = setup(Config::default(), 3);
        assert!(matches!(
            engine.assign(EmbeddingId(1), &[1.0, 0.0]),
            Err(VecIdError::DimensionMismatch { expected: 3, got: 2, .. })
        ));
        assert!(matches!(
            engine.assign(EmbeddingId(1), &[1.0, 0.0, 0.0]),
            Err(VecIdError::UnknownEmbedding(EmbeddingId(1)))
        ));
        put(&store, 1, &[1.0, 0.0, 0.0]);
        assert!(matches!(
            engine.assign(EmbeddingId(1), &[0.0, 0.0, 0.0]),
            Err(VecIdError::InvalidVector(EmbeddingId(1)))
        ));
        assert!(engine.is_empty());
    }

    /// Cluster 2 starts at cos 0.7 from cluster 1 (below the merge
    /// threshold); one more member drags its centroid to cos ~0.78.
    fn drift_toward_first(link: bool) -> (Arc<MemoryStore>, ClusterEngine) {
        let cfg = Config {
            cluster_threshold: 0.95,
            ..Config::default()
        };
        let (store, engine, _) = setup(cfg, 3);
        add(&store, &engine, 1, &[1.0, 0.0, 0.0]);
        add(&store, &engine, 2, &at_cos(0.7));
        assert_eq!(engine.len(), 2);
        if link {
            engine.note_cooccurrence(&[ClusterId(1), ClusterId(2)]);
        }
        let out = add(&store, &engine, 3, &at_cos(0.85));
        assert!(matches!(out, AssignOutcome::Joined { .. }));
        (store, engine)
    }

    #[test]
    fn drifting_clusters_merge() {
        let (_, engine) = drift_toward_first(false);
        assert_eq!(engine.len(), 1);
        assert_eq!(engine.cluster_of(EmbeddingId(3)), Some(ClusterId(2)));
        assert_eq!(engine.canonical(ClusterId(1)), Some(ClusterId(2)));
    }

    #[test]
    fn cannot_link_blocks_merge() {
        let (_, engine) = drift_toward_first(true);
        assert!(engine.cannot_link(ClusterId(1), ClusterId(2)));
        assert_eq!(engine.len(), 2);
        assert_eq!(engine.cluster_of(EmbeddingId(1)), Some(ClusterId(1)));
        assert_eq!(engine.cluster_of(EmbeddingId(3)), Some(ClusterId(2)));
    }

    #[test]
    fn cannot_link_resolves_aliases() {
        let cfg = Config {
            cluster_threshold: 0.95,
            ..Config::default()
        };
        let (store, engine, _) = setup(cfg, 3);
        add(&store, &engine, 1, &[1.0, 0.0, 0.0]);
        add(&store, &engine, 2, &[0.0, 0.0, 1.0]);
        engine.note_cooccurrence(&[ClusterId(2), ClusterId(1)]);
        // Cluster 3 merges into cluster 1 (older id wins the size tie).
        add(&store, &engine, 3, &at_cos(0.9));
        assert_eq!(engine.canonical(ClusterId(3)), Some(ClusterId(1)));
        assert!(engine.cannot_link(ClusterId(3), ClusterId(2)));
    }

    #[test]
    fn prune_evicts_outlier() {
        let (store, engine, sink) = setup(Config::default(), 3);
        for id in 1..=9 {
            add(&store, &engine, id, &[1.0, 0.0, 0.0]);
        }
        // Joins (cos 0.6 >= 0.55) but sits far below the cluster mean.
        add(&store, &engine, 10, &[0.6, 0.0, 0.8]);
        assert_eq!(engine.clusters()[0].members.len(), 10);

        assert_eq!(engine.prune().unwrap(), 1);
        let rec = store.get(EmbeddingId(10)).unwrap().unwrap();
        assert_eq!(rec.assignment, Assignment::Outlier);
        assert_eq!(engine.cluster_of(EmbeddingId(10)), None);

        let c = &engine.clusters()[0];
        assert_eq!(c.members.len(), 9);
        approx::assert_relative_eq!(c.centroid[0], 1.0, epsilon = 1e-5);
        assert!(sink.0.lock().iter().any(|e| e.kind == ClusterEventKind::Prune));

        // Unassigned again: a better match elsewhere takes it.
        add(&store, &engine, 11, &[0.0, 0.0, 1.0]);
        let again = engine.assign(EmbeddingId(10), &rec.embedding.vector).unwrap();
        match again {
            AssignOutcome::Joined { cluster, similarity } => {
                assert_eq!(cluster, ClusterId(2));
                approx::assert_relative_eq!(similarity, 0.8, epsilon = 1e-5);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(
            store.get(EmbeddingId(10)).unwrap().unwrap().assignment,
            Assignment::Member(ClusterId(2))
        );
    }

    /// Engine over a store whose memberships are written directly.
    fn restored(cfg: Config, rows: &[(u64, [f32; 3], u64)]) -> (Arc<MemoryStore>, ClusterEngine, Arc<Collect>) {
        let (store, engine, sink) = setup(cfg, 3);
        for &(id, v, cluster) in rows {
            put(&store, id, &v);
            store
                .set_assignments(&[(EmbeddingId(id), Assignment::Member(ClusterId(cluster)))])
                .unwrap();
        }
        engine.restore().unwrap();
        (store, engine, sink)
    }

    #[test]
    fn pruned_outlier_moves_to_matching_cluster() {
        let mut rows: Vec<(u64, [f32; 3], u64)> = (1..=9).map(|id| (id, [1.0, 0.0, 0.0], 1)).collect();
        rows.push((10, [0.6, 0.0, 0.8], 1));
        rows.push((11, [0.0, 0.0, 1.0], 2));
        let (store, engine, sink) = restored(Config::default(), &rows);

        assert_eq!(engine.prune().unwrap(), 1);
        assert_eq!(engine.cluster_of(EmbeddingId(10)), Some(ClusterId(2)));
        assert_eq!(
            store.get(EmbeddingId(10)).unwrap().unwrap().assignment,
            Assignment::Member(ClusterId(2))
        );
        assert_eq!(engine.cluster(ClusterId(1)).unwrap().members.len(), 9);
        assert_eq!(
            engine.cluster(ClusterId(2)).unwrap().members,
            vec![EmbeddingId(10), EmbeddingId(11)]
        );

        let events = sink.0.lock();
        let prune = events
            .iter()
            .find(|e| e.kind == ClusterEventKind::Prune)
            .unwrap();
        assert_eq!(prune.cluster_ids_before, vec![ClusterId(1)]);
        assert_eq!(prune.cluster_ids_after, vec![ClusterId(1), ClusterId(2)]);
    }

    #[test]
    fn removal_that_shifts_centroid_triggers_merge() {
        // Cluster 2's centroid sits at cos ~0.57 from cluster 1 until its
        // far member leaves; the survivor is at cos 0.8.
        let rows = [
            (1, [1.0, 0.0, 0.0], 1),
            (2, [0.8, 0.6, 0.0], 2),
            (3, [0.0, 0.0, 1.0], 2),
        ];
        let (store, engine, sink) = restored(Config::default(), &rows);
        assert_eq!(engine.len(), 2);

        assert!(engine.remove_member(EmbeddingId(3)).unwrap());
        assert_eq!(engine.len(), 1);
        assert_eq!(engine.canonical(ClusterId(2)), Some(ClusterId(1)));
        assert_eq!(engine.cluster_of(EmbeddingId(2)), Some(ClusterId(1)));
        assert_eq!(
            store.get(EmbeddingId(2)).unwrap().unwrap().assignment,
            Assignment::Member(ClusterId(1))
        );
        assert_eq!(sink.0.lock().last().map(|e| e.kind), Some(ClusterEventKind::Merge));
    }

    #[test]
    fn merge_scans_past_cannot_linked_neighbors() {
        let cfg = Config {
            cluster_threshold: 0.999,
            merge_threshold: 0.999,
            ..Config::default()
        };
        let (store, engine, _) = setup(cfg, 3);
        add(&store, &engine, 1, &[1.0, 0.0, 0.0]);
        // Four clusters at cos 0.95 from cluster 1, spread around it.
        let r = (1.0f32 - 0.95 * 0.95).sqrt();
        for (id, (y, z)) in [(2, (r, 0.0)), (3, (0.0, r)), (4, (-r, 0.0)), (5, (0.0, -r))] {
            add(&store, &engine, id, &[0.95, y, z]);
        }
        // One further out at cos 0.9, between two of them.
        let s = (1.0f32 - 0.9 * 0.9).sqrt() * std::f32::consts::FRAC_1_SQRT_2;
        add(&store, &engine, 6, &[0.9, s, s]);
        assert_eq!(engine.len(), 6);

        let ids: Vec<ClusterId> = (1..=5).map(ClusterId).collect();
        engine.note_cooccurrence(&ids);
        engine.inner.write().cfg.merge_threshold = 0.85;

        // Joining cluster 1 runs its merge check; the four nearest
        // neighbors are all cannot-linked.
        let out = add(&store, &engine, 7, &[1.0, 0.0, 0.0]);
        assert_eq!(out.cluster(), ClusterId(1));
        assert_eq!(engine.len(), 5);
        assert_eq!(engine.canonical(ClusterId(6)), Some(ClusterId(1)));
        assert_eq!(engine.cluster_of(EmbeddingId(6)), Some(ClusterId(1)));
    }

    #[test]
    fn prune_spares_pinned_members() {
        let (store, engine, _) = setup(Config::default(), 3);
        for id in 1..=9 {
            add(&store, &engine, id, &[1.0, 0.0, 0.0]);
        }
        add(&store, &engine, 10, &[0.6, 0.0, 0.8]);
        engine.pin(EmbeddingId(10), true).unwrap();
        assert_eq!(engine.prune().unwrap(), 0);
        assert_eq!(engine.cluster_of(EmbeddingId(10)), Some(ClusterId(1)));
    }

    #[test]
    fn maybe_prune_waits_for_threshold() {
        let cfg = Config {
            prune_every: 3,
            prune_interval_secs: 3600,
            ..Config::default()
        };
        let (store, engine, _) = setup(cfg, 3);
        add(&store, &engine, 1, &[1.0, 0.0, 0.0]);
        let gen_before = engine.generation();
        assert_eq!(engine.maybe_prune().unwrap(), 0);
        assert_eq!(engine.generation(), gen_before);
        add(&store, &engine, 2, &[1.0, 0.0, 0.0]);
        add(&store, &engine, 3, &[1.0, 0.0, 0.0]);
        assert_eq!(engine.maybe_prune().unwrap(), 0);
        assert_eq!(engine.inner.read().since_prune, 0);
    }

    #[test]
    fn remove_member_dissolves_empty_cluster() {
        let (store, engine, sink) = setup(Config::default(), 3);
        add(&store, &engine, 1, &[1.0, 0.0, 0.0]);
        add(&store, &engine, 2, &[0.9, 0.1, 0.0]);
        add(&store, &engine, 3, &[0.0, 0.0, 1.0]);

        assert!(engine.remove_member(EmbeddingId(2)).unwrap());
        assert_eq!(engine.cluster(ClusterId(1)).unwrap().members, vec![EmbeddingId(1)]);
        assert_eq!(
            store.get(EmbeddingId(2)).unwrap().unwrap().assignment,
            Assignment::Pending
        );

        assert!(engine.remove_member(EmbeddingId(3)).unwrap());
        assert!(engine.cluster(ClusterId(2)).is_none());
        assert_eq!(engine.canonical(ClusterId(2)), None);
        assert!(!engine.remove_member(EmbeddingId(3)).unwrap());
        assert_eq!(sink.0.lock().last().map(|e| e.kind), Some(ClusterEventKind::Prune));
    }

    #[test]
    fn restore_rebuilds_from_store() {
        let (store, engine, _) = setup(Config::default(), 3);
        add(&store, &engine, 1, &[1.0, 0.0, 0.0]);
        add(&store, &engine, 2, &[0.0, 0.0, 1.0]);
        let snapshot = store.snapshot().unwrap();

        let store2 = Arc::new(MemoryStore::new(3));
        store2.restore(snapshot).unwrap();
        let engine2 = ClusterEngine::new(Config::default(), store2.clone());
        assert_eq!(engine2.restore().unwrap(), 2);
        assert_eq!(engine2.cluster_of(EmbeddingId(2)), Some(ClusterId(2)));

        // New clusters never reuse a restored id.
        let out = add(&store2, &engine2, 3, &[0.0, 1.0, 0.0]);
        assert_eq!(out, AssignOutcome::Created { cluster: ClusterId(3) });
    }

    #[test]
    fn config_zero_values_take_defaults() {
        let cfg = Config {
            cluster_threshold: 0.0,
            prune_every: 0,
            prefix: String::new(),
            ..Config::default()
        }
        .with_defaults();
        assert_eq!(cfg.cluster_threshold, 0.55);
        assert_eq!(cfg.prune_every, 200);
        assert_eq!(cfg.prefix, "person");
    }
}
