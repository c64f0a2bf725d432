use std::collections::{BinaryHeap, HashMap, HashSet};
use std::time::Instant;

use parking_lot::RwLock;
use tracing::{debug, info};

use trackid_featstore::vector::normalized;

use crate::cosine::{distance, similarity};
use crate::error::VecError;
use crate::vecstore::{Match, VecIndex};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// HNSWConfig configures a new HNSW index.
#[derive(Debug, Clone)]
pub struct HNSWConfig {
    /// Vector dimension. Required; must be positive.
    pub dim: usize,
    /// Max connections per node per layer (except layer 0 which allows 2*M).
    /// Default: 16.
    pub m: usize,
    /// Size of the dynamic candidate list during index building.
    /// Default: 200.
    pub ef_construction: usize,
    /// Default size of the dynamic candidate list during search.
    /// Default: 50.
    pub ef_search: usize,
}

impl HNSWConfig {
    pub(crate) fn set_defaults(&mut self) {
        if self.m < 2 {
            self.m = 16;
        }
        if self.ef_construction == 0 {
            self.ef_construction = 200;
        }
        if self.ef_search == 0 {
            self.ef_search = 50;
        }
    }

    fn max_conns(&self, layer: usize) -> usize {
        if layer == 0 {
            self.m * 2
        } else {
            self.m
        }
    }
}

// ---------------------------------------------------------------------------
// Internal priority-queue types
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct DistItem {
    id: u32,
    dist: f32,
}

/// Min-heap: closest first.
impl Ord for DistItem {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .dist
            .partial_cmp(&self.dist)
            .unwrap_or(std::cmp::Ordering::Equal)
    }
}
impl PartialOrd for DistItem {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl PartialEq for DistItem {
    fn eq(&self, other: &Self) -> bool {
        self.dist == other.dist && self.id == other.id
    }
}
impl Eq for DistItem {}

/// Reversed for max-heap usage: farthest first.
#[derive(Clone)]
struct MaxDistItem {
    id: u32,
    dist: f32,
}

impl Ord for MaxDistItem {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.dist
            .partial_cmp(&other.dist)
            .unwrap_or(std::cmp::Ordering::Equal)
    }
}
impl PartialOrd for MaxDistItem {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl PartialEq for MaxDistItem {
    fn eq(&self, other: &Self) -> bool {
        self.dist == other.dist && self.id == other.id
    }
}
impl Eq for MaxDistItem {}

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

struct HnswNode {
    id: u64,
    vector: Vec<f32>,
    level: usize,
    friends: Vec<Vec<u32>>, // friends[layer] = neighbor internal IDs
    /// Tombstoned nodes keep routing searches but never appear in results.
    deleted: bool,
}

/// Writes that land while a compaction is rebuilding the graph.
enum JournalOp {
    Insert(u64, Vec<f32>),
    Remove(u64),
    Clear,
}

// ---------------------------------------------------------------------------
// Graph
// ---------------------------------------------------------------------------

struct HnswInner {
    cfg: HNSWConfig,
    nodes: Vec<HnswNode>,
    id_map: HashMap<u64, u32>, // live nodes only
    entry: Option<u32>,
    max_level: usize,
    tombstones: usize,
    level_mul: f64,
    journal: Option<Vec<JournalOp>>,
}

impl HnswInner {
    fn new(cfg: HNSWConfig) -> Self {
        let level_mul = 1.0 / (cfg.m as f64).ln();
        Self {
            cfg,
            nodes: Vec::new(),
            id_map: HashMap::new(),
            entry: None,
            max_level: 0,
            tombstones: 0,
            level_mul,
            journal: None,
        }
    }

    fn live(&self) -> usize {
        self.id_map.len()
    }

    fn random_level(&self) -> usize {
        let mut rng = rand::thread_rng();
        let r: f64 = rand::Rng::r#gen::<f64>(&mut rng).max(f64::MIN_POSITIVE);
        let level = (-r.ln() * self.level_mul) as usize;
        level.min(31)
    }

    /// Greedy walk from `cur` down through layers `top..=bottom`.
    fn greedy_descent(&self, query: &[f32], mut cur: u32, top: usize, bottom: usize) -> u32 {
        let mut cur_dist = distance(query, &self.nodes[cur as usize].vector);
        for lev in (bottom..=top).rev() {
            let mut changed = true;
            while changed {
                changed = false;
                let nd = &self.nodes[cur as usize];
                if lev >= nd.friends.len() {
                    break;
                }
                for &f_id in &nd.friends[lev] {
                    let Some(f_node) = self.nodes.get(f_id as usize) else {
                        continue;
                    };
                    let d = distance(query, &f_node.vector);
                    if d < cur_dist {
                        cur = f_id;
                        cur_dist = d;
                        changed = true;
                    }
                }
            }
        }
        cur
    }

    /// Beam search within one layer. With `live_only`, tombstoned nodes are
    /// traversed but never admitted to the result set.
    fn search_layer(
        &self,
        query: &[f32],
        entry_points: &[u32],
        ef: usize,
        layer: usize,
        live_only: bool,
    ) -> Vec<(u32, f32)> {
        let admit = |nd: &HnswNode| !live_only || !nd.deleted;
        let mut visited = HashSet::with_capacity(ef * 2);
        let mut candidates: BinaryHeap<DistItem> = BinaryHeap::new();
        let mut results: BinaryHeap<MaxDistItem> = BinaryHeap::new();

        for &ep in entry_points {
            let Some(nd) = self.nodes.get(ep as usize) else {
                continue;
            };
            if !visited.insert(ep) {
                continue;
            }
            let d = distance(query, &nd.vector);
            candidates.push(DistItem { id: ep, dist: d });
            if admit(nd) {
                results.push(MaxDistItem { id: ep, dist: d });
            }
        }
        while results.len() > ef {
            results.pop();
        }

        while let Some(closest) = candidates.pop() {
            if results.len() >= ef {
                if let Some(farthest) = results.peek() {
                    if closest.dist > farthest.dist {
                        break;
                    }
                }
            }

            let nd = &self.nodes[closest.id as usize];
            if layer >= nd.friends.len() {
                continue;
            }
            for &f_id in &nd.friends[layer] {
                if !visited.insert(f_id) {
                    continue;
                }
                let Some(f_node) = self.nodes.get(f_id as usize) else {
                    continue;
                };
                let d = distance(query, &f_node.vector);
                let should_add =
                    results.len() < ef || results.peek().map_or(true, |far| d < far.dist);
                if should_add {
                    candidates.push(DistItem { id: f_id, dist: d });
                    if admit(f_node) {
                        results.push(MaxDistItem { id: f_id, dist: d });
                        if results.len() > ef {
                            results.pop();
                        }
                    }
                }
            }
        }

        results.into_iter().map(|item| (item.id, item.dist)).collect()
    }

    fn select_closest(&self, query: &[f32], candidates: &[u32], max_n: usize) -> Vec<u32> {
        if candidates.len() <= max_n {
            return candidates.to_vec();
        }

        let mut items: Vec<(u32, f32)> = candidates
            .iter()
            .filter_map(|&c_id| {
                self.nodes
                    .get(c_id as usize)
                    .map(|nd| (c_id, distance(query, &nd.vector)))
            })
            .collect();

        items.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        items.truncate(max_n);
        items.into_iter().map(|(id, _)| id).collect()
    }

    /// Inserts an already-normalized vector, tombstoning any previous
    /// entry with the same id.
    fn insert_unit(&mut self, id: u64, vector: Vec<f32>) {
        self.tombstone(id);

        let idx = self.nodes.len() as u32;
        let level = self.random_level();
        self.nodes.push(HnswNode {
            id,
            vector,
            level,
            friends: vec![Vec::new(); level + 1],
            deleted: false,
        });
        self.id_map.insert(id, idx);

        // First node becomes the entry point.
        let Some(entry) = self.entry else {
            self.entry = Some(idx);
            self.max_level = level;
            return;
        };

        let query = self.nodes[idx as usize].vector.clone();

        // Phase 1: Greedy descent from top layer to level+1.
        let cur = self.greedy_descent(&query, entry, self.max_level, level + 1);

        // Phase 2: Beam search + connect at each layer.
        let top_insert = level.min(self.max_level);
        let ef_construction = self.cfg.ef_construction;

        let mut ep = vec![cur];
        for lev in (0..=top_insert).rev() {
            let candidates: Vec<u32> = self
                .search_layer(&query, &ep, ef_construction, lev, false)
                .into_iter()
                .map(|(c, _)| c)
                .filter(|&c| c != idx)
                .collect();
            let max_c = self.cfg.max_conns(lev);
            let neighbors = self.select_closest(&query, &candidates, max_c);

            self.nodes[idx as usize].friends[lev] = neighbors.clone();

            // Bidirectional connections + pruning.
            for &n_id in &neighbors {
                let needs_prune = {
                    let nn = &mut self.nodes[n_id as usize];
                    if lev < nn.friends.len() {
                        nn.friends[lev].push(idx);
                        nn.friends[lev].len() > max_c
                    } else {
                        false
                    }
                };
                if needs_prune {
                    let nn_vec = self.nodes[n_id as usize].vector.clone();
                    let nn_friends = self.nodes[n_id as usize].friends[lev].clone();
                    let pruned = self.select_closest(&nn_vec, &nn_friends, max_c);
                    self.nodes[n_id as usize].friends[lev] = pruned;
                }
            }

            if !candidates.is_empty() {
                ep = candidates;
            }
        }

        // Update entry point if new node is higher.
        if level > self.max_level {
            self.entry = Some(idx);
            self.max_level = level;
        }
    }

    fn tombstone(&mut self, id: u64) -> bool {
        let Some(idx) = self.id_map.remove(&id) else {
            return false;
        };
        if let Some(nd) = self.nodes.get_mut(idx as usize) {
            nd.deleted = true;
        }
        self.tombstones += 1;
        true
    }

    fn reset(&mut self) {
        let journal = self.journal.take();
        *self = HnswInner::new(self.cfg.clone());
        self.journal = journal;
    }

    fn apply(&mut self, op: JournalOp) {
        match op {
            JournalOp::Insert(id, v) => self.insert_unit(id, v),
            JournalOp::Remove(id) => {
                self.tombstone(id);
            }
            JournalOp::Clear => self.reset(),
        }
    }

    fn record(&mut self, op: impl FnOnce() -> JournalOp) {
        if let Some(journal) = self.journal.as_mut() {
            journal.push(op());
        }
    }

    fn live_entries(&self) -> Vec<(u64, Vec<f32>)> {
        self.nodes
            .iter()
            .filter(|nd| !nd.deleted)
            .map(|nd| (nd.id, nd.vector.clone()))
            .collect()
    }

    fn search_unit(&self, query: &[f32], top_k: usize) -> Result<Vec<Match>, VecError> {
        if self.live() == 0 || top_k == 0 {
            return Ok(vec![]);
        }
        let entry = match self.entry {
            Some(e) if (e as usize) < self.nodes.len() => e,
            _ => {
                return Err(VecError::Corrupted(format!(
                    "{} live entries but no valid entry point",
                    self.live()
                )));
            }
        };

        let ef = self.cfg.ef_search.max(top_k);

        // Phase 1: Greedy descent from top layer to layer 1.
        let cur = self.greedy_descent(query, entry, self.max_level, 1);

        // Phase 2: Beam search at layer 0.
        let mut results: Vec<Match> = self
            .search_layer(query, &[cur], ef, 0, true)
            .into_iter()
            .map(|(c, _)| {
                let nd = &self.nodes[c as usize];
                Match {
                    id: nd.id,
                    similarity: similarity(query, &nd.vector),
                }
            })
            .collect();

        results.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.id.cmp(&b.id))
        });
        results.truncate(top_k);
        Ok(results)
    }

    fn verify(&self) -> Result<(), VecError> {
        let n = self.nodes.len();
        for (&id, &idx) in &self.id_map {
            let nd = self
                .nodes
                .get(idx as usize)
                .ok_or_else(|| VecError::Corrupted(format!("id {id} maps to missing slot {idx}")))?;
            if nd.id != id || nd.deleted {
                return Err(VecError::Corrupted(format!(
                    "id {id} maps to slot {idx} holding {} (deleted={})",
                    nd.id, nd.deleted
                )));
            }
        }
        let live = self.nodes.iter().filter(|nd| !nd.deleted).count();
        if live != self.id_map.len() {
            return Err(VecError::Corrupted(format!(
                "{live} live nodes but {} mapped ids",
                self.id_map.len()
            )));
        }
        for (i, nd) in self.nodes.iter().enumerate() {
            if nd.vector.len() != self.cfg.dim {
                return Err(VecError::Corrupted(format!(
                    "slot {i}: vector dim {} (want {})",
                    nd.vector.len(),
                    self.cfg.dim
                )));
            }
            if nd.friends.len() != nd.level + 1 {
                return Err(VecError::Corrupted(format!(
                    "slot {i}: {} friend layers for level {}",
                    nd.friends.len(),
                    nd.level
                )));
            }
            if let Some(&f) = nd.friends.iter().flatten().find(|&&f| f as usize >= n) {
                return Err(VecError::Corrupted(format!(
                    "slot {i}: friend {f} out of bounds ({n} slots)"
                )));
            }
        }
        match self.entry {
            None if n > 0 => Err(VecError::Corrupted("missing entry point".into())),
            Some(e) if e as usize >= n => {
                Err(VecError::Corrupted(format!("entry point {e} out of bounds")))
            }
            _ => Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------
// HNSW
// ---------------------------------------------------------------------------

/// HNSW is a Hierarchical Navigable Small World index implementing [VecIndex].
///
/// Searches share a read lock; inserts and removals take a short write lock.
/// Removal tombstones the node: it keeps routing searches (so the graph
/// stays navigable) but is never returned. [`VecIndex::compact`] rebuilds
/// the graph from live nodes without holding the lock, replays writes that
/// arrived meanwhile, then swaps the new graph in.
pub struct HNSW {
    dim: usize,
    inner: RwLock<HnswInner>,
}

impl HNSW {
    /// Create an empty HNSW index with the given configuration.
    /// Panics if `cfg.dim` is not positive.
    pub fn new(mut cfg: HNSWConfig) -> Self {
        assert!(cfg.dim > 0, "vecstore: HNSWConfig.dim must be positive");
        cfg.set_defaults();
        Self {
            dim: cfg.dim,
            inner: RwLock::new(HnswInner::new(cfg)),
        }
    }

    /// Number of removed entries not yet reclaimed.
    pub fn tombstones(&self) -> usize {
        self.inner.read().tombstones
    }

    fn check_dim(&self, got: usize) -> Result<(), VecError> {
        if got != self.dim {
            return Err(VecError::DimensionMismatch { got, want: self.dim });
        }
        Ok(())
    }
}

impl VecIndex for HNSW {
    fn dim(&self) -> usize {
        self.dim
    }

    fn insert(&self, id: u64, vector: &[f32]) -> Result<(), VecError> {
        self.check_dim(vector.len())?;
        let v = normalized(vector).ok_or(VecError::InvalidVector { id: Some(id) })?;
        let mut inner = self.inner.write();
        inner.record(|| JournalOp::Insert(id, v.clone()));
        inner.insert_unit(id, v);
        Ok(())
    }

    fn search(&self, query: &[f32], top_k: usize) -> Result<Vec<Match>, VecError> {
        self.check_dim(query.len())?;
        let q = normalized(query).ok_or(VecError::InvalidVector { id: None })?;
        self.inner.read().search_unit(&q, top_k)
    }

    fn remove(&self, id: u64) -> Result<bool, VecError> {
        let mut inner = self.inner.write();
        let removed = inner.tombstone(id);
        if removed {
            inner.record(|| JournalOp::Remove(id));
        }
        Ok(removed)
    }

    fn contains(&self, id: u64) -> bool {
        self.inner.read().id_map.contains_key(&id)
    }

    fn ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.inner.read().id_map.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    fn len(&self) -> usize {
        self.inner.read().live()
    }

    fn clear(&self) {
        let mut inner = self.inner.write();
        inner.record(|| JournalOp::Clear);
        inner.reset();
    }

    fn deleted_fraction(&self) -> f32 {
        let inner = self.inner.read();
        if inner.nodes.is_empty() {
            return 0.0;
        }
        inner.tombstones as f32 / inner.nodes.len() as f32
    }

    fn compact(&self) -> Result<bool, VecError> {
        let (cfg, live, reclaimed) = {
            let mut inner = self.inner.write();
            if inner.journal.is_some() || inner.tombstones == 0 {
                return Ok(false);
            }
            inner.journal = Some(Vec::new());
            (inner.cfg.clone(), inner.live_entries(), inner.tombstones)
        };

        let started = Instant::now();
        let mut fresh = HnswInner::new(cfg);
        for (id, v) in live {
            fresh.insert_unit(id, v);
        }

        let mut inner = self.inner.write();
        let journal = inner.journal.take().unwrap_or_default();
        let replayed = journal.len();
        for op in journal {
            fresh.apply(op);
        }
        *inner = fresh;
        info!(
            live = inner.live(),
            reclaimed,
            replayed,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "vecstore: hnsw compacted"
        );
        debug!(max_level = inner.max_level, "vecstore: hnsw rebuilt graph");
        Ok(true)
    }

    fn verify(&self) -> Result<(), VecError> {
        self.inner.read().verify()
    }
}
