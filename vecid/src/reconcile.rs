//! Batch reconciliation: DBSCAN over the full embedding population, diffed
//! against the online clusters and applied in one step.
//!
//! Planning reads a snapshot and never mutates; applying happens under a
//! single write lock after a generation check. Cancelling or dropping a
//! plan therefore leaves the engine exactly as it was.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use tracing::{debug, info};

use trackid_featstore::{Assignment, ClusterId, EmbeddingId};

use crate::cluster::ClusterState;
use crate::dbscan::dbscan;
use crate::engine::ClusterEngine;
use crate::error::VecIdError;
use crate::events::{ClusterEvent, ClusterEventKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Target {
    Existing(ClusterId),
    /// Index of a DBSCAN group that inherits no current cluster.
    New(usize),
}

struct PlannedMove {
    embedding: EmbeddingId,
    from: Assignment,
    to: Target,
    vector: Vec<f32>,
}

/// Membership changes computed by [`ClusterEngine::plan_reconcile`].
pub struct ReconcilePlan {
    generation: u64,
    groups: usize,
    noise: usize,
    moves: Vec<PlannedMove>,
}

impl ReconcilePlan {
    /// Engine generation the plan was computed against.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Number of embeddings the plan moves.
    pub fn len(&self) -> usize {
        self.moves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.moves.is_empty()
    }

    /// DBSCAN groups found.
    pub fn groups(&self) -> usize {
        self.groups
    }

    /// Embeddings DBSCAN labelled as noise. They keep their assignment.
    pub fn noise(&self) -> usize {
        self.noise
    }
}

/// Outcome of an applied plan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub moved: usize,
    pub created: Vec<ClusterId>,
    pub dissolved: Vec<ClusterId>,
}

impl ClusterEngine {
    /// Computes a reconciliation plan without mutating anything.
    ///
    /// Conflict policy: each DBSCAN group inherits the current cluster most
    /// of its members belong to (largest groups choose first); pinned
    /// embeddings never move; noise keeps its assignment; moves between
    /// clusters with cannot-link evidence are skipped.
    pub fn plan_reconcile(
        &self,
        is_cancelled: &dyn Fn() -> bool,
    ) -> Result<ReconcilePlan, VecIdError> {
        let (generation, similarity, min_samples, links, records) = {
            let inner = self.inner.read();
            (
                inner.generation,
                inner.cfg.reconcile_similarity,
                inner.cfg.reconcile_min_samples,
                inner.cannot_link.clone(),
                self.store.all()?,
            )
        };
        if is_cancelled() {
            return Err(VecIdError::Cancelled);
        }

        let refs: Vec<&[f32]> = records
            .iter()
            .map(|r| r.embedding.vector.as_slice())
            .collect();
        let labels = dbscan(&refs, similarity, min_samples, is_cancelled)
            .ok_or(VecIdError::Cancelled)?;

        let mut groups: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        let mut noise = 0;
        for (i, label) in labels.iter().enumerate() {
            match label {
                Some(g) => groups.entry(*g).or_default().push(i),
                None => noise += 1,
            }
        }
        let mut ordered: Vec<Vec<usize>> = groups.into_values().collect();
        ordered.sort_by(|a, b| b.len().cmp(&a.len()).then(a[0].cmp(&b[0])));

        let linked = |a: ClusterId, b: ClusterId| links.get(&a).is_some_and(|s| s.contains(&b));
        let mut claimed: HashSet<ClusterId> = HashSet::new();
        let mut moves = Vec::new();
        let mut fresh = 0;
        for group in &ordered {
            if is_cancelled() {
                return Err(VecIdError::Cancelled);
            }

            let mut votes: BTreeMap<ClusterId, usize> = BTreeMap::new();
            for &i in group {
                if let Some(c) = records[i].assignment.cluster() {
                    *votes.entry(c).or_default() += 1;
                }
            }
            let inherited = votes
                .iter()
                .filter(|(c, _)| !claimed.contains(*c))
                .max_by(|a, b| a.1.cmp(b.1).then(b.0.cmp(a.0)))
                .map(|(c, _)| *c);
            let target = match inherited {
                Some(c) => {
                    claimed.insert(c);
                    Target::Existing(c)
                }
                None => {
                    fresh += 1;
                    Target::New(fresh - 1)
                }
            };

            for &i in group {
                let rec = &records[i];
                if rec.pinned {
                    continue;
                }
                if let (Target::Existing(t), Assignment::Member(c)) = (target, rec.assignment) {
                    if c == t || linked(c, t) {
                        continue;
                    }
                }
                moves.push(PlannedMove {
                    embedding: rec.embedding.id,
                    from: rec.assignment,
                    to: target,
                    vector: rec.embedding.vector.clone(),
                });
            }
        }

        debug!(
            generation,
            embeddings = records.len(),
            groups = ordered.len(),
            noise,
            moves = moves.len(),
            "vecid: reconcile planned"
        );
        Ok(ReconcilePlan {
            generation,
            groups: ordered.len(),
            noise,
            moves,
        })
    }

    /// Applies a plan atomically. Fails with [`VecIdError::Conflict`] if
    /// anything mutated the engine since the plan was computed.
    pub fn apply_reconcile(&self, plan: ReconcilePlan) -> Result<ReconcileReport, VecIdError> {
        let mut events = Vec::new();
        let report = {
            let mut inner = self.inner.write();
            if plan.generation != inner.generation {
                return Err(VecIdError::Conflict {
                    expected: plan.generation,
                    found: inner.generation,
                });
            }
            if plan.moves.is_empty() {
                return Ok(ReconcileReport::default());
            }

            let mut fresh: BTreeMap<usize, ClusterId> = BTreeMap::new();
            for mv in &plan.moves {
                if let Target::New(g) = mv.to {
                    if !fresh.contains_key(&g) {
                        let id = inner.alloc_id();
                        fresh.insert(g, id);
                    }
                }
            }
            let resolve = |t: Target| match t {
                Target::Existing(c) => c,
                Target::New(g) => fresh[&g],
            };

            let updates: Vec<(EmbeddingId, Assignment)> = plan
                .moves
                .iter()
                .map(|mv| (mv.embedding, Assignment::Member(resolve(mv.to))))
                .collect();
            self.store.set_assignments(&updates)?;

            let dim = inner.dim;
            let mut touched: BTreeSet<ClusterId> = BTreeSet::new();
            // target -> (source clusters, moved embeddings)
            let mut inflow: BTreeMap<ClusterId, (BTreeSet<ClusterId>, Vec<EmbeddingId>)> =
                BTreeMap::new();
            // source -> target -> count, used to alias dissolved clusters
            let mut outflow: BTreeMap<ClusterId, BTreeMap<ClusterId, usize>> = BTreeMap::new();

            for mv in &plan.moves {
                let to = resolve(mv.to);
                if let Assignment::Member(from) = mv.from {
                    if let Some(c) = inner.clusters.get_mut(&from) {
                        c.remove(mv.embedding, &mv.vector);
                    }
                    touched.insert(from);
                    *outflow.entry(from).or_default().entry(to).or_default() += 1;
                }
                inner
                    .clusters
                    .entry(to)
                    .or_insert_with(|| ClusterState::new(to, dim))
                    .add(mv.embedding, &mv.vector);
                inner.membership.insert(mv.embedding, to);
                touched.insert(to);

                let flow = inflow.entry(to).or_default();
                if let Some(from) = mv.from.cluster() {
                    flow.0.insert(from);
                }
                flow.1.push(mv.embedding);
            }

            let mut dissolved = Vec::new();
            for &c in &touched {
                let empty = inner.clusters.get(&c).is_none_or(|s| s.members.is_empty());
                if empty {
                    let into = outflow.get(&c).and_then(|m| {
                        m.iter()
                            .max_by(|a, b| a.1.cmp(b.1).then(b.0.cmp(a.0)))
                            .map(|(t, _)| *t)
                    });
                    inner.retire(c, into)?;
                    dissolved.push(c);
                } else {
                    inner.refresh(c)?;
                }
            }
            inner.generation += 1;

            let created: Vec<ClusterId> = fresh.values().copied().collect();
            for (to, (sources, ids)) in inflow {
                let sources: Vec<ClusterId> = sources.into_iter().filter(|&s| s != to).collect();
                let is_new = created.contains(&to);
                let kind = match (is_new, sources.is_empty()) {
                    (true, true) => ClusterEventKind::Create,
                    (true, false) => ClusterEventKind::Split,
                    (false, false) => ClusterEventKind::Merge,
                    // Only unassigned embeddings joined; topology unchanged.
                    (false, true) => continue,
                };
                let mut before = sources.clone();
                if !is_new {
                    before.push(to);
                }
                let mut after = vec![to];
                after.extend(
                    sources
                        .iter()
                        .copied()
                        .filter(|s| inner.clusters.contains_key(s)),
                );
                events.push(ClusterEvent::new(kind, before, after, ids));
            }

            info!(
                moved = plan.moves.len(),
                created = created.len(),
                dissolved = dissolved.len(),
                generation = inner.generation,
                "vecid: reconcile applied"
            );
            ReconcileReport {
                moved: plan.moves.len(),
                created,
                dissolved,
            }
        };

        self.emit(&events);
        Ok(report)
    }

    /// Plans and applies in one call. Cancellation before the apply step
    /// leaves the engine untouched.
    pub fn reconcile(&self, is_cancelled: &dyn Fn() -> bool) -> Result<ReconcileReport, VecIdError> {
        let plan = self.plan_reconcile(is_cancelled)?;
        if is_cancelled() {
            return Err(VecIdError::Cancelled);
        }
        self.apply_reconcile(plan)
    }
}
