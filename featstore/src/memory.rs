use std::collections::{BTreeMap, BTreeSet, HashMap};

use parking_lot::RwLock;

use crate::error::StoreError;
use crate::snapshot::Snapshot;
use crate::types::{Assignment, ClusterId, Embedding, EmbeddingId, Record};
use crate::FeatureStore;

/// In-memory [`FeatureStore`] implementation.
///
/// Durability comes from [`FeatureStore::snapshot`]; everything else is
/// lost on restart.
pub struct MemoryStore {
    dim: usize,
    inner: RwLock<MemoryStoreInner>,
}

#[derive(Default)]
struct MemoryStoreInner {
    records: BTreeMap<EmbeddingId, Record>,
    members: HashMap<ClusterId, BTreeSet<EmbeddingId>>,
}

impl MemoryStoreInner {
    fn unlink(&mut self, id: EmbeddingId, assignment: Assignment) {
        if let Assignment::Member(c) = assignment {
            if let Some(set) = self.members.get_mut(&c) {
                set.remove(&id);
                if set.is_empty() {
                    self.members.remove(&c);
                }
            }
        }
    }

    fn link(&mut self, id: EmbeddingId, assignment: Assignment) {
        if let Assignment::Member(c) = assignment {
            self.members.entry(c).or_default().insert(id);
        }
    }
}

impl MemoryStore {
    /// Creates an empty store. Panics if `dim` is 0.
    pub fn new(dim: usize) -> Self {
        assert!(dim > 0, "featstore: dim must be positive");
        Self {
            dim,
            inner: RwLock::new(MemoryStoreInner::default()),
        }
    }

    fn check_vector(&self, emb: &Embedding) -> Result<(), StoreError> {
        if emb.vector.len() != self.dim {
            return Err(StoreError::DimensionMismatch {
                id: emb.id,
                expected: self.dim,
                got: emb.vector.len(),
            });
        }
        if emb.vector.iter().any(|x| !x.is_finite()) {
            return Err(StoreError::InvalidVector {
                id: emb.id,
                reason: "non-finite component".into(),
            });
        }
        Ok(())
    }
}

impl FeatureStore for MemoryStore {
    fn dim(&self) -> usize {
        self.dim
    }

    fn put(&self, embedding: Embedding) -> Result<(), StoreError> {
        self.check_vector(&embedding)?;
        let mut inner = self.inner.write();
        if inner.records.contains_key(&embedding.id) {
            return Err(StoreError::Duplicate(embedding.id));
        }
        inner.records.insert(
            embedding.id,
            Record {
                embedding,
                assignment: Assignment::Pending,
                pinned: false,
            },
        );
        Ok(())
    }

    fn get(&self, id: EmbeddingId) -> Result<Option<Record>, StoreError> {
        Ok(self.inner.read().records.get(&id).cloned())
    }

    fn delete(&self, id: EmbeddingId) -> Result<Option<Record>, StoreError> {
        let mut inner = self.inner.write();
        let removed = inner.records.remove(&id);
        if let Some(rec) = &removed {
            inner.unlink(id, rec.assignment);
        }
        Ok(removed)
    }

    fn cluster_members(&self, cluster: ClusterId) -> Result<Vec<EmbeddingId>, StoreError> {
        let inner = self.inner.read();
        Ok(inner
            .members
            .get(&cluster)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default())
    }

    fn set_assignments(&self, updates: &[(EmbeddingId, Assignment)]) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        if let Some((missing, _)) = updates.iter().find(|(id, _)| !inner.records.contains_key(id)) {
            return Err(StoreError::NotFound(*missing));
        }
        for &(id, next) in updates {
            let prev = match inner.records.get_mut(&id) {
                Some(rec) => std::mem::replace(&mut rec.assignment, next),
                None => continue,
            };
            inner.unlink(id, prev);
            inner.link(id, next);
        }
        Ok(())
    }

    fn set_pinned(&self, id: EmbeddingId, pinned: bool) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let rec = inner.records.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        rec.pinned = pinned;
        Ok(())
    }

    fn all(&self) -> Result<Vec<Record>, StoreError> {
        Ok(self.inner.read().records.values().cloned().collect())
    }

    fn len(&self) -> Result<usize, StoreError> {
        Ok(self.inner.read().records.len())
    }

    fn max_id(&self) -> Result<Option<EmbeddingId>, StoreError> {
        Ok(self.inner.read().records.keys().next_back().copied())
    }

    fn snapshot(&self) -> Result<Snapshot, StoreError> {
        let inner = self.inner.read();
        Ok(Snapshot {
            dim: self.dim,
            records: inner.records.values().cloned().collect(),
        })
    }

    fn restore(&self, snapshot: Snapshot) -> Result<(), StoreError> {
        if snapshot.dim != self.dim {
            return Err(StoreError::InvalidFormat(format!(
                "snapshot dimension {} does not match store dimension {}",
                snapshot.dim, self.dim
            )));
        }
        // Validate fully before touching live state.
        let mut next = MemoryStoreInner::default();
        for rec in snapshot.records {
            self.check_vector(&rec.embedding)?;
            let id = rec.embedding.id;
            let assignment = rec.assignment;
            if next.records.insert(id, rec).is_some() {
                return Err(StoreError::Duplicate(id));
            }
            next.link(id, assignment);
        }
        *self.inner.write() = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emb(id: u64, v: &[f32]) -> Embedding {
        Embedding::new(EmbeddingId(id), v.to_vec(), id * 10).unwrap()
    }

    #[test]
    fn put_get_delete() {
        let store = MemoryStore::new(3);
        store.put(emb(1, &[1.0, 0.0, 0.0])).unwrap();
        store.put(emb(2, &[0.0, 2.0, 0.0])).unwrap();
        assert_eq!(store.len().unwrap(), 2);

        let rec = store.get(EmbeddingId(2)).unwrap().unwrap();
        assert_eq!(rec.assignment, Assignment::Pending);
        assert!(!rec.pinned);
        assert!((rec.embedding.vector[1] - 1.0).abs() < 1e-6);

        let removed = store.delete(EmbeddingId(1)).unwrap();
        assert!(removed.is_some());
        assert!(store.get(EmbeddingId(1)).unwrap().is_none());
        assert!(store.delete(EmbeddingId(1)).unwrap().is_none());
        assert_eq!(store.len().unwrap(), 1);
    }

    #[test]
    fn put_rejects_duplicates_and_wrong_dim() {
        let store = MemoryStore::new(3);
        store.put(emb(1, &[1.0, 0.0, 0.0])).unwrap();
        assert!(matches!(
            store.put(emb(1, &[0.0, 1.0, 0.0])),
            Err(StoreError::Duplicate(EmbeddingId(1)))
        ));
        assert!(matches!(
            store.put(emb(2, &[1.0, 0.0])),
            Err(StoreError::DimensionMismatch { expected: 3, got: 2, .. })
        ));
        assert_eq!(store.len().unwrap(), 1);
    }

    #[test]
    fn membership_reverse_mapping() {
        let store = MemoryStore::new(2);
        for i in 1..=3 {
            store.put(emb(i, &[1.0, i as f32])).unwrap();
        }
        let a = ClusterId(1);
        let b = ClusterId(2);
        store
            .set_assignments(&[
                (EmbeddingId(1), Assignment::Member(a)),
                (EmbeddingId(2), Assignment::Member(a)),
                (EmbeddingId(3), Assignment::Member(b)),
            ])
            .unwrap();
        assert_eq!(store.cluster_members(a).unwrap(), vec![EmbeddingId(1), EmbeddingId(2)]);

        // Move 2 from a to b.
        store
            .set_assignments(&[(EmbeddingId(2), Assignment::Member(b))])
            .unwrap();
        assert_eq!(store.cluster_members(a).unwrap(), vec![EmbeddingId(1)]);
        assert_eq!(store.cluster_members(b).unwrap(), vec![EmbeddingId(2), EmbeddingId(3)]);

        // Deleting cleans up membership.
        store.delete(EmbeddingId(3)).unwrap();
        assert_eq!(store.cluster_members(b).unwrap(), vec![EmbeddingId(2)]);

        store
            .set_assignments(&[(EmbeddingId(1), Assignment::Outlier)])
            .unwrap();
        assert!(store.cluster_members(a).unwrap().is_empty());
    }

    #[test]
    fn set_assignments_is_all_or_nothing() {
        let store = MemoryStore::new(2);
        store.put(emb(1, &[1.0, 0.0])).unwrap();
        let err = store
            .set_assignments(&[
                (EmbeddingId(1), Assignment::Member(ClusterId(5))),
                (EmbeddingId(99), Assignment::Member(ClusterId(5))),
            ])
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(EmbeddingId(99))));
        let rec = store.get(EmbeddingId(1)).unwrap().unwrap();
        assert_eq!(rec.assignment, Assignment::Pending);
        assert!(store.cluster_members(ClusterId(5)).unwrap().is_empty());
    }

    #[test]
    fn pin_and_max_id() {
        let store = MemoryStore::new(2);
        assert_eq!(store.max_id().unwrap(), None);
        store.put(emb(4, &[1.0, 0.0])).unwrap();
        store.put(emb(2, &[0.0, 1.0])).unwrap();
        assert_eq!(store.max_id().unwrap(), Some(EmbeddingId(4)));

        store.set_pinned(EmbeddingId(2), true).unwrap();
        assert!(store.get(EmbeddingId(2)).unwrap().unwrap().pinned);
        assert!(matches!(
            store.set_pinned(EmbeddingId(3), true),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn snapshot_restore() {
        let store = MemoryStore::new(2);
        store.put(emb(1, &[1.0, 0.0])).unwrap();
        store.put(emb(2, &[0.0, 1.0])).unwrap();
        store
            .set_assignments(&[(EmbeddingId(1), Assignment::Member(ClusterId(3)))])
            .unwrap();

        let snap = store.snapshot().unwrap();

        let other = MemoryStore::new(2);
        other.put(emb(9, &[1.0, 1.0])).unwrap();
        other.restore(snap).unwrap();
        assert_eq!(other.len().unwrap(), 2);
        assert!(other.get(EmbeddingId(9)).unwrap().is_none());
        assert_eq!(other.cluster_members(ClusterId(3)).unwrap(), vec![EmbeddingId(1)]);
    }

    #[test]
    fn restore_rejects_wrong_dim_without_clobbering() {
        let store = MemoryStore::new(2);
        store.put(emb(1, &[1.0, 0.0])).unwrap();
        let bad = Snapshot {
            dim: 3,
            records: Vec::new(),
        };
        assert!(store.restore(bad).is_err());
        assert_eq!(store.len().unwrap(), 1);
    }
}
