use std::collections::HashSet;
use std::io::{BufReader, BufWriter, Read, Write};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::types::{Assignment, ClusterId, Embedding, EmbeddingId, Record};

const SNAPSHOT_MAGIC: [u8; 4] = [b'T', b'K', b'F', b'S'];
const SNAPSHOT_VERSION: u32 = 1;

const TAG_PENDING: u8 = 0;
const TAG_MEMBER: u8 = 1;
const TAG_OUTLIER: u8 = 2;

/// Point-in-time copy of a feature store: the embedding table plus the
/// membership of every embedding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub dim: usize,
    pub records: Vec<Record>,
}

/// Serializes a snapshot in a compact binary format.
///
/// ```text
/// [4B magic "TKFS"] [4B version=1]
/// [4B dim] [8B record count]
/// For each record:
///   [8B embedding id] [8B source detection id] [8B created_at unix millis (i64)]
///   [1B has quality] [4B quality f32]
///   [1B assignment tag: 0 pending, 1 member, 2 outlier] [8B cluster id]
///   [1B pinned]
///   [dim x 4B float32 vector]
/// ```
///
/// All multi-byte values are little-endian. The cluster id slot is always
/// written and is zero unless the tag is "member".
pub fn write_snapshot(snap: &Snapshot, w: &mut dyn Write) -> Result<(), StoreError> {
    let mut bw = BufWriter::new(w);
    let write_err = |e: std::io::Error| StoreError::Io(e.to_string());

    bw.write_all(&SNAPSHOT_MAGIC).map_err(write_err)?;
    bw.write_all(&SNAPSHOT_VERSION.to_le_bytes()).map_err(write_err)?;
    bw.write_all(&(snap.dim as u32).to_le_bytes()).map_err(write_err)?;
    bw.write_all(&(snap.records.len() as u64).to_le_bytes()).map_err(write_err)?;

    for rec in &snap.records {
        let emb = &rec.embedding;
        if emb.vector.len() != snap.dim {
            return Err(StoreError::DimensionMismatch {
                id: emb.id,
                expected: snap.dim,
                got: emb.vector.len(),
            });
        }
        bw.write_all(&emb.id.0.to_le_bytes()).map_err(write_err)?;
        bw.write_all(&emb.source_detection_id.to_le_bytes()).map_err(write_err)?;
        bw.write_all(&emb.created_at.timestamp_millis().to_le_bytes()).map_err(write_err)?;

        let (has_q, q) = match emb.quality_score {
            Some(q) => (1u8, q),
            None => (0u8, 0.0f32),
        };
        bw.write_all(&[has_q]).map_err(write_err)?;
        bw.write_all(&q.to_le_bytes()).map_err(write_err)?;

        let (tag, cluster) = match rec.assignment {
            Assignment::Pending => (TAG_PENDING, 0u64),
            Assignment::Member(c) => (TAG_MEMBER, c.0),
            Assignment::Outlier => (TAG_OUTLIER, 0u64),
        };
        bw.write_all(&[tag]).map_err(write_err)?;
        bw.write_all(&cluster.to_le_bytes()).map_err(write_err)?;
        bw.write_all(&[rec.pinned as u8]).map_err(write_err)?;

        for &v in &emb.vector {
            bw.write_all(&v.to_le_bytes()).map_err(write_err)?;
        }
    }

    bw.flush().map_err(write_err)?;
    Ok(())
}

/// Deserializes a snapshot written by [`write_snapshot`].
///
/// Structural problems (bad magic, unknown version or tag, duplicate ids,
/// non-finite vectors) are reported as [`StoreError::InvalidFormat`].
pub fn read_snapshot(r: &mut dyn Read) -> Result<Snapshot, StoreError> {
    let mut br = BufReader::new(r);

    let mut magic = [0u8; 4];
    read_exact(&mut br, &mut magic)?;
    if magic != SNAPSHOT_MAGIC {
        return Err(StoreError::InvalidFormat(format!("invalid magic {magic:?}")));
    }

    let version = read_u32(&mut br)?;
    if version != SNAPSHOT_VERSION {
        return Err(StoreError::InvalidFormat(format!(
            "unsupported version {version} (want {SNAPSHOT_VERSION})"
        )));
    }

    let dim = read_u32(&mut br)? as usize;
    if dim == 0 {
        return Err(StoreError::InvalidFormat("invalid dimension 0".into()));
    }
    let count = read_u64(&mut br)? as usize;

    // Cap the preallocation; a corrupt count must not trigger a huge alloc.
    let mut records = Vec::with_capacity(count.min(1 << 16));
    let mut seen = HashSet::with_capacity(count.min(1 << 16));

    for _ in 0..count {
        let id = EmbeddingId(read_u64(&mut br)?);
        if !seen.insert(id) {
            return Err(StoreError::InvalidFormat(format!("duplicate embedding id {id}")));
        }
        let source_detection_id = read_u64(&mut br)?;
        let millis = read_u64(&mut br)? as i64;
        let created_at = DateTime::<Utc>::from_timestamp_millis(millis).ok_or_else(|| {
            StoreError::InvalidFormat(format!("embedding {id}: timestamp {millis} out of range"))
        })?;

        let has_q = read_u8(&mut br)?;
        let q = f32::from_le_bytes(read_array(&mut br)?);
        let quality_score = (has_q != 0).then_some(q);

        let tag = read_u8(&mut br)?;
        let cluster = read_u64(&mut br)?;
        let assignment = match tag {
            TAG_PENDING => Assignment::Pending,
            TAG_MEMBER => Assignment::Member(ClusterId(cluster)),
            TAG_OUTLIER => Assignment::Outlier,
            other => {
                return Err(StoreError::InvalidFormat(format!(
                    "embedding {id}: unknown assignment tag {other}"
                )));
            }
        };
        let pinned = read_u8(&mut br)? != 0;

        let mut vector = vec![0.0f32; dim];
        for v in &mut vector {
            *v = f32::from_le_bytes(read_array(&mut br)?);
            if !v.is_finite() {
                return Err(StoreError::InvalidFormat(format!(
                    "embedding {id}: non-finite vector component"
                )));
            }
        }

        records.push(Record {
            embedding: Embedding {
                id,
                vector,
                source_detection_id,
                created_at,
                quality_score,
            },
            assignment,
            pinned,
        });
    }

    Ok(Snapshot { dim, records })
}

fn read_exact(r: &mut impl Read, buf: &mut [u8]) -> Result<(), StoreError> {
    r.read_exact(buf).map_err(|e| StoreError::Io(e.to_string()))
}

fn read_array<const N: usize>(r: &mut impl Read) -> Result<[u8; N], StoreError> {
    let mut buf = [0u8; N];
    read_exact(r, &mut buf)?;
    Ok(buf)
}

fn read_u8(r: &mut impl Read) -> Result<u8, StoreError> {
    Ok(read_array::<1>(r)?[0])
}

fn read_u32(r: &mut impl Read) -> Result<u32, StoreError> {
    Ok(u32::from_le_bytes(read_array(r)?))
}

fn read_u64(r: &mut impl Read) -> Result<u64, StoreError> {
    Ok(u64::from_le_bytes(read_array(r)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::FeatureStore;

    fn sample_store() -> MemoryStore {
        let store = MemoryStore::new(3);
        store
            .put(Embedding::new(EmbeddingId(1), vec![1.0, 0.0, 0.0], 11).unwrap().with_quality(0.8))
            .unwrap();
        store
            .put(Embedding::new(EmbeddingId(2), vec![0.0, 1.0, 0.0], 12).unwrap())
            .unwrap();
        store
            .put(Embedding::new(EmbeddingId(3), vec![0.0, 0.0, 1.0], 13).unwrap())
            .unwrap();
        store
            .set_assignments(&[
                (EmbeddingId(1), Assignment::Member(ClusterId(4))),
                (EmbeddingId(3), Assignment::Outlier),
            ])
            .unwrap();
        store.set_pinned(EmbeddingId(1), true).unwrap();
        store
    }

    #[test]
    fn write_read() {
        let store = sample_store();
        let mut buf = Vec::new();
        write_snapshot(&store.snapshot().unwrap(), &mut buf).unwrap();

        let snap = read_snapshot(&mut buf.as_slice()).unwrap();
        assert_eq!(snap.dim, 3);
        assert_eq!(snap.records.len(), 3);

        let first = &snap.records[0];
        assert_eq!(first.embedding.id, EmbeddingId(1));
        assert_eq!(first.embedding.source_detection_id, 11);
        assert_eq!(first.embedding.quality_score, Some(0.8));
        assert_eq!(first.assignment, Assignment::Member(ClusterId(4)));
        assert!(first.pinned);
        assert_eq!(snap.records[1].assignment, Assignment::Pending);
        assert_eq!(snap.records[2].assignment, Assignment::Outlier);

        let restored = MemoryStore::new(3);
        restored.restore(snap).unwrap();
        assert_eq!(restored.cluster_members(ClusterId(4)).unwrap(), vec![EmbeddingId(1)]);
    }

    #[test]
    fn write_read_file() {
        let store = sample_store();
        let mut file = tempfile::tempfile().unwrap();
        write_snapshot(&store.snapshot().unwrap(), &mut file).unwrap();

        use std::io::{Seek, SeekFrom};
        file.seek(SeekFrom::Start(0)).unwrap();
        let snap = read_snapshot(&mut file).unwrap();
        assert_eq!(snap.records.len(), 3);
    }

    #[test]
    fn empty_snapshot() {
        let snap = Snapshot {
            dim: 8,
            records: Vec::new(),
        };
        let mut buf = Vec::new();
        write_snapshot(&snap, &mut buf).unwrap();
        let back = read_snapshot(&mut buf.as_slice()).unwrap();
        assert_eq!(back.dim, 8);
        assert!(back.records.is_empty());
    }

    #[test]
    fn invalid_magic() {
        let bad = b"NOPE\x01\x00\x00\x00";
        assert!(matches!(
            read_snapshot(&mut bad.as_slice()),
            Err(StoreError::InvalidFormat(_))
        ));
    }

    #[test]
    fn truncated_input() {
        let store = sample_store();
        let mut buf = Vec::new();
        write_snapshot(&store.snapshot().unwrap(), &mut buf).unwrap();
        buf.truncate(buf.len() - 5);
        assert!(matches!(read_snapshot(&mut buf.as_slice()), Err(StoreError::Io(_))));
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let store = sample_store();
        let mut buf = Vec::new();
        write_snapshot(&store.snapshot().unwrap(), &mut buf).unwrap();
        // Header is 20 bytes; tag of the first record follows 8+8+8+1+4 bytes.
        buf[20 + 29] = 9;
        assert!(matches!(
            read_snapshot(&mut buf.as_slice()),
            Err(StoreError::InvalidFormat(_))
        ));
    }
}
