use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use trackid_featstore::ClusterId;

use crate::assignment::associate;
use crate::bbox::BBox;
use crate::detection::Detection;
use crate::error::TrackerError;
use crate::resolver::{IdentityResolver, Observation};
use crate::track::{Track, TrackStatus, TrackUpdate};

/// Controls one camera's tracker. Zero values are replaced by defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Matches below this IoU are discarded. Default: 0.3.
    pub iou_gate: f32,

    /// Consecutive hits before a track is confirmed. Default: 3.
    pub min_hits: u32,

    /// A track unmatched for more than this many frames is removed.
    /// Default: 30.
    pub max_age: u32,

    /// Minimum search similarity to attach an identity. Default: 0.6.
    pub match_threshold: f32,

    /// Neighbors requested per identity search. Default: 5.
    pub search_k: usize,

    /// Kalman process noise on position (velocity gets half). Default: 1.0.
    pub process_noise: f64,

    /// Kalman measurement noise, in squared pixels. Default: 4.0.
    pub measurement_noise: f64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            iou_gate: 0.3,
            min_hits: 3,
            max_age: 30,
            match_threshold: 0.6,
            search_k: 5,
            process_noise: 1.0,
            measurement_noise: 4.0,
        }
    }
}

impl TrackerConfig {
    pub fn with_defaults(mut self) -> Self {
        let d = TrackerConfig::default();
        if self.iou_gate == 0.0 {
            self.iou_gate = d.iou_gate;
        }
        if self.min_hits == 0 {
            self.min_hits = d.min_hits;
        }
        if self.max_age == 0 {
            self.max_age = d.max_age;
        }
        if self.match_threshold == 0.0 {
            self.match_threshold = d.match_threshold;
        }
        if self.search_k == 0 {
            self.search_k = d.search_k;
        }
        if self.process_noise <= 0.0 {
            self.process_noise = d.process_noise;
        }
        if self.measurement_noise <= 0.0 {
            self.measurement_noise = d.measurement_noise;
        }
        self
    }
}

/// Output of one [`TrackManager::update`] call.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct FrameResult {
    /// One entry per live track, plus a final entry for each track removed
    /// this frame. Ordered by track id.
    pub updates: Vec<TrackUpdate>,
    /// Detections dropped before association.
    pub rejected: Vec<TrackerError>,
    /// Tracks whose motion state diverged and was reset.
    pub reset: Vec<TrackerError>,
}

/// Multi-object tracker for a single camera.
///
/// Not shared between threads: each camera owns its manager and calls
/// [`update`](Self::update) once per frame.
pub struct TrackManager {
    camera_id: String,
    cfg: TrackerConfig,
    tracks: Vec<Track>,
    next_id: u64,
    last_timestamp: Option<i64>,
    resolver: Option<Arc<dyn IdentityResolver>>,
}

impl TrackManager {
    pub fn new(camera_id: impl Into<String>, cfg: TrackerConfig) -> Self {
        Self {
            camera_id: camera_id.into(),
            cfg: cfg.with_defaults(),
            tracks: Vec::new(),
            next_id: 1,
            last_timestamp: None,
            resolver: None,
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn IdentityResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn camera_id(&self) -> &str {
        &self.camera_id
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.cfg
    }

    /// Live tracks, ordered by id.
    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    pub fn track(&self, id: u64) -> Option<&Track> {
        self.tracks.iter().find(|t| t.id == id)
    }

    /// Processes one frame.
    ///
    /// Fails only if `timestamp` does not advance past the previous frame;
    /// in that case no track is touched.
    pub fn update(&mut self, detections: &[Detection], timestamp: i64) -> Result<FrameResult, TrackerError> {
        if let Some(last) = self.last_timestamp.filter(|&last| timestamp <= last) {
            return Err(TrackerError::OutOfOrder {
                camera_id: self.camera_id.clone(),
                last,
                got: timestamp,
            });
        }
        self.last_timestamp = Some(timestamp);

        let mut result = FrameResult::default();
        let detections = self.validate(detections, timestamp, &mut result.rejected);

        // Predict.
        for t in &mut self.tracks {
            if t.predict().is_err() {
                warn!(camera = %self.camera_id, track = t.id, "motion state diverged on predict, reseeding");
                t.reseed(&self.cfg);
                result.reset.push(TrackerError::Diverged {
                    camera_id: self.camera_id.clone(),
                    track_id: t.id,
                    frame_timestamp: timestamp,
                });
            }
        }

        // Associate.
        let predicted: Vec<BBox> = self.tracks.iter().map(|t| t.bbox).collect();
        let boxes: Vec<BBox> = detections.iter().map(|d| d.bbox).collect();
        let assoc = associate(&predicted, &boxes, self.cfg.iou_gate);

        // Correct. `observed` pairs a track index with the detection it saw.
        let mut observed: Vec<(usize, usize)> = Vec::with_capacity(assoc.matches.len());
        for &(ti, di) in &assoc.matches {
            let det = detections[di];
            let t = &mut self.tracks[ti];
            if t.correct(det, &self.cfg).is_err() {
                warn!(camera = %self.camera_id, track = t.id, "motion state diverged on correction, resetting");
                t.reset(det, &self.cfg);
                result.reset.push(TrackerError::Diverged {
                    camera_id: self.camera_id.clone(),
                    track_id: t.id,
                    frame_timestamp: timestamp,
                });
            }
            observed.push((ti, di));
        }

        // Age.
        for &ti in &assoc.unmatched_tracks {
            let t = &mut self.tracks[ti];
            t.mark_missed(&self.cfg);
            if t.status == TrackStatus::Removed {
                debug!(camera = %self.camera_id, track = t.id, misses = t.misses, "track removed");
            }
        }

        // Spawn.
        for &di in &assoc.unmatched_detections {
            let id = self.next_id;
            self.next_id += 1;
            self.tracks.push(Track::new(id, detections[di], &self.cfg));
            debug!(camera = %self.camera_id, track = id, detection = detections[di].id, "track created");
            observed.push((self.tracks.len() - 1, di));
        }

        if let Some(resolver) = self.resolver.clone() {
            self.canonicalize(resolver.as_ref());
            self.resolve(resolver.as_ref(), &detections, &observed, timestamp);
            self.report_cooccurrence(resolver.as_ref(), &observed);
        }

        result.updates = self.tracks.iter().map(|t| t.to_update(timestamp)).collect();
        result.updates.sort_by_key(|u| u.track_id);
        self.tracks.retain(|t| t.status != TrackStatus::Removed);

        debug!(
            camera = %self.camera_id,
            timestamp,
            detections = detections.len(),
            tracks = self.tracks.len(),
            "frame processed"
        );
        Ok(result)
    }

    fn validate<'a>(
        &self,
        detections: &'a [Detection],
        timestamp: i64,
        rejected: &mut Vec<TrackerError>,
    ) -> Vec<&'a Detection> {
        let mut valid = Vec::with_capacity(detections.len());
        for d in detections {
            let reason = if let Some(defect) = d.bbox.defect() {
                Some(defect.to_string())
            } else if d.camera_id != self.camera_id {
                Some(format!("belongs to camera {}", d.camera_id))
            } else if d.frame_timestamp != timestamp {
                Some(format!("stamped {} in frame {}", d.frame_timestamp, timestamp))
            } else if !d.confidence.is_finite() {
                Some("non-finite confidence".to_string())
            } else {
                None
            };
            match reason {
                None => valid.push(d),
                Some(reason) => {
                    warn!(camera = %self.camera_id, detection = d.id, timestamp, %reason, "detection rejected");
                    rejected.push(TrackerError::InvalidDetection {
                        camera_id: self.camera_id.clone(),
                        detection_id: d.id,
                        frame_timestamp: timestamp,
                        reason,
                    });
                }
            }
        }
        valid
    }

    /// Follows merges for already-resolved tracks. A dissolved identity is
    /// dropped so the track gets resolved again.
    fn canonicalize(&mut self, resolver: &dyn IdentityResolver) {
        for t in &mut self.tracks {
            let Some(person) = t.resolved_person_id else {
                continue;
            };
            let now = resolver.canonical(person);
            if now != Some(person) {
                debug!(camera = %self.camera_id, track = t.id, from = %person, to = ?now, "identity remapped");
                t.resolved_person_id = now;
            }
        }
    }

    fn resolve(
        &mut self,
        resolver: &dyn IdentityResolver,
        detections: &[&Detection],
        observed: &[(usize, usize)],
        timestamp: i64,
    ) {
        for &(ti, di) in observed {
            let t = &mut self.tracks[ti];
            if t.status != TrackStatus::Confirmed || t.resolved_person_id.is_some() {
                continue;
            }
            let det = detections[di];
            let Some(embedding) = det.usable_embedding() else {
                if det.embedding.is_some() {
                    warn!(camera = %self.camera_id, detection = det.id, "unusable embedding ignored");
                }
                continue;
            };

            match resolver.search(embedding, self.cfg.search_k) {
                Ok(candidates) => {
                    // Only the nearest neighbor counts; an unassigned top hit
                    // means the person has no cluster yet.
                    let hit = candidates
                        .first()
                        .filter(|c| c.similarity > self.cfg.match_threshold)
                        .and_then(|c| c.person.map(|p| (p, c.similarity)));
                    if let Some((person, similarity)) = hit {
                        debug!(camera = %self.camera_id, track = t.id, %person, similarity, "track resolved");
                        t.resolved_person_id = Some(person);
                        continue;
                    }
                }
                Err(err) => {
                    warn!(camera = %self.camera_id, track = t.id, error = %err, "identity search failed");
                }
            }

            let accepted = resolver.submit(Observation {
                camera_id: self.camera_id.clone(),
                track_id: t.id,
                detection_id: det.id,
                frame_timestamp: timestamp,
                embedding: embedding.to_vec(),
                quality: Some(det.confidence),
            });
            if !accepted {
                warn!(camera = %self.camera_id, track = t.id, detection = det.id, "ingest queue full, embedding dropped");
            }
        }
    }

    fn report_cooccurrence(&self, resolver: &dyn IdentityResolver, observed: &[(usize, usize)]) {
        let persons: BTreeSet<ClusterId> = observed
            .iter()
            .filter_map(|&(ti, _)| self.tracks[ti].resolved_person_id)
            .collect();
        if persons.len() >= 2 {
            let persons: Vec<ClusterId> = persons.into_iter().collect();
            resolver.note_cooccurrence(&persons);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::Candidate;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    const CAM: &str = "cam-1";

    fn det(id: u64, x: f32, y: f32, ts: i64) -> Detection {
        Detection::new(id, BBox::new(x, y, 50.0, 50.0), 0.9, CAM, ts)
    }

    fn manager() -> TrackManager {
        TrackManager::new(CAM, TrackerConfig::default())
    }

    #[test]
    fn scenario_a_keeps_id() {
        let mut m = manager();
        let r1 = m.update(&[det(1, 10.0, 10.0, 1)], 1).unwrap();
        assert_eq!(r1.updates.len(), 1);
        let id = r1.updates[0].track_id;

        let r2 = m.update(&[det(1, 12.0, 11.0, 2)], 2).unwrap();
        assert_eq!(r2.updates.len(), 1);
        assert_eq!(r2.updates[0].track_id, id);
        assert_eq!(m.track(id).unwrap().hits, 2);
        assert_eq!(m.track(id).unwrap().status, TrackStatus::Tentative);
    }

    #[test]
    fn confirmation_and_stability_under_motion() {
        let mut m = manager();
        let mut id = None;
        for ts in 1..=20 {
            let r = m.update(&[det(1, 10.0 + ts as f32 * 4.0, 10.0, ts)], ts).unwrap();
            assert_eq!(r.updates.len(), 1);
            let got = r.updates[0].track_id;
            assert_eq!(*id.get_or_insert(got), got, "id switched at frame {ts}");
        }
        assert_eq!(m.tracks()[0].status, TrackStatus::Confirmed);
        assert_eq!(m.tracks()[0].hits, 20);
    }

    #[test]
    fn two_objects_get_distinct_ids() {
        let mut m = manager();
        let r = m.update(&[det(1, 0.0, 0.0, 1), det(2, 300.0, 0.0, 1)], 1).unwrap();
        let ids: Vec<u64> = r.updates.iter().map(|u| u.track_id).collect();
        assert_eq!(ids, vec![1, 2]);

        // Detections arrive in the other order.
        let r = m.update(&[det(2, 302.0, 1.0, 2), det(1, 2.0, 1.0, 2)], 2).unwrap();
        let ids: Vec<u64> = r.updates.iter().map(|u| u.track_id).collect();
        assert_eq!(ids, vec![1, 2]);
        assert!(m.tracks().iter().all(|t| t.hits == 2));
    }

    #[test]
    fn removed_after_max_age_and_never_resurrected() {
        let cfg = TrackerConfig {
            max_age: 5,
            ..TrackerConfig::default()
        };
        let mut m = TrackManager::new(CAM, cfg);
        let id = m.update(&[det(1, 10.0, 10.0, 0)], 0).unwrap().updates[0].track_id;

        for ts in 1..=5 {
            let r = m.update(&[], ts).unwrap();
            assert_eq!(r.updates[0].status, TrackStatus::Tentative);
        }
        let r = m.update(&[], 6).unwrap();
        assert_eq!(r.updates.len(), 1);
        assert_eq!(r.updates[0].track_id, id);
        assert_eq!(r.updates[0].status, TrackStatus::Removed);
        assert!(m.tracks().is_empty());

        let r = m.update(&[det(1, 10.0, 10.0, 7)], 7).unwrap();
        assert_eq!(r.updates.len(), 1);
        assert_ne!(r.updates[0].track_id, id);
    }

    #[test]
    fn confirmed_track_goes_lost() {
        let mut m = manager();
        for ts in 1..=3 {
            m.update(&[det(1, 10.0, 10.0, ts)], ts).unwrap();
        }
        assert_eq!(m.tracks()[0].status, TrackStatus::Confirmed);
        let r = m.update(&[], 4).unwrap();
        assert_eq!(r.updates[0].status, TrackStatus::Lost);
        let r = m.update(&[det(1, 10.0, 10.0, 5)], 5).unwrap();
        assert_eq!(r.updates[0].status, TrackStatus::Confirmed);
    }

    #[test]
    fn out_of_order_is_rejected_without_side_effects() {
        let mut m = manager();
        m.update(&[det(1, 10.0, 10.0, 10)], 10).unwrap();
        let err = m.update(&[det(1, 10.0, 10.0, 10)], 10).unwrap_err();
        assert_eq!(
            err,
            TrackerError::OutOfOrder {
                camera_id: CAM.into(),
                last: 10,
                got: 10
            }
        );
        assert!(m.update(&[], 9).is_err());
        assert_eq!(m.tracks()[0].hits, 1);
        assert_eq!(m.tracks()[0].age, 0);
    }

    #[test]
    fn malformed_detections_are_skipped() {
        let mut m = manager();
        let mut nan = det(2, 0.0, 0.0, 1);
        nan.bbox.x = f32::NAN;
        let zero = Detection::new(3, BBox::new(0.0, 0.0, 0.0, 5.0), 0.9, CAM, 1);
        let other_cam = Detection::new(4, BBox::new(0.0, 0.0, 5.0, 5.0), 0.9, "cam-2", 1);
        let stale = det(5, 400.0, 0.0, 0);

        let r = m.update(&[det(1, 10.0, 10.0, 1), nan, zero, other_cam, stale], 1).unwrap();
        assert_eq!(r.updates.len(), 1);
        let rejected: Vec<u64> = r
            .rejected
            .iter()
            .map(|e| match e {
                TrackerError::InvalidDetection { detection_id, .. } => *detection_id,
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(rejected, vec![2, 3, 4, 5]);
    }

    #[test]
    fn diverged_track_resets_to_tentative() {
        let mut m = manager();
        for ts in 1..=3 {
            m.update(&[det(1, 10.0, 10.0, ts)], ts).unwrap();
        }
        let id = m.tracks()[0].id;
        m.tracks[0].kalman.covariance[(0, 0)] = f64::NAN;

        let r = m.update(&[det(1, 11.0, 10.0, 4)], 4).unwrap();
        assert_eq!(
            r.reset,
            vec![TrackerError::Diverged {
                camera_id: CAM.into(),
                track_id: id,
                frame_timestamp: 4
            }]
        );
        let t = m.track(id).unwrap();
        assert_eq!(t.status, TrackStatus::Tentative);
        assert!(t.kalman.is_finite());

        // The reseeded track keeps matching the same object.
        let r = m.update(&[det(1, 11.0, 10.0, 5)], 5).unwrap();
        assert_eq!(r.updates.len(), 1);
        assert_eq!(r.updates[0].track_id, id);
    }

    #[test]
    fn correction_divergence_resets_track() {
        let mut m = manager();
        for ts in 1..=3 {
            m.update(&[det(1, 10.0, 10.0, ts)], ts).unwrap();
        }
        let id = m.tracks()[0].id;
        assert_eq!(m.tracks()[0].status, TrackStatus::Confirmed);
        // Predict never reads R, so only the correction blows up.
        m.tracks[0].kalman.measurement_noise[(0, 0)] = f64::NAN;

        let r = m.update(&[det(9, 12.0, 10.0, 4)], 4).unwrap();
        assert_eq!(
            r.reset,
            vec![TrackerError::Diverged {
                camera_id: CAM.into(),
                track_id: id,
                frame_timestamp: 4
            }]
        );
        assert_eq!(r.updates.len(), 1);
        assert_eq!(r.updates[0].track_id, id);
        assert_eq!(r.updates[0].status, TrackStatus::Tentative);

        let t = m.track(id).unwrap();
        assert!(t.kalman.is_finite());
        assert_eq!(t.hits, 1);
        assert_eq!(t.bbox, BBox::new(12.0, 10.0, 50.0, 50.0));

        let r = m.update(&[det(9, 13.0, 10.0, 5)], 5).unwrap();
        assert!(r.reset.is_empty());
        assert_eq!(r.updates[0].track_id, id);
        assert_eq!(m.track(id).unwrap().hits, 2);
    }

    #[derive(Default)]
    struct FakeResolver {
        hits: Mutex<Vec<Candidate>>,
        submitted: Mutex<Vec<Observation>>,
        aliases: Mutex<HashMap<ClusterId, Option<ClusterId>>>,
        cooccurring: Mutex<Vec<Vec<ClusterId>>>,
    }

    impl IdentityResolver for FakeResolver {
        fn search(&self, _vector: &[f32], k: usize) -> Result<Vec<Candidate>, TrackerError> {
            Ok(self.hits.lock().iter().take(k).copied().collect())
        }

        fn submit(&self, observation: Observation) -> bool {
            self.submitted.lock().push(observation);
            true
        }

        fn canonical(&self, person: ClusterId) -> Option<ClusterId> {
            self.aliases.lock().get(&person).copied().unwrap_or(Some(person))
        }

        fn note_cooccurrence(&self, persons: &[ClusterId]) {
            self.cooccurring.lock().push(persons.to_vec());
        }
    }

    fn resolved_manager(resolver: &Arc<FakeResolver>) -> TrackManager {
        let cfg = TrackerConfig {
            min_hits: 1,
            ..TrackerConfig::default()
        };
        TrackManager::new(CAM, cfg).with_resolver(resolver.clone())
    }

    #[test]
    fn unresolved_embedding_is_submitted() {
        let resolver = Arc::new(FakeResolver::default());
        let mut m = resolved_manager(&resolver);

        let r = m
            .update(&[det(7, 10.0, 10.0, 1).with_embedding(vec![1.0, 0.0])], 1)
            .unwrap();
        assert_eq!(r.updates[0].resolved_person_id, None);

        let submitted = resolver.submitted.lock();
        assert_eq!(submitted.len(), 1);
        assert_eq!(submitted[0].detection_id, 7);
        assert_eq!(submitted[0].track_id, r.updates[0].track_id);
        assert_eq!(submitted[0].embedding, vec![1.0, 0.0]);
    }

    #[test]
    fn tentative_tracks_are_not_resolved() {
        let resolver = Arc::new(FakeResolver::default());
        let mut m = TrackManager::new(CAM, TrackerConfig::default()).with_resolver(resolver.clone());
        m.update(&[det(1, 10.0, 10.0, 1).with_embedding(vec![1.0, 0.0])], 1)
            .unwrap();
        assert!(resolver.submitted.lock().is_empty());
    }

    #[test]
    fn strong_match_attaches_identity() {
        let resolver = Arc::new(FakeResolver::default());
        resolver.hits.lock().extend([
            Candidate {
                person: Some(ClusterId(4)),
                similarity: 0.8,
            },
            Candidate {
                person: Some(ClusterId(6)),
                similarity: 0.7,
            },
        ]);
        let mut m = resolved_manager(&resolver);
        let r = m
            .update(&[det(1, 10.0, 10.0, 1).with_embedding(vec![0.0, 1.0])], 1)
            .unwrap();
        assert_eq!(r.updates[0].resolved_person_id, Some(ClusterId(4)));
        assert!(resolver.submitted.lock().is_empty());
    }

    #[test]
    fn unassigned_top_hit_is_submitted_not_skipped() {
        let resolver = Arc::new(FakeResolver::default());
        resolver.hits.lock().extend([
            Candidate {
                person: None,
                similarity: 0.98,
            },
            Candidate {
                person: Some(ClusterId(9)),
                similarity: 0.61,
            },
        ]);
        let mut m = resolved_manager(&resolver);
        let r = m
            .update(&[det(1, 10.0, 10.0, 1).with_embedding(vec![0.0, 1.0])], 1)
            .unwrap();
        assert_eq!(r.updates[0].resolved_person_id, None);
        let submitted = resolver.submitted.lock();
        assert_eq!(submitted.len(), 1);
        assert_eq!(submitted[0].detection_id, 1);
    }

    #[test]
    fn weak_match_is_submitted_instead() {
        let resolver = Arc::new(FakeResolver::default());
        resolver.hits.lock().push(Candidate {
            person: Some(ClusterId(4)),
            similarity: 0.6,
        });
        let mut m = resolved_manager(&resolver);
        let r = m
            .update(&[det(1, 10.0, 10.0, 1).with_embedding(vec![0.0, 1.0])], 1)
            .unwrap();
        assert_eq!(r.updates[0].resolved_person_id, None);
        assert_eq!(resolver.submitted.lock().len(), 1);
    }

    #[test]
    fn non_finite_embedding_is_ignored() {
        let resolver = Arc::new(FakeResolver::default());
        let mut m = resolved_manager(&resolver);
        m.update(&[det(1, 10.0, 10.0, 1).with_embedding(vec![f32::NAN, 1.0])], 1)
            .unwrap();
        assert!(resolver.submitted.lock().is_empty());
    }

    #[test]
    fn merged_identity_is_remapped() {
        let resolver = Arc::new(FakeResolver::default());
        resolver.hits.lock().push(Candidate {
            person: Some(ClusterId(2)),
            similarity: 0.9,
        });
        let mut m = resolved_manager(&resolver);
        m.update(&[det(1, 10.0, 10.0, 1).with_embedding(vec![1.0])], 1)
            .unwrap();

        resolver.aliases.lock().insert(ClusterId(2), Some(ClusterId(1)));
        let r = m.update(&[], 2).unwrap();
        assert_eq!(r.updates[0].resolved_person_id, Some(ClusterId(1)));

        // Dissolved: the identity is cleared and looked up again.
        resolver.aliases.lock().insert(ClusterId(1), None);
        resolver.hits.lock().clear();
        let r = m
            .update(&[det(1, 10.0, 10.0, 3).with_embedding(vec![1.0])], 3)
            .unwrap();
        assert_eq!(r.updates[0].resolved_person_id, None);
        assert_eq!(resolver.submitted.lock().len(), 1);
    }

    #[test]
    fn co_visible_identities_are_reported() {
        let resolver = Arc::new(FakeResolver::default());
        let mut m = resolved_manager(&resolver);

        resolver.hits.lock().push(Candidate {
            person: Some(ClusterId(3)),
            similarity: 0.9,
        });
        m.update(&[det(1, 0.0, 0.0, 1).with_embedding(vec![1.0])], 1)
            .unwrap();
        resolver.hits.lock()[0].person = Some(ClusterId(5));
        m.update(
            &[
                det(1, 0.0, 0.0, 2),
                det(2, 300.0, 0.0, 2).with_embedding(vec![1.0]),
            ],
            2,
        )
        .unwrap();

        assert_eq!(*resolver.cooccurring.lock(), vec![vec![ClusterId(3), ClusterId(5)]]);
    }
}
