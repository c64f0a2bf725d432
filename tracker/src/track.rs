use std::fmt;

use serde::{Deserialize, Serialize};

use trackid_featstore::ClusterId;

use crate::bbox::BBox;
use crate::detection::Detection;
use crate::kalman::{Divergence, KalmanFilter};
use crate::manager::TrackerConfig;

/// Confidence multiplier applied per missed frame.
const MISS_DECAY: f32 = 0.95;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackStatus {
    /// Not yet matched `min_hits` times in a row.
    Tentative,
    Confirmed,
    /// Was confirmed, currently unmatched.
    Lost,
    /// Unmatched for more than `max_age` frames. Terminal.
    Removed,
}

impl fmt::Display for TrackStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TrackStatus::Tentative => "tentative",
            TrackStatus::Confirmed => "confirmed",
            TrackStatus::Lost => "lost",
            TrackStatus::Removed => "removed",
        };
        f.write_str(s)
    }
}

/// Emitted once per track per frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackUpdate {
    pub track_id: u64,
    pub camera_id: String,
    pub bbox: BBox,
    pub status: TrackStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_person_id: Option<ClusterId>,
    pub confidence: f32,
    pub frame_timestamp: i64,
}

/// One object followed across frames of a single camera.
#[derive(Debug, Clone)]
pub struct Track {
    pub id: u64,
    pub camera_id: String,
    /// Filtered centroid with the size of the last matched detection.
    pub bbox: BBox,
    pub(crate) kalman: KalmanFilter,
    /// Frames since creation.
    pub age: u32,
    /// Consecutive matched frames.
    pub hits: u32,
    /// Consecutive unmatched frames.
    pub misses: u32,
    pub status: TrackStatus,
    pub resolved_person_id: Option<ClusterId>,
    pub confidence: f32,
    pub last_timestamp: i64,
}

impl Track {
    pub(crate) fn new(id: u64, det: &Detection, cfg: &TrackerConfig) -> Self {
        let (cx, cy) = det.bbox.center();
        let status = if cfg.min_hits <= 1 {
            TrackStatus::Confirmed
        } else {
            TrackStatus::Tentative
        };
        Self {
            id,
            camera_id: det.camera_id.clone(),
            bbox: det.bbox,
            kalman: KalmanFilter::new(cx as f64, cy as f64, cfg.process_noise, cfg.measurement_noise),
            age: 0,
            hits: 1,
            misses: 0,
            status,
            resolved_person_id: None,
            confidence: det.confidence,
            last_timestamp: det.frame_timestamp,
        }
    }

    /// Advances the motion model one frame and moves the box with it.
    pub(crate) fn predict(&mut self) -> Result<(), Divergence> {
        self.kalman.predict();
        self.age += 1;
        if !self.kalman.is_finite() {
            return Err(Divergence);
        }
        self.sync_bbox(self.bbox.w, self.bbox.h);
        Ok(())
    }

    pub(crate) fn correct(&mut self, det: &Detection, cfg: &TrackerConfig) -> Result<(), Divergence> {
        let (cx, cy) = det.bbox.center();
        self.kalman.update(cx as f64, cy as f64)?;
        self.sync_bbox(det.bbox.w, det.bbox.h);
        self.hits += 1;
        self.misses = 0;
        self.confidence = det.confidence;
        self.last_timestamp = det.frame_timestamp;
        match self.status {
            TrackStatus::Lost => self.status = TrackStatus::Confirmed,
            TrackStatus::Tentative if self.hits >= cfg.min_hits => self.status = TrackStatus::Confirmed,
            _ => {}
        }
        Ok(())
    }

    /// Starts the motion state over from `det`. The id and any resolved
    /// identity are kept; the track must earn confirmation again.
    pub(crate) fn reset(&mut self, det: &Detection, cfg: &TrackerConfig) {
        let (cx, cy) = det.bbox.center();
        self.kalman = KalmanFilter::new(cx as f64, cy as f64, cfg.process_noise, cfg.measurement_noise);
        self.bbox = det.bbox;
        self.hits = 1;
        self.misses = 0;
        self.status = TrackStatus::Tentative;
        self.confidence = det.confidence;
        self.last_timestamp = det.frame_timestamp;
    }

    /// Re-seeds a diverged filter at the last known box.
    pub(crate) fn reseed(&mut self, cfg: &TrackerConfig) {
        let (cx, cy) = self.bbox.center();
        self.kalman = KalmanFilter::new(cx as f64, cy as f64, cfg.process_noise, cfg.measurement_noise);
        self.hits = 0;
        self.status = TrackStatus::Tentative;
    }

    pub(crate) fn mark_missed(&mut self, cfg: &TrackerConfig) {
        self.misses += 1;
        self.hits = 0;
        self.confidence *= MISS_DECAY;
        if self.misses > cfg.max_age {
            self.status = TrackStatus::Removed;
        } else if self.status == TrackStatus::Confirmed {
            self.status = TrackStatus::Lost;
        }
    }

    fn sync_bbox(&mut self, w: f32, h: f32) {
        let (cx, cy) = self.kalman.position();
        self.bbox = BBox::from_center(cx as f32, cy as f32, w, h);
    }

    pub(crate) fn to_update(&self, frame_timestamp: i64) -> TrackUpdate {
        TrackUpdate {
            track_id: self.id,
            camera_id: self.camera_id.clone(),
            bbox: self.bbox,
            status: self.status,
            resolved_person_id: self.resolved_person_id,
            confidence: self.confidence,
            frame_timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(x: f32, ts: i64) -> Detection {
        Detection::new(1, BBox::new(x, 10.0, 50.0, 50.0), 0.9, "cam", ts)
    }

    #[test]
    fn confirms_after_min_hits() {
        let cfg = TrackerConfig::default();
        let mut t = Track::new(1, &det(10.0, 0), &cfg);
        assert_eq!(t.status, TrackStatus::Tentative);
        for ts in 1..3 {
            t.predict().unwrap();
            t.correct(&det(10.0 + ts as f32, ts), &cfg).unwrap();
        }
        assert_eq!(t.hits, 3);
        assert_eq!(t.age, 2);
        assert_eq!(t.status, TrackStatus::Confirmed);
    }

    #[test]
    fn single_hit_confirms_immediately() {
        let cfg = TrackerConfig {
            min_hits: 1,
            ..TrackerConfig::default()
        };
        assert_eq!(Track::new(1, &det(0.0, 0), &cfg).status, TrackStatus::Confirmed);
    }

    #[test]
    fn lost_then_reacquired() {
        let cfg = TrackerConfig {
            min_hits: 1,
            ..TrackerConfig::default()
        };
        let mut t = Track::new(1, &det(10.0, 0), &cfg);
        t.predict().unwrap();
        t.mark_missed(&cfg);
        assert_eq!(t.status, TrackStatus::Lost);
        assert_eq!(t.hits, 0);
        assert!(t.confidence < 0.9);

        t.predict().unwrap();
        t.correct(&det(10.0, 2), &cfg).unwrap();
        assert_eq!(t.status, TrackStatus::Confirmed);
        assert_eq!(t.misses, 0);
    }

    #[test]
    fn removed_after_max_age() {
        let cfg = TrackerConfig {
            max_age: 2,
            ..TrackerConfig::default()
        };
        let mut t = Track::new(1, &det(10.0, 0), &cfg);
        t.mark_missed(&cfg);
        t.mark_missed(&cfg);
        assert_eq!(t.status, TrackStatus::Tentative);
        t.mark_missed(&cfg);
        assert_eq!(t.status, TrackStatus::Removed);
    }

    #[test]
    fn update_serializes_status_snake_case() {
        let cfg = TrackerConfig::default();
        let t = Track::new(7, &det(10.0, 0), &cfg);
        let json = serde_json::to_value(t.to_update(0)).unwrap();
        assert_eq!(json["status"], "tentative");
        assert_eq!(json["track_id"], 7);
        assert!(json.get("resolved_person_id").is_none());
    }
}
