//! JSON-lines recording format.
//!
//! One frame per line:
//!
//! ```json
//! {"camera_id":"lobby","timestamp":1000,"detections":[{"id":1,"bbox":[10,10,50,50],"confidence":0.9,"embedding":[0.1,0.2]}]}
//! ```

use anyhow::{Context as _, Result};
use serde::{Deserialize, Serialize};

use trackid_tracker::{BBox, Detection, TrackUpdate};
use trackid_vecid::ClusterEvent;

#[derive(Debug, Deserialize)]
pub struct Frame {
    pub camera_id: String,
    pub timestamp: i64,
    #[serde(default)]
    pub detections: Vec<FrameDetection>,
}

#[derive(Debug, Deserialize)]
pub struct FrameDetection {
    pub id: u64,
    /// x, y, w, h
    pub bbox: [f32; 4],
    #[serde(default = "default_confidence")]
    pub confidence: f32,
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
}

fn default_confidence() -> f32 {
    1.0
}

impl Frame {
    pub fn parse(line: &str) -> Result<Self> {
        serde_json::from_str(line).context("malformed frame")
    }

    pub fn detections(&self) -> Vec<Detection> {
        self.detections
            .iter()
            .map(|d| {
                let [x, y, w, h] = d.bbox;
                let det = Detection::new(d.id, BBox::new(x, y, w, h), d.confidence, &self.camera_id, self.timestamp);
                match &d.embedding {
                    Some(e) => det.with_embedding(e.clone()),
                    None => det,
                }
            })
            .collect()
    }
}

/// One output line.
#[derive(Debug, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Output<'a> {
    Track(&'a TrackUpdate),
    Cluster(&'a ClusterEvent),
}

impl Output<'_> {
    pub fn print(&self) -> Result<()> {
        println!("{}", serde_json::to_string(self)?);
        Ok(())
    }
}
