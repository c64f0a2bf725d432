use serde::{Deserialize, Serialize};

use crate::bbox::BBox;

/// One detector output for one frame. Ephemeral: consumed by
/// [`TrackManager::update`](crate::TrackManager::update) and not stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    /// Detector-assigned id, unique within the frame. Carried into
    /// embeddings as `source_detection_id`.
    pub id: u64,
    pub bbox: BBox,
    pub confidence: f32,
    pub camera_id: String,
    /// Milliseconds; must equal the frame timestamp it is submitted with.
    pub frame_timestamp: i64,

    /// Appearance embedding, when the encoder judged the crop worth
    /// resolving. Need not be normalized.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

impl Detection {
    pub fn new(id: u64, bbox: BBox, confidence: f32, camera_id: impl Into<String>, frame_timestamp: i64) -> Self {
        Self {
            id,
            bbox,
            confidence,
            camera_id: camera_id.into(),
            frame_timestamp,
            embedding: None,
        }
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    /// The embedding if it is present, non-empty and finite.
    pub(crate) fn usable_embedding(&self) -> Option<&[f32]> {
        self.embedding
            .as_deref()
            .filter(|v| !v.is_empty() && v.iter().all(|x| x.is_finite()) && v.iter().any(|x| *x != 0.0))
    }
}
