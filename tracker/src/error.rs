use thiserror::Error;

/// Errors reported by a [`TrackManager`](crate::TrackManager).
///
/// Only [`TrackerError::OutOfOrder`] fails a whole frame. The others are
/// collected in the frame result and the frame proceeds without the
/// offending input.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TrackerError {
    #[error(
        "tracker: invalid detection {detection_id} on camera {camera_id} at {frame_timestamp}: {reason}"
    )]
    InvalidDetection {
        camera_id: String,
        detection_id: u64,
        frame_timestamp: i64,
        reason: String,
    },

    #[error("tracker: out-of-order frame on camera {camera_id}: {got} is not after {last}")]
    OutOfOrder {
        camera_id: String,
        last: i64,
        got: i64,
    },

    #[error("tracker: track {track_id} on camera {camera_id} diverged at {frame_timestamp}")]
    Diverged {
        camera_id: String,
        track_id: u64,
        frame_timestamp: i64,
    },

    #[error("tracker: identity lookup failed: {0}")]
    Resolver(String),
}
