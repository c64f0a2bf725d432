//! Per-camera multi-object tracking.
//!
//! [`TrackManager`] runs once per frame: it predicts every track with a
//! constant-velocity Kalman filter, matches predictions to detections by
//! minimum-cost (1 - IoU) assignment, and manages the track lifecycle
//! (`Tentative` -> `Confirmed` -> `Lost` -> `Removed`). Confirmed tracks are
//! attached to a person through an [`IdentityResolver`].
//!
//! ```
//! use trackid_tracker::{BBox, Detection, TrackManager, TrackerConfig};
//!
//! let mut tracker = TrackManager::new("cam-1", TrackerConfig::default());
//! let first = tracker
//!     .update(&[Detection::new(1, BBox::new(10.0, 10.0, 50.0, 50.0), 0.9, "cam-1", 1)], 1)
//!     .unwrap();
//! let second = tracker
//!     .update(&[Detection::new(1, BBox::new(12.0, 11.0, 50.0, 50.0), 0.9, "cam-1", 2)], 2)
//!     .unwrap();
//! assert_eq!(first.updates[0].track_id, second.updates[0].track_id);
//! ```

mod assignment;
mod bbox;
mod detection;
mod error;
mod kalman;
mod manager;
mod resolver;
mod track;

pub use assignment::{Association, associate};
pub use bbox::BBox;
pub use detection::Detection;
pub use error::TrackerError;
pub use kalman::{Divergence, KalmanFilter};
pub use manager::{FrameResult, TrackManager, TrackerConfig};
pub use resolver::{Candidate, IdentityResolver, Observation};
pub use track::{Track, TrackStatus, TrackUpdate};
