pub mod detection;
pub mod engine;
pub mod keypoint;
pub mod track;
#[cfg(feature = "desktop")]
pub mod yolo;

pub use detection::{BBox, DetectionResult, HandKeypoints, Subject};
pub use engine::{spawn_inference, InferenceEngine};
pub use keypoint::{Keypoint, KeypointIndex, Pose};
pub use track::{IouTracker, TrackingEngine};
#[cfg(feature = "desktop")]
pub use yolo::YoloPoseEngine;
