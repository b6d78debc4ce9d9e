//! Dynamic object tracking.

mod track;
mod tracker;

pub use track::ObjectTrack;
pub use tracker::{build_detection_sets, DetectionSets, ObjectTracker};
