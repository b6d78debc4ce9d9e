//! Shared types: poses, point clouds, detections, sweep input.

mod cloud;
mod detection;
mod pose;
mod sweep;

pub use cloud::PointCloud3D;
pub use detection::{best_detection_match, BoundingBox3, Detection};
pub use pose::Pose3D;
pub use sweep::SweepInput;
