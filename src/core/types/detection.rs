//! Object detections and noise-profiled matching.

use nalgebra::Vector6;
use serde::{Deserialize, Serialize};

use crate::core::types::Pose3D;

/// An oriented 3-D bounding box from the detector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundingBox3 {
    /// Box pose in the sensor frame.
    pub pose: Pose3D,
    /// Box extents (x, y, z) in meters.
    pub dimensions: [f64; 3],
    /// Detector class label.
    pub label: u32,
    /// Detector confidence score.
    pub score: f64,
}

impl BoundingBox3 {
    /// Create a box at a pose with given extents.
    pub fn new(pose: Pose3D, dimensions: [f64; 3], label: u32, score: f64) -> Self {
        Self {
            pose,
            dimensions,
            label,
            score,
        }
    }
}

/// A detection paired with a diagonal variance profile.
///
/// The same physical box is wrapped once per profile (tight, loose,
/// early-loose matching, tight matching, data association) so each stage of
/// the tracker evaluates the residual under its own noise.
#[derive(Debug, Clone)]
pub struct Detection {
    bounding_box: BoundingBox3,
    variances: Vector6<f64>,
}

impl Detection {
    /// Wrap a box with a variance profile `(roll, pitch, yaw, x, y, z)`.
    pub fn new(bounding_box: BoundingBox3, variances: [f64; 6]) -> Self {
        Self {
            bounding_box,
            variances: Vector6::from_row_slice(&variances),
        }
    }

    /// Detection pose in the sensor frame.
    #[inline]
    pub fn pose(&self) -> &Pose3D {
        &self.bounding_box.pose
    }

    /// The wrapped bounding box.
    #[inline]
    pub fn bounding_box(&self) -> &BoundingBox3 {
        &self.bounding_box
    }

    /// Diagonal variances of this profile.
    #[inline]
    pub fn variances(&self) -> &Vector6<f64> {
        &self.variances
    }

    /// Whitened half-squared residual between a predicted object pose (in
    /// the sensor frame) and this detection.
    pub fn matching_error(&self, predicted: &Pose3D) -> f64 {
        let r = predicted.local(&self.bounding_box.pose);
        let mut error = 0.0;
        for i in 0..6 {
            error += r[i] * r[i] / self.variances[i];
        }
        0.5 * error
    }
}

/// Best-matching detection for a predicted pose.
///
/// Returns `(index, error)` of the minimum matching error; ties keep the
/// lowest detection index. `None` when the slice is empty.
pub fn best_detection_match(predicted: &Pose3D, detections: &[Detection]) -> Option<(usize, f64)> {
    let mut best: Option<(usize, f64)> = None;
    for (j, detection) in detections.iter().enumerate() {
        let error = detection.matching_error(predicted);
        match best {
            Some((_, e)) if error >= e => {}
            _ => best = Some((j, error)),
        }
    }
    best
}
