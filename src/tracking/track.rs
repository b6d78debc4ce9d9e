//! Per-object track state.

use std::collections::VecDeque;

use nalgebra::Vector6;

use crate::core::types::{BoundingBox3, Pose3D};
use crate::graph::{Factor, Key, Values};

/// State of one tracked rigid object.
///
/// `object_index` is factor-graph-scoped and never reused; `tracking_index`
/// is the visualization-scoped identity that survives re-identification.
/// Retirement is an explicit flag: a retired track is never materialized
/// into a later epoch.
#[derive(Debug, Clone)]
pub struct ObjectTrack {
    /// Last pose estimate in the map frame.
    pub pose: Pose3D,

    /// Last velocity estimate (per-Δt body-frame twist as a pose).
    pub velocity: Pose3D,

    /// Current pose variable, if the track joined this step's problem.
    pub pose_node: Option<Key>,

    /// Current velocity variable, if the track joined this step's problem.
    pub velocity_node: Option<Key>,

    /// Factor-graph object id. Monotone, unique, never reused.
    pub object_index: u64,

    /// Tracking (visualization) id. Inherited across re-identification.
    pub tracking_index: u64,

    /// Consecutive steps without an associated detection.
    pub lost_count: u32,

    /// Association streak, bounded to `P + 1`.
    pub track_score: i32,

    /// Track has been replaced and must not reappear in later epochs.
    pub retired: bool,

    /// The track's detection factor currently influences the ego pose.
    pub is_tightly_coupled: bool,

    /// The track was born this step.
    pub is_first: bool,

    /// Timestamp of the last update.
    pub timestamp: f64,

    /// Last associated detection.
    pub detection: Option<BoundingBox3>,

    /// Confidence carried from the last associated detection.
    pub confidence: f64,

    /// Steps this track has been published while active.
    pub path_length: usize,

    /// Ring of recent velocity node ids for the consistency test.
    pub previous_velocity_nodes: VecDeque<Key>,

    /// Back reference to the last emitted detection factor (diagnostics).
    pub detection_factor: Option<Factor>,

    /// Back reference to the last emitted stable-pose factor (diagnostics).
    pub motion_factor: Option<Factor>,

    /// Detection factor error at emission time.
    pub initial_detection_error: f64,

    /// Stable-pose factor error at emission time.
    pub initial_motion_error: f64,
}

impl ObjectTrack {
    /// Create a newborn track at a pose with identity velocity.
    pub fn born(object_index: u64, tracking_index: u64, pose: Pose3D, timestamp: f64) -> Self {
        Self {
            pose,
            velocity: Pose3D::identity(),
            pose_node: None,
            velocity_node: None,
            object_index,
            tracking_index,
            lost_count: 0,
            track_score: 0,
            retired: false,
            is_tightly_coupled: false,
            is_first: true,
            timestamp,
            detection: None,
            confidence: 0.0,
            path_length: 0,
            previous_velocity_nodes: VecDeque::new(),
            detection_factor: None,
            motion_factor: None,
            initial_detection_error: 0.0,
            initial_motion_error: 0.0,
        }
    }

    /// Remember a velocity node id, keeping at most `capacity` entries.
    pub fn remember_velocity_node(&mut self, node: Key, capacity: usize) {
        if capacity == 0 {
            return;
        }
        if self.previous_velocity_nodes.len() == capacity {
            self.previous_velocity_nodes.pop_front();
        }
        self.previous_velocity_nodes.push_back(node);
    }

    /// Temporal velocity-consistency test.
    ///
    /// Requires `sampling` velocity node estimates; the mean Mahalanobis
    /// distance of their tangents around the sample mean, under a diagonal
    /// covariance of the two thresholds, must be below 1.
    pub fn velocity_is_consistent(
        &self,
        sampling: usize,
        estimate: &Values,
        angle_threshold: f64,
        velocity_threshold: f64,
    ) -> bool {
        if sampling == 0 || self.previous_velocity_nodes.len() < sampling {
            return false;
        }

        let mut tangents: Vec<Vector6<f64>> = Vec::with_capacity(sampling);
        let mut mean = Vector6::<f64>::zeros();
        for &node in self.previous_velocity_nodes.iter().rev().take(sampling) {
            let velocity = match estimate.get(node) {
                Some(pose) => pose,
                None => return false,
            };
            let v = velocity.log();
            mean += v;
            tangents.push(v);
        }
        mean /= sampling as f64;

        let mut inv_variances = Vector6::<f64>::zeros();
        for i in 0..3 {
            inv_variances[i] = 1.0 / angle_threshold;
            inv_variances[i + 3] = 1.0 / velocity_threshold;
        }

        let mut error = 0.0;
        for v in &tangents {
            let d = v - mean;
            for i in 0..6 {
                error += d[i] * d[i] * inv_variances[i];
            }
        }
        error /= sampling as f64;

        error < 1.0
    }
}
