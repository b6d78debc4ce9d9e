//! Configuration loading for GatiSLAM
//!
//! Every knob that affects estimator behavior lives here, grouped by
//! subsystem. All groups deserialize from TOML with full defaults, so a
//! config file only needs to list the values it overrides.
//!
//! Noise vectors are diagonal variances in tangent-space order
//! `(roll, pitch, yaw, x, y, z)` — rotation first, matching the pose
//! logarithm convention used throughout the crate.

use std::path::Path;

use serde::Deserialize;

use crate::error::Result;

/// Top-level configuration.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct GatiConfig {
    pub matching: MatchingConfig,
    pub keyframe: KeyframeConfig,
    pub noise: NoiseConfig,
    pub tracking: TrackingConfig,
    pub loop_closure: LoopClosureConfig,
    pub gps: GpsConfig,
}

impl GatiConfig {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }
}

/// Scan-to-map matching parameters.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct MatchingConfig {
    /// Minimum number of downsampled edge features required to run matching.
    pub edge_feature_min_valid_num: usize,

    /// Minimum number of downsampled planar features required to run matching.
    pub surf_feature_min_valid_num: usize,

    /// Voxel leaf size (meters) for edge feature downsampling.
    pub mapping_corner_leaf_size: f32,

    /// Voxel leaf size (meters) for planar feature downsampling.
    pub mapping_surf_leaf_size: f32,

    /// Radius (meters) for collecting keyframes into the local sub-map.
    pub surrounding_keyframe_search_radius: f64,

    /// Voxel leaf size (meters) used to thin the surrounding keypose set.
    pub surrounding_keyframe_density: f32,

    /// SLERP weight for blending IMU roll/pitch into the matched pose.
    pub imu_rpy_weight: f64,

    /// Hard clamp on roll/pitch magnitude (radians).
    pub rotation_tolerance: f64,

    /// Hard clamp on z magnitude (meters).
    pub z_tolerance: f64,

    /// Worker parallelism hint for correspondence search.
    pub number_of_cores: usize,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            edge_feature_min_valid_num: 10,
            surf_feature_min_valid_num: 100,
            mapping_corner_leaf_size: 0.2,
            mapping_surf_leaf_size: 0.4,
            surrounding_keyframe_search_radius: 50.0,
            surrounding_keyframe_density: 2.0,
            imu_rpy_weight: 0.01,
            rotation_tolerance: 1000.0,
            z_tolerance: 1000.0,
            number_of_cores: 4,
        }
    }
}

/// Keyframe selection parameters.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct KeyframeConfig {
    /// Minimum translation (meters) from the last keyframe.
    pub add_dist_threshold: f64,

    /// Minimum absolute Euler angle change (radians) from the last keyframe.
    pub add_angle_threshold: f64,

    /// Minimum time (seconds) between processed sweeps.
    pub mapping_process_interval: f64,
}

impl Default for KeyframeConfig {
    fn default() -> Self {
        Self {
            add_dist_threshold: 1.0,
            add_angle_threshold: 0.2,
            mapping_process_interval: 0.15,
        }
    }
}

/// Diagonal factor noise variances, `(roll, pitch, yaw, x, y, z)`.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct NoiseConfig {
    /// Prior on the very first ego pose.
    pub prior_odometry_diagonal_variance: [f64; 6],

    /// Between-factor noise for consecutive keyframes.
    pub odometry_diagonal_variance: [f64; 6],

    /// Stable-pose (constant body-frame twist) factor noise.
    pub motion_diagonal_variance: [f64; 6],

    /// Detection factor noise while tightly coupled.
    pub tightly_coupled_detection_variance: [f64; 6],

    /// Detection factor noise while loosely coupled.
    pub loosely_coupled_detection_variance: [f64; 6],

    /// Matching profile for young tracks still estimating velocity.
    pub early_loosely_coupled_matching_variance: [f64; 6],

    /// Default matching profile.
    pub loosely_coupled_matching_variance: [f64; 6],

    /// Matching profile for the tight-coupling spatial test.
    pub tightly_coupled_matching_variance: [f64; 6],

    /// Wide profile for re-identifying lost tracks.
    pub data_association_variance: [f64; 6],

    /// Constant-velocity factor noise.
    pub constant_velocity_diagonal_variance: [f64; 6],

    /// Constant-velocity factor noise for young tracks.
    pub early_constant_velocity_diagonal_variance: [f64; 6],

    /// Prior on a newborn object's velocity node. The translation-x variance
    /// is huge so forward motion can be inferred freely while roll/pitch
    /// stay pinned near zero.
    pub initial_velocity_prior_variance: [f64; 6],
}

impl Default for NoiseConfig {
    fn default() -> Self {
        Self {
            prior_odometry_diagonal_variance: [1e-2; 6],
            odometry_diagonal_variance: [1e-6, 1e-6, 1e-6, 1e-4, 1e-4, 1e-4],
            motion_diagonal_variance: [1e-4, 1e-4, 1e-4, 1e-2, 1e-2, 1e-2],
            tightly_coupled_detection_variance: [1e-4, 1e-4, 1e-4, 1e-2, 1e-2, 1e-2],
            loosely_coupled_detection_variance: [1e-2, 1e-2, 1e-2, 1.0, 1.0, 1.0],
            early_loosely_coupled_matching_variance: [1.0, 1.0, 1.0, 4.0, 4.0, 4.0],
            loosely_coupled_matching_variance: [1e-1, 1e-1, 1e-1, 1.0, 1.0, 1.0],
            tightly_coupled_matching_variance: [1e-2, 1e-2, 1e-2, 1e-1, 1e-1, 1e-1],
            data_association_variance: [1.0, 1.0, 1.0, 9.0, 9.0, 9.0],
            constant_velocity_diagonal_variance: [1e-4, 1e-4, 1e-4, 1e-2, 1e-2, 1e-2],
            early_constant_velocity_diagonal_variance: [1e-2, 1e-2, 1e-2, 1.0, 1.0, 1.0],
            initial_velocity_prior_variance: [1e-2, 1e-2, 1e0, 1e8, 1e2, 1e2],
        }
    }
}

/// Object tracking parameters.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct TrackingConfig {
    /// Consecutive missed steps after which a track is dropped.
    pub tracking_steps_for_lost_object: u32,

    /// `P`: associations required before a track may couple tightly.
    pub number_of_pre_loose_coupling_steps: i32,

    /// Score deduction when a tight-coupling test fails.
    pub number_of_inter_loose_coupling_steps: i32,

    /// Path length at or below which a track counts as "early".
    pub number_of_early_steps: usize,

    /// `K`: velocity samples required by the consistency test.
    pub number_of_velocity_consistency_steps: usize,

    /// Whitened half-squared error gate for association.
    pub detection_match_threshold: f64,

    /// Whitened half-squared error gate for the tight-coupling spatial test.
    pub tight_coupling_detection_error_threshold: f64,

    /// Angular variance (rad²/s²) for the velocity consistency test.
    pub object_angular_velocity_consistency_variance_threshold: f64,

    /// Linear variance (m²/s²) for the velocity consistency test.
    pub object_linear_velocity_consistency_variance_threshold: f64,

    /// Keep tracking objects on non-keyframe sweeps by pinning the ego key.
    pub simultaneous_tracking: bool,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            tracking_steps_for_lost_object: 10,
            number_of_pre_loose_coupling_steps: 10,
            number_of_inter_loose_coupling_steps: 5,
            number_of_early_steps: 3,
            number_of_velocity_consistency_steps: 5,
            detection_match_threshold: 1.0,
            tight_coupling_detection_error_threshold: 0.5,
            object_angular_velocity_consistency_variance_threshold: 0.1,
            object_linear_velocity_consistency_variance_threshold: 1.0,
            simultaneous_tracking: true,
        }
    }
}

/// Loop-closure detection parameters.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct LoopClosureConfig {
    /// Radius (meters) for historical keypose candidates.
    pub history_keyframe_search_radius: f64,

    /// Neighbor keyframes assembled on each side of the candidate.
    pub history_keyframe_search_num: usize,

    /// Minimum age difference (seconds) between loop endpoints.
    pub history_keyframe_search_time_diff: f64,

    /// Maximum ICP fitness (mean squared distance) to accept a loop.
    pub history_keyframe_fitness_score: f32,

    /// Worker frequency in Hz.
    pub loop_closure_frequency: f64,

    /// Master switch for the loop-closure worker.
    pub loop_closure_enable_flag: bool,
}

impl Default for LoopClosureConfig {
    fn default() -> Self {
        Self {
            history_keyframe_search_radius: 15.0,
            history_keyframe_search_num: 25,
            history_keyframe_search_time_diff: 30.0,
            history_keyframe_fitness_score: 0.3,
            loop_closure_frequency: 1.0,
            loop_closure_enable_flag: true,
        }
    }
}

/// GPS fusion parameters.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct GpsConfig {
    /// Ego x/y marginal variance above which GPS corrections are accepted.
    pub pose_cov_threshold: f64,

    /// Maximum GPS covariance for a usable fix.
    pub gps_cov_threshold: f64,

    /// Use GPS elevation instead of clamping z to the current estimate.
    pub use_gps_elevation: bool,
}

impl Default for GpsConfig {
    fn default() -> Self {
        Self {
            pose_cov_threshold: 25.0,
            gps_cov_threshold: 2.0,
            use_gps_elevation: false,
        }
    }
}
