//! Per-sweep estimator input.

use crate::core::types::{PointCloud3D, Pose3D};

/// One undistorted LiDAR sweep with its pose hints.
///
/// Feature extraction happens upstream; edge and planar clouds arrive
/// already segmented, with the raw deskewed cloud kept for the detector.
#[derive(Debug, Clone, Default)]
pub struct SweepInput {
    /// Sweep timestamp in seconds.
    pub stamp: f64,

    /// Edge (corner) feature cloud in the sensor frame.
    pub edge_cloud: PointCloud3D,

    /// Planar feature cloud in the sensor frame.
    pub plane_cloud: PointCloud3D,

    /// Raw deskewed cloud, forwarded to the detection service.
    pub raw_cloud: PointCloud3D,

    /// IMU attitude is available for this sweep.
    pub imu_available: bool,

    /// IMU roll at sweep time (radians).
    pub imu_roll: f64,

    /// IMU pitch at sweep time (radians).
    pub imu_pitch: f64,

    /// IMU yaw at sweep time (radians).
    pub imu_yaw: f64,

    /// An odometry pre-integration guess is available for this sweep.
    pub odom_available: bool,

    /// Absolute pose guess from odometry pre-integration.
    pub initial_guess: Pose3D,
}
