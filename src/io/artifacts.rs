//! Saving hooks: point-cloud artifacts and the estimation record.
//!
//! Clouds are written as ASCII PCD; the estimation record (ego trajectory
//! plus per-object trajectories, velocities, and coupling flags) is YAML.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::core::types::{PointCloud3D, Pose3D};
use crate::engine::JointEstimator;
use crate::error::Result;
use crate::preprocess::VoxelGridFilter;

/// A stamped 6-DoF pose in record form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoseRecord {
    pub time: f64,
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub roll: f64,
    pub pitch: f64,
    pub yaw: f64,
}

impl PoseRecord {
    /// Build from a pose.
    pub fn from_pose(time: f64, pose: &Pose3D) -> Self {
        let t = pose.translation();
        let (roll, pitch, yaw) = pose.euler_angles();
        Self {
            time,
            x: t.x,
            y: t.y,
            z: t.z,
            roll,
            pitch,
            yaw,
        }
    }
}

/// Per-object estimation history.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObjectRecord {
    /// Object poses over time.
    pub poses: Vec<PoseRecord>,

    /// Object velocities over time.
    pub velocities: Vec<PoseRecord>,

    /// Tight/loose coupling flag per step.
    pub tightly_coupled: Vec<bool>,
}

/// The full estimation result.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EstimationRecord {
    /// Ego trajectory.
    pub trajectory: Vec<PoseRecord>,

    /// Histories keyed by factor-graph object id.
    pub objects: BTreeMap<u64, ObjectRecord>,

    /// Histories keyed by tracking id (survives re-identification).
    pub tracked_objects: BTreeMap<u64, ObjectRecord>,
}

/// Write a cloud as ASCII PCD.
pub fn save_pcd<P: AsRef<Path>>(path: P, cloud: &PointCloud3D) -> Result<()> {
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);

    writeln!(writer, "# .PCD v0.7 - Point Cloud Data file format")?;
    writeln!(writer, "VERSION 0.7")?;
    writeln!(writer, "FIELDS x y z intensity")?;
    writeln!(writer, "SIZE 4 4 4 4")?;
    writeln!(writer, "TYPE F F F F")?;
    writeln!(writer, "COUNT 1 1 1 1")?;
    writeln!(writer, "WIDTH {}", cloud.len())?;
    writeln!(writer, "HEIGHT 1")?;
    writeln!(writer, "VIEWPOINT 0 0 0 1 0 0 0")?;
    writeln!(writer, "POINTS {}", cloud.len())?;
    writeln!(writer, "DATA ascii")?;
    for i in 0..cloud.len() {
        writeln!(
            writer,
            "{} {} {} {}",
            cloud.xs[i], cloud.ys[i], cloud.zs[i], cloud.intensities[i]
        )?;
    }
    writer.flush()?;
    Ok(())
}

/// Assemble the estimation record from an estimator.
///
/// Historical object states are re-read from the solver snapshot through
/// their node ids, so every entry reflects post-correction values.
pub fn build_estimation_record(estimator: &JointEstimator) -> EstimationRecord {
    let mut record = EstimationRecord {
        trajectory: estimator
            .path()
            .iter()
            .map(|(time, pose)| PoseRecord::from_pose(*time, pose))
            .collect(),
        ..Default::default()
    };

    let estimate = estimator.solver_estimate();
    for epoch in estimator.tracker().epochs() {
        for track in epoch.values() {
            if track.lost_count > 0 || track.retired {
                continue;
            }

            let pose = track
                .pose_node
                .and_then(|node| estimate.get(node))
                .copied()
                .unwrap_or(track.pose);
            let velocity = track
                .velocity_node
                .and_then(|node| estimate.get(node))
                .copied()
                .unwrap_or(track.velocity);

            let pose_record = PoseRecord::from_pose(track.timestamp, &pose);
            let velocity_record = PoseRecord::from_pose(track.timestamp, &velocity);

            for key in [
                (&mut record.objects, track.object_index),
                (&mut record.tracked_objects, track.tracking_index),
            ] {
                let (map, index) = key;
                let entry = map.entry(index).or_default();
                entry.poses.push(pose_record.clone());
                entry.velocities.push(velocity_record.clone());
                entry.tightly_coupled.push(track.is_tightly_coupled);
            }
        }
    }

    record
}

/// Write an estimation record as YAML.
pub fn save_estimation_record<P: AsRef<Path>>(path: P, record: &EstimationRecord) -> Result<()> {
    let file = File::create(path)?;
    serde_yaml::to_writer(BufWriter::new(file), record)?;
    Ok(())
}

/// Write the map artifacts into a directory.
///
/// Produces `trajectory.pcd`, `transformations.yaml`, `CornerMap.pcd`,
/// `SurfMap.pcd`, and `GlobalMap.pcd`. With `resolution` set, the feature
/// maps are re-leafed at that size before saving.
pub fn save_map_artifacts<P: AsRef<Path>>(
    directory: P,
    estimator: &JointEstimator,
    resolution: Option<f32>,
) -> Result<()> {
    let directory = directory.as_ref();
    fs::create_dir_all(directory)?;

    let store = estimator.keyframes();

    // Trajectory cloud: keypose positions, intensity carries the id
    let mut trajectory = PointCloud3D::with_capacity(store.len());
    let mut transformations = Vec::with_capacity(store.len());
    for keyframe in store.iter() {
        let t = keyframe.pose.translation();
        trajectory.push(t.x as f32, t.y as f32, t.z as f32, keyframe.id as f32);
        transformations.push(PoseRecord::from_pose(keyframe.time, &keyframe.pose));
    }
    save_pcd(directory.join("trajectory.pcd"), &trajectory)?;

    let file = File::create(directory.join("transformations.yaml"))?;
    serde_yaml::to_writer(BufWriter::new(file), &transformations)?;

    // Global feature maps
    let mut corner_map = PointCloud3D::new();
    let mut surf_map = PointCloud3D::new();
    for keyframe in store.iter() {
        corner_map.extend(&keyframe.edge_cloud.transform(&keyframe.pose));
        surf_map.extend(&keyframe.plane_cloud.transform(&keyframe.pose));
    }
    if let Some(leaf) = resolution {
        let filter = VoxelGridFilter::new(leaf);
        corner_map = filter.filter(&corner_map);
        surf_map = filter.filter(&surf_map);
    }
    save_pcd(directory.join("CornerMap.pcd"), &corner_map)?;
    save_pcd(directory.join("SurfMap.pcd"), &surf_map)?;

    let mut global_map = corner_map;
    global_map.extend(&surf_map);
    save_pcd(directory.join("GlobalMap.pcd"), &global_map)?;

    Ok(())
}
