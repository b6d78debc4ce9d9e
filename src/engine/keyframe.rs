//! Keyframe storage for the global map.
//!
//! Keyframes are pose-stamped downsampled feature clouds. The log is
//! append-only; poses are the only mutable part, rewritten when loop
//! closures or tight coupling flow corrections back through the graph.

use kiddo::SquaredEuclidean;

use crate::core::types::{PointCloud3D, Pose3D};
use crate::matching::KdTree;

/// A keyframe: id, time, pose, and its downsampled feature clouds.
#[derive(Debug, Clone)]
pub struct Keyframe {
    /// Sequential identifier, equal to the store index.
    pub id: usize,

    /// Sweep timestamp in seconds.
    pub time: f64,

    /// Global sensor pose. Mutable under pose correction.
    pub pose: Pose3D,

    /// Downsampled edge feature cloud in the sensor frame.
    pub edge_cloud: PointCloud3D,

    /// Downsampled planar feature cloud in the sensor frame.
    pub plane_cloud: PointCloud3D,
}

/// Append-only keyframe log with spatial queries.
#[derive(Debug, Default)]
pub struct KeyframeStore {
    keyframes: Vec<Keyframe>,
}

impl KeyframeStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a keyframe, assigning the next id.
    pub fn push(
        &mut self,
        time: f64,
        pose: Pose3D,
        edge_cloud: PointCloud3D,
        plane_cloud: PointCloud3D,
    ) -> usize {
        let id = self.keyframes.len();
        self.keyframes.push(Keyframe {
            id,
            time,
            pose,
            edge_cloud,
            plane_cloud,
        });
        id
    }

    /// Number of keyframes.
    pub fn len(&self) -> usize {
        self.keyframes.len()
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.keyframes.is_empty()
    }

    /// Keyframe by id.
    pub fn get(&self, id: usize) -> Option<&Keyframe> {
        self.keyframes.get(id)
    }

    /// Most recent keyframe.
    pub fn latest(&self) -> Option<&Keyframe> {
        self.keyframes.last()
    }

    /// All keyframes in order.
    pub fn iter(&self) -> impl Iterator<Item = &Keyframe> {
        self.keyframes.iter()
    }

    /// Rewrite a keyframe pose (loop closure / tight-coupling correction).
    pub fn set_pose(&mut self, id: usize, pose: Pose3D) {
        if let Some(keyframe) = self.keyframes.get_mut(id) {
            keyframe.pose = pose;
        }
    }

    /// Distance between the first and last keyframe positions.
    pub fn traveled_span(&self) -> f64 {
        match (self.keyframes.first(), self.keyframes.last()) {
            (Some(first), Some(last)) => first.pose.translation_distance(&last.pose),
            _ => 0.0,
        }
    }

    /// Build a k-d tree over keyframe positions.
    pub fn position_tree(&self) -> KdTree {
        let mut tree: KdTree = KdTree::new();
        for keyframe in &self.keyframes {
            let t = keyframe.pose.translation();
            tree.add(&[t.x as f32, t.y as f32, t.z as f32], keyframe.id as u64);
        }
        tree
    }

    /// Ids of keyframes within `radius` of a position.
    pub fn neighbors_within(&self, center: &Pose3D, radius: f64) -> Vec<usize> {
        if self.keyframes.is_empty() {
            return Vec::new();
        }
        let tree = self.position_tree();
        let t = center.translation();
        let query = [t.x as f32, t.y as f32, t.z as f32];
        let radius_sq = (radius * radius) as f32;

        let mut ids: Vec<usize> = tree
            .within_unsorted::<SquaredEuclidean>(&query, radius_sq)
            .into_iter()
            .map(|n| n.item as usize)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Ids of keyframes newer than `now - window` seconds, newest first.
    pub fn recent_within(&self, now: f64, window: f64) -> Vec<usize> {
        let mut ids = Vec::new();
        for keyframe in self.keyframes.iter().rev() {
            if now - keyframe.time < window {
                ids.push(keyframe.id);
            } else {
                break;
            }
        }
        ids
    }

    /// Whether the motion since the last keyframe warrants a new one.
    ///
    /// True when translation exceeds `dist_threshold` OR any absolute Euler
    /// angle of the relative pose exceeds `angle_threshold`. Always true for
    /// the first frame.
    pub fn requires_new_keyframe(
        &self,
        pose: &Pose3D,
        dist_threshold: f64,
        angle_threshold: f64,
    ) -> bool {
        let last = match self.keyframes.last() {
            Some(keyframe) => &keyframe.pose,
            None => return true,
        };

        let between = last.between(pose);
        let (roll, pitch, yaw) = between.euler_angles();
        if roll.abs() < angle_threshold
            && pitch.abs() < angle_threshold
            && yaw.abs() < angle_threshold
            && between.translation().norm() < dist_threshold
        {
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_cloud() -> PointCloud3D {
        let mut cloud = PointCloud3D::new();
        cloud.push(1.0, 0.0, 0.0, 0.0);
        cloud
    }

    #[test]
    fn test_push_assigns_sequential_ids() {
        let mut store = KeyframeStore::new();
        let a = store.push(0.0, Pose3D::identity(), small_cloud(), small_cloud());
        let b = store.push(
            1.0,
            Pose3D::from_euler(1.0, 0.0, 0.0, 0.0, 0.0, 0.0),
            small_cloud(),
            small_cloud(),
        );
        assert_eq!(a, 0);
        assert_eq!(b, 1);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_first_frame_always_keyframe() {
        let store = KeyframeStore::new();
        assert!(store.requires_new_keyframe(&Pose3D::identity(), 1.0, 0.2));
    }

    #[test]
    fn test_keyframe_decision_thresholds() {
        let mut store = KeyframeStore::new();
        store.push(0.0, Pose3D::identity(), small_cloud(), small_cloud());

        // below both thresholds
        let near = Pose3D::from_euler(0.5, 0.0, 0.0, 0.0, 0.0, 0.1);
        assert!(!store.requires_new_keyframe(&near, 1.0, 0.2));

        // translation over
        let far = Pose3D::from_euler(1.5, 0.0, 0.0, 0.0, 0.0, 0.0);
        assert!(store.requires_new_keyframe(&far, 1.0, 0.2));

        // rotation over
        let turned = Pose3D::from_euler(0.0, 0.0, 0.0, 0.0, 0.0, 0.3);
        assert!(store.requires_new_keyframe(&turned, 1.0, 0.2));
    }

    #[test]
    fn test_neighbors_within() {
        let mut store = KeyframeStore::new();
        for i in 0..10 {
            store.push(
                i as f64,
                Pose3D::from_euler(i as f64 * 2.0, 0.0, 0.0, 0.0, 0.0, 0.0),
                small_cloud(),
                small_cloud(),
            );
        }

        let near = store.neighbors_within(&Pose3D::identity(), 5.0);
        assert_eq!(near, vec![0, 1, 2]);
    }

    #[test]
    fn test_recent_within() {
        let mut store = KeyframeStore::new();
        for i in 0..5 {
            store.push(
                i as f64 * 10.0,
                Pose3D::identity(),
                small_cloud(),
                small_cloud(),
            );
        }
        let recent = store.recent_within(40.0, 15.0);
        assert_eq!(recent, vec![4, 3]);
    }

    #[test]
    fn test_set_pose() {
        let mut store = KeyframeStore::new();
        store.push(0.0, Pose3D::identity(), small_cloud(), small_cloud());
        let corrected = Pose3D::from_euler(0.5, 0.5, 0.0, 0.0, 0.0, 0.0);
        store.set_pose(0, corrected);
        assert_eq!(store.get(0).unwrap().pose, corrected);
    }
}
