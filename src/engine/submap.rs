//! Local sub-map assembly.
//!
//! The sub-map is the union of transformed feature clouds from keyframes
//! around the current pose. Per-keyframe transformed clouds are cached so
//! repeated assembly stays cheap; the cache is evicted when it outgrows its
//! bound and flushed whenever pose corrections invalidate it.

use std::collections::{BTreeSet, HashMap};

use kiddo::SquaredEuclidean;

use crate::core::types::{PointCloud3D, Pose3D};
use crate::preprocess::VoxelGridFilter;

use super::keyframe::KeyframeStore;

/// Time window (seconds) of recent keyframes always included, so the
/// sub-map survives pure rotation in place.
const RECENT_KEYFRAME_WINDOW: f64 = 10.0;

/// Select sub-map keyframes: radius neighbors of the latest keypose,
/// thinned to `density`, plus all keyframes from the last 10 seconds.
pub fn select_surrounding_keyframes(
    store: &KeyframeStore,
    radius: f64,
    density: f32,
    now: f64,
) -> Vec<usize> {
    let latest = match store.latest() {
        Some(keyframe) => keyframe.pose,
        None => return Vec::new(),
    };

    let nearby = store.neighbors_within(&latest, radius);

    // Thin the nearby keyposes with a voxel grid, then map each surviving
    // centroid back to its closest keypose.
    let mut positions = PointCloud3D::with_capacity(nearby.len());
    for &id in &nearby {
        let t = store.get(id).expect("neighbor id is valid").pose.translation();
        positions.push(t.x as f32, t.y as f32, t.z as f32, id as f32);
    }
    let thinned = VoxelGridFilter::new(density).filter(&positions);

    let tree = store.position_tree();
    let mut selected: BTreeSet<usize> = BTreeSet::new();
    for i in 0..thinned.len() {
        let nearest = tree.nearest_one::<SquaredEuclidean>(&thinned.point(i));
        selected.insert(nearest.item as usize);
    }

    for id in store.recent_within(now, RECENT_KEYFRAME_WINDOW) {
        selected.insert(id);
    }

    selected.into_iter().collect()
}

/// Cache of per-keyframe feature clouds transformed into the map frame.
#[derive(Debug)]
pub struct SubmapCache {
    cache: HashMap<usize, (PointCloud3D, PointCloud3D)>,
    capacity: usize,
}

impl Default for SubmapCache {
    fn default() -> Self {
        Self::new(1000)
    }
}

impl SubmapCache {
    /// Create a cache evicting everything once `capacity` is exceeded.
    pub fn new(capacity: usize) -> Self {
        Self {
            cache: HashMap::new(),
            capacity,
        }
    }

    /// Number of cached keyframes.
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    /// Drop every cached cloud. Called when keyframe poses move.
    pub fn flush(&mut self) {
        self.cache.clear();
    }

    /// Assemble the sub-map from the given keyframes.
    ///
    /// Returns the union `(edge, plane)` clouds in the map frame. Entries
    /// missing from the cache are transformed and cached; the whole cache is
    /// evicted afterwards if it exceeds capacity.
    pub fn assemble(
        &mut self,
        store: &KeyframeStore,
        ids: &[usize],
        current: &Pose3D,
        radius: f64,
    ) -> (PointCloud3D, PointCloud3D) {
        let mut edge = PointCloud3D::new();
        let mut plane = PointCloud3D::new();

        for &id in ids {
            let keyframe = match store.get(id) {
                Some(keyframe) => keyframe,
                None => continue,
            };
            if keyframe.pose.translation_distance(current) > radius {
                continue;
            }

            if let Some((cached_edge, cached_plane)) = self.cache.get(&id) {
                edge.extend(cached_edge);
                plane.extend(cached_plane);
            } else {
                let transformed_edge = keyframe.edge_cloud.transform(&keyframe.pose);
                let transformed_plane = keyframe.plane_cloud.transform(&keyframe.pose);
                edge.extend(&transformed_edge);
                plane.extend(&transformed_plane);
                self.cache.insert(id, (transformed_edge, transformed_plane));
            }
        }

        if self.cache.len() > self.capacity {
            self.cache.clear();
        }

        (edge, plane)
    }
}
