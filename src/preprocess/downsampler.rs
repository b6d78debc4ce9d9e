//! Voxel-grid downsampling.

use std::collections::BTreeMap;

use crate::core::types::PointCloud3D;

/// Centroid voxel-grid filter.
///
/// Points falling into the same cubic voxel are replaced by their centroid
/// with averaged intensity. Voxels are keyed on floor-divided coordinates,
/// so output ordering is deterministic for a given input.
#[derive(Debug, Clone, Copy)]
pub struct VoxelGridFilter {
    leaf_size: f32,
}

impl VoxelGridFilter {
    /// Create a filter with a cubic leaf size in meters.
    pub fn new(leaf_size: f32) -> Self {
        Self { leaf_size }
    }

    /// Leaf size in meters.
    pub fn leaf_size(&self) -> f32 {
        self.leaf_size
    }

    /// Downsample a cloud. A non-positive leaf size passes the cloud through.
    pub fn filter(&self, cloud: &PointCloud3D) -> PointCloud3D {
        if self.leaf_size <= 0.0 || cloud.is_empty() {
            return cloud.clone();
        }

        let inv = 1.0 / self.leaf_size;
        let mut voxels: BTreeMap<(i64, i64, i64), (f64, f64, f64, f64, u32)> = BTreeMap::new();

        for i in 0..cloud.len() {
            let key = (
                (cloud.xs[i] * inv).floor() as i64,
                (cloud.ys[i] * inv).floor() as i64,
                (cloud.zs[i] * inv).floor() as i64,
            );
            let entry = voxels.entry(key).or_insert((0.0, 0.0, 0.0, 0.0, 0));
            entry.0 += cloud.xs[i] as f64;
            entry.1 += cloud.ys[i] as f64;
            entry.2 += cloud.zs[i] as f64;
            entry.3 += cloud.intensities[i] as f64;
            entry.4 += 1;
        }

        let mut out = PointCloud3D::with_capacity(voxels.len());
        for (sx, sy, sz, si, n) in voxels.into_values() {
            let n = n as f64;
            out.push(
                (sx / n) as f32,
                (sy / n) as f32,
                (sz / n) as f32,
                (si / n) as f32,
            );
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_merges_points_in_one_voxel() {
        let mut cloud = PointCloud3D::new();
        cloud.push(0.01, 0.01, 0.01, 1.0);
        cloud.push(0.03, 0.03, 0.03, 3.0);

        let out = VoxelGridFilter::new(0.1).filter(&cloud);
        assert_eq!(out.len(), 1);
        assert_relative_eq!(out.xs[0], 0.02, epsilon = 1e-6);
        assert_relative_eq!(out.intensities[0], 2.0, epsilon = 1e-6);
    }

    #[test]
    fn test_keeps_separated_points() {
        let mut cloud = PointCloud3D::new();
        cloud.push(0.0, 0.0, 0.0, 0.0);
        cloud.push(1.0, 0.0, 0.0, 0.0);
        cloud.push(0.0, 1.0, 0.0, 0.0);

        let out = VoxelGridFilter::new(0.1).filter(&cloud);
        assert_eq!(out.len(), 3);
    }

    #[test]
    fn test_zero_leaf_passthrough() {
        let mut cloud = PointCloud3D::new();
        cloud.push(0.0, 0.0, 0.0, 0.0);
        cloud.push(0.001, 0.0, 0.0, 0.0);

        let out = VoxelGridFilter::new(0.0).filter(&cloud);
        assert_eq!(out.len(), 2);
    }
}
