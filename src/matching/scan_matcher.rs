//! Scan-to-map alignment.
//!
//! Iterative least squares over edge-to-line and plane residuals against
//! the local sub-map. The linear system is assembled in a camera-aligned
//! chart with axes reordered from the lidar frame (`x←y, y←z, z←x`), a
//! convention inherited from the original LOAM derivation and kept so the
//! numerics match published results. Degenerate directions are detected at
//! the first iteration and projected out of every subsequent update.

use nalgebra::{Matrix6, SymmetricEigen, Vector6};

use crate::config::MatchingConfig;
use crate::core::math::{blend_axis_angle, constrain};
use crate::core::types::{PointCloud3D, Pose3D};

use super::correspondence::{
    build_kdtree, find_edge_correspondences, find_plane_correspondences, Correspondence,
};

/// Eigenvalue threshold below which a direction counts as degenerate.
const DEGENERACY_EIGENVALUE_THRESHOLD: f64 = 100.0;

/// Minimum correspondences required to solve.
const MIN_CORRESPONDENCES: usize = 50;

/// Maximum outer iterations.
const MAX_ITERATIONS: u32 = 30;

/// IMU attitude hint for roll/pitch blending.
#[derive(Debug, Clone, Copy)]
pub struct ImuAttitude {
    pub roll: f64,
    pub pitch: f64,
}

/// Result of a scan-to-map alignment.
#[derive(Debug, Clone)]
pub struct ScanMatchResult {
    /// Refined sensor pose.
    pub pose: Pose3D,

    /// Whether the update converged within the iteration limit.
    pub converged: bool,

    /// Whether degenerate geometry was detected at the first iteration.
    pub is_degenerate: bool,

    /// Outer iterations performed.
    pub iterations: u32,

    /// Correspondences selected in the last iteration.
    pub correspondences: usize,
}

/// Scan-to-map matcher.
pub struct ScanToMapMatcher {
    config: MatchingConfig,
}

impl ScanToMapMatcher {
    /// Create a matcher.
    pub fn new(config: MatchingConfig) -> Self {
        Self { config }
    }

    /// Align the downsampled feature clouds against the sub-map.
    ///
    /// Returns the refined pose; on failure (fewer than 50 correspondences)
    /// the initial pose is returned unmodified with `converged = false`.
    pub fn match_to_map(
        &self,
        edge_ds: &PointCloud3D,
        plane_ds: &PointCloud3D,
        edge_map: &PointCloud3D,
        plane_map: &PointCloud3D,
        initial: &Pose3D,
        imu: Option<ImuAttitude>,
    ) -> ScanMatchResult {
        let edge_tree = build_kdtree(edge_map);
        let plane_tree = build_kdtree(plane_map);

        let (roll, pitch, yaw) = initial.euler_angles();
        let translation = initial.translation();
        // [roll, pitch, yaw, x, y, z]
        let mut t = [roll, pitch, yaw, translation.x, translation.y, translation.z];

        let mut correspondences: Vec<Correspondence> = Vec::new();
        let mut is_degenerate = false;
        let mut projection = Matrix6::<f64>::identity();
        let mut converged = false;
        let mut iterations = 0;

        for iter in 0..MAX_ITERATIONS {
            let pose = Self::pose_from(&t);
            correspondences.clear();
            find_edge_correspondences(
                edge_ds,
                &pose,
                edge_map,
                &edge_tree,
                self.config.number_of_cores,
                &mut correspondences,
            );
            find_plane_correspondences(
                plane_ds,
                &pose,
                plane_map,
                &plane_tree,
                self.config.number_of_cores,
                &mut correspondences,
            );

            if correspondences.len() < MIN_CORRESPONDENCES {
                if iter == 0 {
                    log::warn!(
                        "scan matching skipped: only {} correspondences selected",
                        correspondences.len()
                    );
                    return ScanMatchResult {
                        pose: *initial,
                        converged: false,
                        is_degenerate: false,
                        iterations: 0,
                        correspondences: correspondences.len(),
                    };
                }
                break;
            }
            iterations = iter + 1;

            // lidar -> camera
            let srx = t[1].sin();
            let crx = t[1].cos();
            let sry = t[2].sin();
            let cry = t[2].cos();
            let srz = t[0].sin();
            let crz = t[0].cos();

            let mut ata = Matrix6::<f64>::zeros();
            let mut atb = Vector6::<f64>::zeros();

            for c in &correspondences {
                // lidar -> camera axis reorder
                let px = c.point[1] as f64;
                let py = c.point[2] as f64;
                let pz = c.point[0] as f64;
                let cox = c.coeff[1] as f64;
                let coy = c.coeff[2] as f64;
                let coz = c.coeff[0] as f64;

                let arx = (crx * sry * srz * px + crx * crz * sry * py - srx * sry * pz) * cox
                    + (-srx * srz * px - crz * srx * py - crx * pz) * coy
                    + (crx * cry * srz * px + crx * cry * crz * py - cry * srx * pz) * coz;

                let ary = ((cry * srx * srz - crz * sry) * px
                    + (sry * srz + cry * crz * srx) * py
                    + crx * cry * pz)
                    * cox
                    + ((-cry * crz - srx * sry * srz) * px
                        + (cry * srz - crz * srx * sry) * py
                        - crx * sry * pz)
                        * coz;

                let arz = ((crz * srx * sry - cry * srz) * px + (-cry * crz - srx * sry * srz) * py)
                    * cox
                    + (crx * crz * px - crx * srz * py) * coy
                    + ((sry * srz + cry * crz * srx) * px + (crz * sry - cry * srx * srz) * py)
                        * coz;

                let row = Vector6::new(
                    arz,
                    arx,
                    ary,
                    c.coeff[0] as f64,
                    c.coeff[1] as f64,
                    c.coeff[2] as f64,
                );
                let b = -(c.coeff[3] as f64);

                ata += row * row.transpose();
                atb += row * b;
            }

            if iter == 0 {
                let eigen = SymmetricEigen::new(ata);
                let mut order = [0usize, 1, 2, 3, 4, 5];
                order.sort_by(|&a, &b| eigen.eigenvalues[b].total_cmp(&eigen.eigenvalues[a]));

                // Rows of V are eigenvectors, largest eigenvalue first
                let mut mat_v = Matrix6::<f64>::zeros();
                for (row, &idx) in order.iter().enumerate() {
                    for col in 0..6 {
                        mat_v[(row, col)] = eigen.eigenvectors[(col, idx)];
                    }
                }
                let mut mat_v2 = mat_v;

                is_degenerate = false;
                for row in (0..6).rev() {
                    if eigen.eigenvalues[order[row]] < DEGENERACY_EIGENVALUE_THRESHOLD {
                        for col in 0..6 {
                            mat_v2[(row, col)] = 0.0;
                        }
                        is_degenerate = true;
                    } else {
                        break;
                    }
                }
                let inv = mat_v.try_inverse().unwrap_or_else(|| mat_v.transpose());
                projection = inv * mat_v2;
            }

            let mut dx = match ata.qr().solve(&atb) {
                Some(dx) => dx,
                None => break,
            };
            if is_degenerate {
                dx = projection * dx;
            }

            for i in 0..6 {
                t[i] += dx[i];
            }

            let delta_r = (dx[0].to_degrees().powi(2)
                + dx[1].to_degrees().powi(2)
                + dx[2].to_degrees().powi(2))
            .sqrt();
            let delta_t = ((dx[3] * 100.0).powi(2)
                + (dx[4] * 100.0).powi(2)
                + (dx[5] * 100.0).powi(2))
            .sqrt();

            if delta_r < 0.05 && delta_t < 0.05 {
                converged = true;
                break;
            }
        }

        self.transform_update(&mut t, imu);

        ScanMatchResult {
            pose: Self::pose_from(&t),
            converged,
            is_degenerate,
            iterations,
            correspondences: correspondences.len(),
        }
    }

    /// Fold IMU roll/pitch into the matched pose and apply clamps.
    fn transform_update(&self, t: &mut [f64; 6], imu: Option<ImuAttitude>) {
        if let Some(imu) = imu {
            if imu.pitch.abs() < 1.4 {
                let w = self.config.imu_rpy_weight;
                t[0] = blend_axis_angle(t[0], imu.roll, w, 0);
                t[1] = blend_axis_angle(t[1], imu.pitch, w, 1);
            }
        }

        t[0] = constrain(t[0], self.config.rotation_tolerance);
        t[1] = constrain(t[1], self.config.rotation_tolerance);
        t[5] = constrain(t[5], self.config.z_tolerance);
    }

    fn pose_from(t: &[f64; 6]) -> Pose3D {
        Pose3D::from_euler(t[3], t[4], t[5], t[0], t[1], t[2])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    /// Structured room: ground plane, two walls, and four pillars.
    fn room_scene() -> (PointCloud3D, PointCloud3D) {
        let mut edges = PointCloud3D::new();
        let mut planes = PointCloud3D::new();

        for (px, py) in [(2.0, 2.0), (-2.0, 2.0), (2.0, -2.0), (-2.0, -2.0)] {
            for i in 0..25 {
                edges.push(px, py, i as f32 * 0.08, 0.0);
            }
        }

        for xi in -25..25 {
            for yi in -25..25 {
                planes.push(xi as f32 * 0.2, yi as f32 * 0.2, 0.0, 0.0);
            }
        }
        // Walls at x = ±5
        for yi in -25..25 {
            for zi in 0..10 {
                planes.push(5.0, yi as f32 * 0.2, zi as f32 * 0.2, 0.0);
                planes.push(-5.0, yi as f32 * 0.2, zi as f32 * 0.2, 0.0);
            }
        }

        (edges, planes)
    }

    #[test]
    fn test_recovers_small_offset() {
        let (edge_map, plane_map) = room_scene();

        // Sensor at a known pose: the scan is the scene seen from there.
        let truth = Pose3D::from_euler(0.1, -0.05, 0.02, 0.0, 0.0, 0.01);
        let edge_scan = edge_map.transform(&truth.inverse());
        let plane_scan = plane_map.transform(&truth.inverse());

        let matcher = ScanToMapMatcher::new(MatchingConfig::default());
        let result = matcher.match_to_map(
            &edge_scan,
            &plane_scan,
            &edge_map,
            &plane_map,
            &Pose3D::identity(),
            None,
        );

        assert!(result.correspondences >= 50);
        assert!(result.pose.translation_distance(&truth) < 0.03);
    }

    #[test]
    fn test_recovers_offset_under_sensor_noise() {
        use rand::{rngs::StdRng, Rng, SeedableRng};

        let (edge_map, plane_map) = room_scene();
        let truth = Pose3D::from_euler(0.08, 0.05, 0.0, 0.0, 0.0, 0.01);

        let mut rng = StdRng::seed_from_u64(7);
        let mut jitter = |cloud: &PointCloud3D| {
            let mut out = PointCloud3D::with_capacity(cloud.len());
            for i in 0..cloud.len() {
                out.push(
                    cloud.xs[i] + rng.gen_range(-0.01..0.01),
                    cloud.ys[i] + rng.gen_range(-0.01..0.01),
                    cloud.zs[i] + rng.gen_range(-0.01..0.01),
                    cloud.intensities[i],
                );
            }
            out
        };
        let edge_scan = jitter(&edge_map.transform(&truth.inverse()));
        let plane_scan = jitter(&plane_map.transform(&truth.inverse()));

        let matcher = ScanToMapMatcher::new(MatchingConfig::default());
        let result = matcher.match_to_map(
            &edge_scan,
            &plane_scan,
            &edge_map,
            &plane_map,
            &Pose3D::identity(),
            None,
        );

        assert!(result.pose.translation_distance(&truth) < 0.05);
    }

    #[test]
    fn test_insufficient_features_returns_initial() {
        let mut edge_map = PointCloud3D::new();
        let mut plane_map = PointCloud3D::new();
        for i in 0..10 {
            edge_map.push(i as f32, 0.0, 0.0, 0.0);
            plane_map.push(i as f32, 1.0, 0.0, 0.0);
        }

        let initial = Pose3D::from_euler(1.0, 2.0, 3.0, 0.0, 0.0, 0.0);
        let matcher = ScanToMapMatcher::new(MatchingConfig::default());
        let result = matcher.match_to_map(
            &edge_map,
            &plane_map,
            &edge_map,
            &plane_map,
            &initial,
            None,
        );

        assert!(!result.converged);
        assert_relative_eq!(result.pose.translation().x, 1.0, epsilon = 1e-9);
    }

    #[test]
    fn test_corridor_is_degenerate() {
        // Two infinite walls along x: nothing constrains motion along the
        // corridor axis.
        let mut plane_map = PointCloud3D::new();
        for xi in -50..50 {
            for zi in 0..8 {
                plane_map.push(xi as f32 * 0.2, 2.0, zi as f32 * 0.25, 0.0);
                plane_map.push(xi as f32 * 0.2, -2.0, zi as f32 * 0.25, 0.0);
            }
        }
        let edge_map = PointCloud3D::new();

        let matcher = ScanToMapMatcher::new(MatchingConfig::default());
        let result = matcher.match_to_map(
            &edge_map,
            &plane_map.clone(),
            &edge_map,
            &plane_map,
            &Pose3D::identity(),
            None,
        );

        assert!(result.is_degenerate);
    }

    #[test]
    fn test_imu_blending_pulls_roll() {
        let (edge_map, plane_map) = room_scene();
        let edge_scan = edge_map.clone();
        let plane_scan = plane_map.clone();

        let mut config = MatchingConfig::default();
        config.imu_rpy_weight = 1.0;
        let matcher = ScanToMapMatcher::new(config);

        let result = matcher.match_to_map(
            &edge_scan,
            &plane_scan,
            &edge_map,
            &plane_map,
            &Pose3D::identity(),
            Some(ImuAttitude {
                roll: 0.2,
                pitch: 0.0,
            }),
        );

        let (roll, _, _) = result.pose.euler_angles();
        assert_relative_eq!(roll, 0.2, epsilon = 1e-6);
    }
}
