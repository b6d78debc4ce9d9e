//! Point-to-point ICP for loop-closure verification.
//!
//! Classic nearest-neighbor ICP with SVD alignment. Used by the loop
//! closure worker to verify a candidate match between the current keyframe
//! neighborhood and a historical one; the fitness score (mean squared
//! nearest distance) gates acceptance.

use kiddo::SquaredEuclidean;
use nalgebra::{Matrix3, Rotation3, UnitQuaternion, Vector3};

use crate::core::types::{PointCloud3D, Pose3D};

use super::correspondence::build_kdtree;

/// ICP configuration.
#[derive(Debug, Clone)]
pub struct IcpConfig {
    /// Maximum iterations.
    pub max_iterations: u32,

    /// Maximum distance (meters) for a valid correspondence.
    pub max_correspondence_distance: f32,

    /// Convergence threshold on the incremental transform magnitude.
    pub transformation_epsilon: f64,

    /// Minimum correspondences to keep iterating.
    pub min_correspondences: usize,
}

impl Default for IcpConfig {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            max_correspondence_distance: 30.0,
            transformation_epsilon: 1e-6,
            min_correspondences: 10,
        }
    }
}

/// Result of an ICP alignment.
#[derive(Debug, Clone)]
pub struct IcpResult {
    /// Transform mapping source into the target frame.
    pub transform: Pose3D,

    /// Mean squared nearest-neighbor distance after alignment.
    pub fitness: f32,

    /// Whether the alignment converged.
    pub converged: bool,

    /// Iterations performed.
    pub iterations: u32,
}

/// Align `source` onto `target`.
pub fn align(source: &PointCloud3D, target: &PointCloud3D, config: &IcpConfig) -> IcpResult {
    let mut result = IcpResult {
        transform: Pose3D::identity(),
        fitness: f32::MAX,
        converged: false,
        iterations: 0,
    };
    if source.is_empty() || target.is_empty() {
        return result;
    }

    let tree = build_kdtree(target);
    let max_dist_sq = config.max_correspondence_distance * config.max_correspondence_distance;

    for iter in 0..config.max_iterations {
        result.iterations = iter + 1;
        let transformed = source.transform(&result.transform);

        // Matched point pairs and their centroids
        let mut src_centroid = Vector3::<f64>::zeros();
        let mut tgt_centroid = Vector3::<f64>::zeros();
        let mut pairs: Vec<(Vector3<f64>, Vector3<f64>)> = Vec::new();

        for i in 0..transformed.len() {
            let p = transformed.point(i);
            let nearest = tree.nearest_one::<SquaredEuclidean>(&p);
            if nearest.distance > max_dist_sq {
                continue;
            }
            let q = target.point(nearest.item as usize);
            let pv = Vector3::new(p[0] as f64, p[1] as f64, p[2] as f64);
            let qv = Vector3::new(q[0] as f64, q[1] as f64, q[2] as f64);
            src_centroid += pv;
            tgt_centroid += qv;
            pairs.push((pv, qv));
        }

        if pairs.len() < config.min_correspondences {
            return result;
        }
        let n = pairs.len() as f64;
        src_centroid /= n;
        tgt_centroid /= n;

        // Cross-covariance and SVD alignment
        let mut h = Matrix3::<f64>::zeros();
        for (p, q) in &pairs {
            h += (p - src_centroid) * (q - tgt_centroid).transpose();
        }
        let svd = h.svd(true, true);
        let (u, v_t) = match (svd.u, svd.v_t) {
            (Some(u), Some(v_t)) => (u, v_t),
            _ => return result,
        };
        let mut v = v_t.transpose();
        let mut r = v * u.transpose();
        if r.determinant() < 0.0 {
            v.set_column(2, &(-v.column(2)));
            r = v * u.transpose();
        }
        let t = tgt_centroid - r * src_centroid;

        let delta = Pose3D::from_parts(
            t,
            UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(r)),
        );
        result.transform = delta.compose(&result.transform);

        if delta.log().norm() < config.transformation_epsilon {
            result.converged = true;
            break;
        }
    }

    // Fitness: mean squared nearest distance under the final transform
    let transformed = source.transform(&result.transform);
    let mut sum = 0.0f64;
    let mut count = 0usize;
    for i in 0..transformed.len() {
        let nearest = tree.nearest_one::<SquaredEuclidean>(&transformed.point(i));
        if nearest.distance <= max_dist_sq {
            sum += nearest.distance as f64;
            count += 1;
        }
    }
    if count > 0 {
        result.fitness = (sum / count as f64) as f32;
    }

    result
}
