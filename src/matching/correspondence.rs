//! Correspondence search for scan-to-map alignment.
//!
//! Edge features match against lines fitted through their 5 nearest map
//! neighbors; planar features match against planes fitted by least squares.
//! Each accepted correspondence carries the residual direction scaled by a
//! distance-decaying weight, ready for stacking into the linear system.
//! Search is chunked across `cores` scoped threads; chunk results are
//! appended in order, so the output is deterministic.

use kiddo::SquaredEuclidean;
use nalgebra::{Matrix3, SMatrix, SVector, SymmetricEigen};

use crate::core::types::{PointCloud3D, Pose3D};

/// K-d tree bucket size, large enough to hold leaves with many coincident
/// coordinates (e.g. a flat ground plane) without overflowing on split.
const KDTREE_BUCKET: usize = 8192;

/// K-d tree over 3D points with a bucket size tuned for this crate's data.
pub type KdTree = kiddo::float::kdtree::KdTree<f32, u64, 3, KDTREE_BUCKET, u32>;

/// Neighbors used for line and plane fits.
const NEIGHBOR_COUNT: usize = 5;

/// Below this many features the chunking overhead is not worth it.
const PARALLEL_MIN_POINTS: usize = 64;

/// A selected feature with its weighted residual coefficients.
///
/// `point` is the untransformed feature in the sensor frame; `coeff` is
/// `(s·a, s·b, s·c, s·d)` where `(a, b, c)` is the residual direction in
/// the map frame, `d` the point-to-primitive distance, and `s` the weight.
#[derive(Debug, Clone, Copy)]
pub struct Correspondence {
    pub point: [f32; 3],
    pub coeff: [f32; 4],
}

/// Build a k-d tree from a point cloud.
pub fn build_kdtree(cloud: &PointCloud3D) -> KdTree {
    let mut tree: KdTree = KdTree::new();
    for i in 0..cloud.len() {
        tree.add(&[cloud.xs[i], cloud.ys[i], cloud.zs[i]], i as u64);
    }
    tree
}

/// Rotation rows and translation of a pose, in `f32` for point transforms.
fn pose_rows(pose: &Pose3D) -> ([[f32; 3]; 3], [f32; 3]) {
    let m = pose.isometry().to_homogeneous();
    (
        [
            [m[(0, 0)] as f32, m[(0, 1)] as f32, m[(0, 2)] as f32],
            [m[(1, 0)] as f32, m[(1, 1)] as f32, m[(1, 2)] as f32],
            [m[(2, 0)] as f32, m[(2, 1)] as f32, m[(2, 2)] as f32],
        ],
        [m[(0, 3)] as f32, m[(1, 3)] as f32, m[(2, 3)] as f32],
    )
}

#[inline]
fn apply(rows: &([[f32; 3]; 3], [f32; 3]), p: [f32; 3]) -> [f32; 3] {
    let (r, t) = rows;
    [
        r[0][0] * p[0] + r[0][1] * p[1] + r[0][2] * p[2] + t[0],
        r[1][0] * p[0] + r[1][1] * p[1] + r[1][2] * p[2] + t[1],
        r[2][0] * p[0] + r[2][1] * p[1] + r[2][2] * p[2] + t[2],
    ]
}

/// Run a per-point evaluator over the cloud, chunked across threads.
fn search_chunked<F>(cloud: &PointCloud3D, cores: usize, output: &mut Vec<Correspondence>, eval: F)
where
    F: Fn(usize) -> Option<Correspondence> + Sync,
{
    let len = cloud.len();
    if cores <= 1 || len < PARALLEL_MIN_POINTS {
        output.extend((0..len).filter_map(eval));
        return;
    }

    let chunk = (len + cores - 1) / cores;
    let results: Vec<Vec<Correspondence>> = std::thread::scope(|scope| {
        let eval = &eval;
        let handles: Vec<_> = (0..cores)
            .map(|c| {
                let range = (c * chunk)..((c + 1) * chunk).min(len);
                scope.spawn(move || range.filter_map(eval).collect::<Vec<_>>())
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("correspondence worker panicked"))
            .collect()
    });
    for part in results {
        output.extend(part);
    }
}

/// Find edge-to-line correspondences.
///
/// For each edge feature transformed into the map frame, fits a line through
/// its 5 nearest edge-map neighbors when their covariance is strongly
/// anisotropic (dominant eigenvalue at least 3x the next), and emits a
/// point-to-line residual weighted by `s = 1 - 0.9·|d|`, accepted for
/// `s > 0.1`.
pub fn find_edge_correspondences(
    edge_ds: &PointCloud3D,
    pose: &Pose3D,
    edge_map: &PointCloud3D,
    tree: &KdTree,
    cores: usize,
    output: &mut Vec<Correspondence>,
) {
    if edge_map.len() < NEIGHBOR_COUNT {
        return;
    }
    let rows = pose_rows(pose);

    search_chunked(edge_ds, cores, output, |i| {
        edge_correspondence(edge_ds.point(i), &rows, edge_map, tree)
    });
}

fn edge_correspondence(
    point_ori: [f32; 3],
    rows: &([[f32; 3]; 3], [f32; 3]),
    edge_map: &PointCloud3D,
    tree: &KdTree,
) -> Option<Correspondence> {
    let sel = apply(rows, point_ori);

    let neighbors = tree.nearest_n::<SquaredEuclidean>(&sel, NEIGHBOR_COUNT);
    if neighbors.len() < NEIGHBOR_COUNT || neighbors[NEIGHBOR_COUNT - 1].distance >= 1.0 {
        return None;
    }

    // Centroid and covariance of the neighborhood
    let (mut cx, mut cy, mut cz) = (0.0f32, 0.0f32, 0.0f32);
    for n in &neighbors {
        let p = edge_map.point(n.item as usize);
        cx += p[0];
        cy += p[1];
        cz += p[2];
    }
    cx /= NEIGHBOR_COUNT as f32;
    cy /= NEIGHBOR_COUNT as f32;
    cz /= NEIGHBOR_COUNT as f32;

    let (mut a11, mut a12, mut a13, mut a22, mut a23, mut a33) =
        (0.0f32, 0.0f32, 0.0f32, 0.0f32, 0.0f32, 0.0f32);
    for n in &neighbors {
        let p = edge_map.point(n.item as usize);
        let (ax, ay, az) = (p[0] - cx, p[1] - cy, p[2] - cz);
        a11 += ax * ax;
        a12 += ax * ay;
        a13 += ax * az;
        a22 += ay * ay;
        a23 += ay * az;
        a33 += az * az;
    }
    let inv_n = 1.0 / NEIGHBOR_COUNT as f32;
    let cov = Matrix3::new(a11, a12, a13, a12, a22, a23, a13, a23, a33) * inv_n;

    let eigen = SymmetricEigen::new(cov);
    let mut order = [0usize, 1, 2];
    order.sort_by(|&a, &b| eigen.eigenvalues[b].total_cmp(&eigen.eigenvalues[a]));
    let d1 = eigen.eigenvalues[order[0]];
    let d2 = eigen.eigenvalues[order[1]];

    if d1 <= 3.0 * d2 {
        return None;
    }

    let dir = eigen.eigenvectors.column(order[0]);
    let (x0, y0, z0) = (sel[0], sel[1], sel[2]);
    let (x1, y1, z1) = (cx + 0.1 * dir[0], cy + 0.1 * dir[1], cz + 0.1 * dir[2]);
    let (x2, y2, z2) = (cx - 0.1 * dir[0], cy - 0.1 * dir[1], cz - 0.1 * dir[2]);

    let a012 = (((x0 - x1) * (y0 - y2) - (x0 - x2) * (y0 - y1))
        * ((x0 - x1) * (y0 - y2) - (x0 - x2) * (y0 - y1))
        + ((x0 - x1) * (z0 - z2) - (x0 - x2) * (z0 - z1))
            * ((x0 - x1) * (z0 - z2) - (x0 - x2) * (z0 - z1))
        + ((y0 - y1) * (z0 - z2) - (y0 - y2) * (z0 - z1))
            * ((y0 - y1) * (z0 - z2) - (y0 - y2) * (z0 - z1)))
        .sqrt();
    let l12 = ((x1 - x2) * (x1 - x2) + (y1 - y2) * (y1 - y2) + (z1 - z2) * (z1 - z2)).sqrt();
    if a012 < 1e-12 || l12 < 1e-12 {
        return None;
    }

    let la = ((y1 - y2) * ((x0 - x1) * (y0 - y2) - (x0 - x2) * (y0 - y1))
        + (z1 - z2) * ((x0 - x1) * (z0 - z2) - (x0 - x2) * (z0 - z1)))
        / a012
        / l12;
    let lb = -((x1 - x2) * ((x0 - x1) * (y0 - y2) - (x0 - x2) * (y0 - y1))
        - (z1 - z2) * ((y0 - y1) * (z0 - z2) - (y0 - y2) * (z0 - z1)))
        / a012
        / l12;
    let lc = -((x1 - x2) * ((x0 - x1) * (z0 - z2) - (x0 - x2) * (z0 - z1))
        + (y1 - y2) * ((y0 - y1) * (z0 - z2) - (y0 - y2) * (z0 - z1)))
        / a012
        / l12;

    let ld2 = a012 / l12;
    let s = 1.0 - 0.9 * ld2.abs();

    if s > 0.1 {
        Some(Correspondence {
            point: point_ori,
            coeff: [s * la, s * lb, s * lc, s * ld2],
        })
    } else {
        None
    }
}

/// Find plane correspondences.
///
/// Fits `ax + by + cz = -1` through the 5 nearest plane-map neighbors,
/// normalizes, and validates all 5 lie within 0.2 of the plane. The
/// residual weight decays with distance and grows with feature range:
/// `s = 1 - 0.9·|d| / √‖p‖`, accepted for `s > 0.1`.
pub fn find_plane_correspondences(
    plane_ds: &PointCloud3D,
    pose: &Pose3D,
    plane_map: &PointCloud3D,
    tree: &KdTree,
    cores: usize,
    output: &mut Vec<Correspondence>,
) {
    if plane_map.len() < NEIGHBOR_COUNT {
        return;
    }
    let rows = pose_rows(pose);

    search_chunked(plane_ds, cores, output, |i| {
        plane_correspondence(plane_ds.point(i), &rows, plane_map, tree)
    });
}

fn plane_correspondence(
    point_ori: [f32; 3],
    rows: &([[f32; 3]; 3], [f32; 3]),
    plane_map: &PointCloud3D,
    tree: &KdTree,
) -> Option<Correspondence> {
    let sel = apply(rows, point_ori);

    let neighbors = tree.nearest_n::<SquaredEuclidean>(&sel, NEIGHBOR_COUNT);
    if neighbors.len() < NEIGHBOR_COUNT || neighbors[NEIGHBOR_COUNT - 1].distance >= 1.0 {
        return None;
    }

    let mut mat_a: SMatrix<f32, 5, 3> = SMatrix::zeros();
    for (j, n) in neighbors.iter().enumerate() {
        let p = plane_map.point(n.item as usize);
        mat_a[(j, 0)] = p[0];
        mat_a[(j, 1)] = p[1];
        mat_a[(j, 2)] = p[2];
    }
    let mat_b: SVector<f32, 5> = SVector::repeat(-1.0);

    let solution = mat_a.svd(true, true).solve(&mat_b, 1e-10).ok()?;

    let (mut pa, mut pb, mut pc) = (solution[0], solution[1], solution[2]);
    let mut pd = 1.0f32;
    let ps = (pa * pa + pb * pb + pc * pc).sqrt();
    if ps < 1e-12 {
        return None;
    }
    pa /= ps;
    pb /= ps;
    pc /= ps;
    pd /= ps;

    for n in &neighbors {
        let p = plane_map.point(n.item as usize);
        if (pa * p[0] + pb * p[1] + pc * p[2] + pd).abs() > 0.2 {
            return None;
        }
    }

    let pd2 = pa * sel[0] + pb * sel[1] + pc * sel[2] + pd;
    let range = (sel[0] * sel[0] + sel[1] * sel[1] + sel[2] * sel[2]).sqrt();
    let s = 1.0 - 0.9 * pd2.abs() / range.sqrt().max(1e-6);

    if s > 0.1 {
        Some(Correspondence {
            point: point_ori,
            coeff: [s * pa, s * pb, s * pc, s * pd2],
        })
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line_cloud() -> PointCloud3D {
        let mut cloud = PointCloud3D::new();
        // A vertical pole at (2, 1)
        for i in 0..20 {
            cloud.push(2.0, 1.0, i as f32 * 0.1, 0.0);
        }
        cloud
    }

    fn plane_cloud() -> PointCloud3D {
        let mut cloud = PointCloud3D::new();
        // Ground plane z = 0
        for xi in 0..20 {
            for yi in 0..20 {
                cloud.push(xi as f32 * 0.2, yi as f32 * 0.2, 0.0, 0.0);
            }
        }
        cloud
    }

    #[test]
    fn test_edge_correspondence_on_line() {
        let map = line_cloud();
        let tree = build_kdtree(&map);

        let mut features = PointCloud3D::new();
        features.push(2.05, 1.0, 0.5, 0.0); // 5cm off the pole

        let mut out = Vec::new();
        find_edge_correspondences(&features, &Pose3D::identity(), &map, &tree, 1, &mut out);

        assert_eq!(out.len(), 1);
        // residual distance ~0.05
        assert!((out[0].coeff[3].abs() - 0.05 * (1.0 - 0.9 * 0.05)).abs() < 0.02);
    }

    #[test]
    fn test_plane_correspondence_on_ground() {
        let map = plane_cloud();
        let tree = build_kdtree(&map);

        let mut features = PointCloud3D::new();
        features.push(2.0, 2.0, 0.1, 0.0); // 10cm above the ground

        let mut out = Vec::new();
        find_plane_correspondences(&features, &Pose3D::identity(), &map, &tree, 1, &mut out);

        assert_eq!(out.len(), 1);
        // direction is the plane normal (±z)
        assert!(out[0].coeff[2].abs() > out[0].coeff[0].abs());
        assert!(out[0].coeff[2].abs() > out[0].coeff[1].abs());
    }

    #[test]
    fn test_far_feature_rejected() {
        let map = plane_cloud();
        let tree = build_kdtree(&map);

        let mut features = PointCloud3D::new();
        features.push(50.0, 50.0, 0.0, 0.0); // nowhere near the map

        let mut out = Vec::new();
        find_plane_correspondences(&features, &Pose3D::identity(), &map, &tree, 1, &mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn test_parallel_matches_serial() {
        let map = plane_cloud();
        let tree = build_kdtree(&map);

        let mut features = PointCloud3D::new();
        for xi in 0..30 {
            for yi in 0..30 {
                features.push(xi as f32 * 0.13, yi as f32 * 0.13, 0.05, 0.0);
            }
        }

        let mut serial = Vec::new();
        find_plane_correspondences(&features, &Pose3D::identity(), &map, &tree, 1, &mut serial);

        let mut parallel = Vec::new();
        find_plane_correspondences(&features, &Pose3D::identity(), &map, &tree, 4, &mut parallel);

        assert_eq!(serial.len(), parallel.len());
        for (a, b) in serial.iter().zip(parallel.iter()) {
            assert_eq!(a.point, b.point);
        }
    }
}
