//! Scan matching: scan-to-map alignment and ICP loop verification.

mod correspondence;
mod icp;
mod scan_matcher;

pub use correspondence::{
    build_kdtree, find_edge_correspondences, find_plane_correspondences, Correspondence, KdTree,
};
pub use icp::{align, IcpConfig, IcpResult};
pub use scan_matcher::{ImuAttitude, ScanMatchResult, ScanToMapMatcher};
