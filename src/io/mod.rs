//! Persisted artifacts.

mod artifacts;

pub use artifacts::{
    build_estimation_record, save_estimation_record, save_map_artifacts, save_pcd,
    EstimationRecord, ObjectRecord, PoseRecord,
};
