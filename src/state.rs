//! Shared state between the estimation loop and worker threads.
//!
//! One exclusive lock guards the estimator (keyframe store, solver handle,
//! ego-pose state, queues); the main loop holds it end-to-end while
//! processing a step. The external loop-candidate queue and the global-map
//! snapshot have their own locks so producers never contend with a step in
//! flight longer than necessary.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::adapters::{GpsMeasurement, LoopInfoQueue};
use crate::config::GatiConfig;
use crate::core::types::PointCloud3D;
use crate::engine::JointEstimator;

/// Shared state for a running SLAM session.
pub struct SlamContext {
    /// The estimator, serialized behind one exclusive lock.
    pub estimator: Mutex<JointEstimator>,

    /// External loop candidates, bounded to the 5 most recent.
    pub loop_info: Mutex<LoopInfoQueue>,

    /// Latest global-map snapshot from the map worker.
    pub global_map: Mutex<Option<PointCloud3D>>,
}

impl SlamContext {
    /// Create a context around a fresh estimator.
    pub fn new(config: GatiConfig) -> Self {
        Self {
            estimator: Mutex::new(JointEstimator::new(config)),
            loop_info: Mutex::new(LoopInfoQueue::new()),
            global_map: Mutex::new(None),
        }
    }

    /// Enqueue an external loop candidate `(time_cur, time_pre)`.
    pub fn push_loop_info(&self, time_cur: f64, time_pre: f64) {
        self.loop_info.lock().push(time_cur, time_pre);
    }

    /// Enqueue a GPS fix.
    pub fn push_gps(&self, measurement: GpsMeasurement) {
        self.estimator.lock().push_gps(measurement);
    }
}

/// Handle type for the shared context.
pub type SlamContextHandle = Arc<SlamContext>;

/// Create a shared context wrapped in an [`Arc`].
pub fn create_context(config: GatiConfig) -> SlamContextHandle {
    Arc::new(SlamContext::new(config))
}
