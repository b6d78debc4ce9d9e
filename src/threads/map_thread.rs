//! Global-map maintenance thread.
//!
//! Periodically (0.2 Hz by default) assembles a downsampled snapshot of the
//! keyframes around the current pose and publishes it into the shared
//! context. Read-only access to the keyframe store; the snapshot swap is
//! the only write.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::core::types::PointCloud3D;
use crate::preprocess::VoxelGridFilter;
use crate::state::SlamContextHandle;

/// Snapshot period in seconds (0.2 Hz).
const SNAPSHOT_PERIOD_SECS: f64 = 5.0;

/// Radius around the latest keyframe included in the snapshot (meters).
const SNAPSHOT_RADIUS: f64 = 1000.0;

/// Leaf size for the published global map (meters).
const SNAPSHOT_LEAF_SIZE: f32 = 0.5;

/// Handle for the global-map worker.
pub struct GlobalMapThread {
    handle: JoinHandle<()>,
}

impl GlobalMapThread {
    /// Spawn the worker.
    pub fn spawn(ctx: SlamContextHandle, running: Arc<AtomicBool>) -> Self {
        let handle = thread::Builder::new()
            .name("global-map".into())
            .spawn(move || {
                let period = Duration::from_secs_f64(SNAPSHOT_PERIOD_SECS);
                while running.load(Ordering::Relaxed) {
                    thread::sleep(period);
                    publish_global_map(&ctx);
                }
            })
            .expect("failed to spawn global-map thread");

        Self { handle }
    }

    /// Wait for the worker to finish.
    pub fn join(self) -> thread::Result<()> {
        self.handle.join()
    }
}

/// Assemble and publish one snapshot. Public so offline pipelines can call
/// it directly.
pub fn publish_global_map(ctx: &SlamContextHandle) {
    let assembled = {
        let estimator = ctx.estimator.lock();
        let store = estimator.keyframes();
        let latest = match store.latest() {
            Some(keyframe) => keyframe.pose,
            None => return,
        };

        let mut cloud = PointCloud3D::new();
        for id in store.neighbors_within(&latest, SNAPSHOT_RADIUS) {
            let keyframe = store.get(id).expect("neighbor id valid");
            cloud.extend(&keyframe.edge_cloud.transform(&keyframe.pose));
            cloud.extend(&keyframe.plane_cloud.transform(&keyframe.pose));
        }
        cloud
    };

    let snapshot = VoxelGridFilter::new(SNAPSHOT_LEAF_SIZE).filter(&assembled);
    *ctx.global_map.lock() = Some(snapshot);
}
