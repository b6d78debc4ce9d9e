//! Loop-closure worker thread.
//!
//! Runs at `loop_closure_frequency`. Each pass copies what it needs from
//! the keyframe store under the estimator lock (keypose snapshot plus the
//! two assembled neighborhoods), runs ICP with the lock released, and
//! re-acquires it only to push the verified constraint.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::adapters::PendingLoopFactor;
use crate::config::LoopClosureConfig;
use crate::core::types::Pose3D;
use crate::matching::{align, IcpConfig};
use crate::state::SlamContextHandle;

/// Minimum points in the current-keyframe cloud to attempt ICP.
const MIN_CURRENT_CLOUD: usize = 300;

/// Minimum points in the historical neighborhood to attempt ICP.
const MIN_HISTORY_CLOUD: usize = 1000;

/// Handle for the loop-closure worker.
pub struct LoopClosureThread {
    handle: JoinHandle<()>,
}

impl LoopClosureThread {
    /// Spawn the worker. Returns immediately when loop closure is disabled.
    pub fn spawn(
        ctx: SlamContextHandle,
        config: LoopClosureConfig,
        running: Arc<AtomicBool>,
    ) -> Self {
        let handle = thread::Builder::new()
            .name("loop-closure".into())
            .spawn(move || {
                if !config.loop_closure_enable_flag {
                    return;
                }
                let period = Duration::from_secs_f64(1.0 / config.loop_closure_frequency.max(1e-3));
                while running.load(Ordering::Relaxed) {
                    thread::sleep(period);
                    perform_loop_closure(&ctx, &config);
                }
            })
            .expect("failed to spawn loop-closure thread");

        Self { handle }
    }

    /// Wait for the worker to finish.
    pub fn join(self) -> thread::Result<()> {
        self.handle.join()
    }
}

/// One loop-closure pass. Public so offline pipelines can drive it
/// synchronously between steps.
pub fn perform_loop_closure(ctx: &SlamContextHandle, config: &LoopClosureConfig) {
    // Copy everything ICP needs while holding the estimator lock
    let prepared = {
        let estimator = ctx.estimator.lock();
        if estimator.keyframes().is_empty() {
            return;
        }

        let keyposes: Vec<(f64, Pose3D)> = estimator
            .keyframes()
            .iter()
            .map(|kf| (kf.time, kf.pose))
            .collect();

        let external = ctx.loop_info.lock().pop();
        let candidate = external
            .and_then(|(time_cur, time_pre)| detect_external(&keyposes, time_cur, time_pre, config))
            .or_else(|| detect_by_distance(&keyposes, config))
            .filter(|&(cur, _)| !estimator.loop_queue().contains_cur(cur));

        candidate.map(|(cur, pre)| {
            (
                cur,
                pre,
                estimator.assemble_near_keyframes(cur, 0),
                estimator.assemble_near_keyframes(pre, config.history_keyframe_search_num),
                keyposes[cur].1,
                keyposes[pre].1,
            )
        })
    };

    let (cur, pre, cur_cloud, pre_cloud, pose_cur, pose_pre) = match prepared {
        Some(prepared) => prepared,
        None => return,
    };

    if cur_cloud.len() < MIN_CURRENT_CLOUD || pre_cloud.len() < MIN_HISTORY_CLOUD {
        return;
    }

    // ICP runs with the lock released
    let icp_config = IcpConfig {
        max_correspondence_distance: (config.history_keyframe_search_radius * 2.0) as f32,
        ..IcpConfig::default()
    };
    let result = align(&cur_cloud, &pre_cloud, &icp_config);

    if !result.converged || result.fitness > config.history_keyframe_fitness_score {
        return;
    }

    // Pre-multiply: the ICP correction moves the wrongly-placed current
    // keyframe onto the map, then the constraint is measured to the old one.
    let corrected = result.transform.compose(&pose_cur);
    let between = corrected.between(&pose_pre);

    let accepted = ctx.estimator.lock().push_loop_factor(PendingLoopFactor {
        cur,
        pre,
        between,
        noise: result.fitness as f64,
    });
    if accepted {
        log::info!(
            "loop closure verified between keyframes {} and {} (fitness {:.3})",
            cur,
            pre,
            result.fitness
        );
    }
}

/// Distance-based candidate: the newest keyframe against the oldest
/// keyframe inside the search radius that is old enough.
fn detect_by_distance(
    keyposes: &[(f64, Pose3D)],
    config: &LoopClosureConfig,
) -> Option<(usize, usize)> {
    let cur = keyposes.len() - 1;
    let (time_cur, pose_cur) = keyposes[cur];

    let radius_sq = config.history_keyframe_search_radius * config.history_keyframe_search_radius;
    for (id, (time, pose)) in keyposes.iter().enumerate() {
        if id == cur {
            continue;
        }
        let d = pose.translation() - pose_cur.translation();
        if d.norm_squared() > radius_sq {
            continue;
        }
        if (time_cur - time).abs() > config.history_keyframe_search_time_diff {
            return Some((cur, id));
        }
    }
    None
}

/// Map an external `(time_cur, time_pre)` candidate onto keyframe ids.
fn detect_external(
    keyposes: &[(f64, Pose3D)],
    time_cur: f64,
    time_pre: f64,
    config: &LoopClosureConfig,
) -> Option<(usize, usize)> {
    if (time_cur - time_pre).abs() < config.history_keyframe_search_time_diff {
        return None;
    }
    if keyposes.len() < 2 {
        return None;
    }

    let mut cur = keyposes.len() - 1;
    for (id, (time, _)) in keyposes.iter().enumerate().rev() {
        if *time >= time_cur {
            cur = id;
        } else {
            break;
        }
    }

    let mut pre = 0;
    for (id, (time, _)) in keyposes.iter().enumerate() {
        if *time <= time_pre {
            pre = id;
        } else {
            break;
        }
    }

    if cur == pre {
        return None;
    }
    Some((cur, pre))
}
