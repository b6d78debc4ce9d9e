//! The incremental joint estimator.
//!
//! One object owns everything a LiDAR step touches: the keyframe store,
//! the sub-map cache, the solver handle, the object tracker, and the
//! collaborator queues. A step runs scan-to-map alignment concurrently
//! with the detection request, decides whether to retain a keyframe, emits
//! odometry/GPS/loop factors and the tracker's object factors, pushes both
//! graph deltas into the solver, and reads the corrected state back.
//!
//! Callers serialize access through one exclusive lock (see
//! [`crate::state::SlamContext`]); the estimator itself is single-threaded
//! apart from the per-step detection task it launches and joins.

use std::sync::Arc;

use nalgebra::{Matrix6, Vector3};

use crate::adapters::{
    DetectionRequest, DetectionService, GpsMeasurement, GpsQueue, LoopQueue, PendingLoopFactor,
};
use crate::config::GatiConfig;
use crate::core::math::blend_axis_angle;
use crate::core::types::{BoundingBox3, PointCloud3D, Pose3D, SweepInput};
use crate::graph::{
    DenseIncrementalSolver, DiagonalNoise, Factor, IncrementalSolver, Key, NodeAllocator,
    SolverConfig, StepBuffers,
};
use crate::matching::{ImuAttitude, ScanToMapMatcher};
use crate::preprocess::VoxelGridFilter;
use crate::tracking::{build_detection_sets, ObjectTracker};

use super::keyframe::KeyframeStore;
use super::submap::{select_surrounding_keyframes, SubmapCache};

/// Travel required before GPS corrections are considered (meters).
const GPS_MIN_TRAVEL: f64 = 5.0;

/// Extra solver sweeps after a loop closure.
const LOOP_CLOSURE_EXTRA_SWEEPS: usize = 5;

/// Per-object state in a step output.
#[derive(Debug, Clone)]
pub struct ObjectStateOutput {
    /// Factor-graph object id.
    pub object_index: u64,

    /// Tracking (visualization) id.
    pub tracking_index: u64,

    /// Object pose in the map frame.
    pub pose: Pose3D,

    /// Object velocity (body-frame twist as a pose).
    pub velocity: Pose3D,

    /// Whether the detection factor couples into the ego estimate.
    pub is_tightly_coupled: bool,

    /// Consecutive missed detections.
    pub lost_count: u32,

    /// Confidence of the last associated detection.
    pub confidence: f64,

    /// Constant-twist rollout of the velocity (0.1 s steps), map frame.
    pub velocity_preview: Vec<Vector3<f64>>,
}

/// Output of one processed LiDAR step.
#[derive(Debug, Clone)]
pub struct StepOutput {
    /// Sweep timestamp.
    pub stamp: f64,

    /// Corrected global sensor pose.
    pub pose: Pose3D,

    /// Smooth incremental odometry pose (chained per-step increments).
    pub incremental_odometry: Pose3D,

    /// Degenerate geometry detected during scan matching.
    pub is_degenerate: bool,

    /// Degeneracy flag as published in `covariance[0]`.
    pub incremental_covariance0: f64,

    /// A keyframe was retained this step.
    pub keyframe_added: bool,

    /// The detection service replied this step.
    pub detection_active: bool,

    /// Snapshot of all keyframe poses.
    pub keyposes: Vec<Pose3D>,

    /// Trajectory path as `(time, pose)` pairs.
    pub path: Vec<(f64, Pose3D)>,

    /// Active tracked objects.
    pub objects: Vec<ObjectStateOutput>,
}

/// The joint LiDAR-inertial and multi-object estimator.
pub struct JointEstimator {
    config: GatiConfig,

    solver: Box<dyn IncrementalSolver>,
    nodes: NodeAllocator,
    buffers: StepBuffers,

    keyframes: KeyframeStore,
    key_pose_indices: Vec<Key>,
    submap: SubmapCache,
    matcher: ScanToMapMatcher,
    corner_filter: VoxelGridFilter,
    surf_filter: VoxelGridFilter,

    tracker: ObjectTracker,

    gps_queue: GpsQueue,
    loop_queue: LoopQueue,
    detector: Option<Arc<dyn DetectionService>>,

    /// Current sensor pose estimate ("transform to be mapped").
    transform: Pose3D,

    /// Marginal covariance of the latest ego key.
    pose_covariance: Matrix6<f64>,

    a_loop_is_closed: bool,
    is_degenerate: bool,

    time_last_processing: f64,
    delta_time: f64,

    last_imu_attitude: Option<Pose3D>,
    last_odom_guess: Option<Pose3D>,

    incremental_front: Pose3D,
    incremental_back: Pose3D,
    incremental_odometry: Option<Pose3D>,

    path: Vec<(f64, Pose3D)>,
}

impl JointEstimator {
    /// Create an estimator with the bundled dense solver.
    pub fn new(config: GatiConfig) -> Self {
        let solver = Box::new(DenseIncrementalSolver::new(SolverConfig::default()));
        Self::with_solver(config, solver)
    }

    /// Create an estimator around a custom solver implementation.
    pub fn with_solver(config: GatiConfig, solver: Box<dyn IncrementalSolver>) -> Self {
        let corner_filter = VoxelGridFilter::new(config.matching.mapping_corner_leaf_size);
        let surf_filter = VoxelGridFilter::new(config.matching.mapping_surf_leaf_size);
        let matcher = ScanToMapMatcher::new(config.matching.clone());

        Self {
            config,
            solver,
            nodes: NodeAllocator::new(),
            buffers: StepBuffers::new(),
            keyframes: KeyframeStore::new(),
            key_pose_indices: Vec::new(),
            submap: SubmapCache::default(),
            matcher,
            corner_filter,
            surf_filter,
            tracker: ObjectTracker::new(),
            gps_queue: GpsQueue::new(),
            loop_queue: LoopQueue::new(),
            detector: None,
            transform: Pose3D::identity(),
            pose_covariance: Matrix6::zeros(),
            a_loop_is_closed: false,
            is_degenerate: false,
            time_last_processing: -1.0,
            delta_time: 0.0,
            last_imu_attitude: None,
            last_odom_guess: None,
            incremental_front: Pose3D::identity(),
            incremental_back: Pose3D::identity(),
            incremental_odometry: None,
            path: Vec::new(),
        }
    }

    /// Attach the detection service.
    pub fn set_detector(&mut self, detector: Arc<dyn DetectionService>) {
        self.detector = Some(detector);
    }

    /// Configuration in use.
    pub fn config(&self) -> &GatiConfig {
        &self.config
    }

    /// The keyframe store.
    pub fn keyframes(&self) -> &KeyframeStore {
        &self.keyframes
    }

    /// The object tracker.
    pub fn tracker(&self) -> &ObjectTracker {
        &self.tracker
    }

    /// The loop constraint queue.
    pub fn loop_queue(&self) -> &LoopQueue {
        &self.loop_queue
    }

    /// The solver's current MAP estimate.
    pub fn solver_estimate(&self) -> &crate::graph::Values {
        self.solver.estimate()
    }

    /// Current sensor pose estimate.
    pub fn current_pose(&self) -> Pose3D {
        self.transform
    }

    /// Trajectory path.
    pub fn path(&self) -> &[(f64, Pose3D)] {
        &self.path
    }

    /// Enqueue a GPS fix.
    pub fn push_gps(&mut self, measurement: GpsMeasurement) {
        self.gps_queue.push(measurement);
    }

    /// Register a verified loop constraint. Duplicates per current keyframe
    /// are rejected.
    pub fn push_loop_factor(&mut self, factor: PendingLoopFactor) -> bool {
        self.loop_queue.push(factor)
    }

    /// Union of the feature clouds of keyframes `key ± search_num`,
    /// transformed into the map frame and downsampled.
    pub fn assemble_near_keyframes(&self, key: usize, search_num: usize) -> PointCloud3D {
        let mut cloud = PointCloud3D::new();
        let len = self.keyframes.len() as i64;
        for offset in -(search_num as i64)..=(search_num as i64) {
            let near = key as i64 + offset;
            if near < 0 || near >= len {
                continue;
            }
            let keyframe = self.keyframes.get(near as usize).expect("index checked");
            cloud.extend(&keyframe.edge_cloud.transform(&keyframe.pose));
            cloud.extend(&keyframe.plane_cloud.transform(&keyframe.pose));
        }
        self.surf_filter.filter(&cloud)
    }

    /// Process one LiDAR sweep.
    ///
    /// Returns `None` when the sweep is throttled by
    /// `mapping_process_interval`.
    pub fn step(&mut self, input: &SweepInput) -> Option<StepOutput> {
        if self.time_last_processing >= 0.0
            && input.stamp - self.time_last_processing
                < self.config.keyframe.mapping_process_interval
        {
            return None;
        }
        self.delta_time = input.stamp - self.time_last_processing;
        self.time_last_processing = input.stamp;

        // Detection runs concurrently with scan matching
        let request = self
            .detector
            .as_ref()
            .map(|service| DetectionRequest::launch(service.clone(), input.raw_cloud.clone()));

        self.incremental_front = self.transform;
        self.update_initial_guess(input);

        let edge_ds = self.corner_filter.filter(&input.edge_cloud);
        let plane_ds = self.surf_filter.filter(&input.plane_cloud);

        self.scan_to_map(input, &edge_ds, &plane_ds);
        self.incremental_back = self.transform;

        let boxes = request.and_then(|r| r.join());
        let detection_active = boxes.is_some();

        let keyframe_added = self.save_keyframes_and_factor(input, boxes, &edge_ds, &plane_ds);

        self.correct_poses();

        Some(self.build_output(input, keyframe_added, detection_active))
    }

    /// Seed the pose for this step from odometry or IMU increments.
    fn update_initial_guess(&mut self, input: &SweepInput) {
        let imu_attitude =
            Pose3D::from_euler(0.0, 0.0, 0.0, input.imu_roll, input.imu_pitch, input.imu_yaw);

        if self.keyframes.is_empty() {
            if input.imu_available {
                self.transform = imu_attitude;
                self.last_imu_attitude = Some(imu_attitude);
            }
            return;
        }

        if input.odom_available {
            if let Some(last) = self.last_odom_guess {
                let increment = last.between(&input.initial_guess);
                self.transform = self.transform.compose(&increment);
                self.last_odom_guess = Some(input.initial_guess);
                if input.imu_available {
                    self.last_imu_attitude = Some(imu_attitude);
                }
                return;
            }
            self.last_odom_guess = Some(input.initial_guess);
        }

        if input.imu_available {
            if let Some(last) = self.last_imu_attitude {
                let increment = last.between(&imu_attitude);
                self.transform = self.transform.compose(&increment);
            }
            self.last_imu_attitude = Some(imu_attitude);
        }
    }

    /// Assemble the sub-map and refine the pose against it.
    fn scan_to_map(&mut self, input: &SweepInput, edge_ds: &PointCloud3D, plane_ds: &PointCloud3D) {
        if self.keyframes.is_empty() {
            return;
        }

        if edge_ds.len() <= self.config.matching.edge_feature_min_valid_num
            || plane_ds.len() <= self.config.matching.surf_feature_min_valid_num
        {
            log::warn!(
                "not enough features: {} edge and {} planar available",
                edge_ds.len(),
                plane_ds.len()
            );
            return;
        }

        let ids = select_surrounding_keyframes(
            &self.keyframes,
            self.config.matching.surrounding_keyframe_search_radius,
            self.config.matching.surrounding_keyframe_density,
            input.stamp,
        );
        let anchor = self.keyframes.latest().expect("non-empty store").pose;
        let (edge_map, plane_map) = self.submap.assemble(
            &self.keyframes,
            &ids,
            &anchor,
            self.config.matching.surrounding_keyframe_search_radius,
        );
        let edge_map_ds = self.corner_filter.filter(&edge_map);
        let plane_map_ds = self.surf_filter.filter(&plane_map);

        let imu = input.imu_available.then(|| ImuAttitude {
            roll: input.imu_roll,
            pitch: input.imu_pitch,
        });

        let result = self.matcher.match_to_map(
            edge_ds,
            plane_ds,
            &edge_map_ds,
            &plane_map_ds,
            &self.transform,
            imu,
        );
        self.transform = result.pose;
        self.is_degenerate = result.is_degenerate;
    }

    /// Keyframe decision, factor emission, solver update, and readback.
    fn save_keyframes_and_factor(
        &mut self,
        input: &SweepInput,
        boxes: Option<Vec<BoundingBox3>>,
        edge_ds: &PointCloud3D,
        plane_ds: &PointCloud3D,
    ) -> bool {
        let required = self.keyframes.requires_new_keyframe(
            &self.transform,
            self.config.keyframe.add_dist_threshold,
            self.config.keyframe.add_angle_threshold,
        );

        if required {
            self.add_odom_factor();
            self.add_gps_factor(input.stamp);
            self.add_loop_factor();
        } else if self.config.tracking.simultaneous_tracking {
            // Asynchronous slot update: pin the existing ego key so object
            // factors can reference it without growing the trajectory.
            let pinned = self.keyframes.latest().expect("non-empty store").pose;
            let ego_key = *self.key_pose_indices.last().expect("key exists");
            self.buffers.values.insert(ego_key, pinned);
        } else {
            return false;
        }

        let ego_key = *self.key_pose_indices.last().expect("ego key was allocated");

        self.tracker.propagate(
            self.delta_time,
            input.stamp,
            &self.config.tracking,
            &mut self.buffers,
            &mut self.nodes,
        );

        let sets = boxes.map(|boxes| {
            let mock_motion = if required {
                None
            } else {
                // Compensate detections by the small ego motion accumulated
                // since the pinned keyframe.
                let pinned = self.keyframes.latest().expect("non-empty store").pose;
                Some(pinned.between(&self.transform))
            };
            build_detection_sets(boxes, &self.config.noise, mock_motion)
        });
        self.tracker.add_detection_factors(
            sets,
            ego_key,
            &mut self.buffers,
            self.solver.estimate(),
            &self.config.tracking,
            &self.config.noise,
            &mut self.nodes,
            input.stamp,
        );
        self.tracker.add_constant_velocity_factors(
            &mut self.buffers,
            &self.config.tracking,
            &self.config.noise,
        );
        self.tracker
            .add_stable_pose_factors(&mut self.buffers, &self.config.noise, self.delta_time);

        if !required {
            // The ego key already lives in the solver
            self.buffers.values.remove(ego_key);
        }

        let graph = std::mem::take(&mut self.buffers.graph);
        let values = std::mem::take(&mut self.buffers.values);
        self.solver.update(graph, values);
        self.solver.refine();
        if self.a_loop_is_closed {
            for _ in 0..LOOP_CLOSURE_EXTRA_SWEEPS {
                self.solver.refine();
            }
        }

        let loose_graph = std::mem::take(&mut self.buffers.loose_graph);
        let loose_values = std::mem::take(&mut self.buffers.loose_values);
        if !loose_graph.is_empty() || !loose_values.is_empty() {
            self.solver.update(loose_graph, loose_values);
            self.solver.refine();
        }

        if required {
            let latest = *self
                .solver
                .estimate()
                .get(ego_key)
                .unwrap_or(&self.transform);
            self.keyframes
                .push(input.stamp, latest, edge_ds.clone(), plane_ds.clone());
            self.pose_covariance = self
                .solver
                .marginal_covariance(ego_key)
                .unwrap_or_else(Matrix6::zeros);
            self.transform = latest;
            self.path.push((input.stamp, latest));
        }

        self.tracker.read_back(self.solver.estimate());

        required
    }

    /// Add the prior (first frame) or the odometry between-factor.
    fn add_odom_factor(&mut self) {
        let pose = self.transform;
        let key = self.nodes.allocate();

        if self.keyframes.is_empty() {
            self.key_pose_indices.push(key);
            self.buffers.graph.add(Factor::PriorPose {
                key,
                pose,
                noise: DiagonalNoise::from_variances(
                    self.config.noise.prior_odometry_diagonal_variance,
                ),
            });
        } else {
            let previous_key = *self.key_pose_indices.last().expect("non-empty trajectory");
            let previous_pose = self.keyframes.latest().expect("non-empty store").pose;
            self.key_pose_indices.push(key);
            self.buffers.graph.add(Factor::BetweenPose {
                key1: previous_key,
                key2: key,
                measurement: previous_pose.between(&pose),
                noise: DiagonalNoise::from_variances(self.config.noise.odometry_diagonal_variance),
            });
        }
        self.buffers.values.insert(key, pose);
    }

    /// Add a GPS factor when drift warrants it and a usable fix exists.
    fn add_gps_factor(&mut self, stamp: f64) {
        if self.gps_queue.is_empty() || self.keyframes.is_empty() {
            return;
        }
        if self.keyframes.traveled_span() < GPS_MIN_TRAVEL {
            return;
        }
        // x/y marginal variance small enough: no correction needed
        if self.pose_covariance[(3, 3)] < self.config.gps.pose_cov_threshold
            && self.pose_covariance[(4, 4)] < self.config.gps.pose_cov_threshold
        {
            return;
        }

        let fallback_z = self.transform.translation().z;
        if let Some(fix) = self
            .gps_queue
            .next_usable(stamp, &self.config.gps, fallback_z)
        {
            let key = *self.key_pose_indices.last().expect("current key exists");
            self.buffers.graph.add(Factor::Gps {
                key,
                position: fix.position,
                variances: Vector3::new(
                    fix.variances.x.max(1.0),
                    fix.variances.y.max(1.0),
                    fix.variances.z.max(1.0),
                ),
            });
            log::info!("gps factor added at {:.3}", stamp);
            self.a_loop_is_closed = true;
        }
    }

    /// Drain verified loop constraints into between-factors.
    fn add_loop_factor(&mut self) {
        let pending = self.loop_queue.drain();
        if pending.is_empty() {
            return;
        }
        for factor in pending {
            let (cur, pre) = (factor.cur, factor.pre);
            if cur >= self.key_pose_indices.len() || pre >= self.key_pose_indices.len() {
                continue;
            }
            self.buffers.graph.add(Factor::BetweenPose {
                key1: self.key_pose_indices[cur],
                key2: self.key_pose_indices[pre],
                measurement: factor.between,
                noise: DiagonalNoise::isotropic(factor.noise),
            });
            log::info!("loop factor added between keyframes {} and {}", cur, pre);
        }
        self.a_loop_is_closed = true;
    }

    /// Rewrite history after loop closures or tight coupling.
    fn correct_poses(&mut self) {
        if self.keyframes.is_empty() {
            return;
        }
        if !(self.a_loop_is_closed || self.tracker.any_tightly_coupled()) {
            return;
        }

        self.submap.flush();
        self.path.clear();

        let estimate = self.solver.estimate();
        for (id, &key) in self.key_pose_indices.iter().enumerate() {
            if let Some(pose) = estimate.get(key) {
                self.keyframes.set_pose(id, *pose);
                let time = self.keyframes.get(id).expect("id valid").time;
                self.path.push((time, *pose));
            }
        }

        // The latest keyframe pose is the new current estimate
        if let Some(latest) = self.keyframes.latest() {
            self.transform = latest.pose;
        }

        self.a_loop_is_closed = false;
    }

    /// Assemble the step output.
    fn build_output(
        &mut self,
        input: &SweepInput,
        keyframe_added: bool,
        detection_active: bool,
    ) -> StepOutput {
        // Incremental odometry: chain the per-step front/back increment
        let incremental = match self.incremental_odometry {
            None => {
                self.incremental_odometry = Some(self.transform);
                self.transform
            }
            Some(previous) => {
                let increment = self.incremental_front.between(&self.incremental_back);
                let mut updated = previous.compose(&increment);
                if input.imu_available && input.imu_pitch.abs() < 1.4 {
                    let (roll, pitch, yaw) = updated.euler_angles();
                    let t = updated.translation();
                    updated = Pose3D::from_euler(
                        t.x,
                        t.y,
                        t.z,
                        blend_axis_angle(roll, input.imu_roll, 0.1, 0),
                        blend_axis_angle(pitch, input.imu_pitch, 0.1, 1),
                        yaw,
                    );
                }
                self.incremental_odometry = Some(updated);
                updated
            }
        };

        let objects = self
            .tracker
            .current_epoch()
            .map(|epoch| {
                epoch
                    .values()
                    .filter(|track| track.lost_count == 0 && !track.retired)
                    .map(|track| {
                        // Constant-twist preview of where the object is headed
                        let delta = Pose3D::exp(&(track.velocity.log() * 0.1));
                        let mut next = track.pose;
                        let mut preview = Vec::with_capacity(5);
                        for _ in 0..5 {
                            next = next.compose(&delta);
                            preview.push(next.translation());
                        }

                        ObjectStateOutput {
                            object_index: track.object_index,
                            tracking_index: track.tracking_index,
                            pose: track.pose,
                            velocity: track.velocity,
                            is_tightly_coupled: track.is_tightly_coupled,
                            lost_count: track.lost_count,
                            confidence: track.confidence,
                            velocity_preview: preview,
                        }
                    })
                    .collect()
            })
            .unwrap_or_default();

        StepOutput {
            stamp: input.stamp,
            pose: self.transform,
            incremental_odometry: incremental,
            is_degenerate: self.is_degenerate,
            incremental_covariance0: if self.is_degenerate { 1.0 } else { 0.0 },
            keyframe_added,
            detection_active,
            keyposes: self.keyframes.iter().map(|kf| kf.pose).collect(),
            path: self.path.clone(),
            objects,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatiConfig;

    fn scene() -> (PointCloud3D, PointCloud3D) {
        let mut edges = PointCloud3D::new();
        let mut planes = PointCloud3D::new();
        for (px, py) in [(3.0, 3.0), (-3.0, 3.0), (3.0, -3.0), (-3.0, -3.0)] {
            for i in 0..25 {
                edges.push(px, py, i as f32 * 0.08, 0.0);
            }
        }
        for xi in -30..30 {
            for yi in -30..30 {
                planes.push(xi as f32 * 0.25, yi as f32 * 0.25, 0.0, 0.0);
            }
        }
        for yi in -30..30 {
            for zi in 0..8 {
                planes.push(7.5, yi as f32 * 0.25, zi as f32 * 0.25, 0.0);
                planes.push(-7.5, yi as f32 * 0.25, zi as f32 * 0.25, 0.0);
            }
        }
        (edges, planes)
    }

    fn sweep_at(stamp: f64, truth: &Pose3D, world: &(PointCloud3D, PointCloud3D)) -> SweepInput {
        let inverse = truth.inverse();
        SweepInput {
            stamp,
            edge_cloud: world.0.transform(&inverse),
            plane_cloud: world.1.transform(&inverse),
            raw_cloud: PointCloud3D::new(),
            imu_available: false,
            imu_roll: 0.0,
            imu_pitch: 0.0,
            imu_yaw: 0.0,
            odom_available: true,
            initial_guess: *truth,
        }
    }

    fn test_config() -> GatiConfig {
        let mut config = GatiConfig::default();
        config.keyframe.add_dist_threshold = 0.1;
        config.keyframe.mapping_process_interval = 0.05;
        config.tracking.simultaneous_tracking = false;
        config
    }

    #[test]
    fn test_first_step_creates_keyframe_and_prior() {
        let world = scene();
        let mut estimator = JointEstimator::new(test_config());

        let output = estimator
            .step(&sweep_at(0.0, &Pose3D::identity(), &world))
            .unwrap();

        assert!(output.keyframe_added);
        assert_eq!(estimator.keyframes().len(), 1);
        assert_eq!(output.path.len(), 1);
    }

    #[test]
    fn test_throttling() {
        let world = scene();
        let mut estimator = JointEstimator::new(test_config());

        assert!(estimator
            .step(&sweep_at(0.0, &Pose3D::identity(), &world))
            .is_some());
        // within the process interval
        assert!(estimator
            .step(&sweep_at(0.01, &Pose3D::identity(), &world))
            .is_none());
    }

    #[test]
    fn test_tracks_moving_platform() {
        let world = scene();
        let mut estimator = JointEstimator::new(test_config());

        let mut last = None;
        for i in 0..6 {
            let truth = Pose3D::from_euler(0.3 * i as f64, 0.0, 0.0, 0.0, 0.0, 0.0);
            last = estimator.step(&sweep_at(i as f64 * 0.1, &truth, &world));
        }

        let output = last.unwrap();
        assert!((output.pose.translation().x - 1.5).abs() < 0.1);
        // every 0.3m step exceeds the 0.1m keyframe threshold
        assert_eq!(estimator.keyframes().len(), 6);
    }

    #[test]
    fn test_static_platform_adds_single_keyframe() {
        let world = scene();
        let mut estimator = JointEstimator::new(test_config());

        for i in 0..5 {
            estimator
                .step(&sweep_at(i as f64 * 0.1, &Pose3D::identity(), &world))
                .unwrap();
        }

        assert_eq!(estimator.keyframes().len(), 1);
        let pose = estimator.current_pose();
        assert!(pose.translation().norm() < 1e-3);
    }

    #[test]
    fn test_loop_factor_rewrites_path() {
        let world = scene();
        let mut estimator = JointEstimator::new(test_config());

        for i in 0..4 {
            let truth = Pose3D::from_euler(0.3 * i as f64, 0.0, 0.0, 0.0, 0.0, 0.0);
            let _ = estimator.step(&sweep_at(i as f64 * 0.1, &truth, &world));
        }
        assert_eq!(estimator.keyframes().len(), 4);

        // Perfect trajectory: a consistent loop factor should not move it
        let between = estimator
            .keyframes()
            .get(3)
            .unwrap()
            .pose
            .between(&estimator.keyframes().get(0).unwrap().pose);
        assert!(estimator.push_loop_factor(PendingLoopFactor {
            cur: 3,
            pre: 0,
            between,
            noise: 0.1,
        }));

        let truth = Pose3D::from_euler(1.2, 0.0, 0.0, 0.0, 0.0, 0.0);
        let output = estimator.step(&sweep_at(0.4, &truth, &world)).unwrap();

        assert!(output.keyframe_added);
        // path was rebuilt for all keyframes after the correction
        assert_eq!(output.path.len(), estimator.keyframes().len());
        assert!((output.path[3].1.translation().x - 0.9).abs() < 0.05);
    }
}
