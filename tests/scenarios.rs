//! End-to-end scenarios: the tracker state machine driven both directly
//! and through the full estimator with a scripted detection service.

use std::sync::Arc;

use approx::assert_relative_eq;
use parking_lot::Mutex;

use gati_slam::adapters::DetectionService;
use gati_slam::config::{GatiConfig, NoiseConfig, TrackingConfig};
use gati_slam::core::types::{BoundingBox3, PointCloud3D, Pose3D};
use gati_slam::graph::{Key, NodeAllocator, StepBuffers, Values};
use gati_slam::tracking::{build_detection_sets, ObjectTracker};
use gati_slam::JointEstimator;

fn box_at(x: f64, y: f64) -> BoundingBox3 {
    BoundingBox3::new(
        Pose3D::from_euler(x, y, 0.0, 0.0, 0.0, 0.0),
        [4.0, 2.0, 1.5],
        0,
        0.9,
    )
}

/// Direct tracker harness: a solver stand-in accepts every initial value.
struct TrackerHarness {
    tracker: ObjectTracker,
    buffers: StepBuffers,
    nodes: NodeAllocator,
    estimate: Values,
    ego_key: Key,
    tracking: TrackingConfig,
    noise: NoiseConfig,
    time: f64,
}

impl TrackerHarness {
    fn new(tracking: TrackingConfig) -> Self {
        let mut nodes = NodeAllocator::new();
        let ego_key = nodes.allocate();
        let mut buffers = StepBuffers::new();
        buffers.values.insert(ego_key, Pose3D::identity());

        let mut estimate = Values::new();
        estimate.insert(ego_key, Pose3D::identity());

        Self {
            tracker: ObjectTracker::new(),
            buffers,
            nodes,
            estimate,
            ego_key,
            tracking,
            noise: NoiseConfig::default(),
            time: 0.0,
        }
    }

    fn step(&mut self, boxes: Option<Vec<BoundingBox3>>) {
        self.time += 0.1;
        self.tracker.propagate(
            0.1,
            self.time,
            &self.tracking,
            &mut self.buffers,
            &mut self.nodes,
        );
        let sets = boxes.map(|b| build_detection_sets(b, &self.noise, None));
        self.tracker.add_detection_factors(
            sets,
            self.ego_key,
            &mut self.buffers,
            &self.estimate,
            &self.tracking,
            &self.noise,
            &mut self.nodes,
            self.time,
        );
        self.tracker
            .add_constant_velocity_factors(&mut self.buffers, &self.tracking, &self.noise);
        self.tracker
            .add_stable_pose_factors(&mut self.buffers, &self.noise, 0.1);

        // Stand-in solver: every initial value becomes the estimate.
        for (key, pose) in self.buffers.values.iter() {
            self.estimate.insert(*key, *pose);
        }
        for (key, pose) in self.buffers.loose_values.iter() {
            self.estimate.insert(*key, *pose);
        }
        self.buffers = StepBuffers::new();
        self.buffers.values.insert(self.ego_key, Pose3D::identity());

        self.tracker.read_back(&self.estimate);
    }
}

#[test]
fn birth_creates_track_with_identity_velocity() {
    let mut harness = TrackerHarness::new(TrackingConfig::default());
    harness.step(Some(vec![box_at(10.0, 0.0)]));

    let epoch = harness.tracker.current_epoch().unwrap();
    assert_eq!(epoch.len(), 1);

    let track = epoch.get(&0).unwrap();
    assert_eq!(track.tracking_index, 0);
    assert!(!track.is_tightly_coupled);
    assert_relative_eq!(track.pose.translation().x, 10.0, epsilon = 1e-9);
    assert_relative_eq!(track.velocity.log().norm(), 0.0, epsilon = 1e-12);
}

#[test]
fn association_is_deterministic_for_near_ties() {
    let mut harness = TrackerHarness::new(TrackingConfig::default());
    harness.step(Some(vec![box_at(10.0, 0.0)]));

    // Two detections gated to the same track: the lower-error one wins,
    // the other births a new object.
    harness.step(Some(vec![box_at(10.0, 0.0), box_at(10.2, 0.0)]));

    let epoch = harness.tracker.current_epoch().unwrap();
    assert_eq!(epoch.len(), 2);

    let original = epoch.get(&0).unwrap();
    assert_relative_eq!(
        original.detection.as_ref().unwrap().pose.translation().x,
        10.0,
        epsilon = 1e-9
    );

    let newborn = epoch.get(&1).unwrap();
    assert_relative_eq!(newborn.pose.translation().x, 10.2, epsilon = 1e-9);
    assert_eq!(newborn.tracking_index, 1);
}

#[test]
fn track_score_stays_within_bounds() {
    let tracking = TrackingConfig {
        number_of_pre_loose_coupling_steps: 3,
        ..Default::default()
    };
    let cap = tracking.number_of_pre_loose_coupling_steps + 1;

    let mut harness = TrackerHarness::new(tracking);
    for _ in 0..10 {
        harness.step(Some(vec![box_at(10.0, 0.0)]));
        for track in harness.tracker.current_epoch().unwrap().values() {
            assert!(track.track_score >= 0);
            assert!(track.track_score <= cap);
        }
    }
}

#[test]
fn lost_track_transfers_identity_on_reacquisition() {
    let mut harness = TrackerHarness::new(TrackingConfig::default());
    harness.step(Some(vec![box_at(10.0, 0.0)]));

    // Detector goes quiet: the track racks up misses but survives
    harness.step(None);
    harness.step(None);
    {
        let track = harness.tracker.current_epoch().unwrap().get(&0).unwrap();
        assert_eq!(track.lost_count, 2);
        assert_eq!(track.track_score, 0);
    }

    // The object reappears where it was lost: the stale track retires and
    // its tracking identity carries over to a fresh graph object.
    harness.step(Some(vec![box_at(10.0, 0.0)]));

    let epoch = harness.tracker.current_epoch().unwrap();
    let old = epoch.get(&0).unwrap();
    assert!(old.retired);

    let reborn = epoch.get(&1).unwrap();
    assert_eq!(reborn.tracking_index, 0);
    assert_eq!(reborn.object_index, 1);
    assert!(reborn.is_first);
}

#[test]
fn retired_tracks_never_reappear() {
    let tracking = TrackingConfig {
        tracking_steps_for_lost_object: 2,
        ..Default::default()
    };
    let mut harness = TrackerHarness::new(tracking);
    harness.step(Some(vec![box_at(10.0, 0.0)]));

    // Miss past the threshold: the track is dropped for good
    for _ in 0..4 {
        harness.step(None);
    }
    assert!(harness.tracker.current_epoch().unwrap().is_empty());

    // A detection far in time births a brand-new identity
    harness.step(Some(vec![box_at(10.0, 0.0)]));
    let epoch = harness.tracker.current_epoch().unwrap();
    let track = epoch.get(&1).unwrap();
    assert_eq!(track.tracking_index, 1);
}

#[test]
fn failed_tight_test_demotes_score() {
    let tracking = TrackingConfig {
        number_of_pre_loose_coupling_steps: 2,
        number_of_inter_loose_coupling_steps: 2,
        number_of_velocity_consistency_steps: 2,
        ..Default::default()
    };
    let mut harness = TrackerHarness::new(tracking.clone());

    // A static object associated repeatedly: all velocity-node estimates
    // are identity, so the temporal test passes once the ring fills.
    for _ in 0..4 {
        harness.step(Some(vec![box_at(10.0, 0.0)]));
    }
    {
        let track = harness.tracker.current_epoch().unwrap().get(&0).unwrap();
        assert!(track.is_tightly_coupled, "expected tight coupling");
        assert_eq!(track.track_score, 3);
    }

    // Next detection is off by 0.8m: inside the association gate but
    // outside the tight-coupling spatial gate.
    harness.step(Some(vec![box_at(10.8, 0.0)]));

    let track = harness.tracker.current_epoch().unwrap().get(&0).unwrap();
    assert!(!track.is_tightly_coupled);
    assert_eq!(track.track_score, 3 - tracking.number_of_inter_loose_coupling_steps);
    assert_eq!(track.lost_count, 0);
}

/// Scripted detection service: one response list per call.
struct ScriptedDetector {
    frames: Mutex<std::collections::VecDeque<Option<Vec<BoundingBox3>>>>,
}

impl DetectionService for ScriptedDetector {
    fn detect(&self, _cloud: &PointCloud3D) -> Option<Vec<BoundingBox3>> {
        self.frames.lock().pop_front().flatten()
    }
}

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

#[test]
fn moving_object_is_promoted_and_velocity_recovered() {
    let steps = 15usize;
    let dt = 0.1;
    let speed = 1.0; // m/s along +x

    let mut config = GatiConfig::default();
    config.keyframe.mapping_process_interval = 0.05;
    config.tracking.number_of_pre_loose_coupling_steps = 4;
    config.tracking.number_of_inter_loose_coupling_steps = 2;
    config.tracking.number_of_early_steps = 2;
    config.tracking.number_of_velocity_consistency_steps = 3;

    let frames: std::collections::VecDeque<_> = (0..steps)
        .map(|i| Some(vec![box_at(10.0 + speed * dt * i as f64, 0.0)]))
        .collect();
    let detector = Arc::new(ScriptedDetector {
        frames: Mutex::new(frames),
    });

    let world = scene();
    let mut estimator = JointEstimator::new(config);
    estimator.set_detector(detector);

    let mut last = None;
    for i in 0..steps {
        let input = gati_slam::core::types::SweepInput {
            stamp: i as f64 * dt,
            edge_cloud: world.0.clone(),
            plane_cloud: world.1.clone(),
            raw_cloud: PointCloud3D::new(),
            odom_available: true,
            initial_guess: Pose3D::identity(),
            ..Default::default()
        };
        last = estimator.step(&input);
    }

    let output = last.unwrap();
    assert!(output.detection_active);
    assert_eq!(output.objects.len(), 1);

    let object = &output.objects[0];
    assert_eq!(object.object_index, 0, "continuous association keeps the id");
    assert!(object.is_tightly_coupled, "object should couple tightly");

    // Final velocity within 5% of 1 m/s along x
    let v = object.velocity.log();
    assert!(
        (v[3] - speed).abs() < 0.05 * speed,
        "estimated velocity {} not within 5% of {}",
        v[3],
        speed
    );

    // The object tracked the true position
    let expected_x = 10.0 + speed * dt * (steps - 1) as f64;
    assert!((object.pose.translation().x - expected_x).abs() < 0.2);

    // Track scores stayed within bounds the whole run
    let cap = estimator
        .config()
        .tracking
        .number_of_pre_loose_coupling_steps
        + 1;
    for epoch in estimator.tracker().epochs() {
        for track in epoch.values() {
            assert!(track.track_score >= 0 && track.track_score <= cap);
        }
    }
}
