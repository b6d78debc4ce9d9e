//! Object tracker core.
//!
//! Per-step lifecycle of every tracked object: propagation under the
//! constant-velocity model, data association against the detection set,
//! the tight/loose coupling decision, birth, retirement with
//! re-identification, and emission of detection, constant-velocity, and
//! stable-pose factors into the step buffers.
//!
//! Promotion gating switches on `track_score`; early-noise selection
//! switches on path length. Each epoch is the tracker's full state at one
//! LiDAR step; all epochs are retained for the estimation record.

use std::collections::BTreeMap;

use crate::config::{NoiseConfig, TrackingConfig};
use crate::core::types::{best_detection_match, BoundingBox3, Detection, Pose3D};
use crate::graph::{DiagonalNoise, Factor, Key, NodeAllocator, StepBuffers, Values};

use super::track::ObjectTrack;

/// One detection set wrapped under every noise profile the tracker needs.
#[derive(Debug, Clone)]
pub struct DetectionSets {
    /// The raw boxes (possibly ego-motion compensated).
    pub boxes: Vec<BoundingBox3>,

    /// Loose detection-factor profile.
    pub loose: Vec<Detection>,

    /// Tight detection-factor profile.
    pub tight: Vec<Detection>,

    /// Matching profile for early tracks.
    pub early_matching: Vec<Detection>,

    /// Default matching profile.
    pub loose_matching: Vec<Detection>,

    /// Matching profile for the tight-coupling spatial test.
    pub tight_matching: Vec<Detection>,

    /// Wide profile for re-identifying lost tracks.
    pub data_association: Vec<Detection>,
}

/// Wrap raw boxes under every profile.
///
/// On non-keyframe steps `mock_motion` carries the small ego motion since
/// the last keyframe; detections are pre-multiplied by it so they associate
/// in the pinned keyframe's frame.
pub fn build_detection_sets(
    mut boxes: Vec<BoundingBox3>,
    noise: &NoiseConfig,
    mock_motion: Option<Pose3D>,
) -> DetectionSets {
    if let Some(motion) = mock_motion {
        for b in &mut boxes {
            b.pose = motion.compose(&b.pose);
        }
    }

    let wrap = |variances: [f64; 6]| -> Vec<Detection> {
        boxes
            .iter()
            .map(|b| Detection::new(b.clone(), variances))
            .collect()
    };

    DetectionSets {
        loose: wrap(noise.loosely_coupled_detection_variance),
        tight: wrap(noise.tightly_coupled_detection_variance),
        early_matching: wrap(noise.early_loosely_coupled_matching_variance),
        loose_matching: wrap(noise.loosely_coupled_matching_variance),
        tight_matching: wrap(noise.tightly_coupled_matching_variance),
        data_association: wrap(noise.data_association_variance),
        boxes,
    }
}

/// Tracker state machine over a sequence of object epochs.
#[derive(Debug, Default)]
pub struct ObjectTracker {
    /// One map `{object_index → track}` per processed LiDAR step.
    epochs: Vec<BTreeMap<u64, ObjectTrack>>,

    /// Next factor-graph object id.
    registered_objects: u64,

    /// Next tracking (visualization) id.
    tracking_objects: u64,

    /// Any track coupled tightly during the current step.
    any_tightly_coupled: bool,

    /// Tracks coupled tightly during the current step.
    tightly_coupled_this_step: usize,
}

impl ObjectTracker {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Tracks of the current epoch.
    pub fn current_epoch(&self) -> Option<&BTreeMap<u64, ObjectTrack>> {
        self.epochs.last()
    }

    /// All epochs, oldest first.
    pub fn epochs(&self) -> &[BTreeMap<u64, ObjectTrack>] {
        &self.epochs
    }

    /// Whether any track coupled tightly this step.
    pub fn any_tightly_coupled(&self) -> bool {
        self.any_tightly_coupled
    }

    /// Number of tracks coupled tightly this step.
    pub fn tightly_coupled_count(&self) -> usize {
        self.tightly_coupled_this_step
    }

    /// Total factor-graph objects ever registered.
    pub fn registered_objects(&self) -> u64 {
        self.registered_objects
    }

    /// Total tracking identities ever allocated.
    pub fn tracking_objects(&self) -> u64 {
        self.tracking_objects
    }

    /// Propagate the last epoch one step forward.
    ///
    /// Active tracks get fresh pose/velocity nodes with initial guesses in
    /// the main buffer; lost-but-not-dropped tracks are carried without
    /// nodes. Retired tracks and tracks lost beyond the threshold are not
    /// materialized.
    pub fn propagate(
        &mut self,
        dt: f64,
        now: f64,
        tracking: &TrackingConfig,
        buffers: &mut StepBuffers,
        nodes: &mut NodeAllocator,
    ) {
        if self.epochs.is_empty() {
            self.epochs.push(BTreeMap::new());
            return;
        }

        let previous = self.epochs.last().expect("checked non-empty");
        let mut next: BTreeMap<u64, ObjectTrack> = BTreeMap::new();

        for (&object_index, prev) in previous {
            if prev.retired || prev.lost_count > tracking.tracking_steps_for_lost_object {
                continue;
            }

            let mut track = prev.clone();
            let delta = Pose3D::exp(&(prev.velocity.log() * dt));
            track.pose = prev.pose.compose(&delta);
            track.is_first = false;
            track.timestamp = now;

            if prev.lost_count == 0 {
                let pose_node = nodes.allocate();
                let velocity_node = nodes.allocate();
                track.pose_node = Some(pose_node);
                track.velocity_node = Some(velocity_node);

                buffers.values.insert(pose_node, track.pose);
                buffers.values.insert(velocity_node, track.velocity);

                if let Some(previous_velocity) = prev.velocity_node {
                    track.remember_velocity_node(
                        previous_velocity,
                        tracking.number_of_velocity_consistency_steps,
                    );
                }
            } else {
                track.pose_node = None;
                track.velocity_node = None;
            }

            next.insert(object_index, track);
        }

        self.epochs.push(next);
    }

    /// Associate detections, run the coupling state machine, and emit
    /// detection factors. Births and retirements happen here.
    #[allow(clippy::too_many_arguments)]
    pub fn add_detection_factors(
        &mut self,
        detections: Option<DetectionSets>,
        ego_key: Key,
        buffers: &mut StepBuffers,
        estimate: &Values,
        tracking: &TrackingConfig,
        noise: &NoiseConfig,
        nodes: &mut NodeAllocator,
        now: f64,
    ) {
        self.any_tightly_coupled = false;
        self.tightly_coupled_this_step = 0;

        // The epoch leaves the tracker for the duration of the pass so the
        // id counters stay reachable.
        let mut current = match self.epochs.pop() {
            Some(epoch) => epoch,
            None => return,
        };
        self.associate(
            &mut current,
            detections,
            ego_key,
            buffers,
            estimate,
            tracking,
            noise,
            nodes,
            now,
        );
        self.epochs.push(current);
    }

    #[allow(clippy::too_many_arguments)]
    fn associate(
        &mut self,
        current: &mut BTreeMap<u64, ObjectTrack>,
        detections: Option<DetectionSets>,
        ego_key: Key,
        buffers: &mut StepBuffers,
        estimate: &Values,
        tracking: &TrackingConfig,
        noise: &NoiseConfig,
        nodes: &mut NodeAllocator,
        now: f64,
    ) {
        let sets = match detections {
            Some(sets) if !sets.boxes.is_empty() => sets,
            _ => {
                // No detections this step: every live track misses once.
                // Their freshly propagated values must not reach the solver
                // unconstrained.
                for track in current.values_mut() {
                    track.lost_count += 1;
                    track.confidence = 0.0;
                    if let Some(node) = track.pose_node.take() {
                        buffers.values.remove(node);
                    }
                    if let Some(node) = track.velocity_node.take() {
                        buffers.values.remove(node);
                    }
                }
                return;
            }
        };

        let ego_pose = match buffers.values.get(ego_key) {
            Some(pose) => *pose,
            None => {
                log::warn!("ego key {} missing from step values; skipping detections", ego_key);
                return;
            }
        };
        let inv_ego = ego_pose.inverse();

        let mut matched = vec![false; sets.boxes.len()];
        let mut inherited_tracking: Vec<Option<u64>> = vec![None; sets.boxes.len()];

        let pre_steps = tracking.number_of_pre_loose_coupling_steps;

        for track in current.values_mut() {
            let predicted = inv_ego.compose(&track.pose);

            let profile = if track.track_score >= pre_steps + 1 {
                &sets.loose_matching
            } else if track.path_length <= tracking.number_of_early_steps {
                &sets.early_matching
            } else {
                &sets.loose_matching
            };

            let (j, error) = match best_detection_match(&predicted, profile) {
                Some(m) => m,
                None => continue,
            };
            let (da_j, da_error) = best_detection_match(&predicted, &sets.data_association)
                .expect("non-empty detection set");

            if error < tracking.detection_match_threshold {
                // found
                if track.lost_count > 0 {
                    // A lost track seen again is not re-attached in the
                    // graph; its identity passes to the matching detection
                    // and the old track retires.
                    inherited_tracking[j] = Some(track.tracking_index);
                    track.retired = true;
                    continue;
                }

                matched[j] = true;
                track.lost_count = 0;
                if track.track_score <= pre_steps {
                    track.track_score += 1;
                }
                track.detection = Some(sets.boxes[j].clone());
                track.confidence = sets.boxes[j].score;
                track.timestamp = now;

                let pose_node = track.pose_node.expect("active track has nodes");
                let velocity_node = track.velocity_node.expect("active track has nodes");

                if track.track_score >= pre_steps + 1 {
                    let (tight_j, tight_error) =
                        best_detection_match(&predicted, &sets.tight_matching)
                            .expect("non-empty detection set");

                    let spatially_consistent =
                        tight_error <= tracking.tight_coupling_detection_error_threshold;
                    let temporally_consistent = track.velocity_is_consistent(
                        tracking.number_of_velocity_consistency_steps,
                        estimate,
                        tracking.object_angular_velocity_consistency_variance_threshold,
                        tracking.object_linear_velocity_consistency_variance_threshold,
                    );

                    if spatially_consistent && temporally_consistent {
                        self.tightly_coupled_this_step += 1;
                        self.any_tightly_coupled = true;
                        track.is_tightly_coupled = true;

                        let factor = Factor::TightlyCoupledDetection {
                            ego: ego_key,
                            object: pose_node,
                            detections: sets.tight.clone(),
                            selected: tight_j,
                        };
                        buffers.graph.add(factor.clone());
                        track.detection_factor = Some(factor);
                        track.initial_detection_error = tight_error;
                        if track.path_length > 0 {
                            log::info!(
                                "object {} tightly coupled (error {:.3})",
                                track.object_index,
                                tight_error
                            );
                        }
                    } else {
                        track.track_score = (track.track_score
                            - tracking.number_of_inter_loose_coupling_steps)
                            .max(0);
                        track.is_tightly_coupled = false;

                        buffers.migrate_to_loose(pose_node);
                        buffers.migrate_to_loose(velocity_node);

                        let factor = Factor::LooselyCoupledDetection {
                            ego: ego_key,
                            object: pose_node,
                            detections: sets.loose.clone(),
                            selected: j,
                        };
                        buffers.loose_graph.add(factor.clone());
                        track.detection_factor = Some(factor);
                        track.initial_detection_error = error;
                    }
                } else {
                    // Pre-tight: loose coupling while the velocity settles.
                    track.is_tightly_coupled = false;

                    buffers.migrate_to_loose(pose_node);
                    buffers.migrate_to_loose(velocity_node);

                    let factor = Factor::LooselyCoupledDetection {
                        ego: ego_key,
                        object: pose_node,
                        detections: sets.loose.clone(),
                        selected: j,
                    };
                    buffers.loose_graph.add(factor.clone());
                    track.detection_factor = Some(factor);
                    track.initial_detection_error = error;
                }
            } else {
                // lost
                track.lost_count += 1;
                track.confidence = 0.0;
                track.track_score = 0;
                if let Some(node) = track.pose_node.take() {
                    buffers.values.remove(node);
                }
                if let Some(node) = track.velocity_node.take() {
                    buffers.values.remove(node);
                }

                if da_error < tracking.detection_match_threshold {
                    // Re-identify under the wide gate: same tracking
                    // identity, new factor-graph object.
                    inherited_tracking[da_j] = Some(track.tracking_index);
                    track.retired = true;
                }
            }
        }

        // Birth: any detection not claimed by an existing track.
        for (idx, bounding_box) in sets.boxes.iter().enumerate() {
            if matched[idx] {
                continue;
            }

            let object_index = self.registered_objects;
            self.registered_objects += 1;

            let tracking_index = match inherited_tracking[idx] {
                Some(index) => index,
                None => {
                    let index = self.tracking_objects;
                    self.tracking_objects += 1;
                    index
                }
            };

            let pose = ego_pose.compose(&bounding_box.pose);
            let mut track = ObjectTrack::born(object_index, tracking_index, pose, now);
            track.detection = Some(bounding_box.clone());
            track.confidence = bounding_box.score;

            let pose_node = nodes.allocate();
            let velocity_node = nodes.allocate();
            track.pose_node = Some(pose_node);
            track.velocity_node = Some(velocity_node);

            buffers.loose_values.insert(pose_node, track.pose);
            buffers.loose_values.insert(velocity_node, track.velocity);

            let factor = Factor::LooselyCoupledDetection {
                ego: ego_key,
                object: pose_node,
                detections: sets.loose.clone(),
                selected: idx,
            };
            buffers.loose_graph.add(factor.clone());
            track.detection_factor = Some(factor);

            buffers.loose_graph.add(Factor::PriorPose {
                key: velocity_node,
                pose: Pose3D::identity(),
                noise: DiagonalNoise::from_variances(noise.initial_velocity_prior_variance),
            });

            log::debug!(
                "object {} born (tracking id {})",
                object_index,
                tracking_index
            );
            current.insert(object_index, track);
        }
    }

    /// Emit constant-velocity factors between consecutive velocity nodes.
    pub fn add_constant_velocity_factors(
        &mut self,
        buffers: &mut StepBuffers,
        tracking: &TrackingConfig,
        noise: &NoiseConfig,
    ) {
        if self.epochs.len() < 2 {
            return;
        }
        let (earlier, current) = self.epochs.split_at(self.epochs.len() - 1);
        let previous = earlier.last().expect("at least two epochs");

        for track in current[0].values() {
            if track.is_first || track.lost_count > 0 || track.retired {
                continue;
            }
            let prev = match previous.get(&track.object_index) {
                Some(prev) => prev,
                None => continue,
            };
            let (prev_node, cur_node) = match (prev.velocity_node, track.velocity_node) {
                (Some(a), Some(b)) => (a, b),
                _ => continue,
            };

            let factor = |variances: [f64; 6]| Factor::ConstantVelocity {
                prev: prev_node,
                cur: cur_node,
                noise: DiagonalNoise::from_variances(variances),
            };

            if track.is_tightly_coupled {
                buffers
                    .graph
                    .add(factor(noise.constant_velocity_diagonal_variance));
            } else if track.path_length <= tracking.number_of_early_steps {
                buffers
                    .loose_graph
                    .add(factor(noise.early_constant_velocity_diagonal_variance));
            } else {
                buffers
                    .loose_graph
                    .add(factor(noise.constant_velocity_diagonal_variance));
            }
        }
    }

    /// Emit stable-pose factors tying consecutive poses through velocity.
    pub fn add_stable_pose_factors(
        &mut self,
        buffers: &mut StepBuffers,
        noise: &NoiseConfig,
        dt: f64,
    ) {
        if self.epochs.len() < 2 {
            return;
        }
        let split = self.epochs.len() - 1;
        let (earlier, current) = self.epochs.split_at_mut(split);
        let previous = earlier.last().expect("at least two epochs");

        for track in current[0].values_mut() {
            if track.is_first || track.lost_count > 0 || track.retired {
                continue;
            }
            let prev = match previous.get(&track.object_index) {
                Some(prev) => prev,
                None => continue,
            };
            let (prev_pose, prev_velocity, cur_pose) =
                match (prev.pose_node, prev.velocity_node, track.pose_node) {
                    (Some(a), Some(b), Some(c)) => (a, b, c),
                    _ => continue,
                };

            let factor = Factor::StablePose {
                prev_pose,
                velocity: prev_velocity,
                cur_pose,
                dt,
                noise: DiagonalNoise::from_variances(noise.motion_diagonal_variance),
            };

            if track.is_tightly_coupled {
                buffers.graph.add(factor.clone());
            } else {
                buffers.loose_graph.add(factor.clone());
            }
            track.motion_factor = Some(factor);
        }
    }

    /// Pull updated object poses and velocities back from the solver.
    pub fn read_back(&mut self, estimate: &Values) {
        let current = match self.epochs.last_mut() {
            Some(epoch) => epoch,
            None => return,
        };

        for track in current.values_mut() {
            if track.lost_count > 0 || track.retired {
                continue;
            }
            if let Some(pose) = track.pose_node.and_then(|node| estimate.get(node)) {
                track.pose = *pose;
            }
            if let Some(velocity) = track.velocity_node.and_then(|node| estimate.get(node)) {
                track.velocity = *velocity;
            }
            track.path_length += 1;

            if let Some(factor) = &track.motion_factor {
                track.initial_motion_error = factor.error(estimate);
            }
        }
    }
}
