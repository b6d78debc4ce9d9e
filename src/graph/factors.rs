//! Factors and variable containers for the joint estimation problem.
//!
//! Factors are a tagged variant rather than a trait hierarchy; the solver
//! matches on the kind. Detection factors are max-mixture: they carry the
//! whole detection set as Gaussian modes and evaluate the mode with the
//! minimum negative log-likelihood at the current estimate.

use std::collections::HashMap;

use nalgebra::{DVector, Vector3, Vector6};

use crate::core::types::{Detection, Pose3D};

/// A variable node index. Globally unique, monotonically increasing, never
/// reused; each key holds one pose-typed value.
pub type Key = u64;

/// Diagonal Gaussian noise, stored as variances `(roll, pitch, yaw, x, y, z)`.
#[derive(Debug, Clone)]
pub struct DiagonalNoise {
    variances: Vector6<f64>,
}

impl DiagonalNoise {
    /// Create from a variance vector.
    pub fn from_variances(variances: [f64; 6]) -> Self {
        Self {
            variances: Vector6::from_row_slice(&variances),
        }
    }

    /// Isotropic noise with the same variance on all six axes.
    pub fn isotropic(variance: f64) -> Self {
        Self {
            variances: Vector6::repeat(variance),
        }
    }

    /// Diagonal variances.
    pub fn variances(&self) -> &Vector6<f64> {
        &self.variances
    }

    /// Whiten a residual: `Σ^{-1/2}·r`.
    pub fn whiten(&self, r: &Vector6<f64>) -> Vector6<f64> {
        let mut out = *r;
        for i in 0..6 {
            out[i] /= self.variances[i].sqrt();
        }
        out
    }
}

/// Assignment of pose values to variable keys.
#[derive(Debug, Clone, Default)]
pub struct Values {
    map: HashMap<Key, Pose3D>,
}

impl Values {
    /// Create an empty assignment.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite a value.
    pub fn insert(&mut self, key: Key, pose: Pose3D) {
        self.map.insert(key, pose);
    }

    /// Look up a value.
    pub fn get(&self, key: Key) -> Option<&Pose3D> {
        self.map.get(&key)
    }

    /// Check whether a key is assigned.
    pub fn contains(&self, key: Key) -> bool {
        self.map.contains_key(&key)
    }

    /// Remove a value, returning it if present.
    pub fn remove(&mut self, key: Key) -> Option<Pose3D> {
        self.map.remove(&key)
    }

    /// Number of assigned keys.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Iterate over `(key, pose)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&Key, &Pose3D)> {
        self.map.iter()
    }
}

/// A factor over one or more pose-typed variables.
#[derive(Debug, Clone)]
pub enum Factor {
    /// Gaussian prior on a pose.
    PriorPose {
        key: Key,
        pose: Pose3D,
        noise: DiagonalNoise,
    },

    /// Relative pose constraint between two variables.
    BetweenPose {
        key1: Key,
        key2: Key,
        measurement: Pose3D,
        noise: DiagonalNoise,
    },

    /// Position-only prior from GPS. 3-dimensional.
    Gps {
        key: Key,
        position: Vector3<f64>,
        variances: Vector3<f64>,
    },

    /// Detection factor binding the ego pose and an object pose, with the
    /// detection set as max-mixture modes. Tight noise: influences the ego
    /// estimate.
    TightlyCoupledDetection {
        ego: Key,
        object: Key,
        detections: Vec<Detection>,
        selected: usize,
    },

    /// Same residual as the tight variant under larger noise; confined to
    /// the loosely-coupled sub-graph.
    LooselyCoupledDetection {
        ego: Key,
        object: Key,
        detections: Vec<Detection>,
        selected: usize,
    },

    /// Constant body-frame twist over `dt`:
    /// `Local(poseₜ₋₁ · Retract(Local(I, velocity)·Δt), poseₜ)`.
    StablePose {
        prev_pose: Key,
        velocity: Key,
        cur_pose: Key,
        dt: f64,
        noise: DiagonalNoise,
    },

    /// SE(3) between with identity target, tying consecutive velocity nodes.
    ConstantVelocity {
        prev: Key,
        cur: Key,
        noise: DiagonalNoise,
    },
}

impl Factor {
    /// Variable keys referenced by this factor.
    pub fn keys(&self) -> Vec<Key> {
        match self {
            Factor::PriorPose { key, .. } | Factor::Gps { key, .. } => vec![*key],
            Factor::BetweenPose { key1, key2, .. } => vec![*key1, *key2],
            Factor::TightlyCoupledDetection { ego, object, .. }
            | Factor::LooselyCoupledDetection { ego, object, .. } => vec![*ego, *object],
            Factor::StablePose {
                prev_pose,
                velocity,
                cur_pose,
                ..
            } => vec![*prev_pose, *velocity, *cur_pose],
            Factor::ConstantVelocity { prev, cur, .. } => vec![*prev, *cur],
        }
    }

    /// Residual dimension.
    pub fn dim(&self) -> usize {
        match self {
            Factor::Gps { .. } => 3,
            _ => 6,
        }
    }

    /// Detection modes, if this is a max-mixture factor.
    fn modes(&self) -> Option<(&Key, &Key, &[Detection])> {
        match self {
            Factor::TightlyCoupledDetection {
                ego,
                object,
                detections,
                ..
            }
            | Factor::LooselyCoupledDetection {
                ego,
                object,
                detections,
                ..
            } => Some((ego, object, detections)),
            _ => None,
        }
    }

    /// Mode with the minimum negative log-likelihood at the given values.
    ///
    /// `None` for non-mixture factors or when a referenced key is missing.
    pub fn active_mode(&self, values: &Values) -> Option<usize> {
        let (ego, object, detections) = self.modes()?;
        let ego_pose = values.get(*ego)?;
        let object_pose = values.get(*object)?;
        let relative = ego_pose.between(object_pose);

        let mut best: Option<(usize, f64)> = None;
        for (j, detection) in detections.iter().enumerate() {
            let error = detection.matching_error(&relative);
            match best {
                Some((_, e)) if error >= e => {}
                _ => best = Some((j, error)),
            }
        }
        best.map(|(j, _)| j)
    }

    /// Whitened residual at the given values with a pinned mixture mode.
    ///
    /// Returns `None` when any referenced key is unassigned.
    pub fn whitened_residual_with(&self, values: &Values, mode: Option<usize>) -> Option<DVector<f64>> {
        match self {
            Factor::PriorPose { key, pose, noise } => {
                let x = values.get(*key)?;
                let r = noise.whiten(&pose.local(x));
                Some(DVector::from_column_slice(r.as_slice()))
            }
            Factor::BetweenPose {
                key1,
                key2,
                measurement,
                noise,
            } => {
                let x1 = values.get(*key1)?;
                let x2 = values.get(*key2)?;
                let predicted = x1.between(x2);
                let r = noise.whiten(&measurement.local(&predicted));
                Some(DVector::from_column_slice(r.as_slice()))
            }
            Factor::Gps {
                key,
                position,
                variances,
            } => {
                let x = values.get(*key)?;
                let d = x.translation() - position;
                Some(DVector::from_column_slice(&[
                    d.x / variances.x.sqrt(),
                    d.y / variances.y.sqrt(),
                    d.z / variances.z.sqrt(),
                ]))
            }
            Factor::TightlyCoupledDetection {
                ego,
                object,
                detections,
                selected,
            }
            | Factor::LooselyCoupledDetection {
                ego,
                object,
                detections,
                selected,
            } => {
                let ego_pose = values.get(*ego)?;
                let object_pose = values.get(*object)?;
                let detection = &detections[mode.unwrap_or(*selected)];
                let relative = ego_pose.between(object_pose);
                let r = relative.local(detection.pose());
                let mut out = DVector::zeros(6);
                for i in 0..6 {
                    out[i] = r[i] / detection.variances()[i].sqrt();
                }
                Some(out)
            }
            Factor::StablePose {
                prev_pose,
                velocity,
                cur_pose,
                dt,
                noise,
            } => {
                let prev = values.get(*prev_pose)?;
                let vel = values.get(*velocity)?;
                let cur = values.get(*cur_pose)?;
                let predicted = prev.retract(&(vel.log() * *dt));
                let r = noise.whiten(&predicted.local(cur));
                Some(DVector::from_column_slice(r.as_slice()))
            }
            Factor::ConstantVelocity { prev, cur, noise } => {
                let v1 = values.get(*prev)?;
                let v2 = values.get(*cur)?;
                let r = noise.whiten(&v1.local(v2));
                Some(DVector::from_column_slice(r.as_slice()))
            }
        }
    }

    /// Whitened residual, resolving the mixture mode at the given values.
    pub fn whitened_residual(&self, values: &Values) -> Option<DVector<f64>> {
        self.whitened_residual_with(values, self.active_mode(values))
    }

    /// Negative log-likelihood `0.5·‖r‖²` at the given values.
    ///
    /// Missing keys contribute zero error.
    pub fn error(&self, values: &Values) -> f64 {
        self.whitened_residual(values)
            .map(|r| 0.5 * r.norm_squared())
            .unwrap_or(0.0)
    }
}

/// An ordered collection of factors pending insertion into the solver.
#[derive(Debug, Clone, Default)]
pub struct FactorGraph {
    factors: Vec<Factor>,
}

impl FactorGraph {
    /// Create an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a factor.
    pub fn add(&mut self, factor: Factor) {
        self.factors.push(factor);
    }

    /// Number of factors.
    pub fn len(&self) -> usize {
        self.factors.len()
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.factors.is_empty()
    }

    /// Iterate over the factors.
    pub fn iter(&self) -> impl Iterator<Item = &Factor> {
        self.factors.iter()
    }

    /// Take the factors, leaving the graph empty.
    pub fn take(&mut self) -> Vec<Factor> {
        std::mem::take(&mut self.factors)
    }
}
