//! Incremental solver contract and the bundled dense implementation.
//!
//! The estimator only depends on the [`IncrementalSolver`] trait: extend the
//! problem, re-linearize, read the MAP estimate, query a marginal. The
//! bundled [`DenseIncrementalSolver`] is a damped Gauss–Newton over the full
//! factor set with numerical Jacobians and dense Cholesky. Dense is fine at
//! this problem size; a production deployment would swap in a sparse
//! incremental back-end behind the same trait.

use std::collections::HashMap;

use nalgebra::{DMatrix, DVector, Matrix6, Vector6};

use super::factors::{Factor, FactorGraph, Key, Values};

/// Step used for numerical Jacobians.
const JACOBIAN_EPS: f64 = 1e-6;

/// Solver contract expected by the estimator driver.
pub trait IncrementalSolver: Send {
    /// Extend the problem with new factors and variables. Every key
    /// referenced by a new factor must exist in prior state or in `values`.
    fn update(&mut self, graph: FactorGraph, values: Values);

    /// Run additional re-linearization sweeps without new content.
    fn refine(&mut self);

    /// Current MAP estimate over all known variables.
    fn estimate(&self) -> &Values;

    /// Marginal covariance of a variable.
    fn marginal_covariance(&mut self, key: Key) -> Option<Matrix6<f64>>;
}

/// Configuration for the bundled solver.
#[derive(Debug, Clone)]
pub struct SolverConfig {
    /// Linearization-point change that forces re-linearization.
    pub relinearize_threshold: f64,

    /// Updates to skip between re-linearizations.
    pub relinearize_skip: usize,

    /// Maximum Gauss–Newton iterations per sweep.
    pub max_iterations: u32,

    /// Relative error change below which a sweep stops.
    pub convergence_threshold: f64,

    /// Initial Levenberg–Marquardt damping.
    pub damping_factor: f64,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            relinearize_threshold: 0.1,
            relinearize_skip: 1,
            max_iterations: 8,
            convergence_threshold: 1e-6,
            damping_factor: 1e-6,
        }
    }
}

/// Dense damped Gauss–Newton implementation of [`IncrementalSolver`].
pub struct DenseIncrementalSolver {
    config: SolverConfig,
    factors: Vec<Factor>,
    estimate: Values,
    keys: Vec<Key>,
    key_index: HashMap<Key, usize>,
}

impl DenseIncrementalSolver {
    /// Create an empty solver.
    pub fn new(config: SolverConfig) -> Self {
        Self {
            config,
            factors: Vec::new(),
            estimate: Values::new(),
            keys: Vec::new(),
            key_index: HashMap::new(),
        }
    }

    /// Number of registered variables.
    pub fn num_variables(&self) -> usize {
        self.keys.len()
    }

    /// Number of stored factors.
    pub fn num_factors(&self) -> usize {
        self.factors.len()
    }

    /// Total error at the current estimate.
    pub fn total_error(&self) -> f64 {
        self.factors.iter().map(|f| f.error(&self.estimate)).sum()
    }

    /// One damped Gauss–Newton sweep over the full problem.
    fn optimize(&mut self) {
        if self.factors.is_empty() || self.keys.is_empty() {
            return;
        }

        let dim = self.keys.len() * 6;
        let mut lambda = self.config.damping_factor;
        let mut current_error = self.total_error();

        for _ in 0..self.config.max_iterations {
            let (h, b) = self.build_normal_equations(dim);

            let mut h_damped = h.clone();
            for i in 0..dim {
                h_damped[(i, i)] += lambda * h_damped[(i, i)].max(1.0);
            }

            let dx = match h_damped.cholesky() {
                Some(chol) => chol.solve(&(-&b)),
                None => {
                    lambda *= 10.0;
                    if lambda > 1e10 {
                        break;
                    }
                    continue;
                }
            };

            self.apply_step(&dx);
            let new_error = self.total_error();

            if new_error > current_error {
                // Revert: right-multiplied exp(dx) is undone exactly by exp(-dx)
                self.apply_step(&(-&dx));
                lambda *= 10.0;
                if lambda > 1e10 {
                    break;
                }
                continue;
            }

            lambda = (lambda * 0.1).max(1e-12);
            let relative_change =
                (current_error - new_error).abs() / current_error.max(1e-12);
            current_error = new_error;

            if relative_change < self.config.convergence_threshold {
                break;
            }
        }
    }

    /// Assemble `H = JᵀJ` and `b = Jᵀr` with numerical Jacobians.
    fn build_normal_equations(&mut self, dim: usize) -> (DMatrix<f64>, DVector<f64>) {
        let mut h = DMatrix::<f64>::zeros(dim, dim);
        let mut b = DVector::<f64>::zeros(dim);

        let factors = std::mem::take(&mut self.factors);
        for factor in &factors {
            let mode = factor.active_mode(&self.estimate);
            let r0 = match factor.whitened_residual_with(&self.estimate, mode) {
                Some(r) => r,
                None => continue,
            };

            let mut blocks: Vec<(usize, DMatrix<f64>)> = Vec::new();
            for key in factor.keys() {
                let index = match self.key_index.get(&key) {
                    Some(&i) => i,
                    None => continue,
                };
                let base = *self.estimate.get(key).expect("indexed key has a value");

                let mut jacobian = DMatrix::<f64>::zeros(r0.len(), 6);
                for d in 0..6 {
                    let mut xi = Vector6::<f64>::zeros();
                    xi[d] = JACOBIAN_EPS;
                    self.estimate.insert(key, base.retract(&xi));
                    if let Some(r1) = factor.whitened_residual_with(&self.estimate, mode) {
                        jacobian.set_column(d, &((r1 - &r0) / JACOBIAN_EPS));
                    }
                }
                self.estimate.insert(key, base);
                blocks.push((index, jacobian));
            }

            for (ia, ja) in &blocks {
                let bia = ja.transpose() * &r0;
                for i in 0..6 {
                    b[ia * 6 + i] += bia[i];
                }
                for (ib, jb) in &blocks {
                    let hab = ja.transpose() * jb;
                    for i in 0..6 {
                        for j in 0..6 {
                            h[(ia * 6 + i, ib * 6 + j)] += hab[(i, j)];
                        }
                    }
                }
            }
        }
        self.factors = factors;

        (h, b)
    }

    /// Retract every variable along its step block.
    fn apply_step(&mut self, dx: &DVector<f64>) {
        for (index, key) in self.keys.iter().enumerate() {
            let mut xi = Vector6::<f64>::zeros();
            for d in 0..6 {
                xi[d] = dx[index * 6 + d];
            }
            if let Some(pose) = self.estimate.get(*key) {
                let updated = pose.retract(&xi);
                self.estimate.insert(*key, updated);
            }
        }
    }
}

impl IncrementalSolver for DenseIncrementalSolver {
    fn update(&mut self, graph: FactorGraph, values: Values) {
        for (key, pose) in values.iter() {
            if !self.estimate.contains(*key) {
                self.key_index.insert(*key, self.keys.len());
                self.keys.push(*key);
                self.estimate.insert(*key, *pose);
            } else {
                log::debug!("key {} already known to the solver; keeping prior state", key);
            }
        }
        self.factors.extend(graph.iter().cloned());
        self.optimize();
    }

    fn refine(&mut self) {
        self.optimize();
    }

    fn estimate(&self) -> &Values {
        &self.estimate
    }

    fn marginal_covariance(&mut self, key: Key) -> Option<Matrix6<f64>> {
        let index = *self.key_index.get(&key)?;
        let dim = self.keys.len() * 6;
        let (mut h, _) = self.build_normal_equations(dim);
        for i in 0..dim {
            h[(i, i)] += 1e-9;
        }

        let inverse = h.cholesky()?.inverse();
        let mut out = Matrix6::<f64>::zeros();
        for i in 0..6 {
            for j in 0..6 {
                out[(i, j)] = inverse[(index * 6 + i, index * 6 + j)];
            }
        }
        Some(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Pose3D;
    use crate::graph::factors::DiagonalNoise;
    use approx::assert_relative_eq;

    fn solver() -> DenseIncrementalSolver {
        DenseIncrementalSolver::new(SolverConfig::default())
    }

    #[test]
    fn test_prior_pulls_variable() {
        let mut solver = solver();
        let target = Pose3D::from_euler(1.0, 2.0, 0.5, 0.1, 0.0, 0.2);

        let mut graph = FactorGraph::new();
        graph.add(Factor::PriorPose {
            key: 0,
            pose: target,
            noise: DiagonalNoise::isotropic(1e-2),
        });
        let mut values = Values::new();
        values.insert(0, Pose3D::identity());

        solver.update(graph, values);

        let estimated = solver.estimate().get(0).unwrap();
        assert!(estimated.translation_distance(&target) < 1e-4);
    }

    #[test]
    fn test_chain_of_betweens() {
        let mut solver = solver();
        let step = Pose3D::from_euler(1.0, 0.0, 0.0, 0.0, 0.0, 0.0);

        let mut graph = FactorGraph::new();
        let mut values = Values::new();
        graph.add(Factor::PriorPose {
            key: 0,
            pose: Pose3D::identity(),
            noise: DiagonalNoise::isotropic(1e-4),
        });
        values.insert(0, Pose3D::identity());
        for i in 0..3u64 {
            graph.add(Factor::BetweenPose {
                key1: i,
                key2: i + 1,
                measurement: step,
                noise: DiagonalNoise::isotropic(1e-4),
            });
            // deliberately poor initial guesses
            values.insert(i + 1, Pose3D::from_euler(0.5 * i as f64, 0.3, 0.0, 0.0, 0.0, 0.0));
        }

        solver.update(graph, values);

        let end = solver.estimate().get(3).unwrap();
        assert_relative_eq!(end.translation().x, 3.0, epsilon = 1e-2);
        assert_relative_eq!(end.translation().y, 0.0, epsilon = 1e-2);
    }

    #[test]
    fn test_refine_is_idempotent() {
        let mut solver = solver();
        let mut graph = FactorGraph::new();
        let mut values = Values::new();
        graph.add(Factor::PriorPose {
            key: 0,
            pose: Pose3D::identity(),
            noise: DiagonalNoise::isotropic(1e-4),
        });
        values.insert(0, Pose3D::identity());
        graph.add(Factor::BetweenPose {
            key1: 0,
            key2: 1,
            measurement: Pose3D::from_euler(1.0, 0.0, 0.0, 0.0, 0.0, 0.0),
            noise: DiagonalNoise::isotropic(1e-4),
        });
        values.insert(1, Pose3D::identity());

        solver.update(graph, values);
        let before = *solver.estimate().get(1).unwrap();

        solver.refine();
        solver.refine();
        let after = solver.estimate().get(1).unwrap();

        assert!(before.translation_distance(after) < 1e-8);
    }

    #[test]
    fn test_marginal_covariance_tracks_prior_noise() {
        let mut solver = solver();
        let mut graph = FactorGraph::new();
        let mut values = Values::new();
        graph.add(Factor::PriorPose {
            key: 0,
            pose: Pose3D::identity(),
            noise: DiagonalNoise::from_variances([1e-2, 1e-2, 1e-2, 4.0, 4.0, 4.0]),
        });
        values.insert(0, Pose3D::identity());
        solver.update(graph, values);

        let cov = solver.marginal_covariance(0).unwrap();
        // translation-x variance should recover the prior variance
        assert_relative_eq!(cov[(3, 3)], 4.0, epsilon = 0.1);
        assert_relative_eq!(cov[(0, 0)], 1e-2, epsilon = 1e-3);
    }

    #[test]
    fn test_loop_correction_distributes() {
        // A drifted chain closed by a loop factor back to the anchor.
        let mut solver = solver();
        let mut graph = FactorGraph::new();
        let mut values = Values::new();

        graph.add(Factor::PriorPose {
            key: 0,
            pose: Pose3D::identity(),
            noise: DiagonalNoise::isotropic(1e-6),
        });
        values.insert(0, Pose3D::identity());

        // Odometry claims 1m steps but initial guesses drifted
        for i in 0..4u64 {
            graph.add(Factor::BetweenPose {
                key1: i,
                key2: i + 1,
                measurement: Pose3D::from_euler(1.0, 0.0, 0.0, 0.0, 0.0, 0.0),
                noise: DiagonalNoise::isotropic(1e-2),
            });
            values.insert(
                i + 1,
                Pose3D::from_euler(1.1 * (i + 1) as f64, 0.05 * (i + 1) as f64, 0.0, 0.0, 0.0, 0.0),
            );
        }
        solver.update(graph, values);

        // Loop: node 4 observed back at 4m exactly
        let mut loop_graph = FactorGraph::new();
        loop_graph.add(Factor::BetweenPose {
            key1: 0,
            key2: 4,
            measurement: Pose3D::from_euler(4.0, 0.0, 0.0, 0.0, 0.0, 0.0),
            noise: DiagonalNoise::isotropic(1e-6),
        });
        solver.update(loop_graph, Values::new());
        for _ in 0..5 {
            solver.refine();
        }

        let end = solver.estimate().get(4).unwrap();
        assert_relative_eq!(end.translation().x, 4.0, epsilon = 1e-2);
        assert_relative_eq!(end.translation().y, 0.0, epsilon = 1e-2);
    }
}
