//! GatiSLAM - LiDAR-inertial odometry back-end with multi-object tracking
//!
//! # Architecture
//!
//! The crate is organized into layered modules:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                 threads/ io/                        │  ← Workers, artifacts
//! └─────────────────────────────────────────────────────┘
//!                          │
//! ┌─────────────────────────────────────────────────────┐
//! │               engine/ tracking/                     │  ← Orchestration
//! │        (joint estimator, object tracker)            │
//! └─────────────────────────────────────────────────────┘
//!                          │
//! ┌─────────────────────────────────────────────────────┐
//! │            matching/ graph/ adapters/               │  ← Core algorithms
//! │   (scan-to-map, factors, solver, collaborators)     │
//! └─────────────────────────────────────────────────────┘
//!                          │
//! ┌─────────────────────────────────────────────────────┐
//! │              core/ preprocess/                      │  ← Foundation
//! │              (types, math, filters)                 │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! Each LiDAR sweep carries pre-extracted edge and planar features, an
//! inertial pose guess, and (through a detection service) a set of oriented
//! 3-D boxes. The [`engine::JointEstimator`] aligns the sweep against a
//! local sub-map, decides whether to retain a keyframe, and emits factors
//! into an incremental nonlinear solver: odometry, GPS, loop closure, and
//! the detection / constant-velocity / stable-pose factors that bind rigid
//! dynamic objects to the ego trajectory. Objects move between tight and
//! loose coupling depending on how well their detections and velocity
//! history hold up.

// ============================================================================
// Layer 1: Core foundation (no internal deps)
// ============================================================================
pub mod core;

// ============================================================================
// Layer 2: Preprocessing and configuration
// ============================================================================
pub mod config;
pub mod error;
pub mod preprocess;

// ============================================================================
// Layer 3: Algorithms (matching, factor graph, collaborators)
// ============================================================================
pub mod adapters;
pub mod graph;
pub mod matching;

// ============================================================================
// Layer 4: Estimation engine and object tracking
// ============================================================================
pub mod engine;
pub mod tracking;

// ============================================================================
// Layer 5: Shared state, worker threads, persisted artifacts
// ============================================================================
pub mod io;
pub mod state;
pub mod threads;

// ============================================================================
// Convenience re-exports (flat namespace for common use)
// ============================================================================

pub use crate::config::GatiConfig;
pub use crate::core::types::{BoundingBox3, Detection, PointCloud3D, Pose3D, SweepInput};
pub use crate::engine::{JointEstimator, StepOutput};
pub use crate::error::{GatiError, Result};
pub use crate::state::{create_context, SlamContext, SlamContextHandle};
