//! Estimation engine: keyframe store, sub-map assembly, joint estimator.

mod estimator;
mod keyframe;
mod submap;

pub use estimator::{JointEstimator, ObjectStateOutput, StepOutput};
pub use keyframe::{Keyframe, KeyframeStore};
pub use submap::{select_surrounding_keyframes, SubmapCache};
