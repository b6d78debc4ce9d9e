//! Collaborator adapters: detection service, GPS queue, loop queues.

mod detection;
mod gps;
mod loop_closure;

pub use detection::{DetectionRequest, DetectionService};
pub use gps::{GpsMeasurement, GpsQueue};
pub use loop_closure::{LoopInfoQueue, LoopQueue, PendingLoopFactor};
