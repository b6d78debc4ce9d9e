//! Asynchronous object detection requests.
//!
//! One request per LiDAR step, launched at step entry and joined before
//! factor emission. At-most-once delivery: a service that fails or panics
//! yields a detection-free step.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::core::types::{BoundingBox3, PointCloud3D};

/// The external object detector.
///
/// Request is the raw deskewed cloud; response is a set of oriented boxes
/// with per-box scores, or `None` when the detector is unavailable.
pub trait DetectionService: Send + Sync {
    fn detect(&self, cloud: &PointCloud3D) -> Option<Vec<BoundingBox3>>;
}

/// A one-shot in-flight detection request.
pub struct DetectionRequest {
    handle: JoinHandle<Option<Vec<BoundingBox3>>>,
}

impl DetectionRequest {
    /// Launch the request on its own thread.
    pub fn launch(service: Arc<dyn DetectionService>, cloud: PointCloud3D) -> Self {
        let handle = thread::spawn(move || service.detect(&cloud));
        Self { handle }
    }

    /// Join the request. A panicked service counts as no response.
    pub fn join(self) -> Option<Vec<BoundingBox3>> {
        match self.handle.join() {
            Ok(result) => result,
            Err(_) => {
                log::warn!("detection service panicked; treating step as detection-free");
                None
            }
        }
    }
}
