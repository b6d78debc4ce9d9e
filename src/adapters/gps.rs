//! GPS measurement queue.

use std::collections::VecDeque;

use nalgebra::Vector3;

use crate::config::GpsConfig;

/// Messages this much older than the current scan are dropped; newer ones
/// are held for a later step.
const GPS_TIME_WINDOW: f64 = 0.2;

/// Minimum travel between accepted fixes (meters).
const GPS_SPACING: f64 = 5.0;

/// One GPS fix.
#[derive(Debug, Clone)]
pub struct GpsMeasurement {
    /// Fix timestamp in seconds.
    pub stamp: f64,

    /// Position in the map frame.
    pub position: Vector3<f64>,

    /// Diagonal position variances (x, y, z).
    pub variances: Vector3<f64>,
}

/// FIFO of GPS fixes with staleness and quality gating.
#[derive(Debug, Default)]
pub struct GpsQueue {
    queue: VecDeque<GpsMeasurement>,
    last_accepted: Option<Vector3<f64>>,
}

impl GpsQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a fix.
    pub fn push(&mut self, measurement: GpsMeasurement) {
        self.queue.push_back(measurement);
    }

    /// Number of buffered fixes.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Next usable fix for the scan at `now`.
    ///
    /// Drops fixes older than 0.2 s before the scan, holds fixes more than
    /// 0.2 s after it, and skips fixes that are too noisy, uninitialized at
    /// the origin, or within 5 m of the last accepted fix. When elevation is
    /// not used, z is clamped to `fallback_z` with a 0.01 variance before
    /// the spacing check.
    pub fn next_usable(
        &mut self,
        now: f64,
        config: &GpsConfig,
        fallback_z: f64,
    ) -> Option<GpsMeasurement> {
        while let Some(front) = self.queue.front() {
            if front.stamp < now - GPS_TIME_WINDOW {
                self.queue.pop_front();
                continue;
            }
            if front.stamp > now + GPS_TIME_WINDOW {
                return None;
            }

            let mut fix = self.queue.pop_front().expect("front checked");

            if fix.variances.x > config.gps_cov_threshold
                || fix.variances.y > config.gps_cov_threshold
            {
                log::debug!("gps fix at {:.3} dropped: covariance too large", fix.stamp);
                continue;
            }

            if !config.use_gps_elevation {
                fix.position.z = fallback_z;
                fix.variances.z = 0.01;
            }

            // An all-zero fix means the receiver has not initialized
            if fix.position.x.abs() < 1e-6 && fix.position.y.abs() < 1e-6 {
                continue;
            }

            match self.last_accepted {
                Some(last) if (fix.position - last).norm() < GPS_SPACING => continue,
                _ => {
                    self.last_accepted = Some(fix.position);
                    return Some(fix);
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fix(stamp: f64, x: f64, var: f64) -> GpsMeasurement {
        GpsMeasurement {
            stamp,
            position: Vector3::new(x, 1.0, 0.0),
            variances: Vector3::new(var, var, var),
        }
    }

    #[test]
    fn test_stale_fixes_dropped() {
        let mut queue = GpsQueue::new();
        queue.push(fix(0.0, 10.0, 0.5));
        queue.push(fix(9.95, 20.0, 0.5));

        let usable = queue.next_usable(10.0, &GpsConfig::default(), 0.0);
        assert_eq!(usable.unwrap().position.x, 20.0);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_future_fixes_held() {
        let mut queue = GpsQueue::new();
        queue.push(fix(11.0, 10.0, 0.5));

        assert!(queue.next_usable(10.0, &GpsConfig::default(), 0.0).is_none());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_noisy_fix_skipped() {
        let mut queue = GpsQueue::new();
        queue.push(fix(10.0, 10.0, 100.0));

        assert!(queue.next_usable(10.0, &GpsConfig::default(), 0.0).is_none());
    }

    #[test]
    fn test_spacing_enforced() {
        let mut queue = GpsQueue::new();
        queue.push(fix(10.0, 10.0, 0.5));
        queue.push(fix(10.05, 11.0, 0.5)); // only 1m from the first
        queue.push(fix(10.1, 30.0, 0.5));

        let first = queue.next_usable(10.0, &GpsConfig::default(), 0.0).unwrap();
        assert_eq!(first.position.x, 10.0);

        let second = queue.next_usable(10.1, &GpsConfig::default(), 0.0).unwrap();
        assert_eq!(second.position.x, 30.0);
    }

    #[test]
    fn test_elevation_clamped() {
        let mut queue = GpsQueue::new();
        let mut m = fix(10.0, 10.0, 0.5);
        m.position.z = 99.0;
        queue.push(m);

        let usable = queue.next_usable(10.0, &GpsConfig::default(), 2.5).unwrap();
        assert_eq!(usable.position.z, 2.5);
        assert_eq!(usable.variances.z, 0.01);
    }

    #[test]
    fn test_uninitialized_fix_rejected() {
        let mut queue = GpsQueue::new();
        let mut m = fix(10.0, 0.0, 0.5);
        m.position.y = 0.0;
        queue.push(m);

        assert!(queue.next_usable(10.0, &GpsConfig::default(), 0.0).is_none());
    }
}
