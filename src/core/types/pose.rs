//! 6-DoF rigid transform type.

use nalgebra::{Isometry3, Translation3, UnitQuaternion, Vector3, Vector6};
use serde::{Deserialize, Serialize};

use crate::core::math::{se3_exp, se3_log};

/// A rigid transform in SE(3).
///
/// Composition is non-commutative; identity is the neutral element.
/// [`Pose3D::local`] maps a relative pose to a 6-vector tangent `(ω, v)`
/// and [`Pose3D::retract`] maps a tangent back onto the manifold.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pose3D {
    isometry: Isometry3<f64>,
}

impl Pose3D {
    /// Create from an isometry.
    #[inline]
    pub fn new(isometry: Isometry3<f64>) -> Self {
        Self { isometry }
    }

    /// Identity pose.
    #[inline]
    pub fn identity() -> Self {
        Self {
            isometry: Isometry3::identity(),
        }
    }

    /// Create from translation and intrinsic roll/pitch/yaw (Rz·Ry·Rx).
    pub fn from_euler(x: f64, y: f64, z: f64, roll: f64, pitch: f64, yaw: f64) -> Self {
        Self {
            isometry: Isometry3::from_parts(
                Translation3::new(x, y, z),
                UnitQuaternion::from_euler_angles(roll, pitch, yaw),
            ),
        }
    }

    /// Create from a translation vector and a unit quaternion.
    pub fn from_parts(translation: Vector3<f64>, rotation: UnitQuaternion<f64>) -> Self {
        Self {
            isometry: Isometry3::from_parts(Translation3::from(translation), rotation),
        }
    }

    /// Underlying isometry.
    #[inline]
    pub fn isometry(&self) -> &Isometry3<f64> {
        &self.isometry
    }

    /// Translation component.
    #[inline]
    pub fn translation(&self) -> Vector3<f64> {
        self.isometry.translation.vector
    }

    /// Rotation component.
    #[inline]
    pub fn rotation(&self) -> UnitQuaternion<f64> {
        self.isometry.rotation
    }

    /// Intrinsic (roll, pitch, yaw) Euler angles.
    #[inline]
    pub fn euler_angles(&self) -> (f64, f64, f64) {
        self.isometry.rotation.euler_angles()
    }

    /// Compose two poses: `self ∘ other`.
    #[inline]
    pub fn compose(&self, other: &Pose3D) -> Pose3D {
        Pose3D::new(self.isometry * other.isometry)
    }

    /// Inverse of this pose.
    #[inline]
    pub fn inverse(&self) -> Pose3D {
        Pose3D::new(self.isometry.inverse())
    }

    /// Relative pose: `self⁻¹ ∘ other`.
    #[inline]
    pub fn between(&self, other: &Pose3D) -> Pose3D {
        Pose3D::new(self.isometry.inverse() * other.isometry)
    }

    /// Tangent of `other` in the chart centered at `self`: `log(self⁻¹ ∘ other)`.
    #[inline]
    pub fn local(&self, other: &Pose3D) -> Vector6<f64> {
        se3_log(&(self.isometry.inverse() * other.isometry))
    }

    /// Move along a tangent from `self`: `self ∘ exp(xi)`.
    #[inline]
    pub fn retract(&self, xi: &Vector6<f64>) -> Pose3D {
        Pose3D::new(self.isometry * se3_exp(xi))
    }

    /// Logarithm at the identity.
    #[inline]
    pub fn log(&self) -> Vector6<f64> {
        se3_log(&self.isometry)
    }

    /// Exponential at the identity.
    #[inline]
    pub fn exp(xi: &Vector6<f64>) -> Pose3D {
        Pose3D::new(se3_exp(xi))
    }

    /// Euclidean distance between translations.
    #[inline]
    pub fn translation_distance(&self, other: &Pose3D) -> f64 {
        (self.translation() - other.translation()).norm()
    }
}

impl Default for Pose3D {
    fn default() -> Self {
        Self::identity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::f64::consts::FRAC_PI_2;

    #[test]
    fn test_compose_identity() {
        let p = Pose3D::from_euler(1.0, 2.0, 3.0, 0.1, 0.2, 0.3);
        let result = p.compose(&Pose3D::identity());
        assert_relative_eq!(result.translation().x, 1.0, epsilon = 1e-12);
        assert_relative_eq!(result.translation().z, 3.0, epsilon = 1e-12);
    }

    #[test]
    fn test_inverse_roundtrip() {
        let p = Pose3D::from_euler(1.0, -2.0, 0.5, 0.3, -0.1, 1.2);
        let result = p.compose(&p.inverse());
        assert_relative_eq!(result.translation().norm(), 0.0, epsilon = 1e-12);
        assert_relative_eq!(result.rotation().angle(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_composition_order() {
        let forward = Pose3D::from_euler(1.0, 0.0, 0.0, 0.0, 0.0, 0.0);
        let turn = Pose3D::from_euler(0.0, 0.0, 0.0, 0.0, 0.0, FRAC_PI_2);

        let a = turn.compose(&forward);
        assert_relative_eq!(a.translation().x, 0.0, epsilon = 1e-12);
        assert_relative_eq!(a.translation().y, 1.0, epsilon = 1e-12);

        let b = forward.compose(&turn);
        assert_relative_eq!(b.translation().x, 1.0, epsilon = 1e-12);
        assert_relative_eq!(b.translation().y, 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_retract_local_roundtrip() {
        // R1: Retract(Local(I, P)) == P
        let p = Pose3D::from_euler(0.7, -1.1, 2.0, 0.2, -0.3, 0.9);
        let back = Pose3D::identity().retract(&Pose3D::identity().local(&p));
        assert_relative_eq!(back.translation_distance(&p), 0.0, epsilon = 1e-10);
        assert_relative_eq!(
            back.rotation().angle_to(&p.rotation()),
            0.0,
            epsilon = 1e-10
        );
    }

    #[test]
    fn test_between() {
        let a = Pose3D::from_euler(1.0, 0.0, 0.0, 0.0, 0.0, 0.0);
        let b = Pose3D::from_euler(2.0, 1.0, 0.0, 0.0, 0.0, 0.0);
        let rel = a.between(&b);
        assert_relative_eq!(rel.translation().x, 1.0, epsilon = 1e-12);
        assert_relative_eq!(rel.translation().y, 1.0, epsilon = 1e-12);
        assert_relative_eq!(a.compose(&rel).translation().y, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_euler_roundtrip() {
        let p = Pose3D::from_euler(0.0, 0.0, 0.0, 0.15, -0.25, 0.35);
        let (roll, pitch, yaw) = p.euler_angles();
        assert_relative_eq!(roll, 0.15, epsilon = 1e-12);
        assert_relative_eq!(pitch, -0.25, epsilon = 1e-12);
        assert_relative_eq!(yaw, 0.35, epsilon = 1e-12);
    }
}
