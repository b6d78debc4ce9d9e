//! Math primitives for 6-DoF estimation.
//!
//! The tangent-space convention is rotation-first: a twist is
//! `(ωx, ωy, ωz, vx, vy, vz)`. `se3_exp`/`se3_log` are exact maps between
//! SE(3) and its Lie algebra, with Taylor fallbacks near zero rotation.

use nalgebra::{Isometry3, Matrix3, Translation3, UnitQuaternion, Vector3, Vector6};

/// Normalize an angle to [-π, π].
#[inline]
pub fn normalize_angle(angle: f64) -> f64 {
    let mut a = angle;
    while a > std::f64::consts::PI {
        a -= 2.0 * std::f64::consts::PI;
    }
    while a < -std::f64::consts::PI {
        a += 2.0 * std::f64::consts::PI;
    }
    a
}

/// Skew-symmetric matrix of a 3-vector.
#[inline]
pub fn skew(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(0.0, -v.z, v.y, v.z, 0.0, -v.x, -v.y, v.x, 0.0)
}

/// SE(3) exponential map: twist `(ω, v)` to rigid transform.
pub fn se3_exp(xi: &Vector6<f64>) -> Isometry3<f64> {
    let omega = Vector3::new(xi[0], xi[1], xi[2]);
    let v = Vector3::new(xi[3], xi[4], xi[5]);

    let theta_sq = omega.norm_squared();
    let theta = theta_sq.sqrt();
    let omega_hat = skew(&omega);

    // V = I + a·Ω + b·Ω², with series expansions below ~1e-5 rad
    let (a, b) = if theta < 1e-5 {
        (0.5 - theta_sq / 24.0, 1.0 / 6.0 - theta_sq / 120.0)
    } else {
        (
            (1.0 - theta.cos()) / theta_sq,
            (theta - theta.sin()) / (theta_sq * theta),
        )
    };
    let v_mat = Matrix3::identity() + omega_hat * a + omega_hat * omega_hat * b;

    Isometry3::from_parts(
        Translation3::from(v_mat * v),
        UnitQuaternion::from_scaled_axis(omega),
    )
}

/// SE(3) logarithm map: rigid transform to twist `(ω, v)`.
pub fn se3_log(pose: &Isometry3<f64>) -> Vector6<f64> {
    let omega = pose.rotation.scaled_axis();
    let t = pose.translation.vector;

    let theta_sq = omega.norm_squared();
    let theta = theta_sq.sqrt();
    let omega_hat = skew(&omega);

    // V⁻¹ = I − Ω/2 + c·Ω²
    let c = if theta < 1e-5 {
        1.0 / 12.0 + theta_sq / 720.0
    } else {
        (1.0 - 0.5 * theta * (1.0 + theta.cos()) / theta.sin()) / theta_sq
    };
    let v_inv = Matrix3::identity() - omega_hat * 0.5 + omega_hat * omega_hat * c;

    let v = v_inv * t;
    Vector6::new(omega.x, omega.y, omega.z, v.x, v.y, v.z)
}

/// SLERP a single Euler axis toward an IMU reading.
///
/// Builds single-axis rotations for both angles, interpolates, and reads the
/// blended angle back out. Used to fold IMU roll/pitch into the matched pose.
pub fn blend_axis_angle(current: f64, imu: f64, weight: f64, axis: usize) -> f64 {
    let make = |angle: f64| match axis {
        0 => UnitQuaternion::from_euler_angles(angle, 0.0, 0.0),
        1 => UnitQuaternion::from_euler_angles(0.0, angle, 0.0),
        _ => UnitQuaternion::from_euler_angles(0.0, 0.0, angle),
    };
    let blended = make(current).slerp(&make(imu), weight);
    let (roll, pitch, yaw) = blended.euler_angles();
    match axis {
        0 => roll,
        1 => pitch,
        _ => yaw,
    }
}

/// Clamp a value to ±limit.
#[inline]
pub fn constrain(value: f64, limit: f64) -> f64 {
    value.clamp(-limit, limit)
}
