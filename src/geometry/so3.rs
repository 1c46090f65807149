//! SO(3) utilities: skew-symmetric matrices and the exponential/logarithm maps.

use nalgebra::{Matrix3, UnitQuaternion, Vector3};

/// Small angle threshold for numerical stability.
pub const SMALL_ANGLE_THRESHOLD: f64 = 1e-6;

/// Constructs the skew-symmetric matrix [v]× such that [v]× u = v × u.
///
/// ```text
/// [v]× = |  0   -v_z   v_y |
///        |  v_z   0   -v_x |
///        | -v_y  v_x    0  |
/// ```
#[inline]
pub fn skew(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(
        0.0, -v.z, v.y,
        v.z, 0.0, -v.x,
        -v.y, v.x, 0.0,
    )
}

/// Exponential map: axis-angle vector φ to a rotation.
///
/// `from_scaled_axis` is numerically stable down to zero angle, so tiny
/// increments are applied instead of being rounded away.
pub fn exp_so3(phi: &Vector3<f64>) -> UnitQuaternion<f64> {
    UnitQuaternion::from_scaled_axis(*phi)
}

/// Logarithm map: rotation to its axis-angle vector.
///
/// Computed from the rotation matrix R as
/// ```text
/// θ = arccos(clamp((tr(R) - 1) / 2, -1, 1))
/// φ = θ / (2 sin θ) * (R₂₁ - R₁₂, R₀₂ - R₂₀, R₁₀ - R₀₁)
/// ```
/// returning zero when θ < 1e-6.
pub fn log_so3(q: &UnitQuaternion<f64>) -> Vector3<f64> {
    let r = q.to_rotation_matrix();
    let r = r.matrix();

    let cos_theta = ((r.trace() - 1.0) / 2.0).clamp(-1.0, 1.0);
    let theta = cos_theta.acos();

    if theta < SMALL_ANGLE_THRESHOLD {
        return Vector3::zeros();
    }

    let axis = Vector3::new(
        r[(2, 1)] - r[(1, 2)],
        r[(0, 2)] - r[(2, 0)],
        r[(1, 0)] - r[(0, 1)],
    ) / (2.0 * theta.sin());

    axis * theta
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_skew_cross_product() {
        let v = Vector3::new(1.0, 2.0, 3.0);
        let u = Vector3::new(4.0, 5.0, 6.0);

        let cross_direct = v.cross(&u);
        let cross_skew = skew(&v) * u;

        assert_relative_eq!(cross_direct, cross_skew, epsilon = 1e-12);
    }

    #[test]
    fn test_skew_antisymmetric() {
        let v = Vector3::new(1.0, 2.0, 3.0);
        let skew_v = skew(&v);

        assert_relative_eq!(skew_v, -skew_v.transpose(), epsilon = 1e-12);
    }

    #[test]
    fn test_exp_log_roundtrip() {
        let phi = Vector3::new(0.3, -0.2, 0.5);
        let q = exp_so3(&phi);
        let phi_back = log_so3(&q);

        assert_relative_eq!(phi, phi_back, epsilon = 1e-10);
    }

    #[test]
    fn test_log_identity_is_zero() {
        let q = UnitQuaternion::identity();
        assert_relative_eq!(log_so3(&q), Vector3::zeros(), epsilon = 1e-12);
    }

    #[test]
    fn test_exp_preserves_tiny_angles() {
        // Sub-microradian increments must still rotate, otherwise small
        // optimizer steps get silently discarded
        let phi = Vector3::new(2e-8, 0.0, 0.0);
        let q = exp_so3(&phi);

        let rotated = q * Vector3::y();
        assert_relative_eq!(rotated.z, 2e-8, epsilon = 1e-12);
    }

    #[test]
    fn test_log_quarter_turn() {
        let q = UnitQuaternion::from_axis_angle(
            &nalgebra::Unit::new_normalize(Vector3::new(0.0, 0.0, 1.0)),
            std::f64::consts::FRAC_PI_2,
        );
        let phi = log_so3(&q);

        assert_relative_eq!(phi.x, 0.0, epsilon = 1e-10);
        assert_relative_eq!(phi.y, 0.0, epsilon = 1e-10);
        assert_relative_eq!(phi.z, std::f64::consts::FRAC_PI_2, epsilon = 1e-10);
    }
}
