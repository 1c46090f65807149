//! SE(3) rigid transformation represented as a unit quaternion plus translation.

use nalgebra::{UnitQuaternion, Vector3, Vector6};

use super::so3::{exp_so3, log_so3};

/// A rigid transformation in 3D.
///
/// `transform_point(p) = rotation * p + translation`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SE3 {
    /// Rotation component.
    pub rotation: UnitQuaternion<f64>,

    /// Translation component.
    pub translation: Vector3<f64>,
}

impl SE3 {
    /// The identity transformation.
    pub fn identity() -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::zeros(),
        }
    }

    /// Create from rotation and translation.
    pub fn new(rotation: UnitQuaternion<f64>, translation: Vector3<f64>) -> Self {
        Self {
            rotation,
            translation,
        }
    }

    /// Create a pure translation.
    pub fn from_translation(translation: Vector3<f64>) -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation,
        }
    }

    /// Inverse transformation: (R, t)⁻¹ = (Rᵀ, -Rᵀt).
    pub fn inverse(&self) -> Self {
        let rot_inv = self.rotation.inverse();
        Self {
            rotation: rot_inv,
            translation: -(rot_inv * self.translation),
        }
    }

    /// Composition: self ∘ other, applying `other` first.
    pub fn compose(&self, other: &SE3) -> Self {
        Self {
            rotation: self.rotation * other.rotation,
            translation: self.rotation * other.translation + self.translation,
        }
    }

    /// Apply the transformation to a point.
    pub fn transform_point(&self, p: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * p + self.translation
    }

    /// Decoupled tangent vector [t; φ]: translation stacked on the
    /// rotation's axis-angle. Not the full SE(3) logarithm; matches the
    /// decoupled update used by the pose graph optimizer.
    pub fn log_decoupled(&self) -> Vector6<f64> {
        let phi = log_so3(&self.rotation);
        Vector6::new(
            self.translation.x,
            self.translation.y,
            self.translation.z,
            phi.x,
            phi.y,
            phi.z,
        )
    }

    /// Apply a decoupled increment: t += δt, R ← R · exp(δr).
    pub fn retract_decoupled(&self, delta: &Vector6<f64>) -> Self {
        let dt = Vector3::new(delta[0], delta[1], delta[2]);
        let dr = Vector3::new(delta[3], delta[4], delta[5]);
        Self {
            rotation: self.rotation * exp_so3(&dr),
            translation: self.translation + dt,
        }
    }
}

impl Default for SE3 {
    fn default() -> Self {
        Self::identity()
    }
}
