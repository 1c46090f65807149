//! Geometric primitives: SE(3) transforms and SO(3) helpers.

pub mod se3;
pub mod so3;

pub use se3::SE3;
