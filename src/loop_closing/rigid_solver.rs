//! Rigid SE(3) solver using Horn's method with RANSAC.
//!
//! Computes the rigid transformation between two sets of 3D point
//! correspondences. Used by geometric loop verification to estimate the
//! relative pose between a query and a matched keyframe.

use nalgebra::{Matrix3, UnitQuaternion, Vector3};
use rand::prelude::*;

use crate::geometry::SE3;

/// Minimum ratio of the second to the first singular value of the
/// cross-covariance before a point configuration counts as degenerate.
const RANK_TOLERANCE: f64 = 1e-6;

/// Configuration for the rigid RANSAC solver.
#[derive(Debug, Clone)]
pub struct RigidSolverConfig {
    /// Maximum number of RANSAC iterations.
    pub max_iterations: usize,
    /// Inlier threshold in meters (point-to-point error).
    pub inlier_threshold: f64,
    /// Minimum number of inliers required.
    pub min_inliers: usize,
    /// Probability of finding a good model (for adaptive iteration count).
    pub probability: f64,
}

impl Default for RigidSolverConfig {
    fn default() -> Self {
        Self {
            max_iterations: 300,
            inlier_threshold: 0.075, // 7.5cm
            min_inliers: 12,
            probability: 0.99,
        }
    }
}

/// Result from the rigid RANSAC solver.
#[derive(Debug, Clone)]
pub struct RigidResult {
    /// The computed rigid transformation.
    pub transform: SE3,
    /// Indices of inlier correspondences.
    pub inliers: Vec<usize>,
    /// Number of inliers.
    pub num_inliers: usize,
    /// Mean squared error of the inliers.
    pub mse: f64,
}

/// Estimate the rigid transformation T such that points2 ≈ T * points1.
///
/// Runs Horn's closed-form alignment on minimal 3-point samples inside
/// RANSAC, then refines on the full inlier set.
///
/// Returns `None` if the correspondence sets are too small or RANSAC cannot
/// find `min_inliers` consistent correspondences.
pub fn estimate_rigid_ransac(
    points1: &[Vector3<f64>],
    points2: &[Vector3<f64>],
    config: &RigidSolverConfig,
) -> Option<RigidResult> {
    let n = points1.len();
    if n < 3 || n != points2.len() || n < config.min_inliers {
        return None;
    }

    let mut rng = rand::thread_rng();
    let mut best_result: Option<RigidResult> = None;
    let mut best_inliers = 0;

    // Adaptive number of iterations based on inlier ratio
    let mut max_iter = config.max_iterations;

    for iteration in 0..max_iter {
        if iteration >= max_iter {
            break;
        }

        let indices = sample_three_indices(&mut rng, n);

        let sample_pts1: Vec<_> = indices.iter().map(|&i| points1[i]).collect();
        let sample_pts2: Vec<_> = indices.iter().map(|&i| points2[i]).collect();

        let transform = match estimate_rigid_horn(&sample_pts1, &sample_pts2) {
            Some(t) => t,
            None => continue,
        };

        let (inliers, mse) = find_inliers(points1, points2, &transform, config.inlier_threshold);

        if inliers.len() > best_inliers {
            best_inliers = inliers.len();
            best_result = Some(RigidResult {
                transform,
                num_inliers: inliers.len(),
                inliers,
                mse,
            });

            if best_inliers >= config.min_inliers {
                let inlier_ratio = best_inliers as f64 / n as f64;
                let updated_iter = compute_adaptive_iterations(inlier_ratio, config.probability, 3);
                max_iter = max_iter.min(iteration + 1 + updated_iter);
            }
        }
    }

    // Refine with all inliers if we have a good result
    if let Some(ref mut result) = best_result {
        if result.num_inliers >= config.min_inliers {
            let inlier_pts1: Vec<_> = result.inliers.iter().map(|&i| points1[i]).collect();
            let inlier_pts2: Vec<_> = result.inliers.iter().map(|&i| points2[i]).collect();

            if let Some(refined) = estimate_rigid_horn(&inlier_pts1, &inlier_pts2) {
                let (new_inliers, new_mse) =
                    find_inliers(points1, points2, &refined, config.inlier_threshold);

                if new_inliers.len() >= result.num_inliers {
                    result.transform = refined;
                    result.inliers = new_inliers;
                    result.num_inliers = result.inliers.len();
                    result.mse = new_mse;
                }
            }
        }
    }

    best_result.filter(|r| r.num_inliers >= config.min_inliers)
}

/// Rigid alignment via Horn's closed-form solution.
///
/// Algorithm:
/// 1. Compute centroids of both point sets and center the points
/// 2. Compute rotation via SVD of the cross-covariance matrix
/// 3. Compute translation: t = c2 - R * c1
///
/// Returns `None` for fewer than 3 correspondences or a rank-deficient
/// configuration (collinear or coincident points).
///
/// Reference: B.K.P. Horn, "Closed-form solution of absolute orientation
/// using unit quaternions"
pub fn estimate_rigid_horn(points1: &[Vector3<f64>], points2: &[Vector3<f64>]) -> Option<SE3> {
    let n = points1.len();
    if n < 3 || n != points2.len() {
        return None;
    }

    let centroid1 = compute_centroid(points1);
    let centroid2 = compute_centroid(points2);

    let centered1: Vec<_> = points1.iter().map(|p| p - centroid1).collect();
    let centered2: Vec<_> = points2.iter().map(|p| p - centroid2).collect();

    // Cross-covariance matrix: H = sum(p1_i * p2_i^T)
    let mut h = Matrix3::zeros();
    for i in 0..n {
        h += centered1[i] * centered2[i].transpose();
    }

    // SVD: H = U * S * V^T, then R = V * U^T
    let svd = h.svd(true, true);

    // Collinear (or coincident) point sets make H rank deficient and leave
    // the rotation about the line unconstrained, so the SVD rotation is
    // arbitrary. Reject them.
    let sv = &svd.singular_values;
    if sv[1] <= sv[0] * RANK_TOLERANCE {
        return None;
    }

    let u = svd.u?;
    let v_t = svd.v_t?;

    let mut rotation_mat = v_t.transpose() * u.transpose();

    // Handle reflection case (det(R) = -1)
    if rotation_mat.determinant() < 0.0 {
        let mut v = v_t.transpose();
        for i in 0..3 {
            v[(i, 2)] = -v[(i, 2)];
        }
        rotation_mat = v * u.transpose();
    }

    let rotation = UnitQuaternion::from_rotation_matrix(
        &nalgebra::Rotation3::from_matrix_unchecked(rotation_mat),
    );

    let translation = centroid2 - rotation * centroid1;

    Some(SE3::new(rotation, translation))
}

/// Compute centroid of a set of 3D points.
fn compute_centroid(points: &[Vector3<f64>]) -> Vector3<f64> {
    if points.is_empty() {
        return Vector3::zeros();
    }
    let sum: Vector3<f64> = points.iter().sum();
    sum / points.len() as f64
}

/// Find inliers for a given rigid transformation.
fn find_inliers(
    points1: &[Vector3<f64>],
    points2: &[Vector3<f64>],
    transform: &SE3,
    threshold: f64,
) -> (Vec<usize>, f64) {
    let threshold_sq = threshold * threshold;
    let mut inliers = Vec::new();
    let mut sum_sq_error = 0.0;

    for (i, (p1, p2)) in points1.iter().zip(points2.iter()).enumerate() {
        let p1_transformed = transform.transform_point(p1);
        let error_sq = (p1_transformed - p2).norm_squared();

        if error_sq < threshold_sq {
            inliers.push(i);
            sum_sq_error += error_sq;
        }
    }

    let mse = if inliers.is_empty() {
        f64::INFINITY
    } else {
        sum_sq_error / inliers.len() as f64
    };

    (inliers, mse)
}

/// Sample three unique random indices.
fn sample_three_indices(rng: &mut impl Rng, n: usize) -> [usize; 3] {
    let mut indices = [0usize; 3];
    indices[0] = rng.gen_range(0..n);

    loop {
        indices[1] = rng.gen_range(0..n);
        if indices[1] != indices[0] {
            break;
        }
    }

    loop {
        indices[2] = rng.gen_range(0..n);
        if indices[2] != indices[0] && indices[2] != indices[1] {
            break;
        }
    }

    indices
}

/// Compute adaptive number of RANSAC iterations.
///
/// k = log(1 - p) / log(1 - w^n), with w the inlier ratio, n the sample
/// size, p the desired success probability.
fn compute_adaptive_iterations(inlier_ratio: f64, probability: f64, sample_size: usize) -> usize {
    if inlier_ratio <= 0.0 {
        return usize::MAX;
    }
    if inlier_ratio >= 1.0 {
        return 1;
    }

    let w_n = inlier_ratio.powi(sample_size as i32);
    let log_denom = (1.0 - w_n).ln();

    if log_denom.abs() < 1e-10 {
        return 1;
    }

    let k = (1.0 - probability).ln() / log_denom;
    (k.ceil() as usize).max(1)
}
