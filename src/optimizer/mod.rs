//! Gauss-Newton pose graph optimization over SE(3).
//!
//! This module uses the three-phase pattern:
//! 1. COLLECT: Extract poses and edges from the graph
//! 2. SOLVE: Run Gauss-Newton on the local copy
//! 3. APPLY: Write back optimized poses as one batch
//!
//! The graph is never left partially updated: if the solve aborts, the best
//! whole-batch estimate so far is applied.

use nalgebra::{DMatrix, DVector, Matrix3, Matrix6, Vector3, Vector6};
use tracing::{debug, info};

use crate::geometry::so3::{log_so3, skew};
use crate::geometry::SE3;
use crate::map::{KeyFrameId, PoseGraph};

/// Prior added to the first pose's diagonal Hessian block to remove the
/// gauge freedom of the pose graph.
const GAUGE_PRIOR: f64 = 1e9;

/// Configuration for pose graph optimization.
#[derive(Debug, Clone)]
pub struct OptimizerConfig {
    /// Maximum number of Gauss-Newton iterations.
    pub max_iterations: usize,

    /// Convergence threshold on the update step norm.
    pub convergence_threshold: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            max_iterations: 20,
            convergence_threshold: 1e-6,
        }
    }
}

/// Result of one optimization run.
#[derive(Debug, Clone)]
pub struct OptimizationResult {
    /// Whether the step norm dropped below the convergence threshold.
    pub converged: bool,

    /// Number of Gauss-Newton iterations performed.
    pub iterations: usize,

    /// Number of keyframe poses written back to the graph.
    pub poses_updated: usize,
}

/// Data extracted for one optimization run.
struct ProblemData {
    ids: Vec<KeyFrameId>,
    poses: Vec<SE3>,
    edges: Vec<ProblemEdge>,
}

struct ProblemEdge {
    from: usize,
    to: usize,
    measurement: SE3,
    information: Matrix6<f64>,
}

/// Solution of one optimization run, ready to apply.
struct Solution {
    poses: Vec<SE3>,
    converged: bool,
    iterations: usize,
}

/// Gauss-Newton pose graph optimizer.
#[derive(Debug, Clone, Default)]
pub struct PoseGraphOptimizer {
    config: OptimizerConfig,
}

impl PoseGraphOptimizer {
    /// Create an optimizer with the given configuration.
    pub fn new(config: OptimizerConfig) -> Self {
        Self { config }
    }

    /// Optimize all keyframe poses in the graph.
    ///
    /// Graphs with fewer than 3 keyframes are rejected without touching any
    /// pose. Poses are written back only as a complete batch.
    pub fn optimize(&self, graph: &mut PoseGraph) -> OptimizationResult {
        let problem = match collect_problem(graph) {
            Some(p) => p,
            None => {
                debug!(
                    num_keyframes = graph.num_keyframes(),
                    "pose graph too small to optimize"
                );
                return OptimizationResult {
                    converged: false,
                    iterations: 0,
                    poses_updated: 0,
                };
            }
        };

        let initial_error = total_error(&problem.poses, &problem.edges);
        let solution = solve_problem(&problem, &self.config);
        let final_error = total_error(&solution.poses, &problem.edges);
        let poses_updated = apply_solution(graph, &problem.ids, &solution);

        info!(
            iterations = solution.iterations,
            converged = solution.converged,
            initial_error,
            final_error,
            poses_updated,
            "pose graph optimization finished"
        );

        OptimizationResult {
            converged: solution.converged,
            iterations: solution.iterations,
            poses_updated,
        }
    }
}

/// PHASE 1: snapshot poses and edges. `None` if the graph is too small.
fn collect_problem(graph: &PoseGraph) -> Option<ProblemData> {
    if graph.num_keyframes() < 3 {
        return None;
    }

    let mut ids = Vec::with_capacity(graph.num_keyframes());
    let mut poses = Vec::with_capacity(graph.num_keyframes());
    for kf in graph.keyframes() {
        ids.push(kf.id);
        poses.push(kf.pose);
    }

    // Ids are arena indices, so edge endpoints map directly
    let edges = graph
        .edges()
        .iter()
        .map(|e| ProblemEdge {
            from: e.from.0 as usize,
            to: e.to.0 as usize,
            measurement: e.relative_pose,
            information: e.information,
        })
        .collect();

    Some(ProblemData { ids, poses, edges })
}

/// PHASE 2: Gauss-Newton on the local pose copy.
fn solve_problem(problem: &ProblemData, config: &OptimizerConfig) -> Solution {
    let n = problem.poses.len();
    let dim = 6 * n;

    let mut poses = problem.poses.clone();
    let mut iterations = 0;
    let mut converged = false;

    for _ in 0..config.max_iterations {
        iterations += 1;

        let mut h = DMatrix::<f64>::zeros(dim, dim);
        let mut b = DVector::<f64>::zeros(dim);

        for edge in &problem.edges {
            let pose_i = &poses[edge.from];
            let pose_j = &poses[edge.to];

            let error = edge_error(&edge.measurement, pose_i, pose_j);
            let (j_i, j_j) = edge_jacobians(&edge.measurement, pose_i, pose_j);

            accumulate_block(&mut h, &mut b, edge.from, edge.to, &j_i, &j_j, &edge.information, &error);
        }

        // Anchor the first pose to remove the gauge freedom
        for k in 0..6 {
            h[(k, k)] += GAUGE_PRIOR;
        }

        let delta = match h.lu().solve(&(-&b)) {
            Some(d) => d,
            None => {
                debug!(iteration = iterations, "normal equations singular, stopping");
                break;
            }
        };

        for (idx, pose) in poses.iter_mut().enumerate() {
            let block = Vector6::new(
                delta[6 * idx],
                delta[6 * idx + 1],
                delta[6 * idx + 2],
                delta[6 * idx + 3],
                delta[6 * idx + 4],
                delta[6 * idx + 5],
            );
            *pose = pose.retract_decoupled(&block);
        }

        if delta.norm() < config.convergence_threshold {
            converged = true;
            break;
        }
    }

    Solution {
        poses,
        converged,
        iterations,
    }
}

/// PHASE 3: write the whole batch of poses back. Returns the count written.
fn apply_solution(graph: &mut PoseGraph, ids: &[KeyFrameId], solution: &Solution) -> usize {
    let mut updated = 0;
    for (id, pose) in ids.iter().zip(solution.poses.iter()) {
        if let Some(kf) = graph.get_keyframe_mut(*id) {
            kf.pose = *pose;
            updated += 1;
        }
    }
    updated
}

/// Residual of one edge: e = [e_t; e_r] of E = Z⁻¹ ∘ (Tᵢ⁻¹ ∘ Tⱼ),
/// with e_t the translation of E and e_r the axis-angle of its rotation.
pub fn edge_error(measurement: &SE3, pose_from: &SE3, pose_to: &SE3) -> Vector6<f64> {
    let predicted = pose_from.inverse().compose(pose_to);
    let e = measurement.inverse().compose(&predicted);
    let e_r = log_so3(&e.rotation);
    Vector6::new(
        e.translation.x,
        e.translation.y,
        e.translation.z,
        e_r.x,
        e_r.y,
        e_r.z,
    )
}

/// Analytic Jacobians of the edge residual with respect to the decoupled
/// increments of both endpoint poses.
///
/// With A = Rzᵀ Rᵢᵀ and v = Rᵢᵀ (tⱼ - tᵢ):
/// ```text
/// J_from = [ -A   Rzᵀ [v]x ]      J_to = [ A  0 ]
///          [  0     -Rzᵀ   ]             [ 0  I ]
/// ```
/// The rotation rows use the first-order approximation of the logarithm,
/// which is exact at the solution.
fn edge_jacobians(measurement: &SE3, pose_from: &SE3, pose_to: &SE3) -> (Matrix6<f64>, Matrix6<f64>) {
    let rz_t = measurement.rotation.inverse().to_rotation_matrix();
    let rz_t = rz_t.matrix();
    let ri_t = pose_from.rotation.inverse().to_rotation_matrix();
    let ri_t = ri_t.matrix();

    let a: Matrix3<f64> = rz_t * ri_t;
    let v: Vector3<f64> = ri_t * (pose_to.translation - pose_from.translation);

    let mut j_from = Matrix6::<f64>::zeros();
    j_from.fixed_view_mut::<3, 3>(0, 0).copy_from(&(-a));
    j_from
        .fixed_view_mut::<3, 3>(0, 3)
        .copy_from(&(rz_t * skew(&v)));
    j_from.fixed_view_mut::<3, 3>(3, 3).copy_from(&(-rz_t));

    let mut j_to = Matrix6::<f64>::zeros();
    j_to.fixed_view_mut::<3, 3>(0, 0).copy_from(&a);
    j_to
        .fixed_view_mut::<3, 3>(3, 3)
        .copy_from(&Matrix3::identity());

    (j_from, j_to)
}

/// Accumulate one edge's normal-equation contribution.
#[allow(clippy::too_many_arguments)]
fn accumulate_block(
    h: &mut DMatrix<f64>,
    b: &mut DVector<f64>,
    from: usize,
    to: usize,
    j_from: &Matrix6<f64>,
    j_to: &Matrix6<f64>,
    information: &Matrix6<f64>,
    error: &Vector6<f64>,
) {
    let jt_w_from = j_from.transpose() * information;
    let jt_w_to = j_to.transpose() * information;

    add_block(h, from, from, &(jt_w_from * j_from));
    add_block(h, to, to, &(jt_w_to * j_to));
    add_block(h, from, to, &(jt_w_from * j_to));
    add_block(h, to, from, &(jt_w_to * j_from));

    let b_from = jt_w_from * error;
    let b_to = jt_w_to * error;
    for k in 0..6 {
        b[6 * from + k] += b_from[k];
        b[6 * to + k] += b_to[k];
    }
}

fn add_block(h: &mut DMatrix<f64>, row: usize, col: usize, block: &Matrix6<f64>) {
    for r in 0..6 {
        for c in 0..6 {
            h[(6 * row + r, 6 * col + c)] += block[(r, c)];
        }
    }
}

/// Weighted squared error over all edges (for logging).
fn total_error(poses: &[SE3], edges: &[ProblemEdge]) -> f64 {
    edges
        .iter()
        .map(|e| {
            let err = edge_error(&e.measurement, &poses[e.from], &poses[e.to]);
            (err.transpose() * e.information * err)[0]
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::{Matrix6, UnitQuaternion, Vector3};

    fn add_keyframe_at(graph: &mut PoseGraph, pose: SE3) -> KeyFrameId {
        graph
            .add_keyframe(0.0, pose, Matrix6::identity(), vec![], vec![], vec![])
            .unwrap()
    }

    fn straight_line_graph(n: usize) -> PoseGraph {
        let mut graph = PoseGraph::new();
        let mut prev: Option<(KeyFrameId, SE3)> = None;
        for i in 0..n {
            let pose = SE3::from_translation(Vector3::new(i as f64, 0.0, 0.0));
            let id = add_keyframe_at(&mut graph, pose);
            if let Some((prev_id, prev_pose)) = prev {
                let relative = prev_pose.inverse().compose(&pose);
                graph
                    .add_edge(prev_id, id, relative, Matrix6::identity())
                    .unwrap();
            }
            prev = Some((id, pose));
        }
        graph
    }

    #[test]
    fn test_edge_error_zero_for_identical_poses() {
        let pose = SE3::new(
            UnitQuaternion::from_euler_angles(0.1, 0.2, 0.3),
            Vector3::new(1.0, 2.0, 3.0),
        );
        let error = edge_error(&SE3::identity(), &pose, &pose);
        assert_relative_eq!(error.norm(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_edge_error_zero_for_consistent_measurement() {
        let pose_i = SE3::from_translation(Vector3::new(1.0, 0.0, 0.0));
        let pose_j = SE3::new(
            UnitQuaternion::from_euler_angles(0.0, 0.0, 0.5),
            Vector3::new(2.0, 1.0, 0.0),
        );
        let measurement = pose_i.inverse().compose(&pose_j);

        let error = edge_error(&measurement, &pose_i, &pose_j);
        assert_relative_eq!(error.norm(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_jacobians_match_numerical_differences() {
        let pose_i = SE3::new(
            UnitQuaternion::from_euler_angles(0.1, 0.0, -0.2),
            Vector3::new(1.0, 2.0, 0.5),
        );
        let pose_j = SE3::new(
            UnitQuaternion::from_euler_angles(0.0, 0.15, 0.1),
            Vector3::new(2.0, 2.2, 0.4),
        );

        // Measurement with the true relative rotation but an offset
        // translation: the rotation residual is zero, where the first-order
        // rotation rows are exact, while the translation residual is not
        let relative = pose_i.inverse().compose(&pose_j);
        let measurement = SE3::new(
            relative.rotation,
            relative.translation + Vector3::new(0.1, -0.05, 0.02),
        );

        let (j_i, j_j) = edge_jacobians(&measurement, &pose_i, &pose_j);
        let eps = 1e-5;

        for p in 0..6 {
            let mut step = Vector6::zeros();
            step[p] = eps;

            let err_plus = edge_error(&measurement, &pose_i.retract_decoupled(&step), &pose_j);
            let err_minus =
                edge_error(&measurement, &pose_i.retract_decoupled(&(-step)), &pose_j);
            let numeric = (err_plus - err_minus) / (2.0 * eps);
            for r in 0..6 {
                assert_relative_eq!(j_i[(r, p)], numeric[r], epsilon = 1e-6);
            }

            let err_plus = edge_error(&measurement, &pose_i, &pose_j.retract_decoupled(&step));
            let err_minus =
                edge_error(&measurement, &pose_i, &pose_j.retract_decoupled(&(-step)));
            let numeric = (err_plus - err_minus) / (2.0 * eps);
            for r in 0..6 {
                assert_relative_eq!(j_j[(r, p)], numeric[r], epsilon = 1e-6);
            }
        }
    }

    #[test]
    fn test_too_few_keyframes_fails_without_mutation() {
        let mut graph = straight_line_graph(2);
        let before = graph.keyframe_poses();

        let result = PoseGraphOptimizer::default().optimize(&mut graph);

        assert!(!result.converged);
        assert_eq!(result.iterations, 0);
        assert_eq!(result.poses_updated, 0);
        let after = graph.keyframe_poses();
        for ((_, a), (_, b)) in before.iter().zip(after.iter()) {
            assert_relative_eq!(a.translation, b.translation, epsilon = 1e-15);
        }
    }

    #[test]
    fn test_consistent_graph_converges_immediately() {
        let mut graph = straight_line_graph(4);
        let before = graph.keyframe_poses();

        let result = PoseGraphOptimizer::default().optimize(&mut graph);

        assert!(result.converged);
        assert_eq!(result.iterations, 1);
        assert_eq!(result.poses_updated, 4);

        // Consistent input is a fixed point of the optimizer
        let after = graph.keyframe_poses();
        for ((_, a), (_, b)) in before.iter().zip(after.iter()) {
            assert_relative_eq!(a.translation, b.translation, epsilon = 1e-8);
            assert!(a.rotation.angle_to(&b.rotation) < 1e-8);
        }
    }

    #[test]
    fn test_loop_closure_reduces_error() {
        // Straight-line odometry with drift: the loop edge claims the last
        // keyframe is closer to the first than odometry accumulated.
        let mut graph = straight_line_graph(5);
        let first = KeyFrameId::new(0);
        let last = KeyFrameId::new(4);

        let loop_measurement = SE3::from_translation(Vector3::new(3.6, 0.0, 0.0));
        graph
            .add_edge(first, last, loop_measurement, Matrix6::identity() * 100.0)
            .unwrap();

        let initial_error = {
            let poses: Vec<SE3> = graph.keyframes().map(|kf| kf.pose).collect();
            let edges: Vec<ProblemEdge> = graph
                .edges()
                .iter()
                .map(|e| ProblemEdge {
                    from: e.from.0 as usize,
                    to: e.to.0 as usize,
                    measurement: e.relative_pose,
                    information: e.information,
                })
                .collect();
            total_error(&poses, &edges)
        };
        assert!(initial_error > 1.0);

        let result = PoseGraphOptimizer::default().optimize(&mut graph);
        assert!(result.converged);

        let poses: Vec<SE3> = graph.keyframes().map(|kf| kf.pose).collect();
        let edges: Vec<ProblemEdge> = graph
            .edges()
            .iter()
            .map(|e| ProblemEdge {
                from: e.from.0 as usize,
                to: e.to.0 as usize,
                measurement: e.relative_pose,
                information: e.information,
            })
            .collect();
        let final_error = total_error(&poses, &edges);

        assert!(final_error < initial_error);

        // First pose is anchored
        assert_relative_eq!(poses[0].translation.norm(), 0.0, epsilon = 1e-3);
        // Last pose pulled towards the loop measurement
        assert!(poses[4].translation.x < 4.0);
        assert!(poses[4].translation.x > 3.5);
    }

    #[test]
    fn test_edgeless_graph_applies_unchanged_poses() {
        let mut graph = PoseGraph::new();
        for i in 0..3 {
            add_keyframe_at(
                &mut graph,
                SE3::from_translation(Vector3::new(i as f64, 0.0, 0.0)),
            );
        }
        let before = graph.keyframe_poses();

        let result = PoseGraphOptimizer::default().optimize(&mut graph);
        // Only the anchored block is constrained, so the normal equations are
        // singular; the optimizer stops and applies the unchanged snapshot
        assert!(!result.converged);
        assert_eq!(result.poses_updated, 3);

        let after = graph.keyframe_poses();
        for ((_, a), (_, b)) in before.iter().zip(after.iter()) {
            assert_relative_eq!(a.translation, b.translation, epsilon = 1e-9);
        }
    }
}
