//! PoseGraph - the central data store of the back-end.
//!
//! Holds keyframes, landmarks, edges, and loop closure records. Keyframes and
//! landmarks live in dense arenas indexed by their sequential ids; edges and
//! loop closures are append-only lists referencing ids. The graph validates
//! structural input (covariances, edge endpoints) and rejects malformed data
//! with typed errors; everything else is permissive.

use std::collections::HashMap;

use nalgebra::{Matrix3, Matrix6, Vector2, Vector3};
use thiserror::Error;
use tracing::debug;

use crate::geometry::SE3;

use super::keyframe::KeyFrame;
use super::landmark::Landmark;
use super::types::{Descriptor, KeyFrameId, Keypoint, LandmarkId};

/// Tolerance for covariance symmetry checks.
const SYMMETRY_TOLERANCE: f64 = 1e-9;

/// Errors raised by graph mutations on structurally invalid input.
#[derive(Debug, Error)]
pub enum GraphError {
    /// A supplied covariance matrix is not symmetric positive semi-definite.
    #[error("covariance matrix is not symmetric positive semi-definite")]
    InvalidCovariance,

    /// An edge or loop closure references a keyframe that does not exist.
    #[error("unknown keyframe {0}")]
    UnknownKeyframe(KeyFrameId),
}

/// A constraint between two keyframes.
///
/// Odometry and loop closure edges share this representation; they differ
/// only in how they were created.
#[derive(Debug, Clone)]
pub struct Edge {
    /// Source keyframe.
    pub from: KeyFrameId,

    /// Target keyframe.
    pub to: KeyFrameId,

    /// Measured relative transform: pose_from⁻¹ ∘ pose_to.
    pub relative_pose: SE3,

    /// 6x6 information matrix (inverse covariance) weighting this constraint.
    pub information: Matrix6<f64>,
}

/// A record of an accepted loop closure.
#[derive(Debug, Clone)]
pub struct LoopClosure {
    /// The recent keyframe that closed the loop.
    pub query_frame_id: KeyFrameId,

    /// The older keyframe it matched against.
    pub match_frame_id: KeyFrameId,

    /// Estimated relative transform from match frame to query frame.
    pub relative_pose: SE3,

    /// Appearance similarity of the accepted candidate, in (threshold, 1].
    pub confidence: f64,

    /// Matched feature index pairs (query feature, match feature).
    pub matches: Vec<(usize, usize)>,

    /// Timestamp of the query keyframe.
    pub timestamp: f64,
}

/// The pose graph: keyframe and landmark arenas plus constraint lists.
#[derive(Default)]
pub struct PoseGraph {
    keyframes: Vec<KeyFrame>,
    landmarks: Vec<Landmark>,
    edges: Vec<Edge>,
    loop_closures: Vec<LoopClosure>,
}

impl PoseGraph {
    /// Create an empty pose graph.
    pub fn new() -> Self {
        Self::default()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Insertion
    // ─────────────────────────────────────────────────────────────────────────

    /// Insert a keyframe and return its id.
    ///
    /// Ids are assigned sequentially starting at 0. Fails if the pose
    /// covariance is not symmetric PSD.
    pub fn add_keyframe(
        &mut self,
        timestamp: f64,
        pose: SE3,
        pose_covariance: Matrix6<f64>,
        keypoints: Vec<Keypoint>,
        descriptors: Vec<Descriptor>,
        points_cam: Vec<Option<Vector3<f64>>>,
    ) -> Result<KeyFrameId, GraphError> {
        if !is_valid_covariance6(&pose_covariance) {
            return Err(GraphError::InvalidCovariance);
        }

        let id = KeyFrameId::new(self.keyframes.len() as u64);
        self.keyframes.push(KeyFrame::new(
            id,
            timestamp,
            pose,
            pose_covariance,
            keypoints,
            descriptors,
            points_cam,
        ));
        Ok(id)
    }

    /// Insert a landmark and return its id.
    pub fn add_landmark(
        &mut self,
        position: Vector3<f64>,
        covariance: Matrix3<f64>,
        descriptor: Option<Descriptor>,
    ) -> Result<LandmarkId, GraphError> {
        if !is_valid_covariance3(&covariance) {
            return Err(GraphError::InvalidCovariance);
        }

        let id = LandmarkId::new(self.landmarks.len() as u64);
        self.landmarks
            .push(Landmark::new(id, position, covariance, descriptor));
        Ok(id)
    }

    /// Record that `kf_id` observed `lm_id` at the given pixel.
    ///
    /// Observations referencing unknown ids are dropped silently; the graph
    /// stays permissive towards front-end bookkeeping races.
    pub fn add_observation(&mut self, kf_id: KeyFrameId, lm_id: LandmarkId, pixel: Vector2<f64>) {
        let kf_known = (kf_id.0 as usize) < self.keyframes.len();
        let lm_known = (lm_id.0 as usize) < self.landmarks.len();
        if !kf_known || !lm_known {
            debug!(%kf_id, %lm_id, "dropping observation with unknown id");
            return;
        }

        self.keyframes[kf_id.0 as usize].add_observation(lm_id, pixel);
        self.landmarks[lm_id.0 as usize].add_observation(kf_id, pixel);
    }

    /// Add a constraint edge between two existing keyframes.
    ///
    /// Duplicate edges between the same pair are legal and accumulate during
    /// optimization. Both endpoints record the connection.
    pub fn add_edge(
        &mut self,
        from: KeyFrameId,
        to: KeyFrameId,
        relative_pose: SE3,
        information: Matrix6<f64>,
    ) -> Result<(), GraphError> {
        self.check_keyframe(from)?;
        self.check_keyframe(to)?;

        self.edges.push(Edge {
            from,
            to,
            relative_pose,
            information,
        });

        self.keyframes[from.0 as usize].connected_keyframes.insert(to);
        self.keyframes[to.0 as usize].connected_keyframes.insert(from);
        Ok(())
    }

    /// Record an accepted loop closure.
    ///
    /// Appends one `LoopClosure` record and one edge weighted by the
    /// closure confidence (information = I₆ · confidence).
    pub fn add_loop_closure(
        &mut self,
        query: KeyFrameId,
        matched: KeyFrameId,
        relative_pose: SE3,
        confidence: f64,
        matches: Vec<(usize, usize)>,
    ) -> Result<(), GraphError> {
        self.check_keyframe(query)?;
        self.check_keyframe(matched)?;

        let timestamp = self.keyframes[query.0 as usize].timestamp;
        self.loop_closures.push(LoopClosure {
            query_frame_id: query,
            match_frame_id: matched,
            relative_pose,
            confidence,
            matches,
            timestamp,
        });

        self.add_edge(
            matched,
            query,
            relative_pose,
            Matrix6::identity() * confidence,
        )
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Access
    // ─────────────────────────────────────────────────────────────────────────

    /// Get a keyframe by id.
    pub fn get_keyframe(&self, id: KeyFrameId) -> Option<&KeyFrame> {
        self.keyframes.get(id.0 as usize)
    }

    /// Get a mutable keyframe by id.
    pub fn get_keyframe_mut(&mut self, id: KeyFrameId) -> Option<&mut KeyFrame> {
        self.keyframes.get_mut(id.0 as usize)
    }

    /// Get a landmark by id.
    pub fn get_landmark(&self, id: LandmarkId) -> Option<&Landmark> {
        self.landmarks.get(id.0 as usize)
    }

    /// Iterate over all keyframes in insertion order.
    pub fn keyframes(&self) -> impl Iterator<Item = &KeyFrame> {
        self.keyframes.iter()
    }

    /// Iterate over all landmarks in insertion order.
    pub fn landmarks(&self) -> impl Iterator<Item = &Landmark> {
        self.landmarks.iter()
    }

    /// All edges in insertion order.
    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    /// All recorded loop closures in detection order.
    pub fn loop_closures(&self) -> &[LoopClosure] {
        &self.loop_closures
    }

    /// Snapshot of keyframe poses in insertion order.
    pub fn keyframe_poses(&self) -> Vec<(KeyFrameId, SE3)> {
        self.keyframes.iter().map(|kf| (kf.id, kf.pose)).collect()
    }

    /// Snapshot of landmark positions in insertion order.
    pub fn landmark_positions(&self) -> Vec<(LandmarkId, Vector3<f64>)> {
        self.landmarks
            .iter()
            .map(|lm| (lm.id, lm.position))
            .collect()
    }

    /// Number of keyframes.
    pub fn num_keyframes(&self) -> usize {
        self.keyframes.len()
    }

    /// Number of landmarks.
    pub fn num_landmarks(&self) -> usize {
        self.landmarks.len()
    }

    /// Number of edges.
    pub fn num_edges(&self) -> usize {
        self.edges.len()
    }

    /// Number of recorded loop closures.
    pub fn num_loop_closures(&self) -> usize {
        self.loop_closures.len()
    }

    /// Keyframes sharing at least `min_shared` landmark observations with
    /// `kf_id`, in no particular order. Unknown ids yield an empty list.
    pub fn get_covisible_keyframes(
        &self,
        kf_id: KeyFrameId,
        min_shared: usize,
    ) -> Vec<KeyFrameId> {
        let kf = match self.get_keyframe(kf_id) {
            Some(kf) => kf,
            None => return vec![],
        };

        let mut shared_counts: HashMap<KeyFrameId, usize> = HashMap::new();
        for lm_id in kf.landmark_observations.keys() {
            if let Some(lm) = self.get_landmark(*lm_id) {
                for (other_id, _) in &lm.observations {
                    if *other_id != kf_id {
                        *shared_counts.entry(*other_id).or_insert(0) += 1;
                    }
                }
            }
        }

        shared_counts
            .into_iter()
            .filter(|(_, count)| *count >= min_shared)
            .map(|(id, _)| id)
            .collect()
    }

    /// Remove everything and reset id counters.
    pub fn clear(&mut self) {
        self.keyframes.clear();
        self.landmarks.clear();
        self.edges.clear();
        self.loop_closures.clear();
    }

    fn check_keyframe(&self, id: KeyFrameId) -> Result<(), GraphError> {
        if (id.0 as usize) < self.keyframes.len() {
            Ok(())
        } else {
            Err(GraphError::UnknownKeyframe(id))
        }
    }
}

impl std::fmt::Debug for PoseGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoseGraph")
            .field("num_keyframes", &self.keyframes.len())
            .field("num_landmarks", &self.landmarks.len())
            .field("num_edges", &self.edges.len())
            .field("num_loop_closures", &self.loop_closures.len())
            .finish()
    }
}

/// Check that a 6x6 covariance is symmetric and positive semi-definite.
pub(crate) fn is_valid_covariance6(m: &Matrix6<f64>) -> bool {
    for i in 0..6 {
        for j in (i + 1)..6 {
            if (m[(i, j)] - m[(j, i)]).abs() > SYMMETRY_TOLERANCE {
                return false;
            }
        }
    }
    // Cholesky of m + εI accepts semi-definite matrices
    (m + Matrix6::identity() * SYMMETRY_TOLERANCE)
        .cholesky()
        .is_some()
}

/// Check that a 3x3 covariance is symmetric and positive semi-definite.
pub(crate) fn is_valid_covariance3(m: &Matrix3<f64>) -> bool {
    for i in 0..3 {
        for j in (i + 1)..3 {
            if (m[(i, j)] - m[(j, i)]).abs() > SYMMETRY_TOLERANCE {
                return false;
            }
        }
    }
    (m + Matrix3::identity() * SYMMETRY_TOLERANCE)
        .cholesky()
        .is_some()
}
