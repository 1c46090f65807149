//! KeyFrame - a selected frame that becomes a node of the pose graph.
//!
//! KeyFrames carry the front-end payload (keypoints, descriptors, triangulated
//! 3D points), a pose estimate with uncertainty, and their graph relationships
//! (landmark observations and edge connectivity).

use std::collections::{HashMap, HashSet};

use nalgebra::{Matrix6, Vector2, Vector3};

use crate::geometry::SE3;

use super::types::{Descriptor, KeyFrameId, Keypoint, LandmarkId};

/// A KeyFrame in the pose graph.
#[derive(Clone)]
pub struct KeyFrame {
    /// Unique identifier for this KeyFrame.
    pub id: KeyFrameId,

    /// Timestamp in seconds.
    pub timestamp: f64,

    /// Pose: transform from camera to world (T_wc).
    /// To transform a point from camera to world: p_world = pose.transform_point(p_cam)
    pub pose: SE3,

    /// 6x6 pose covariance (translation then rotation). Symmetric PSD,
    /// validated at insertion.
    pub pose_covariance: Matrix6<f64>,

    // ─────────────────────────────────────────────────────────────────────────
    // Visual Features
    // ─────────────────────────────────────────────────────────────────────────
    /// Detected keypoints.
    pub keypoints: Vec<Keypoint>,

    /// Binary descriptors for each keypoint.
    pub descriptors: Vec<Descriptor>,

    /// 3D points in camera frame (from stereo/depth triangulation).
    /// None if the point couldn't be triangulated.
    pub points_cam: Vec<Option<Vector3<f64>>>,

    // ─────────────────────────────────────────────────────────────────────────
    // Graph Relationships
    // ─────────────────────────────────────────────────────────────────────────
    /// Landmark → observed pixel location in this frame.
    pub landmark_observations: HashMap<LandmarkId, Vector2<f64>>,

    /// KeyFrames connected to this one by at least one edge.
    /// Kept symmetric with the other endpoint.
    pub connected_keyframes: HashSet<KeyFrameId>,
}

impl KeyFrame {
    /// Create a new KeyFrame with no observations or connections.
    pub fn new(
        id: KeyFrameId,
        timestamp: f64,
        pose: SE3,
        pose_covariance: Matrix6<f64>,
        keypoints: Vec<Keypoint>,
        descriptors: Vec<Descriptor>,
        points_cam: Vec<Option<Vector3<f64>>>,
    ) -> Self {
        Self {
            id,
            timestamp,
            pose,
            pose_covariance,
            keypoints,
            descriptors,
            points_cam,
            landmark_observations: HashMap::new(),
            connected_keyframes: HashSet::new(),
        }
    }

    /// Get the camera position in world frame.
    pub fn camera_center(&self) -> Vector3<f64> {
        self.pose.translation
    }

    /// Record an observation of a landmark at the given pixel.
    pub fn add_observation(&mut self, lm_id: LandmarkId, pixel: Vector2<f64>) {
        self.landmark_observations.insert(lm_id, pixel);
    }

    /// Number of detected features.
    pub fn num_features(&self) -> usize {
        self.keypoints.len()
    }
}

impl std::fmt::Debug for KeyFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyFrame")
            .field("id", &self.id)
            .field("timestamp", &self.timestamp)
            .field("num_features", &self.num_features())
            .field("num_observations", &self.landmark_observations.len())
            .field("num_connections", &self.connected_keyframes.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_keyframe(id: u64) -> KeyFrame {
        KeyFrame::new(
            KeyFrameId::new(id),
            id as f64 * 0.1,
            SE3::identity(),
            Matrix6::identity(),
            vec![],
            vec![],
            vec![],
        )
    }

    #[test]
    fn test_observation_insert_and_overwrite() {
        let mut kf = create_test_keyframe(1);

        kf.add_observation(LandmarkId::new(7), Vector2::new(10.0, 20.0));
        assert_eq!(kf.landmark_observations.len(), 1);

        // Re-observing the same landmark replaces the pixel
        kf.add_observation(LandmarkId::new(7), Vector2::new(11.0, 21.0));
        assert_eq!(kf.landmark_observations.len(), 1);
        assert_eq!(
            kf.landmark_observations[&LandmarkId::new(7)],
            Vector2::new(11.0, 21.0)
        );
    }

    #[test]
    fn test_debug_format_is_compact() {
        let kf = create_test_keyframe(3);
        let s = format!("{:?}", kf);
        assert!(s.contains("KeyFrameId(3)"));
    }
}
