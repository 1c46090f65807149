//! SLAM back-end orchestrator.
//!
//! Owns the pose graph, the loop detector, and the optimizer, and wires them
//! together behind a single per-keyframe entry point. Everything runs
//! synchronously on the caller's thread; `add_keyframe` returns only after
//! any triggered loop detection and optimization completed.

use nalgebra::{Matrix3, Matrix6, Vector2, Vector3};
use thiserror::Error;
use tracing::info;

use crate::geometry::SE3;
use crate::loop_closing::{
    DistanceMetric, LoopDetector, LoopDetectorConfig, Vocabulary, L2,
};
use crate::map::{
    is_valid_covariance3, is_valid_covariance6, Descriptor, GraphError, KeyFrameId, Keypoint,
    LoopClosure, PoseGraph,
};
use crate::optimizer::{OptimizerConfig, PoseGraphOptimizer};

/// Errors surfaced by the back-end. All of them originate from structurally
/// invalid input; expected negative outcomes (no loop found, optimization
/// not converged) are reported in `FrameResult` instead.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The pose graph rejected the input.
    #[error(transparent)]
    Graph(#[from] GraphError),
}

/// Back-end configuration.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    /// Whether loop detection runs at all.
    pub loop_detection_enabled: bool,

    /// Optimize after this many keyframes since the last optimization.
    pub optimization_frequency: usize,

    /// Visual word centroids for the BoW vocabulary.
    pub vocabulary: Vec<Descriptor>,

    /// Loop detection settings.
    pub detector: LoopDetectorConfig,

    /// Optimizer settings.
    pub optimizer: OptimizerConfig,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            loop_detection_enabled: true,
            optimization_frequency: 10,
            vocabulary: Vec::new(),
            detector: LoopDetectorConfig::default(),
            optimizer: OptimizerConfig::default(),
        }
    }
}

/// One landmark supplied alongside a keyframe.
#[derive(Debug, Clone)]
pub struct LandmarkInput {
    /// Position in world frame.
    pub position: Vector3<f64>,

    /// 3x3 position covariance.
    pub covariance: Matrix3<f64>,

    /// Representative descriptor, if any.
    pub descriptor: Option<Descriptor>,

    /// Pixel location of the observation in this keyframe, if known.
    /// A zero placeholder is stored when absent.
    pub pixel: Option<Vector2<f64>>,
}

/// Front-end payload for one keyframe.
#[derive(Debug, Clone)]
pub struct KeyframeInput {
    /// Timestamp in seconds.
    pub timestamp: f64,

    /// Estimated camera-to-world pose.
    pub pose: SE3,

    /// 6x6 pose covariance.
    pub pose_covariance: Matrix6<f64>,

    /// Detected keypoints.
    pub keypoints: Vec<Keypoint>,

    /// Feature descriptors, parallel to `keypoints`.
    pub descriptors: Vec<Descriptor>,

    /// Triangulated 3D points in camera frame, parallel to `keypoints`.
    pub points_cam: Vec<Option<Vector3<f64>>>,

    /// New landmarks observed in this keyframe.
    pub landmarks: Vec<LandmarkInput>,
}

impl Default for KeyframeInput {
    fn default() -> Self {
        Self {
            timestamp: 0.0,
            pose: SE3::identity(),
            pose_covariance: Matrix6::identity(),
            keypoints: Vec::new(),
            descriptors: Vec::new(),
            points_cam: Vec::new(),
            landmarks: Vec::new(),
        }
    }
}

impl Default for LandmarkInput {
    fn default() -> Self {
        Self {
            position: Vector3::zeros(),
            covariance: Matrix3::identity(),
            descriptor: None,
            pixel: None,
        }
    }
}

/// Outcome of processing one keyframe.
#[derive(Debug, Clone)]
pub struct FrameResult {
    /// Id assigned to the new keyframe.
    pub keyframe_id: KeyFrameId,

    /// Whether a loop closure was detected, verified, and recorded.
    pub loop_closure_detected: bool,

    /// Whether optimization ran for this frame.
    pub optimized: bool,
}

/// Aggregate counters for monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendStatistics {
    pub num_keyframes: usize,
    pub num_landmarks: usize,
    pub num_edges: usize,
    pub num_loop_closures: usize,
    pub frames_processed: usize,
}

/// The synchronous SLAM back-end.
pub struct SlamBackend<M: DistanceMetric = L2> {
    config: BackendConfig,
    graph: PoseGraph,
    detector: LoopDetector<M>,
    optimizer: PoseGraphOptimizer,
    frame_count: usize,
    last_optimization_frame: usize,
    prev_keyframe: Option<(KeyFrameId, SE3)>,
}

impl<M: DistanceMetric> SlamBackend<M> {
    /// Create a back-end with the given configuration.
    pub fn new(config: BackendConfig) -> Self {
        let vocabulary = Vocabulary::new(config.vocabulary.clone());
        let detector = LoopDetector::new(config.detector.clone(), vocabulary);
        let optimizer = PoseGraphOptimizer::new(config.optimizer.clone());
        Self {
            config,
            graph: PoseGraph::new(),
            detector,
            optimizer,
            frame_count: 0,
            last_optimization_frame: 0,
            prev_keyframe: None,
        }
    }

    /// Process one keyframe: insert it and its landmarks, chain it to the
    /// previous keyframe by an odometry edge, run loop detection, and
    /// optimize if the cadence is due.
    pub fn add_keyframe(&mut self, input: KeyframeInput) -> Result<FrameResult, BackendError> {
        let KeyframeInput {
            timestamp,
            pose,
            pose_covariance,
            keypoints,
            descriptors,
            points_cam,
            landmarks,
        } = input;

        // Validate every covariance before the first mutation so a rejected
        // input leaves the graph exactly as it was
        if !is_valid_covariance6(&pose_covariance)
            || landmarks.iter().any(|lm| !is_valid_covariance3(&lm.covariance))
        {
            return Err(BackendError::Graph(GraphError::InvalidCovariance));
        }

        let keyframe_id = self.graph.add_keyframe(
            timestamp,
            pose,
            pose_covariance,
            keypoints,
            descriptors.clone(),
            points_cam.clone(),
        )?;

        for lm in landmarks {
            let lm_id = self
                .graph
                .add_landmark(lm.position, lm.covariance, lm.descriptor)?;
            let pixel = lm.pixel.unwrap_or_else(Vector2::zeros);
            self.graph.add_observation(keyframe_id, lm_id, pixel);
        }

        // Odometry edge: measured relative motion between consecutive input
        // poses, weighted by the identity information matrix
        if let Some((prev_id, prev_pose)) = self.prev_keyframe {
            let relative = prev_pose.inverse().compose(&pose);
            self.graph
                .add_edge(prev_id, keyframe_id, relative, Matrix6::identity())?;
        }
        self.prev_keyframe = Some((keyframe_id, pose));

        let loop_closure_detected = if self.config.loop_detection_enabled {
            self.detector
                .add_keyframe(keyframe_id, descriptors, points_cam);
            self.try_close_loop(keyframe_id)?
        } else {
            false
        };

        self.frame_count += 1;

        let optimized = if self.frame_count - self.last_optimization_frame
            >= self.config.optimization_frequency
        {
            self.last_optimization_frame = self.frame_count;
            let result = self.optimizer.optimize(&mut self.graph);
            result.poses_updated > 0
        } else {
            false
        };

        Ok(FrameResult {
            keyframe_id,
            loop_closure_detected,
            optimized,
        })
    }

    /// Detect and verify a loop for the given query; record it on success.
    fn try_close_loop(&mut self, query_id: KeyFrameId) -> Result<bool, BackendError> {
        let candidate = match self.detector.detect_loop_closure(query_id) {
            Some(c) => c,
            None => return Ok(false),
        };

        let verified = match self
            .detector
            .verify_loop_closure(candidate.query_id, candidate.match_id)
        {
            Some(v) => v,
            None => return Ok(false),
        };

        info!(
            query = %candidate.query_id,
            matched = %candidate.match_id,
            similarity = candidate.similarity,
            num_matches = verified.matches.len(),
            "loop closure accepted"
        );

        self.graph.add_loop_closure(
            candidate.query_id,
            candidate.match_id,
            verified.relative_pose,
            candidate.similarity,
            verified.matches,
        )?;
        Ok(true)
    }

    /// Keyframe poses in insertion order.
    pub fn current_trajectory(&self) -> Vec<SE3> {
        self.graph.keyframes().map(|kf| kf.pose).collect()
    }

    /// Landmark positions in insertion order.
    pub fn map_landmarks(&self) -> Vec<Vector3<f64>> {
        self.graph.landmarks().map(|lm| lm.position).collect()
    }

    /// All recorded loop closures.
    pub fn loop_closures(&self) -> &[LoopClosure] {
        self.graph.loop_closures()
    }

    /// Number of keyframes processed so far.
    pub fn frame_count(&self) -> usize {
        self.frame_count
    }

    /// Direct read access to the pose graph.
    pub fn graph(&self) -> &PoseGraph {
        &self.graph
    }

    /// Aggregate counters.
    pub fn statistics(&self) -> BackendStatistics {
        BackendStatistics {
            num_keyframes: self.graph.num_keyframes(),
            num_landmarks: self.graph.num_landmarks(),
            num_edges: self.graph.num_edges(),
            num_loop_closures: self.graph.num_loop_closures(),
            frames_processed: self.frame_count,
        }
    }

    /// Drop all state and start over.
    pub fn reset(&mut self) {
        self.graph.clear();
        self.detector.clear();
        self.frame_count = 0;
        self.last_optimization_frame = 0;
        self.prev_keyframe = None;
    }
}
