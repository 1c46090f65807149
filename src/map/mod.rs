//! Map data structures: keyframes, landmarks, and the pose graph store.

pub mod keyframe;
pub mod landmark;
pub mod pose_graph;
pub mod types;

pub use keyframe::KeyFrame;
pub use landmark::Landmark;
pub use pose_graph::{Edge, GraphError, LoopClosure, PoseGraph};
pub(crate) use pose_graph::{is_valid_covariance3, is_valid_covariance6};
pub use types::{Descriptor, KeyFrameId, Keypoint, LandmarkId, DESCRIPTOR_LEN};
