pub mod backend;
pub mod geometry;
pub mod loop_closing;
pub mod map;
pub mod optimizer;

pub use backend::{
    BackendConfig, BackendError, BackendStatistics, FrameResult, KeyframeInput, LandmarkInput,
    SlamBackend,
};
pub use geometry::SE3;
pub use loop_closing::{LoopDetector, LoopDetectorConfig};
pub use map::{Descriptor, KeyFrameId, Keypoint, LandmarkId, PoseGraph};
pub use optimizer::{OptimizationResult, OptimizerConfig, PoseGraphOptimizer};
