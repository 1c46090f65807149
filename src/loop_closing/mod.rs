//! Loop closing: appearance-based detection and geometric verification.
//!
//! The pipeline has two stages:
//! 1. **Detection** (`detector.rs`): BoW similarity scan with a recency
//!    exclusion and a temporal consistency gate over recent query frames.
//! 2. **Verification** (`rigid_solver.rs`): descriptor matching followed by
//!    rigid SE(3) RANSAC over the matched 3D points.
//!
//! Both stages run synchronously on the caller's thread and report failure
//! as `None`; a missed loop is an expected outcome, not an error.

pub mod detector;
pub mod metric;
pub mod rigid_solver;
pub mod vocabulary;

pub use detector::{LoopCandidate, LoopDetector, LoopDetectorConfig, VerifiedLoop};
pub use metric::{DistanceMetric, Hamming, L2};
pub use rigid_solver::{estimate_rigid_ransac, RigidResult, RigidSolverConfig};
pub use vocabulary::{similarity, BowHistogram, Vocabulary};
