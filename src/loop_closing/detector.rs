//! Loop detection using Bag-of-Words with temporal consistency checking.
//!
//! Two stages: appearance detection (BoW similarity scan with a recency
//! exclusion and a temporal consistency gate) and geometric verification
//! (descriptor matching followed by rigid RANSAC pose estimation). Every
//! failure path is a silent negative; only genuinely malformed input would
//! be an error, and the detector accepts none.

use std::collections::HashMap;

use nalgebra::Vector3;
use tracing::debug;

use crate::map::{Descriptor, KeyFrameId};

use super::metric::{DistanceMetric, L2};
use super::rigid_solver::{estimate_rigid_ransac, RigidSolverConfig};
use super::vocabulary::{similarity, BowHistogram, Vocabulary};
use crate::geometry::SE3;

/// Configuration for loop detection and verification.
#[derive(Debug, Clone)]
pub struct LoopDetectorConfig {
    /// Minimum BoW similarity for a candidate to be considered.
    /// Candidates must score strictly above this value.
    pub similarity_threshold: f64,

    /// Keyframes within this id distance of the query are never candidates.
    pub exclude_recent_frames: u64,

    /// Number of preceding query frames consulted by the consistency gate.
    pub temporal_consistency_window: usize,

    /// Minimum number of descriptor matches required before pose estimation.
    pub min_feature_matches: usize,

    /// Maximum descriptor distance for a nearest-neighbor match to count.
    pub match_distance_threshold: f64,

    /// RANSAC settings for rigid pose estimation.
    pub solver: RigidSolverConfig,
}

impl Default for LoopDetectorConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.75,
            exclude_recent_frames: 30,
            temporal_consistency_window: 3,
            min_feature_matches: 20,
            match_distance_threshold: 64.0,
            solver: RigidSolverConfig::default(),
        }
    }
}

/// A loop candidate that passed appearance detection.
#[derive(Debug, Clone)]
pub struct LoopCandidate {
    /// The recent keyframe that detected the loop.
    pub query_id: KeyFrameId,

    /// The older keyframe it matched against.
    pub match_id: KeyFrameId,

    /// BoW similarity between the two frames, in (threshold, 1].
    pub similarity: f64,
}

/// A loop that passed geometric verification.
#[derive(Debug, Clone)]
pub struct VerifiedLoop {
    /// Estimated relative pose: match-frame camera from query-frame camera.
    pub relative_pose: SE3,

    /// Matched feature index pairs (query feature, match feature) that
    /// survived RANSAC.
    pub matches: Vec<(usize, usize)>,

    /// Mean squared alignment error of the inliers.
    pub mse: f64,
}

/// Per-keyframe state retained for detection.
struct FrameEntry {
    id: KeyFrameId,
    descriptors: Vec<Descriptor>,
    points_cam: Vec<Option<Vector3<f64>>>,
    histogram: BowHistogram,
}

/// Appearance-based loop detector over an insertion-ordered frame index.
pub struct LoopDetector<M: DistanceMetric = L2> {
    config: LoopDetectorConfig,
    vocabulary: Vocabulary<M>,
    frames: Vec<FrameEntry>,
    index_of: HashMap<KeyFrameId, usize>,
}

impl<M: DistanceMetric> LoopDetector<M> {
    /// Create a detector with the given vocabulary.
    pub fn new(config: LoopDetectorConfig, vocabulary: Vocabulary<M>) -> Self {
        Self {
            config,
            vocabulary,
            frames: Vec::new(),
            index_of: HashMap::new(),
        }
    }

    /// Index a new keyframe for future loop queries.
    pub fn add_keyframe(
        &mut self,
        id: KeyFrameId,
        descriptors: Vec<Descriptor>,
        points_cam: Vec<Option<Vector3<f64>>>,
    ) {
        let histogram = self.vocabulary.transform(&descriptors);
        self.index_of.insert(id, self.frames.len());
        self.frames.push(FrameEntry {
            id,
            descriptors,
            points_cam,
            histogram,
        });
    }

    /// Number of indexed keyframes.
    pub fn num_keyframes(&self) -> usize {
        self.frames.len()
    }

    /// Forget all indexed keyframes.
    pub fn clear(&mut self) {
        self.frames.clear();
        self.index_of.clear();
    }

    /// Search for a loop candidate for the given query keyframe.
    ///
    /// Scans all indexed keyframes in insertion order, excluding those within
    /// `exclude_recent_frames` ids of the query, and keeps the best strictly
    /// above the similarity threshold. The best candidate must then pass the
    /// temporal consistency gate. Returns `None` on any failure.
    pub fn detect_loop_closure(&self, query_id: KeyFrameId) -> Option<LoopCandidate> {
        let query_idx = *self.index_of.get(&query_id)?;
        let query = &self.frames[query_idx];

        let mut best: Option<(usize, f64)> = None;
        for (idx, frame) in self.frames.iter().enumerate() {
            if id_gap(query_id, frame.id) <= self.config.exclude_recent_frames {
                continue;
            }

            let score = similarity(&query.histogram, &frame.histogram);
            if score <= self.config.similarity_threshold {
                continue;
            }

            // Strict comparison: on ties the earliest candidate wins
            match best {
                Some((_, best_score)) if score <= best_score => {}
                _ => best = Some((idx, score)),
            }
        }

        let (candidate_idx, score) = best?;
        let candidate_id = self.frames[candidate_idx].id;

        if !self.is_temporally_consistent(query_idx, candidate_id) {
            debug!(%query_id, %candidate_id, score, "loop candidate failed temporal consistency");
            return None;
        }

        Some(LoopCandidate {
            query_id,
            match_id: candidate_id,
            similarity: score,
        })
    }

    /// Temporal consistency gate.
    ///
    /// At least half (rounded up) of the `W` query frames preceding this one
    /// must themselves resemble the candidate region: some keyframe within
    /// ±2 ids of the candidate scoring above 0.8 × threshold.
    fn is_temporally_consistent(&self, query_idx: usize, candidate_id: KeyFrameId) -> bool {
        let window = self.config.temporal_consistency_window;
        if window == 0 {
            return true;
        }
        let required = window.div_ceil(2);
        let relaxed_threshold = 0.8 * self.config.similarity_threshold;

        let start = query_idx.saturating_sub(window);
        let mut votes = 0;

        for prev in &self.frames[start..query_idx] {
            let supported = self
                .frames
                .iter()
                .filter(|f| id_gap(f.id, candidate_id) <= 2)
                .any(|f| similarity(&prev.histogram, &f.histogram) > relaxed_threshold);
            if supported {
                votes += 1;
            }
        }

        votes >= required
    }

    /// Geometrically verify a loop candidate.
    ///
    /// Matches query descriptors to their nearest neighbor in the match frame
    /// (distance below `match_distance_threshold`), requires
    /// `min_feature_matches` matches, then estimates the relative pose from
    /// the matched 3D points via rigid RANSAC. Returns `None` on any failure.
    pub fn verify_loop_closure(
        &self,
        query_id: KeyFrameId,
        match_id: KeyFrameId,
    ) -> Option<VerifiedLoop> {
        let query = &self.frames[*self.index_of.get(&query_id)?];
        let matched = &self.frames[*self.index_of.get(&match_id)?];

        let pairs = match_descriptors::<M>(
            &query.descriptors,
            &matched.descriptors,
            self.config.match_distance_threshold,
        );
        if pairs.len() < self.config.min_feature_matches {
            debug!(
                %query_id,
                %match_id,
                num_matches = pairs.len(),
                "not enough feature matches for verification"
            );
            return None;
        }

        // Keep only pairs with 3D support in both frames
        let mut query_points = Vec::new();
        let mut match_points = Vec::new();
        let mut point_pairs = Vec::new();
        for &(qi, mi) in &pairs {
            if let (Some(Some(pq)), Some(Some(pm))) =
                (query.points_cam.get(qi), matched.points_cam.get(mi))
            {
                query_points.push(*pq);
                match_points.push(*pm);
                point_pairs.push((qi, mi));
            }
        }

        // p_match_cam = T * p_query_cam
        let result = estimate_rigid_ransac(&query_points, &match_points, &self.config.solver)?;

        let inlier_matches: Vec<(usize, usize)> =
            result.inliers.iter().map(|&i| point_pairs[i]).collect();

        Some(VerifiedLoop {
            relative_pose: result.transform,
            matches: inlier_matches,
            mse: result.mse,
        })
    }
}

/// Absolute id distance between two keyframes.
fn id_gap(a: KeyFrameId, b: KeyFrameId) -> u64 {
    a.0.abs_diff(b.0)
}

/// Nearest-neighbor descriptor matching with a distance cutoff.
fn match_descriptors<M: DistanceMetric>(
    query: &[Descriptor],
    target: &[Descriptor],
    max_distance: f64,
) -> Vec<(usize, usize)> {
    let mut pairs = Vec::new();

    for (qi, qd) in query.iter().enumerate() {
        let mut best: Option<(usize, f64)> = None;
        for (ti, td) in target.iter().enumerate() {
            let dist = M::distance(qd, td);
            if dist < max_distance {
                match best {
                    Some((_, best_dist)) if dist >= best_dist => {}
                    _ => best = Some((ti, dist)),
                }
            }
        }
        if let Some((ti, _)) = best {
            pairs.push((qi, ti));
        }
    }

    pairs
}

#[cfg(test)]
mod tests {
    use super::super::metric::Hamming;
    use super::*;

    fn test_vocab() -> Vocabulary<L2> {
        Vocabulary::new(vec![
            Descriptor::filled(0),
            Descriptor::filled(64),
            Descriptor::filled(128),
            Descriptor::filled(192),
        ])
    }

    fn detector_with(config: LoopDetectorConfig) -> LoopDetector<L2> {
        LoopDetector::new(config, test_vocab())
    }

    /// Index a run of frames sharing one appearance signature.
    fn add_frames(det: &mut LoopDetector<L2>, ids: std::ops::Range<u64>, fill: u8) {
        for i in ids {
            det.add_keyframe(
                KeyFrameId::new(i),
                vec![Descriptor::filled(fill), Descriptor::filled(fill)],
                vec![],
            );
        }
    }

    #[test]
    fn test_no_candidate_within_exclusion_window() {
        let config = LoopDetectorConfig {
            exclude_recent_frames: 10,
            temporal_consistency_window: 0,
            ..Default::default()
        };
        let mut det = detector_with(config);

        // All frames identical in appearance, but all within the window
        add_frames(&mut det, 0..10, 5);

        assert!(det.detect_loop_closure(KeyFrameId::new(9)).is_none());
    }

    #[test]
    fn test_no_candidate_below_threshold() {
        let config = LoopDetectorConfig {
            exclude_recent_frames: 2,
            temporal_consistency_window: 0,
            ..Default::default()
        };
        let mut det = detector_with(config);

        // Every older frame maps to words disjoint from the query's
        add_frames(&mut det, 0..5, 0);
        add_frames(&mut det, 5..6, 130);

        assert!(det.detect_loop_closure(KeyFrameId::new(5)).is_none());
    }

    #[test]
    fn test_detects_revisit_outside_window() {
        let config = LoopDetectorConfig {
            exclude_recent_frames: 3,
            temporal_consistency_window: 0,
            ..Default::default()
        };
        let mut det = detector_with(config);

        add_frames(&mut det, 0..1, 5); // the old place
        add_frames(&mut det, 1..8, 130); // elsewhere
        add_frames(&mut det, 8..9, 5); // revisit

        let candidate = det.detect_loop_closure(KeyFrameId::new(8)).unwrap();
        assert_eq!(candidate.match_id, KeyFrameId::new(0));
        assert!(candidate.similarity > det.config.similarity_threshold);
        assert!(candidate.similarity <= 1.0 + 1e-12);
    }

    #[test]
    fn test_temporal_gate_rejects_isolated_match() {
        let config = LoopDetectorConfig {
            exclude_recent_frames: 3,
            temporal_consistency_window: 3,
            ..Default::default()
        };
        let mut det = detector_with(config);

        add_frames(&mut det, 0..1, 5);
        // Neighbors of the candidate and the approach frames share no words
        add_frames(&mut det, 1..3, 255);
        add_frames(&mut det, 3..8, 130);
        add_frames(&mut det, 8..9, 5);

        assert!(det.detect_loop_closure(KeyFrameId::new(8)).is_none());
    }

    #[test]
    fn test_temporal_gate_accepts_sustained_match() {
        let config = LoopDetectorConfig {
            exclude_recent_frames: 3,
            temporal_consistency_window: 3,
            ..Default::default()
        };
        let mut det = detector_with(config);

        add_frames(&mut det, 0..1, 5);
        add_frames(&mut det, 1..6, 130);
        // The approach to the revisit already resembles the old place
        add_frames(&mut det, 6..9, 5);

        let candidate = det.detect_loop_closure(KeyFrameId::new(8)).unwrap();
        assert_eq!(candidate.match_id, KeyFrameId::new(0));
    }

    #[test]
    fn test_verification_requires_min_matches() {
        let config = LoopDetectorConfig {
            exclude_recent_frames: 0,
            min_feature_matches: 5,
            ..Default::default()
        };
        let mut det = detector_with(config);

        det.add_keyframe(KeyFrameId::new(0), vec![Descriptor::filled(5)], vec![None]);
        det.add_keyframe(KeyFrameId::new(1), vec![Descriptor::filled(5)], vec![None]);

        assert!(det
            .verify_loop_closure(KeyFrameId::new(1), KeyFrameId::new(0))
            .is_none());
    }

    #[test]
    fn test_verification_recovers_relative_pose() {
        let n = 30;
        let config = LoopDetectorConfig {
            exclude_recent_frames: 0,
            min_feature_matches: 10,
            solver: RigidSolverConfig {
                min_inliers: 10,
                ..Default::default()
            },
            ..Default::default()
        };
        let mut det = detector_with(config);

        // Unique descriptor per feature so matching is unambiguous
        let descriptors: Vec<Descriptor> = (0..n).map(|i| Descriptor::filled(i as u8 * 8)).collect();

        // The same physical points seen from two camera positions offset by 1m in x:
        // p_match = p_query + (1, 0, 0)
        let offset = Vector3::new(1.0, 0.0, 0.0);
        let query_points: Vec<Option<Vector3<f64>>> = (0..n)
            .map(|i| {
                Some(Vector3::new(
                    (i % 5) as f64,
                    (i / 5) as f64,
                    3.0 + (i % 3) as f64,
                ))
            })
            .collect();
        let match_points: Vec<Option<Vector3<f64>>> =
            query_points.iter().map(|p| p.map(|p| p + offset)).collect();

        det.add_keyframe(KeyFrameId::new(0), descriptors.clone(), match_points);
        det.add_keyframe(KeyFrameId::new(1), descriptors, query_points);

        let verified = det
            .verify_loop_closure(KeyFrameId::new(1), KeyFrameId::new(0))
            .unwrap();

        assert!(verified.matches.len() >= 25);
        assert!((verified.relative_pose.translation - offset).norm() < 1e-6);
        assert!(verified.relative_pose.rotation.angle() < 1e-6);
    }

    #[test]
    fn test_hamming_metric_detector() {
        let vocab: Vocabulary<Hamming> = Vocabulary::new(vec![
            Descriptor::filled(0b0000_0000),
            Descriptor::filled(0b1111_1111),
        ]);
        let config = LoopDetectorConfig {
            exclude_recent_frames: 1,
            temporal_consistency_window: 0,
            ..Default::default()
        };
        let mut det: LoopDetector<Hamming> = LoopDetector::new(config, vocab);

        det.add_keyframe(KeyFrameId::new(0), vec![Descriptor::filled(0b0000_0001)], vec![]);
        det.add_keyframe(KeyFrameId::new(1), vec![Descriptor::filled(0b1111_1110)], vec![]);
        det.add_keyframe(KeyFrameId::new(2), vec![Descriptor::filled(0b0000_0011)], vec![]);

        let candidate = det.detect_loop_closure(KeyFrameId::new(2)).unwrap();
        assert_eq!(candidate.match_id, KeyFrameId::new(0));
    }
}
