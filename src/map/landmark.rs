//! Landmark - a 3D map point observed from one or more KeyFrames.

use nalgebra::{Matrix3, Vector2, Vector3};

use super::types::{Descriptor, KeyFrameId, LandmarkId};

/// A 3D landmark in world coordinates.
#[derive(Debug, Clone)]
pub struct Landmark {
    /// Unique identifier for this landmark.
    pub id: LandmarkId,

    /// Position in world frame.
    pub position: Vector3<f64>,

    /// 3x3 position covariance. Symmetric PSD, validated at insertion.
    pub covariance: Matrix3<f64>,

    /// Representative descriptor for appearance matching, if any.
    pub descriptor: Option<Descriptor>,

    /// Observations in first-observation order, one per keyframe:
    /// (observing keyframe, pixel location).
    pub observations: Vec<(KeyFrameId, Vector2<f64>)>,

    /// KeyFrame that first observed this landmark.
    pub first_observed_frame: Option<KeyFrameId>,

    /// KeyFrame that most recently observed this landmark.
    pub last_observed_frame: Option<KeyFrameId>,
}

impl Landmark {
    /// Create a new landmark with no observations.
    pub fn new(
        id: LandmarkId,
        position: Vector3<f64>,
        covariance: Matrix3<f64>,
        descriptor: Option<Descriptor>,
    ) -> Self {
        Self {
            id,
            position,
            covariance,
            descriptor,
            observations: Vec::new(),
            first_observed_frame: None,
            last_observed_frame: None,
        }
    }

    /// Record an observation from a keyframe.
    ///
    /// Re-observation from the same keyframe replaces the stored pixel,
    /// mirroring the keyframe-side map.
    pub fn add_observation(&mut self, kf_id: KeyFrameId, pixel: Vector2<f64>) {
        if self.first_observed_frame.is_none() {
            self.first_observed_frame = Some(kf_id);
        }
        self.last_observed_frame = Some(kf_id);

        if let Some(entry) = self.observations.iter_mut().find(|(id, _)| *id == kf_id) {
            entry.1 = pixel;
        } else {
            self.observations.push((kf_id, pixel));
        }
    }

    /// Number of recorded observations.
    pub fn num_observations(&self) -> usize {
        self.observations.len()
    }
}
