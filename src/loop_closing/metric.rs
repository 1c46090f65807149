//! Descriptor distance metrics.
//!
//! The metric is a zero-sized type parameter so the detector and vocabulary
//! can be instantiated for either Euclidean or Hamming matching without
//! dynamic dispatch.

use crate::map::Descriptor;

/// A distance function over fixed-width descriptors.
pub trait DistanceMetric {
    /// Distance between two descriptors. Smaller is more similar.
    fn distance(a: &Descriptor, b: &Descriptor) -> f64;
}

/// Euclidean distance over raw byte values. The default metric.
#[derive(Debug, Clone, Copy, Default)]
pub struct L2;

impl DistanceMetric for L2 {
    fn distance(a: &Descriptor, b: &Descriptor) -> f64 {
        let mut sum_sq = 0.0;
        for (x, y) in a.0.iter().zip(b.0.iter()) {
            let d = *x as f64 - *y as f64;
            sum_sq += d * d;
        }
        sum_sq.sqrt()
    }
}

/// Hamming distance: number of differing bits. Suited to binary descriptors.
#[derive(Debug, Clone, Copy, Default)]
pub struct Hamming;

impl DistanceMetric for Hamming {
    fn distance(a: &Descriptor, b: &Descriptor) -> f64 {
        let mut bits = 0u32;
        for (x, y) in a.0.iter().zip(b.0.iter()) {
            bits += (x ^ y).count_ones();
        }
        bits as f64
    }
}
