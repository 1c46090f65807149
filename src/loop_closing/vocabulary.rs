//! Bag-of-visual-words vocabulary and histogram scoring.
//!
//! A flat vocabulary: each visual word is one descriptor centroid. A frame's
//! descriptors vote for their nearest word and the vote counts are
//! L2-normalized, so histogram similarity is a plain dot product (cosine).

use std::marker::PhantomData;

use tracing::info;

use crate::map::Descriptor;

use super::metric::DistanceMetric;

/// A dense, L2-normalized word histogram. Length equals the vocabulary size.
pub type BowHistogram = Vec<f64>;

/// A flat bag-of-words vocabulary over descriptor centroids.
///
/// The metric type parameter fixes how descriptors are assigned to words.
pub struct Vocabulary<M: DistanceMetric> {
    words: Vec<Descriptor>,
    _metric: PhantomData<M>,
}

impl<M: DistanceMetric> Vocabulary<M> {
    /// Create a vocabulary from word centroids.
    ///
    /// An empty word list is legal: every histogram degenerates to all zeros
    /// and loop detection silently never fires.
    pub fn new(words: Vec<Descriptor>) -> Self {
        if words.is_empty() {
            info!("vocabulary is empty, loop detection will be inert");
        } else {
            info!(num_words = words.len(), "vocabulary configured");
        }
        Self {
            words,
            _metric: PhantomData,
        }
    }

    /// Number of visual words.
    pub fn len(&self) -> usize {
        self.words.len()
    }

    /// Whether the vocabulary has no words.
    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// Convert a frame's descriptors into a normalized word histogram.
    ///
    /// Each descriptor votes for its nearest word; counts are L2-normalized.
    /// With no words or no descriptors the histogram is all zeros.
    pub fn transform(&self, descriptors: &[Descriptor]) -> BowHistogram {
        let mut histogram = vec![0.0; self.words.len()];
        if self.words.is_empty() {
            return histogram;
        }

        for desc in descriptors {
            let mut best_word = 0;
            let mut best_dist = f64::INFINITY;
            for (word_idx, word) in self.words.iter().enumerate() {
                let dist = M::distance(desc, word);
                if dist < best_dist {
                    best_dist = dist;
                    best_word = word_idx;
                }
            }
            histogram[best_word] += 1.0;
        }

        let norm: f64 = histogram.iter().map(|v| v * v).sum::<f64>().sqrt();
        if norm > 0.0 {
            for v in &mut histogram {
                *v /= norm;
            }
        }

        histogram
    }
}

/// Cosine similarity between two normalized histograms.
///
/// Histograms from the same vocabulary have equal length; a length mismatch
/// scores over the shared prefix.
pub fn similarity(a: &BowHistogram, b: &BowHistogram) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

#[cfg(test)]
mod tests {
    use super::super::metric::{Hamming, L2};
    use super::*;
    use approx::assert_relative_eq;

    fn small_vocab() -> Vocabulary<L2> {
        Vocabulary::new(vec![
            Descriptor::filled(0),
            Descriptor::filled(100),
            Descriptor::filled(200),
        ])
    }

    #[test]
    fn test_histogram_is_normalized() {
        let vocab = small_vocab();
        let hist = vocab.transform(&[
            Descriptor::filled(10),
            Descriptor::filled(90),
            Descriptor::filled(210),
        ]);

        let norm: f64 = hist.iter().map(|v| v * v).sum::<f64>().sqrt();
        assert_relative_eq!(norm, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_identical_frames_score_one() {
        let vocab = small_vocab();
        let descs = vec![Descriptor::filled(5), Descriptor::filled(95)];

        let h1 = vocab.transform(&descs);
        let h2 = vocab.transform(&descs);
        assert_relative_eq!(similarity(&h1, &h2), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_disjoint_words_score_zero() {
        let vocab = small_vocab();
        let h1 = vocab.transform(&[Descriptor::filled(0)]);
        let h2 = vocab.transform(&[Descriptor::filled(200)]);
        assert_relative_eq!(similarity(&h1, &h2), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_empty_vocabulary_gives_zero_histogram() {
        let vocab: Vocabulary<L2> = Vocabulary::new(vec![]);
        let hist = vocab.transform(&[Descriptor::filled(42)]);
        assert!(hist.is_empty());
        assert_eq!(similarity(&hist, &hist), 0.0);
    }

    #[test]
    fn test_no_descriptors_gives_zero_histogram() {
        let vocab = small_vocab();
        let hist = vocab.transform(&[]);
        assert!(hist.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn test_hamming_vocabulary_assignment() {
        let vocab: Vocabulary<Hamming> = Vocabulary::new(vec![
            Descriptor::filled(0b0000_0000),
            Descriptor::filled(0b1111_1111),
        ]);

        let hist = vocab.transform(&[Descriptor::filled(0b0000_0001)]);
        assert_relative_eq!(hist[0], 1.0, epsilon = 1e-12);
        assert_relative_eq!(hist[1], 0.0, epsilon = 1e-12);
    }
}
