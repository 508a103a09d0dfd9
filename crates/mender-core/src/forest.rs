//! Batch-trained isolation forest.
//!
//! Anomalies are isolated in fewer random splits than normal points. Each
//! tree partitions a subsample with uniform random cuts; the score maps the
//! average path length into [0, 1], where higher means easier to isolate.
//!
//! Training is seeded so identical batches produce identical models.

use crate::features::FeatureVector;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

pub const NUM_TREES: usize = 100;
pub const MAX_SUBSAMPLE: usize = 256;
/// Expected anomaly share in a training batch; sets the decision threshold
/// at the (1 - contamination) quantile of training scores.
pub const CONTAMINATION: f64 = 0.1;
pub const TRAIN_SEED: u64 = 42;

const EULER_MASCHERONI: f64 = 0.577_215_664_901_532_9;

#[derive(Debug, Clone, Serialize, Deserialize)]
enum IsoNode {
    Split {
        dim: usize,
        cut: f64,
        left: Box<IsoNode>,
        right: Box<IsoNode>,
    },
    /// Unsplit remainder: single point, exhausted height, or no spread left
    /// to cut.
    Tail { size: usize },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IsolationForest {
    trees: Vec<IsoNode>,
    subsample: usize,
    threshold: f64,
}

impl IsolationForest {
    /// Fit with the standard seed. The caller scales features first; the
    /// forest itself is scale-agnostic but the persisted pairing matters.
    pub fn fit(samples: &[FeatureVector]) -> Self {
        Self::fit_seeded(samples, TRAIN_SEED)
    }

    pub fn fit_seeded(samples: &[FeatureVector], seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let subsample = samples.len().min(MAX_SUBSAMPLE).max(1);
        let height_limit = (subsample.max(2) as f64).log2().ceil() as usize;

        let trees = (0..NUM_TREES)
            .map(|_| {
                let chosen = draw_subsample(samples, subsample, &mut rng);
                build_node(&chosen, 0, height_limit, &mut rng)
            })
            .collect();

        let mut forest = Self {
            trees,
            subsample,
            threshold: 0.0,
        };

        // Nearest-rank (1 - contamination) quantile of the training scores.
        let mut scores: Vec<f64> = samples.iter().map(|s| forest.score(s)).collect();
        scores.sort_by(f64::total_cmp);
        let rank = (((1.0 - CONTAMINATION) * scores.len() as f64).ceil() as usize)
            .clamp(1, scores.len());
        forest.threshold = scores[rank - 1];

        forest
    }

    /// Anomaly score in [0, 1]; higher isolates faster.
    pub fn score(&self, point: &FeatureVector) -> f64 {
        let expected = average_path_length(self.subsample);
        if expected <= 0.0 {
            return 0.5;
        }
        let total: f64 = self
            .trees
            .iter()
            .map(|tree| path_length(tree, point, 0))
            .sum();
        let mean = total / self.trees.len() as f64;
        2.0_f64.powf(-mean / expected).clamp(0.0, 1.0)
    }

    /// Strictly above the training quantile. Strict comparison keeps a
    /// degenerate batch, where every score equals the threshold, from
    /// flagging everything.
    pub fn is_anomalous(&self, score: f64) -> bool {
        score > self.threshold
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn num_trees(&self) -> usize {
        self.trees.len()
    }
}

fn draw_subsample(samples: &[FeatureVector], count: usize, rng: &mut StdRng) -> Vec<FeatureVector> {
    if count >= samples.len() {
        return samples.to_vec();
    }
    rand::seq::index::sample(rng, samples.len(), count)
        .iter()
        .map(|i| samples[i])
        .collect()
}

fn build_node(points: &[FeatureVector], depth: usize, limit: usize, rng: &mut StdRng) -> IsoNode {
    if points.len() <= 1 || depth >= limit {
        return IsoNode::Tail { size: points.len() };
    }

    // Only dimensions with spread can be cut.
    let mut cuttable: Vec<(usize, f64, f64)> = Vec::new();
    for dim in 0..points[0].len() {
        let (lo, hi) = dim_range(points, dim);
        if lo < hi {
            cuttable.push((dim, lo, hi));
        }
    }
    if cuttable.is_empty() {
        return IsoNode::Tail { size: points.len() };
    }

    let (dim, lo, hi) = cuttable[rng.random_range(0..cuttable.len())];
    let cut = lo + rng.random::<f64>() * (hi - lo);

    let (left_points, right_points): (Vec<FeatureVector>, Vec<FeatureVector>) =
        points.iter().copied().partition(|p| p[dim] < cut);
    if left_points.is_empty() || right_points.is_empty() {
        return IsoNode::Tail { size: points.len() };
    }

    IsoNode::Split {
        dim,
        cut,
        left: Box::new(build_node(&left_points, depth + 1, limit, rng)),
        right: Box::new(build_node(&right_points, depth + 1, limit, rng)),
    }
}

fn dim_range(points: &[FeatureVector], dim: usize) -> (f64, f64) {
    let mut lo = f64::INFINITY;
    let mut hi = f64::NEG_INFINITY;
    for p in points {
        lo = lo.min(p[dim]);
        hi = hi.max(p[dim]);
    }
    (lo, hi)
}

fn path_length(node: &IsoNode, point: &FeatureVector, depth: usize) -> f64 {
    match node {
        IsoNode::Tail { size } => depth as f64 + average_path_length(*size),
        IsoNode::Split {
            dim,
            cut,
            left,
            right,
        } => {
            if point[*dim] < *cut {
                path_length(left, point, depth + 1)
            } else {
                path_length(right, point, depth + 1)
            }
        }
    }
}

/// Expected search path length in a binary tree over `n` points:
/// `2 H(n-1) - 2 (n-1)/n` with the harmonic number approximated by
/// `ln(k) + gamma`.
fn average_path_length(n: usize) -> f64 {
    match n {
        0 | 1 => 0.0,
        2 => 1.0,
        _ => {
            let nf = n as f64;
            2.0 * ((nf - 1.0).ln() + EULER_MASCHERONI) - 2.0 * (nf - 1.0) / nf
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::FEATURE_DIM;

    fn clustered_samples(count: usize, seed: u64) -> Vec<FeatureVector> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..count)
            .map(|_| {
                let mut v = [0.0; FEATURE_DIM];
                v[0] = 42.0 + rng.random::<f64>() - 0.5; // latitude around 42
                v[1] = -93.5 + rng.random::<f64>() - 0.5; // longitude around -93.5
                v[2] = 8.0 + rng.random::<f64>() * 10.0; // daytime hours
                v[3] = rng.random_range(0..5) as f64; // weekdays
                v[4] = rng.random_range(0..60) as f64;
                v[5] = 1.0; // construction
                v[9] = rng.random::<f64>() * 5.0; // near neighbors
                v[10] = 2.0 + rng.random::<f64>() * 3.0;
                v
            })
            .collect()
    }

    fn far_outlier() -> FeatureVector {
        let mut v = [0.0; FEATURE_DIM];
        v[0] = 10.0;
        v[1] = 120.0;
        v[2] = 3.0;
        v[3] = 6.0;
        v[4] = 59.0;
        v[8] = 1.0;
        v[9] = 999.0;
        v[10] = 0.0;
        v
    }

    #[test]
    fn test_outlier_scores_above_cluster() {
        let samples = clustered_samples(200, 11);
        let forest = IsolationForest::fit(&samples);

        let inlier_score = forest.score(&samples[0]);
        let outlier_score = forest.score(&far_outlier());

        assert!(
            outlier_score > inlier_score,
            "outlier {} should beat inlier {}",
            outlier_score,
            inlier_score
        );
        assert!(
            forest.is_anomalous(outlier_score),
            "a point nowhere near training data must clear the threshold ({} <= {})",
            outlier_score,
            forest.threshold()
        );
    }

    #[test]
    fn test_training_is_deterministic() {
        let samples = clustered_samples(120, 7);
        let a = IsolationForest::fit_seeded(&samples, 99);
        let b = IsolationForest::fit_seeded(&samples, 99);

        assert_eq!(a.threshold(), b.threshold());
        let probe = far_outlier();
        assert_eq!(a.score(&probe), b.score(&probe));
        assert_eq!(a.score(&samples[3]), b.score(&samples[3]));
    }

    #[test]
    fn test_identical_training_batch_flags_nothing() {
        let samples = vec![[1.0; FEATURE_DIM]; 50];
        let forest = IsolationForest::fit(&samples);

        let score = forest.score(&[1.0; FEATURE_DIM]);
        assert!(
            (score - 0.5).abs() < 1e-9,
            "no spread means every path is the expectation, got {}",
            score
        );
        assert!(
            !forest.is_anomalous(score),
            "threshold must be strict on a degenerate batch"
        );
    }

    #[test]
    fn test_single_sample_batch() {
        let samples = vec![[3.0; FEATURE_DIM]];
        let forest = IsolationForest::fit(&samples);
        let score = forest.score(&[3.0; FEATURE_DIM]);
        assert_eq!(score, 0.5);
        assert!(!forest.is_anomalous(score));
    }

    #[test]
    fn test_scores_stay_in_unit_interval() {
        let samples = clustered_samples(64, 5);
        let forest = IsolationForest::fit(&samples);
        for sample in &samples {
            let s = forest.score(sample);
            assert!((0.0..=1.0).contains(&s), "score {} out of range", s);
        }
        let s = forest.score(&far_outlier());
        assert!((0.0..=1.0).contains(&s));
    }

    #[test]
    fn test_forest_has_configured_tree_count() {
        let samples = clustered_samples(32, 2);
        let forest = IsolationForest::fit(&samples);
        assert_eq!(forest.num_trees(), NUM_TREES);
    }
}
