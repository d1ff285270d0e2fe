//! Isolation forest — unsupervised outlier scoring
//!
//! Standard formulation: random axis-aligned splits isolate outliers in
//! fewer steps than inliers. Score `s(x) = 2^(−E[h(x)]/c(n))` lands in
//! (0, 1]; values near 1 are anomalous. Trees fit in parallel with rayon;
//! a fixed seed makes runs reproducible.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;

/// Forest hyperparameters.
#[derive(Debug, Clone, Copy)]
pub struct ForestParams {
    pub n_trees: usize,
    /// Rows subsampled per tree (ψ in the paper; 256 is the classic choice).
    pub subsample: usize,
    pub seed: u64,
}

impl Default for ForestParams {
    fn default() -> Self {
        Self {
            n_trees: 100,
            subsample: 256,
            seed: 7,
        }
    }
}

enum Node {
    Internal {
        feature: usize,
        split: f64,
        left: Box<Node>,
        right: Box<Node>,
    },
    Leaf {
        size: usize,
    },
}

/// A fitted forest over fixed-width feature rows.
pub struct IsolationForest {
    trees: Vec<Node>,
    /// c(ψ): average unsuccessful-search path length used for normalization.
    expected_depth: f64,
}

impl IsolationForest {
    /// Fit a forest. Rows must be non-empty and rectangular.
    pub fn fit(data: &[Vec<f64>], params: &ForestParams) -> Self {
        let n = data.len();
        let sample_size = params.subsample.min(n).max(2);
        let max_depth = (sample_size as f64).log2().ceil() as usize;

        let trees: Vec<Node> = (0..params.n_trees)
            .into_par_iter()
            .map(|t| {
                // per-tree rng so parallel fitting stays deterministic
                let mut rng = StdRng::seed_from_u64(params.seed.wrapping_add(t as u64));
                let mut indices: Vec<usize> =
                    (0..sample_size).map(|_| rng.gen_range(0..n)).collect();
                build_tree(data, &mut indices, 0, max_depth, &mut rng)
            })
            .collect();

        Self {
            trees,
            expected_depth: average_path_length(sample_size),
        }
    }

    /// Anomaly score in (0, 1]; ~0.5 for average points, →1 for outliers.
    pub fn score(&self, row: &[f64]) -> f64 {
        let mean_depth: f64 = self
            .trees
            .iter()
            .map(|tree| path_length(tree, row, 0))
            .sum::<f64>()
            / self.trees.len() as f64;
        2f64.powf(-mean_depth / self.expected_depth)
    }

    pub fn scores(&self, data: &[Vec<f64>]) -> Vec<f64> {
        data.iter().map(|row| self.score(row)).collect()
    }
}

/// Score above which a row is flagged, given the expected contamination.
///
/// The cutoff is the (1 − contamination) quantile of the observed scores,
/// floored at 0.5 so a perfectly clean window flags nothing.
pub fn score_threshold(scores: &[f64], contamination: f64) -> f64 {
    if scores.is_empty() {
        return f64::INFINITY;
    }
    let mut sorted = scores.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let rank = ((1.0 - contamination.clamp(0.0, 0.5)) * sorted.len() as f64).floor() as usize;
    sorted[rank.min(sorted.len() - 1)].max(0.5)
}

fn build_tree(
    data: &[Vec<f64>],
    indices: &mut [usize],
    depth: usize,
    max_depth: usize,
    rng: &mut StdRng,
) -> Node {
    if depth >= max_depth || indices.len() <= 1 {
        return Node::Leaf {
            size: indices.len(),
        };
    }

    let width = data[indices[0]].len();
    // pick a feature with spread; give up after a few tries (constant data)
    for _ in 0..width.max(1) {
        let feature = rng.gen_range(0..width);
        let (min, max) = indices.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &i| {
            let v = data[i][feature];
            (lo.min(v), hi.max(v))
        });
        if max - min <= f64::EPSILON {
            continue;
        }

        let split = rng.gen_range(min..max);
        let mid = partition(data, indices, feature, split);
        if mid == 0 || mid == indices.len() {
            continue;
        }
        let (left_idx, right_idx) = indices.split_at_mut(mid);
        let left = build_tree(data, left_idx, depth + 1, max_depth, rng);
        let right = build_tree(data, right_idx, depth + 1, max_depth, rng);
        return Node::Internal {
            feature,
            split,
            left: Box::new(left),
            right: Box::new(right),
        };
    }

    Node::Leaf {
        size: indices.len(),
    }
}

/// In-place partition: rows with `value < split` first. Returns the pivot.
fn partition(data: &[Vec<f64>], indices: &mut [usize], feature: usize, split: f64) -> usize {
    let mut mid = 0;
    for i in 0..indices.len() {
        if data[indices[i]][feature] < split {
            indices.swap(i, mid);
            mid += 1;
        }
    }
    mid
}

fn path_length(node: &Node, row: &[f64], depth: usize) -> f64 {
    match node {
        Node::Leaf { size } => depth as f64 + average_path_length(*size),
        Node::Internal {
            feature,
            split,
            left,
            right,
        } => {
            if row.get(*feature).copied().unwrap_or(0.0) < *split {
                path_length(left, row, depth + 1)
            } else {
                path_length(right, row, depth + 1)
            }
        }
    }
}

/// c(n): average path length of an unsuccessful BST search over n points.
fn average_path_length(n: usize) -> f64 {
    if n <= 1 {
        return 0.0;
    }
    // Euler–Mascheroni constant for the harmonic-number approximation
    const GAMMA: f64 = 0.577_215_664_901_532_9;
    let nf = n as f64;
    let harmonic = (nf - 1.0).ln() + GAMMA;
    2.0 * harmonic - 2.0 * (nf - 1.0) / nf
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A tight cluster with one far outlier at the end.
    fn cluster_with_outlier() -> Vec<Vec<f64>> {
        let mut data: Vec<Vec<f64>> = (0..200)
            .map(|i| {
                let jitter = ((i * 37) % 10) as f64 * 0.01;
                vec![10.0 + jitter, 5.0 - jitter]
            })
            .collect();
        data.push(vec![80.0, -40.0]);
        data
    }

    #[test]
    fn outlier_scores_highest() {
        let data = cluster_with_outlier();
        let forest = IsolationForest::fit(&data, &ForestParams::default());
        let scores = forest.scores(&data);

        let outlier_score = scores[scores.len() - 1];
        let max_inlier = scores[..scores.len() - 1]
            .iter()
            .fold(f64::NEG_INFINITY, |a, &b| a.max(b));

        assert!(
            outlier_score > max_inlier,
            "outlier {outlier_score} must outscore inliers (max {max_inlier})"
        );
        assert!(outlier_score > 0.6);
    }

    #[test]
    fn scores_are_deterministic_for_a_seed() {
        let data = cluster_with_outlier();
        let params = ForestParams::default();
        let a = IsolationForest::fit(&data, &params).scores(&data);
        let b = IsolationForest::fit(&data, &params).scores(&data);
        assert_eq!(a, b);
    }

    #[test]
    fn threshold_flags_roughly_the_contaminated_fraction() {
        let data = cluster_with_outlier();
        let forest = IsolationForest::fit(&data, &ForestParams::default());
        let scores = forest.scores(&data);

        let threshold = score_threshold(&scores, 0.01);
        let flagged = scores.iter().filter(|&&s| s > threshold).count();
        // 201 rows at 1% contamination → at most a couple of flags,
        // and the planted outlier must be among them
        assert!(flagged >= 1 && flagged <= 4, "flagged {flagged}");
        assert!(scores[scores.len() - 1] > threshold);
    }

    #[test]
    fn constant_data_produces_no_confident_outliers() {
        let data: Vec<Vec<f64>> = (0..100).map(|_| vec![1.0, 2.0]).collect();
        let forest = IsolationForest::fit(&data, &ForestParams::default());
        let scores = forest.scores(&data);
        let threshold = score_threshold(&scores, 0.1);
        // all paths end in fat leaves; nothing exceeds the floored cutoff
        assert!(scores.iter().all(|&s| s <= threshold));
    }

    #[test]
    fn average_path_length_is_monotonic() {
        assert_eq!(average_path_length(1), 0.0);
        let c16 = average_path_length(16);
        let c256 = average_path_length(256);
        assert!(c16 > 0.0 && c256 > c16);
    }
}
