//! Correlation-based automatic feature selection
//!
//! Pearson correlation against the target with p-values from a Student's t
//! distribution (statrs). Selection thresholds on |r|; the p-value rides
//! along in the report so operators can judge the evidence.

use serde::Serialize;
use statrs::distribution::{ContinuousCDF, StudentsT};
use utoipa::ToSchema;

/// Features with |r| to the target below this are rejected.
pub const MIN_TARGET_CORRELATION: f64 = 0.05;

/// Pairwise |r| above this marks two features as collinear; the one with the
/// weaker target correlation is pruned.
pub const COLLINEARITY_LIMIT: f64 = 0.95;

/// Correlation of one candidate feature with the target.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct FeatureCorrelation {
    pub feature: String,
    pub r_value: f64,
    pub r_squared: f64,
    pub p_value: f64,
    pub sample_count: usize,
}

/// A candidate removed during selection, and why.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct RejectedFeature {
    pub feature: String,
    pub reason: String,
}

/// Outcome of the auto-selection pass.
#[derive(Debug, Clone)]
pub struct SelectionOutcome {
    /// Surviving feature keys, input order preserved.
    pub retained: Vec<String>,
    /// Target correlations of the retained features, strongest first.
    pub correlations: Vec<FeatureCorrelation>,
    pub rejected: Vec<RejectedFeature>,
}

/// Pearson correlation coefficient.
///
/// Formula: r = Σ[(xi − x̄)(yi − ȳ)] / sqrt(Σ(xi − x̄)² × Σ(yi − ȳ)²)
pub fn pearson(x: &[f64], y: &[f64]) -> f64 {
    let n = x.len() as f64;
    if x.is_empty() || x.len() != y.len() {
        return 0.0;
    }
    let sum_x: f64 = x.iter().sum();
    let sum_y: f64 = y.iter().sum();
    let sum_xy: f64 = x.iter().zip(y.iter()).map(|(a, b)| a * b).sum();
    let sum_x2: f64 = x.iter().map(|a| a * a).sum();
    let sum_y2: f64 = y.iter().map(|a| a * a).sum();

    let numerator = n * sum_xy - sum_x * sum_y;
    let denominator = ((n * sum_x2 - sum_x.powi(2)) * (n * sum_y2 - sum_y.powi(2))).sqrt();

    if denominator == 0.0 {
        0.0
    } else {
        numerator / denominator
    }
}

/// Two-tailed p-value for a correlation via t = r·sqrt(n−2)/sqrt(1−r²).
pub fn p_value_for_r(r: f64, n: usize) -> f64 {
    if n < 3 {
        return 1.0;
    }
    if r.abs() >= 0.9999 {
        return 0.0;
    }

    let df = (n - 2) as f64;
    let t_stat = r * df.sqrt() / (1.0 - r * r).sqrt();

    match StudentsT::new(0.0, 1.0, df) {
        Ok(dist) => 2.0 * (1.0 - dist.cdf(t_stat.abs())),
        Err(_) => 1.0,
    }
}

/// Run the selection pass over column-major candidates.
///
/// `columns` pairs each feature key with its value vector; all vectors and
/// `target` must have equal length (rows are already cleaned).
pub fn select_features(columns: &[(String, Vec<f64>)], target: &[f64]) -> SelectionOutcome {
    let n = target.len();
    let mut rejected = Vec::new();

    // 1. target-correlation filter
    let mut survivors: Vec<(String, &Vec<f64>, FeatureCorrelation)> = Vec::new();
    for (key, values) in columns {
        let r = pearson(values, target);
        let correlation = FeatureCorrelation {
            feature: key.clone(),
            r_value: r,
            r_squared: r * r,
            p_value: p_value_for_r(r, n),
            sample_count: n,
        };
        if r.abs() < MIN_TARGET_CORRELATION {
            rejected.push(RejectedFeature {
                feature: key.clone(),
                reason: format!(
                    "target correlation |r|={:.3} below {MIN_TARGET_CORRELATION}",
                    r.abs()
                ),
            });
        } else {
            survivors.push((key.clone(), values, correlation));
        }
    }

    // 2. multicollinearity prune: of a collinear pair, keep the feature with
    //    the stronger target correlation
    let mut pruned = vec![false; survivors.len()];
    for i in 0..survivors.len() {
        if pruned[i] {
            continue;
        }
        for j in (i + 1)..survivors.len() {
            if pruned[j] {
                continue;
            }
            let pair_r = pearson(survivors[i].1, survivors[j].1);
            if pair_r.abs() > COLLINEARITY_LIMIT {
                let (drop, keep) =
                    if survivors[i].2.r_value.abs() >= survivors[j].2.r_value.abs() {
                        (j, i)
                    } else {
                        (i, j)
                    };
                pruned[drop] = true;
                rejected.push(RejectedFeature {
                    feature: survivors[drop].0.clone(),
                    reason: format!(
                        "collinear with '{}' (|r|={:.3})",
                        survivors[keep].0,
                        pair_r.abs()
                    ),
                });
            }
        }
    }

    let retained: Vec<String> = survivors
        .iter()
        .zip(pruned.iter())
        .filter(|(_, &p)| !p)
        .map(|((key, _, _), _)| key.clone())
        .collect();

    let mut correlations: Vec<FeatureCorrelation> = survivors
        .into_iter()
        .zip(pruned)
        .filter(|(_, p)| !p)
        .map(|((_, _, c), _)| c)
        .collect();
    correlations.sort_by(|a, b| {
        b.r_value
            .abs()
            .partial_cmp(&a.r_value.abs())
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    SelectionOutcome {
        retained,
        correlations,
        rejected,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn perfect_correlation_is_significant() {
        let x: Vec<f64> = (0..100).map(|i| i as f64).collect();
        let y = x.clone();
        let r = pearson(&x, &y);
        assert!((r - 1.0).abs() < 1e-9);
        assert!(p_value_for_r(r, 100) < 0.05);
    }

    #[test]
    fn p_value_reference_points() {
        // r=0.5, n=30 → p ≈ 0.005
        let p = p_value_for_r(0.5, 30);
        assert!(p < 0.01 && p > 0.001, "p = {p}");
        // r=0.2, n=30 → clearly not significant
        assert!(p_value_for_r(0.2, 30) > 0.2);
    }

    #[test]
    fn weak_feature_is_rejected() {
        let target: Vec<f64> = (0..100).map(|i| i as f64).collect();
        let strong = target.iter().map(|v| v * 2.0 + 1.0).collect::<Vec<_>>();
        // alternating noise, essentially uncorrelated with the ramp
        let weak: Vec<f64> = (0..100).map(|i| if i % 2 == 0 { 50.0 } else { 51.0 }).collect();

        let outcome = select_features(
            &[
                ("production".to_string(), strong),
                ("noise".to_string(), weak),
            ],
            &target,
        );

        assert_eq!(outcome.retained, vec!["production".to_string()]);
        assert_eq!(outcome.rejected.len(), 1);
        assert_eq!(outcome.rejected[0].feature, "noise");
        assert!(outcome.rejected[0].reason.contains("target correlation"));
    }

    #[test]
    fn collinear_pair_keeps_stronger_feature() {
        let target: Vec<f64> = (0..100).map(|i| i as f64).collect();
        // both collinear with each other; 'exact' tracks the target better
        let exact: Vec<f64> = target.iter().map(|v| v * 3.0).collect();
        let shifted: Vec<f64> = target
            .iter()
            .enumerate()
            .map(|(i, v)| v * 3.0 + if i % 10 == 0 { 2.0 } else { 0.0 })
            .collect();

        let outcome = select_features(
            &[
                ("exact".to_string(), exact),
                ("shifted".to_string(), shifted),
            ],
            &target,
        );

        assert_eq!(outcome.retained, vec!["exact".to_string()]);
        assert!(outcome
            .rejected
            .iter()
            .any(|r| r.feature == "shifted" && r.reason.contains("collinear")));
    }

    #[test]
    fn correlations_sorted_by_strength() {
        let target: Vec<f64> = (0..100).map(|i| i as f64).collect();
        let strong: Vec<f64> = target.iter().map(|v| v * 2.0).collect();
        let medium: Vec<f64> = target
            .iter()
            .enumerate()
            .map(|(i, v)| v + ((i * 37) % 50) as f64)
            .collect();

        let outcome = select_features(
            &[
                ("medium".to_string(), medium),
                ("strong".to_string(), strong),
            ],
            &target,
        );

        assert_eq!(outcome.correlations[0].feature, "strong");
        for pair in outcome.correlations.windows(2) {
            assert!(pair[0].r_value.abs() >= pair[1].r_value.abs());
        }
    }

    #[test]
    fn empty_candidates_produce_empty_outcome() {
        let outcome = select_features(&[], &[1.0, 2.0, 3.0]);
        assert!(outcome.retained.is_empty());
        assert!(outcome.correlations.is_empty());
        assert!(outcome.rejected.is_empty());
    }
}
