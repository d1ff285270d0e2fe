//! Classification of flagged buckets: type, drift runs, confidence
//!
//! Pure functions over per-row feature contributions so the pipeline in
//! `mod.rs` stays thin and everything here is unit-testable without a store.

use crate::types::AnomalyType;

/// Z-score threshold above which the power signal alone names the type.
pub const POWER_Z_THRESHOLD: f64 = 2.0;

/// Consecutive same-sign flagged buckets that reclassify as drift.
pub const DRIFT_RUN_LENGTH: usize = 3;

/// One feature's standardized contribution to a flagged row.
#[derive(Debug, Clone)]
pub struct FeatureContribution {
    pub key: String,
    /// Signed z-score of the row's value within the window.
    pub z: f64,
}

/// Name the anomaly type from the flagged row's contributions.
///
/// Priority order:
/// 1. a dominating baseline-deviation feature,
/// 2. power |z| above threshold → spike/drop by sign,
/// 3. the top contributor's signal family (temperature/pressure/production),
/// 4. unknown.
pub fn classify(contributions: &[FeatureContribution]) -> AnomalyType {
    let Some(top) = contributions
        .iter()
        .max_by(|a, b| {
            a.z.abs()
                .partial_cmp(&b.z.abs())
                .unwrap_or(std::cmp::Ordering::Equal)
        })
    else {
        return AnomalyType::Unknown;
    };

    if top.key == "baseline_deviation" {
        return AnomalyType::BaselineDeviation;
    }

    if let Some(power) = contributions
        .iter()
        .find(|c| c.key == "avg_power_kw" || c.key == "power_kw")
    {
        if power.z.abs() >= POWER_Z_THRESHOLD {
            return if power.z > 0.0 {
                AnomalyType::Spike
            } else {
                AnomalyType::Drop
            };
        }
    }

    match top.key.as_str() {
        k if k.contains("temp") => AnomalyType::Temperature,
        k if k.contains("pressure") => AnomalyType::Pressure,
        k if k.contains("production") || k.contains("throughput") => AnomalyType::Production,
        "avg_power_kw" | "power_kw" | "avg_load_factor" => AnomalyType::Power,
        _ => AnomalyType::Unknown,
    }
}

/// Reclassify sustained runs as drift.
///
/// `flags[i]` is `Some(sign_of_power_deviation)` for flagged buckets, `None`
/// otherwise. Runs of `DRIFT_RUN_LENGTH`+ consecutive flags with the same
/// sign are drift; returns the per-bucket override.
pub fn drift_overrides(flags: &[Option<i8>]) -> Vec<bool> {
    let mut drift = vec![false; flags.len()];
    let mut run_start = 0usize;
    let mut run_sign: Option<i8> = None;
    let mut run_len = 0usize;

    let close_run = |drift: &mut Vec<bool>, start: usize, len: usize| {
        if len >= DRIFT_RUN_LENGTH {
            for slot in drift.iter_mut().skip(start).take(len) {
                *slot = true;
            }
        }
    };

    for (i, flag) in flags.iter().enumerate() {
        match (*flag, run_sign) {
            (Some(sign), Some(current)) if sign == current => run_len += 1,
            (Some(sign), _) => {
                close_run(&mut drift, run_start, run_len);
                run_start = i;
                run_sign = Some(sign);
                run_len = 1;
            }
            (None, _) => {
                close_run(&mut drift, run_start, run_len);
                run_sign = None;
                run_len = 0;
            }
        }
    }
    close_run(&mut drift, run_start, run_len);

    drift
}

/// Map an isolation score above its threshold into a confidence in [0, 1].
///
/// Scores sit in (0.5, 1] once past the cutoff; rescale the headroom.
pub fn confidence(score: f64, threshold: f64) -> f64 {
    if score <= threshold || threshold >= 1.0 {
        return 0.0;
    }
    ((score - threshold) / (1.0 - threshold)).clamp(0.0, 1.0)
}

/// Column mean and standard deviation, for z-scores.
pub fn mean_std(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n;
    (mean, var.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn c(key: &str, z: f64) -> FeatureContribution {
        FeatureContribution {
            key: key.to_string(),
            z,
        }
    }

    #[test]
    fn power_spike_and_drop_by_sign() {
        assert_eq!(
            classify(&[c("avg_power_kw", 3.2), c("avg_machine_temp_c", 0.4)]),
            AnomalyType::Spike
        );
        assert_eq!(
            classify(&[c("avg_power_kw", -2.5), c("avg_machine_temp_c", 0.4)]),
            AnomalyType::Drop
        );
    }

    #[test]
    fn dominant_baseline_deviation_wins() {
        assert_eq!(
            classify(&[c("avg_power_kw", 2.1), c("baseline_deviation", 4.0)]),
            AnomalyType::BaselineDeviation
        );
    }

    #[test]
    fn typed_signals_from_top_contributor() {
        assert_eq!(
            classify(&[c("avg_machine_temp_c", 3.0), c("avg_power_kw", 0.5)]),
            AnomalyType::Temperature
        );
        assert_eq!(
            classify(&[c("avg_pressure_bar", -2.8), c("avg_power_kw", 0.2)]),
            AnomalyType::Pressure
        );
        assert_eq!(
            classify(&[c("total_production_count", -3.1), c("avg_power_kw", 1.0)]),
            AnomalyType::Production
        );
    }

    #[test]
    fn weak_power_top_contributor_is_power_typed() {
        // power leads but below the spike threshold
        assert_eq!(
            classify(&[c("avg_power_kw", 1.5), c("avg_machine_temp_c", 0.3)]),
            AnomalyType::Power
        );
    }

    #[test]
    fn empty_contributions_are_unknown() {
        assert_eq!(classify(&[]), AnomalyType::Unknown);
    }

    #[test]
    fn drift_requires_three_consecutive_same_sign() {
        // run of 3 positives → drift
        let flags = vec![Some(1), Some(1), Some(1), None, Some(1)];
        assert_eq!(drift_overrides(&flags), vec![true, true, true, false, false]);

        // run of 2 is not drift
        let flags = vec![Some(1), Some(1), None, Some(-1)];
        assert_eq!(drift_overrides(&flags), vec![false; 4]);

        // sign change breaks the run
        let flags = vec![Some(1), Some(1), Some(-1), Some(-1), Some(-1)];
        assert_eq!(
            drift_overrides(&flags),
            vec![false, false, true, true, true]
        );
    }

    #[test]
    fn drift_run_at_the_tail_is_closed() {
        let flags = vec![None, Some(-1), Some(-1), Some(-1)];
        assert_eq!(drift_overrides(&flags), vec![false, true, true, true]);
    }

    #[test]
    fn confidence_rescales_score_headroom() {
        assert_eq!(confidence(0.5, 0.6), 0.0);
        assert!((confidence(0.8, 0.6) - 0.5).abs() < 1e-9);
        assert!((confidence(1.0, 0.6) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn mean_std_basics() {
        let (mean, std) = mean_std(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]);
        assert!((mean - 5.0).abs() < 1e-9);
        assert!((std - 2.0).abs() < 1e-9);
    }
}
