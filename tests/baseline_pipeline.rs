//! End-to-end math regression: feature assembly → selection → OLS →
//! severity, plus the detector's scoring stage, on synthetic factory data.
//! No store required; this drives the same pure stages the engines call.

use chrono::{DateTime, TimeZone, Utc};

use enms_analytics::anomaly::classify::{classify, FeatureContribution};
use enms_analytics::anomaly::isolation_forest::{score_threshold, ForestParams, IsolationForest};
use enms_analytics::baseline::regression::fit_ols;
use enms_analytics::baseline::selection::select_features;
use enms_analytics::features::assemble;
use enms_analytics::store::timeseries::FeatureRow;
use enms_analytics::types::{AnomalySeverity, AnomalyType, Granularity};

/// ~18 days of hourly buckets for a compressor-like machine:
/// energy = 12 + 0.05·production − 0.6·outdoor_temp + bounded noise.
fn synthetic_rows(n: usize) -> Vec<FeatureRow> {
    (0..n)
        .map(|i| {
            let bucket = hour(i);
            let production = 400.0 + 150.0 * ((i % 24) as f64 / 24.0) + ((i * 13) % 7) as f64;
            let temp = 8.0 + 6.0 * (((i % 24) as f64 - 12.0) / 12.0) + ((i * 31) % 5) as f64 * 0.1;
            let noise = (((i * 2_654_435_761) % 100) as f64 / 100.0 - 0.5) * 1.5;
            let energy = 12.0 + 0.05 * production - 0.6 * temp + noise;
            FeatureRow {
                bucket,
                total_energy_kwh: Some(energy),
                avg_power_kw: Some(energy), // hourly buckets: kWh ≈ kW
                avg_load_factor: Some(0.7),
                total_production_count: Some(production),
                avg_throughput: Some(production / 60.0),
                avg_outdoor_temp_c: Some(temp),
                avg_machine_temp_c: Some(40.0 + ((i * 11) % 9) as f64 * 0.2),
                avg_pressure_bar: None, // sensorless: must be coverage-dropped
                avg_humidity_percent: Some(55.0),
                machine_status: None,
            }
        })
        .collect()
}

fn hour(i: usize) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).single().unwrap()
        + chrono::Duration::hours(i as i64)
}

fn candidate_keys() -> Vec<String> {
    [
        "total_production_count",
        "avg_outdoor_temp_c",
        "avg_pressure_bar",
        "avg_throughput",
        "avg_machine_temp_c",
        "avg_load_factor",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

#[test]
fn training_pipeline_recovers_the_generating_model() {
    let rows = synthetic_rows(432);
    let table = assemble(&rows, &candidate_keys(), Granularity::OneHour);

    // the sensorless pressure column is dropped with a recorded coverage
    assert!(table.column("avg_pressure_bar").is_none());
    assert_eq!(table.dropped.len(), 1);
    assert_eq!(table.dropped[0].key, "avg_pressure_bar");

    let keys = table.feature_keys();
    let (_, matrix, target) = table.complete_rows(&keys);
    assert!(target.len() >= 50);

    // auto selection keeps the real drivers and rejects flat columns
    let columns: Vec<(String, Vec<f64>)> = keys
        .iter()
        .enumerate()
        .map(|(c, k)| (k.clone(), matrix.iter().map(|r| r[c]).collect()))
        .collect();
    let selection = select_features(&columns, &target);
    assert!(selection
        .retained
        .contains(&"total_production_count".to_string()));
    assert!(selection.retained.contains(&"avg_outdoor_temp_c".to_string()));
    // load factor is constant → zero correlation → rejected
    assert!(!selection.retained.contains(&"avg_load_factor".to_string()));
    // throughput is exactly production/60, so the collinearity prune keeps
    // only the production count
    assert!(!selection.retained.contains(&"avg_throughput".to_string()));
    assert!(selection
        .rejected
        .iter()
        .any(|r| r.feature == "avg_throughput" && r.reason.contains("collinear")));

    let (_, matrix, target) = table.complete_rows(&selection.retained);
    let fit = fit_ols(&matrix, &target).unwrap();
    assert!(fit.r_squared > 0.9, "R² = {}", fit.r_squared);

    // round-trip law: predict(x) == intercept + Σ coeffs·x within tolerance
    for (row, &y) in matrix.iter().zip(target.iter()).take(20) {
        let manual: f64 = fit.intercept
            + fit
                .coefficients
                .iter()
                .zip(row.iter())
                .map(|(c, v)| c * v)
                .sum::<f64>();
        assert!((fit.predict(row) - manual).abs() < 1e-12);
        assert!((fit.predict(row) - y).abs() < 4.0 * fit.residual_std);
    }
}

#[test]
fn severity_ladder_against_fitted_residuals() {
    let rows = synthetic_rows(200);
    let table = assemble(
        &rows,
        &["total_production_count".to_string(), "avg_outdoor_temp_c".to_string()],
        Granularity::OneHour,
    );
    let keys = table.feature_keys();
    let (_, matrix, target) = table.complete_rows(&keys);
    let fit = fit_ols(&matrix, &target).unwrap();
    let sigma = fit.residual_std;

    assert_eq!(
        AnomalySeverity::from_deviation(1.9 * sigma, sigma),
        AnomalySeverity::Info
    );
    assert_eq!(
        AnomalySeverity::from_deviation(2.4 * sigma, sigma),
        AnomalySeverity::Warning
    );
    assert_eq!(
        AnomalySeverity::from_deviation(3.5 * sigma, sigma),
        AnomalySeverity::Critical
    );
}

#[test]
fn planted_power_spike_is_flagged_and_classified() {
    let rows = synthetic_rows(300);
    let table = assemble(
        &rows,
        &["total_production_count".to_string(), "avg_outdoor_temp_c".to_string()],
        Granularity::OneHour,
    );
    let keys = table.feature_keys();
    let (_, mut matrix, _) = table.complete_rows(&keys);

    // plant an outlier: impossible production at freezing temperature
    matrix.push(vec![5000.0, -30.0]);
    let planted = matrix.len() - 1;

    let forest = IsolationForest::fit(&matrix, &ForestParams::default());
    let scores = forest.scores(&matrix);
    let threshold = score_threshold(&scores, 0.02);

    assert!(
        scores[planted] > threshold,
        "planted outlier must exceed the cutoff ({} <= {})",
        scores[planted],
        threshold
    );

    // attribution: the production column dominates → production-typed
    let kind = classify(&[
        FeatureContribution {
            key: "total_production_count".to_string(),
            z: 8.0,
        },
        FeatureContribution {
            key: "avg_outdoor_temp_c".to_string(),
            z: -3.0,
        },
    ]);
    assert_eq!(kind, AnomalyType::Production);
}
