//! Anomaly Engine — isolation-forest detection with severity classification
//!
//! ## Pipeline
//!
//! 1. Build hourly feature rows for the scope (coarser only if data is thin).
//! 2. Gate out buckets reported as maintenance/fault.
//! 3. Append `|actual − predicted|` as an extra feature when an active
//!    baseline exists and the caller asked for it.
//! 4. Fit an isolation forest; flag rows past the contamination cutoff.
//! 5. Classify each flag (spike/drop/typed/baseline_deviation), fold
//!    sustained runs into drift, grade severity on the 2σ/3σ ladder.
//! 6. Persist new rows (idempotent on machine/bucket/type) and publish
//!    `anomaly.detected` for each insert.

pub mod classify;
pub mod isolation_forest;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info};
use utoipa::ToSchema;

use crate::context::CoreContext;
use crate::error::CoreError;
use crate::events::BusEvent;
use crate::features::{self, DETECTION_SAMPLE_FLOOR};
use crate::store::anomalies::{self, NewAnomaly};
use crate::store::baselines;
use crate::store::catalog;
use crate::types::{Anomaly, AnomalySeverity, AnomalyType, Granularity, Scope, TimeRange};
use classify::{classify, confidence, drift_overrides, mean_std, FeatureContribution};
use isolation_forest::{score_threshold, ForestParams, IsolationForest};

/// Synthetic feature key carrying the baseline deviation.
const BASELINE_FEATURE: &str = "baseline_deviation";

// ============================================================================
// Requests & Outcomes
// ============================================================================

/// Parameters of one detection sweep.
#[derive(Debug, Clone)]
pub struct DetectParams {
    pub scope: Scope,
    /// Required for machine scopes; SEUs carry their own source.
    pub energy_source: Option<String>,
    pub range: TimeRange,
    /// Append the baseline-deviation feature when an active model exists.
    pub use_baseline: bool,
}

/// Result of a sweep.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct DetectionOutcome {
    /// Rows actually inserted (duplicates are silently skipped).
    pub new_anomalies: Vec<Anomaly>,
    pub evaluated_buckets: usize,
    pub flagged_buckets: usize,
    pub granularity: Granularity,
    pub baseline_used: bool,
}

// ============================================================================
// Detection
// ============================================================================

/// Run one sweep over the window and persist/publish what it finds.
pub async fn detect(
    ctx: &CoreContext,
    params: &DetectParams,
) -> Result<DetectionOutcome, CoreError> {
    let scope =
        features::resolve_scope(&ctx.pool, &params.scope, params.energy_source.as_deref()).await?;

    // Physical candidates only: derived calendar features don't separate
    // outliers, they create them.
    let declared = catalog::features_for_source(&ctx.pool, &scope.energy_source).await?;
    let candidates: Vec<String> = declared.iter().map(|d| d.feature_key.clone()).collect();

    let table = features::feature_table(
        &ctx.pool,
        &scope,
        &params.range,
        &candidates,
        DETECTION_SAMPLE_FLOOR,
        Granularity::OneHour,
    )
    .await?;

    let keys = table.feature_keys();

    // Active baseline, if requested and present; detection degrades without.
    let model = if params.use_baseline {
        baselines::active_model(&ctx.pool, &scope.key, &scope.energy_source).await?
    } else {
        None
    };
    // The model only applies when every one of its features survived coverage.
    let model = model.filter(|m| m.features.iter().all(|f| keys.contains(f)));

    // Clean rows, skipping maintenance/fault buckets.
    let mut buckets = Vec::new();
    let mut matrix: Vec<Vec<f64>> = Vec::new();
    let mut energy: Vec<f64> = Vec::new();
    let mut predicted: Vec<Option<f64>> = Vec::new();

    let (all_buckets, all_rows, all_energy) = table.complete_rows(&keys);
    for ((bucket, row), y) in all_buckets.iter().zip(all_rows.iter()).zip(all_energy.iter()) {
        let index = table.buckets.iter().position(|b| b == bucket).unwrap_or(0);
        if table.is_gated(index) {
            continue;
        }

        let mut feature_row = row.clone();
        let pred = model.as_ref().map(|m| {
            let x: Vec<f64> = m
                .features
                .iter()
                .map(|f| {
                    let col = keys.iter().position(|k| k == f).unwrap_or(0);
                    row[col]
                })
                .collect();
            m.predict(&x)
        });
        if let Some(p) = pred {
            feature_row.push((y - p).abs());
        }

        buckets.push(*bucket);
        matrix.push(feature_row);
        energy.push(*y);
        predicted.push(pred);
    }

    if matrix.len() < DETECTION_SAMPLE_FLOOR {
        return Err(CoreError::InsufficientData(format!(
            "{} usable buckets after gating; {DETECTION_SAMPLE_FLOOR} required",
            matrix.len()
        )));
    }

    let mut feature_keys = keys.clone();
    if model.is_some() {
        feature_keys.push(BASELINE_FEATURE.to_string());
    }

    // Fit + score.
    let forest = IsolationForest::fit(
        &matrix,
        &ForestParams {
            seed: 7,
            ..ForestParams::default()
        },
    );
    let scores = forest.scores(&matrix);
    let threshold = score_threshold(&scores, ctx.config.anomaly_contamination);

    // Column statistics for z-score attribution.
    let column_stats: Vec<(f64, f64)> = (0..feature_keys.len())
        .map(|c| mean_std(&matrix.iter().map(|row| row[c]).collect::<Vec<_>>()))
        .collect();
    let power_col = feature_keys.iter().position(|k| k == "avg_power_kw");

    // First pass: flag + classify.
    let mut flags: Vec<Option<i8>> = vec![None; matrix.len()];
    let mut drafts: Vec<(usize, AnomalyType, f64)> = Vec::new(); // (row, type, confidence)
    for (i, (row, &score)) in matrix.iter().zip(scores.iter()).enumerate() {
        if score <= threshold {
            continue;
        }

        let contributions: Vec<FeatureContribution> = feature_keys
            .iter()
            .zip(row.iter())
            .zip(column_stats.iter())
            .map(|((key, &v), &(mean, std))| FeatureContribution {
                key: key.clone(),
                z: if std > 0.0 { (v - mean) / std } else { 0.0 },
            })
            .collect();

        let kind = classify(&contributions);
        let power_sign = power_col
            .map(|c| {
                let (mean, _) = column_stats[c];
                if row[c] >= mean {
                    1i8
                } else {
                    -1i8
                }
            })
            .unwrap_or(1);
        flags[i] = Some(power_sign);
        drafts.push((i, kind, confidence(score, threshold)));
    }

    // Second pass: sustained runs become drift.
    let drift = drift_overrides(&flags);

    let mut outcome = DetectionOutcome {
        new_anomalies: Vec::new(),
        evaluated_buckets: matrix.len(),
        flagged_buckets: drafts.len(),
        granularity: table.granularity,
        baseline_used: model.is_some(),
    };

    for (i, kind, conf) in drafts {
        let kind = if drift[i] { AnomalyType::Drift } else { kind };

        // actual/expected/σ: the baseline grades energy deviation when it
        // applies; otherwise the power column grades against its own spread.
        let (metric, actual, expected, sigma) = match (&model, predicted[i], kind) {
            (Some(m), Some(pred), AnomalyType::BaselineDeviation) => {
                ("energy_kwh".to_string(), energy[i], pred, m.residual_std)
            }
            _ => {
                let col = power_col.unwrap_or(0);
                let (mean, std) = column_stats[col];
                (feature_keys[col].clone(), matrix[i][col], mean, std)
            }
        };

        let severity = AnomalySeverity::from_deviation((actual - expected).abs(), sigma);

        let new = NewAnomaly {
            machine_id: scope.key.clone(),
            detected_at: buckets[i],
            anomaly_type: kind,
            severity,
            metric,
            actual,
            expected,
            confidence: conf,
        };

        if let Some(inserted) = anomalies::insert_anomaly(&ctx.pool, &new).await? {
            ctx.publisher
                .publish(&BusEvent::AnomalyDetected {
                    machine_id: inserted.machine_id.clone(),
                    metric: inserted.metric.clone(),
                    value: inserted.actual,
                    expected: inserted.expected,
                    severity: inserted.severity,
                    anomaly_type: inserted.anomaly_type,
                    confidence: inserted.confidence,
                    timestamp: inserted.detected_at,
                    published_at: Utc::now(),
                })
                .await;
            outcome.new_anomalies.push(inserted);
        } else {
            debug!(
                scope = %scope.key,
                bucket = %buckets[i],
                kind = %kind,
                "duplicate anomaly skipped"
            );
        }
    }

    info!(
        scope = %scope.key,
        evaluated = outcome.evaluated_buckets,
        flagged = outcome.flagged_buckets,
        inserted = outcome.new_anomalies.len(),
        baseline = outcome.baseline_used,
        "anomaly sweep complete"
    );

    Ok(outcome)
}

// ============================================================================
// Manual Creation
// ============================================================================

/// Persist a fully specified anomaly (developer tool). Follows the same
/// dedup + publish path as detection; a duplicate returns `None` quietly.
pub async fn create_manual(
    ctx: &CoreContext,
    anomaly: NewAnomaly,
) -> Result<Option<Anomaly>, CoreError> {
    let Some(inserted) = anomalies::insert_anomaly(&ctx.pool, &anomaly).await? else {
        return Ok(None);
    };

    ctx.publisher
        .publish(&BusEvent::AnomalyDetected {
            machine_id: inserted.machine_id.clone(),
            metric: inserted.metric.clone(),
            value: inserted.actual,
            expected: inserted.expected,
            severity: inserted.severity,
            anomaly_type: inserted.anomaly_type,
            confidence: inserted.confidence,
            timestamp: inserted.detected_at,
            published_at: Utc::now(),
        })
        .await;

    Ok(Some(inserted))
}
