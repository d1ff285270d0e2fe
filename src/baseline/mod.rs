//! Baseline Engine — regression baselines per (machine | SEU, energy source)
//!
//! ## Pipeline
//!
//! - `regression`: OLS fit via normal equations + Cholesky
//! - `selection`: correlation-based auto feature selection (statrs p-values)
//! - `persistence`: on-disk JSON blobs, DB row as the index
//!
//! Training produces a new, monotonically versioned model row; activation is
//! transactional so at most one model per scope is ever active. Prediction
//! and deviation evaluate the active model; with none they fail `NotTrained`
//! and consumers degrade (anomaly detection simply loses its baseline
//! feature).

pub mod persistence;
pub mod regression;
pub mod selection;

use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgPool;
use tracing::{info, warn};
use utoipa::ToSchema;

use crate::context::CoreContext;
use crate::error::CoreError;
use crate::events::{BusEvent, TrainingMetrics};
use crate::features::{
    self, DroppedFeature, FeatureTable, ResolvedScope, TRAINING_SAMPLE_FLOOR,
};
use crate::store::baselines::{self, NewBaselineModel};
use crate::store::catalog;
use crate::store::training_jobs;
use crate::types::{
    AnomalySeverity, BaselineModel, Granularity, JobStatus, ModelType, Scope, TimeRange,
};
use persistence::ModelBlob;
use regression::{fit_ols, RegressionError};
use selection::{FeatureCorrelation, RejectedFeature, SelectionOutcome};

// ============================================================================
// Requests & Outcomes
// ============================================================================

/// Feature choice for a training run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeatureSpec {
    /// Candidate set from the source's declarations, then correlation filter.
    Auto,
    /// Caller-specified keys, used as-is after coverage filtering.
    Explicit(Vec<String>),
}

impl FeatureSpec {
    /// An empty explicit list means "pick for me".
    pub fn from_request(features: Vec<String>) -> Self {
        if features.is_empty() {
            Self::Auto
        } else {
            Self::Explicit(features)
        }
    }
}

/// Parameters of one training run.
#[derive(Debug, Clone)]
pub struct TrainParams {
    pub scope: Scope,
    /// Required for machine scopes; SEUs carry their own source.
    pub energy_source: Option<String>,
    pub range: TimeRange,
    pub features: FeatureSpec,
    /// Activate the model on success (deactivating any predecessor).
    pub activate: bool,
}

/// Result of a successful training run.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct TrainOutcome {
    pub model: BaselineModel,
    pub meets_quality_threshold: bool,
    pub granularity: Granularity,
    pub correlations: Vec<FeatureCorrelation>,
    /// Features removed by the coverage filter.
    pub dropped_features: Vec<DroppedFeature>,
    /// Features removed by correlation/collinearity filters.
    pub rejected_features: Vec<RejectedFeature>,
}

// ============================================================================
// Training
// ============================================================================

/// Train a baseline and persist it. Does not touch training-job rows or the
/// bus; [`run_training_job`] wraps this with both.
pub async fn train(
    pool: &PgPool,
    model_dir: &Path,
    params: &TrainParams,
) -> Result<TrainOutcome, CoreError> {
    let scope = features::resolve_scope(pool, &params.scope, params.energy_source.as_deref()).await?;

    let candidates = match &params.features {
        FeatureSpec::Explicit(keys) => keys.clone(),
        FeatureSpec::Auto => {
            let declared = catalog::features_for_source(pool, &scope.energy_source).await?;
            features::auto_candidates(&declared)
        }
    };

    // Hourly buckets are the training default; coarser resolutions train
    // poorly and are only reachable for very long windows via ad-hoc reads.
    let table = features::feature_table(
        pool,
        &scope,
        &params.range,
        &candidates,
        TRAINING_SAMPLE_FLOOR,
        Granularity::OneHour,
    )
    .await?;

    let covered_keys = table.feature_keys();
    let (_, matrix, target) = table.complete_rows(&covered_keys);
    if target.len() < TRAINING_SAMPLE_FLOOR {
        return Err(CoreError::InsufficientData(format!(
            "{} clean samples after dropping incomplete rows; {TRAINING_SAMPLE_FLOOR} required",
            target.len()
        )));
    }

    // Feature selection on the cleaned columns.
    let (retained, correlations, rejected) = match &params.features {
        FeatureSpec::Auto => {
            let columns: Vec<(String, Vec<f64>)> = covered_keys
                .iter()
                .enumerate()
                .map(|(c, key)| (key.clone(), matrix.iter().map(|row| row[c]).collect()))
                .collect();
            let SelectionOutcome {
                retained,
                correlations,
                rejected,
            } = selection::select_features(&columns, &target);
            (retained, correlations, rejected)
        }
        FeatureSpec::Explicit(_) => {
            let correlations = covered_keys
                .iter()
                .enumerate()
                .map(|(c, key)| {
                    let values: Vec<f64> = matrix.iter().map(|row| row[c]).collect();
                    let r = selection::pearson(&values, &target);
                    FeatureCorrelation {
                        feature: key.clone(),
                        r_value: r,
                        r_squared: r * r,
                        p_value: selection::p_value_for_r(r, target.len()),
                        sample_count: target.len(),
                    }
                })
                .collect();
            (covered_keys.clone(), correlations, Vec::new())
        }
    };

    // Rebuild the matrix over the retained columns only.
    let (_, matrix, target) = table.complete_rows(&retained);
    if target.len() < TRAINING_SAMPLE_FLOOR {
        return Err(CoreError::InsufficientData(format!(
            "{} clean samples over the selected features; {TRAINING_SAMPLE_FLOOR} required",
            target.len()
        )));
    }

    let fit = fit_ols(&matrix, &target).map_err(|e| match e {
        RegressionError::TooFewSamples { have, need } => CoreError::InsufficientData(format!(
            "{have} samples cannot support {need} regression parameters"
        )),
        RegressionError::Singular => CoreError::InsufficientData(
            "design matrix is singular after selection; widen the window or prune features"
                .to_string(),
        ),
        RegressionError::DimensionMismatch => {
            CoreError::Internal("inconsistent feature matrix".to_string())
        }
    })?;

    let meets_quality = fit.r_squared >= crate::types::QUALITY_R_SQUARED_THRESHOLD;
    if !meets_quality {
        warn!(
            scope = %scope.key,
            r_squared = fit.r_squared,
            "baseline below quality threshold — persisting flagged model"
        );
    }

    let model = baselines::insert_model(
        pool,
        &NewBaselineModel {
            machine_id: scope.key.clone(),
            energy_source: scope.energy_source.clone(),
            features: retained.clone(),
            intercept: fit.intercept,
            coefficients: fit.coefficients.clone(),
            r_squared: fit.r_squared,
            rmse: fit.rmse,
            mae: fit.mae,
            residual_std: fit.residual_std,
            training_samples: fit.samples as i32,
            training_start: params.range.start,
            training_end: params.range.end,
            blob_path: None,
        },
        params.activate,
    )
    .await?;

    // Blob write is best-effort: the row already carries the coefficients.
    let blob = ModelBlob {
        machine_id: model.machine_id.clone(),
        energy_source: model.energy_source.clone(),
        model_version: model.model_version,
        features: retained,
        intercept: fit.intercept,
        coefficients: fit.coefficients,
        r_squared: fit.r_squared,
        rmse: fit.rmse,
        mae: fit.mae,
        residual_std: fit.residual_std,
        training_samples: fit.samples,
        trained_at: model.created_at,
    };
    let model = match persistence::write_blob(model_dir, &blob) {
        Ok(path) => {
            baselines::set_blob_path(pool, model.id, &path.to_string_lossy()).await?
        }
        Err(e) => {
            warn!(error = %e, model_id = %model.id, "model blob write failed — row kept without blob");
            model
        }
    };

    info!(
        scope = %model.machine_id,
        energy_source = %model.energy_source,
        version = model.model_version,
        r_squared = model.r_squared,
        samples = model.training_samples,
        active = model.is_active,
        "baseline trained"
    );

    Ok(TrainOutcome {
        meets_quality_threshold: meets_quality,
        granularity: table.granularity,
        correlations,
        dropped_features: table.dropped,
        rejected_features: rejected,
        model,
    })
}

/// Train under a training-job record with bus events.
///
/// Enforces the one-running-job rule per (machine, model_type): a concurrent
/// request gets `Conflict`. Publishes `training.started`, a coarse progress
/// tick, and `training.completed` for both outcomes.
pub async fn run_training_job(
    ctx: &CoreContext,
    params: TrainParams,
) -> Result<TrainOutcome, CoreError> {
    let scope_key = params.scope.key().to_string();
    let job = training_jobs::start_job(&ctx.pool, &scope_key, ModelType::Baseline)
        .await?
        .ok_or_else(|| {
            CoreError::Conflict(format!(
                "baseline training already in progress for '{scope_key}'"
            ))
        })?;

    ctx.publisher
        .publish(&BusEvent::TrainingStarted {
            job_id: job.id,
            machine_id: scope_key.clone(),
            model_type: ModelType::Baseline,
            published_at: Utc::now(),
        })
        .await;

    ctx.publisher
        .publish(&BusEvent::TrainingProgress {
            job_id: job.id,
            progress_pct: 50.0,
            status: JobStatus::Running,
            message: Some("fitting regression".to_string()),
            published_at: Utc::now(),
        })
        .await;
    training_jobs::update_progress(&ctx.pool, job.id, 50.0).await?;

    match train(&ctx.pool, &ctx.config.model_dir, &params).await {
        Ok(outcome) => {
            training_jobs::complete_job(
                &ctx.pool,
                job.id,
                JobStatus::Succeeded,
                None,
                Some(outcome.model.id),
            )
            .await?;
            ctx.publisher
                .publish(&BusEvent::TrainingCompleted {
                    job_id: job.id,
                    status: JobStatus::Succeeded,
                    metrics: Some(TrainingMetrics {
                        model_version: outcome.model.model_version,
                        r_squared: outcome.model.r_squared,
                        rmse: outcome.model.rmse,
                        mae: outcome.model.mae,
                    }),
                    error_message: None,
                    published_at: Utc::now(),
                })
                .await;
            Ok(outcome)
        }
        Err(e) => {
            training_jobs::complete_job(
                &ctx.pool,
                job.id,
                JobStatus::Failed,
                Some(&e.to_string()),
                None,
            )
            .await?;
            ctx.publisher
                .publish(&BusEvent::TrainingCompleted {
                    job_id: job.id,
                    status: JobStatus::Failed,
                    metrics: None,
                    error_message: Some(e.to_string()),
                    published_at: Utc::now(),
                })
                .await;
            Err(e)
        }
    }
}

// ============================================================================
// Prediction
// ============================================================================

/// Point prediction for one feature vector.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct Prediction {
    pub predicted_energy_kwh: f64,
    pub model_version: i32,
    pub message: String,
}

/// Load the active model or fail `NotTrained`.
pub async fn require_active_model(
    pool: &PgPool,
    machine_id: &str,
    energy_source: &str,
) -> Result<BaselineModel, CoreError> {
    baselines::active_model(pool, machine_id, energy_source)
        .await?
        .ok_or_else(|| CoreError::NotTrained {
            machine_id: machine_id.to_string(),
            energy_source: energy_source.to_string(),
        })
}

/// Predict energy for an explicit feature vector (keyed by feature name).
pub async fn predict_vector(
    pool: &PgPool,
    machine_id: &str,
    energy_source: &str,
    feature_values: &HashMap<String, f64>,
) -> Result<Prediction, CoreError> {
    let model = require_active_model(pool, machine_id, energy_source).await?;

    let missing: Vec<&str> = model
        .features
        .iter()
        .filter(|k| !feature_values.contains_key(*k))
        .map(String::as_str)
        .collect();
    if !missing.is_empty() {
        return Err(CoreError::BadRequest(format!(
            "missing required features: {}",
            missing.join(", ")
        )));
    }

    let x: Vec<f64> = model
        .features
        .iter()
        .map(|k| feature_values[k])
        .collect();
    let predicted = model.predict(&x);

    Ok(Prediction {
        predicted_energy_kwh: predicted,
        model_version: model.model_version,
        message: format!(
            "predicted {:.2} kWh using baseline v{} ({} features)",
            predicted,
            model.model_version,
            model.features.len()
        ),
    })
}

/// One bucket of a range prediction.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct PredictionPoint {
    pub bucket: DateTime<Utc>,
    pub actual_energy_kwh: f64,
    pub predicted_energy_kwh: f64,
}

/// Bucket-aligned predictions over a window.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct PredictionSeries {
    pub machine_id: String,
    pub energy_source: String,
    pub model_version: i32,
    pub granularity: Granularity,
    pub points: Vec<PredictionPoint>,
}

/// Predict over a time range by rebuilding the model's feature vectors.
pub async fn predict_range(
    pool: &PgPool,
    machine_id: &str,
    energy_source: &str,
    range: &TimeRange,
) -> Result<PredictionSeries, CoreError> {
    let model = require_active_model(pool, machine_id, energy_source).await?;
    let table = model_feature_table(pool, &model, range).await?;

    let (buckets, matrix, target) = table.complete_rows(&model.features.0);
    let points = buckets
        .into_iter()
        .zip(matrix.iter())
        .zip(target.iter())
        .map(|((bucket, row), &actual)| PredictionPoint {
            bucket,
            actual_energy_kwh: actual,
            predicted_energy_kwh: model.predict(row),
        })
        .collect();

    Ok(PredictionSeries {
        machine_id: machine_id.to_string(),
        energy_source: energy_source.to_string(),
        model_version: model.model_version,
        granularity: table.granularity,
        points,
    })
}

// ============================================================================
// Deviation
// ============================================================================

/// One bucket of actual vs. predicted.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct DeviationBucket {
    pub bucket: DateTime<Utc>,
    pub actual: f64,
    pub predicted: f64,
    pub delta: f64,
    pub delta_percent: f64,
    pub severity: AnomalySeverity,
}

/// Aggregates across the deviation window.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct DeviationSummary {
    pub total_actual: f64,
    pub total_predicted: f64,
    pub avg_delta: f64,
    pub max_abs_delta: f64,
    /// Buckets at warning severity or above.
    pub anomaly_count: usize,
}

/// Per-bucket deviation report against the active baseline.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct DeviationReport {
    pub machine_id: String,
    pub energy_source: String,
    pub model_version: i32,
    pub granularity: Granularity,
    pub residual_std: f64,
    pub buckets: Vec<DeviationBucket>,
    pub summary: DeviationSummary,
}

/// Compute per-bucket deviation of actuals from the active baseline.
pub async fn deviation(
    pool: &PgPool,
    machine_id: &str,
    energy_source: &str,
    range: &TimeRange,
) -> Result<DeviationReport, CoreError> {
    let model = require_active_model(pool, machine_id, energy_source).await?;
    let table = model_feature_table(pool, &model, range).await?;

    let sigma = model.residual_std;
    let (bucket_times, matrix, target) = table.complete_rows(&model.features.0);

    let mut buckets = Vec::with_capacity(bucket_times.len());
    let mut total_actual = 0.0;
    let mut total_predicted = 0.0;
    let mut delta_sum = 0.0;
    let mut max_abs_delta: f64 = 0.0;
    let mut anomaly_count = 0;

    for ((bucket, row), &actual) in bucket_times.into_iter().zip(matrix.iter()).zip(target.iter())
    {
        let predicted = model.predict(row);
        let delta = actual - predicted;
        let severity = AnomalySeverity::from_deviation(delta.abs(), sigma);
        if severity >= AnomalySeverity::Warning {
            anomaly_count += 1;
        }

        total_actual += actual;
        total_predicted += predicted;
        delta_sum += delta;
        max_abs_delta = max_abs_delta.max(delta.abs());

        buckets.push(DeviationBucket {
            bucket,
            actual,
            predicted,
            delta,
            delta_percent: if predicted.abs() < f64::EPSILON {
                0.0
            } else {
                delta / predicted.abs() * 100.0
            },
            severity,
        });
    }

    let n = buckets.len().max(1) as f64;
    Ok(DeviationReport {
        machine_id: machine_id.to_string(),
        energy_source: energy_source.to_string(),
        model_version: model.model_version,
        granularity: table.granularity,
        residual_std: sigma,
        summary: DeviationSummary {
            total_actual,
            total_predicted,
            avg_delta: delta_sum / n,
            max_abs_delta,
            anomaly_count,
        },
        buckets,
    })
}

/// Feature table for evaluating an existing model over a window.
async fn model_feature_table(
    pool: &PgPool,
    model: &BaselineModel,
    range: &TimeRange,
) -> Result<FeatureTable, CoreError> {
    let scope = ResolvedScope {
        key: model.machine_id.clone(),
        machine_ids: resolve_model_machines(pool, model).await?,
        energy_source: model.energy_source.clone(),
    };
    let table = features::feature_table(
        pool,
        &scope,
        range,
        &model.features.0,
        features::ADHOC_SAMPLE_FLOOR,
        Granularity::OneHour,
    )
    .await?;

    // A model feature that fell to the coverage filter would silently
    // misalign the coefficient vector; refuse instead.
    let missing: Vec<&str> = model
        .features
        .iter()
        .filter(|f| table.column(f).is_none())
        .map(String::as_str)
        .collect();
    if !missing.is_empty() {
        return Err(CoreError::InsufficientData(format!(
            "model features lack coverage in the evaluation window: {}",
            missing.join(", ")
        )));
    }
    Ok(table)
}

/// A model row keyed by a SEU id expands to its member machines; a machine
/// key evaluates against itself.
async fn resolve_model_machines(
    pool: &PgPool,
    model: &BaselineModel,
) -> Result<Vec<String>, CoreError> {
    if let Some(seu) = catalog::seu_by_id(pool, &model.machine_id).await? {
        return Ok(seu.machine_ids);
    }
    Ok(vec![model.machine_id.clone()])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_feature_list_means_auto() {
        assert_eq!(FeatureSpec::from_request(vec![]), FeatureSpec::Auto);
        assert_eq!(
            FeatureSpec::from_request(vec!["avg_outdoor_temp_c".to_string()]),
            FeatureSpec::Explicit(vec!["avg_outdoor_temp_c".to_string()])
        );
    }
}
