//! Baseline endpoints: training, prediction, deviation, model catalog

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::Json;
use chrono::{Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::baseline::{
    self, DeviationReport, FeatureSpec, Prediction, PredictionSeries, TrainOutcome, TrainParams,
};
use crate::context::CoreContext;
use crate::error::CoreError;
use crate::store::baselines;
use crate::types::{BaselineModel, Scope, TimeRange};

use super::super::ApiResult;

// ============================================================================
// Model Catalog
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ModelListQuery {
    pub machine_id: Option<String>,
}

/// GET /api/v1/baseline/models
#[utoipa::path(get, path = "/api/v1/baseline/models",
    params(("machine_id" = Option<String>, Query, description = "Restrict to one machine")),
    responses((status = 200, description = "Persisted baseline models, newest first", body = Vec<BaselineModel>)))]
pub async fn list_models(
    State(ctx): State<Arc<CoreContext>>,
    Query(query): Query<ModelListQuery>,
) -> ApiResult<Vec<BaselineModel>> {
    let models = baselines::list_models(&ctx.pool, query.machine_id.as_deref()).await?;
    Ok(Json(models))
}

/// GET /api/v1/baseline/model/{model_id}
#[utoipa::path(get, path = "/api/v1/baseline/model/{model_id}",
    params(("model_id" = String, Path, description = "Model UUID")),
    responses(
        (status = 200, description = "The model", body = BaselineModel),
        (status = 404, description = "Unknown model")
    ))]
pub async fn get_model(
    State(ctx): State<Arc<CoreContext>>,
    Path(model_id): Path<String>,
) -> ApiResult<BaselineModel> {
    let id = Uuid::parse_str(&model_id)
        .map_err(|_| CoreError::BadRequest(format!("'{model_id}' is not a valid model id")))?;
    let model = baselines::model_by_id(&ctx.pool, id)
        .await?
        .ok_or_else(|| CoreError::NotFound(format!("model '{model_id}' not found")))?;
    Ok(Json(model))
}

// ============================================================================
// Training
// ============================================================================

#[derive(Debug, Deserialize, ToSchema)]
pub struct TrainRequest {
    /// Machine id or name.
    pub machine: String,
    pub energy_source: String,
    pub start_time: String,
    pub end_time: String,
    /// Empty list means automatic feature selection.
    #[serde(default)]
    pub features: Vec<String>,
    /// Activate the model on success. Defaults to true.
    #[serde(default = "default_true")]
    pub activate: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Serialize, ToSchema)]
pub struct TrainResponse {
    pub message: String,
    #[serde(flatten)]
    pub outcome: TrainOutcome,
}

/// POST /api/v1/baseline/train
#[utoipa::path(post, path = "/api/v1/baseline/train",
    request_body = TrainRequest,
    responses(
        (status = 200, description = "Model trained and persisted", body = TrainResponse),
        (status = 409, description = "Training already running for this machine"),
        (status = 422, description = "Window cannot satisfy the sample floor")
    ))]
pub async fn train(
    State(ctx): State<Arc<CoreContext>>,
    Json(request): Json<TrainRequest>,
) -> ApiResult<TrainResponse> {
    let machine = super::resolve_machine(&ctx.pool, &request.machine).await?;
    let range = TimeRange::new(
        super::parse_timestamp(&request.start_time, "start_time")?,
        super::parse_timestamp(&request.end_time, "end_time")?,
    )?;

    let outcome = baseline::run_training_job(
        &ctx,
        TrainParams {
            scope: Scope::Machine {
                machine_id: machine.id,
            },
            energy_source: Some(request.energy_source),
            range,
            features: FeatureSpec::from_request(request.features),
            activate: request.activate,
        },
    )
    .await?;

    let message = if outcome.meets_quality_threshold {
        format!(
            "baseline v{} trained with R² = {:.3} over {} samples",
            outcome.model.model_version, outcome.model.r_squared, outcome.model.training_samples
        )
    } else {
        format!(
            "baseline v{} trained but below the quality gate (R² = {:.3}); inspect before relying on it",
            outcome.model.model_version, outcome.model.r_squared
        )
    };

    Ok(Json(TrainResponse { message, outcome }))
}

// ============================================================================
// Prediction
// ============================================================================

#[derive(Debug, Deserialize, ToSchema)]
pub struct PredictRequest {
    /// Machine id or name.
    pub machine: String,
    pub energy_source: String,
    /// Explicit feature vector; mutually exclusive with the window fields.
    pub features: Option<HashMap<String, f64>>,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(untagged)]
pub enum PredictResponse {
    Point(Prediction),
    Series(PredictionSeries),
}

/// POST /api/v1/baseline/predict
#[utoipa::path(post, path = "/api/v1/baseline/predict",
    request_body = PredictRequest,
    responses(
        (status = 200, description = "Prediction from the active model"),
        (status = 400, description = "Missing required features"),
        (status = 404, description = "No active model for the scope")
    ))]
pub async fn predict(
    State(ctx): State<Arc<CoreContext>>,
    Json(request): Json<PredictRequest>,
) -> ApiResult<PredictResponse> {
    let machine = super::resolve_machine(&ctx.pool, &request.machine).await?;

    if let Some(features) = &request.features {
        let prediction =
            baseline::predict_vector(&ctx.pool, &machine.id, &request.energy_source, features)
                .await?;
        return Ok(Json(PredictResponse::Point(prediction)));
    }

    let (Some(start), Some(end)) = (&request.start_time, &request.end_time) else {
        return Err(CoreError::BadRequest(
            "provide either a features map or both start_time and end_time".to_string(),
        )
        .into());
    };
    let range = TimeRange::new(
        super::parse_timestamp(start, "start_time")?,
        super::parse_timestamp(end, "end_time")?,
    )?;
    let series =
        baseline::predict_range(&ctx.pool, &machine.id, &request.energy_source, &range).await?;
    Ok(Json(PredictResponse::Series(series)))
}

// ============================================================================
// Deviation & Performance
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct DeviationQuery {
    pub machine_id: String,
    pub energy_source: Option<String>,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
}

/// GET /api/v1/baseline/deviation
#[utoipa::path(get, path = "/api/v1/baseline/deviation",
    params(
        ("machine_id" = String, Query, description = "Machine id or name"),
        ("start_time" = Option<String>, Query, description = "ISO-8601 start (default: 24h ago)"),
        ("end_time" = Option<String>, Query, description = "ISO-8601 end (default: now)")
    ),
    responses(
        (status = 200, description = "Per-bucket actual vs. predicted", body = DeviationReport),
        (status = 404, description = "No active model for the scope")
    ))]
pub async fn deviation(
    State(ctx): State<Arc<CoreContext>>,
    Query(query): Query<DeviationQuery>,
) -> ApiResult<DeviationReport> {
    let machine = super::resolve_machine(&ctx.pool, &query.machine_id).await?;
    let range = super::range_from_query(query.start_time.as_deref(), query.end_time.as_deref(), 24)?;
    let energy_source = query.energy_source.as_deref().unwrap_or("electricity");

    let report = baseline::deviation(&ctx.pool, &machine.id, energy_source, &range).await?;
    Ok(Json(report))
}

#[derive(Debug, Deserialize)]
pub struct PerformanceQuery {
    pub machine_id: String,
    pub energy_source: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct PerformanceResponse {
    pub model: BaselineModel,
    /// Deviation summary over the trailing seven days.
    pub window_days: i64,
    pub summary: crate::baseline::DeviationSummary,
    pub bucket_count: usize,
}

/// GET /api/v1/baseline/performance
///
/// Residual behavior of the active model over the trailing week.
#[utoipa::path(get, path = "/api/v1/baseline/performance",
    params(("machine_id" = String, Query, description = "Machine id or name")),
    responses(
        (status = 200, description = "Active-model residual summary", body = PerformanceResponse),
        (status = 404, description = "No active model for the scope")
    ))]
pub async fn performance(
    State(ctx): State<Arc<CoreContext>>,
    Query(query): Query<PerformanceQuery>,
) -> ApiResult<PerformanceResponse> {
    let machine = super::resolve_machine(&ctx.pool, &query.machine_id).await?;
    let energy_source = query.energy_source.as_deref().unwrap_or("electricity");

    let model = baseline::require_active_model(&ctx.pool, &machine.id, energy_source).await?;
    let now = Utc::now();
    let range = TimeRange::new(now - ChronoDuration::days(7), now)?;
    let report = baseline::deviation(&ctx.pool, &machine.id, energy_source, &range).await?;

    Ok(Json(PerformanceResponse {
        model,
        window_days: 7,
        bucket_count: report.buckets.len(),
        summary: report.summary,
    }))
}
