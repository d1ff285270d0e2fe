//! Anomaly endpoints: listing, detection, manual creation, resolution

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::anomaly::{self, DetectParams, DetectionOutcome};
use crate::context::CoreContext;
use crate::error::CoreError;
use crate::store::anomalies::{self, NewAnomaly, RecentFilter};
use crate::types::{Anomaly, AnomalySeverity, AnomalyType, Scope};

use super::super::ApiResult;

// ============================================================================
// Listing
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct RecentQuery {
    pub limit: Option<i64>,
    pub severity: Option<String>,
    pub hours: Option<i64>,
    pub machine_id: Option<String>,
}

/// GET /api/v1/anomaly/recent
#[utoipa::path(get, path = "/api/v1/anomaly/recent",
    params(
        ("limit" = Option<i64>, Query, description = "Max rows (default 50, cap 500)"),
        ("severity" = Option<String>, Query, description = "info | warning | critical"),
        ("hours" = Option<i64>, Query, description = "Only anomalies newer than this many hours"),
        ("machine_id" = Option<String>, Query, description = "Restrict to one machine")
    ),
    responses((status = 200, description = "Recent anomalies, newest first", body = Vec<Anomaly>)))]
pub async fn recent(
    State(ctx): State<Arc<CoreContext>>,
    Query(query): Query<RecentQuery>,
) -> ApiResult<Vec<Anomaly>> {
    let severity = query
        .severity
        .as_deref()
        .map(AnomalySeverity::parse)
        .transpose()?;

    let rows = anomalies::recent_anomalies(
        &ctx.pool,
        &RecentFilter {
            limit: query.limit.unwrap_or(50),
            severity,
            hours: query.hours,
            machine_id: query.machine_id,
        },
    )
    .await?;
    Ok(Json(rows))
}

/// GET /api/v1/anomaly/active
#[utoipa::path(get, path = "/api/v1/anomaly/active",
    responses((status = 200, description = "Unresolved anomalies", body = Vec<Anomaly>)))]
pub async fn active(State(ctx): State<Arc<CoreContext>>) -> ApiResult<Vec<Anomaly>> {
    Ok(Json(anomalies::active_anomalies(&ctx.pool).await?))
}

// ============================================================================
// Detection
// ============================================================================

#[derive(Debug, Deserialize, ToSchema)]
pub struct DetectRequest {
    /// Machine id or name.
    pub machine: String,
    pub energy_source: Option<String>,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    /// Append the baseline-deviation feature when a model is active.
    #[serde(default = "default_true")]
    pub use_baseline: bool,
}

fn default_true() -> bool {
    true
}

/// POST /api/v1/anomaly/detect
#[utoipa::path(post, path = "/api/v1/anomaly/detect",
    request_body = DetectRequest,
    responses(
        (status = 200, description = "Sweep result with newly inserted anomalies", body = DetectionOutcome),
        (status = 422, description = "Too few usable buckets in the window")
    ))]
pub async fn detect(
    State(ctx): State<Arc<CoreContext>>,
    Json(request): Json<DetectRequest>,
) -> ApiResult<DetectionOutcome> {
    let machine = super::resolve_machine(&ctx.pool, &request.machine).await?;
    let range = super::range_from_query(
        request.start_time.as_deref(),
        request.end_time.as_deref(),
        24,
    )?;

    let outcome = anomaly::detect(
        &ctx,
        &DetectParams {
            scope: Scope::Machine {
                machine_id: machine.id,
            },
            energy_source: Some(
                request
                    .energy_source
                    .unwrap_or_else(|| "electricity".to_string()),
            ),
            range,
            use_baseline: request.use_baseline,
        },
    )
    .await?;
    Ok(Json(outcome))
}

// ============================================================================
// Manual Creation
// ============================================================================

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateRequest {
    pub machine_id: String,
    pub detected_at: String,
    pub anomaly_type: AnomalyType,
    pub severity: AnomalySeverity,
    pub metric: String,
    pub actual: f64,
    pub expected: f64,
    #[serde(default)]
    pub confidence: f64,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct CreateResponse {
    /// False when an identical (machine, time, type) row already existed.
    pub created: bool,
    pub anomaly: Option<Anomaly>,
}

/// POST /api/v1/anomaly/create — developer tool; same persist+publish path
/// as detection, including the (machine, detected_at, type) dedup.
#[utoipa::path(post, path = "/api/v1/anomaly/create",
    request_body = CreateRequest,
    responses((status = 200, description = "Insert outcome", body = CreateResponse)))]
pub async fn create(
    State(ctx): State<Arc<CoreContext>>,
    Json(request): Json<CreateRequest>,
) -> ApiResult<CreateResponse> {
    let machine = super::resolve_machine(&ctx.pool, &request.machine_id).await?;
    let detected_at = super::parse_timestamp(&request.detected_at, "detected_at")?;

    let inserted = anomaly::create_manual(
        &ctx,
        NewAnomaly {
            machine_id: machine.id,
            detected_at,
            anomaly_type: request.anomaly_type,
            severity: request.severity,
            metric: request.metric,
            actual: request.actual,
            expected: request.expected,
            confidence: request.confidence,
        },
    )
    .await?;

    Ok(Json(CreateResponse {
        created: inserted.is_some(),
        anomaly: inserted,
    }))
}

// ============================================================================
// Resolution
// ============================================================================

#[derive(Debug, Deserialize, ToSchema, Default)]
pub struct ResolveRequest {
    pub resolution_note: Option<String>,
}

/// PUT /api/v1/anomaly/{id}/resolve
///
/// Idempotent: resolving a resolved anomaly keeps the original timestamp
/// and note and still returns 200.
#[utoipa::path(put, path = "/api/v1/anomaly/{id}/resolve",
    params(("id" = String, Path, description = "Anomaly UUID")),
    request_body = ResolveRequest,
    responses(
        (status = 200, description = "The (now) resolved anomaly", body = Anomaly),
        (status = 404, description = "Unknown anomaly")
    ))]
pub async fn resolve(
    State(ctx): State<Arc<CoreContext>>,
    Path(id): Path<String>,
    body: Option<Json<ResolveRequest>>,
) -> ApiResult<Anomaly> {
    let id = Uuid::parse_str(&id)
        .map_err(|_| CoreError::BadRequest(format!("'{id}' is not a valid anomaly id")))?;
    let note = body.and_then(|Json(b)| b.resolution_note);

    let anomaly = anomalies::resolve_anomaly(&ctx.pool, id, note.as_deref())
        .await?
        .ok_or_else(|| CoreError::NotFound(format!("anomaly '{id}' not found")))?;
    Ok(Json(anomaly))
}
