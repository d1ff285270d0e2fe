//! REST + WebSocket surface using Axum
//!
//! Handler flow: validate → rate-limit (by endpoint category) → engines →
//! shaped JSON. All timestamps are ISO-8601 UTC, all ids opaque strings and
//! every numeric field a plain IEEE-754 double. Error bodies follow the
//! wire contract: `{detail: ...}` for request/engine errors, `{error: ...}`
//! with `retry_after` for rate/connection pushback.

pub mod handlers;
pub mod middleware;
pub mod openapi;

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;
use utoipa_scalar::{Scalar, Servable};

use crate::context::CoreContext;
use crate::error::CoreError;
use handlers::{anomaly, baseline, health, kpi, machines, ovos, scheduler, stats, timeseries};

// ============================================================================
// Error Mapping
// ============================================================================

/// Wrapper translating engine errors into wire responses.
#[derive(Debug)]
pub struct ApiError(pub CoreError);

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        Self(err)
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        Self(CoreError::from(err))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.0.status();
        let body = match &self.0 {
            CoreError::RateLimited {
                category,
                limit,
                retry_after,
            } => serde_json::json!({
                "error": "rate_limit_exceeded",
                "message": self.0.to_string(),
                "category": category,
                "limit": limit,
                "retry_after": retry_after,
            }),
            CoreError::TooManyConnections { retry_after } => serde_json::json!({
                "error": "too_many_connections",
                "message": self.0.to_string(),
                "retry_after": retry_after,
            }),
            CoreError::Internal(detail) => {
                // the detail goes to the log, not the wire
                tracing::error!(detail = %detail, "internal error");
                serde_json::json!({ "detail": "internal error" })
            }
            other => serde_json::json!({ "detail": other.to_string() }),
        };
        (status, Json(body)).into_response()
    }
}

/// Convenience alias for handler signatures.
pub type ApiResult<T> = Result<Json<T>, ApiError>;

// ============================================================================
// Router
// ============================================================================

/// Build the complete application router.
pub fn create_app(ctx: Arc<CoreContext>) -> Router {
    let api = Router::new()
        .route("/health", get(health::get_health))
        // Catalog
        .route("/machines", get(machines::list_machines))
        .route("/machines/{id}", get(machines::get_machine))
        .route("/machines/status/{name}", get(machines::machine_status))
        .route("/seus", get(machines::list_seus))
        .route("/energy-sources", get(machines::list_energy_sources))
        // Time series
        .route("/timeseries/latest/{machine_id}", get(timeseries::latest))
        .route(
            "/timeseries/multi-machine/energy",
            get(timeseries::multi_machine_energy),
        )
        .route("/timeseries/{metric}", get(timeseries::series))
        // KPIs
        .route("/kpi/all", get(kpi::all_kpis))
        .route("/kpi/{name}", get(kpi::single_kpi))
        // Baselines
        .route("/baseline/models", get(baseline::list_models))
        .route("/baseline/model/{model_id}", get(baseline::get_model))
        .route("/baseline/train", post(baseline::train))
        .route("/baseline/predict", post(baseline::predict))
        .route("/baseline/deviation", get(baseline::deviation))
        .route("/baseline/performance", get(baseline::performance))
        // Anomalies
        .route("/anomaly/recent", get(anomaly::recent))
        .route("/anomaly/active", get(anomaly::active))
        .route("/anomaly/detect", post(anomaly::detect))
        .route("/anomaly/create", post(anomaly::create))
        .route("/anomaly/{id}/resolve", put(anomaly::resolve))
        // Voice assistant surface
        .route("/ovos/train-baseline", post(ovos::train_baseline))
        .route("/ovos/available-features", get(ovos::available_features))
        // Scheduler control
        .route("/scheduler/status", get(scheduler::status))
        .route("/scheduler/trigger/{job_id}", post(scheduler::trigger))
        // Throttle introspection
        .route("/stats/connections", get(stats::connections));

    Router::new()
        .nest("/api/v1", api)
        // WebSocket fan-out topics
        .route("/ws/{topic}", get(crate::ws::ws_topic_handler))
        // OpenAPI document + interactive docs
        .route("/openapi.json", get(serve_openapi))
        .merge(Scalar::with_url("/docs", openapi::ApiDoc::openapi()))
        // Middleware: throttle outermost, then the request limiter
        .layer(axum::middleware::from_fn_with_state(
            ctx.clone(),
            middleware::rate_limit,
        ))
        .layer(axum::middleware::from_fn_with_state(
            ctx.clone(),
            middleware::connection_throttle,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .with_state(ctx)
}

/// GET /openapi.json
async fn serve_openapi(State(_ctx): State<Arc<CoreContext>>) -> impl IntoResponse {
    (StatusCode::OK, Json(openapi::ApiDoc::openapi()))
}
