//! GET /health — service, dependencies, feature flags, scheduler summary

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use chrono::Utc;
use serde::Serialize;
use utoipa::ToSchema;

use crate::context::CoreContext;
use crate::scheduler::JobSnapshot;
use crate::store;

use super::super::ApiResult;

#[derive(Debug, Serialize, ToSchema)]
pub struct DependencyStatus {
    pub database: bool,
    pub event_bus: bool,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct FeatureFlags {
    pub websocket_enabled: bool,
    pub pubsub_enabled: bool,
    pub scheduler_enabled: bool,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    pub service: String,
    pub version: String,
    /// "ok" when every dependency is reachable, "degraded" otherwise.
    pub status: String,
    pub uptime_seconds: i64,
    pub dependencies: DependencyStatus,
    pub features: FeatureFlags,
    pub websocket_connections: usize,
    pub scheduler: Vec<JobSnapshot>,
}

/// GET /api/v1/health
#[utoipa::path(get, path = "/api/v1/health",
    responses((status = 200, description = "Service health and dependency status", body = HealthResponse)))]
pub async fn get_health(State(ctx): State<Arc<CoreContext>>) -> ApiResult<HealthResponse> {
    let database = store::health_check(&ctx.pool).await;
    let event_bus = ctx.publisher.is_connected();

    let status = if database { "ok" } else { "degraded" };

    Ok(Json(HealthResponse {
        service: "enms-analytics".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        status: status.to_string(),
        uptime_seconds: (Utc::now() - ctx.started_at).num_seconds(),
        dependencies: DependencyStatus {
            database,
            event_bus,
        },
        features: FeatureFlags {
            websocket_enabled: ctx.config.websocket.enabled,
            pubsub_enabled: ctx.config.bus.pubsub_enabled,
            scheduler_enabled: ctx.config.scheduler_enabled,
        },
        websocket_connections: ctx.fanout.connection_count(),
        scheduler: ctx.scheduler.snapshots().await,
    }))
}
