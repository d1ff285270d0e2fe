//! Scheduler control endpoints

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::Json;
use serde::Serialize;
use utoipa::ToSchema;

use crate::context::CoreContext;
use crate::scheduler::{self, JobSnapshot};

use super::super::ApiResult;

#[derive(Debug, Serialize, ToSchema)]
pub struct SchedulerStatusResponse {
    pub enabled: bool,
    pub jobs: Vec<JobSnapshot>,
}

/// GET /api/v1/scheduler/status
#[utoipa::path(get, path = "/api/v1/scheduler/status",
    responses((status = 200, description = "Per-job scheduler state", body = SchedulerStatusResponse)))]
pub async fn status(State(ctx): State<Arc<CoreContext>>) -> ApiResult<SchedulerStatusResponse> {
    Ok(Json(SchedulerStatusResponse {
        enabled: ctx.scheduler.enabled,
        jobs: ctx.scheduler.snapshots().await,
    }))
}

/// POST /api/v1/scheduler/trigger/{job_id}
///
/// Runs the job immediately under the same single-fire guard the cron
/// triggers use; 409 when an instance is already running.
#[utoipa::path(post, path = "/api/v1/scheduler/trigger/{job_id}",
    params(("job_id" = String, Path, description = "baseline_retrain | anomaly_detect | kpi_calculate | training_cleanup")),
    responses(
        (status = 200, description = "Job started", body = JobSnapshot),
        (status = 404, description = "Unknown job"),
        (status = 409, description = "Job already running")
    ))]
pub async fn trigger(
    State(ctx): State<Arc<CoreContext>>,
    Path(job_id): Path<String>,
) -> ApiResult<JobSnapshot> {
    let snapshot = scheduler::trigger(&ctx, &job_id).await?;
    Ok(Json(snapshot))
}
