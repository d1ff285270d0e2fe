//! Catalog endpoints: machines, SEUs, energy sources

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::context::CoreContext;
use crate::error::CoreError;
use crate::store::anomalies::{self, RecentFilter};
use crate::store::{catalog, timeseries};
use crate::types::{EnergySource, Machine, Seu};

use super::super::ApiResult;

#[derive(Debug, Deserialize)]
pub struct MachineListQuery {
    /// When true, only active machines are returned.
    pub active: Option<bool>,
}

/// GET /api/v1/machines
#[utoipa::path(get, path = "/api/v1/machines",
    responses((status = 200, description = "All machines", body = Vec<Machine>)))]
pub async fn list_machines(
    State(ctx): State<Arc<CoreContext>>,
    Query(query): Query<MachineListQuery>,
) -> ApiResult<Vec<Machine>> {
    let machines = catalog::list_machines(&ctx.pool, query.active.unwrap_or(false)).await?;
    Ok(Json(machines))
}

/// GET /api/v1/machines/{id}
#[utoipa::path(get, path = "/api/v1/machines/{id}",
    params(("id" = String, Path, description = "Machine id")),
    responses(
        (status = 200, description = "The machine", body = Machine),
        (status = 404, description = "Unknown machine")
    ))]
pub async fn get_machine(
    State(ctx): State<Arc<CoreContext>>,
    Path(id): Path<String>,
) -> ApiResult<Machine> {
    let machine = catalog::machine_by_id(&ctx.pool, &id)
        .await?
        .ok_or_else(|| CoreError::NotFound(format!("machine '{id}' not found")))?;
    Ok(Json(machine))
}

#[derive(Debug, Serialize, ToSchema)]
pub struct MachineStatusResponse {
    pub machine: Machine,
    /// "online", "stale" or "offline" based on the latest reading's age
    /// relative to the machine's data interval.
    pub status: String,
    pub latest_reading: Option<timeseries::LatestReading>,
    pub open_anomalies: usize,
}

/// GET /api/v1/machines/status/{name}
#[utoipa::path(get, path = "/api/v1/machines/status/{name}",
    params(("name" = String, Path, description = "Machine name")),
    responses(
        (status = 200, description = "Liveness summary for the machine", body = MachineStatusResponse),
        (status = 404, description = "Unknown machine")
    ))]
pub async fn machine_status(
    State(ctx): State<Arc<CoreContext>>,
    Path(name): Path<String>,
) -> ApiResult<MachineStatusResponse> {
    let machine = super::resolve_machine(&ctx.pool, &name).await?;
    let latest = timeseries::latest_reading(&ctx.pool, &machine.id).await?;

    let status = match &latest {
        None => "offline",
        Some(reading) => {
            let age = (Utc::now() - reading.time).num_seconds();
            let interval = i64::from(machine.data_interval_seconds.max(1));
            if age <= interval * 2 {
                "online"
            } else if age <= interval * 10 {
                "stale"
            } else {
                "offline"
            }
        }
    };

    let open = anomalies::recent_anomalies(
        &ctx.pool,
        &RecentFilter {
            limit: 500,
            machine_id: Some(machine.id.clone()),
            ..RecentFilter::default()
        },
    )
    .await?
    .into_iter()
    .filter(|a| a.resolved_at.is_none())
    .count();

    Ok(Json(MachineStatusResponse {
        machine,
        status: status.to_string(),
        latest_reading: latest,
        open_anomalies: open,
    }))
}

#[derive(Debug, Deserialize)]
pub struct SeuListQuery {
    pub energy_source: Option<String>,
}

/// GET /api/v1/seus
#[utoipa::path(get, path = "/api/v1/seus",
    params(("energy_source" = Option<String>, Query, description = "Filter by energy source key")),
    responses((status = 200, description = "Significant energy uses", body = Vec<Seu>)))]
pub async fn list_seus(
    State(ctx): State<Arc<CoreContext>>,
    Query(query): Query<SeuListQuery>,
) -> ApiResult<Vec<Seu>> {
    let seus = catalog::list_seus(&ctx.pool, query.energy_source.as_deref()).await?;
    Ok(Json(seus))
}

/// GET /api/v1/energy-sources
#[utoipa::path(get, path = "/api/v1/energy-sources",
    responses((status = 200, description = "Configured energy sources", body = Vec<EnergySource>)))]
pub async fn list_energy_sources(
    State(ctx): State<Arc<CoreContext>>,
) -> ApiResult<Vec<EnergySource>> {
    let sources = catalog::list_energy_sources(&ctx.pool).await?;
    Ok(Json(sources))
}
