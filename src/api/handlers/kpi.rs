//! KPI endpoints: the batched suite and its individual views

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::context::CoreContext;
use crate::error::CoreError;
use crate::kpi::{self, TariffSchedule};
use crate::store::{catalog, kpi_cache};
use crate::types::{KpiSet, KpiValue, TimeRange};

use super::super::ApiResult;

/// Default trailing window for KPI reads.
const DEFAULT_WINDOW_HOURS: i64 = 24;

#[derive(Debug, Deserialize)]
pub struct KpiQuery {
    pub machine_id: String,
    pub energy_source: Option<String>,
    #[serde(alias = "start_time")]
    pub start: Option<String>,
    #[serde(alias = "end_time")]
    pub end: Option<String>,
}

/// Resolve scope + window and run the batched computation, consulting the
/// nightly cache for exact window hits first.
async fn compute(ctx: &CoreContext, query: &KpiQuery) -> Result<KpiSet, CoreError> {
    let machine = super::resolve_machine(&ctx.pool, &query.machine_id).await?;
    let range = super::range_from_query(
        query.start.as_deref(),
        query.end.as_deref(),
        DEFAULT_WINDOW_HOURS,
    )?;
    let energy_source = query.energy_source.as_deref().unwrap_or("electricity");

    // advisory cache: only exact (machine, window) hits count
    if let Ok(rows) = kpi_cache::cached_for(&ctx.pool, &machine.id, &range).await {
        if let Some(set) = kpi_set_from_cache(&machine.id, &range, &rows) {
            return Ok(set);
        }
    }

    let source = catalog::energy_source_by_key(&ctx.pool, energy_source).await?;
    let carbon_factor = source
        .and_then(|s| s.carbon_factor_per_unit)
        .unwrap_or(ctx.config.carbon_factor);

    let machine_ids = vec![machine.id.clone()];
    kpi::compute_all(
        &ctx.pool,
        &machine.id,
        &machine_ids,
        energy_source,
        &range,
        &TariffSchedule::from_config(&ctx.config.tariff),
        carbon_factor,
    )
    .await
}

/// Rebuild a `KpiSet` from cache rows; `None` unless all five are present.
fn kpi_set_from_cache(
    machine_id: &str,
    range: &TimeRange,
    rows: &[crate::types::KpiCacheRow],
) -> Option<KpiSet> {
    let find = |name: &str| -> Option<KpiValue> {
        rows.iter().find(|r| r.kpi_name == name).map(|r| KpiValue {
            value: r.value,
            unit: r.unit.clone(),
            reason: None,
        })
    };
    Some(KpiSet {
        machine_id: machine_id.to_string(),
        period_start: range.start,
        period_end: range.end,
        sec: find("sec")?,
        peak_demand: find("peak_demand")?,
        load_factor: find("load_factor")?,
        energy_cost: find("energy_cost")?,
        carbon: find("carbon")?,
        computed_at: rows.first().map_or_else(Utc::now, |r| r.computed_at),
    })
}

/// GET /api/v1/kpi/all
#[utoipa::path(get, path = "/api/v1/kpi/all",
    params(
        ("machine_id" = String, Query, description = "Machine id or name"),
        ("start" = Option<String>, Query, description = "ISO-8601 start (default: 24h ago)"),
        ("end" = Option<String>, Query, description = "ISO-8601 end (default: now)")
    ),
    responses((status = 200, description = "All five KPIs for the window", body = KpiSet)))]
pub async fn all_kpis(
    State(ctx): State<Arc<CoreContext>>,
    Query(query): Query<KpiQuery>,
) -> ApiResult<KpiSet> {
    Ok(Json(compute(&ctx, &query).await?))
}

#[derive(Debug, Serialize, ToSchema)]
pub struct SingleKpiResponse {
    pub machine_id: String,
    pub kpi: String,
    pub value: Option<f64>,
    pub unit: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub period_start: chrono::DateTime<Utc>,
    pub period_end: chrono::DateTime<Utc>,
}

/// GET /api/v1/kpi/{name}
///
/// `name` ∈ sec | peak-demand | load-factor | energy-cost | carbon.
/// Reuses the batched computation and picks one field.
#[utoipa::path(get, path = "/api/v1/kpi/{name}",
    params(
        ("name" = String, Path, description = "sec | peak-demand | load-factor | energy-cost | carbon"),
        ("machine_id" = String, Query, description = "Machine id or name"),
        ("start" = Option<String>, Query, description = "ISO-8601 start"),
        ("end" = Option<String>, Query, description = "ISO-8601 end")
    ),
    responses(
        (status = 200, description = "One KPI for the window", body = SingleKpiResponse),
        (status = 400, description = "Unknown KPI name")
    ))]
pub async fn single_kpi(
    State(ctx): State<Arc<CoreContext>>,
    Path(name): Path<String>,
    Query(query): Query<KpiQuery>,
) -> ApiResult<SingleKpiResponse> {
    let set = compute(&ctx, &query).await?;
    let kpi = match name.as_str() {
        "sec" => &set.sec,
        "peak-demand" => &set.peak_demand,
        "load-factor" => &set.load_factor,
        "energy-cost" => &set.energy_cost,
        "carbon" => &set.carbon,
        other => {
            return Err(CoreError::BadRequest(format!(
                "unknown KPI '{other}' (expected sec, peak-demand, load-factor, energy-cost or carbon)"
            ))
            .into())
        }
    };

    Ok(Json(SingleKpiResponse {
        machine_id: set.machine_id.clone(),
        kpi: name,
        value: kpi.value,
        unit: kpi.unit.clone(),
        reason: kpi.reason.clone(),
        period_start: set.period_start,
        period_end: set.period_end,
    }))
}
