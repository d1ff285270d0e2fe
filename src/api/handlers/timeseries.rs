//! Time-series endpoints over the continuous aggregates

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::context::CoreContext;
use crate::error::CoreError;
use crate::kpi::TariffSchedule;
use crate::store::timeseries::{self, LatestReading};
use crate::types::{Granularity, TimeRange};

use super::super::ApiResult;

/// Default trailing window for series reads.
const DEFAULT_WINDOW_HOURS: i64 = 24;

#[derive(Debug, Deserialize)]
pub struct SeriesQuery {
    pub machine_id: String,
    pub energy_source: Option<String>,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    /// 1min | 15min | 1hour | 1day; default 1hour.
    pub interval: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct SeriesPoint {
    pub timestamp: DateTime<Utc>,
    pub value: Option<f64>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct SeriesResponse {
    pub machine_id: String,
    pub metric: String,
    pub unit: String,
    pub interval: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub points: Vec<SeriesPoint>,
}

/// GET /api/v1/timeseries/{metric}
///
/// `metric` ∈ energy | power | sec | cost | carbon | load-factor.
#[utoipa::path(get, path = "/api/v1/timeseries/{metric}",
    params(
        ("metric" = String, Path, description = "energy | power | sec | cost | carbon | load-factor"),
        ("machine_id" = String, Query, description = "Machine id"),
        ("start_time" = Option<String>, Query, description = "ISO-8601 start (default: 24h ago)"),
        ("end_time" = Option<String>, Query, description = "ISO-8601 end (default: now)"),
        ("interval" = Option<String>, Query, description = "1min | 15min | 1hour | 1day")
    ),
    responses(
        (status = 200, description = "Bucketed series", body = SeriesResponse),
        (status = 400, description = "Unknown metric or malformed window")
    ))]
pub async fn series(
    State(ctx): State<Arc<CoreContext>>,
    Path(metric): Path<String>,
    Query(query): Query<SeriesQuery>,
) -> ApiResult<SeriesResponse> {
    let machine = super::resolve_machine(&ctx.pool, &query.machine_id).await?;
    let range = super::range_from_query(
        query.start_time.as_deref(),
        query.end_time.as_deref(),
        DEFAULT_WINDOW_HOURS,
    )?;
    let granularity = match query.interval.as_deref() {
        Some(raw) => Granularity::parse(raw)?,
        None => Granularity::OneHour,
    };
    let energy_source = query.energy_source.as_deref().unwrap_or("electricity");

    let machine_ids = vec![machine.id.clone()];
    let (unit, points) = metric_series(
        &ctx,
        &machine_ids,
        energy_source,
        &range,
        granularity,
        &metric,
    )
    .await?;

    Ok(Json(SeriesResponse {
        machine_id: machine.id,
        metric,
        unit: unit.to_string(),
        interval: granularity.to_string(),
        start_time: range.start,
        end_time: range.end,
        points,
    }))
}

/// Shared series assembly for the metric endpoints.
async fn metric_series(
    ctx: &CoreContext,
    machine_ids: &[String],
    energy_source: &str,
    range: &TimeRange,
    granularity: Granularity,
    metric: &str,
) -> Result<(&'static str, Vec<SeriesPoint>), CoreError> {
    let energy =
        timeseries::energy_series(&ctx.pool, machine_ids, energy_source, range, granularity)
            .await?;

    let tariff = TariffSchedule::from_config(&ctx.config.tariff);
    let carbon_factor = ctx.config.carbon_factor;

    let points: Vec<SeriesPoint> = match metric {
        "energy" => energy
            .iter()
            .map(|b| SeriesPoint {
                timestamp: b.bucket,
                value: b.total_energy_kwh,
            })
            .collect(),
        "power" => energy
            .iter()
            .map(|b| SeriesPoint {
                timestamp: b.bucket,
                value: b.avg_power_kw,
            })
            .collect(),
        "load-factor" => energy
            .iter()
            .map(|b| SeriesPoint {
                timestamp: b.bucket,
                value: match (b.avg_power_kw, b.max_power_kw) {
                    (Some(avg), Some(max)) if max > 0.0 => Some(avg / max),
                    _ => None,
                },
            })
            .collect(),
        "cost" => energy
            .iter()
            .map(|b| SeriesPoint {
                timestamp: b.bucket,
                value: b.total_energy_kwh.map(|e| e * tariff.rate_at(b.bucket)),
            })
            .collect(),
        "carbon" => energy
            .iter()
            .map(|b| SeriesPoint {
                timestamp: b.bucket,
                value: b.total_energy_kwh.map(|e| e * carbon_factor),
            })
            .collect(),
        "sec" => {
            let production =
                timeseries::production_series(&ctx.pool, machine_ids, range, granularity).await?;
            energy
                .iter()
                .map(|b| {
                    let produced = production
                        .iter()
                        .find(|p| p.bucket == b.bucket)
                        .and_then(|p| p.total_count);
                    SeriesPoint {
                        timestamp: b.bucket,
                        value: match (b.total_energy_kwh, produced) {
                            (Some(e), Some(p)) if p > 0.0 => Some(e / p),
                            _ => None,
                        },
                    }
                })
                .collect()
        }
        other => {
            return Err(CoreError::BadRequest(format!(
                "unknown metric '{other}' (expected energy, power, sec, cost, carbon or load-factor)"
            )))
        }
    };

    let unit = match metric {
        "energy" => "kWh",
        "power" => "kW",
        "sec" => "kWh/unit",
        "cost" => "currency",
        "carbon" => "kg_co2",
        _ => "ratio",
    };

    Ok((unit, points))
}

/// GET /api/v1/timeseries/latest/{machine_id}
#[utoipa::path(get, path = "/api/v1/timeseries/latest/{machine_id}",
    params(("machine_id" = String, Path, description = "Machine id")),
    responses(
        (status = 200, description = "Most recent raw reading", body = LatestReading),
        (status = 404, description = "Unknown machine or no readings")
    ))]
pub async fn latest(
    State(ctx): State<Arc<CoreContext>>,
    Path(machine_id): Path<String>,
) -> ApiResult<LatestReading> {
    let machine = super::resolve_machine(&ctx.pool, &machine_id).await?;
    let reading = timeseries::latest_reading(&ctx.pool, &machine.id)
        .await?
        .ok_or_else(|| {
            CoreError::NotFound(format!("no readings recorded for machine '{machine_id}'"))
        })?;
    Ok(Json(reading))
}

#[derive(Debug, Deserialize)]
pub struct MultiMachineQuery {
    /// Comma-separated machine ids.
    pub machine_ids: String,
    pub energy_source: Option<String>,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub interval: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct MultiMachineSeries {
    pub machine_id: String,
    pub points: Vec<SeriesPoint>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct MultiMachineResponse {
    pub metric: String,
    pub unit: String,
    pub interval: String,
    pub series: Vec<MultiMachineSeries>,
}

/// GET /api/v1/timeseries/multi-machine/energy
#[utoipa::path(get, path = "/api/v1/timeseries/multi-machine/energy",
    params(
        ("machine_ids" = String, Query, description = "Comma-separated machine ids"),
        ("start_time" = Option<String>, Query, description = "ISO-8601 start"),
        ("end_time" = Option<String>, Query, description = "ISO-8601 end"),
        ("interval" = Option<String>, Query, description = "1min | 15min | 1hour | 1day")
    ),
    responses((status = 200, description = "Aligned energy series per machine", body = MultiMachineResponse)))]
pub async fn multi_machine_energy(
    State(ctx): State<Arc<CoreContext>>,
    Query(query): Query<MultiMachineQuery>,
) -> ApiResult<MultiMachineResponse> {
    let ids: Vec<String> = query
        .machine_ids
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    if ids.is_empty() {
        return Err(CoreError::BadRequest("machine_ids must not be empty".to_string()).into());
    }

    let range = super::range_from_query(
        query.start_time.as_deref(),
        query.end_time.as_deref(),
        DEFAULT_WINDOW_HOURS,
    )?;
    let granularity = match query.interval.as_deref() {
        Some(raw) => Granularity::parse(raw)?,
        None => Granularity::OneHour,
    };
    let energy_source = query.energy_source.as_deref().unwrap_or("electricity");

    let mut series = Vec::with_capacity(ids.len());
    for id in ids {
        let machine = super::resolve_machine(&ctx.pool, &id).await?;
        let machine_ids = vec![machine.id.clone()];
        let buckets = timeseries::energy_series(
            &ctx.pool,
            &machine_ids,
            energy_source,
            &range,
            granularity,
        )
        .await?;
        series.push(MultiMachineSeries {
            machine_id: machine.id,
            points: buckets
                .iter()
                .map(|b| SeriesPoint {
                    timestamp: b.bucket,
                    value: b.total_energy_kwh,
                })
                .collect(),
        });
    }

    Ok(Json(MultiMachineResponse {
        metric: "energy".to_string(),
        unit: "kWh".to_string(),
        interval: granularity.to_string(),
        series,
    }))
}
