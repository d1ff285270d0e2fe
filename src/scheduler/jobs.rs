//! Job bodies for the scheduler
//!
//! Every sweep catches and logs per-machine failures so one bad machine
//! cannot poison the rest of a run. Each body returns a short summary line
//! that lands in the job's `last_outcome`.

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use tracing::{debug, warn};

use crate::anomaly::{self, DetectParams};
use crate::baseline::{self, FeatureSpec, TrainParams};
use crate::context::CoreContext;
use crate::error::CoreError;
use crate::kpi::{self, TariffSchedule};
use crate::store::{baselines, catalog, kpi_cache, training_jobs};
use crate::types::{Scope, TimeRange, QUALITY_R_SQUARED_THRESHOLD};

/// Days of history a machine needs before the weekly retrain touches it.
const RETRAIN_MIN_HISTORY_DAYS: i64 = 14;

/// Window the weekly retrain trains over.
const RETRAIN_WINDOW_DAYS: i64 = 30;

/// Age after which a running training job counts as stuck.
const STUCK_JOB_MAX_AGE_SECS: i64 = 3600;

/// Dispatch by job id.
pub async fn execute(ctx: &Arc<CoreContext>, job_id: &str) -> Result<String, CoreError> {
    match job_id {
        "baseline_retrain" => baseline_retrain(ctx).await,
        "anomaly_detect" => anomaly_detect(ctx).await,
        "kpi_calculate" => kpi_calculate(ctx).await,
        "training_cleanup" => training_cleanup(ctx).await,
        other => Err(CoreError::NotFound(format!("unknown job '{other}'"))),
    }
}

/// Weekly retrain: every active machine × active energy source with enough
/// history gets a fresh model; activation only past the quality gate.
async fn baseline_retrain(ctx: &Arc<CoreContext>) -> Result<String, CoreError> {
    let machines = catalog::list_machines(&ctx.pool, true).await?;
    let sources = catalog::list_energy_sources(&ctx.pool).await?;
    let now = Utc::now();

    let mut trained = 0usize;
    let mut activated = 0usize;
    let mut skipped = 0usize;
    let mut failed = 0usize;

    for machine in &machines {
        let Some(earliest) = catalog::earliest_energy_reading(&ctx.pool, &machine.id).await? else {
            skipped += 1;
            continue;
        };
        if now - earliest < ChronoDuration::days(RETRAIN_MIN_HISTORY_DAYS) {
            skipped += 1;
            continue;
        }

        let start = (now - ChronoDuration::days(RETRAIN_WINDOW_DAYS)).max(earliest);
        let Ok(range) = TimeRange::new(start, now) else {
            skipped += 1;
            continue;
        };

        for source in sources.iter().filter(|s| s.active) {
            let params = TrainParams {
                scope: Scope::Machine {
                    machine_id: machine.id.clone(),
                },
                energy_source: Some(source.key.clone()),
                range,
                features: FeatureSpec::Auto,
                activate: false,
            };

            match baseline::run_training_job(ctx, params).await {
                Ok(outcome) => {
                    trained += 1;
                    if outcome.meets_quality_threshold {
                        if let Err(e) =
                            baselines::activate_model(&ctx.pool, outcome.model.id).await
                        {
                            warn!(machine = %machine.id, error = %e, "model activation failed");
                        } else {
                            activated += 1;
                        }
                    }
                }
                Err(CoreError::InsufficientData(reason)) => {
                    debug!(machine = %machine.id, source = %source.key, reason, "retrain skipped");
                    skipped += 1;
                }
                Err(CoreError::Conflict(_)) => skipped += 1,
                Err(e) => {
                    warn!(machine = %machine.id, source = %source.key, error = %e, "retrain failed");
                    failed += 1;
                }
            }
        }
    }

    Ok(format!(
        "{trained} trained, {activated} activated (R² ≥ {QUALITY_R_SQUARED_THRESHOLD}), {skipped} skipped, {failed} failed"
    ))
}

/// Hourly sweep over the last hour for every active machine.
async fn anomaly_detect(ctx: &Arc<CoreContext>) -> Result<String, CoreError> {
    let machines = catalog::list_machines(&ctx.pool, true).await?;
    let sources = catalog::list_energy_sources(&ctx.pool).await?;
    let now = Utc::now();
    // the sweep needs context around the fresh hour to score it
    let range = TimeRange::new(now - ChronoDuration::hours(24), now)?;

    let mut inserted = 0usize;
    let mut swept = 0usize;
    let mut failed = 0usize;

    for machine in &machines {
        for source in sources.iter().filter(|s| s.active) {
            let params = DetectParams {
                scope: Scope::Machine {
                    machine_id: machine.id.clone(),
                },
                energy_source: Some(source.key.clone()),
                range,
                use_baseline: true,
            };
            match anomaly::detect(ctx, &params).await {
                Ok(outcome) => {
                    swept += 1;
                    inserted += outcome.new_anomalies.len();
                }
                Err(CoreError::InsufficientData(_)) | Err(CoreError::NotFound(_)) => {}
                Err(e) => {
                    warn!(machine = %machine.id, source = %source.key, error = %e, "sweep failed");
                    failed += 1;
                }
            }
        }
    }

    Ok(format!(
        "{swept} sweeps, {inserted} new anomalies, {failed} failures"
    ))
}

/// Nightly KPI pre-compute for the previous UTC day.
async fn kpi_calculate(ctx: &Arc<CoreContext>) -> Result<String, CoreError> {
    let machines = catalog::list_machines(&ctx.pool, true).await?;
    let sources = catalog::list_energy_sources(&ctx.pool).await?;
    let tariff = TariffSchedule::from_config(&ctx.config.tariff);

    let today = Utc::now()
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc())
        .ok_or_else(|| CoreError::Internal("failed to construct midnight".to_string()))?;
    let range = TimeRange::new(today - ChronoDuration::days(1), today)?;

    // The KPI suite is kWh-denominated; electricity is the cached source.
    let Some(electricity) = sources.iter().find(|s| s.key == "electricity") else {
        return Ok("no electricity source configured; nothing cached".to_string());
    };
    let carbon_factor = electricity
        .carbon_factor_per_unit
        .unwrap_or(ctx.config.carbon_factor);

    let mut cached = 0usize;
    let mut failed = 0usize;
    for machine in &machines {
        let machine_ids = vec![machine.id.clone()];
        match kpi::compute_all(
            &ctx.pool,
            &machine.id,
            &machine_ids,
            &electricity.key,
            &range,
            &tariff,
            carbon_factor,
        )
        .await
        {
            Ok(set) => {
                if let Err(e) = kpi_cache::upsert_set(&ctx.pool, &set).await {
                    warn!(machine = %machine.id, error = %e, "KPI cache write failed");
                    failed += 1;
                } else {
                    cached += 1;
                }
            }
            Err(e) => {
                warn!(machine = %machine.id, error = %e, "KPI computation failed");
                failed += 1;
            }
        }
    }

    Ok(format!(
        "{cached} machines cached for {}, {failed} failures",
        range.start.date_naive()
    ))
}

/// Quarter-hourly reaper for training jobs stuck in `running`.
async fn training_cleanup(ctx: &Arc<CoreContext>) -> Result<String, CoreError> {
    let reaped = training_jobs::cleanup_stuck(&ctx.pool, STUCK_JOB_MAX_AGE_SECS).await?;
    Ok(format!("{reaped} stuck jobs marked failed"))
}
