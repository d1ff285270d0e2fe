//! Scheduler — cron-triggered periodic jobs with single-fire guards
//!
//! | Job | Trigger (UTC) | Deadline |
//! |-----|---------------|----------|
//! | `baseline_retrain` | Sunday 02:00 | 1 h |
//! | `anomaly_detect` | hourly at :05 | 10 min |
//! | `kpi_calculate` | daily 00:30 | 15 min |
//! | `training_cleanup` | every 15 min | 1 min |
//!
//! A job still running when its trigger fires again is skipped, not queued.
//! The manual trigger endpoint shares the same guard, so an operator cannot
//! stack a second instance either.

pub mod jobs;

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;
use serde::Serialize;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use utoipa::ToSchema;

use crate::context::CoreContext;
use crate::error::CoreError;

/// How often the loop checks for due jobs.
const POLL_INTERVAL: Duration = Duration::from_secs(30);

// ============================================================================
// Job Specs
// ============================================================================

/// Static description of one periodic job.
#[derive(Debug, Clone, Copy)]
pub struct JobSpec {
    pub id: &'static str,
    /// 6-field cron (sec min hour dom mon dow), UTC.
    pub cron: &'static str,
    pub deadline: Duration,
    pub description: &'static str,
}

/// The fixed job table.
pub const JOBS: [JobSpec; 4] = [
    JobSpec {
        id: "baseline_retrain",
        cron: "0 0 2 * * SUN",
        deadline: Duration::from_secs(3600),
        description: "weekly baseline retraining for active machines",
    },
    JobSpec {
        id: "anomaly_detect",
        cron: "0 5 * * * *",
        deadline: Duration::from_secs(600),
        description: "hourly anomaly sweep over the last hour",
    },
    JobSpec {
        id: "kpi_calculate",
        cron: "0 30 0 * * *",
        deadline: Duration::from_secs(900),
        description: "nightly KPI pre-compute for the previous day",
    },
    JobSpec {
        id: "training_cleanup",
        cron: "0 */15 * * * *",
        deadline: Duration::from_secs(60),
        description: "mark training jobs stuck for over an hour as failed",
    },
];

pub fn job_spec(id: &str) -> Option<&'static JobSpec> {
    JOBS.iter().find(|j| j.id == id)
}

// ============================================================================
// Runtime State
// ============================================================================

/// Mutable bookkeeping for one job.
#[derive(Default)]
struct JobState {
    running: AtomicBool,
    runs: AtomicU64,
    skips: AtomicU64,
    last_started: RwLock<Option<DateTime<Utc>>>,
    last_finished: RwLock<Option<DateTime<Utc>>>,
    last_outcome: RwLock<Option<String>>,
}

/// Shared scheduler bookkeeping, visible through `/scheduler/status`.
pub struct SchedulerState {
    pub enabled: bool,
    jobs: HashMap<&'static str, JobState>,
}

impl SchedulerState {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            jobs: JOBS.iter().map(|spec| (spec.id, JobState::default())).collect(),
        }
    }

    /// One job's status for introspection.
    pub async fn snapshot(&self, spec: &JobSpec) -> JobSnapshot {
        let state = &self.jobs[spec.id];
        JobSnapshot {
            id: spec.id.to_string(),
            description: spec.description.to_string(),
            cron: spec.cron.to_string(),
            enabled: self.enabled,
            running: state.running.load(Ordering::SeqCst),
            runs: state.runs.load(Ordering::SeqCst),
            skips: state.skips.load(Ordering::SeqCst),
            last_started: *state.last_started.read().await,
            last_finished: *state.last_finished.read().await,
            last_outcome: state.last_outcome.read().await.clone(),
            next_fire: next_fire(spec),
        }
    }

    pub async fn snapshots(&self) -> Vec<JobSnapshot> {
        let mut out = Vec::with_capacity(JOBS.len());
        for spec in &JOBS {
            out.push(self.snapshot(spec).await);
        }
        out
    }
}

/// Serializable job status.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct JobSnapshot {
    pub id: String,
    pub description: String,
    pub cron: String,
    pub enabled: bool,
    pub running: bool,
    pub runs: u64,
    pub skips: u64,
    pub last_started: Option<DateTime<Utc>>,
    pub last_finished: Option<DateTime<Utc>>,
    pub last_outcome: Option<String>,
    pub next_fire: Option<DateTime<Utc>>,
}

/// Next fire time of a job per its cron expression.
pub fn next_fire(spec: &JobSpec) -> Option<DateTime<Utc>> {
    Schedule::from_str(spec.cron)
        .ok()
        .and_then(|s| s.upcoming(Utc).next())
}

// ============================================================================
// Loop & Execution
// ============================================================================

/// Run the scheduler until cancellation.
pub async fn run(ctx: Arc<CoreContext>, cancel: CancellationToken) {
    if !ctx.scheduler.enabled {
        info!("scheduler disabled by configuration");
        return;
    }

    // Parse all schedules up front; a bad expression is a programming error
    // caught by the unit tests below, but degrade rather than die.
    let mut next: HashMap<&'static str, Option<DateTime<Utc>>> = HashMap::new();
    let mut schedules: HashMap<&'static str, Schedule> = HashMap::new();
    for spec in &JOBS {
        match Schedule::from_str(spec.cron) {
            Ok(schedule) => {
                next.insert(spec.id, schedule.upcoming(Utc).next());
                schedules.insert(spec.id, schedule);
            }
            Err(e) => {
                error!(job = spec.id, cron = spec.cron, error = %e, "invalid cron — job disabled");
            }
        }
    }

    info!(jobs = schedules.len(), "scheduler started");

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(POLL_INTERVAL) => {}
        }

        let now = Utc::now();
        for spec in &JOBS {
            let Some(schedule) = schedules.get(spec.id) else {
                continue;
            };
            let due = matches!(next.get(spec.id), Some(Some(fire)) if *fire <= now);
            if !due {
                continue;
            }
            next.insert(spec.id, schedule.upcoming(Utc).next());

            let ctx = Arc::clone(&ctx);
            let spec = *spec;
            tokio::spawn(async move {
                run_job(&ctx, &spec).await;
            });
        }
    }

    info!("scheduler stopped");
}

/// Manually trigger a job. `Conflict` when an instance is already running.
pub async fn trigger(ctx: &Arc<CoreContext>, job_id: &str) -> Result<JobSnapshot, CoreError> {
    let spec = job_spec(job_id)
        .ok_or_else(|| CoreError::NotFound(format!("unknown scheduler job '{job_id}'")))?;

    let state = &ctx.scheduler.jobs[spec.id];
    if state.running.load(Ordering::SeqCst) {
        return Err(CoreError::Conflict(format!(
            "job '{job_id}' is already running"
        )));
    }

    let ctx_clone = Arc::clone(ctx);
    let spec_copy = *spec;
    tokio::spawn(async move {
        run_job(&ctx_clone, &spec_copy).await;
    });

    // report as running even though the spawned task may not have flipped
    // the flag yet
    let mut snapshot = ctx.scheduler.snapshot(spec).await;
    snapshot.running = true;
    Ok(snapshot)
}

/// Execute one job under its guard and deadline.
async fn run_job(ctx: &Arc<CoreContext>, spec: &JobSpec) {
    let state = &ctx.scheduler.jobs[spec.id];

    // single-fire guard: skip, never queue
    if state
        .running
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        state.skips.fetch_add(1, Ordering::SeqCst);
        warn!(job = spec.id, "previous instance still running — skipping");
        return;
    }

    *state.last_started.write().await = Some(Utc::now());
    info!(job = spec.id, "job started");

    let outcome = match tokio::time::timeout(spec.deadline, jobs::execute(ctx, spec.id)).await {
        Ok(Ok(summary)) => {
            info!(job = spec.id, summary = %summary, "job finished");
            format!("ok: {summary}")
        }
        Ok(Err(e)) => {
            error!(job = spec.id, error = %e, "job failed");
            alert_job_failure(ctx, spec, &e.to_string()).await;
            format!("failed: {e}")
        }
        Err(_) => {
            error!(job = spec.id, deadline_secs = spec.deadline.as_secs(), "job hit deadline");
            let reason = format!("deadline of {}s exceeded", spec.deadline.as_secs());
            alert_job_failure(ctx, spec, &reason).await;
            format!("failed: {reason}")
        }
    };

    *state.last_finished.write().await = Some(Utc::now());
    *state.last_outcome.write().await = Some(outcome);
    state.runs.fetch_add(1, Ordering::SeqCst);
    state.running.store(false, Ordering::SeqCst);
}

/// Surface a failed job on the `system.alert` channel so dashboards see it.
async fn alert_job_failure(ctx: &Arc<CoreContext>, spec: &JobSpec, reason: &str) {
    ctx.publisher
        .publish(&crate::events::BusEvent::SystemAlert {
            alert_type: "scheduler_job_failed".to_string(),
            severity: crate::types::AnomalySeverity::Warning,
            message: format!("scheduled job '{}' failed: {reason}", spec.id),
            details: Some(serde_json::json!({ "job_id": spec.id, "cron": spec.cron })),
            published_at: Utc::now(),
        })
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_job_cron_expressions_parse() {
        for spec in &JOBS {
            let schedule = Schedule::from_str(spec.cron);
            assert!(schedule.is_ok(), "job {} has invalid cron", spec.id);
            assert!(
                next_fire(spec).is_some(),
                "job {} has no upcoming fire",
                spec.id
            );
        }
    }

    #[test]
    fn retrain_fires_sunday_0200() {
        let schedule = Schedule::from_str("0 0 2 * * SUN").unwrap();
        let fire = schedule.upcoming(Utc).next().unwrap();
        assert_eq!(fire.format("%H:%M:%S").to_string(), "02:00:00");
        assert_eq!(fire.format("%a").to_string(), "Sun");
    }

    #[test]
    fn anomaly_sweep_fires_five_past_the_hour() {
        let schedule = Schedule::from_str("0 5 * * * *").unwrap();
        for fire in schedule.upcoming(Utc).take(3) {
            assert_eq!(fire.format("%M:%S").to_string(), "05:00");
        }
    }

    #[test]
    fn cleanup_fires_every_quarter_hour() {
        let schedule = Schedule::from_str("0 */15 * * * *").unwrap();
        let fires: Vec<_> = schedule.upcoming(Utc).take(2).collect();
        let gap = fires[1] - fires[0];
        assert_eq!(gap.num_minutes(), 15);
    }

    #[test]
    fn job_lookup() {
        assert!(job_spec("baseline_retrain").is_some());
        assert!(job_spec("kpi_calculate").is_some());
        assert!(job_spec("nonexistent").is_none());
    }

    #[tokio::test]
    async fn snapshots_cover_all_jobs() {
        let state = SchedulerState::new(true);
        let snaps = state.snapshots().await;
        assert_eq!(snaps.len(), JOBS.len());
        assert!(snaps.iter().all(|s| !s.running && s.runs == 0));
        assert!(snaps.iter().all(|s| s.next_fire.is_some()));
    }
}
