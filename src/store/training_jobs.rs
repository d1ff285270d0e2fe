//! Training-job rows: mutual exclusion, progress, stuck-job cleanup

use sqlx::PgPool;
use uuid::Uuid;

use crate::types::{JobStatus, ModelType, TrainingJob};

const JOB_COLUMNS: &str =
    "id, machine_id, model_type, status, progress_pct, error, model_id, started_at, finished_at";

/// Start a job if — and only if — no job of the same (machine, model_type)
/// is currently running. Returns `None` when one is, which callers surface
/// as a conflict.
pub async fn start_job(
    pool: &PgPool,
    machine_id: &str,
    model_type: ModelType,
) -> sqlx::Result<Option<TrainingJob>> {
    sqlx::query_as(&format!(
        "INSERT INTO model_training_history \
             (id, machine_id, model_type, status, progress_pct, started_at) \
         SELECT $1, $2, $3, 'running', 0, NOW() \
         WHERE NOT EXISTS ( \
             SELECT 1 FROM model_training_history \
             WHERE machine_id = $2 AND model_type = $3 AND status = 'running' \
         ) \
         RETURNING {JOB_COLUMNS}"
    ))
    .bind(Uuid::new_v4())
    .bind(machine_id)
    .bind(model_type)
    .fetch_optional(pool)
    .await
}

pub async fn update_progress(pool: &PgPool, job_id: Uuid, progress_pct: f64) -> sqlx::Result<()> {
    sqlx::query(
        "UPDATE model_training_history SET progress_pct = $2 \
         WHERE id = $1 AND status = 'running'",
    )
    .bind(job_id)
    .bind(progress_pct.clamp(0.0, 100.0))
    .execute(pool)
    .await?;
    Ok(())
}

/// Terminal transition: succeeded (with model reference) or failed (with
/// error text). Progress jumps to 100 on success.
pub async fn complete_job(
    pool: &PgPool,
    job_id: Uuid,
    status: JobStatus,
    error: Option<&str>,
    model_id: Option<Uuid>,
) -> sqlx::Result<()> {
    let progress = if status == JobStatus::Succeeded { 100.0 } else { -1.0 };
    sqlx::query(
        "UPDATE model_training_history SET \
             status = $2, \
             error = $3, \
             model_id = $4, \
             progress_pct = CASE WHEN $5 >= 0 THEN $5 ELSE progress_pct END, \
             finished_at = NOW() \
         WHERE id = $1",
    )
    .bind(job_id)
    .bind(status)
    .bind(error)
    .bind(model_id)
    .bind(progress)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn job_by_id(pool: &PgPool, id: Uuid) -> sqlx::Result<Option<TrainingJob>> {
    sqlx::query_as(&format!(
        "SELECT {JOB_COLUMNS} FROM model_training_history WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await
}

/// Mark `running` jobs older than `max_age_secs` as failed with
/// `error = "stuck"`. Returns the number of jobs reaped.
pub async fn cleanup_stuck(pool: &PgPool, max_age_secs: i64) -> sqlx::Result<u64> {
    let result = sqlx::query(
        "UPDATE model_training_history SET \
             status = 'failed', error = 'stuck', finished_at = NOW() \
         WHERE status = 'running' AND started_at < NOW() - make_interval(secs => $1::FLOAT8)",
    )
    .bind(max_age_secs as f64)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}
