//! Baseline model rows: versioning, activation, lookup
//!
//! Model versions are monotonic per (machine, energy source). Activation is
//! transactional so readers always observe exactly one active model or none.

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::types::BaselineModel;

const MODEL_COLUMNS: &str = "id, machine_id, energy_source, model_version, features, intercept, \
     coefficients, r_squared, rmse, mae, residual_std, training_samples, training_start, \
     training_end, blob_path, is_active, created_at";

/// Everything a freshly trained model carries before it gets a row.
#[derive(Debug, Clone)]
pub struct NewBaselineModel {
    pub machine_id: String,
    pub energy_source: String,
    pub features: Vec<String>,
    pub intercept: f64,
    pub coefficients: Vec<f64>,
    pub r_squared: f64,
    pub rmse: f64,
    pub mae: f64,
    pub residual_std: f64,
    pub training_samples: i32,
    pub training_start: DateTime<Utc>,
    pub training_end: DateTime<Utc>,
    pub blob_path: Option<String>,
}

/// Insert a model with the next version; optionally activate it, atomically
/// deactivating any predecessor.
pub async fn insert_model(
    pool: &PgPool,
    model: &NewBaselineModel,
    activate: bool,
) -> sqlx::Result<BaselineModel> {
    let mut tx = pool.begin().await?;

    let next_version: i32 = sqlx::query_scalar(
        "SELECT COALESCE(MAX(model_version), 0) + 1 FROM energy_baselines \
         WHERE machine_id = $1 AND energy_source = $2",
    )
    .bind(&model.machine_id)
    .bind(&model.energy_source)
    .fetch_one(&mut *tx)
    .await?;

    if activate {
        sqlx::query(
            "UPDATE energy_baselines SET is_active = FALSE \
             WHERE machine_id = $1 AND energy_source = $2 AND is_active",
        )
        .bind(&model.machine_id)
        .bind(&model.energy_source)
        .execute(&mut *tx)
        .await?;
    }

    let inserted: BaselineModel = sqlx::query_as(&format!(
        "INSERT INTO energy_baselines \
             (id, machine_id, energy_source, model_version, features, intercept, coefficients, \
              r_squared, rmse, mae, residual_std, training_samples, training_start, training_end, \
              blob_path, is_active, created_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, NOW()) \
         RETURNING {MODEL_COLUMNS}"
    ))
    .bind(Uuid::new_v4())
    .bind(&model.machine_id)
    .bind(&model.energy_source)
    .bind(next_version)
    .bind(sqlx::types::Json(&model.features))
    .bind(model.intercept)
    .bind(sqlx::types::Json(&model.coefficients))
    .bind(model.r_squared)
    .bind(model.rmse)
    .bind(model.mae)
    .bind(model.residual_std)
    .bind(model.training_samples)
    .bind(model.training_start)
    .bind(model.training_end)
    .bind(&model.blob_path)
    .bind(activate)
    .fetch_one(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(inserted)
}

/// Attach the blob path once the on-disk write has succeeded.
pub async fn set_blob_path(pool: &PgPool, id: Uuid, path: &str) -> sqlx::Result<BaselineModel> {
    sqlx::query_as(&format!(
        "UPDATE energy_baselines SET blob_path = $2 WHERE id = $1 RETURNING {MODEL_COLUMNS}"
    ))
    .bind(id)
    .bind(path)
    .fetch_one(pool)
    .await
}

/// The active model for a scope, if one exists.
pub async fn active_model(
    pool: &PgPool,
    machine_id: &str,
    energy_source: &str,
) -> sqlx::Result<Option<BaselineModel>> {
    sqlx::query_as(&format!(
        "SELECT {MODEL_COLUMNS} FROM energy_baselines \
         WHERE machine_id = $1 AND energy_source = $2 AND is_active"
    ))
    .bind(machine_id)
    .bind(energy_source)
    .fetch_optional(pool)
    .await
}

pub async fn model_by_id(pool: &PgPool, id: Uuid) -> sqlx::Result<Option<BaselineModel>> {
    sqlx::query_as(&format!(
        "SELECT {MODEL_COLUMNS} FROM energy_baselines WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await
}

/// Models newest-first, optionally restricted to one machine.
pub async fn list_models(
    pool: &PgPool,
    machine_id: Option<&str>,
) -> sqlx::Result<Vec<BaselineModel>> {
    match machine_id {
        Some(machine) => {
            sqlx::query_as(&format!(
                "SELECT {MODEL_COLUMNS} FROM energy_baselines WHERE machine_id = $1 \
                 ORDER BY energy_source, model_version DESC"
            ))
            .bind(machine)
            .fetch_all(pool)
            .await
        }
        None => {
            sqlx::query_as(&format!(
                "SELECT {MODEL_COLUMNS} FROM energy_baselines \
                 ORDER BY machine_id, energy_source, model_version DESC"
            ))
            .fetch_all(pool)
            .await
        }
    }
}

/// Activate an existing model, deactivating its siblings in one transaction.
pub async fn activate_model(pool: &PgPool, id: Uuid) -> sqlx::Result<Option<BaselineModel>> {
    let mut tx = pool.begin().await?;

    let model: Option<BaselineModel> = sqlx::query_as(&format!(
        "SELECT {MODEL_COLUMNS} FROM energy_baselines WHERE id = $1 FOR UPDATE"
    ))
    .bind(id)
    .fetch_optional(&mut *tx)
    .await?;
    let Some(model) = model else {
        return Ok(None);
    };

    sqlx::query(
        "UPDATE energy_baselines SET is_active = FALSE \
         WHERE machine_id = $1 AND energy_source = $2 AND is_active",
    )
    .bind(&model.machine_id)
    .bind(&model.energy_source)
    .execute(&mut *tx)
    .await?;

    let activated: BaselineModel = sqlx::query_as(&format!(
        "UPDATE energy_baselines SET is_active = TRUE WHERE id = $1 RETURNING {MODEL_COLUMNS}"
    ))
    .bind(id)
    .fetch_one(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(Some(activated))
}
