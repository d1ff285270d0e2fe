//! Voice-assistant (OVOS) surface
//!
//! Wraps the training pipeline with spoken-style messages in every path,
//! success or failure, so the assistant can read responses verbatim. A
//! concurrent-training conflict is a polite `{triggered: false}` here, not
//! a 409.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::Json;
use chrono::{Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::baseline::{self, FeatureSpec, TrainParams};
use crate::context::CoreContext;
use crate::error::CoreError;
use crate::features::DERIVED_KEYS;
use crate::store::catalog;
use crate::types::{Scope, TimeRange};

use super::super::ApiResult;

/// Default training window when the assistant does not say one.
const DEFAULT_TRAIN_DAYS: i64 = 30;

#[derive(Debug, Deserialize, ToSchema)]
pub struct OvosTrainRequest {
    /// Machine name as spoken (ids work too).
    pub machine: String,
    pub energy_source: String,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    /// Empty means automatic feature selection.
    #[serde(default)]
    pub features: Vec<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct OvosTrainResponse {
    pub triggered: bool,
    /// Spoken-style summary for the assistant.
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_version: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub r_squared: Option<f64>,
}

/// POST /api/v1/ovos/train-baseline
#[utoipa::path(post, path = "/api/v1/ovos/train-baseline",
    request_body = OvosTrainRequest,
    responses((status = 200, description = "Voice-formatted training outcome", body = OvosTrainResponse)))]
pub async fn train_baseline(
    State(ctx): State<Arc<CoreContext>>,
    Json(request): Json<OvosTrainRequest>,
) -> ApiResult<OvosTrainResponse> {
    let machine = match super::resolve_machine(&ctx.pool, &request.machine).await {
        Ok(machine) => machine,
        Err(CoreError::NotFound(_)) => {
            return Ok(Json(OvosTrainResponse {
                triggered: false,
                message: format!(
                    "I could not find a machine called {}. Please check the name and try again.",
                    request.machine
                ),
                reason: Some("machine not found".to_string()),
                model_version: None,
                r_squared: None,
            }))
        }
        Err(e) => return Err(e.into()),
    };

    let end = match &request.end_time {
        Some(raw) => super::parse_timestamp(raw, "end_time")?,
        None => Utc::now(),
    };
    let start = match &request.start_time {
        Some(raw) => super::parse_timestamp(raw, "start_time")?,
        None => end - ChronoDuration::days(DEFAULT_TRAIN_DAYS),
    };
    let range = TimeRange::new(start, end)?;

    let machine_name = machine.name.clone();
    let result = baseline::run_training_job(
        &ctx,
        TrainParams {
            scope: Scope::Machine {
                machine_id: machine.id,
            },
            energy_source: Some(request.energy_source.clone()),
            range,
            features: FeatureSpec::from_request(request.features),
            activate: true,
        },
    )
    .await;

    let response = match result {
        Ok(outcome) => OvosTrainResponse {
            triggered: true,
            message: if outcome.meets_quality_threshold {
                format!(
                    "Done. I trained a new {} baseline for {} with an R squared of {:.0} percent.",
                    request.energy_source,
                    machine_name,
                    outcome.model.r_squared * 100.0
                )
            } else {
                format!(
                    "I trained a baseline for {}, but its R squared is only {:.0} percent, \
                     so predictions may be unreliable.",
                    machine_name,
                    outcome.model.r_squared * 100.0
                )
            },
            reason: None,
            model_version: Some(outcome.model.model_version),
            r_squared: Some(outcome.model.r_squared),
        },
        Err(CoreError::Conflict(_)) => OvosTrainResponse {
            triggered: false,
            message: format!("A training run for {machine_name} is already in progress."),
            reason: Some("Training already in progress".to_string()),
            model_version: None,
            r_squared: None,
        },
        Err(CoreError::InsufficientData(detail)) => OvosTrainResponse {
            triggered: false,
            message: format!(
                "There is not enough data to train a baseline for {machine_name} in that period."
            ),
            reason: Some(detail),
            model_version: None,
            r_squared: None,
        },
        Err(e) => return Err(e.into()),
    };

    Ok(Json(response))
}

#[derive(Debug, Deserialize)]
pub struct FeaturesQuery {
    pub energy_source: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct AvailableFeature {
    pub key: String,
    pub description: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct AvailableFeaturesResponse {
    pub energy_source: String,
    pub features: Vec<AvailableFeature>,
    pub message: String,
}

/// GET /api/v1/ovos/available-features
#[utoipa::path(get, path = "/api/v1/ovos/available-features",
    params(("energy_source" = String, Query, description = "Energy source key")),
    responses((status = 200, description = "Admissible feature keys for the source", body = AvailableFeaturesResponse)))]
pub async fn available_features(
    State(ctx): State<Arc<CoreContext>>,
    Query(query): Query<FeaturesQuery>,
) -> ApiResult<AvailableFeaturesResponse> {
    let declared = catalog::features_for_source(&ctx.pool, &query.energy_source).await?;

    let mut features: Vec<AvailableFeature> = declared
        .into_iter()
        .map(|d| AvailableFeature {
            key: d.feature_key,
            description: d.description,
        })
        .collect();
    for key in DERIVED_KEYS {
        features.push(AvailableFeature {
            key: key.to_string(),
            description: Some("derived from the bucket timestamp or outdoor temperature".to_string()),
        });
    }

    let keys: Vec<&str> = features.iter().map(|f| f.key.as_str()).collect();
    Ok(Json(AvailableFeaturesResponse {
        message: format!(
            "For {} baselines you can use: {}.",
            query.energy_source,
            keys.join(", ")
        ),
        energy_source: query.energy_source,
        features,
    }))
}
