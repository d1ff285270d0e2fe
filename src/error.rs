//! Typed error vocabulary for the analytics core.
//!
//! Engines raise `CoreError`; HTTP handlers map each kind to a status code
//! and response body (see `api`). The event bus swallows its own publish
//! failures and never surfaces them here.

use axum::http::StatusCode;
use thiserror::Error;

/// Wire-visible error kinds raised by the engines and adapters.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Malformed or invalid input (bad time range, unknown feature key, ...).
    #[error("{0}")]
    BadRequest(String),

    /// A referenced entity (machine, model, anomaly, job) does not exist.
    #[error("{0}")]
    NotFound(String),

    /// A competing operation is already in progress or a uniqueness rule
    /// would be violated (e.g. training already running).
    #[error("{0}")]
    Conflict(String),

    /// The requested window cannot satisfy the sample floor, even at the
    /// finest granularity, or too few rows survived cleaning.
    #[error("insufficient data: {0}")]
    InsufficientData(String),

    /// Predict/deviation called for a scope with no active baseline.
    #[error("no active baseline model for machine '{machine_id}' and energy source '{energy_source}'")]
    NotTrained {
        machine_id: String,
        energy_source: String,
    },

    /// Per-IP sliding-window limit exhausted.
    #[error("rate limit exceeded for category '{category}'")]
    RateLimited {
        category: String,
        limit: u32,
        retry_after: u64,
    },

    /// Concurrent-connection cap reached.
    #[error("too many concurrent connections")]
    TooManyConnections { retry_after: u64 },

    /// Store or bus is flapping; the caller may retry.
    #[error("dependency temporarily unavailable: {0}")]
    TransientUnavailable(String),

    /// Invariant violation or unexpected failure. A bug, not an input problem.
    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// HTTP status for this error kind.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) | Self::NotTrained { .. } => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::InsufficientData(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::TooManyConnections { .. } | Self::TransientUnavailable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable code used in response bodies and logs.
    pub fn code(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "bad_request",
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::InsufficientData(_) => "insufficient_data",
            Self::NotTrained { .. } => "not_trained",
            Self::RateLimited { .. } => "rate_limit_exceeded",
            Self::TooManyConnections { .. } => "too_many_connections",
            Self::TransientUnavailable(_) => "transient_unavailable",
            Self::Internal(_) => "internal",
        }
    }

    /// True for errors a client may retry without changing the request.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TransientUnavailable(_)
                | Self::RateLimited { .. }
                | Self::TooManyConnections { .. }
        )
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound("row not found".to_string()),
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                Self::TransientUnavailable(err.to_string())
            }
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(format!("serialization: {err}"))
    }
}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        Self::Internal(format!("io: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_matches_contract() {
        assert_eq!(
            CoreError::BadRequest("x".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            CoreError::InsufficientData("x".into()).status(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            CoreError::Conflict("x".into()).status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            CoreError::NotTrained {
                machine_id: "m".into(),
                energy_source: "electricity".into()
            }
            .status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            CoreError::RateLimited {
                category: "normal".into(),
                limit: 60,
                retry_after: 12
            }
            .status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            CoreError::TooManyConnections { retry_after: 5 }.status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            CoreError::TransientUnavailable("db".into()).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn not_trained_message_names_scope() {
        let err = CoreError::NotTrained {
            machine_id: "Compressor-1".into(),
            energy_source: "electricity".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("Compressor-1"));
        assert!(msg.contains("electricity"));
    }

    #[test]
    fn retryable_kinds() {
        assert!(CoreError::TransientUnavailable("x".into()).is_retryable());
        assert!(!CoreError::BadRequest("x".into()).is_retryable());
        assert!(!CoreError::Internal("x".into()).is_retryable());
    }

    #[test]
    fn sqlx_row_not_found_maps_to_not_found() {
        let err: CoreError = sqlx::Error::RowNotFound.into();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
    }
}
