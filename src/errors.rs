//! Crate-level error type and its HTTP mapping.
//!
//! Selection-time failures are returned to the caller with an HTTP status,
//! a machine-readable error code, and (for retryable denials) a
//! `Retry-After` value in whole seconds. Infrastructure degradation never
//! surfaces here: those paths log and fail open at the call site.

use std::time::Duration;

use axum::{
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error as ThisError;

use crate::db::errors::DbError;

#[derive(ThisError, Debug)]
pub enum Error {
    /// The candidate pool was empty or every credential was disabled.
    #[error("no credential available for {provider}/{model}")]
    NoCredentials { provider: String, model: String },

    /// Every candidate is in a quota-exceeded cooldown; retry after `reset_in`.
    #[error("all credentials for model {model} are cooling down")]
    ModelCooldown {
        provider: String,
        model: String,
        reset_in: Duration,
    },

    /// The caller exceeded the resolved per-second limit for this window.
    #[error("rate limit exceeded")]
    RateLimited { reset_in: Duration },

    /// Database operation error.
    #[error(transparent)]
    Database(#[from] DbError),

    /// Unexpected error with full context chain.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Rounds a wait duration up to whole seconds for `Retry-After`.
fn ceil_secs(wait: Duration) -> u64 {
    wait.as_secs_f64().ceil().max(0.0) as u64
}

impl Error {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::NoCredentials { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Error::ModelCooldown { .. } | Error::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Error::Database(db_err) => match db_err {
                DbError::NotFound => StatusCode::NOT_FOUND,
                DbError::UniqueViolation { .. } => StatusCode::CONFLICT,
                DbError::ForeignKeyViolation { .. } | DbError::CheckViolation { .. } => StatusCode::BAD_REQUEST,
                DbError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Error::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Machine-readable code for the JSON error body.
    pub fn error_code(&self) -> &'static str {
        match self {
            Error::NoCredentials { .. } => "credential_unavailable",
            Error::ModelCooldown { .. } => "model_cooldown",
            Error::RateLimited { .. } => "rate_limit_exceeded",
            Error::Database(_) => "database_error",
            Error::Other(_) => "internal_error",
        }
    }

    /// `Retry-After` seconds for retryable denials, rounded up.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Error::ModelCooldown { reset_in, .. } | Error::RateLimited { reset_in } => Some(ceil_secs(*reset_in)),
            _ => None,
        }
    }

    /// Returns a user-safe error message, without leaking internal implementation details
    pub fn user_message(&self) -> String {
        match self {
            Error::NoCredentials { provider, model } => {
                format!("No credential available for model {model} via provider {provider}")
            }
            Error::ModelCooldown { provider, model, .. } => {
                format!("All credentials for model {model} via provider {provider} are cooling down")
            }
            Error::RateLimited { .. } => "Rate limit exceeded".to_string(),
            Error::Database(db_err) => match db_err {
                DbError::NotFound => "Resource not found".to_string(),
                DbError::UniqueViolation { .. } => "Resource already exists".to_string(),
                DbError::ForeignKeyViolation { .. } => "Invalid reference to related resource".to_string(),
                DbError::CheckViolation { .. } => "Invalid data provided".to_string(),
                DbError::Other(_) => "Database error occurred".to_string(),
            },
            Error::Other(_) => "Internal server error".to_string(),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        // Log full error details for debugging - different log levels based on severity
        match &self {
            Error::Database(DbError::Other(_)) | Error::Other(_) => {
                tracing::error!("Internal service error: {:#}", self);
            }
            Error::Database(_) => {
                tracing::warn!("Database constraint error: {}", self);
            }
            Error::NoCredentials { .. } => {
                tracing::warn!("Selection error: {}", self);
            }
            Error::ModelCooldown { .. } | Error::RateLimited { .. } => {
                tracing::debug!("Client throttled: {}", self);
            }
        }

        let status = self.status_code();
        let mut body = json!({
            "error": {
                "code": self.error_code(),
                "message": self.user_message(),
            }
        });
        if let Error::ModelCooldown {
            provider,
            model,
            reset_in,
        } = &self
        {
            body["error"]["provider"] = json!(provider);
            body["error"]["model"] = json!(model);
            body["error"]["reset_seconds"] = json!(ceil_secs(*reset_in));
        }

        let mut response = (status, axum::Json(body)).into_response();
        if let Some(secs) = self.retry_after_secs()
            && let Ok(value) = HeaderValue::from_str(&secs.to_string())
        {
            response.headers_mut().insert(header::RETRY_AFTER, value);
        }
        response
    }
}

/// Convenience alias for functions returning crate errors.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cooldown_maps_to_429_with_ceiled_retry_after() {
        let err = Error::ModelCooldown {
            provider: "openai".into(),
            model: "gpt-4o".into(),
            reset_in: Duration::from_millis(1200),
        };
        assert_eq!(err.status_code(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(err.retry_after_secs(), Some(2));
        assert_eq!(err.error_code(), "model_cooldown");
    }

    #[test]
    fn rate_limited_carries_retry_after() {
        let err = Error::RateLimited {
            reset_in: Duration::from_secs(0),
        };
        assert_eq!(err.status_code(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(err.retry_after_secs(), Some(0));
    }

    #[test]
    fn no_credentials_is_unavailable_without_retry_after() {
        let err = Error::NoCredentials {
            provider: "openai".into(),
            model: "gpt-4o".into(),
        };
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(err.retry_after_secs(), None);
    }

    #[test]
    fn response_sets_retry_after_header() {
        let err = Error::RateLimited {
            reset_in: Duration::from_millis(400),
        };
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            response.headers().get(header::RETRY_AFTER),
            Some(&HeaderValue::from_static("1"))
        );
    }
}
