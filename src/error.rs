use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LimiterError {
    #[error("State store error: {0}")]
    Store(String),

    #[error("State store did not answer within {0:?}")]
    Timeout(Duration),

    #[error("Concurrent updates to '{key}' exhausted {attempts} attempts")]
    Contention { key: String, attempts: u32 },

    #[error("Malformed state stored at '{key}'")]
    MalformedState { key: String },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, LimiterError>;

impl LimiterError {
    /// Errors that mean the admission check could not complete and the
    /// configured failure policy has to decide the outcome.
    pub fn is_store_failure(&self) -> bool {
        matches!(
            self,
            LimiterError::Store(_) | LimiterError::Timeout(_) | LimiterError::Contention { .. }
        )
    }
}

impl From<serde_json::Error> for LimiterError {
    fn from(err: serde_json::Error) -> Self {
        LimiterError::Internal(format!("state encoding failed: {}", err))
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    pub code: u16,
}

impl ErrorResponse {
    pub fn new(error: &str, message: &str, code: u16) -> Self {
        Self {
            error: error.to_string(),
            message: message.to_string(),
            code,
        }
    }

    pub fn from_limiter_error(err: &LimiterError) -> Self {
        let message = err.to_string();
        match err {
            LimiterError::Store(_) | LimiterError::Timeout(_) => {
                Self::new("service_unavailable", &message, 503)
            }
            LimiterError::Contention { .. } => Self::new("conflict", &message, 409),
            LimiterError::Validation(_) => Self::new("validation_error", &message, 422),
            LimiterError::Unauthorized(_) => Self::new("unauthorized", &message, 401),
            LimiterError::MalformedState { .. }
            | LimiterError::Configuration(_)
            | LimiterError::Internal(_) => Self::new("internal_error", &message, 500),
        }
    }
}

impl IntoResponse for LimiterError {
    fn into_response(self) -> Response {
        let body = ErrorResponse::from_limiter_error(&self);
        let status =
            StatusCode::from_u16(body.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(body)).into_response()
    }
}
