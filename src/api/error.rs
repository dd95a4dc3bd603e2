//! API error handling
//!
//! Transport-level failures only. An execution that failed *inside* the
//! sandbox is a successful response whose payload describes the failure;
//! only a missing engine or an unexpected internal fault becomes an HTTP
//! error.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

use crate::error::SandboxError;
use crate::models::ErrorResponse;

/// API error types
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Sandbox engine is not available")]
    EngineUnavailable,

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_code, message) = match &self {
            ApiError::BadRequest(msg) => {
                (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone())
            }
            ApiError::EngineUnavailable => (
                StatusCode::SERVICE_UNAVAILABLE,
                "ENGINE_UNAVAILABLE",
                self.to_string(),
            ),
            ApiError::Internal(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                msg.clone(),
            ),
        };

        let body = Json(ErrorResponse::new(error_code, message));
        (status, body).into_response()
    }
}

impl From<SandboxError> for ApiError {
    fn from(err: SandboxError) -> Self {
        match err {
            // The session is gone or never came up: same as having no engine
            SandboxError::NotReady { .. } => ApiError::EngineUnavailable,
            other => {
                tracing::error!(error = %other, "Execution failed internally");
                ApiError::Internal(other.to_string())
            }
        }
    }
}
