//! Code execution handler

use std::sync::Arc;

use axum::{extract::State, Json};
use tracing::debug;

use crate::api::ApiError;
use crate::models::{CodeRequest, CodeResponse};
use crate::AppState;

/// Execute code in the engine's session and return the rendered output.
///
/// Execution-level failures (a raised exception, an execution timeout) are
/// 200s: the payload describes them. Only a missing engine or an internal
/// fault is an HTTP error.
pub async fn execute_code(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CodeRequest>,
) -> Result<Json<CodeResponse>, ApiError> {
    if request.code.is_empty() {
        return Err(ApiError::BadRequest("Code cannot be empty".into()));
    }

    if request.code.len() > 1_000_000 {
        return Err(ApiError::BadRequest("Code exceeds 1MB".into()));
    }

    let session = state.engine().await.ok_or(ApiError::EngineUnavailable)?;

    let output = session.execute(&request.code).await?;

    debug!(
        session_id = %session.session_id,
        fragments = output.fragments.len(),
        errored = output.has_error(),
        "Execution served"
    );

    Ok(Json(CodeResponse {
        result: output.render(),
    }))
}
