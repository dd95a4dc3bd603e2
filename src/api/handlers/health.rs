//! Health check handler

use std::sync::Arc;
use std::time::Instant;

use axum::{extract::State, Json};
use once_cell::sync::Lazy;

use crate::models::{HealthResponse, HealthStatus};
use crate::AppState;

/// Server start time for uptime calculation
static START_TIME: Lazy<Instant> = Lazy::new(Instant::now);

/// Health check endpoint
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let uptime = START_TIME.elapsed().as_secs();

    let (status, executions, session_started_at) = match state.engine().await {
        Some(session) if session.is_ready().await => (
            HealthStatus::Healthy,
            session.execution_count(),
            Some(session.created_at),
        ),
        Some(session) => (
            HealthStatus::Degraded,
            session.execution_count(),
            Some(session.created_at),
        ),
        None => (HealthStatus::Degraded, 0, None),
    };

    Json(HealthResponse {
        status,
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: uptime,
        executions,
        session_started_at,
    })
}
