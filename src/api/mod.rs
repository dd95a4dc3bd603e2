//! API module for kernelbox
//!
//! One execution endpoint and a health check; the orchestration loop that
//! decides what code to run lives entirely outside this service.

mod error;
mod handlers;

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};

use crate::AppState;

pub use error::ApiError;

/// Create the main application router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        // Health check
        .route("/health", get(handlers::health::health_check))
        // Stateful code execution
        .route("/execute", post(handlers::execute::execute_code))
        .with_state(state)
}
