//! kernelbox - stateful sandboxed code execution service
//!
//! Main entry point: provisions the sandbox image if asked to, starts one
//! engine session, and serves it over HTTP until a shutdown signal arrives.
//! The session is closed on the way out so no container outlives the
//! process.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::http::HeaderName;
use tokio::signal;
use tower_http::cors::{Any, CorsLayer};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use kernelbox::api::create_router;
use kernelbox::config::AppConfig;
use kernelbox::container::{ContainerRuntime, SandboxSession};
use kernelbox::image::ImageProvisioner;
use kernelbox::logging::init_logging;
use kernelbox::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = AppConfig::load()?;

    // Initialize logging
    init_logging(&config.log_level)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        image = %config.sandbox.image,
        "Starting kernelbox"
    );

    // Create shared application state; the engine attaches below
    let state = Arc::new(AppState::new(config.clone()));

    // Bring the engine up. A failure leaves the server running degraded
    // (every execute answers 503) so operators can still read /health.
    match start_engine(&config).await {
        Ok(session) => {
            state.attach_engine(session).await;
            info!("Sandbox engine ready");
        }
        Err(e) => {
            error!(error = %e, "Sandbox engine failed to start, serving degraded");
        }
    }

    // Build the router with all routes and middleware
    let x_request_id = HeaderName::from_static("x-request-id");
    let app = create_router(state.clone())
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::new(x_request_id.clone(), MakeRequestUuid))
        .layer(PropagateRequestIdLayer::new(x_request_id))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    // Bind to address
    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    info!(%addr, "Listening on");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Start server with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down...");

    // Release the engine: kernel shutdown, container removal, descriptor
    // cleanup. Runs on SIGINT/SIGTERM too via the graceful-shutdown path, so
    // a killed server does not leak its container.
    if let Some(session) = state.detach_engine().await {
        session.close().await;
    }

    info!("kernelbox stopped");
    Ok(())
}

/// Provision the image when configured to, then start the one session this
/// server fronts.
async fn start_engine(config: &AppConfig) -> anyhow::Result<kernelbox::container::SessionHandle> {
    let runtime = ContainerRuntime::connect()?;

    if config.sandbox.build_on_start {
        let context = config
            .sandbox
            .build_context
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("build_on_start set without build_context"))?;

        let provisioner = ImageProvisioner::new(runtime.docker().clone());
        provisioner.build(&config.sandbox.image, context).await?;
    } else {
        warn!(image = %config.sandbox.image, "Skipping image build, assuming it exists");
    }

    let session = SandboxSession::start_with_runtime(config.sandbox.clone(), runtime).await?;
    Ok(session)
}

/// Handle shutdown signals gracefully
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
