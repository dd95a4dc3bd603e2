//! kernelbox library
//!
//! Stateful sandboxed code execution: one session owns one container running
//! a long-lived kernel, so variables and imports persist across `execute`
//! calls while the host stays behind the container boundary.

use tokio::sync::RwLock;

pub mod api;
pub mod config;
pub mod container;
pub mod error;
pub mod image;
pub mod kernel;
pub mod logging;
pub mod models;

use container::SessionHandle;

/// Application state shared across all handlers
pub struct AppState {
    pub config: config::AppConfig,
    /// The one engine session this server fronts. `None` when startup failed
    /// or the session has been released: the API answers 503 until then.
    engine: RwLock<Option<SessionHandle>>,
}

impl AppState {
    pub fn new(config: config::AppConfig) -> Self {
        Self {
            config,
            engine: RwLock::new(None),
        }
    }

    /// Hand the running session to the server.
    pub async fn attach_engine(&self, session: SessionHandle) {
        *self.engine.write().await = Some(session);
    }

    /// Take the session back for teardown; the API degrades to 503.
    pub async fn detach_engine(&self) -> Option<SessionHandle> {
        self.engine.write().await.take()
    }

    pub async fn engine(&self) -> Option<SessionHandle> {
        self.engine.read().await.clone()
    }
}
