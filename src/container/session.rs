//! Sandbox session
//!
//! The object a caller holds: exactly one container, exactly one attached
//! kernel channel set, one lifecycle. Executions against one session are
//! serialized by an exclusive lock so overlapping callers can never
//! interleave their event-stream reads.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tempfile::TempDir;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::SandboxConfig;
use crate::container::runtime::{
    ContainerHandle, ContainerRuntime, ContainerStatus, DESCRIPTOR_FILE,
};
use crate::error::{Result, SandboxError};
use crate::kernel::{driver, ConnectionDescriptor, KernelChannels};
use crate::models::ExecutionOutput;

/// How often the readiness wait re-checks for the connection file.
const DESCRIPTOR_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Grace given to the kernel to acknowledge a shutdown request.
const SHUTDOWN_ACK_TIMEOUT: Duration = Duration::from_secs(2);

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Starting,
    Ready,
    Executing,
    Closed,
}

impl SessionState {
    pub fn name(&self) -> &'static str {
        match self {
            SessionState::Created => "created",
            SessionState::Starting => "starting",
            SessionState::Ready => "ready",
            SessionState::Executing => "executing",
            SessionState::Closed => "closed",
        }
    }
}

/// One sandbox: a container plus its attached kernel.
pub struct SandboxSession {
    /// Unique session ID
    pub session_id: Uuid,

    /// When the session was created
    pub created_at: DateTime<Utc>,

    settings: SandboxConfig,

    runtime: ContainerRuntime,

    /// Current lifecycle state
    state: RwLock<SessionState>,

    /// Container handle (once launched)
    container: RwLock<Option<ContainerHandle>>,

    /// Attached kernel channels (once the handshake succeeded)
    channels: Mutex<Option<KernelChannels>>,

    /// Host directory the kernel's connection file appears in; dropped on
    /// teardown so nothing outlives the session
    conn_dir: RwLock<Option<TempDir>>,

    /// When the session last served an execution
    last_activity: RwLock<DateTime<Utc>>,

    /// Execution counter
    execution_count: AtomicU64,

    /// Lock for execution (only one at a time per session)
    execution_lock: Mutex<()>,
}

impl std::fmt::Debug for SandboxSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxSession")
            .field("session_id", &self.session_id)
            .field("created_at", &self.created_at)
            .field("execution_count", &self.execution_count)
            .finish_non_exhaustive()
    }
}

/// Thread-safe session handle
pub type SessionHandle = Arc<SandboxSession>;

impl SandboxSession {
    /// Start a session against the local Docker daemon: launch the
    /// container, wait for the kernel, attach and probe the channels. On any
    /// failure the partial state is fully torn down before the error is
    /// returned.
    pub async fn start(settings: SandboxConfig) -> Result<SessionHandle> {
        let runtime = ContainerRuntime::connect()?;
        Self::start_with_runtime(settings, runtime).await
    }

    /// Start with an already-connected runtime.
    pub async fn start_with_runtime(
        settings: SandboxConfig,
        runtime: ContainerRuntime,
    ) -> Result<SessionHandle> {
        let session = Arc::new(Self::new(settings, runtime));

        if let Err(err) = session.startup().await {
            warn!(session_id = %session.session_id, error = %err, "Startup failed, cleaning up");
            session.close().await;
            return Err(err);
        }

        Ok(session)
    }

    fn new(settings: SandboxConfig, runtime: ContainerRuntime) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            created_at: Utc::now(),
            settings,
            runtime,
            state: RwLock::new(SessionState::Created),
            container: RwLock::new(None),
            channels: Mutex::new(None),
            conn_dir: RwLock::new(None),
            last_activity: RwLock::new(Utc::now()),
            execution_count: AtomicU64::new(0),
            execution_lock: Mutex::new(()),
        }
    }

    async fn startup(&self) -> Result<()> {
        self.set_state(SessionState::Starting).await;

        info!(
            session_id = %self.session_id,
            image = %self.settings.image,
            "Starting sandbox session"
        );

        let conn_dir = tempfile::Builder::new()
            .prefix("kernelbox-")
            .tempdir()
            .map_err(|e| SandboxError::Launch(format!("connection dir: {}", e)))?;
        let conn_path = conn_dir.path().to_path_buf();

        // The kernel runs as an unprivileged user inside the container and
        // must be able to write the connection file through the bind mount
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let permissions = std::fs::Permissions::from_mode(0o777);
            let _ = tokio::fs::set_permissions(&conn_path, permissions).await;
        }

        *self.conn_dir.write().await = Some(conn_dir);

        let container = self
            .runtime
            .launch(&self.settings.image, &self.settings.ports, &conn_path)
            .await?;
        *self.container.write().await = Some(container.clone());

        let descriptor = self.await_descriptor(&container, &conn_path).await?;

        let mut channels = match KernelChannels::attach(&descriptor).await {
            Ok(channels) => channels,
            Err(err) => {
                let logs = self.runtime.capture_logs(&container).await;
                return Err(SandboxError::Handshake {
                    reason: err.to_string(),
                    logs,
                });
            }
        };

        if let Err(err) = channels.probe(self.settings.startup_timeout()).await {
            let logs = self.runtime.capture_logs(&container).await;
            channels.close().await;
            return Err(SandboxError::Handshake {
                reason: err.to_string(),
                logs,
            });
        }

        *self.channels.lock().await = Some(channels);
        self.set_state(SessionState::Ready).await;

        info!(
            session_id = %self.session_id,
            container_id = %container.id,
            "Sandbox session ready"
        );

        Ok(())
    }

    /// Poll for the kernel's connection file, watching container liveness so
    /// a dead container fails fast instead of waiting out the timeout.
    async fn await_descriptor(
        &self,
        container: &ContainerHandle,
        conn_path: &Path,
    ) -> Result<ConnectionDescriptor> {
        let started = Instant::now();
        let deadline = started + self.settings.startup_timeout();
        let descriptor_path: PathBuf = conn_path.join(DESCRIPTOR_FILE);

        loop {
            if let Some(mut descriptor) = ConnectionDescriptor::try_read(&descriptor_path) {
                debug!(
                    session_id = %self.session_id,
                    path = %descriptor_path.display(),
                    "Connection file found"
                );
                descriptor.patch_loopback();
                return Ok(descriptor);
            }

            if self.runtime.poll_status(container).await? == ContainerStatus::Exited {
                let logs = self.runtime.capture_logs(container).await;
                return Err(SandboxError::PrematureExit { logs });
            }

            if Instant::now() >= deadline {
                return Err(SandboxError::ReadinessTimeout {
                    waited: started.elapsed(),
                });
            }

            tokio::time::sleep(DESCRIPTOR_POLL_INTERVAL).await;
        }
    }

    /// Execute code in the kernel and collect its output. Serialized per
    /// session; an execution timeout or a raised exception comes back as an
    /// ordinary output fragment and leaves the session `Ready`.
    pub async fn execute(&self, code: &str) -> Result<ExecutionOutput> {
        match self.state().await {
            SessionState::Ready | SessionState::Executing => {}
            other => return Err(SandboxError::NotReady { state: other.name() }),
        }

        let _guard = self.execution_lock.lock().await;

        // The session may have been closed while we queued for the lock
        if self.state().await == SessionState::Closed {
            return Err(SandboxError::NotReady { state: "closed" });
        }

        self.set_state(SessionState::Executing).await;

        let result = {
            let mut channels_guard = self.channels.lock().await;
            let channels = channels_guard
                .as_mut()
                .ok_or(SandboxError::NotReady { state: "closed" })?;

            driver::execute(
                channels,
                code,
                self.settings.ack_timeout(),
                self.settings.drain_idle_timeout(),
            )
            .await
        };

        if self.state().await != SessionState::Closed {
            self.set_state(SessionState::Ready).await;
        }

        self.execution_count.fetch_add(1, Ordering::Relaxed);
        *self.last_activity.write().await = Utc::now();

        result
    }

    /// Tear the session down. Idempotent and infallible: each step runs only
    /// if its resource still exists, failures are logged and the sequence
    /// continues.
    pub async fn close(&self) {
        {
            let mut state = self.state.write().await;
            if *state == SessionState::Closed {
                debug!(session_id = %self.session_id, "Session already closed");
            }
            *state = SessionState::Closed;
        }

        // (a) ask the kernel to shut down, then drop the channels
        if let Some(mut channels) = self.channels.lock().await.take() {
            channels.request_shutdown(SHUTDOWN_ACK_TIMEOUT).await;
            channels.close().await;
            debug!(session_id = %self.session_id, "Kernel channels closed");
        }

        // (b) stop and remove the container; "not found" counts as done
        if let Some(container) = self.container.write().await.take() {
            self.runtime.stop_and_remove(&container).await;
        }

        // (c) remove the connection directory and the descriptor in it
        if let Some(dir) = self.conn_dir.write().await.take() {
            if let Err(e) = dir.close() {
                warn!(session_id = %self.session_id, error = %e, "Connection dir removal failed");
            }
        }

        info!(session_id = %self.session_id, "Session closed");
    }

    pub async fn state(&self) -> SessionState {
        *self.state.read().await
    }

    async fn set_state(&self, state: SessionState) {
        *self.state.write().await = state;
    }

    pub async fn is_ready(&self) -> bool {
        matches!(
            self.state().await,
            SessionState::Ready | SessionState::Executing
        )
    }

    pub fn execution_count(&self) -> u64 {
        self.execution_count.load(Ordering::Relaxed)
    }

    pub async fn last_activity(&self) -> DateTime<Utc> {
        *self.last_activity.read().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Builds the client without talking to the daemon, so these tests run
    // anywhere; the Docker-backed paths live in tests/e2e.rs.
    fn detached_session() -> SandboxSession {
        let docker = bollard::Docker::connect_with_local_defaults().unwrap();
        SandboxSession::new(SandboxConfig::default(), ContainerRuntime::new(docker))
    }

    #[tokio::test]
    async fn execute_before_start_fails_fast() {
        let session = detached_session();

        let err = session.execute("x = 1").await.unwrap_err();
        assert_eq!(err.code(), "NOT_READY");
        assert!(err.to_string().contains("created"));
    }

    #[tokio::test]
    async fn execute_after_close_fails_fast() {
        let session = detached_session();
        session.close().await;

        let err = session.execute("x = 1").await.unwrap_err();
        assert_eq!(err.code(), "NOT_READY");
        assert!(err.to_string().contains("closed"));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let session = detached_session();

        session.close().await;
        session.close().await;

        assert_eq!(session.state().await, SessionState::Closed);
    }

    #[tokio::test]
    async fn close_from_created_needs_no_resources() {
        let session = detached_session();
        assert_eq!(session.state().await, SessionState::Created);

        session.close().await;

        assert_eq!(session.state().await, SessionState::Closed);
        assert!(!session.is_ready().await);
    }

    #[test]
    fn state_names() {
        assert_eq!(SessionState::Created.name(), "created");
        assert_eq!(SessionState::Closed.name(), "closed");
    }
}
