//! Engine error taxonomy.
//!
//! Every failure that can abort session startup gets its own variant so
//! callers can distinguish "the image never built" from "the container died
//! under us". Conditions that leave the session usable (an execution
//! timeout, an exception raised by sandboxed code) are *not* errors: they
//! are reported as ordinary output fragments by the protocol driver.

use std::time::Duration;

use thiserror::Error;

/// Errors raised by the sandbox engine.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// Image build failed. Not retried; carries the build diagnostic.
    #[error("image provisioning failed: {0}")]
    Provisioning(String),

    /// The container could not be created or started.
    #[error("container launch failed: {0}")]
    Launch(String),

    /// The container exited before the kernel published its connection file.
    #[error("container exited before the kernel became ready")]
    PrematureExit {
        /// Tail of the container logs, for diagnosis.
        logs: String,
    },

    /// The connection file never appeared within the startup timeout.
    #[error("kernel connection file did not appear within {waited:?}")]
    ReadinessTimeout { waited: Duration },

    /// Channels opened but the kernel never answered the readiness probe.
    #[error("kernel handshake failed: {reason}")]
    Handshake {
        reason: String,
        /// Tail of the container logs, for diagnosis.
        logs: String,
    },

    /// `execute` was called on a session that is not `Ready`. Caller bug.
    #[error("session is {state}, not ready to execute")]
    NotReady { state: &'static str },

    /// A channel transport failure while the session was live.
    #[error("kernel channel error: {0}")]
    Channel(String),

    /// The connection file was present but permanently unparseable.
    #[error("invalid kernel connection file: {0}")]
    Descriptor(String),
}

impl SandboxError {
    /// Stable machine-readable code, used at the API boundary.
    pub fn code(&self) -> &'static str {
        match self {
            SandboxError::Provisioning(_) => "PROVISIONING_FAILED",
            SandboxError::Launch(_) => "LAUNCH_FAILED",
            SandboxError::PrematureExit { .. } => "PREMATURE_EXIT",
            SandboxError::ReadinessTimeout { .. } => "READINESS_TIMEOUT",
            SandboxError::Handshake { .. } => "HANDSHAKE_FAILED",
            SandboxError::NotReady { .. } => "NOT_READY",
            SandboxError::Channel(_) => "CHANNEL_ERROR",
            SandboxError::Descriptor(_) => "BAD_DESCRIPTOR",
        }
    }
}

impl From<zeromq::ZmqError> for SandboxError {
    fn from(err: zeromq::ZmqError) -> Self {
        SandboxError::Channel(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SandboxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_distinct() {
        let errors = [
            SandboxError::Provisioning("x".into()),
            SandboxError::Launch("x".into()),
            SandboxError::PrematureExit { logs: String::new() },
            SandboxError::ReadinessTimeout {
                waited: Duration::from_secs(1),
            },
            SandboxError::Handshake {
                reason: "x".into(),
                logs: String::new(),
            },
            SandboxError::NotReady { state: "closed" },
            SandboxError::Channel("x".into()),
            SandboxError::Descriptor("x".into()),
        ];

        let mut codes: Vec<_> = errors.iter().map(|e| e.code()).collect();
        codes.sort();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }

    #[test]
    fn not_ready_names_the_state() {
        let err = SandboxError::NotReady { state: "closed" };
        assert!(err.to_string().contains("closed"));
    }
}
