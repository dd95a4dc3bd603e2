//! Container management for kernelbox
//!
//! Handles the Docker side of a session:
//! - Launching and removing kernel containers
//! - Liveness polling during the readiness wait
//! - The session object tying container + channels together

pub mod runtime;
pub mod session;

pub use runtime::{ContainerHandle, ContainerRuntime, ContainerStatus};
pub use session::{SandboxSession, SessionHandle, SessionState};
