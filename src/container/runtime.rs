//! Container lifecycle
//!
//! Thin layer over the Docker API: launch a kernel container with its
//! channel ports published to loopback and the connection directory
//! mounted, poll liveness, capture logs, and tear down.

use std::collections::HashMap;
use std::path::Path;

use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::models::{HostConfig, PortBinding, PortMap};
use bollard::Docker;
use futures::StreamExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ChannelPorts;
use crate::error::{Result, SandboxError};

/// In-container directory the kernel writes its connection file to. The
/// host-side connection directory is bind-mounted here.
pub const CONTAINER_CONNECTION_DIR: &str = "/app";

/// Connection file name, on both sides of the mount.
pub const DESCRIPTOR_FILE: &str = "kernel.json";

/// Handle to a launched container.
#[derive(Debug, Clone)]
pub struct ContainerHandle {
    pub id: String,
    pub name: String,
}

/// Non-blocking liveness answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerStatus {
    Running,
    Exited,
}

/// Drives one container through launch, liveness checks, and removal.
pub struct ContainerRuntime {
    docker: Docker,
}

impl ContainerRuntime {
    pub fn new(docker: Docker) -> Self {
        Self { docker }
    }

    /// Connect to the local Docker daemon.
    pub fn connect() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| SandboxError::Launch(format!("cannot reach Docker daemon: {}", e)))?;
        Ok(Self::new(docker))
    }

    pub fn docker(&self) -> &Docker {
        &self.docker
    }

    /// Start a kernel container. Publishes each channel port to the same
    /// port on loopback and mounts `conn_dir` read-write at the in-container
    /// connection path. Returns as soon as the start call succeeds; readiness
    /// is the handshake's problem.
    pub async fn launch(
        &self,
        image: &str,
        ports: &ChannelPorts,
        conn_dir: &Path,
    ) -> Result<ContainerHandle> {
        let name = format!("kbx_{}", Uuid::new_v4().simple());

        let mut exposed_ports: HashMap<String, HashMap<(), ()>> = HashMap::new();
        let mut port_bindings: PortMap = HashMap::new();
        for port in ports.all() {
            let key = format!("{}/tcp", port);
            exposed_ports.insert(key.clone(), HashMap::new());
            port_bindings.insert(
                key,
                Some(vec![PortBinding {
                    host_ip: Some("127.0.0.1".to_string()),
                    host_port: Some(port.to_string()),
                }]),
            );
        }

        // The entrypoint reads these to pin the kernel to the published ports
        let env = vec![
            format!("KERNELBOX_HB_PORT={}", ports.hb),
            format!("KERNELBOX_SHELL_PORT={}", ports.shell),
            format!("KERNELBOX_IOPUB_PORT={}", ports.iopub),
            format!("KERNELBOX_STDIN_PORT={}", ports.stdin),
            format!("KERNELBOX_CONTROL_PORT={}", ports.control),
            format!(
                "KERNELBOX_CONNECTION_FILE={}/{}",
                CONTAINER_CONNECTION_DIR, DESCRIPTOR_FILE
            ),
        ];

        let config = Config {
            image: Some(image.to_string()),
            env: Some(env),
            exposed_ports: Some(exposed_ports),
            host_config: Some(HostConfig {
                binds: Some(vec![format!(
                    "{}:{}:rw",
                    conn_dir.display(),
                    CONTAINER_CONNECTION_DIR
                )]),
                port_bindings: Some(port_bindings),
                ..Default::default()
            }),
            ..Default::default()
        };

        debug!(image = %image, name = %name, "Creating container");

        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.clone(),
                    ..Default::default()
                }),
                config,
            )
            .await
            .map_err(|e| SandboxError::Launch(format!("create: {}", e)))?;

        if let Err(e) = self
            .docker
            .start_container(&created.id, None::<StartContainerOptions<String>>)
            .await
        {
            // Leave nothing behind when start itself refuses
            let _ = self.remove_if_exists(&created.id).await;
            return Err(SandboxError::Launch(format!("start: {}", e)));
        }

        info!(container_id = %created.id, name = %name, "Container started");

        Ok(ContainerHandle {
            id: created.id,
            name,
        })
    }

    /// Non-blocking liveness check, used while waiting for the kernel's
    /// connection file.
    pub async fn poll_status(&self, handle: &ContainerHandle) -> Result<ContainerStatus> {
        match self
            .docker
            .inspect_container(&handle.id, None::<InspectContainerOptions>)
            .await
        {
            Ok(inspect) => {
                let running = inspect
                    .state
                    .as_ref()
                    .and_then(|s| s.running)
                    .unwrap_or(false);
                Ok(if running {
                    ContainerStatus::Running
                } else {
                    ContainerStatus::Exited
                })
            }
            Err(e) if is_not_found(&e) => Ok(ContainerStatus::Exited),
            Err(e) => Err(SandboxError::Launch(format!("inspect: {}", e))),
        }
    }

    /// Tail of the container's combined output, attached to startup errors.
    pub async fn capture_logs(&self, handle: &ContainerHandle) -> String {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            tail: "120".to_string(),
            ..Default::default()
        };

        let mut stream = self.docker.logs(&handle.id, Some(options));
        let mut collected = String::new();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(output) => collected.push_str(&output.to_string()),
                Err(e) => {
                    debug!(container_id = %handle.id, error = %e, "Log capture stopped");
                    break;
                }
            }
        }
        collected
    }

    /// Stop then remove the container. "Already stopped" and "not found" are
    /// success, not errors.
    pub async fn stop_and_remove(&self, handle: &ContainerHandle) {
        if let Err(e) = self
            .docker
            .stop_container(&handle.id, Some(StopContainerOptions { t: 5 }))
            .await
        {
            if !is_not_found(&e) {
                debug!(container_id = %handle.id, error = %e, "Stop returned an error");
            }
        }

        if let Err(e) = self.remove_if_exists(&handle.id).await {
            warn!(container_id = %handle.id, error = %e, "Container removal failed");
        } else {
            info!(container_id = %handle.id, "Container removed");
        }
    }

    async fn remove_if_exists(&self, container_id: &str) -> Result<()> {
        match self
            .docker
            .remove_container(
                container_id,
                Some(RemoveContainerOptions {
                    force: true,
                    v: true,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(SandboxError::Launch(format!("remove: {}", e))),
        }
    }
}

fn is_not_found(error: &BollardError) -> bool {
    matches!(
        error,
        BollardError::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}
