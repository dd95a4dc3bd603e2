//! Configuration module for kernelbox
//!
//! Supports configuration via:
//! - TOML/YAML config files
//! - Environment variables (with KERNELBOX_ prefix)
//! - `.env` files in the working directory

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Sandbox engine settings
    #[serde(default)]
    pub sandbox: SandboxConfig,
}

/// Settings for one sandbox session: image, ports, timeouts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Container image hosting the kernel
    #[serde(default = "default_image")]
    pub image: String,

    /// Build the image before starting the session
    #[serde(default)]
    pub build_on_start: bool,

    /// Build context directory (required when build_on_start is set)
    #[serde(default)]
    pub build_context: Option<PathBuf>,

    /// Ports for the five kernel channels, published 1:1 to loopback
    #[serde(default)]
    pub ports: ChannelPorts,

    /// Bound on the whole readiness sequence: connection-file wait and the
    /// kernel probe each get this budget
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_secs: u64,

    /// Bound on waiting for the execute acknowledgement. Elapsing is not
    /// fatal: the call returns an execution-timeout fragment and the session
    /// stays usable
    #[serde(default = "default_ack_timeout")]
    pub ack_timeout_secs: u64,

    /// How long the output drain waits after the last matching event before
    /// concluding the submission is done. Larger values catch output from
    /// momentarily quiet code at the cost of added latency on every call;
    /// there is no value that is right for both
    #[serde(default = "default_drain_idle_ms")]
    pub drain_idle_timeout_ms: u64,
}

/// Host/container port assignment for the kernel channels.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ChannelPorts {
    #[serde(default = "default_hb_port")]
    pub hb: u16,
    #[serde(default = "default_shell_port")]
    pub shell: u16,
    #[serde(default = "default_iopub_port")]
    pub iopub: u16,
    #[serde(default = "default_stdin_port")]
    pub stdin: u16,
    #[serde(default = "default_control_port")]
    pub control: u16,
}

impl ChannelPorts {
    pub fn all(&self) -> [u16; 5] {
        [self.hb, self.shell, self.iopub, self.stdin, self.control]
    }
}

impl SandboxConfig {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_secs(self.ack_timeout_secs)
    }

    pub fn drain_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_idle_timeout_ms)
    }
}

// Default value functions
fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_image() -> String {
    "kernelbox-sandbox:latest".to_string()
}

fn default_startup_timeout() -> u64 {
    60
}

fn default_ack_timeout() -> u64 {
    30
}

fn default_drain_idle_ms() -> u64 {
    200
}

fn default_hb_port() -> u16 {
    50000
}

fn default_shell_port() -> u16 {
    50001
}

fn default_iopub_port() -> u16 {
    50002
}

fn default_stdin_port() -> u16 {
    50003
}

fn default_control_port() -> u16 {
    50004
}

impl Default for ChannelPorts {
    fn default() -> Self {
        Self {
            hb: default_hb_port(),
            shell: default_shell_port(),
            iopub: default_iopub_port(),
            stdin: default_stdin_port(),
            control: default_control_port(),
        }
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            image: default_image(),
            build_on_start: false,
            build_context: None,
            ports: ChannelPorts::default(),
            startup_timeout_secs: default_startup_timeout(),
            ack_timeout_secs: default_ack_timeout(),
            drain_idle_timeout_ms: default_drain_idle_ms(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            log_level: default_log_level(),
            sandbox: SandboxConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from file and environment variables
    pub fn load() -> Result<Self> {
        // Pick up a .env file if present
        let _ = dotenvy::dotenv();

        let config = config::Config::builder()
            // Start with defaults
            .add_source(config::Config::try_from(&AppConfig::default())?)
            // Load from config file if present
            .add_source(config::File::with_name("config/kernelbox").required(false))
            .add_source(config::File::with_name("/etc/kernelbox/config").required(false))
            // Override with environment variables (KERNELBOX_ prefix)
            .add_source(
                config::Environment::with_prefix("KERNELBOX")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to build configuration")?;

        let app_config: AppConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        app_config.validate()?;

        Ok(app_config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            anyhow::bail!("Port cannot be 0");
        }

        if self.sandbox.image.is_empty() {
            anyhow::bail!("Sandbox image cannot be empty");
        }

        if self.sandbox.build_on_start && self.sandbox.build_context.is_none() {
            anyhow::bail!("build_on_start requires build_context");
        }

        if self.sandbox.startup_timeout_secs == 0 {
            anyhow::bail!("Startup timeout cannot be 0");
        }

        if self.sandbox.ack_timeout_secs == 0 {
            anyhow::bail!("Ack timeout cannot be 0");
        }

        let ports = self.sandbox.ports.all();
        let mut deduped = ports.to_vec();
        deduped.sort_unstable();
        deduped.dedup();
        if deduped.len() != ports.len() {
            anyhow::bail!("Channel ports must be distinct");
        }

        Ok(())
    }
}
