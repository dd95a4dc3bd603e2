//! Kernel connection descriptor
//!
//! The in-container kernel writes a JSON connection file at startup; this is
//! the only readiness signal the engine gets. The file surfaces through a
//! bind mount, so a reader can observe it half-written: a parse failure
//! while the startup clock is still running means "try again", never "give
//! up".

use std::path::Path;

use serde::{Deserialize, Serialize};

/// Signature scheme this engine speaks.
pub const SIGNATURE_SCHEME: &str = "hmac-sha256";

/// Connection contract published by the kernel: one port per channel, the
/// signing key, and the address the kernel bound to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionDescriptor {
    pub ip: String,
    pub transport: String,
    pub shell_port: u16,
    pub iopub_port: u16,
    pub stdin_port: u16,
    pub control_port: u16,
    pub hb_port: u16,
    pub key: String,
    pub signature_scheme: String,
    #[serde(default)]
    pub kernel_name: Option<String>,
}

impl ConnectionDescriptor {
    /// Read the descriptor if it is fully written. `None` means "not there
    /// yet or still being written" and the caller should poll again.
    pub fn try_read(path: &Path) -> Option<Self> {
        let raw = std::fs::read_to_string(path).ok()?;
        serde_json::from_str(&raw).ok()
    }

    /// The descriptor carries the container-internal address, which is not
    /// reachable from the host. The channel ports are published to loopback,
    /// so rewrite the address once before any channel is opened.
    pub fn patch_loopback(&mut self) {
        self.ip = "127.0.0.1".to_string();
    }

    /// Endpoint string for one channel port.
    pub fn endpoint(&self, port: u16) -> String {
        format!("{}://{}:{}", self.transport, self.ip, port)
    }

    pub fn signing_key(&self) -> &[u8] {
        self.key.as_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample_json() -> String {
        serde_json::json!({
            "ip": "0.0.0.0",
            "transport": "tcp",
            "shell_port": 50001,
            "iopub_port": 50002,
            "stdin_port": 50003,
            "control_port": 50004,
            "hb_port": 50000,
            "key": "5b9ee7b2-f6e4-4a85-9d0b-2e1b9f0c11aa",
            "signature_scheme": "hmac-sha256",
            "kernel_name": "python3"
        })
        .to_string()
    }

    #[test]
    fn reads_complete_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kernel.json");
        std::fs::write(&path, sample_json()).unwrap();

        let descriptor = ConnectionDescriptor::try_read(&path).unwrap();
        assert_eq!(descriptor.shell_port, 50001);
        assert_eq!(descriptor.signature_scheme, SIGNATURE_SCHEME);
    }

    #[test]
    fn missing_file_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ConnectionDescriptor::try_read(&dir.path().join("kernel.json")).is_none());
    }

    #[test]
    fn truncated_file_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kernel.json");
        let full = sample_json();
        std::fs::write(&path, &full[..full.len() / 2]).unwrap();

        assert!(ConnectionDescriptor::try_read(&path).is_none());
    }

    #[test]
    fn loopback_patch_rewrites_only_the_address() {
        let mut descriptor: ConnectionDescriptor =
            serde_json::from_str(&sample_json()).unwrap();
        descriptor.patch_loopback();

        assert_eq!(descriptor.ip, "127.0.0.1");
        assert_eq!(descriptor.endpoint(descriptor.shell_port), "tcp://127.0.0.1:50001");
        assert_eq!(descriptor.key, "5b9ee7b2-f6e4-4a85-9d0b-2e1b9f0c11aa");
    }
}
