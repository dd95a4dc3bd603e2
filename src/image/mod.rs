//! Image provisioning
//!
//! Builds (or verifies) the sandbox image the session containers run. The
//! daemon's layer cache makes a rebuild of an unchanged context cheap, so
//! the build is safe to run on every startup.

use std::path::Path;

use bollard::image::BuildImageOptions;
use bollard::Docker;
use futures::StreamExt;
use tracing::{debug, info};

use crate::error::{Result, SandboxError};

/// Handle to a usable sandbox image.
#[derive(Debug, Clone)]
pub struct ImageHandle {
    pub tag: String,
}

/// Builds sandbox images through the Docker API.
pub struct ImageProvisioner {
    docker: Docker,
}

impl ImageProvisioner {
    pub fn new(docker: Docker) -> Self {
        Self { docker }
    }

    /// Build `tag` from `context_dir`. Fails on the first error the build
    /// reports; never retries.
    pub async fn build(&self, tag: &str, context_dir: &Path) -> Result<ImageHandle> {
        if !context_dir.is_dir() {
            return Err(SandboxError::Provisioning(format!(
                "build context {} does not exist",
                context_dir.display()
            )));
        }

        info!(tag = %tag, context = %context_dir.display(), "Building sandbox image");

        let archive = pack_context(context_dir).await?;

        let options = BuildImageOptions::<String> {
            dockerfile: "Dockerfile".to_string(),
            t: tag.to_string(),
            rm: true,
            ..Default::default()
        };

        let mut stream = self.docker.build_image(options, None, Some(archive.into()));

        while let Some(item) = stream.next().await {
            let update = item.map_err(|e| {
                SandboxError::Provisioning(format!("image build failed: {}", e))
            })?;

            if let Some(error) = update.error {
                return Err(SandboxError::Provisioning(format!(
                    "image build step failed: {}",
                    error
                )));
            }

            if let Some(line) = update.stream {
                let line = line.trim_end();
                if !line.is_empty() {
                    debug!(tag = %tag, "{}", line);
                }
            }
        }

        info!(tag = %tag, "Sandbox image ready");

        Ok(ImageHandle {
            tag: tag.to_string(),
        })
    }
}

/// Pack the build context into an uncompressed tar archive.
async fn pack_context(context_dir: &Path) -> Result<Vec<u8>> {
    let dir = context_dir.to_path_buf();

    tokio::task::spawn_blocking(move || {
        let mut builder = tar::Builder::new(Vec::new());
        builder
            .append_dir_all(".", &dir)
            .map_err(|e| SandboxError::Provisioning(format!("packing build context: {}", e)))?;
        builder
            .into_inner()
            .map_err(|e| SandboxError::Provisioning(format!("packing build context: {}", e)))
    })
    .await
    .map_err(|e| SandboxError::Provisioning(format!("build context task failed: {}", e)))?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_context_is_a_provisioning_error() {
        let docker = Docker::connect_with_local_defaults().unwrap();
        let provisioner = ImageProvisioner::new(docker);

        let err = provisioner
            .build("kernelbox-test:latest", Path::new("/nonexistent/context"))
            .await
            .unwrap_err();

        assert_eq!(err.code(), "PROVISIONING_FAILED");
    }

    #[tokio::test]
    async fn pack_context_includes_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Dockerfile"), "FROM scratch\n").unwrap();

        let archive = pack_context(dir.path()).await.unwrap();

        let mut found = false;
        let mut reader = tar::Archive::new(archive.as_slice());
        for entry in reader.entries().unwrap() {
            let entry = entry.unwrap();
            if entry.path().unwrap().ends_with("Dockerfile") {
                found = true;
            }
        }
        assert!(found);
    }
}
