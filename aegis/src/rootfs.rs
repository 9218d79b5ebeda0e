//! Rootfs provider seam.
//!
//! Image pull and rootfs materialization are external concerns: the daemon
//! asks a [`RootfsProvider`] for an immutable artifact matching the format
//! the chosen hypervisor backend requires and never looks inside it.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use aegis_shared::errors::{AegisError, AegisResult};

/// Artifact format a backend can boot from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RootfsFormat {
    /// Shared directory, mounted virtiofs-style.
    Directory,
    /// Raw block image.
    BlockImage,
}

/// Immutable materialized filesystem for one image reference.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RootfsArtifact {
    pub image_digest: String,
    pub path: PathBuf,
    pub format: RootfsFormat,
}

/// Black-box materializer: OCI reference in, bootable artifact out.
#[async_trait]
pub trait RootfsProvider: Send + Sync {
    async fn materialize(
        &self,
        image_ref: &str,
        format: RootfsFormat,
    ) -> AegisResult<RootfsArtifact>;
}

/// Provider that shells out to an external materializer:
///
/// ```text
/// <binary> <image_ref> <directory|block-image> <dest_dir>
/// ```
///
/// The tool prints the artifact digest on stdout and leaves the artifact at
/// `<dest_dir>/rootfs` (a directory or an image file, per format).
pub struct CommandRootfsProvider {
    binary: PathBuf,
    cache_dir: PathBuf,
}

impl CommandRootfsProvider {
    pub fn new(binary: PathBuf, cache_dir: PathBuf) -> Self {
        Self { binary, cache_dir }
    }
}

#[async_trait]
impl RootfsProvider for CommandRootfsProvider {
    async fn materialize(
        &self,
        image_ref: &str,
        format: RootfsFormat,
    ) -> AegisResult<RootfsArtifact> {
        let format_arg = match format {
            RootfsFormat::Directory => "directory",
            RootfsFormat::BlockImage => "block-image",
        };
        let dest = self.cache_dir.join(sanitize_ref(image_ref)).join(format_arg);
        tokio::fs::create_dir_all(&dest)
            .await
            .map_err(|e| AegisError::Io(format!("create {}: {e}", dest.display())))?;

        let output = tokio::process::Command::new(&self.binary)
            .arg(image_ref)
            .arg(format_arg)
            .arg(&dest)
            .output()
            .await
            .map_err(|e| {
                AegisError::Backend(format!(
                    "spawn rootfs provider {}: {e}",
                    self.binary.display()
                ))
            })?;

        if !output.status.success() {
            return Err(AegisError::Backend(format!(
                "rootfs provider failed for {image_ref}: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let digest = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if digest.is_empty() {
            return Err(AegisError::Backend(format!(
                "rootfs provider produced no digest for {image_ref}"
            )));
        }

        Ok(RootfsArtifact {
            image_digest: digest,
            path: dest.join("rootfs"),
            format,
        })
    }
}

/// Test/development provider handing out pre-made directories without
/// touching any registry.
pub struct FixtureRootfsProvider {
    root: PathBuf,
}

impl FixtureRootfsProvider {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }
}

#[async_trait]
impl RootfsProvider for FixtureRootfsProvider {
    async fn materialize(
        &self,
        image_ref: &str,
        format: RootfsFormat,
    ) -> AegisResult<RootfsArtifact> {
        let path = self.root.join(sanitize_ref(image_ref));
        tokio::fs::create_dir_all(&path)
            .await
            .map_err(|e| AegisError::Io(format!("create {}: {e}", path.display())))?;
        Ok(RootfsArtifact {
            image_digest: format!("fixture:{}", sanitize_ref(image_ref)),
            path,
            format,
        })
    }
}

fn sanitize_ref(image_ref: &str) -> String {
    image_ref
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
        .collect()
}

/// Path presence check shared by drivers before boot.
pub fn require_artifact(artifact: &RootfsArtifact, want: RootfsFormat) -> AegisResult<()> {
    if artifact.format != want {
        return Err(AegisError::Validation(format!(
            "backend requires a {want:?} rootfs, provider produced {:?}",
            artifact.format
        )));
    }
    if !Path::new(&artifact.path).exists() {
        return Err(AegisError::Backend(format!(
            "rootfs artifact missing at {}",
            artifact.path.display()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_keeps_refs_path_safe() {
        assert_eq!(sanitize_ref("python:3.12-alpine"), "python_3.12-alpine");
        assert_eq!(sanitize_ref("ghcr.io/org/img@sha256:ab"), "ghcr.io_org_img_sha256_ab");
    }

    #[tokio::test]
    async fn fixture_provider_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let provider = FixtureRootfsProvider::new(dir.path().to_path_buf());
        let artifact = provider
            .materialize("alpine:3.20", RootfsFormat::Directory)
            .await
            .unwrap();
        assert!(artifact.path.exists());
        require_artifact(&artifact, RootfsFormat::Directory).unwrap();
        assert!(require_artifact(&artifact, RootfsFormat::BlockImage).is_err());
    }
}
