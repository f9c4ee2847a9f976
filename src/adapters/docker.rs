//! Artifact registry backed by the Docker daemon, with image scanning through a
//! trivy-compatible CLI.

use anyhow::{Context, Result};
use async_trait::async_trait;
use bollard::auth::DockerCredentials;
use bollard::image::{BuildImageOptions, CreateImageOptions, PushImageOptions};
use bollard::Docker;
use bytes::Bytes;
use futures::StreamExt;
use serde::Deserialize;
use std::collections::HashMap;
use tokio::process::Command;

use super::{ArtifactRegistry, BuildRequest, ScanReport};
use crate::config::DockerConfig;

#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    #[error("Image scanner '{0}' could not be started: {1}")]
    Spawn(String, std::io::Error),
    #[error("Image scan failed: {0}")]
    Failed(String),
    #[error("Unreadable scan report: {0}")]
    Report(#[from] serde_json::Error),
    #[error("Image {reference} has {critical} critical and {high} high vulnerabilities (allowed: {max_critical} critical, {max_high} high)")]
    ThresholdExceeded {
        reference: String,
        critical: u32,
        high: u32,
        max_critical: u32,
        max_high: u32,
    },
}

pub struct DockerRegistry {
    client: Docker,
    scanner: String,
    credentials: Option<DockerCredentials>,
}

impl DockerRegistry {
    pub fn new(config: &DockerConfig) -> Result<Self> {
        // On Windows, always use local defaults (named pipe)
        // On Unix, use socket path if specified
        let socket = config.socket.as_str();
        let client = if cfg!(windows) || socket.starts_with("npipe://") || socket.starts_with("tcp://") {
            Docker::connect_with_local_defaults()?
        } else {
            Docker::connect_with_socket(socket, 120, bollard::API_DEFAULT_VERSION)?
        };

        let credentials = match (&config.registry_username, &config.registry_password) {
            (Some(username), Some(password)) => Some(DockerCredentials {
                username: Some(username.clone()),
                password: Some(password.clone()),
                ..Default::default()
            }),
            _ => None,
        };

        Ok(Self {
            client,
            scanner: config.scanner.clone(),
            credentials,
        })
    }

    pub async fn is_available(&self) -> bool {
        self.client.ping().await.is_ok()
    }
}

/// Split an image reference into (name, tag).
///
/// A colon followed by a path segment is a registry port, not a tag.
pub(crate) fn split_reference(image: &str) -> (String, String) {
    if image.contains('@') {
        return (image.to_string(), String::new());
    }
    match image.rsplit_once(':') {
        Some((name, tag)) if !tag.contains('/') => (name.to_string(), tag.to_string()),
        _ => (image.to_string(), "latest".to_string()),
    }
}

#[derive(Debug, Deserialize)]
struct TrivyReport {
    #[serde(rename = "Results", default)]
    results: Vec<TrivyResult>,
}

#[derive(Debug, Deserialize)]
struct TrivyResult {
    #[serde(rename = "Vulnerabilities", default)]
    vulnerabilities: Option<Vec<TrivyVulnerability>>,
}

#[derive(Debug, Deserialize)]
struct TrivyVulnerability {
    #[serde(rename = "Severity")]
    severity: String,
}

/// Count findings by severity in a trivy JSON report
pub(crate) fn parse_scan_report(json: &str) -> Result<ScanReport, ScanError> {
    let report: TrivyReport = serde_json::from_str(json)?;
    let mut counts = ScanReport::default();
    for vuln in report
        .results
        .iter()
        .flat_map(|r| r.vulnerabilities.iter().flatten())
    {
        match vuln.severity.to_uppercase().as_str() {
            "CRITICAL" => counts.critical += 1,
            "HIGH" => counts.high += 1,
            "MEDIUM" => counts.medium += 1,
            "LOW" => counts.low += 1,
            _ => {}
        }
    }
    Ok(counts)
}

#[async_trait]
impl ArtifactRegistry for DockerRegistry {
    async fn build_image(&self, request: &BuildRequest) -> Result<String> {
        // Tar the build context in memory
        let context = request.context.clone();
        let tar_data = tokio::task::spawn_blocking(move || -> Result<Vec<u8>> {
            let mut builder = tar::Builder::new(Vec::new());
            builder.append_dir_all(".", &context)?;
            Ok(builder.into_inner()?)
        })
        .await
        .context("Build context task panicked")?
        .with_context(|| format!("Failed to archive build context {}", request.context.display()))?;

        let build_args: HashMap<String, String> = request
            .build_args
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let options = BuildImageOptions {
            dockerfile: request.dockerfile.trim_start_matches("./").to_string(),
            t: request.reference.clone(),
            rm: true,
            buildargs: build_args,
            ..Default::default()
        };

        tracing::info!(image = %request.reference, "Building image");
        let mut stream = self
            .client
            .build_image(options, None, Some(Bytes::from(tar_data)));

        while let Some(result) = stream.next().await {
            match result {
                Ok(output) => {
                    if let Some(stream) = output.stream {
                        tracing::debug!("{}", stream.trim());
                    }
                    if let Some(error) = output.error {
                        anyhow::bail!("Build error: {}", error);
                    }
                }
                Err(e) => anyhow::bail!("Build failed: {}", e),
            }
        }

        Ok(request.reference.clone())
    }

    async fn pull_image(&self, reference: &str) -> Result<()> {
        tracing::info!(image = %reference, "Pulling image from registry");
        let (from_image, tag) = split_reference(reference);

        let options = CreateImageOptions {
            from_image,
            tag,
            ..Default::default()
        };

        let mut stream = self
            .client
            .create_image(Some(options), None, self.credentials.clone());

        while let Some(result) = stream.next().await {
            match result {
                Ok(info) => {
                    if let Some(status) = info.status {
                        tracing::debug!("{}", status);
                    }
                    if let Some(error) = info.error {
                        anyhow::bail!("Failed to pull image: {}", error);
                    }
                }
                Err(e) => anyhow::bail!("Failed to pull image: {}", e),
            }
        }

        tracing::info!(image = %reference, "Successfully pulled image");
        Ok(())
    }

    async fn push_image(&self, reference: &str) -> Result<()> {
        tracing::info!(image = %reference, "Pushing image to registry");
        let (name, tag) = split_reference(reference);

        let options = PushImageOptions { tag };
        let mut stream = self
            .client
            .push_image(&name, Some(options), self.credentials.clone());

        while let Some(result) = stream.next().await {
            match result {
                Ok(info) => {
                    if let Some(error) = info.error {
                        anyhow::bail!("Failed to push image: {}", error);
                    }
                }
                Err(e) => anyhow::bail!("Failed to push image: {}", e),
            }
        }

        Ok(())
    }

    async fn scan_image(&self, reference: &str) -> Result<ScanReport> {
        tracing::info!(image = %reference, scanner = %self.scanner, "Scanning image");
        let output = Command::new(&self.scanner)
            .args(["image", "--quiet", "--format", "json", reference])
            .output()
            .await
            .map_err(|e| ScanError::Spawn(self.scanner.clone(), e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ScanError::Failed(stderr.trim().to_string()).into());
        }

        let report = parse_scan_report(&String::from_utf8_lossy(&output.stdout))?;
        tracing::info!(
            image = %reference,
            critical = report.critical,
            high = report.high,
            "Image scan complete"
        );
        Ok(report)
    }
}
