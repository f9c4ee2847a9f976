//! Infrastructure operator that shells out to the Terraform CLI.

use anyhow::Result;
use async_trait::async_trait;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

use super::{InfraOperator, InfraRequest};

#[derive(Debug, thiserror::Error)]
pub enum TerraformError {
    #[error("Terraform working directory does not exist: {0}")]
    MissingWorkingDir(String),
    #[error("Failed to run {binary}: {source}")]
    Spawn {
        binary: String,
        source: std::io::Error,
    },
    #[error("terraform {command} exited with {code}: {stderr}")]
    CommandFailed {
        command: String,
        code: i32,
        stderr: String,
    },
}

pub struct TerraformCli {
    binary: String,
}

impl TerraformCli {
    pub fn new(binary: String) -> Self {
        Self { binary }
    }

    fn command(&self, request: &InfraRequest, args: &[&str], with_vars: bool) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.current_dir(&request.working_dir)
            .args(args)
            .arg("-input=false")
            .arg("-no-color")
            .env("TF_IN_AUTOMATION", "1")
            .stdin(Stdio::null());

        if let Some(workspace) = &request.workspace {
            cmd.env("TF_WORKSPACE", workspace);
        }
        if with_vars {
            for (key, value) in &request.variables {
                debug!("Setting terraform variable: {}", key);
                cmd.arg("-var").arg(format!("{}={}", key, value));
            }
        }
        cmd
    }

    async fn run(&self, request: &InfraRequest, args: &[&str], with_vars: bool) -> Result<String> {
        if !request.working_dir.is_dir() {
            return Err(TerraformError::MissingWorkingDir(request.working_dir.display().to_string()).into());
        }

        let output = self
            .command(request, args, with_vars)
            .output()
            .await
            .map_err(|source| TerraformError::Spawn {
                binary: self.binary.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(TerraformError::CommandFailed {
                command: args.first().copied().unwrap_or_default().to_string(),
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            }
            .into());
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

#[async_trait]
impl InfraOperator for TerraformCli {
    async fn init(&self, request: &InfraRequest) -> Result<String> {
        self.run(request, &["init"], false).await
    }

    async fn plan(&self, request: &InfraRequest) -> Result<String> {
        self.run(request, &["plan"], true).await
    }

    async fn apply(&self, request: &InfraRequest) -> Result<String> {
        self.run(request, &["apply", "-auto-approve"], true).await
    }

    async fn destroy(&self, request: &InfraRequest) -> Result<String> {
        self.run(request, &["destroy", "-auto-approve"], true).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    #[tokio::test]
    async fn test_missing_working_dir() {
        let cli = TerraformCli::new("terraform".to_string());
        let request = InfraRequest {
            working_dir: PathBuf::from("/nonexistent/infra"),
            variables: BTreeMap::new(),
            workspace: None,
        };
        let err = cli.init(&request).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TerraformError>(),
            Some(TerraformError::MissingWorkingDir(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_binary_is_spawn_error() {
        let dir = tempfile::tempdir().unwrap();
        let cli = TerraformCli::new("definitely-not-terraform-binary".to_string());
        let request = InfraRequest {
            working_dir: dir.path().to_path_buf(),
            variables: BTreeMap::new(),
            workspace: Some("staging".to_string()),
        };
        let err = cli.plan(&request).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TerraformError>(),
            Some(TerraformError::Spawn { .. })
        ));
    }
}
