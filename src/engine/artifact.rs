//! Resolve the release artifact a rollout will run.

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::adapters::{ArtifactRegistry, ScanError, ScanReport, SourceHosting, WorkflowDispatch, WorkflowRun};
use crate::db::{DeploymentConfig, ScanThresholds, SourceDescriptor};

pub struct ArtifactResolver {
    registry: Arc<dyn ArtifactRegistry>,
    source: Arc<dyn SourceHosting>,
    poll_interval: Duration,
    build_timeout: Duration,
}

/// Fail when scan findings exceed the configured limits
pub fn check_scan(reference: &str, report: &ScanReport, thresholds: &ScanThresholds) -> Result<(), ScanError> {
    if report.critical > thresholds.max_critical || report.high > thresholds.max_high {
        return Err(ScanError::ThresholdExceeded {
            reference: reference.to_string(),
            critical: report.critical,
            high: report.high,
            max_critical: thresholds.max_critical,
            max_high: thresholds.max_high,
        });
    }
    Ok(())
}

/// Wait for the workflow run started by a dispatch issued at `dispatched_at`.
///
/// Dispatches carry no run id, so the newest run created after the dispatch
/// on the same ref is taken as ours.
pub async fn await_workflow_run(
    source: &dyn SourceHosting,
    dispatch: &WorkflowDispatch,
    dispatched_at: chrono::DateTime<chrono::Utc>,
    poll_interval: Duration,
    timeout: Duration,
) -> Result<WorkflowRun> {
    let started = Instant::now();

    loop {
        let runs = source
            .list_workflow_runs(&dispatch.owner, &dispatch.repo, &dispatch.workflow_id)
            .await
            .context("Failed to list workflow runs")?;

        let ours = runs.into_iter().find(|run| {
            let created_after = chrono::DateTime::parse_from_rfc3339(&run.created_at)
                .map(|created| created >= dispatched_at)
                .unwrap_or(false);
            let same_ref = run
                .head_branch
                .as_deref()
                .map(|branch| branch == dispatch.git_ref)
                .unwrap_or(true);
            created_after && same_ref
        });

        if let Some(run) = ours {
            if run.is_completed() {
                if run.succeeded() {
                    return Ok(run);
                }
                anyhow::bail!(
                    "Workflow {} run {} concluded with {}",
                    dispatch.workflow_id,
                    run.id,
                    run.conclusion.as_deref().unwrap_or("unknown")
                );
            }
            tracing::debug!(run_id = run.id, status = %run.status, "Workflow run in progress");
        }

        if started.elapsed() + poll_interval > timeout {
            anyhow::bail!(
                "Workflow {} did not complete within {}s",
                dispatch.workflow_id,
                timeout.as_secs()
            );
        }
        tokio::time::sleep(poll_interval).await;
    }
}

impl ArtifactResolver {
    pub fn new(
        registry: Arc<dyn ArtifactRegistry>,
        source: Arc<dyn SourceHosting>,
        poll_interval: Duration,
        build_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            source,
            poll_interval,
            build_timeout,
        }
    }

    /// Produce the image reference for `version`. A dry run only computes it.
    pub async fn resolve(&self, config: &DeploymentConfig, version: &str, dry_run: bool) -> Result<String> {
        let reference = format!("{}:{}", config.source.image_repository(), config.image_tag(version));

        if dry_run {
            tracing::info!(image = %reference, "Dry run, skipping artifact preparation");
            return Ok(reference);
        }

        match &config.source {
            SourceDescriptor::Image { .. } => {
                self.registry
                    .pull_image(&reference)
                    .await
                    .context("Failed to pull image from registry")?;
                let report = self.registry.scan_image(&reference).await.context("Image scan failed")?;
                check_scan(&reference, &report, &config.security_scan)?;
            }
            SourceDescriptor::Repository {
                owner,
                repo,
                workflow_id,
                git_ref,
                path,
                inputs,
                ..
            } => {
                let mut inputs: BTreeMap<String, String> = inputs.clone();
                inputs.insert("version".to_string(), version.to_string());
                inputs.insert("image".to_string(), reference.clone());
                if let Some(path) = path {
                    inputs.insert("path".to_string(), path.clone());
                }
                let dispatch = WorkflowDispatch {
                    owner: owner.clone(),
                    repo: repo.clone(),
                    workflow_id: workflow_id.clone(),
                    git_ref: git_ref.clone(),
                    inputs,
                };

                let dispatched_at = chrono::Utc::now() - chrono::Duration::seconds(5);
                self.source
                    .trigger_workflow(&dispatch)
                    .await
                    .context("Failed to trigger build workflow")?;
                tracing::info!(owner = %owner, repo = %repo, workflow = %workflow_id, "Build workflow dispatched");

                let run = await_workflow_run(
                    self.source.as_ref(),
                    &dispatch,
                    dispatched_at,
                    self.poll_interval,
                    self.build_timeout,
                )
                .await?;
                tracing::info!(run_id = run.id, image = %reference, "Build workflow completed");
            }
            SourceDescriptor::Chart {
                repository,
                name,
                chart_version,
                ..
            } => {
                tracing::info!(
                    chart = %name,
                    repository = %repository,
                    chart_version = chart_version.as_deref().unwrap_or("latest"),
                    image = %reference,
                    "Chart staged"
                );
            }
        }

        Ok(reference)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::fake::{FakeAdapters, FakeSource};

    fn config(source: serde_json::Value) -> DeploymentConfig {
        serde_json::from_value(serde_json::json!({
            "name": "api",
            "application": "api",
            "version": "2.0.0",
            "environment": "production",
            "source": source,
            "health_check": {"type": "none"}
        }))
        .unwrap()
    }

    fn resolver(fakes: &FakeAdapters) -> ArtifactResolver {
        let adapters = fakes.adapters();
        ArtifactResolver::new(
            adapters.registry,
            adapters.source,
            Duration::from_millis(1),
            Duration::from_millis(50),
        )
    }

    #[tokio::test]
    async fn test_image_source_pulls_and_scans() {
        let fakes = FakeAdapters::default();
        let config = config(serde_json::json!({"type": "image", "repository": "registry.test/api"}));
        let reference = resolver(&fakes).resolve(&config, "2.0.0", false).await.unwrap();
        assert_eq!(reference, "registry.test/api:2.0.0");
        assert_eq!(
            fakes.registry.calls(),
            vec!["pull registry.test/api:2.0.0", "scan registry.test/api:2.0.0"]
        );
    }

    #[tokio::test]
    async fn test_scan_findings_over_threshold_abort() {
        let fakes = FakeAdapters::default();
        fakes.registry.scan.lock().unwrap().critical = 1;
        let config = config(serde_json::json!({"type": "image", "repository": "registry.test/api"}));
        let err = resolver(&fakes).resolve(&config, "2.0.0", false).await.unwrap_err();
        assert!(err.to_string().contains("1 critical"));
    }

    #[tokio::test]
    async fn test_dry_run_makes_no_calls() {
        let fakes = FakeAdapters::default();
        let config = config(serde_json::json!({"type": "image", "repository": "registry.test/api", "tag": "pinned"}));
        let reference = resolver(&fakes).resolve(&config, "2.0.0", true).await.unwrap();
        assert_eq!(reference, "registry.test/api:pinned");
        assert!(fakes.registry.calls().is_empty());
    }

    #[tokio::test]
    async fn test_repository_source_waits_for_build() {
        let fakes = FakeAdapters::default();
        fakes.source.runs.lock().unwrap().push(FakeSource::completed_run(7, "success"));
        let config = config(serde_json::json!({
            "type": "repository", "owner": "acme", "repo": "api",
            "workflow_id": "build.yml", "image": "ghcr.io/acme/api"
        }));
        let reference = resolver(&fakes).resolve(&config, "2.0.0", false).await.unwrap();
        assert_eq!(reference, "ghcr.io/acme/api:2.0.0");
        assert_eq!(fakes.source.calls(), vec!["dispatch acme/api build.yml@main"]);
    }

    #[tokio::test]
    async fn test_failed_build_run_fails_resolution() {
        let fakes = FakeAdapters::default();
        fakes.source.runs.lock().unwrap().push(FakeSource::completed_run(8, "failure"));
        let config = config(serde_json::json!({
            "type": "repository", "owner": "acme", "repo": "api",
            "workflow_id": "build.yml", "image": "ghcr.io/acme/api"
        }));
        let err = resolver(&fakes).resolve(&config, "2.0.0", false).await.unwrap_err();
        assert!(err.to_string().contains("failure"));
    }

    #[tokio::test]
    async fn test_missing_run_times_out() {
        let fakes = FakeAdapters::default();
        let config = config(serde_json::json!({
            "type": "repository", "owner": "acme", "repo": "api",
            "workflow_id": "build.yml", "image": "ghcr.io/acme/api"
        }));
        let err = resolver(&fakes).resolve(&config, "2.0.0", false).await.unwrap_err();
        assert!(err.to_string().contains("did not complete"));
    }

    #[tokio::test]
    async fn test_chart_source_is_staged_without_calls() {
        let fakes = FakeAdapters::default();
        let config = config(serde_json::json!({
            "type": "chart", "repository": "https://charts.test", "name": "api",
            "chart_version": "1.2.3", "image": "registry.test/api"
        }));
        let reference = resolver(&fakes).resolve(&config, "2.0.0", false).await.unwrap();
        assert_eq!(reference, "registry.test/api:2.0.0");
        assert!(fakes.registry.calls().is_empty());
        assert!(fakes.source.calls().is_empty());
    }
}
