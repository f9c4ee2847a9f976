//! Execution of single pipeline steps, one arm per step kind.

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;

use super::artifact::await_workflow_run;
use super::strategy::{RolloutPlan, StrategyExecutor};
use crate::adapters::{Adapters, BuildRequest, InfraRequest, QualityAnalysis, QualityRequest, WorkflowDispatch};
use crate::config::PipelineSettings;
use crate::db::{StepKind, TerraformAction};

const MAX_OUTPUT_CHARS: usize = 4000;
const DEFAULT_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// What a step sees of the run it belongs to
#[derive(Debug, Clone)]
pub struct StepContext<'a> {
    pub execution_id: &'a str,
    /// Pipeline env merged with the trigger's overrides
    pub env: &'a BTreeMap<String, String>,
}

impl StepContext<'_> {
    fn version(&self) -> Option<&str> {
        self.env.get("VERSION").map(String::as_str)
    }

    /// DNS-safe release label for workloads rolled out by this run
    fn release(&self) -> String {
        self.execution_id
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .take(8)
            .collect::<String>()
            .to_lowercase()
    }
}

/// Result of a step that ran to completion
#[derive(Debug, Clone, Default)]
pub struct StepOutcome {
    pub output: Option<String>,
    /// Image reference produced by the step
    pub artifact: Option<String>,
    pub quality: Option<QualityAnalysis>,
    /// Set when a blocking quality analysis did not pass. Not retried.
    pub blocked: Option<String>,
}

impl StepOutcome {
    fn output(output: impl Into<String>) -> Self {
        Self {
            output: Some(output.into()),
            ..Default::default()
        }
    }
}

fn truncate(text: &str) -> String {
    let text = text.trim();
    match text.char_indices().nth(MAX_OUTPUT_CHARS) {
        Some((cut, _)) => format!("{}... (truncated)", &text[..cut]),
        None => text.to_string(),
    }
}

fn image_reference(image: &str, tag: Option<&str>, ctx: &StepContext<'_>) -> String {
    let tag = tag.or(ctx.version()).unwrap_or("latest");
    format!("{}:{}", image, tag)
}

pub struct StepRunner {
    adapters: Adapters,
    strategies: Arc<StrategyExecutor>,
    settings: PipelineSettings,
}

impl StepRunner {
    pub fn new(adapters: Adapters, strategies: Arc<StrategyExecutor>, settings: PipelineSettings) -> Self {
        Self {
            adapters,
            strategies,
            settings,
        }
    }

    pub async fn run(&self, kind: &StepKind, ctx: &StepContext<'_>) -> Result<StepOutcome> {
        match kind {
            StepKind::DockerBuild {
                context,
                dockerfile,
                image,
                tag,
                build_args,
            } => {
                let request = BuildRequest {
                    context: PathBuf::from(context),
                    dockerfile: dockerfile.clone(),
                    reference: image_reference(image, tag.as_deref(), ctx),
                    build_args: build_args.clone(),
                };
                let reference = self
                    .adapters
                    .registry
                    .build_image(&request)
                    .await
                    .with_context(|| format!("Failed to build {}", request.reference))?;
                Ok(StepOutcome {
                    output: Some(format!("Built {}", reference)),
                    artifact: Some(reference),
                    ..Default::default()
                })
            }

            StepKind::DockerPush { image, tag } => {
                let reference = image_reference(image, tag.as_deref(), ctx);
                self.adapters
                    .registry
                    .push_image(&reference)
                    .await
                    .with_context(|| format!("Failed to push {}", reference))?;
                Ok(StepOutcome::output(format!("Pushed {}", reference)))
            }

            StepKind::KubernetesDeploy {
                application,
                image,
                version,
                strategy,
                target,
            } => {
                let tag = version.as_deref().or(ctx.version()).unwrap_or("latest");
                let service = target.service.clone().unwrap_or_else(|| application.clone());
                let plan = RolloutPlan {
                    application: application.clone(),
                    release: ctx.release(),
                    image: format!("{}:{}", image, tag),
                    strategy: strategy.clone(),
                    target: target.clone(),
                    service,
                };
                let outcome = self.strategies.execute(&plan).await?;
                Ok(StepOutcome {
                    output: Some(format!("{} rolled out as {}", plan.image, outcome.workload)),
                    artifact: Some(plan.image),
                    ..Default::default()
                })
            }

            StepKind::Script {
                script,
                env,
                working_dir,
                timeout_ms,
            } => {
                let timeout = timeout_ms
                    .map(Duration::from_millis)
                    .unwrap_or_else(|| self.settings.script_timeout());
                run_script(script, ctx.env, env, working_dir.as_deref(), timeout).await
            }

            StepKind::GithubAction {
                owner,
                repo,
                workflow_id,
                git_ref,
                inputs,
                wait,
                timeout_ms,
            } => {
                let dispatch = WorkflowDispatch {
                    owner: owner.clone(),
                    repo: repo.clone(),
                    workflow_id: workflow_id.clone(),
                    git_ref: git_ref.clone(),
                    inputs: inputs.clone(),
                };
                let dispatched_at = chrono::Utc::now() - chrono::Duration::seconds(5);
                self.adapters
                    .source
                    .trigger_workflow(&dispatch)
                    .await
                    .context("Failed to dispatch workflow")?;

                if !wait {
                    return Ok(StepOutcome::output(format!(
                        "Dispatched {} on {}/{}@{}",
                        workflow_id, owner, repo, git_ref
                    )));
                }

                let timeout = timeout_ms
                    .map(Duration::from_millis)
                    .unwrap_or_else(|| self.settings.workflow_timeout());
                let run = await_workflow_run(
                    self.adapters.source.as_ref(),
                    &dispatch,
                    dispatched_at,
                    self.settings.workflow_poll_interval(),
                    timeout,
                )
                .await?;
                Ok(StepOutcome::output(format!(
                    "Workflow run {} concluded with {}",
                    run.id,
                    run.conclusion.as_deref().unwrap_or("success")
                )))
            }

            StepKind::Terraform {
                working_dir,
                action,
                variables,
                workspace,
            } => {
                let request = InfraRequest {
                    working_dir: PathBuf::from(working_dir),
                    variables: variables.clone(),
                    workspace: workspace.clone(),
                };
                let infra = &self.adapters.infra;
                let mut output = infra.init(&request).await.context("terraform init failed")?;
                let result = match action {
                    TerraformAction::Plan => infra.plan(&request).await,
                    TerraformAction::Apply => infra.apply(&request).await,
                    TerraformAction::Destroy => infra.destroy(&request).await,
                }
                .with_context(|| format!("terraform {:?} failed", action).to_lowercase())?;
                output.push('\n');
                output.push_str(&result);
                Ok(StepOutcome::output(truncate(&output)))
            }

            StepKind::QualityAnalysis {
                project_id,
                path,
                block_on_failure,
                min_score,
            } => {
                let analysis = self
                    .adapters
                    .quality
                    .analyze_for_deployment(&QualityRequest {
                        project_id: project_id.clone(),
                        path: path.clone(),
                        environment: None,
                        min_score: *min_score,
                    })
                    .await
                    .context("Quality analysis failed")?;

                let summary = format!(
                    "Quality score {:.1} with {} blocker(s)",
                    analysis.score,
                    analysis.blockers.len()
                );
                let blocked = (*block_on_failure && !analysis.passed)
                    .then(|| format!("Quality analysis did not pass: {}", summary));
                Ok(StepOutcome {
                    output: Some(summary),
                    quality: Some(analysis),
                    blocked,
                    ..Default::default()
                })
            }
        }
    }
}

/// Run `script` with `sh -c` in a cleared environment.
///
/// Only PATH, the pipeline env and the step env are visible. Without a
/// working directory the script runs in a fresh temporary one. The process
/// is killed when `timeout` elapses.
pub async fn run_script(
    script: &str,
    pipeline_env: &BTreeMap<String, String>,
    step_env: &BTreeMap<String, String>,
    working_dir: Option<&str>,
    timeout: Duration,
) -> Result<StepOutcome> {
    let scratch = tempfile::tempdir().context("Failed to create script working directory")?;
    let dir = working_dir
        .map(PathBuf::from)
        .unwrap_or_else(|| scratch.path().to_path_buf());
    let path = std::env::var("PATH").unwrap_or_else(|_| DEFAULT_PATH.to_string());

    let child = Command::new("sh")
        .arg("-c")
        .arg(script)
        .current_dir(&dir)
        .env_clear()
        .env("PATH", path)
        .envs(pipeline_env)
        .envs(step_env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .context("Failed to start script")?;

    // Dropping the wait future drops the child, which kills it
    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(output) => output.context("Failed to wait for script")?,
        Err(_) => anyhow::bail!("Script timed out after {}ms", timeout.as_millis()),
    };

    let stdout = String::from_utf8_lossy(&output.stdout);
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let detail = if stderr.trim().is_empty() { stdout } else { stderr };
        anyhow::bail!(
            "Script exited with code {}: {}",
            output.status.code().unwrap_or(-1),
            truncate(&detail)
        );
    }

    Ok(StepOutcome::output(truncate(&stdout)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::fake::{FakeAdapters, FakeQuality, FakeSource};
    use crate::db::{Blocker, Severity};
    use std::time::Instant;

    fn runner(fakes: &FakeAdapters) -> StepRunner {
        let adapters = fakes.adapters();
        let strategies = Arc::new(StrategyExecutor::new(
            adapters.cluster.clone(),
            adapters.metrics.clone(),
            Duration::from_secs(1),
        ));
        let settings = PipelineSettings {
            workflow_poll_interval_secs: 0,
            workflow_timeout_secs: 1,
            ..Default::default()
        };
        StepRunner::new(adapters, strategies, settings)
    }

    fn kind(value: serde_json::Value) -> StepKind {
        serde_json::from_value(value).unwrap()
    }

    fn env(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[tokio::test]
    async fn test_script_sees_only_pipeline_and_step_env() {
        std::env::set_var("CONVEYOR_LEAK_CHECK", "leaked");
        let outcome = run_script(
            "echo \"$REGION/$TIER/${CONVEYOR_LEAK_CHECK:-clean}\"",
            &env(&[("REGION", "eu"), ("TIER", "free")]),
            &env(&[("TIER", "pro")]),
            None,
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert_eq!(outcome.output.as_deref(), Some("eu/pro/clean"));
    }

    #[tokio::test]
    async fn test_script_runs_in_given_working_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "here").unwrap();
        let outcome = run_script(
            "cat marker.txt",
            &BTreeMap::new(),
            &BTreeMap::new(),
            dir.path().to_str(),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert_eq!(outcome.output.as_deref(), Some("here"));
    }

    #[tokio::test]
    async fn test_script_failure_reports_exit_code_and_stderr() {
        let err = run_script(
            "echo boom >&2; exit 3",
            &BTreeMap::new(),
            &BTreeMap::new(),
            None,
            Duration::from_secs(5),
        )
        .await
        .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("code 3"), "{}", message);
        assert!(message.contains("boom"), "{}", message);
    }

    #[tokio::test]
    async fn test_script_is_killed_on_timeout() {
        let started = Instant::now();
        let err = run_script(
            "sleep 10",
            &BTreeMap::new(),
            &BTreeMap::new(),
            None,
            Duration::from_millis(100),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("timed out"));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_truncate_long_output() {
        let long = "x".repeat(MAX_OUTPUT_CHARS + 10);
        let cut = truncate(&long);
        assert!(cut.ends_with("... (truncated)"));
        assert_eq!(truncate("  short \n"), "short");
    }

    #[tokio::test]
    async fn test_docker_build_uses_version_variable_as_tag() {
        let fakes = FakeAdapters::default();
        let vars = env(&[("VERSION", "1.4.0")]);
        let ctx = StepContext {
            execution_id: "exec-1",
            env: &vars,
        };
        let outcome = runner(&fakes)
            .run(&kind(serde_json::json!({"type": "docker-build", "image": "registry.test/api"})), &ctx)
            .await
            .unwrap();
        assert_eq!(outcome.artifact.as_deref(), Some("registry.test/api:1.4.0"));
        assert_eq!(fakes.registry.calls(), vec!["build registry.test/api:1.4.0"]);
    }

    #[tokio::test]
    async fn test_kubernetes_deploy_goes_through_strategy_executor() {
        let fakes = FakeAdapters::default();
        let vars = BTreeMap::new();
        let ctx = StepContext {
            execution_id: "ABCD-1234-ef",
            env: &vars,
        };
        let step = kind(serde_json::json!({
            "type": "kubernetes-deploy", "application": "web", "image": "registry.test/web",
            "version": "2.0.0", "target": {"namespace": "apps", "replicas": 2}
        }));
        let outcome = runner(&fakes).run(&step, &ctx).await.unwrap();
        assert_eq!(outcome.artifact.as_deref(), Some("registry.test/web:2.0.0"));
        let workload = fakes.cluster.workload("web-abcd1234").unwrap();
        assert_eq!(workload.replicas, 2);
        assert_eq!(workload.image.as_deref(), Some("registry.test/web:2.0.0"));
    }

    #[tokio::test]
    async fn test_github_action_waits_for_run() {
        let fakes = FakeAdapters::default();
        fakes.source.runs.lock().unwrap().push(FakeSource::completed_run(11, "success"));
        let vars = BTreeMap::new();
        let ctx = StepContext {
            execution_id: "e",
            env: &vars,
        };
        let step = kind(serde_json::json!({
            "type": "github-action", "owner": "acme", "repo": "api",
            "workflow_id": "ci.yml", "wait": true
        }));
        let outcome = runner(&fakes).run(&step, &ctx).await.unwrap();
        assert_eq!(outcome.output.as_deref(), Some("Workflow run 11 concluded with success"));
        assert_eq!(fakes.source.calls(), vec!["dispatch acme/api ci.yml@main"]);
    }

    #[tokio::test]
    async fn test_terraform_runs_init_before_action() {
        let fakes = FakeAdapters::default();
        let vars = BTreeMap::new();
        let ctx = StepContext {
            execution_id: "e",
            env: &vars,
        };
        let step = kind(serde_json::json!({"type": "terraform", "working_dir": "infra", "action": "plan"}));
        let outcome = runner(&fakes).run(&step, &ctx).await.unwrap();
        assert_eq!(fakes.infra.calls(), vec!["init infra", "plan infra"]);
        assert_eq!(outcome.output.as_deref(), Some("init complete\nplan complete"));
    }

    #[tokio::test]
    async fn test_blocking_quality_analysis_reports_block() {
        let fakes = FakeAdapters::default();
        let blocker = Blocker {
            severity: Severity::High,
            category: "coverage".to_string(),
            message: "coverage below 80%".to_string(),
            remediation: None,
        };
        *fakes.quality.analyses.lock().unwrap() =
            [FakeQuality::analysis("qc-9", 55.0, vec![blocker])].into_iter().collect();
        let vars = BTreeMap::new();
        let ctx = StepContext {
            execution_id: "e",
            env: &vars,
        };
        let step = kind(serde_json::json!({"type": "quality-analysis", "project_id": "proj"}));
        let outcome = runner(&fakes).run(&step, &ctx).await.unwrap();
        assert_eq!(outcome.quality.as_ref().map(|q| q.check_id.as_str()), Some("qc-9"));
        assert!(outcome.blocked.unwrap().contains("55.0"));
    }
}
