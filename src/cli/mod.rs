//! Command-line interface.
//!
//! Without a subcommand the binary runs the server. Every other subcommand
//! talks to a running server over its HTTP API, except `config check`, which
//! only reads the local configuration file.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use reqwest::{Client, Response};
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::api::error::ErrorResponse;
use crate::api::CreatedResponse;
use crate::config::Config;
use crate::db::{Deployment, DeploymentConfig, PipelineConfig, PipelineExecution};

#[derive(Parser, Debug)]
#[command(name = "conveyor")]
#[command(author, version, about = "Pipeline and deployment orchestration engine", long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "conveyor.toml")]
    pub config: PathBuf,

    /// Override log level
    #[arg(short, long)]
    pub log_level: Option<String>,

    /// API URL to connect to
    #[arg(long, env = "CONVEYOR_API_URL", default_value = "http://localhost:8080")]
    pub api_url: String,

    /// Authentication token (can also be set via CONVEYOR_TOKEN)
    #[arg(long, env = "CONVEYOR_TOKEN")]
    pub token: Option<String>,

    /// Subcommand to run (if none, starts the server)
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Show server health and recent activity
    Status,

    /// Register a deployment config or pipeline from a YAML or JSON file
    Apply {
        #[arg(short, long)]
        file: PathBuf,
    },

    /// Start a deployment from a stored config
    Deploy {
        config_id: String,
        /// Run every phase without touching the cluster
        #[arg(long)]
        dry_run: bool,
        /// Deploy even when the quality gate blocks
        #[arg(long)]
        force: bool,
    },

    /// Roll a deployment back to the previous version
    Rollback {
        deployment_id: String,
        #[arg(long)]
        reason: Option<String>,
    },

    /// Show a deployment
    Deployment { id: String },

    #[command(subcommand)]
    Pipeline(PipelineCommands),

    #[command(subcommand)]
    Config(ConfigCommands),
}

#[derive(Subcommand, Debug)]
pub enum PipelineCommands {
    /// Start a pipeline run
    Run {
        pipeline_id: String,
        /// Environment override, repeatable
        #[arg(long = "env", value_parser = parse_key_val)]
        env: Vec<(String, String)>,
    },
    /// Show a pipeline execution
    Status { execution_id: String },
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Validate configuration file
    Check,
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{}'", s)),
    }
}

/// A definition file for `apply`
#[derive(Debug)]
pub enum Definition {
    Deployment(DeploymentConfig),
    Pipeline(PipelineConfig),
}

#[derive(Debug, Deserialize)]
struct KindHint {
    kind: Option<String>,
    stages: Option<serde_yaml::Value>,
    application: Option<serde_yaml::Value>,
}

/// Parse YAML or JSON. An explicit `kind` wins; otherwise `stages` marks a
/// pipeline and `application` a deployment config.
pub fn parse_definition(content: &str) -> Result<Definition> {
    let hint: KindHint =
        serde_yaml::from_str(content).context("Definition is not a YAML or JSON mapping")?;

    let kind = match hint.kind.as_deref() {
        Some(kind) => kind.to_lowercase(),
        None if hint.stages.is_some() => "pipeline".to_string(),
        None if hint.application.is_some() => "deployment".to_string(),
        None => anyhow::bail!("Cannot tell whether the file is a pipeline or a deployment config"),
    };

    match kind.as_str() {
        "pipeline" => Ok(Definition::Pipeline(
            serde_yaml::from_str(content).context("Invalid pipeline definition")?,
        )),
        "deployment" | "deployment-config" => Ok(Definition::Deployment(
            serde_yaml::from_str(content).context("Invalid deployment config")?,
        )),
        other => anyhow::bail!("Unknown definition kind: {}", other),
    }
}

fn create_client(token: Option<&str>) -> Result<Client> {
    let mut headers = reqwest::header::HeaderMap::new();
    if let Some(token) = token {
        headers.insert(
            reqwest::header::AUTHORIZATION,
            format!("Bearer {}", token)
                .parse()
                .context("Invalid token format")?,
        );
    }

    Client::builder()
        .default_headers(headers)
        .timeout(Duration::from_secs(30))
        .build()
        .context("Failed to create HTTP client")
}

/// Turn non-2xx responses into errors carrying the server's message
async fn check(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == reqwest::StatusCode::UNAUTHORIZED {
        anyhow::bail!("Authentication required. Use --token or set CONVEYOR_TOKEN.");
    }

    let body = response.text().await.unwrap_or_default();
    match serde_json::from_str::<ErrorResponse>(&body) {
        Ok(err) => {
            let mut message = err.error.message;
            if let Some(details) = err.error.details {
                if let Ok(details) = serde_json::to_string_pretty(&details) {
                    message = format!("{}\n{}", message, details);
                }
            }
            anyhow::bail!("Server returned {}: {}", status, message)
        }
        Err(_) => anyhow::bail!("Server returned error {}: {}", status, body),
    }
}

pub async fn run_command(cli: &Cli) -> Result<()> {
    match &cli.command {
        Some(Commands::Status) => cmd_status(cli).await,
        Some(Commands::Apply { file }) => cmd_apply(cli, file).await,
        Some(Commands::Deploy {
            config_id,
            dry_run,
            force,
        }) => cmd_deploy(cli, config_id, *dry_run, *force).await,
        Some(Commands::Rollback {
            deployment_id,
            reason,
        }) => cmd_rollback(cli, deployment_id, reason.as_deref()).await,
        Some(Commands::Deployment { id }) => cmd_deployment(cli, id).await,
        Some(Commands::Pipeline(PipelineCommands::Run { pipeline_id, env })) => {
            cmd_pipeline_run(cli, pipeline_id, env).await
        }
        Some(Commands::Pipeline(PipelineCommands::Status { execution_id })) => {
            cmd_pipeline_status(cli, execution_id).await
        }
        Some(Commands::Config(ConfigCommands::Check)) => cmd_config_check(&cli.config),
        // Serving is handled in main.rs
        None => Ok(()),
    }
}

async fn cmd_status(cli: &Cli) -> Result<()> {
    let client = create_client(cli.token.as_deref())?;
    let base_url = &cli.api_url;

    println!("Connecting to {}...", base_url);
    let health = client
        .get(format!("{}/health", base_url))
        .send()
        .await
        .context("Failed to connect to server. Is conveyor running?")?;
    let healthy = health.status().is_success();

    println!();
    println!("=== Conveyor Server Status ===");
    println!();
    println!("Status:     {}", if healthy { "[OK] Healthy" } else { "[!!] Unhealthy" });

    let deployments: Vec<Deployment> = check(
        client
            .get(format!("{}/api/deployments?limit=5", base_url))
            .send()
            .await
            .context("Failed to connect to server")?,
    )
    .await?
    .json()
    .await
    .context("Failed to parse deployments response")?;

    println!();
    println!("Recent deployments:");
    if deployments.is_empty() {
        println!("  (none)");
    }
    for d in &deployments {
        println!(
            "  {:<36}  {:<20}  {:<12}  {:<10}  {}",
            d.id,
            truncate(&d.application, 20),
            d.environment,
            truncate(&d.version, 10),
            d.status
        );
    }

    let executions: Vec<PipelineExecution> = check(
        client
            .get(format!("{}/api/executions?limit=5", base_url))
            .send()
            .await
            .context("Failed to connect to server")?,
    )
    .await?
    .json()
    .await
    .context("Failed to parse executions response")?;

    println!();
    println!("Recent pipeline runs:");
    if executions.is_empty() {
        println!("  (none)");
    }
    for e in &executions {
        println!(
            "  {:<36}  {:<36}  {:<10}  {}",
            e.id, e.pipeline_id, e.status, e.started_at
        );
    }

    println!();
    Ok(())
}

async fn cmd_apply(cli: &Cli, file: &Path) -> Result<()> {
    let content = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;

    let (endpoint, body, label) = match parse_definition(&content)? {
        Definition::Pipeline(pipeline) => {
            let problems = crate::engine::pipeline::validate(&pipeline);
            report_problems(&problems)?;
            ("pipelines", serde_json::to_value(&pipeline)?, "Pipeline")
        }
        Definition::Deployment(config) => {
            let problems = config.validate();
            report_problems(&problems)?;
            ("deployment-configs", serde_json::to_value(&config)?, "Deployment config")
        }
    };

    let client = create_client(cli.token.as_deref())?;
    let created: CreatedResponse = check(
        client
            .post(format!("{}/api/{}", cli.api_url, endpoint))
            .json(&body)
            .send()
            .await
            .context("Failed to connect to server")?,
    )
    .await?
    .json()
    .await
    .context("Failed to parse response")?;

    println!("{} created: {}", label, created.id);
    Ok(())
}

fn report_problems(problems: &[String]) -> Result<()> {
    if problems.is_empty() {
        return Ok(());
    }
    for problem in problems {
        println!("  [!!] {}", problem);
    }
    anyhow::bail!("Definition has {} problem(s)", problems.len())
}

async fn cmd_deploy(cli: &Cli, config_id: &str, dry_run: bool, force: bool) -> Result<()> {
    let client = create_client(cli.token.as_deref())?;
    let started: CreatedResponse = check(
        client
            .post(format!("{}/api/deployment-configs/{}/deploy", cli.api_url, config_id))
            .json(&json!({ "dry_run": dry_run, "force": force, "triggered_by": "cli" }))
            .send()
            .await
            .context("Failed to connect to server")?,
    )
    .await?
    .json()
    .await
    .context("Failed to parse response")?;

    println!("Deployment started: {}", started.id);
    if dry_run {
        println!("(dry run, the cluster will not be changed)");
    }
    println!("Check progress with: conveyor deployment {}", started.id);
    Ok(())
}

async fn cmd_rollback(cli: &Cli, deployment_id: &str, reason: Option<&str>) -> Result<()> {
    let client = create_client(cli.token.as_deref())?;
    let started: CreatedResponse = check(
        client
            .post(format!("{}/api/deployments/{}/rollback", cli.api_url, deployment_id))
            .json(&json!({ "reason": reason }))
            .send()
            .await
            .context("Failed to connect to server")?,
    )
    .await?
    .json()
    .await
    .context("Failed to parse response")?;

    println!("Rollback started: {}", started.id);
    Ok(())
}

async fn cmd_deployment(cli: &Cli, id: &str) -> Result<()> {
    let client = create_client(cli.token.as_deref())?;
    let d: Deployment = check(
        client
            .get(format!("{}/api/deployments/{}", cli.api_url, id))
            .send()
            .await
            .context("Failed to connect to server")?,
    )
    .await?
    .json()
    .await
    .context("Failed to parse deployment")?;

    println!();
    println!("=== Deployment: {} ===", d.id);
    println!();
    println!("Application:  {}", d.application);
    println!("Environment:  {}", d.environment);
    println!("Version:      {}", d.version);
    println!("Status:       {}", d.status);
    if let Some(previous) = &d.previous_version {
        println!("Previous:     {}", previous);
    }
    println!("Started:      {}", d.started_at);
    if let Some(completed) = &d.finished_at {
        println!("Finished:     {}", completed);
    }
    if let Some(score) = d.quality_score {
        println!(
            "Quality:      {:.1} ({})",
            score,
            if d.quality_passed.unwrap_or(true) { "passed" } else { "failed" }
        );
    }
    if let Some(rollback_id) = &d.rollback_id {
        println!("Rolled back:  {}", rollback_id);
    }
    if let Some(error) = &d.error {
        println!();
        println!("Error: {}", error);
    }
    println!();
    Ok(())
}

async fn cmd_pipeline_run(cli: &Cli, pipeline_id: &str, env: &[(String, String)]) -> Result<()> {
    let env: BTreeMap<&str, &str> = env.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
    let client = create_client(cli.token.as_deref())?;
    let started: CreatedResponse = check(
        client
            .post(format!("{}/api/pipelines/{}/execute", cli.api_url, pipeline_id))
            .json(&json!({ "env": env, "triggered_by": "cli" }))
            .send()
            .await
            .context("Failed to connect to server")?,
    )
    .await?
    .json()
    .await
    .context("Failed to parse response")?;

    println!("Pipeline run started: {}", started.id);
    println!("Check progress with: conveyor pipeline status {}", started.id);
    Ok(())
}

async fn cmd_pipeline_status(cli: &Cli, execution_id: &str) -> Result<()> {
    let client = create_client(cli.token.as_deref())?;
    let execution: PipelineExecution = check(
        client
            .get(format!("{}/api/executions/{}", cli.api_url, execution_id))
            .send()
            .await
            .context("Failed to connect to server")?,
    )
    .await?
    .json()
    .await
    .context("Failed to parse execution")?;

    println!();
    println!("=== Execution: {} ===", execution.id);
    println!();
    println!("Pipeline:     {}", execution.pipeline_id);
    println!("Status:       {}", execution.status);
    println!("Triggered by: {}", execution.triggered_by);
    println!();
    for stage in &execution.stages {
        println!("  {:<24} {:?}", truncate(&stage.name, 24), stage.status);
        for step in &stage.steps {
            let retries = if step.retry_count > 0 {
                format!(" ({} retries)", step.retry_count)
            } else {
                String::new()
            };
            println!("    - {:<20} {:?}{}", truncate(&step.name, 20), step.status, retries);
            if let Some(error) = &step.error {
                println!("      {}", error);
            }
        }
    }
    if !execution.artifacts.is_empty() {
        println!();
        println!("Artifacts:");
        for artifact in &execution.artifacts {
            println!("  {}", artifact);
        }
    }
    if let Some(error) = &execution.error {
        println!();
        println!("Error: {}", error);
    }
    println!();
    Ok(())
}

fn cmd_config_check(config_path: &Path) -> Result<()> {
    println!("Checking configuration file: {}", config_path.display());
    println!();

    if !config_path.exists() {
        println!("[!!] Configuration file not found: {}", config_path.display());
        println!();
        println!("A default configuration will be used when starting the server.");
        return Ok(());
    }

    let config = Config::load(config_path)?;
    println!("[OK] Configuration file parsed");
    println!();
    println!("Server:");
    println!("  Host:         {}", config.server.host);
    println!("  API Port:     {}", config.server.api_port);
    println!("  Data Dir:     {}", config.server.data_dir.display());
    println!();
    println!("Integrations:");
    println!("  Kubernetes:   {}", enabled(config.kubernetes.enabled));
    println!("  Docker:       {}", enabled(config.docker.enabled));
    println!("  GitHub:       {}", enabled(config.github.token.is_some()));
    println!("  Prometheus:   {}", enabled(config.prometheus.url.is_some()));
    println!("  Quality:      {}", enabled(config.quality.url.is_some()));
    println!();

    let problems = config.check();
    if problems.is_empty() {
        println!("[OK] No problems found");
        return Ok(());
    }
    for problem in &problems {
        println!("  [!!] {}", problem);
    }
    anyhow::bail!("Configuration has {} problem(s)", problems.len())
}

fn enabled(on: bool) -> &'static str {
    if on {
        "Enabled"
    } else {
        "Disabled"
    }
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_key_val() {
        assert_eq!(
            parse_key_val("VERSION=1.2.3").unwrap(),
            ("VERSION".to_string(), "1.2.3".to_string())
        );
        assert_eq!(
            parse_key_val("URL=http://x?a=b").unwrap(),
            ("URL".to_string(), "http://x?a=b".to_string())
        );
        assert!(parse_key_val("novalue").is_err());
        assert!(parse_key_val("=x").is_err());
    }

    #[test]
    fn test_cli_parses_subcommands() {
        let cli = Cli::try_parse_from(["conveyor", "deploy", "cfg-1", "--dry-run"]).unwrap();
        assert!(matches!(
            cli.command,
            Some(Commands::Deploy { ref config_id, dry_run: true, force: false }) if config_id == "cfg-1"
        ));

        let cli = Cli::try_parse_from([
            "conveyor", "pipeline", "run", "p1", "--env", "A=1", "--env", "B=2",
        ])
        .unwrap();
        let Some(Commands::Pipeline(PipelineCommands::Run { env, .. })) = cli.command else {
            panic!("expected pipeline run");
        };
        assert_eq!(env.len(), 2);

        let cli = Cli::try_parse_from(["conveyor"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.config, PathBuf::from("conveyor.toml"));
    }

    #[test]
    fn test_parse_yaml_pipeline() {
        let yaml = r#"
name: ci
stages:
  - name: build
    steps:
      - name: compile
        type: script
        script: cargo build
  - name: deploy
    dependsOn: [build]
    steps: []
"#;
        let Definition::Pipeline(pipeline) = parse_definition(yaml).unwrap() else {
            panic!("expected a pipeline");
        };
        assert_eq!(pipeline.stages.len(), 2);
        assert_eq!(pipeline.stages[1].depends_on, vec!["build".to_string()]);
    }

    #[test]
    fn test_parse_json_deployment_config() {
        let json = r#"{
            "name": "api",
            "application": "api",
            "version": "2.0.0",
            "environment": "production",
            "source": {"type": "image", "repository": "registry.test/api"},
            "health_check": {"type": "none"}
        }"#;
        let Definition::Deployment(config) = parse_definition(json).unwrap() else {
            panic!("expected a deployment config");
        };
        assert_eq!(config.application, "api");
        assert_eq!(config.environment, crate::db::Environment::Production);
    }

    #[test]
    fn test_parse_definition_needs_a_kind() {
        assert!(parse_definition("name: orphan\n").is_err());
        assert!(parse_definition("kind: cronjob\nname: x\n").is_err());
    }

    #[test]
    fn test_config_check_missing_file_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        assert!(cmd_config_check(&dir.path().join("absent.toml")).is_ok());
    }

    #[test]
    fn test_config_check_reports_problems() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conveyor.toml");
        std::fs::write(&path, "[queue]\nmax_attempts = 0\n").unwrap();
        assert!(cmd_config_check(&path).is_err());
    }
}
