//! Pipeline definitions and execution records.

use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::collections::BTreeMap;

use super::common::now_rfc3339;
use super::deployment::{QualityGatePolicy, RolloutStrategy, TargetDescriptor};
use super::notification::NotificationSubscription;
use crate::db::{from_document, to_document};

/// What can start a pipeline run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PipelineTrigger {
    Manual,
    Push {
        #[serde(default)]
        branches: Vec<String>,
    },
    /// Signed webhook; the secret verifies the HMAC-SHA256 signature
    Webhook { secret: String },
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum StageType {
    Build,
    Test,
    SecurityScan,
    QualityGate,
    Deploy,
    Rollback,
    ManualApproval,
    #[default]
    Custom,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TerraformAction {
    Plan,
    #[default]
    Apply,
    Destroy,
}

/// Per-kind step configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum StepKind {
    DockerBuild {
        #[serde(default = "default_context")]
        context: String,
        #[serde(default = "default_dockerfile")]
        dockerfile: String,
        image: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tag: Option<String>,
        #[serde(default)]
        build_args: BTreeMap<String, String>,
    },
    DockerPush {
        image: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tag: Option<String>,
    },
    KubernetesDeploy {
        application: String,
        image: String,
        /// Image tag; falls back to the `VERSION` pipeline variable
        #[serde(default, skip_serializing_if = "Option::is_none")]
        version: Option<String>,
        #[serde(default)]
        strategy: RolloutStrategy,
        #[serde(default)]
        target: TargetDescriptor,
    },
    Script {
        script: String,
        #[serde(default)]
        env: BTreeMap<String, String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        working_dir: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<u64>,
    },
    GithubAction {
        owner: String,
        repo: String,
        workflow_id: String,
        #[serde(default = "default_git_ref")]
        git_ref: String,
        #[serde(default)]
        inputs: BTreeMap<String, String>,
        /// Poll the dispatched run until it concludes
        #[serde(default)]
        wait: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<u64>,
    },
    Terraform {
        working_dir: String,
        #[serde(default)]
        action: TerraformAction,
        #[serde(default)]
        variables: BTreeMap<String, String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        workspace: Option<String>,
    },
    QualityAnalysis {
        project_id: String,
        #[serde(default = "default_path")]
        path: String,
        #[serde(default = "default_true")]
        block_on_failure: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        min_score: Option<f64>,
    },
}

fn default_context() -> String {
    ".".to_string()
}

fn default_dockerfile() -> String {
    "Dockerfile".to_string()
}

fn default_git_ref() -> String {
    "main".to_string()
}

fn default_path() -> String {
    ".".to_string()
}

fn default_true() -> bool {
    true
}

impl StepKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::DockerBuild { .. } => "docker-build",
            Self::DockerPush { .. } => "docker-push",
            Self::KubernetesDeploy { .. } => "kubernetes-deploy",
            Self::Script { .. } => "script",
            Self::GithubAction { .. } => "github-action",
            Self::Terraform { .. } => "terraform",
            Self::QualityAnalysis { .. } => "quality-analysis",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Step {
    pub name: String,
    /// Overrides the pipeline's default retry count
    #[serde(default, alias = "retryCount", skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u32>,
    #[serde(default, alias = "continueOnError")]
    pub continue_on_error: bool,
    #[serde(flatten)]
    pub kind: StepKind,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Stage {
    pub name: String,
    #[serde(rename = "type", default)]
    pub stage_type: StageType,
    #[serde(default, alias = "dependsOn")]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub parallel: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default)]
    pub steps: Vec<Step>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality_gate: Option<QualityGatePolicy>,
}

impl Stage {
    /// Whether the stage must pass a quality gate before its steps run
    pub fn gates_on_quality(&self) -> bool {
        self.stage_type == StageType::QualityGate
            || self.quality_gate.as_ref().map(|g| g.enabled).unwrap_or(false)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RetryDefaults {
    #[serde(default, alias = "retryCount")]
    pub retry_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineConfig {
    #[serde(default)]
    pub id: String,
    pub name: String,
    pub stages: Vec<Stage>,
    #[serde(default)]
    pub triggers: Vec<PipelineTrigger>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub notifications: Vec<NotificationSubscription>,
    /// Overall run budget, checked between stages
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub retry: RetryDefaults,
    #[serde(default)]
    pub created_at: String,
}

impl PipelineConfig {
    pub fn webhook_secret(&self) -> Option<&str> {
        self.triggers.iter().find_map(|t| match t {
            PipelineTrigger::Webhook { secret } => Some(secret.as_str()),
            _ => None,
        })
    }

    /// Whether a push to `branch` should start the pipeline
    pub fn triggered_by_push(&self, branch: &str) -> bool {
        self.triggers.iter().any(|t| match t {
            PipelineTrigger::Push { branches } => {
                branches.is_empty() || branches.iter().any(|b| b == branch)
            }
            _ => false,
        })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Success,
    Failure,
    Cancelled,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failure | Self::Cancelled)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a single stage or step
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Success,
    Failure,
    Skipped,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Skipped => "skipped",
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Success | Self::Failure | Self::Skipped)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepExecution {
    pub name: String,
    /// Step kind, e.g. "script"
    pub kind: String,
    pub status: RunStatus,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
    /// Retries used, not counting the first attempt
    pub retry_count: u32,
    pub output: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StageExecution {
    pub name: String,
    pub status: RunStatus,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
    pub error: Option<String>,
    pub steps: Vec<StepExecution>,
}

impl StageExecution {
    /// Close an unfinished stage and its steps as skipped
    pub fn skip(&mut self) {
        if !self.status.is_finished() {
            self.status = RunStatus::Skipped;
            self.finished_at.get_or_insert_with(now_rfc3339);
        }
        for step in &mut self.steps {
            if !step.status.is_finished() {
                step.status = RunStatus::Skipped;
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineExecution {
    pub id: String,
    pub pipeline_id: String,
    pub status: ExecutionStatus,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub stages: Vec<StageExecution>,
    pub triggered_by: String,
    /// Pipeline env merged with the trigger's overrides
    pub env: BTreeMap<String, String>,
    pub artifacts: Vec<String>,
    pub quality_check_id: Option<String>,
    pub quality_score: Option<f64>,
    pub quality_passed: Option<bool>,
    pub error: Option<String>,
}

impl PipelineExecution {
    /// Snapshot every stage and step of `config` as pending
    pub fn new(
        id: String,
        config: &PipelineConfig,
        triggered_by: String,
        env_overrides: BTreeMap<String, String>,
    ) -> Self {
        let mut env = config.env.clone();
        env.extend(env_overrides);

        let stages = config
            .stages
            .iter()
            .map(|stage| StageExecution {
                name: stage.name.clone(),
                status: RunStatus::Pending,
                started_at: None,
                finished_at: None,
                error: None,
                steps: stage
                    .steps
                    .iter()
                    .map(|step| StepExecution {
                        name: step.name.clone(),
                        kind: step.kind.name().to_string(),
                        status: RunStatus::Pending,
                        started_at: None,
                        finished_at: None,
                        retry_count: 0,
                        output: None,
                        error: None,
                    })
                    .collect(),
            })
            .collect();

        Self {
            id,
            pipeline_id: config.id.clone(),
            status: ExecutionStatus::Pending,
            started_at: now_rfc3339(),
            finished_at: None,
            stages,
            triggered_by,
            env,
            artifacts: Vec::new(),
            quality_check_id: None,
            quality_score: None,
            quality_passed: None,
            error: None,
        }
    }

    pub fn stage_status(&self, name: &str) -> Option<RunStatus> {
        self.stages.iter().find(|s| s.name == name).map(|s| s.status)
    }
}

impl PipelineConfig {
    pub async fn insert(&self, db: &SqlitePool) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO pipeline_configs (id, name, document, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(&self.id)
        .bind(&self.name)
        .bind(to_document(self)?)
        .bind(&self.created_at)
        .execute(db)
        .await?;
        Ok(())
    }

    pub async fn get_by_id(db: &SqlitePool, id: &str) -> Result<Option<Self>, sqlx::Error> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT document FROM pipeline_configs WHERE id = ?")
                .bind(id)
                .fetch_optional(db)
                .await?;
        row.map(|(doc,)| from_document(&doc)).transpose()
    }

    pub async fn list(db: &SqlitePool) -> Result<Vec<Self>, sqlx::Error> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT document FROM pipeline_configs ORDER BY created_at DESC, id")
                .fetch_all(db)
                .await?;
        rows.iter().map(|(doc,)| from_document(doc)).collect()
    }
}

impl PipelineExecution {
    /// Insert or replace the stored record
    pub async fn save(&self, db: &SqlitePool) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO pipeline_executions (id, pipeline_id, status, started_at, document)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                document = excluded.document
            "#,
        )
        .bind(&self.id)
        .bind(&self.pipeline_id)
        .bind(self.status.as_str())
        .bind(&self.started_at)
        .bind(to_document(self)?)
        .execute(db)
        .await?;
        Ok(())
    }

    /// Store the run only if its stored status is still `expected`
    pub async fn save_if_status(&self, db: &SqlitePool, expected: ExecutionStatus) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("UPDATE pipeline_executions SET status = ?, document = ? WHERE id = ? AND status = ?")
            .bind(self.status.as_str())
            .bind(to_document(self)?)
            .bind(&self.id)
            .bind(expected.as_str())
            .execute(db)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn get_by_id(db: &SqlitePool, id: &str) -> Result<Option<Self>, sqlx::Error> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT document FROM pipeline_executions WHERE id = ?")
                .bind(id)
                .fetch_optional(db)
                .await?;
        row.map(|(doc,)| from_document(&doc)).transpose()
    }

    /// Executions a previous process left running
    pub async fn list_running(db: &SqlitePool) -> Result<Vec<Self>, sqlx::Error> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT document FROM pipeline_executions WHERE status = 'running' ORDER BY started_at",
        )
        .fetch_all(db)
        .await?;
        rows.iter().map(|(doc,)| from_document(doc)).collect()
    }

    pub async fn list(
        db: &SqlitePool,
        pipeline_id: Option<&str>,
        limit: u32,
    ) -> Result<Vec<Self>, sqlx::Error> {
        let rows: Vec<(String,)> = match pipeline_id {
            Some(pipeline_id) => {
                sqlx::query_as(
                    r#"
                    SELECT document FROM pipeline_executions
                    WHERE pipeline_id = ?
                    ORDER BY started_at DESC, rowid DESC
                    LIMIT ?
                    "#,
                )
                .bind(pipeline_id)
                .bind(limit as i64)
                .fetch_all(db)
                .await?
            }
            None => {
                sqlx::query_as(
                    "SELECT document FROM pipeline_executions ORDER BY started_at DESC, rowid DESC LIMIT ?",
                )
                .bind(limit as i64)
                .fetch_all(db)
                .await?
            }
        };
        rows.iter().map(|(doc,)| from_document(doc)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> PipelineConfig {
        serde_json::from_value(serde_json::json!({
            "name": "ci",
            "env": {"REGION": "eu", "TIER": "free"},
            "triggers": [
                {"type": "manual"},
                {"type": "push", "branches": ["main"]},
                {"type": "webhook", "secret": "s3cret"}
            ],
            "retry": {"retryCount": 2},
            "stages": [
                {"name": "build", "type": "build", "steps": [
                    {"name": "compile", "type": "script", "script": "make"}
                ]},
                {"name": "deploy", "type": "deploy", "dependsOn": ["build"],
                 "condition": "env.BRANCH == 'main'", "steps": [
                    {"name": "ship", "type": "kubernetes-deploy", "application": "api",
                     "image": "registry.test/api", "continueOnError": true}
                ]}
            ]
        }))
        .unwrap()
    }

    #[test]
    fn test_pipeline_config_parses_camel_case_aliases() {
        let config = sample();
        assert_eq!(config.retry.retry_count, 2);
        assert_eq!(config.stages[1].depends_on, vec!["build".to_string()]);
        assert!(config.stages[1].steps[0].continue_on_error);
        assert_eq!(config.stages[1].steps[0].kind.name(), "kubernetes-deploy");
        assert_eq!(config.webhook_secret(), Some("s3cret"));
        assert!(config.triggered_by_push("main"));
        assert!(!config.triggered_by_push("feature/x"));
    }

    #[test]
    fn test_execution_snapshot_is_pending_and_merges_env() {
        let config = sample();
        let mut overrides = BTreeMap::new();
        overrides.insert("TIER".to_string(), "pro".to_string());

        let exec = PipelineExecution::new("e1".to_string(), &config, "alice".to_string(), overrides);
        assert_eq!(exec.status, ExecutionStatus::Pending);
        assert_eq!(exec.stages.len(), 2);
        assert!(exec.stages.iter().all(|s| s.status == RunStatus::Pending));
        assert_eq!(exec.stages[0].steps[0].kind, "script");
        assert_eq!(exec.env.get("TIER").map(String::as_str), Some("pro"));
        assert_eq!(exec.env.get("REGION").map(String::as_str), Some("eu"));
    }

    #[test]
    fn test_skip_leaves_finished_steps_alone() {
        let config = sample();
        let mut exec = PipelineExecution::new("e1".to_string(), &config, "t".to_string(), BTreeMap::new());
        exec.stages[0].steps[0].status = RunStatus::Success;
        exec.stages[0].status = RunStatus::Running;
        exec.stages[0].skip();
        assert_eq!(exec.stages[0].status, RunStatus::Skipped);
        assert_eq!(exec.stages[0].steps[0].status, RunStatus::Success);
    }

    #[test]
    fn test_quality_gate_stage_detection() {
        let mut stage = sample().stages.remove(0);
        assert!(!stage.gates_on_quality());
        stage.stage_type = StageType::QualityGate;
        assert!(stage.gates_on_quality());
    }

    #[tokio::test]
    async fn test_execution_persistence_round_trip() {
        let db = crate::db::init_memory().await.unwrap();
        let mut config = sample();
        config.id = "p1".to_string();
        config.created_at = now_rfc3339();
        config.insert(&db).await.unwrap();

        let mut exec = PipelineExecution::new("e1".to_string(), &config, "ci".to_string(), BTreeMap::new());
        exec.save(&db).await.unwrap();
        exec.status = ExecutionStatus::Running;
        exec.save(&db).await.unwrap();

        let loaded = PipelineExecution::get_by_id(&db, "e1").await.unwrap().unwrap();
        assert_eq!(loaded, exec);
        assert_eq!(PipelineExecution::list(&db, Some("p1"), 10).await.unwrap().len(), 1);
        assert!(PipelineExecution::list(&db, Some("other"), 10).await.unwrap().is_empty());
        assert_eq!(PipelineConfig::get_by_id(&db, "p1").await.unwrap(), Some(config));
    }
}
