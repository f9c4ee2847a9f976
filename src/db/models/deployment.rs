//! Deployment configuration and execution records.

use serde::{Deserialize, Serialize};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use std::collections::BTreeMap;

use super::common::{now_rfc3339, ApplicationMetrics, Blocker};
use super::notification::NotificationSubscription;
use crate::db::{from_document, to_document};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Development,
    Staging,
    Production,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Staging => "staging",
            Self::Production => "production",
        }
    }
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "development" | "dev" => Ok(Self::Development),
            "staging" => Ok(Self::Staging),
            "production" | "prod" => Ok(Self::Production),
            _ => Err(format!("Unknown environment: {}", s)),
        }
    }
}

/// Canary rollout parameters
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CanaryConfig {
    /// Share of the replicas that receive the new version, 1-100
    #[serde(default = "default_canary_percentage")]
    pub percentage: u32,
    /// How long the canary is observed before promotion
    #[serde(default = "default_canary_window_ms")]
    pub window_ms: u64,
    #[serde(default = "default_canary_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Maximum acceptable error rate (0.0 - 1.0)
    #[serde(default = "default_max_error_rate")]
    pub max_error_rate: f64,
    #[serde(default = "default_max_response_time_ms")]
    pub max_response_time_ms: f64,
}

fn default_canary_percentage() -> u32 {
    10
}

fn default_canary_window_ms() -> u64 {
    300_000
}

fn default_canary_poll_interval_ms() -> u64 {
    30_000
}

fn default_max_error_rate() -> f64 {
    0.05
}

fn default_max_response_time_ms() -> f64 {
    1000.0
}

impl Default for CanaryConfig {
    fn default() -> Self {
        Self {
            percentage: default_canary_percentage(),
            window_ms: default_canary_window_ms(),
            poll_interval_ms: default_canary_poll_interval_ms(),
            max_error_rate: default_max_error_rate(),
            max_response_time_ms: default_max_response_time_ms(),
        }
    }
}

impl CanaryConfig {
    /// Split `total` replicas into (canary, stable) counts.
    ///
    /// The canary share is rounded up so a non-zero percentage always gets at
    /// least one replica.
    pub fn split(&self, total: u32) -> (u32, u32) {
        let pct = self.percentage.min(100) as u64;
        let canary = ((total as u64 * pct + 99) / 100) as u32;
        let canary = canary.min(total);
        (canary, total - canary)
    }
}

/// How a new version replaces the running one
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum RolloutStrategy {
    RollingUpdate {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_surge: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_unavailable: Option<String>,
    },
    BlueGreen,
    Canary(CanaryConfig),
}

impl RolloutStrategy {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RollingUpdate { .. } => "rolling-update",
            Self::BlueGreen => "blue-green",
            Self::Canary(_) => "canary",
        }
    }
}

impl Default for RolloutStrategy {
    fn default() -> Self {
        Self::RollingUpdate {
            max_surge: None,
            max_unavailable: None,
        }
    }
}

/// Where the release artifact comes from
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SourceDescriptor {
    /// A pre-built image; the tag defaults to the release version
    Image {
        repository: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tag: Option<String>,
    },
    /// Source repository whose build workflow produces `image`
    Repository {
        owner: String,
        repo: String,
        workflow_id: String,
        #[serde(default = "default_git_ref")]
        git_ref: String,
        image: String,
        /// Subdirectory the workflow builds from
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<String>,
        #[serde(default)]
        inputs: BTreeMap<String, String>,
    },
    /// A packaged chart that deploys `image`
    Chart {
        repository: String,
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        chart_version: Option<String>,
        image: String,
    },
}

fn default_git_ref() -> String {
    "main".to_string()
}

impl SourceDescriptor {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Image { .. } => "image",
            Self::Repository { .. } => "repository",
            Self::Chart { .. } => "chart",
        }
    }

    /// Image repository the rollout will run
    pub fn image_repository(&self) -> &str {
        match self {
            Self::Image { repository, .. } => repository,
            Self::Repository { image, .. } => image,
            Self::Chart { image, .. } => image,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ResourceSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
}

/// Cluster, namespace and workload shape of the release
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TargetDescriptor {
    #[serde(default = "default_cluster")]
    pub cluster: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default = "default_replicas")]
    pub replicas: u32,
    #[serde(default)]
    pub resources: ResourceSpec,
    /// Routing object switched by blue-green rollouts (defaults to the application name)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

fn default_cluster() -> String {
    "default".to_string()
}

fn default_namespace() -> String {
    "default".to_string()
}

fn default_replicas() -> u32 {
    1
}

fn default_port() -> u16 {
    8080
}

impl Default for TargetDescriptor {
    fn default() -> Self {
        Self {
            cluster: default_cluster(),
            namespace: default_namespace(),
            replicas: default_replicas(),
            resources: ResourceSpec::default(),
            service: None,
            port: default_port(),
            env: BTreeMap::new(),
        }
    }
}

/// Readiness probe used during verification
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum HealthProbe {
    Http {
        #[serde(default = "default_health_path")]
        path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        port: Option<u16>,
        /// Full URL, overrides the in-cluster service address
        #[serde(default, skip_serializing_if = "Option::is_none")]
        url: Option<String>,
    },
    Tcp {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        host: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        port: Option<u16>,
    },
    /// All pods of the workload must report ready
    Exec,
    /// Explicit opt-out of verification probes
    #[serde(rename = "none")]
    Skip,
}

fn default_health_path() -> String {
    "/health".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthCheckSpec {
    #[serde(flatten)]
    pub probe: HealthProbe,
    #[serde(default = "default_health_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_health_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_health_retries")]
    pub retries: u32,
}

fn default_health_timeout_ms() -> u64 {
    120_000
}

fn default_health_interval_ms() -> u64 {
    5_000
}

fn default_health_retries() -> u32 {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RollbackPolicy {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Roll back without operator involvement when the deployment fails
    #[serde(default)]
    pub automatic: bool,
    /// Number of finished deployments kept per application and environment
    #[serde(default = "default_max_history")]
    pub max_history: usize,
}

fn default_true() -> bool {
    true
}

fn default_max_history() -> usize {
    10
}

/// Limits that trigger a rollback when breached after a successful release
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MonitoringThresholds {
    #[serde(default = "default_max_score_drop")]
    pub max_score_drop: f64,
    #[serde(default)]
    pub max_new_blockers: u32,
    #[serde(default)]
    pub max_new_critical: u32,
}

fn default_max_score_drop() -> f64 {
    10.0
}

impl Default for MonitoringThresholds {
    fn default() -> Self {
        Self {
            max_score_drop: default_max_score_drop(),
            max_new_blockers: 0,
            max_new_critical: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QualityGatePolicy {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub block_on_failure: bool,
    pub project_id: String,
    /// Source path handed to the evaluator
    #[serde(default = "default_quality_path")]
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_score: Option<f64>,
    /// Arms post-deploy monitoring when present
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub monitoring: Option<MonitoringThresholds>,
}

fn default_quality_path() -> String {
    ".".to_string()
}

/// Maximum tolerated image scan findings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScanThresholds {
    #[serde(default)]
    pub max_critical: u32,
    #[serde(default = "default_max_high")]
    pub max_high: u32,
}

fn default_max_high() -> u32 {
    5
}

impl Default for ScanThresholds {
    fn default() -> Self {
        Self {
            max_critical: 0,
            max_high: default_max_high(),
        }
    }
}

/// Immutable release intent. New versions create new configs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeploymentConfig {
    #[serde(default)]
    pub id: String,
    pub name: String,
    pub application: String,
    pub version: String,
    pub environment: Environment,
    #[serde(default)]
    pub strategy: RolloutStrategy,
    pub source: SourceDescriptor,
    #[serde(default)]
    pub target: TargetDescriptor,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check: Option<HealthCheckSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback: Option<RollbackPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality_gate: Option<QualityGatePolicy>,
    #[serde(default)]
    pub security_scan: ScanThresholds,
    #[serde(default)]
    pub notifications: Vec<NotificationSubscription>,
    #[serde(default)]
    pub created_at: String,
}

impl DeploymentConfig {
    /// Check the config for problems that must be reported before any run starts
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();

        if self.name.trim().is_empty() {
            problems.push("name must not be empty".to_string());
        }
        if !is_dns_label(&self.application) {
            problems.push(format!(
                "application '{}' must be a lowercase DNS label (a-z, 0-9, '-')",
                self.application
            ));
        }
        if self.version.trim().is_empty() {
            problems.push("version must not be empty".to_string());
        }
        if self.target.replicas == 0 {
            problems.push("target.replicas must be at least 1".to_string());
        }
        if let RolloutStrategy::Canary(canary) = &self.strategy {
            if canary.percentage == 0 || canary.percentage > 100 {
                problems.push("strategy.percentage must be between 1 and 100".to_string());
            }
            if canary.poll_interval_ms == 0 {
                problems.push("strategy.poll_interval_ms must be positive".to_string());
            }
        }
        match &self.health_check {
            None => problems.push(
                "health_check is required; use {\"type\": \"none\"} to skip verification probes"
                    .to_string(),
            ),
            Some(hc) => {
                if hc.interval_ms == 0 {
                    problems.push("health_check.interval_ms must be positive".to_string());
                }
            }
        }
        if let Some(gate) = &self.quality_gate {
            if gate.enabled && gate.project_id.trim().is_empty() {
                problems.push("quality_gate.project_id must not be empty".to_string());
            }
        }

        problems
    }

    pub fn quality_gate_enabled(&self) -> bool {
        self.quality_gate.as_ref().map(|g| g.enabled).unwrap_or(false)
    }

    pub fn automatic_rollback(&self) -> bool {
        self.rollback
            .as_ref()
            .map(|r| r.enabled && r.automatic)
            .unwrap_or(false)
    }

    /// Routing object name for the release
    pub fn service_name(&self) -> &str {
        self.target.service.as_deref().unwrap_or(&self.application)
    }

    /// Image tag deployed for a given release version
    pub fn image_tag(&self, version: &str) -> String {
        match &self.source {
            // A pinned tag only applies to the configured version; rollbacks use their own
            SourceDescriptor::Image { tag: Some(tag), .. } if version == self.version => tag.clone(),
            _ => version.to_string(),
        }
    }
}

fn is_dns_label(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= 63
        && s
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !s.starts_with('-')
        && !s.ends_with('-')
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeploymentStatus {
    Pending,
    Preparing,
    QualityCheck,
    InProgress,
    Verifying,
    Completed,
    QualityGateFailed,
    Failed,
    RolledBack,
    Cancelled,
}

impl DeploymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Preparing => "PREPARING",
            Self::QualityCheck => "QUALITY_CHECK",
            Self::InProgress => "IN_PROGRESS",
            Self::Verifying => "VERIFYING",
            Self::Completed => "COMPLETED",
            Self::QualityGateFailed => "QUALITY_GATE_FAILED",
            Self::Failed => "FAILED",
            Self::RolledBack => "ROLLED_BACK",
            Self::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed
                | Self::QualityGateFailed
                | Self::Failed
                | Self::RolledBack
                | Self::Cancelled
        )
    }

    /// States in which an explicit cancel request is accepted
    pub fn is_cancellable(&self) -> bool {
        matches!(self, Self::Pending | Self::Preparing | Self::InProgress)
    }

    pub fn can_transition_to(&self, next: DeploymentStatus) -> bool {
        use DeploymentStatus::*;
        match (self, next) {
            (Pending, Preparing) => true,
            (Preparing, QualityCheck) | (Preparing, InProgress) => true,
            (QualityCheck, InProgress) | (QualityCheck, QualityGateFailed) => true,
            (InProgress, Verifying) => true,
            (Verifying, Completed) => true,
            (Failed, RolledBack) => true,
            (from, Failed) => !from.is_terminal(),
            (from, Cancelled) => from.is_cancellable(),
            _ => false,
        }
    }
}

impl std::fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DeploymentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "PENDING" => Ok(Self::Pending),
            "PREPARING" => Ok(Self::Preparing),
            "QUALITY_CHECK" => Ok(Self::QualityCheck),
            "IN_PROGRESS" => Ok(Self::InProgress),
            "VERIFYING" => Ok(Self::Verifying),
            "COMPLETED" => Ok(Self::Completed),
            "QUALITY_GATE_FAILED" => Ok(Self::QualityGateFailed),
            "FAILED" => Ok(Self::Failed),
            "ROLLED_BACK" => Ok(Self::RolledBack),
            "CANCELLED" => Ok(Self::Cancelled),
            _ => Err(format!("Unknown deployment status: {}", s)),
        }
    }
}

/// One attempted release. Mutated only by the orchestrator, never deleted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Deployment {
    pub id: String,
    pub config_id: String,
    pub application: String,
    pub environment: Environment,
    pub version: String,
    pub status: DeploymentStatus,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub duration_ms: Option<u64>,
    /// Version that was live before this release; the rollback target
    pub previous_version: Option<String>,
    /// Resolved image reference that was rolled out
    pub artifact: Option<String>,
    pub metrics: Option<ApplicationMetrics>,
    pub error: Option<String>,
    /// Deployment spawned to roll this one back
    pub rollback_id: Option<String>,
    /// Deployment this one rolls back
    pub rollback_of: Option<String>,
    #[serde(default)]
    pub is_rollback: bool,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub force: bool,
    pub quality_check_id: Option<String>,
    pub quality_score: Option<f64>,
    pub quality_passed: Option<bool>,
    #[serde(default)]
    pub quality_blockers: Vec<Blocker>,
    pub triggered_by: Option<String>,
}

impl Deployment {
    pub fn new(id: String, config: &DeploymentConfig, version: String) -> Self {
        Self {
            id,
            config_id: config.id.clone(),
            application: config.application.clone(),
            environment: config.environment,
            version,
            status: DeploymentStatus::Pending,
            started_at: now_rfc3339(),
            finished_at: None,
            duration_ms: None,
            previous_version: None,
            artifact: None,
            metrics: None,
            error: None,
            rollback_id: None,
            rollback_of: None,
            is_rollback: false,
            dry_run: false,
            force: false,
            quality_check_id: None,
            quality_score: None,
            quality_passed: None,
            quality_blockers: Vec::new(),
            triggered_by: None,
        }
    }

    /// Short, DNS-safe release label derived from the deployment id
    pub fn release_label(&self) -> String {
        self.id.chars().filter(|c| c.is_ascii_alphanumeric()).take(8).collect::<String>().to_lowercase()
    }
}

/// Query filters for listing deployments
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeploymentFilter {
    pub application: Option<String>,
    pub environment: Option<Environment>,
    pub status: Option<DeploymentStatus>,
    pub limit: Option<u32>,
}

impl DeploymentConfig {
    pub async fn insert(&self, db: &SqlitePool) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO deployment_configs (id, name, application, environment, document, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&self.id)
        .bind(&self.name)
        .bind(&self.application)
        .bind(self.environment.as_str())
        .bind(to_document(self)?)
        .bind(&self.created_at)
        .execute(db)
        .await?;
        Ok(())
    }

    pub async fn get_by_id(db: &SqlitePool, id: &str) -> Result<Option<Self>, sqlx::Error> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT document FROM deployment_configs WHERE id = ?")
                .bind(id)
                .fetch_optional(db)
                .await?;
        row.map(|(doc,)| from_document(&doc)).transpose()
    }

    pub async fn list(db: &SqlitePool) -> Result<Vec<Self>, sqlx::Error> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT document FROM deployment_configs ORDER BY created_at DESC, id")
                .fetch_all(db)
                .await?;
        rows.iter().map(|(doc,)| from_document(doc)).collect()
    }
}

impl Deployment {
    /// Insert or replace the stored record
    pub async fn save(&self, db: &SqlitePool) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO deployments (id, config_id, application, environment, version, status, started_at, document)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                version = excluded.version,
                document = excluded.document
            "#,
        )
        .bind(&self.id)
        .bind(&self.config_id)
        .bind(&self.application)
        .bind(self.environment.as_str())
        .bind(&self.version)
        .bind(self.status.as_str())
        .bind(&self.started_at)
        .bind(to_document(self)?)
        .execute(db)
        .await?;
        Ok(())
    }

    /// Store the record only if the stored status is still `expected`.
    /// Returns false when another writer moved it first.
    pub async fn save_if_status(&self, db: &SqlitePool, expected: DeploymentStatus) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE deployments SET status = ?, version = ?, document = ?
            WHERE id = ? AND status = ?
            "#,
        )
        .bind(self.status.as_str())
        .bind(&self.version)
        .bind(to_document(self)?)
        .bind(&self.id)
        .bind(expected.as_str())
        .execute(db)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn get_by_id(db: &SqlitePool, id: &str) -> Result<Option<Self>, sqlx::Error> {
        let row: Option<(String,)> = sqlx::query_as("SELECT document FROM deployments WHERE id = ?")
            .bind(id)
            .fetch_optional(db)
            .await?;
        row.map(|(doc,)| from_document(&doc)).transpose()
    }

    pub async fn list(
        db: &SqlitePool,
        filter: &DeploymentFilter,
    ) -> Result<Vec<Self>, sqlx::Error> {
        let mut query: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT document FROM deployments WHERE 1 = 1");
        if let Some(app) = &filter.application {
            query.push(" AND application = ").push_bind(app.clone());
        }
        if let Some(env) = filter.environment {
            query.push(" AND environment = ").push_bind(env.as_str());
        }
        if let Some(status) = filter.status {
            query.push(" AND status = ").push_bind(status.as_str());
        }
        query
            .push(" ORDER BY started_at DESC, rowid DESC LIMIT ")
            .push_bind(filter.limit.unwrap_or(50) as i64);

        let rows: Vec<(String,)> = query.build_query_as().fetch_all(db).await?;
        rows.iter().map(|(doc,)| from_document(doc)).collect()
    }

    /// Most recent completed deployment of an application in an environment
    pub async fn latest_completed(
        db: &SqlitePool,
        application: &str,
        environment: Environment,
        exclude_id: &str,
    ) -> Result<Option<Self>, sqlx::Error> {
        let row: Option<(String,)> = sqlx::query_as(
            r#"
            SELECT document FROM deployments
            WHERE application = ? AND environment = ? AND status = 'COMPLETED' AND id != ?
              AND COALESCE(json_extract(document, '$.dry_run'), 0) = 0
            ORDER BY started_at DESC, rowid DESC
            LIMIT 1
            "#,
        )
        .bind(application)
        .bind(environment.as_str())
        .bind(exclude_id)
        .fetch_optional(db)
        .await?;
        row.map(|(doc,)| from_document(&doc)).transpose()
    }

    /// Non-archived deployments of an application in an environment, newest first
    pub async fn history(
        db: &SqlitePool,
        application: &str,
        environment: Environment,
        limit: u32,
    ) -> Result<Vec<Self>, sqlx::Error> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT document FROM deployments
            WHERE application = ? AND environment = ? AND archived = 0
            ORDER BY started_at DESC, rowid DESC
            LIMIT ?
            "#,
        )
        .bind(application)
        .bind(environment.as_str())
        .bind(limit as i64)
        .fetch_all(db)
        .await?;
        rows.iter().map(|(doc,)| from_document(doc)).collect()
    }

    /// Archive finished deployments beyond the newest `keep`. Records are kept, only hidden from history.
    pub async fn archive_beyond(
        db: &SqlitePool,
        application: &str,
        environment: Environment,
        keep: usize,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE deployments SET archived = 1
            WHERE archived = 0 AND id IN (
                SELECT id FROM deployments
                WHERE application = ? AND environment = ?
                  AND status IN ('COMPLETED', 'QUALITY_GATE_FAILED', 'FAILED', 'ROLLED_BACK', 'CANCELLED')
                ORDER BY started_at DESC, rowid DESC
                LIMIT -1 OFFSET ?
            )
            "#,
        )
        .bind(application)
        .bind(environment.as_str())
        .bind(keep as i64)
        .execute(db)
        .await?;
        Ok(result.rows_affected())
    }

    /// Deployments left in a non-terminal state, e.g. by a crash
    pub async fn list_unfinished(db: &SqlitePool) -> Result<Vec<Self>, sqlx::Error> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT document FROM deployments
            WHERE status IN ('PENDING', 'PREPARING', 'QUALITY_CHECK', 'IN_PROGRESS', 'VERIFYING')
            ORDER BY started_at
            "#,
        )
        .fetch_all(db)
        .await?;
        rows.iter().map(|(doc,)| from_document(doc)).collect()
    }
}
