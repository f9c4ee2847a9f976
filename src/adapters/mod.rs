//! Capability contracts for the external systems the engines drive.
//!
//! Each collaborator is a trait object so the orchestrator and the pipeline
//! engine can run against real backends, no-op fallbacks, or test fakes.

mod docker;
mod github;
mod kubernetes;
mod prometheus;
mod quality;
mod terraform;

#[cfg(test)]
pub mod fake;

pub use docker::{DockerRegistry, ScanError};
pub use github::GitHubClient;
pub use kubernetes::KubernetesOperator;
pub use prometheus::PrometheusReader;
pub use quality::HttpQualityEvaluator;
pub use terraform::{TerraformCli, TerraformError};

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::db::{ApplicationMetrics, Blocker, Environment, MonitoringThresholds, ResourceSpec};

pub type Labels = BTreeMap<String, String>;

/// Desired shape of a cluster workload
#[derive(Debug, Clone, PartialEq)]
pub struct WorkloadSpec {
    pub name: String,
    pub namespace: String,
    pub image: String,
    pub replicas: u32,
    /// Labels on the workload object itself
    pub labels: Labels,
    /// Labels stamped on the pods and used as the workload selector
    pub pod_labels: Labels,
    pub port: u16,
    pub env: BTreeMap<String, String>,
    pub resources: ResourceSpec,
    pub max_surge: Option<String>,
    pub max_unavailable: Option<String>,
}

/// Observed state of a cluster workload
#[derive(Debug, Clone, PartialEq)]
pub struct Workload {
    pub name: String,
    pub namespace: String,
    pub image: Option<String>,
    pub replicas: u32,
    pub ready_replicas: u32,
    pub labels: Labels,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PodInfo {
    pub name: String,
    pub phase: String,
    pub ready: bool,
}

/// Routing object pointing traffic at a set of pods
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceRoute {
    pub name: String,
    pub namespace: String,
    pub selector: Labels,
    pub port: u16,
}

#[async_trait]
pub trait ClusterOperator: Send + Sync {
    async fn create_workload(&self, spec: &WorkloadSpec) -> Result<()>;
    /// Update image, replicas and labels of an existing workload
    async fn update_workload(&self, spec: &WorkloadSpec) -> Result<()>;
    async fn delete_workload(&self, namespace: &str, name: &str) -> Result<()>;
    async fn scale_workload(&self, namespace: &str, name: &str, replicas: u32) -> Result<()>;
    async fn list_workloads(&self, namespace: &str, selector: &Labels) -> Result<Vec<Workload>>;
    /// Merge `labels` into the workload's own labels
    async fn label_workload(&self, namespace: &str, name: &str, labels: &Labels) -> Result<()>;
    /// Wait until every desired replica of the workload is updated and ready
    async fn wait_for_rollout(&self, namespace: &str, name: &str, timeout: Duration) -> Result<()>;
    async fn get_pods(&self, namespace: &str, selector: &Labels) -> Result<Vec<PodInfo>>;
    /// Point the service at `route.selector`, creating the service if needed
    async fn switch_service_selector(&self, route: &ServiceRoute) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct BuildRequest {
    /// Directory sent as the build context
    pub context: PathBuf,
    pub dockerfile: String,
    /// Full image reference to tag the result with
    pub reference: String,
    pub build_args: BTreeMap<String, String>,
}

/// Vulnerability counts reported by the image scanner
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScanReport {
    pub critical: u32,
    pub high: u32,
    pub medium: u32,
    pub low: u32,
}

#[async_trait]
pub trait ArtifactRegistry: Send + Sync {
    /// Build an image and return its reference
    async fn build_image(&self, request: &BuildRequest) -> Result<String>;
    async fn pull_image(&self, reference: &str) -> Result<()>;
    async fn push_image(&self, reference: &str) -> Result<()>;
    async fn scan_image(&self, reference: &str) -> Result<ScanReport>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub id: u64,
    /// queued, in_progress or completed
    pub status: String,
    /// success, failure, cancelled... once completed
    pub conclusion: Option<String>,
    pub head_branch: Option<String>,
    pub html_url: Option<String>,
    pub created_at: String,
}

impl WorkflowRun {
    pub fn is_completed(&self) -> bool {
        self.status == "completed"
    }

    pub fn succeeded(&self) -> bool {
        self.conclusion.as_deref() == Some("success")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowDispatch {
    pub owner: String,
    pub repo: String,
    pub workflow_id: String,
    pub git_ref: String,
    pub inputs: BTreeMap<String, String>,
}

#[async_trait]
pub trait SourceHosting: Send + Sync {
    async fn trigger_workflow(&self, dispatch: &WorkflowDispatch) -> Result<()>;
    /// Most recent runs of a workflow, newest first
    async fn list_workflow_runs(
        &self,
        owner: &str,
        repo: &str,
        workflow_id: &str,
    ) -> Result<Vec<WorkflowRun>>;
    async fn create_deployment_status(
        &self,
        owner: &str,
        repo: &str,
        git_ref: &str,
        environment: Environment,
        state: &str,
        description: &str,
    ) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct InfraRequest {
    pub working_dir: PathBuf,
    pub variables: BTreeMap<String, String>,
    pub workspace: Option<String>,
}

#[async_trait]
pub trait InfraOperator: Send + Sync {
    async fn init(&self, request: &InfraRequest) -> Result<String>;
    async fn plan(&self, request: &InfraRequest) -> Result<String>;
    async fn apply(&self, request: &InfraRequest) -> Result<String>;
    async fn destroy(&self, request: &InfraRequest) -> Result<String>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetricsQuery {
    pub namespace: String,
    pub application: String,
    /// Restrict to one release (e.g. the canary)
    pub release: Option<String>,
}

#[async_trait]
pub trait MetricsReader: Send + Sync {
    async fn get_application_metrics(&self, query: &MetricsQuery) -> Result<ApplicationMetrics>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityRequest {
    pub project_id: String,
    pub path: String,
    pub environment: Option<Environment>,
    pub min_score: Option<f64>,
}

/// Whether the evaluator lets a release through
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeployVerdict {
    pub allowed: bool,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub score: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityAnalysis {
    pub check_id: String,
    pub score: f64,
    pub passed: bool,
    #[serde(default)]
    pub blockers: Vec<Blocker>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackVerdict {
    pub needed: bool,
    #[serde(default)]
    pub reason: Option<String>,
}

#[async_trait]
pub trait QualityEvaluator: Send + Sync {
    async fn can_deploy(&self, request: &QualityRequest) -> Result<DeployVerdict>;
    async fn analyze_for_deployment(&self, request: &QualityRequest) -> Result<QualityAnalysis>;
    async fn setup_rollback_triggers(
        &self,
        deployment_id: &str,
        project_id: &str,
        baseline: &QualityAnalysis,
        thresholds: &MonitoringThresholds,
    ) -> Result<()>;
    async fn check_rollback_needed(&self, deployment_id: &str) -> Result<RollbackVerdict>;
}

/// Fallback used when no cluster is reachable
pub struct NoopCluster;

#[async_trait]
impl ClusterOperator for NoopCluster {
    async fn create_workload(&self, _spec: &WorkloadSpec) -> Result<()> {
        anyhow::bail!("No cluster operator available")
    }
    async fn update_workload(&self, _spec: &WorkloadSpec) -> Result<()> {
        anyhow::bail!("No cluster operator available")
    }
    async fn delete_workload(&self, _namespace: &str, _name: &str) -> Result<()> {
        anyhow::bail!("No cluster operator available")
    }
    async fn scale_workload(&self, _namespace: &str, _name: &str, _replicas: u32) -> Result<()> {
        anyhow::bail!("No cluster operator available")
    }
    async fn list_workloads(&self, _namespace: &str, _selector: &Labels) -> Result<Vec<Workload>> {
        anyhow::bail!("No cluster operator available")
    }
    async fn label_workload(&self, _namespace: &str, _name: &str, _labels: &Labels) -> Result<()> {
        anyhow::bail!("No cluster operator available")
    }
    async fn wait_for_rollout(&self, _namespace: &str, _name: &str, _timeout: Duration) -> Result<()> {
        anyhow::bail!("No cluster operator available")
    }
    async fn get_pods(&self, _namespace: &str, _selector: &Labels) -> Result<Vec<PodInfo>> {
        anyhow::bail!("No cluster operator available")
    }
    async fn switch_service_selector(&self, _route: &ServiceRoute) -> Result<()> {
        anyhow::bail!("No cluster operator available")
    }
}

pub struct NoopRegistry;

#[async_trait]
impl ArtifactRegistry for NoopRegistry {
    async fn build_image(&self, _request: &BuildRequest) -> Result<String> {
        anyhow::bail!("No artifact registry available")
    }
    async fn pull_image(&self, _reference: &str) -> Result<()> {
        anyhow::bail!("No artifact registry available")
    }
    async fn push_image(&self, _reference: &str) -> Result<()> {
        anyhow::bail!("No artifact registry available")
    }
    async fn scan_image(&self, _reference: &str) -> Result<ScanReport> {
        anyhow::bail!("No artifact registry available")
    }
}

pub struct NoopSourceHosting;

#[async_trait]
impl SourceHosting for NoopSourceHosting {
    async fn trigger_workflow(&self, _dispatch: &WorkflowDispatch) -> Result<()> {
        anyhow::bail!("Source hosting is not configured (set github.token)")
    }
    async fn list_workflow_runs(&self, _owner: &str, _repo: &str, _workflow_id: &str) -> Result<Vec<WorkflowRun>> {
        anyhow::bail!("Source hosting is not configured (set github.token)")
    }
    async fn create_deployment_status(
        &self,
        _owner: &str,
        _repo: &str,
        _git_ref: &str,
        _environment: Environment,
        _state: &str,
        _description: &str,
    ) -> Result<()> {
        anyhow::bail!("Source hosting is not configured (set github.token)")
    }
}

pub struct NoopInfra;

#[async_trait]
impl InfraOperator for NoopInfra {
    async fn init(&self, _request: &InfraRequest) -> Result<String> {
        anyhow::bail!("No infrastructure operator available")
    }
    async fn plan(&self, _request: &InfraRequest) -> Result<String> {
        anyhow::bail!("No infrastructure operator available")
    }
    async fn apply(&self, _request: &InfraRequest) -> Result<String> {
        anyhow::bail!("No infrastructure operator available")
    }
    async fn destroy(&self, _request: &InfraRequest) -> Result<String> {
        anyhow::bail!("No infrastructure operator available")
    }
}

pub struct NoopMetrics;

#[async_trait]
impl MetricsReader for NoopMetrics {
    async fn get_application_metrics(&self, _query: &MetricsQuery) -> Result<ApplicationMetrics> {
        anyhow::bail!("Metrics backend is not configured (set prometheus.url)")
    }
}

pub struct NoopQuality;

#[async_trait]
impl QualityEvaluator for NoopQuality {
    async fn can_deploy(&self, _request: &QualityRequest) -> Result<DeployVerdict> {
        anyhow::bail!("Quality evaluator is not configured (set quality.url)")
    }
    async fn analyze_for_deployment(&self, _request: &QualityRequest) -> Result<QualityAnalysis> {
        anyhow::bail!("Quality evaluator is not configured (set quality.url)")
    }
    async fn setup_rollback_triggers(
        &self,
        _deployment_id: &str,
        _project_id: &str,
        _baseline: &QualityAnalysis,
        _thresholds: &MonitoringThresholds,
    ) -> Result<()> {
        anyhow::bail!("Quality evaluator is not configured (set quality.url)")
    }
    async fn check_rollback_needed(&self, _deployment_id: &str) -> Result<RollbackVerdict> {
        anyhow::bail!("Quality evaluator is not configured (set quality.url)")
    }
}

/// The full set of collaborators handed to both engines
#[derive(Clone)]
pub struct Adapters {
    pub cluster: Arc<dyn ClusterOperator>,
    pub registry: Arc<dyn ArtifactRegistry>,
    pub source: Arc<dyn SourceHosting>,
    pub infra: Arc<dyn InfraOperator>,
    pub metrics: Arc<dyn MetricsReader>,
    pub quality: Arc<dyn QualityEvaluator>,
}

impl Adapters {
    pub fn noop() -> Self {
        Self {
            cluster: Arc::new(NoopCluster),
            registry: Arc::new(NoopRegistry),
            source: Arc::new(NoopSourceHosting),
            infra: Arc::new(NoopInfra),
            metrics: Arc::new(NoopMetrics),
            quality: Arc::new(NoopQuality),
        }
    }

    /// Connect every configured backend, falling back to no-ops for the rest
    pub async fn from_config(config: &Config) -> Self {
        let mut adapters = Self::noop();

        if config.kubernetes.enabled {
            match KubernetesOperator::connect(&config.kubernetes).await {
                Ok(operator) => {
                    tracing::info!("Connected to Kubernetes cluster");
                    adapters.cluster = Arc::new(operator);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to connect to Kubernetes. Rollouts will not work.");
                }
            }
        }

        if config.docker.enabled {
            match DockerRegistry::new(&config.docker) {
                Ok(registry) if registry.is_available().await => {
                    tracing::info!("Connected to Docker daemon");
                    adapters.registry = Arc::new(registry);
                }
                Ok(_) => tracing::warn!("Docker daemon is not responding. Image builds will not work."),
                Err(e) => tracing::warn!(error = %e, "Failed to connect to Docker. Image builds will not work."),
            }
        }

        if let Some(token) = &config.github.token {
            adapters.source = Arc::new(GitHubClient::new(token.clone(), config.github.api_url.clone()));
        }

        adapters.infra = Arc::new(TerraformCli::new(config.terraform.binary.clone()));

        if let Some(url) = &config.prometheus.url {
            adapters.metrics = Arc::new(PrometheusReader::new(url.clone()));
        }

        if let Some(url) = &config.quality.url {
            adapters.quality = Arc::new(HttpQualityEvaluator::new(url.clone(), config.quality.api_key.clone()));
        }

        adapters
    }
}

/// Render labels as a Kubernetes label selector string
pub fn selector_string(labels: &Labels) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}
