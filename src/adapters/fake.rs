//! In-memory adapters that record every call, for engine tests.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::*;
use crate::db::{ApplicationMetrics, Environment, MonitoringThresholds};

fn matches_selector(labels: &Labels, selector: &Labels) -> bool {
    selector.iter().all(|(k, v)| labels.get(k) == Some(v))
}

#[derive(Default)]
pub struct FakeCluster {
    workloads: Mutex<BTreeMap<String, Workload>>,
    pod_labels: Mutex<BTreeMap<String, Labels>>,
    services: Mutex<BTreeMap<String, Labels>>,
    calls: Mutex<Vec<String>>,
    /// Rollouts of workloads whose name contains this never become ready
    pub fail_rollout_for: Mutex<Option<String>>,
    pub pods_unready: AtomicBool,
}

impl FakeCluster {
    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn workload(&self, name: &str) -> Option<Workload> {
        self.workloads.lock().unwrap().get(name).cloned()
    }

    pub fn workload_names(&self) -> Vec<String> {
        self.workloads.lock().unwrap().keys().cloned().collect()
    }

    pub fn service_selector(&self, name: &str) -> Option<Labels> {
        self.services.lock().unwrap().get(name).cloned()
    }

    fn store(&self, spec: &WorkloadSpec) {
        self.workloads.lock().unwrap().insert(
            spec.name.clone(),
            Workload {
                name: spec.name.clone(),
                namespace: spec.namespace.clone(),
                image: Some(spec.image.clone()),
                replicas: spec.replicas,
                ready_replicas: spec.replicas,
                labels: spec.labels.clone(),
            },
        );
        self.pod_labels
            .lock()
            .unwrap()
            .insert(spec.name.clone(), spec.pod_labels.clone());
    }
}

#[async_trait]
impl ClusterOperator for FakeCluster {
    async fn create_workload(&self, spec: &WorkloadSpec) -> Result<()> {
        self.record(format!("create {} {}", spec.name, spec.replicas));
        if self.workloads.lock().unwrap().contains_key(&spec.name) {
            anyhow::bail!("workload {} already exists", spec.name);
        }
        self.store(spec);
        Ok(())
    }

    async fn update_workload(&self, spec: &WorkloadSpec) -> Result<()> {
        self.record(format!("update {} {}", spec.name, spec.replicas));
        self.store(spec);
        Ok(())
    }

    async fn delete_workload(&self, _namespace: &str, name: &str) -> Result<()> {
        self.record(format!("delete {}", name));
        self.workloads.lock().unwrap().remove(name);
        self.pod_labels.lock().unwrap().remove(name);
        Ok(())
    }

    async fn scale_workload(&self, _namespace: &str, name: &str, replicas: u32) -> Result<()> {
        self.record(format!("scale {} {}", name, replicas));
        match self.workloads.lock().unwrap().get_mut(name) {
            Some(w) => {
                w.replicas = replicas;
                w.ready_replicas = replicas;
                Ok(())
            }
            None => anyhow::bail!("workload {} not found", name),
        }
    }

    async fn list_workloads(&self, _namespace: &str, selector: &Labels) -> Result<Vec<Workload>> {
        Ok(self
            .workloads
            .lock()
            .unwrap()
            .values()
            .filter(|w| matches_selector(&w.labels, selector))
            .cloned()
            .collect())
    }

    async fn label_workload(&self, _namespace: &str, name: &str, labels: &Labels) -> Result<()> {
        self.record(format!("label {} {}", name, selector_string(labels)));
        match self.workloads.lock().unwrap().get_mut(name) {
            Some(w) => {
                w.labels.extend(labels.clone());
                Ok(())
            }
            None => anyhow::bail!("workload {} not found", name),
        }
    }

    async fn wait_for_rollout(&self, _namespace: &str, name: &str, _timeout: Duration) -> Result<()> {
        self.record(format!("wait {}", name));
        if let Some(pattern) = self.fail_rollout_for.lock().unwrap().as_deref() {
            if name.contains(pattern) {
                anyhow::bail!("Workload {} did not become ready", name);
            }
        }
        Ok(())
    }

    async fn get_pods(&self, _namespace: &str, selector: &Labels) -> Result<Vec<PodInfo>> {
        let ready = !self.pods_unready.load(Ordering::SeqCst);
        let workloads = self.workloads.lock().unwrap();
        let pod_labels = self.pod_labels.lock().unwrap();
        let mut pods = Vec::new();
        for (name, labels) in pod_labels.iter() {
            if !matches_selector(labels, selector) {
                continue;
            }
            let replicas = workloads.get(name).map(|w| w.replicas).unwrap_or(0);
            for i in 0..replicas {
                pods.push(PodInfo {
                    name: format!("{}-{}", name, i),
                    phase: "Running".to_string(),
                    ready,
                });
            }
        }
        Ok(pods)
    }

    async fn switch_service_selector(&self, route: &ServiceRoute) -> Result<()> {
        self.record(format!("switch {} {}", route.name, selector_string(&route.selector)));
        self.services
            .lock()
            .unwrap()
            .insert(route.name.clone(), route.selector.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeRegistry {
    calls: Mutex<Vec<String>>,
    pub scan: Mutex<ScanReport>,
    pub fail_build: AtomicBool,
}

impl FakeRegistry {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ArtifactRegistry for FakeRegistry {
    async fn build_image(&self, request: &BuildRequest) -> Result<String> {
        self.calls.lock().unwrap().push(format!("build {}", request.reference));
        if self.fail_build.load(Ordering::SeqCst) {
            anyhow::bail!("Build error: exit code 1");
        }
        Ok(request.reference.clone())
    }

    async fn pull_image(&self, reference: &str) -> Result<()> {
        self.calls.lock().unwrap().push(format!("pull {}", reference));
        Ok(())
    }

    async fn push_image(&self, reference: &str) -> Result<()> {
        self.calls.lock().unwrap().push(format!("push {}", reference));
        Ok(())
    }

    async fn scan_image(&self, reference: &str) -> Result<ScanReport> {
        self.calls.lock().unwrap().push(format!("scan {}", reference));
        Ok(self.scan.lock().unwrap().clone())
    }
}

#[derive(Default)]
pub struct FakeSource {
    calls: Mutex<Vec<String>>,
    /// Runs returned by `list_workflow_runs`
    pub runs: Mutex<Vec<WorkflowRun>>,
}

impl FakeSource {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn completed_run(id: u64, conclusion: &str) -> WorkflowRun {
        WorkflowRun {
            id,
            status: "completed".to_string(),
            conclusion: Some(conclusion.to_string()),
            head_branch: Some("main".to_string()),
            html_url: None,
            created_at: "2030-01-01T00:00:00Z".to_string(),
        }
    }
}

#[async_trait]
impl SourceHosting for FakeSource {
    async fn trigger_workflow(&self, dispatch: &WorkflowDispatch) -> Result<()> {
        self.calls.lock().unwrap().push(format!(
            "dispatch {}/{} {}@{}",
            dispatch.owner, dispatch.repo, dispatch.workflow_id, dispatch.git_ref
        ));
        Ok(())
    }

    async fn list_workflow_runs(&self, _owner: &str, _repo: &str, _workflow_id: &str) -> Result<Vec<WorkflowRun>> {
        Ok(self.runs.lock().unwrap().clone())
    }

    async fn create_deployment_status(
        &self,
        _owner: &str,
        _repo: &str,
        _git_ref: &str,
        environment: Environment,
        state: &str,
        _description: &str,
    ) -> Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("status {} {}", environment, state));
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeInfra {
    calls: Mutex<Vec<String>>,
}

impl FakeInfra {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, action: &str, request: &InfraRequest) -> Result<String> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("{} {}", action, request.working_dir.display()));
        Ok(format!("{} complete", action))
    }
}

#[async_trait]
impl InfraOperator for FakeInfra {
    async fn init(&self, request: &InfraRequest) -> Result<String> {
        self.record("init", request)
    }
    async fn plan(&self, request: &InfraRequest) -> Result<String> {
        self.record("plan", request)
    }
    async fn apply(&self, request: &InfraRequest) -> Result<String> {
        self.record("apply", request)
    }
    async fn destroy(&self, request: &InfraRequest) -> Result<String> {
        self.record("destroy", request)
    }
}

#[derive(Default)]
pub struct FakeMetrics {
    pub current: Mutex<ApplicationMetrics>,
    pub reads: AtomicUsize,
}

#[async_trait]
impl MetricsReader for FakeMetrics {
    async fn get_application_metrics(&self, _query: &MetricsQuery) -> Result<ApplicationMetrics> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(self.current.lock().unwrap().clone())
    }
}

pub struct FakeQuality {
    calls: Mutex<Vec<String>>,
    pub verdict: Mutex<DeployVerdict>,
    /// Analyses handed out in order; the last one repeats
    pub analyses: Mutex<VecDeque<QualityAnalysis>>,
    pub rollback: Mutex<RollbackVerdict>,
}

impl Default for FakeQuality {
    fn default() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            verdict: Mutex::new(DeployVerdict {
                allowed: true,
                reason: None,
                score: Some(90.0),
            }),
            analyses: Mutex::new(VecDeque::from([Self::analysis("qc-1", 90.0, vec![])])),
            rollback: Mutex::new(RollbackVerdict {
                needed: false,
                reason: None,
            }),
        }
    }
}

impl FakeQuality {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn analysis(check_id: &str, score: f64, blockers: Vec<crate::db::Blocker>) -> QualityAnalysis {
        QualityAnalysis {
            check_id: check_id.to_string(),
            score,
            passed: blockers.is_empty(),
            blockers,
        }
    }

    pub fn deny(&self, reason: &str) {
        *self.verdict.lock().unwrap() = DeployVerdict {
            allowed: false,
            reason: Some(reason.to_string()),
            score: Some(42.0),
        };
    }
}

#[async_trait]
impl QualityEvaluator for FakeQuality {
    async fn can_deploy(&self, request: &QualityRequest) -> Result<DeployVerdict> {
        self.calls.lock().unwrap().push(format!("can_deploy {}", request.project_id));
        Ok(self.verdict.lock().unwrap().clone())
    }

    async fn analyze_for_deployment(&self, request: &QualityRequest) -> Result<QualityAnalysis> {
        self.calls.lock().unwrap().push(format!("analyze {}", request.project_id));
        let mut analyses = self.analyses.lock().unwrap();
        let next = if analyses.len() > 1 {
            analyses.pop_front()
        } else {
            analyses.front().cloned()
        };
        next.ok_or_else(|| anyhow::anyhow!("no analysis available"))
    }

    async fn setup_rollback_triggers(
        &self,
        deployment_id: &str,
        _project_id: &str,
        _baseline: &QualityAnalysis,
        _thresholds: &MonitoringThresholds,
    ) -> Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("setup_rollback_triggers {}", deployment_id));
        Ok(())
    }

    async fn check_rollback_needed(&self, deployment_id: &str) -> Result<RollbackVerdict> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("check_rollback_needed {}", deployment_id));
        Ok(self.rollback.lock().unwrap().clone())
    }
}

/// Concrete handles to every fake plus the trait-object bundle
#[derive(Default)]
pub struct FakeAdapters {
    pub cluster: Arc<FakeCluster>,
    pub registry: Arc<FakeRegistry>,
    pub source: Arc<FakeSource>,
    pub infra: Arc<FakeInfra>,
    pub metrics: Arc<FakeMetrics>,
    pub quality: Arc<FakeQuality>,
}

impl FakeAdapters {
    pub fn adapters(&self) -> Adapters {
        Adapters {
            cluster: self.cluster.clone(),
            registry: self.registry.clone(),
            source: self.source.clone(),
            infra: self.infra.clone(),
            metrics: self.metrics.clone(),
            quality: self.quality.clone(),
        }
    }
}
