//! Deployment orchestrator.
//!
//! Drives one release through
//! `PENDING -> PREPARING -> [QUALITY_CHECK] -> IN_PROGRESS -> VERIFYING -> COMPLETED`,
//! persisting the record after every transition. Failures after preparation
//! end in `FAILED` and, when the config asks for it, an automatic rollback to
//! the version that was live before.

use anyhow::Context;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::artifact::ArtifactResolver;
use super::health::{self, HealthTarget};
use super::quality_monitor::{self, DeploymentJob};
use super::strategy::{RolloutPlan, StrategyExecutor};
use super::{EngineError, EngineResult};
use crate::adapters::{Adapters, MetricsQuery, QualityRequest};
use crate::config::DeploymentSettings;
use crate::db::{
    duration_ms, now_rfc3339, DbPool, Deployment, DeploymentConfig, DeploymentFilter, DeploymentStatus,
    Environment, Job, NotificationEventType, SourceDescriptor,
};
use crate::notifications::{NotificationPayload, Notifier};
use crate::queue::{JobOptions, JobProcessor, JobQueue, DEPLOYMENTS_QUEUE, QUALITY_MONITOR_QUEUE};

/// Per-request deployment switches
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeploymentOptions {
    #[serde(default)]
    pub dry_run: bool,
    /// Deploy even when the quality gate says no
    #[serde(default)]
    pub force: bool,
    #[serde(default)]
    pub triggered_by: Option<String>,
}

/// How a run ended when no error occurred
enum Flow {
    Verified,
    GateFailed(String),
    Cancelled,
}

pub struct DeploymentOrchestrator {
    db: DbPool,
    adapters: Adapters,
    queue: JobQueue,
    notifier: Arc<dyn Notifier>,
    settings: DeploymentSettings,
    strategies: Arc<StrategyExecutor>,
    artifacts: ArtifactResolver,
    cancellations: DashMap<String, ()>,
}

impl DeploymentOrchestrator {
    pub fn new(
        db: DbPool,
        adapters: Adapters,
        queue: JobQueue,
        notifier: Arc<dyn Notifier>,
        settings: DeploymentSettings,
    ) -> Self {
        let strategies = Arc::new(StrategyExecutor::new(
            adapters.cluster.clone(),
            adapters.metrics.clone(),
            settings.rollout_timeout(),
        ));
        let artifacts = ArtifactResolver::new(
            adapters.registry.clone(),
            adapters.source.clone(),
            settings.build_poll_interval(),
            settings.build_timeout(),
        );

        Self {
            db,
            adapters,
            queue,
            notifier,
            settings,
            strategies,
            artifacts,
            cancellations: DashMap::new(),
        }
    }

    /// Strategy executor shared with the pipeline engine
    pub fn strategies(&self) -> Arc<StrategyExecutor> {
        self.strategies.clone()
    }

    /// Fail records interrupted by a previous process, then start the workers
    pub async fn start(self: &Arc<Self>) -> anyhow::Result<()> {
        let interrupted = self.recover_interrupted().await?;
        if interrupted > 0 {
            tracing::warn!(count = interrupted, "Marked interrupted deployments as failed");
        }

        self.queue
            .register_processor(DEPLOYMENTS_QUEUE, self.clone() as Arc<dyn JobProcessor>)
            .await?;
        self.queue
            .register_processor(QUALITY_MONITOR_QUEUE, self.clone() as Arc<dyn JobProcessor>)
            .await?;
        Ok(())
    }

    async fn recover_interrupted(&self) -> EngineResult<usize> {
        let mut count = 0;
        for mut deployment in Deployment::list_unfinished(&self.db).await? {
            // Pending records still have a queued job
            if deployment.status == DeploymentStatus::Pending {
                continue;
            }
            deployment.error = Some(format!(
                "Interrupted in {} by a restart",
                deployment.status
            ));
            set_status(&mut deployment, DeploymentStatus::Failed)?;
            finish(&mut deployment);
            deployment.save(&self.db).await?;
            count += 1;
        }
        Ok(count)
    }

    pub async fn create_config(&self, mut config: DeploymentConfig) -> EngineResult<String> {
        let problems = config.validate();
        if !problems.is_empty() {
            return Err(EngineError::InvalidConfig(problems));
        }

        config.id = uuid::Uuid::new_v4().to_string();
        config.created_at = now_rfc3339();
        config.insert(&self.db).await?;

        tracing::info!(
            config_id = %config.id,
            application = %config.application,
            environment = %config.environment,
            strategy = config.strategy.kind(),
            "Deployment config created"
        );
        Ok(config.id)
    }

    pub async fn get_config(&self, id: &str) -> EngineResult<DeploymentConfig> {
        DeploymentConfig::get_by_id(&self.db, id)
            .await?
            .ok_or_else(|| EngineError::not_found("Deployment config", id))
    }

    pub async fn list_configs(&self) -> EngineResult<Vec<DeploymentConfig>> {
        Ok(DeploymentConfig::list(&self.db).await?)
    }

    /// Record a new deployment and queue it. Returns immediately.
    pub async fn deploy(&self, config_id: &str, options: DeploymentOptions) -> EngineResult<String> {
        let config = self.get_config(config_id).await?;
        let mut deployment = Deployment::new(uuid::Uuid::new_v4().to_string(), &config, config.version.clone());
        deployment.dry_run = options.dry_run;
        deployment.force = options.force;
        deployment.triggered_by = options.triggered_by;

        self.enqueue(&deployment).await?;
        tracing::info!(
            deployment_id = %deployment.id,
            application = %deployment.application,
            version = %deployment.version,
            dry_run = deployment.dry_run,
            "Deployment queued"
        );
        Ok(deployment.id)
    }

    async fn enqueue(&self, deployment: &Deployment) -> EngineResult<()> {
        deployment.save(&self.db).await?;
        let job = DeploymentJob {
            deployment_id: deployment.id.clone(),
        };
        self.queue
            .add_job(DEPLOYMENTS_QUEUE, &job, JobOptions::single_attempt())
            .await?;
        Ok(())
    }

    pub async fn get_deployment(&self, id: &str) -> EngineResult<Deployment> {
        Deployment::get_by_id(&self.db, id)
            .await?
            .ok_or_else(|| EngineError::not_found("Deployment", id))
    }

    pub async fn list_deployments(&self, filter: &DeploymentFilter) -> EngineResult<Vec<Deployment>> {
        Ok(Deployment::list(&self.db, filter).await?)
    }

    pub async fn get_history(
        &self,
        application: &str,
        environment: Environment,
        limit: u32,
    ) -> EngineResult<Vec<Deployment>> {
        Ok(Deployment::history(&self.db, application, environment, limit).await?)
    }

    /// Request cancellation. Honored at the next phase boundary.
    pub async fn cancel(&self, id: &str) -> EngineResult<Deployment> {
        let mut deployment = self.get_deployment(id).await?;
        if !deployment.status.is_cancellable() {
            return Err(EngineError::NotCancellable {
                kind: "Deployment",
                id: id.to_string(),
                state: deployment.status.to_string(),
            });
        }

        self.cancellations.insert(id.to_string(), ());
        if deployment.status == DeploymentStatus::Pending {
            // Not picked up yet; close it here so it is cancelled even without a worker
            let mut closing = deployment.clone();
            if self.close_cancelled(&mut closing, DeploymentStatus::Pending).await? {
                tracing::info!(deployment_id = %id, "Pending deployment cancelled");
                return Ok(closing);
            }
            // A worker claimed it first and honors the flag at its next checkpoint
            deployment = self.get_deployment(id).await?;
            if deployment.status.is_terminal() {
                self.cancellations.remove(id);
            }
        }
        tracing::info!(deployment_id = %id, status = %deployment.status, "Cancellation requested");
        Ok(deployment)
    }

    fn cancel_requested(&self, id: &str) -> bool {
        self.cancellations.contains_key(id)
    }

    /// Roll a deployment back to the version that was live before it
    pub async fn rollback(&self, id: &str, reason: Option<String>) -> EngineResult<String> {
        let reason = reason.unwrap_or_else(|| "Manual rollback".to_string());
        self.rollback_with(id, &reason, "manual").await
    }

    async fn rollback_with(&self, id: &str, reason: &str, trigger: &'static str) -> EngineResult<String> {
        let mut original = self.get_deployment(id).await?;

        if let Some(existing) = &original.rollback_id {
            return Err(EngineError::invalid(format!(
                "Deployment {} was already rolled back by {}",
                id, existing
            )));
        }
        if !matches!(original.status, DeploymentStatus::Completed | DeploymentStatus::Failed) {
            return Err(EngineError::invalid(format!(
                "Deployment {} is {} and cannot be rolled back",
                id, original.status
            )));
        }
        let Some(previous_version) = original.previous_version.clone() else {
            return Err(EngineError::NoPreviousVersion(id.to_string()));
        };

        let config = self.get_config(&original.config_id).await?;
        let mut rollback = Deployment::new(uuid::Uuid::new_v4().to_string(), &config, previous_version);
        rollback.is_rollback = true;
        rollback.rollback_of = Some(original.id.clone());
        rollback.triggered_by = Some(format!("rollback: {}", reason));

        self.enqueue(&rollback).await?;

        original.rollback_id = Some(rollback.id.clone());
        if original.status == DeploymentStatus::Failed {
            set_status(&mut original, DeploymentStatus::RolledBack)?;
        }
        original.save(&self.db).await?;

        metrics::counter!(crate::api::metrics::ROLLBACKS_TOTAL, "reason" => trigger).increment(1);
        tracing::warn!(
            deployment_id = %original.id,
            rollback_id = %rollback.id,
            version = %rollback.version,
            reason = %reason,
            "Rollback initiated"
        );
        self.notify(
            &config,
            &original,
            NotificationEventType::RollbackInitiated,
            format!("Rolling {} back to {}: {}", original.application, rollback.version, reason),
        )
        .await;

        Ok(rollback.id)
    }

    async fn notify(
        &self,
        config: &DeploymentConfig,
        deployment: &Deployment,
        event: NotificationEventType,
        message: String,
    ) {
        let payload = NotificationPayload::deployment_event(
            event,
            &deployment.id,
            &deployment.application,
            deployment.environment.as_str(),
            deployment.status.as_str(),
            message,
            deployment.error.clone(),
        );
        self.notifier.notify(&config.notifications, &payload).await;
    }

    async fn advance(&self, deployment: &mut Deployment, next: DeploymentStatus) -> EngineResult<()> {
        set_status(deployment, next)?;
        deployment.save(&self.db).await?;
        tracing::debug!(deployment_id = %deployment.id, status = %next, "Deployment status changed");
        Ok(())
    }

    /// Close a deployment as CANCELLED if its stored status is still `expected`
    async fn close_cancelled(&self, deployment: &mut Deployment, expected: DeploymentStatus) -> EngineResult<bool> {
        set_status(deployment, DeploymentStatus::Cancelled)?;
        deployment.error = Some("Cancelled by request".to_string());
        finish(deployment);
        if !deployment.save_if_status(&self.db, expected).await? {
            return Ok(false);
        }
        record_outcome(deployment);
        Ok(true)
    }

    /// Run a queued deployment to a terminal state
    async fn run(&self, id: &str) -> EngineResult<()> {
        let outcome = self.claim_and_run(id).await;
        self.cancellations.remove(id);
        outcome
    }

    async fn claim_and_run(&self, id: &str) -> EngineResult<()> {
        let mut deployment = self.get_deployment(id).await?;
        if deployment.status != DeploymentStatus::Pending {
            tracing::debug!(deployment_id = %id, status = %deployment.status, "Deployment already picked up");
            return Ok(());
        }
        let config = self.get_config(&deployment.config_id).await?;

        // Claim it; a concurrent cancel of the PENDING record wins
        set_status(&mut deployment, DeploymentStatus::Preparing)?;
        if !deployment.save_if_status(&self.db, DeploymentStatus::Pending).await? {
            tracing::debug!(deployment_id = %id, "Deployment closed before pickup");
            return Ok(());
        }

        let result = self.execute(&config, &mut deployment).await;

        match result {
            Ok(Flow::Verified) => {
                set_status(&mut deployment, DeploymentStatus::Completed)?;
                finish(&mut deployment);
                deployment.save(&self.db).await?;
                record_outcome(&deployment);
                tracing::info!(
                    deployment_id = %id,
                    version = %deployment.version,
                    duration_ms = deployment.duration_ms.unwrap_or(0),
                    "Deployment completed"
                );
                self.notify(
                    &config,
                    &deployment,
                    NotificationEventType::DeploymentCompleted,
                    format!("{} {} is live", deployment.application, deployment.version),
                )
                .await;
                self.report_to_source(&config, &deployment, "success").await;
                self.prune_history(&config, &deployment).await;
                // Armed only once COMPLETED is stored, the check skips anything else
                if !deployment.dry_run {
                    self.arm_monitoring(&config, &deployment).await;
                }
            }
            Ok(Flow::GateFailed(reason)) => {
                deployment.error = Some(reason.clone());
                set_status(&mut deployment, DeploymentStatus::QualityGateFailed)?;
                finish(&mut deployment);
                deployment.save(&self.db).await?;
                record_outcome(&deployment);
                tracing::warn!(deployment_id = %id, reason = %reason, "Quality gate blocked deployment");
                self.notify(
                    &config,
                    &deployment,
                    NotificationEventType::QualityGateFailed,
                    format!("Quality gate blocked {} {}", deployment.application, deployment.version),
                )
                .await;
            }
            Ok(Flow::Cancelled) => {
                let status = deployment.status;
                self.close_cancelled(&mut deployment, status).await?;
                tracing::info!(deployment_id = %id, "Deployment cancelled");
                self.notify(
                    &config,
                    &deployment,
                    NotificationEventType::DeploymentCancelled,
                    format!("Deployment of {} was cancelled", deployment.application),
                )
                .await;
            }
            Err(e) => self.fail(&config, &mut deployment, e).await?,
        }

        Ok(())
    }

    async fn fail(&self, config: &DeploymentConfig, deployment: &mut Deployment, error: anyhow::Error) -> EngineResult<()> {
        let message = format!("{:#}", error);
        tracing::error!(deployment_id = %deployment.id, error = %message, "Deployment failed");

        deployment.error = Some(message);
        if !deployment.status.is_terminal() {
            set_status(deployment, DeploymentStatus::Failed)?;
        }
        finish(deployment);
        deployment.save(&self.db).await?;
        record_outcome(deployment);

        self.notify(
            config,
            deployment,
            NotificationEventType::DeploymentFailed,
            format!("Deployment of {} {} failed", deployment.application, deployment.version),
        )
        .await;
        self.report_to_source(config, deployment, "failure").await;

        if config.automatic_rollback() && !deployment.is_rollback && !deployment.dry_run {
            match self.rollback_with(&deployment.id, "Automatic rollback after failure", "automatic").await {
                Ok(rollback_id) => {
                    tracing::info!(deployment_id = %deployment.id, rollback_id = %rollback_id, "Automatic rollback queued")
                }
                Err(e) => {
                    tracing::warn!(deployment_id = %deployment.id, error = %e, "Automatic rollback not possible")
                }
            }
        }
        Ok(())
    }

    async fn execute(&self, config: &DeploymentConfig, deployment: &mut Deployment) -> anyhow::Result<Flow> {
        if self.cancel_requested(&deployment.id) {
            return Ok(Flow::Cancelled);
        }

        self.notify(
            config,
            deployment,
            NotificationEventType::DeploymentStarted,
            format!(
                "Deploying {} {} to {}",
                deployment.application, deployment.version, deployment.environment
            ),
        )
        .await;

        // Captured before anything touches the cluster
        if let Some(previous) =
            Deployment::latest_completed(&self.db, &deployment.application, deployment.environment, &deployment.id)
                .await?
        {
            deployment.previous_version = Some(previous.version);
            deployment.save(&self.db).await?;
        }

        if self.cancel_requested(&deployment.id) {
            return Ok(Flow::Cancelled);
        }

        if let Some(gate) = config.quality_gate.as_ref().filter(|g| g.enabled) {
            self.advance(deployment, DeploymentStatus::QualityCheck).await?;

            let request = QualityRequest {
                project_id: gate.project_id.clone(),
                path: gate.path.clone(),
                environment: Some(deployment.environment),
                min_score: gate.min_score,
            };
            let verdict = self
                .adapters
                .quality
                .can_deploy(&request)
                .await
                .context("Quality gate check failed")?;
            let analysis = self
                .adapters
                .quality
                .analyze_for_deployment(&request)
                .await
                .context("Quality analysis failed")?;

            deployment.quality_check_id = Some(analysis.check_id);
            deployment.quality_score = Some(analysis.score);
            deployment.quality_passed = Some(verdict.allowed && analysis.passed);
            deployment.quality_blockers = analysis.blockers;
            deployment.save(&self.db).await?;

            if !verdict.allowed {
                let reason = verdict
                    .reason
                    .unwrap_or_else(|| "Quality gate did not allow the deployment".to_string());
                if gate.block_on_failure && !deployment.force {
                    return Ok(Flow::GateFailed(reason));
                }
                if deployment.force {
                    tracing::warn!(deployment_id = %deployment.id, reason = %reason, "Quality gate bypassed by force");
                } else {
                    tracing::warn!(deployment_id = %deployment.id, reason = %reason, "Quality gate failed (non-blocking)");
                }
            }
        }

        self.advance(deployment, DeploymentStatus::InProgress).await?;

        let artifact = self
            .artifacts
            .resolve(config, &deployment.version, deployment.dry_run)
            .await?;
        deployment.artifact = Some(artifact.clone());
        deployment.save(&self.db).await?;

        if self.cancel_requested(&deployment.id) {
            return Ok(Flow::Cancelled);
        }

        let plan = RolloutPlan {
            application: deployment.application.clone(),
            release: deployment.release_label(),
            image: artifact,
            strategy: config.strategy.clone(),
            target: config.target.clone(),
            service: config.service_name().to_string(),
        };
        let outcome = if deployment.dry_run {
            tracing::info!(deployment_id = %deployment.id, strategy = plan.strategy.kind(), "Dry run, skipping rollout");
            None
        } else {
            Some(self.strategies.execute(&plan).await?)
        };

        if self.cancel_requested(&deployment.id) {
            tracing::info!(deployment_id = %deployment.id, "Cancelled after rollout, skipping verification");
            return Ok(Flow::Cancelled);
        }

        self.advance(deployment, DeploymentStatus::Verifying).await?;

        if let (Some(outcome), Some(check)) = (&outcome, &config.health_check) {
            let target = HealthTarget {
                namespace: config.target.namespace.clone(),
                service: config.service_name().to_string(),
                port: config.target.port,
                pod_selector: outcome.pod_selector.clone(),
            };
            health::verify(self.adapters.cluster.as_ref(), check, &target).await?;
        }

        if !deployment.dry_run {
            self.collect_metrics(config, deployment).await;
        }

        Ok(Flow::Verified)
    }

    async fn collect_metrics(&self, config: &DeploymentConfig, deployment: &mut Deployment) {
        let query = MetricsQuery {
            namespace: config.target.namespace.clone(),
            application: deployment.application.clone(),
            release: None,
        };
        match self.adapters.metrics.get_application_metrics(&query).await {
            Ok(metrics) => deployment.metrics = Some(metrics),
            Err(e) => tracing::debug!(deployment_id = %deployment.id, error = %e, "Metrics not collected"),
        }
    }

    async fn arm_monitoring(&self, config: &DeploymentConfig, deployment: &Deployment) {
        // Rollbacks are not monitored, which keeps rollback chains finite
        if deployment.is_rollback {
            return;
        }
        let Some(gate) = config.quality_gate.as_ref().filter(|g| g.enabled) else {
            return;
        };
        if let Err(e) = quality_monitor::arm(
            self.adapters.quality.as_ref(),
            &self.queue,
            deployment,
            gate,
            self.settings.quality_monitor_delay(),
        )
        .await
        {
            tracing::warn!(deployment_id = %deployment.id, error = %e, "Failed to arm quality monitoring");
        }
    }

    /// Delayed post-deploy check; rolls back on degradation
    async fn monitor_quality(&self, id: &str) -> EngineResult<()> {
        let deployment = self.get_deployment(id).await?;
        if deployment.status != DeploymentStatus::Completed || deployment.rollback_id.is_some() {
            tracing::debug!(deployment_id = %id, status = %deployment.status, "Skipping quality monitor");
            return Ok(());
        }
        let config = self.get_config(&deployment.config_id).await?;
        let Some(gate) = config.quality_gate.as_ref() else {
            return Ok(());
        };

        match quality_monitor::check(self.adapters.quality.as_ref(), &deployment, gate).await? {
            Some(reason) => {
                tracing::warn!(deployment_id = %id, reason = %reason, "Post-deploy quality degraded");
                self.rollback_with(id, &reason, "quality_monitor").await?;
            }
            None => tracing::info!(deployment_id = %id, "Post-deploy quality check passed"),
        }
        Ok(())
    }

    async fn report_to_source(&self, config: &DeploymentConfig, deployment: &Deployment, state: &str) {
        if deployment.dry_run {
            return;
        }
        if let SourceDescriptor::Repository { owner, repo, git_ref, .. } = &config.source {
            let description = format!("{} {}", deployment.version, deployment.status);
            if let Err(e) = self
                .adapters
                .source
                .create_deployment_status(owner, repo, git_ref, deployment.environment, state, &description)
                .await
            {
                tracing::warn!(deployment_id = %deployment.id, error = %e, "Failed to report deployment status");
            }
        }
    }

    async fn prune_history(&self, config: &DeploymentConfig, deployment: &Deployment) {
        let keep = config.rollback.as_ref().map(|r| r.max_history).unwrap_or(10).max(1);
        match Deployment::archive_beyond(&self.db, &deployment.application, deployment.environment, keep).await {
            Ok(0) => {}
            Ok(archived) => tracing::debug!(application = %deployment.application, archived, "Archived old deployments"),
            Err(e) => tracing::warn!(error = %e, "Failed to prune deployment history"),
        }
    }
}

fn set_status(deployment: &mut Deployment, next: DeploymentStatus) -> EngineResult<()> {
    if !deployment.status.can_transition_to(next) {
        return Err(EngineError::InvalidTransition {
            from: deployment.status,
            to: next,
        });
    }
    deployment.status = next;
    Ok(())
}

fn finish(deployment: &mut Deployment) {
    let finished_at = now_rfc3339();
    deployment.duration_ms = duration_ms(&deployment.started_at, &finished_at);
    deployment.finished_at = Some(finished_at);
}

fn record_outcome(deployment: &Deployment) {
    metrics::counter!(crate::api::metrics::DEPLOYMENTS_TOTAL, "status" => deployment.status.as_str()).increment(1);
    if let Some(ms) = deployment.duration_ms {
        metrics::histogram!(crate::api::metrics::DEPLOYMENT_DURATION_SECONDS).record(ms as f64 / 1000.0);
    }
}

#[async_trait]
impl JobProcessor for DeploymentOrchestrator {
    async fn process(&self, job: &Job) -> anyhow::Result<()> {
        let payload: DeploymentJob =
            serde_json::from_str(&job.payload).context("Invalid deployment job payload")?;
        match job.queue.as_str() {
            QUALITY_MONITOR_QUEUE => self.monitor_quality(&payload.deployment_id).await?,
            _ => self.run(&payload.deployment_id).await?,
        }
        Ok(())
    }
}
