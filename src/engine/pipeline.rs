//! Pipeline engine.
//!
//! Runs the stages of a pipeline in declared order. A stage is skipped when a
//! dependency did not succeed or its condition is false; otherwise its quality
//! gate (if any) is consulted and its steps run, in parallel or one after the
//! other. The first hard stage failure ends the run and every stage not yet
//! reached is closed as skipped.

use anyhow::Context;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::condition::{self, ConditionContext};
use super::retry::{retry_with_backoff, RetryPolicy};
use super::steps::{StepContext, StepOutcome, StepRunner};
use super::strategy::StrategyExecutor;
use super::{EngineError, EngineResult};
use crate::adapters::{Adapters, QualityEvaluator, QualityRequest};
use crate::config::PipelineSettings;
use crate::db::{
    now_rfc3339, DbPool, ExecutionStatus, Job, NotificationEventType, PipelineConfig, PipelineExecution,
    RunStatus, Stage, StageType, Step,
};
use crate::notifications::{NotificationPayload, Notifier};
use crate::queue::{JobOptions, JobProcessor, JobQueue, PIPELINES_QUEUE};

/// Payload of jobs on the pipelines queue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineJob {
    pub execution_id: String,
}

/// Why the stage loop stopped
enum Halt {
    Finished,
    Failed(String),
    Cancelled,
}

/// Result of one step, applied to the execution record after it ran
struct StepReport {
    started_at: String,
    finished_at: String,
    retry_count: u32,
    outcome: Option<StepOutcome>,
    error: Option<String>,
}

/// Problems that make a pipeline definition unusable
pub fn validate(config: &PipelineConfig) -> Vec<String> {
    let mut problems = Vec::new();

    if config.name.trim().is_empty() {
        problems.push("name must not be empty".to_string());
    }
    if config.stages.is_empty() {
        problems.push("a pipeline needs at least one stage".to_string());
    }
    if config.timeout_ms == Some(0) {
        problems.push("timeout_ms must be positive".to_string());
    }

    let mut earlier: HashSet<&str> = HashSet::new();
    for stage in &config.stages {
        if stage.name.trim().is_empty() {
            problems.push("stage names must not be empty".to_string());
        }
        for dependency in &stage.depends_on {
            if !earlier.contains(dependency.as_str()) {
                problems.push(format!(
                    "stage '{}' depends on '{}', which is not an earlier stage",
                    stage.name, dependency
                ));
            }
        }
        if let Some(expr) = &stage.condition {
            if let Err(e) = condition::parse(expr) {
                problems.push(format!("stage '{}' has an invalid condition: {}", stage.name, e));
            }
        }
        if stage.stage_type == StageType::QualityGate && stage.quality_gate.is_none() {
            problems.push(format!(
                "stage '{}' is a quality gate but has no quality_gate policy",
                stage.name
            ));
        }

        let mut step_names = HashSet::new();
        for step in &stage.steps {
            if !step_names.insert(step.name.as_str()) {
                problems.push(format!("stage '{}' has duplicate step '{}'", stage.name, step.name));
            }
        }

        if !earlier.insert(stage.name.as_str()) {
            problems.push(format!("duplicate stage name '{}'", stage.name));
        }
    }

    problems
}

pub struct PipelineEngine {
    db: DbPool,
    queue: JobQueue,
    notifier: Arc<dyn Notifier>,
    quality: Arc<dyn QualityEvaluator>,
    steps: StepRunner,
    settings: PipelineSettings,
    cancellations: DashMap<String, ()>,
}

impl PipelineEngine {
    pub fn new(
        db: DbPool,
        adapters: Adapters,
        strategies: Arc<StrategyExecutor>,
        queue: JobQueue,
        notifier: Arc<dyn Notifier>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            db,
            queue,
            notifier,
            quality: adapters.quality.clone(),
            steps: StepRunner::new(adapters, strategies, settings.clone()),
            settings,
            cancellations: DashMap::new(),
        }
    }

    /// Fail runs interrupted by a previous process, then start the worker
    pub async fn start(self: &Arc<Self>) -> anyhow::Result<()> {
        let interrupted = PipelineExecution::list_running(&self.db).await?;
        for mut execution in interrupted {
            tracing::warn!(execution_id = %execution.id, "Marking interrupted pipeline run as failed");
            for stage in &mut execution.stages {
                stage.skip();
            }
            execution.status = ExecutionStatus::Failure;
            execution.error = Some("Interrupted by a restart".to_string());
            execution.finished_at = Some(now_rfc3339());
            execution.save(&self.db).await?;
        }

        self.queue
            .register_processor(PIPELINES_QUEUE, self.clone() as Arc<dyn JobProcessor>)
            .await
    }

    pub async fn create(&self, mut config: PipelineConfig) -> EngineResult<String> {
        let problems = validate(&config);
        if !problems.is_empty() {
            return Err(EngineError::InvalidConfig(problems));
        }

        config.id = uuid::Uuid::new_v4().to_string();
        config.created_at = now_rfc3339();
        config.insert(&self.db).await?;

        tracing::info!(pipeline_id = %config.id, name = %config.name, stages = config.stages.len(), "Pipeline created");
        Ok(config.id)
    }

    pub async fn get_config(&self, id: &str) -> EngineResult<PipelineConfig> {
        PipelineConfig::get_by_id(&self.db, id)
            .await?
            .ok_or_else(|| EngineError::not_found("Pipeline", id))
    }

    pub async fn list_configs(&self) -> EngineResult<Vec<PipelineConfig>> {
        Ok(PipelineConfig::list(&self.db).await?)
    }

    /// Snapshot a run and queue it. Returns the execution id immediately.
    pub async fn execute(
        &self,
        pipeline_id: &str,
        triggered_by: &str,
        env_overrides: BTreeMap<String, String>,
    ) -> EngineResult<String> {
        let config = self.get_config(pipeline_id).await?;
        let execution = PipelineExecution::new(
            uuid::Uuid::new_v4().to_string(),
            &config,
            triggered_by.to_string(),
            env_overrides,
        );
        execution.save(&self.db).await?;

        let job = PipelineJob {
            execution_id: execution.id.clone(),
        };
        self.queue
            .add_job(PIPELINES_QUEUE, &job, JobOptions::single_attempt())
            .await?;

        tracing::info!(
            execution_id = %execution.id,
            pipeline = %config.name,
            triggered_by = %triggered_by,
            "Pipeline run queued"
        );
        Ok(execution.id)
    }

    pub async fn get_execution(&self, id: &str) -> EngineResult<PipelineExecution> {
        PipelineExecution::get_by_id(&self.db, id)
            .await?
            .ok_or_else(|| EngineError::not_found("Execution", id))
    }

    pub async fn list_executions(&self, pipeline_id: Option<&str>, limit: u32) -> EngineResult<Vec<PipelineExecution>> {
        Ok(PipelineExecution::list(&self.db, pipeline_id, limit).await?)
    }

    /// Request cancellation; a running execution stops before its next stage
    pub async fn cancel(&self, id: &str) -> EngineResult<PipelineExecution> {
        let mut execution = self.get_execution(id).await?;
        if execution.status.is_terminal() {
            return Err(EngineError::NotCancellable {
                kind: "Execution",
                id: id.to_string(),
                state: execution.status.to_string(),
            });
        }

        self.cancellations.insert(id.to_string(), ());
        if execution.status == ExecutionStatus::Pending {
            let config = self.get_config(&execution.pipeline_id).await?;
            let mut closing = execution.clone();
            if self.close(&config, &mut closing, Halt::Cancelled).await? {
                return Ok(closing);
            }
            // Picked up meanwhile; the worker stops at its next checkpoint
            execution = self.get_execution(id).await?;
            if execution.status.is_terminal() {
                self.cancellations.remove(id);
            }
        }
        tracing::info!(execution_id = %id, status = %execution.status, "Pipeline cancellation requested");
        Ok(execution)
    }

    async fn notify(
        &self,
        config: &PipelineConfig,
        execution: &PipelineExecution,
        event: NotificationEventType,
        status: &str,
        message: String,
        error: Option<String>,
    ) {
        let payload = NotificationPayload::pipeline_event(event, &execution.id, &config.name, status, message, error);
        self.notifier.notify(&config.notifications, &payload).await;
    }

    async fn run(&self, id: &str) -> EngineResult<()> {
        let outcome = self.claim_and_run(id).await;
        self.cancellations.remove(id);
        outcome
    }

    async fn claim_and_run(&self, id: &str) -> EngineResult<()> {
        let mut execution = self.get_execution(id).await?;
        if execution.status != ExecutionStatus::Pending {
            tracing::debug!(execution_id = %id, status = %execution.status, "Pipeline run already picked up");
            return Ok(());
        }
        let config = self.get_config(&execution.pipeline_id).await?;

        execution.status = ExecutionStatus::Running;
        if !execution.save_if_status(&self.db, ExecutionStatus::Pending).await? {
            tracing::debug!(execution_id = %id, "Pipeline run closed before pickup");
            return Ok(());
        }
        tracing::info!(execution_id = %id, pipeline = %config.name, "Pipeline run started");

        let halt = match self.drive(&config, &mut execution).await {
            Ok(halt) => halt,
            Err(e) => Halt::Failed(e.to_string()),
        };
        self.close(&config, &mut execution, halt).await?;
        Ok(())
    }

    /// Store the final state. Returns false when the stored run had already left
    /// the status this copy was read with.
    async fn close(&self, config: &PipelineConfig, execution: &mut PipelineExecution, halt: Halt) -> EngineResult<bool> {
        let expected = execution.status;
        for stage in &mut execution.stages {
            stage.skip();
        }

        let (status, event) = match &halt {
            Halt::Finished => (ExecutionStatus::Success, NotificationEventType::PipelineSuccess),
            Halt::Failed(_) => (ExecutionStatus::Failure, NotificationEventType::PipelineFailure),
            Halt::Cancelled => (ExecutionStatus::Cancelled, NotificationEventType::PipelineCancelled),
        };
        execution.status = status;
        execution.error = match halt {
            Halt::Failed(reason) => Some(reason),
            Halt::Cancelled => Some("Cancelled by request".to_string()),
            Halt::Finished => None,
        };
        execution.finished_at = Some(now_rfc3339());
        if !execution.save_if_status(&self.db, expected).await? {
            return Ok(false);
        }

        metrics::counter!(crate::api::metrics::PIPELINE_RUNS_TOTAL, "status" => status.as_str()).increment(1);
        match &execution.error {
            Some(error) if status == ExecutionStatus::Failure => {
                tracing::error!(execution_id = %execution.id, error = %error, "Pipeline run failed")
            }
            _ => tracing::info!(execution_id = %execution.id, status = %status, "Pipeline run finished"),
        }

        self.notify(
            config,
            execution,
            event,
            status.as_str(),
            format!("Pipeline {} finished with {}", config.name, status),
            execution.error.clone(),
        )
        .await;
        Ok(true)
    }

    fn condition_context(execution: &PipelineExecution) -> ConditionContext {
        let mut fields = BTreeMap::new();
        fields.insert("id".to_string(), execution.id.clone());
        fields.insert("pipeline_id".to_string(), execution.pipeline_id.clone());
        fields.insert("triggered_by".to_string(), execution.triggered_by.clone());
        ConditionContext {
            env: execution.env.clone(),
            execution: fields,
        }
    }

    async fn drive(&self, config: &PipelineConfig, execution: &mut PipelineExecution) -> EngineResult<Halt> {
        let started = Instant::now();
        let budget = config.timeout_ms.map(Duration::from_millis);
        let conditions = Self::condition_context(execution);

        for (index, stage) in config.stages.iter().enumerate() {
            if self.cancellations.contains_key(&execution.id) {
                return Ok(Halt::Cancelled);
            }
            if let Some(budget) = budget {
                if started.elapsed() >= budget {
                    return Ok(Halt::Failed(format!(
                        "Pipeline exceeded its timeout of {}ms before stage '{}'",
                        budget.as_millis(),
                        stage.name
                    )));
                }
            }

            let unmet = stage
                .depends_on
                .iter()
                .find(|dep| execution.stage_status(dep) != Some(RunStatus::Success));
            if let Some(dependency) = unmet {
                tracing::info!(stage = %stage.name, dependency = %dependency, "Dependency did not succeed, skipping stage");
                execution.stages[index].skip();
                execution.save(&self.db).await?;
                continue;
            }

            if let Some(expr) = &stage.condition {
                match condition::evaluate(expr, &conditions) {
                    Ok(true) => {}
                    Ok(false) => {
                        tracing::info!(stage = %stage.name, condition = %expr, "Condition is false, skipping stage");
                        execution.stages[index].skip();
                        execution.save(&self.db).await?;
                        continue;
                    }
                    Err(e) => {
                        let reason = format!("Condition of stage '{}' could not be evaluated: {}", stage.name, e);
                        let record = &mut execution.stages[index];
                        record.status = RunStatus::Failure;
                        record.error = Some(reason.clone());
                        record.finished_at = Some(now_rfc3339());
                        record.skip();
                        execution.save(&self.db).await?;
                        return Ok(Halt::Failed(reason));
                    }
                }
            }

            {
                let record = &mut execution.stages[index];
                record.status = RunStatus::Running;
                record.started_at = Some(now_rfc3339());
            }
            execution.save(&self.db).await?;

            let failure = self.run_stage(config, stage, index, execution).await?;

            let record = &mut execution.stages[index];
            record.status = if failure.is_some() {
                RunStatus::Failure
            } else {
                RunStatus::Success
            };
            record.error = failure.clone();
            record.finished_at = Some(now_rfc3339());
            record.skip();
            let stage_status = record.status;
            execution.save(&self.db).await?;

            self.notify(
                config,
                execution,
                NotificationEventType::StageComplete,
                stage_status.as_str(),
                format!("Stage {} finished with {}", stage.name, stage_status.as_str()),
                failure.clone(),
            )
            .await;

            if let Some(reason) = failure {
                return Ok(Halt::Failed(format!("Stage '{}' failed: {}", stage.name, reason)));
            }
        }

        // A request that arrived during the last stage still counts
        if self.cancellations.contains_key(&execution.id) {
            return Ok(Halt::Cancelled);
        }
        Ok(Halt::Finished)
    }

    /// Run one stage. Returns the failure reason when the stage failed.
    async fn run_stage(
        &self,
        config: &PipelineConfig,
        stage: &Stage,
        index: usize,
        execution: &mut PipelineExecution,
    ) -> EngineResult<Option<String>> {
        if stage.gates_on_quality() {
            if let Some(reason) = self.check_quality_gate(stage, execution).await {
                return Ok(Some(reason));
            }
        }

        let env = execution.env.clone();
        let execution_id = execution.id.clone();
        let ctx = StepContext {
            execution_id: &execution_id,
            env: &env,
        };
        let retries_for = |step: &Step| step.retry_count.unwrap_or(config.retry.retry_count);

        if stage.parallel {
            for step in &mut execution.stages[index].steps {
                step.status = RunStatus::Running;
                step.started_at = Some(now_rfc3339());
            }
            execution.save(&self.db).await?;

            let reports = futures::future::join_all(
                stage
                    .steps
                    .iter()
                    .map(|step| self.run_step(step, &ctx, retries_for(step))),
            )
            .await;

            let mut failure = None;
            for (position, (step, report)) in stage.steps.iter().zip(reports).enumerate() {
                if let Some(error) = apply_report(execution, index, position, report) {
                    if !step.continue_on_error && failure.is_none() {
                        failure = Some(format!("step '{}' failed: {}", step.name, error));
                    }
                }
            }
            return Ok(failure);
        }

        for (position, step) in stage.steps.iter().enumerate() {
            {
                let record = &mut execution.stages[index].steps[position];
                record.status = RunStatus::Running;
                record.started_at = Some(now_rfc3339());
            }
            execution.save(&self.db).await?;

            let report = self.run_step(step, &ctx, retries_for(step)).await;
            let error = apply_report(execution, index, position, report);
            execution.save(&self.db).await?;

            if let Some(error) = error {
                if step.continue_on_error {
                    tracing::warn!(step = %step.name, error = %error, "Step failed, continuing");
                } else {
                    return Ok(Some(format!("step '{}' failed: {}", step.name, error)));
                }
            }
        }

        Ok(None)
    }

    /// Ask the evaluator whether the stage may proceed. Returns the blocking reason.
    async fn check_quality_gate(&self, stage: &Stage, execution: &mut PipelineExecution) -> Option<String> {
        let Some(gate) = stage.quality_gate.as_ref() else {
            return Some("Quality gate stage has no quality_gate policy".to_string());
        };

        let request = QualityRequest {
            project_id: gate.project_id.clone(),
            path: gate.path.clone(),
            environment: None,
            min_score: gate.min_score,
        };
        let verdict = match self.quality.can_deploy(&request).await {
            Ok(verdict) => verdict,
            Err(e) => return Some(format!("Quality gate check failed: {:#}", e)),
        };

        execution.quality_score = verdict.score.or(execution.quality_score);
        execution.quality_passed = Some(verdict.allowed);
        if verdict.allowed {
            return None;
        }

        let reason = verdict
            .reason
            .unwrap_or_else(|| "Quality gate did not allow the run".to_string());
        if gate.block_on_failure {
            Some(reason)
        } else {
            tracing::warn!(stage = %stage.name, reason = %reason, "Quality gate failed (non-blocking)");
            None
        }
    }

    async fn run_step(&self, step: &Step, ctx: &StepContext<'_>, retries: u32) -> StepReport {
        let started_at = now_rfc3339();
        let policy = RetryPolicy {
            retries,
            base: self.settings.backoff_base(),
            cap: self.settings.backoff_cap(),
        };
        let runner = &self.steps;
        let kind = &step.kind;

        tracing::debug!(step = %step.name, kind = kind.name(), "Running step");
        let retried = retry_with_backoff(policy, move |_attempt| runner.run(kind, ctx)).await;

        let mut report = StepReport {
            started_at,
            finished_at: now_rfc3339(),
            retry_count: retried.retries_used,
            outcome: None,
            error: None,
        };
        match retried.result {
            Ok(outcome) => {
                report.error = outcome.blocked.clone();
                report.outcome = Some(outcome);
            }
            Err(e) => report.error = Some(format!("{:#}", e)),
        }
        report
    }
}

/// Record a step report on the execution. Returns the step's error, if any.
fn apply_report(
    execution: &mut PipelineExecution,
    stage: usize,
    position: usize,
    report: StepReport,
) -> Option<String> {
    if let Some(outcome) = &report.outcome {
        if let Some(artifact) = &outcome.artifact {
            execution.artifacts.push(artifact.clone());
        }
        if let Some(quality) = &outcome.quality {
            execution.quality_check_id = Some(quality.check_id.clone());
            execution.quality_score = Some(quality.score);
            execution.quality_passed = Some(quality.passed);
        }
    }

    let record = &mut execution.stages[stage].steps[position];
    record.started_at = Some(report.started_at);
    record.finished_at = Some(report.finished_at);
    record.retry_count = report.retry_count;
    record.output = report.outcome.and_then(|o| o.output);
    record.status = if report.error.is_some() {
        RunStatus::Failure
    } else {
        RunStatus::Success
    };
    record.error = report.error.clone();
    report.error
}

#[async_trait]
impl JobProcessor for PipelineEngine {
    async fn process(&self, job: &Job) -> anyhow::Result<()> {
        let payload: PipelineJob =
            serde_json::from_str(&job.payload).context("Invalid pipeline job payload")?;
        self.run(&payload.execution_id).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::fake::FakeAdapters;
    use crate::config::QueueSettings;
    use crate::notifications::RecordingNotifier;

    struct Harness {
        engine: Arc<PipelineEngine>,
        fakes: FakeAdapters,
        notifier: Arc<RecordingNotifier>,
    }

    async fn harness_with(start: bool) -> Harness {
        let db = crate::db::init_memory().await.unwrap();
        let queue = JobQueue::new(
            db.clone(),
            &QueueSettings {
                max_attempts: 1,
                backoff_base_ms: 1,
                backoff_cap_ms: 5,
            },
        );
        let fakes = FakeAdapters::default();
        let adapters = fakes.adapters();
        let strategies = Arc::new(StrategyExecutor::new(
            adapters.cluster.clone(),
            adapters.metrics.clone(),
            Duration::from_secs(1),
        ));
        let notifier = Arc::new(RecordingNotifier::default());
        let settings = PipelineSettings {
            backoff_base_ms: 1,
            backoff_cap_ms: 4,
            ..Default::default()
        };
        let engine = Arc::new(PipelineEngine::new(
            db,
            adapters,
            strategies,
            queue,
            notifier.clone(),
            settings,
        ));
        if start {
            engine.start().await.unwrap();
        }
        Harness {
            engine,
            fakes,
            notifier,
        }
    }

    async fn harness() -> Harness {
        harness_with(true).await
    }

    fn pipeline(stages: serde_json::Value) -> PipelineConfig {
        serde_json::from_value(serde_json::json!({"name": "ci", "stages": stages})).unwrap()
    }

    fn script(name: &str, script: &str) -> serde_json::Value {
        serde_json::json!({"name": name, "type": "script", "script": script})
    }

    async fn wait_finished(engine: &PipelineEngine, id: &str) -> PipelineExecution {
        for _ in 0..1000 {
            let execution = engine.get_execution(id).await.unwrap();
            if execution.status.is_terminal() {
                return execution;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("execution {} never finished", id);
    }

    async fn run_pipeline(h: &Harness, config: PipelineConfig, env: &[(&str, &str)]) -> PipelineExecution {
        let id = h.engine.create(config).await.unwrap();
        let overrides = env.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        let execution_id = h.engine.execute(&id, "tester", overrides).await.unwrap();
        wait_finished(&h.engine, &execution_id).await
    }

    fn stage_status(execution: &PipelineExecution, name: &str) -> RunStatus {
        execution.stage_status(name).unwrap()
    }

    #[test]
    fn test_validate_reports_every_problem() {
        let config = pipeline(serde_json::json!([
            {"name": "build", "dependsOn": ["deploy"]},
            {"name": "build", "condition": "env.A == "},
            {"name": "deploy", "type": "quality-gate"}
        ]));
        let problems = validate(&config);
        assert_eq!(problems.len(), 4, "{:?}", problems);
        assert!(problems.iter().any(|p| p.contains("not an earlier stage")));
        assert!(problems.iter().any(|p| p.contains("duplicate stage name")));
        assert!(problems.iter().any(|p| p.contains("invalid condition")));
        assert!(problems.iter().any(|p| p.contains("no quality_gate policy")));

        assert!(!validate(&pipeline(serde_json::json!([]))).is_empty());
    }

    #[tokio::test]
    async fn test_create_rejects_invalid_pipeline() {
        let h = harness_with(false).await;
        let err = h.engine.create(pipeline(serde_json::json!([]))).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn test_unmet_dependency_skips_stage() {
        let h = harness().await;
        let config = pipeline(serde_json::json!([
            {"name": "build", "condition": "env.BUILD == 'yes'", "steps": [script("compile", "true")]},
            {"name": "package", "dependsOn": ["build"], "steps": [script("zip", "true")]},
            {"name": "report", "steps": [script("echo", "echo done")]}
        ]));
        let execution = run_pipeline(&h, config, &[]).await;

        assert_eq!(execution.status, ExecutionStatus::Success);
        assert_eq!(stage_status(&execution, "build"), RunStatus::Skipped);
        assert_eq!(stage_status(&execution, "package"), RunStatus::Skipped);
        assert_eq!(stage_status(&execution, "report"), RunStatus::Success);
        assert_eq!(execution.stages[2].steps[0].output.as_deref(), Some("done"));
    }

    #[tokio::test]
    async fn test_condition_sees_env_overrides_and_execution_fields() {
        let h = harness().await;
        let config = pipeline(serde_json::json!([
            {"name": "deploy", "condition": "env.BRANCH == 'main' && execution.triggered_by == 'tester'",
             "steps": [script("ship", "echo $BRANCH")]}
        ]));
        let execution = run_pipeline(&h, config, &[("BRANCH", "main")]).await;
        assert_eq!(stage_status(&execution, "deploy"), RunStatus::Success);
        assert_eq!(execution.stages[0].steps[0].output.as_deref(), Some("main"));
    }

    #[tokio::test]
    async fn test_condition_error_fails_run() {
        let h = harness().await;
        let config = pipeline(serde_json::json!([
            {"name": "deploy", "condition": "secrets.TOKEN == 'x'", "steps": [script("ship", "true")]},
            {"name": "after", "steps": [script("noop", "true")]}
        ]));
        let execution = run_pipeline(&h, config, &[]).await;
        assert_eq!(execution.status, ExecutionStatus::Failure);
        assert_eq!(stage_status(&execution, "deploy"), RunStatus::Failure);
        assert_eq!(execution.stages[0].steps[0].status, RunStatus::Skipped);
        assert_eq!(stage_status(&execution, "after"), RunStatus::Skipped);
    }

    #[tokio::test]
    async fn test_sequential_failure_stops_stage_and_run() {
        let h = harness().await;
        let config = pipeline(serde_json::json!([
            {"name": "test", "steps": [
                script("unit", "true"),
                script("lint", "echo bad style >&2; exit 2"),
                script("e2e", "true")
            ]},
            {"name": "deploy", "steps": [script("ship", "true")]}
        ]));
        let execution = run_pipeline(&h, config, &[]).await;

        assert_eq!(execution.status, ExecutionStatus::Failure);
        let steps = &execution.stages[0].steps;
        assert_eq!(steps[0].status, RunStatus::Success);
        assert_eq!(steps[1].status, RunStatus::Failure);
        assert!(steps[1].error.as_deref().unwrap().contains("bad style"));
        assert_eq!(steps[2].status, RunStatus::Skipped);
        assert_eq!(stage_status(&execution, "deploy"), RunStatus::Skipped);
        assert!(execution.error.as_deref().unwrap().contains("Stage 'test' failed"));
    }

    #[tokio::test]
    async fn test_continue_on_error_keeps_stage_green() {
        let h = harness().await;
        let config = pipeline(serde_json::json!([
            {"name": "test", "steps": [
                {"name": "flaky", "type": "script", "script": "exit 1", "continueOnError": true},
                script("unit", "true")
            ]}
        ]));
        let execution = run_pipeline(&h, config, &[]).await;
        assert_eq!(execution.status, ExecutionStatus::Success);
        assert_eq!(execution.stages[0].steps[0].status, RunStatus::Failure);
        assert_eq!(execution.stages[0].steps[1].status, RunStatus::Success);
    }

    #[tokio::test]
    async fn test_parallel_steps_run_concurrently() {
        let h = harness().await;
        let config = pipeline(serde_json::json!([
            {"name": "checks", "parallel": true, "steps": [
                script("a", "sleep 1"),
                script("b", "sleep 1"),
                script("c", "sleep 1")
            ]}
        ]));
        let started = Instant::now();
        let execution = run_pipeline(&h, config, &[]).await;
        assert_eq!(execution.status, ExecutionStatus::Success);
        assert!(execution.stages[0].steps.iter().all(|s| s.status == RunStatus::Success));
        assert!(started.elapsed() < Duration::from_millis(2500));
    }

    #[tokio::test]
    async fn test_parallel_failure_fails_stage_after_all_steps() {
        let h = harness().await;
        let config = pipeline(serde_json::json!([
            {"name": "checks", "parallel": true, "steps": [
                script("ok", "true"),
                script("broken", "exit 1")
            ]}
        ]));
        let execution = run_pipeline(&h, config, &[]).await;
        assert_eq!(execution.status, ExecutionStatus::Failure);
        assert_eq!(execution.stages[0].steps[0].status, RunStatus::Success);
        assert_eq!(execution.stages[0].steps[1].status, RunStatus::Failure);
    }

    #[tokio::test]
    async fn test_step_retried_until_success() {
        let h = harness().await;
        let dir = tempfile::tempdir().unwrap();
        let config = pipeline(serde_json::json!([
            {"name": "build", "steps": [{
                "name": "fetch", "type": "script", "retryCount": 3,
                "working_dir": dir.path().to_str().unwrap(),
                "script": "n=$(cat count 2>/dev/null || echo 0); n=$((n+1)); echo $n > count; [ $n -ge 3 ]"
            }]}
        ]));
        let execution = run_pipeline(&h, config, &[]).await;
        assert_eq!(execution.status, ExecutionStatus::Success);
        assert_eq!(execution.stages[0].steps[0].retry_count, 2);
    }

    #[tokio::test]
    async fn test_exhausted_retries_keep_last_error() {
        let h = harness().await;
        let mut config = pipeline(serde_json::json!([
            {"name": "build", "steps": [script("fetch", "exit 7")]}
        ]));
        config.retry.retry_count = 2;
        let execution = run_pipeline(&h, config, &[]).await;
        let step = &execution.stages[0].steps[0];
        assert_eq!(step.status, RunStatus::Failure);
        assert_eq!(step.retry_count, 2);
        assert!(step.error.as_deref().unwrap().contains("code 7"));
    }

    #[tokio::test]
    async fn test_blocking_quality_gate_fails_stage() {
        let h = harness().await;
        h.fakes.quality.deny("score 42 below 70");
        let config = pipeline(serde_json::json!([
            {"name": "gate", "type": "quality-gate", "quality_gate": {"project_id": "proj"},
             "steps": [script("never", "true")]},
            {"name": "deploy", "steps": [script("ship", "true")]}
        ]));
        let execution = run_pipeline(&h, config, &[]).await;
        assert_eq!(execution.status, ExecutionStatus::Failure);
        assert_eq!(stage_status(&execution, "gate"), RunStatus::Failure);
        assert_eq!(execution.stages[0].error.as_deref(), Some("score 42 below 70"));
        assert_eq!(execution.stages[0].steps[0].status, RunStatus::Skipped);
        assert_eq!(execution.quality_passed, Some(false));
        assert_eq!(stage_status(&execution, "deploy"), RunStatus::Skipped);
    }

    #[tokio::test]
    async fn test_non_blocking_quality_gate_lets_steps_run() {
        let h = harness().await;
        h.fakes.quality.deny("score 42 below 70");
        let config = pipeline(serde_json::json!([
            {"name": "gate", "quality_gate": {"project_id": "proj", "block_on_failure": false},
             "steps": [script("report", "true")]}
        ]));
        let execution = run_pipeline(&h, config, &[]).await;
        assert_eq!(execution.status, ExecutionStatus::Success);
        assert_eq!(execution.quality_score, Some(42.0));
    }

    #[tokio::test]
    async fn test_build_artifact_recorded() {
        let h = harness().await;
        let config = pipeline(serde_json::json!([
            {"name": "build", "steps": [{"name": "image", "type": "docker-build", "image": "registry.test/api"}]}
        ]));
        let execution = run_pipeline(&h, config, &[("VERSION", "3.1.0")]).await;
        assert_eq!(execution.status, ExecutionStatus::Success);
        assert_eq!(execution.artifacts, vec!["registry.test/api:3.1.0".to_string()]);
    }

    #[tokio::test]
    async fn test_global_timeout_checked_between_stages() {
        let h = harness().await;
        let mut config = pipeline(serde_json::json!([
            {"name": "slow", "steps": [script("wait", "sleep 0.3")]},
            {"name": "next", "steps": [script("noop", "true")]}
        ]));
        config.timeout_ms = Some(100);
        let execution = run_pipeline(&h, config, &[]).await;
        assert_eq!(execution.status, ExecutionStatus::Failure);
        assert_eq!(stage_status(&execution, "slow"), RunStatus::Success);
        assert_eq!(stage_status(&execution, "next"), RunStatus::Skipped);
        assert!(execution.error.as_deref().unwrap().contains("timeout"));
    }

    #[tokio::test]
    async fn test_cancel_pending_execution() {
        let h = harness_with(false).await;
        let id = h
            .engine
            .create(pipeline(serde_json::json!([{"name": "build", "steps": [script("a", "true")]}])))
            .await
            .unwrap();
        let execution_id = h.engine.execute(&id, "tester", BTreeMap::new()).await.unwrap();

        let cancelled = h.engine.cancel(&execution_id).await.unwrap();
        assert_eq!(cancelled.status, ExecutionStatus::Cancelled);
        assert_eq!(cancelled.stages[0].status, RunStatus::Skipped);
        assert!(h.notifier.events().contains(&NotificationEventType::PipelineCancelled));

        let err = h.engine.cancel(&execution_id).await.unwrap_err();
        assert!(matches!(err, EngineError::NotCancellable { .. }));
    }

    #[tokio::test]
    async fn test_cancel_running_execution_stops_before_next_stage() {
        let h = harness().await;
        let id = h
            .engine
            .create(pipeline(serde_json::json!([
                {"name": "first", "steps": [script("wait", "sleep 0.5")]},
                {"name": "second", "steps": [script("noop", "true")]}
            ])))
            .await
            .unwrap();
        let execution_id = h.engine.execute(&id, "tester", BTreeMap::new()).await.unwrap();

        for _ in 0..200 {
            if h.engine.get_execution(&execution_id).await.unwrap().status == ExecutionStatus::Running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        h.engine.cancel(&execution_id).await.unwrap();

        let execution = wait_finished(&h.engine, &execution_id).await;
        assert_eq!(execution.status, ExecutionStatus::Cancelled);
        assert_eq!(stage_status(&execution, "first"), RunStatus::Success);
        assert_eq!(stage_status(&execution, "second"), RunStatus::Skipped);
    }

    #[tokio::test]
    async fn test_cancel_during_last_stage_is_honored() {
        let h = harness().await;
        let id = h
            .engine
            .create(pipeline(serde_json::json!([
                {"name": "only", "steps": [script("wait", "sleep 0.5")]}
            ])))
            .await
            .unwrap();
        let execution_id = h.engine.execute(&id, "tester", BTreeMap::new()).await.unwrap();

        let mut status = ExecutionStatus::Pending;
        for _ in 0..200 {
            status = h.engine.get_execution(&execution_id).await.unwrap().status;
            if status == ExecutionStatus::Running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(status, ExecutionStatus::Running);
        let requested = h.engine.cancel(&execution_id).await.unwrap();
        assert_eq!(requested.status, ExecutionStatus::Running);

        let execution = wait_finished(&h.engine, &execution_id).await;
        assert_eq!(execution.status, ExecutionStatus::Cancelled);
        assert_eq!(execution.error.as_deref(), Some("Cancelled by request"));
        assert!(!h.notifier.events().contains(&NotificationEventType::PipelineSuccess));
    }

    #[tokio::test]
    async fn test_worker_skips_run_cancelled_while_pending() {
        let h = harness_with(false).await;
        let id = h
            .engine
            .create(pipeline(serde_json::json!([{"name": "build", "steps": [script("a", "true")]}])))
            .await
            .unwrap();
        let execution_id = h.engine.execute(&id, "tester", BTreeMap::new()).await.unwrap();
        h.engine.cancel(&execution_id).await.unwrap();

        h.engine.run(&execution_id).await.unwrap();

        let execution = h.engine.get_execution(&execution_id).await.unwrap();
        assert_eq!(execution.status, ExecutionStatus::Cancelled);
        assert_eq!(execution.stages[0].status, RunStatus::Skipped);
        assert!(!h.engine.cancellations.contains_key(&execution_id));
    }

    #[tokio::test]
    async fn test_cancel_after_pickup_does_not_overwrite_running_record() {
        let h = harness_with(false).await;
        let id = h
            .engine
            .create(pipeline(serde_json::json!([{"name": "build", "steps": [script("a", "true")]}])))
            .await
            .unwrap();
        let execution_id = h.engine.execute(&id, "tester", BTreeMap::new()).await.unwrap();

        // The worker claims the run just before the cancel lands
        let mut claimed = h.engine.get_execution(&execution_id).await.unwrap();
        claimed.status = ExecutionStatus::Running;
        assert!(claimed
            .save_if_status(&h.engine.db, ExecutionStatus::Pending)
            .await
            .unwrap());

        let requested = h.engine.cancel(&execution_id).await.unwrap();
        assert_eq!(requested.status, ExecutionStatus::Running);
        assert!(h.engine.cancellations.contains_key(&execution_id));
        assert!(!h.notifier.events().contains(&NotificationEventType::PipelineCancelled));

        let config = h.engine.get_config(&id).await.unwrap();
        let halt = h.engine.drive(&config, &mut claimed).await.unwrap();
        assert!(matches!(halt, Halt::Cancelled));
        assert_eq!(claimed.stages[0].status, RunStatus::Pending);
    }

    #[tokio::test]
    async fn test_stage_and_run_notifications() {
        let h = harness().await;
        let config = pipeline(serde_json::json!([
            {"name": "a", "steps": [script("x", "true")]},
            {"name": "b", "steps": [script("y", "true")]}
        ]));
        run_pipeline(&h, config, &[]).await;

        let mut events = Vec::new();
        for _ in 0..200 {
            events = h.notifier.events();
            if events.contains(&NotificationEventType::PipelineSuccess) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(
            events,
            vec![
                NotificationEventType::StageComplete,
                NotificationEventType::StageComplete,
                NotificationEventType::PipelineSuccess
            ]
        );
    }

    #[tokio::test]
    async fn test_list_executions_by_pipeline() {
        let h = harness().await;
        let id = h
            .engine
            .create(pipeline(serde_json::json!([{"name": "a", "steps": [script("x", "true")]}])))
            .await
            .unwrap();
        let first = h.engine.execute(&id, "tester", BTreeMap::new()).await.unwrap();
        wait_finished(&h.engine, &first).await;

        let listed = h.engine.list_executions(Some(&id), 10).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, first);
        assert!(h.engine.list_executions(Some("other"), 10).await.unwrap().is_empty());
    }
}
