//! Post-deploy quality monitoring.
//!
//! A successful release with monitoring thresholds registers rollback triggers
//! with the evaluator and schedules a delayed check. The check rolls the
//! release back when the evaluator asks for it or when a fresh analysis has
//! degraded past the thresholds relative to the baseline taken at deploy time.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::adapters::{QualityAnalysis, QualityEvaluator, QualityRequest};
use crate::db::{Blocker, Deployment, MonitoringThresholds, QualityGatePolicy};
use crate::queue::{JobOptions, JobQueue, QUALITY_MONITOR_QUEUE};

/// Payload of jobs on the deployments and quality-monitor queues
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentJob {
    pub deployment_id: String,
}

/// Quality snapshot recorded on the deployment by the gate
pub fn baseline_of(deployment: &Deployment) -> Option<QualityAnalysis> {
    Some(QualityAnalysis {
        check_id: deployment.quality_check_id.clone()?,
        score: deployment.quality_score?,
        passed: deployment.quality_passed.unwrap_or(true),
        blockers: deployment.quality_blockers.clone(),
    })
}

fn same_finding(a: &Blocker, b: &Blocker) -> bool {
    a.category == b.category && a.message == b.message
}

/// Describe the first threshold the current analysis breaches, if any
pub fn breach(
    baseline: &QualityAnalysis,
    current: &QualityAnalysis,
    thresholds: &MonitoringThresholds,
) -> Option<String> {
    let drop = baseline.score - current.score;
    if drop > thresholds.max_score_drop {
        return Some(format!(
            "Quality score dropped by {:.1} ({:.1} -> {:.1}), limit {:.1}",
            drop, baseline.score, current.score, thresholds.max_score_drop
        ));
    }

    let new_blockers: Vec<&Blocker> = current
        .blockers
        .iter()
        .filter(|b| !baseline.blockers.iter().any(|known| same_finding(known, b)))
        .collect();

    let new_critical = new_blockers.iter().filter(|b| b.is_critical_security()).count() as u32;
    if new_critical > thresholds.max_new_critical {
        return Some(format!(
            "{} new critical security issue(s), limit {}",
            new_critical, thresholds.max_new_critical
        ));
    }

    if new_blockers.len() as u32 > thresholds.max_new_blockers {
        return Some(format!(
            "{} new blocker(s), limit {}",
            new_blockers.len(),
            thresholds.max_new_blockers
        ));
    }

    None
}

/// Register rollback triggers and schedule the delayed check.
///
/// Returns false when the deployment has nothing to monitor.
pub async fn arm(
    quality: &dyn QualityEvaluator,
    queue: &JobQueue,
    deployment: &Deployment,
    gate: &QualityGatePolicy,
    delay: Duration,
) -> Result<bool> {
    let (Some(thresholds), Some(baseline)) = (&gate.monitoring, baseline_of(deployment)) else {
        return Ok(false);
    };

    quality
        .setup_rollback_triggers(&deployment.id, &gate.project_id, &baseline, thresholds)
        .await?;

    let job = DeploymentJob {
        deployment_id: deployment.id.clone(),
    };
    queue
        .add_job(
            QUALITY_MONITOR_QUEUE,
            &job,
            JobOptions {
                max_attempts: Some(1),
                delay,
            },
        )
        .await?;

    tracing::info!(
        deployment_id = %deployment.id,
        delay_secs = delay.as_secs(),
        "Post-deploy quality monitoring armed"
    );
    Ok(true)
}

/// Ask the evaluator, then compare a fresh analysis against the baseline.
///
/// Returns the rollback reason when one is needed.
pub async fn check(
    quality: &dyn QualityEvaluator,
    deployment: &Deployment,
    gate: &QualityGatePolicy,
) -> Result<Option<String>> {
    let verdict = quality.check_rollback_needed(&deployment.id).await?;
    if verdict.needed {
        return Ok(Some(
            verdict
                .reason
                .unwrap_or_else(|| "Quality evaluator requested a rollback".to_string()),
        ));
    }

    let (Some(thresholds), Some(baseline)) = (&gate.monitoring, baseline_of(deployment)) else {
        return Ok(None);
    };

    let current = quality
        .analyze_for_deployment(&QualityRequest {
            project_id: gate.project_id.clone(),
            path: gate.path.clone(),
            environment: Some(deployment.environment),
            min_score: gate.min_score,
        })
        .await?;

    Ok(breach(&baseline, &current, thresholds))
}
