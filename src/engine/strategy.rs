//! Rollout strategies over the cluster operator.
//!
//! Workloads are named `{application}-{release}` and labelled with `app`,
//! `release` and `track` (`stable`, `canary` or `green`). Pods carry only
//! `app` and `release`, so the service can select either all pods of an
//! application or exactly one release.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::adapters::{ClusterOperator, Labels, MetricsQuery, MetricsReader, ServiceRoute, Workload, WorkloadSpec};
use crate::db::{CanaryConfig, RolloutStrategy, TargetDescriptor};

pub const TRACK_STABLE: &str = "stable";
pub const TRACK_CANARY: &str = "canary";
pub const TRACK_GREEN: &str = "green";

/// Everything a strategy needs to roll one release out
#[derive(Debug, Clone)]
pub struct RolloutPlan {
    pub application: String,
    /// Short DNS-safe label identifying this release
    pub release: String,
    /// Fully resolved image reference
    pub image: String,
    pub strategy: RolloutStrategy,
    pub target: TargetDescriptor,
    /// Routing object in front of the application
    pub service: String,
}

/// What is serving after a successful rollout
#[derive(Debug, Clone, PartialEq)]
pub struct RolloutOutcome {
    pub workload: String,
    /// Selects the pods of the rolled-out release
    pub pod_selector: Labels,
}

fn app_selector(application: &str) -> Labels {
    let mut labels = Labels::new();
    labels.insert("app".to_string(), application.to_string());
    labels
}

fn track_selector(application: &str, track: &str) -> Labels {
    let mut labels = app_selector(application);
    labels.insert("track".to_string(), track.to_string());
    labels
}

fn track_label(track: &str) -> Labels {
    let mut labels = Labels::new();
    labels.insert("track".to_string(), track.to_string());
    labels
}

impl RolloutPlan {
    pub fn workload_name(&self) -> String {
        format!("{}-{}", self.application, self.release)
    }

    fn pod_labels(&self) -> Labels {
        let mut labels = app_selector(&self.application);
        labels.insert("release".to_string(), self.release.clone());
        labels
    }

    fn workload_spec(&self, name: String, track: &str, replicas: u32) -> WorkloadSpec {
        let pod_labels = self.pod_labels();
        let mut labels = pod_labels.clone();
        labels.insert("track".to_string(), track.to_string());
        labels.insert("managed-by".to_string(), "conveyor".to_string());

        let (max_surge, max_unavailable) = match &self.strategy {
            RolloutStrategy::RollingUpdate {
                max_surge,
                max_unavailable,
            } => (max_surge.clone(), max_unavailable.clone()),
            _ => (None, None),
        };

        WorkloadSpec {
            name,
            namespace: self.target.namespace.clone(),
            image: self.image.clone(),
            replicas,
            labels,
            pod_labels,
            port: self.target.port,
            env: self.target.env.clone(),
            resources: self.target.resources.clone(),
            max_surge,
            max_unavailable,
        }
    }

    fn route(&self, selector: Labels) -> ServiceRoute {
        ServiceRoute {
            name: self.service.clone(),
            namespace: self.target.namespace.clone(),
            selector,
            port: self.target.port,
        }
    }
}

pub struct StrategyExecutor {
    cluster: Arc<dyn ClusterOperator>,
    metrics: Arc<dyn MetricsReader>,
    rollout_timeout: Duration,
}

impl StrategyExecutor {
    pub fn new(cluster: Arc<dyn ClusterOperator>, metrics: Arc<dyn MetricsReader>, rollout_timeout: Duration) -> Self {
        Self {
            cluster,
            metrics,
            rollout_timeout,
        }
    }

    pub async fn execute(&self, plan: &RolloutPlan) -> Result<RolloutOutcome> {
        tracing::info!(
            application = %plan.application,
            release = %plan.release,
            strategy = plan.strategy.kind(),
            image = %plan.image,
            "Starting rollout"
        );

        match &plan.strategy {
            RolloutStrategy::RollingUpdate { .. } => self.rolling_update(plan).await,
            RolloutStrategy::BlueGreen => self.blue_green(plan).await,
            RolloutStrategy::Canary(canary) => self.canary(plan, canary).await,
        }
    }

    async fn stable_workloads(&self, plan: &RolloutPlan) -> Result<Vec<Workload>> {
        let selector = track_selector(&plan.application, TRACK_STABLE);
        let mut workloads = self
            .cluster
            .list_workloads(&plan.target.namespace, &selector)
            .await
            .context("Failed to list stable workloads")?;
        let new_name = plan.workload_name();
        workloads.retain(|w| w.name != new_name);
        Ok(workloads)
    }

    async fn wait(&self, plan: &RolloutPlan, name: &str) -> Result<()> {
        self.cluster
            .wait_for_rollout(&plan.target.namespace, name, self.rollout_timeout)
            .await
            .with_context(|| format!("Rollout of {} did not complete", name))
    }

    /// Create the first stable workload of an application and route to it
    async fn create_stable(&self, plan: &RolloutPlan) -> Result<RolloutOutcome> {
        let spec = plan.workload_spec(plan.workload_name(), TRACK_STABLE, plan.target.replicas);
        self.cluster.create_workload(&spec).await.context("Failed to create workload")?;
        self.wait(plan, &spec.name).await?;
        self.cluster
            .switch_service_selector(&plan.route(app_selector(&plan.application)))
            .await
            .context("Failed to route service")?;
        Ok(RolloutOutcome {
            workload: spec.name,
            pod_selector: spec.pod_labels,
        })
    }

    async fn rolling_update(&self, plan: &RolloutPlan) -> Result<RolloutOutcome> {
        let mut stable = self.stable_workloads(plan).await?;
        if stable.is_empty() {
            tracing::info!(application = %plan.application, "No stable workload yet, creating one");
            return self.create_stable(plan).await;
        }

        let current = stable.remove(0);
        for extra in &stable {
            tracing::warn!(workload = %extra.name, "Removing duplicate stable workload");
            self.cluster.delete_workload(&plan.target.namespace, &extra.name).await?;
        }

        // Pod labels back the workload selector and must not change in place
        let mut pod_labels = app_selector(&plan.application);
        let release = current.labels.get("release").cloned().unwrap_or_else(|| plan.release.clone());
        pod_labels.insert("release".to_string(), release);

        let mut spec = plan.workload_spec(current.name.clone(), TRACK_STABLE, plan.target.replicas);
        spec.labels = current.labels.clone();
        spec.pod_labels = pod_labels.clone();

        self.cluster.update_workload(&spec).await.context("Failed to update workload")?;
        self.wait(plan, &spec.name).await?;
        self.cluster
            .switch_service_selector(&plan.route(app_selector(&plan.application)))
            .await
            .context("Failed to route service")?;

        Ok(RolloutOutcome {
            workload: current.name,
            pod_selector: pod_labels,
        })
    }

    async fn blue_green(&self, plan: &RolloutPlan) -> Result<RolloutOutcome> {
        let blue = self.stable_workloads(plan).await?;
        let green = plan.workload_spec(plan.workload_name(), TRACK_GREEN, plan.target.replicas);
        let namespace = &plan.target.namespace;

        self.cluster
            .create_workload(&green)
            .await
            .context("Failed to create green workload")?;

        let switched = async {
            self.wait(plan, &green.name).await?;
            self.cluster
                .switch_service_selector(&plan.route(green.pod_labels.clone()))
                .await
                .context("Failed to switch service to green")
        }
        .await;

        if let Err(e) = switched {
            tracing::warn!(workload = %green.name, error = %e, "Green rollout failed, removing it");
            if let Err(cleanup) = self.cluster.delete_workload(namespace, &green.name).await {
                tracing::error!(workload = %green.name, error = %cleanup, "Failed to remove green workload");
            }
            return Err(e);
        }

        for old in &blue {
            self.cluster
                .delete_workload(namespace, &old.name)
                .await
                .with_context(|| format!("Failed to delete blue workload {}", old.name))?;
        }
        self.cluster
            .label_workload(namespace, &green.name, &track_label(TRACK_STABLE))
            .await
            .context("Failed to mark green workload as stable")?;

        Ok(RolloutOutcome {
            workload: green.name,
            pod_selector: green.pod_labels,
        })
    }

    async fn canary(&self, plan: &RolloutPlan, config: &CanaryConfig) -> Result<RolloutOutcome> {
        let stable = self.stable_workloads(plan).await?;
        let Some(current) = stable.first() else {
            tracing::info!(application = %plan.application, "No stable workload to split, deploying directly");
            return self.create_stable(plan).await;
        };

        let namespace = &plan.target.namespace;
        let total = plan.target.replicas;
        // Restored as-is if the canary fails
        let original_replicas: Vec<(String, u32)> =
            stable.iter().map(|w| (w.name.clone(), w.replicas)).collect();
        let (canary_replicas, stable_replicas) = config.split(total);
        let canary = plan.workload_spec(plan.workload_name(), TRACK_CANARY, canary_replicas);

        tracing::info!(
            canary = canary_replicas,
            stable = stable_replicas,
            "Splitting replicas for canary"
        );

        self.cluster
            .create_workload(&canary)
            .await
            .context("Failed to create canary workload")?;

        let observed = async {
            self.wait(plan, &canary.name).await?;
            self.cluster.scale_workload(namespace, &current.name, stable_replicas).await?;
            self.cluster
                .switch_service_selector(&plan.route(app_selector(&plan.application)))
                .await?;
            self.monitor_canary(plan, config).await
        }
        .await;

        if let Err(e) = observed {
            tracing::warn!(workload = %canary.name, error = %e, "Canary failed, restoring stable");
            if let Err(cleanup) = self.cluster.delete_workload(namespace, &canary.name).await {
                tracing::error!(workload = %canary.name, error = %cleanup, "Failed to remove canary workload");
            }
            for (name, replicas) in &original_replicas {
                if let Err(restore) = self.cluster.scale_workload(namespace, name, *replicas).await {
                    tracing::error!(workload = %name, error = %restore, "Failed to restore stable replicas");
                }
            }
            return Err(e);
        }

        // Promote
        self.cluster.scale_workload(namespace, &canary.name, total).await?;
        self.wait(plan, &canary.name).await?;
        for old in &stable {
            self.cluster.scale_workload(namespace, &old.name, 0).await?;
            self.cluster.delete_workload(namespace, &old.name).await?;
        }
        self.cluster
            .label_workload(namespace, &canary.name, &track_label(TRACK_STABLE))
            .await
            .context("Failed to mark canary as stable")?;

        tracing::info!(workload = %canary.name, "Canary promoted");
        Ok(RolloutOutcome {
            workload: canary.name,
            pod_selector: canary.pod_labels,
        })
    }

    /// Poll canary metrics for the observation window. Any threshold breach fails the rollout.
    async fn monitor_canary(&self, plan: &RolloutPlan, config: &CanaryConfig) -> Result<()> {
        let window = Duration::from_millis(config.window_ms);
        let poll = Duration::from_millis(config.poll_interval_ms.max(1));
        let query = MetricsQuery {
            namespace: plan.target.namespace.clone(),
            application: plan.application.clone(),
            release: Some(plan.release.clone()),
        };
        let started = Instant::now();

        while started.elapsed() < window {
            tokio::time::sleep(poll.min(window.saturating_sub(started.elapsed()))).await;

            let metrics = match self.metrics.get_application_metrics(&query).await {
                Ok(metrics) => metrics,
                Err(e) => {
                    tracing::warn!(error = %e, "Canary metrics unavailable");
                    continue;
                }
            };

            if metrics.error_rate > config.max_error_rate {
                anyhow::bail!(
                    "Canary error rate {:.4} exceeds {:.4}",
                    metrics.error_rate,
                    config.max_error_rate
                );
            }
            if metrics.response_time_ms > config.max_response_time_ms {
                anyhow::bail!(
                    "Canary response time {:.0}ms exceeds {:.0}ms",
                    metrics.response_time_ms,
                    config.max_response_time_ms
                );
            }
            tracing::debug!(
                error_rate = metrics.error_rate,
                response_time_ms = metrics.response_time_ms,
                "Canary healthy"
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::fake::FakeAdapters;
    use std::sync::atomic::Ordering;

    fn plan(release: &str, strategy: RolloutStrategy, replicas: u32) -> RolloutPlan {
        RolloutPlan {
            application: "api".to_string(),
            release: release.to_string(),
            image: format!("registry.test/api:{}", release),
            strategy,
            target: TargetDescriptor {
                namespace: "apps".to_string(),
                replicas,
                ..Default::default()
            },
            service: "api".to_string(),
        }
    }

    fn executor(fakes: &FakeAdapters) -> StrategyExecutor {
        let adapters = fakes.adapters();
        StrategyExecutor::new(adapters.cluster, adapters.metrics, Duration::from_secs(1))
    }

    fn canary(percentage: u32) -> RolloutStrategy {
        RolloutStrategy::Canary(CanaryConfig {
            percentage,
            window_ms: 5,
            poll_interval_ms: 1,
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_rolling_update_creates_then_updates_in_place() {
        let fakes = FakeAdapters::default();
        let exec = executor(&fakes);

        let first = exec.execute(&plan("aaaa1111", RolloutStrategy::default(), 3)).await.unwrap();
        assert_eq!(first.workload, "api-aaaa1111");

        let second = exec.execute(&plan("bbbb2222", RolloutStrategy::default(), 4)).await.unwrap();
        assert_eq!(second.workload, "api-aaaa1111");
        assert_eq!(second.pod_selector.get("release").unwrap(), "aaaa1111");

        let workload = fakes.cluster.workload("api-aaaa1111").unwrap();
        assert_eq!(workload.image.as_deref(), Some("registry.test/api:bbbb2222"));
        assert_eq!(workload.replicas, 4);
        assert_eq!(fakes.cluster.workload_names(), vec!["api-aaaa1111"]);
        assert_eq!(
            fakes.cluster.service_selector("api").unwrap(),
            app_selector("api")
        );
    }

    #[tokio::test]
    async fn test_blue_green_switches_service_and_removes_blue() {
        let fakes = FakeAdapters::default();
        let exec = executor(&fakes);
        exec.execute(&plan("blue0001", RolloutStrategy::default(), 2)).await.unwrap();

        let outcome = exec.execute(&plan("green002", RolloutStrategy::BlueGreen, 2)).await.unwrap();
        assert_eq!(outcome.workload, "api-green002");
        assert_eq!(fakes.cluster.workload_names(), vec!["api-green002"]);
        assert_eq!(
            fakes.cluster.service_selector("api").unwrap().get("release").unwrap(),
            "green002"
        );
        let green = fakes.cluster.workload("api-green002").unwrap();
        assert_eq!(green.labels.get("track").unwrap(), TRACK_STABLE);

        let calls = fakes.cluster.calls();
        let switch = calls.iter().position(|c| c.starts_with("switch api app=api,release=green002")).unwrap();
        let delete = calls.iter().position(|c| c == "delete api-blue0001").unwrap();
        assert!(switch < delete);
    }

    #[tokio::test]
    async fn test_blue_green_failure_keeps_blue_serving() {
        let fakes = FakeAdapters::default();
        let exec = executor(&fakes);
        exec.execute(&plan("blue0001", RolloutStrategy::default(), 2)).await.unwrap();
        *fakes.cluster.fail_rollout_for.lock().unwrap() = Some("green".to_string());

        assert!(exec.execute(&plan("green002", RolloutStrategy::BlueGreen, 2)).await.is_err());
        assert_eq!(fakes.cluster.workload_names(), vec!["api-blue0001"]);
        assert_eq!(fakes.cluster.service_selector("api").unwrap(), app_selector("api"));
    }

    #[tokio::test]
    async fn test_canary_splits_and_promotes() {
        let fakes = FakeAdapters::default();
        let exec = executor(&fakes);
        exec.execute(&plan("stable01", RolloutStrategy::default(), 10)).await.unwrap();

        let outcome = exec.execute(&plan("canary02", canary(20), 10)).await.unwrap();
        assert_eq!(outcome.workload, "api-canary02");

        let calls = fakes.cluster.calls();
        assert!(calls.contains(&"create api-canary02 2".to_string()));
        assert!(calls.contains(&"scale api-stable01 8".to_string()));
        assert!(calls.contains(&"scale api-canary02 10".to_string()));
        assert!(calls.contains(&"delete api-stable01".to_string()));
        assert_eq!(fakes.cluster.workload_names(), vec!["api-canary02"]);
        assert_eq!(
            fakes.cluster.workload("api-canary02").unwrap().labels.get("track").unwrap(),
            TRACK_STABLE
        );
        assert!(fakes.metrics.reads.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn test_canary_breach_restores_stable() {
        let fakes = FakeAdapters::default();
        let exec = executor(&fakes);
        exec.execute(&plan("stable01", RolloutStrategy::default(), 10)).await.unwrap();
        fakes.metrics.current.lock().unwrap().error_rate = 0.5;

        let err = exec.execute(&plan("canary02", canary(20), 10)).await.unwrap_err();
        assert!(err.to_string().contains("error rate"));
        assert_eq!(fakes.cluster.workload_names(), vec!["api-stable01"]);
        assert_eq!(fakes.cluster.workload("api-stable01").unwrap().replicas, 10);
    }

    #[tokio::test]
    async fn test_canary_breach_restores_original_replica_count() {
        let fakes = FakeAdapters::default();
        let exec = executor(&fakes);
        exec.execute(&plan("stable01", RolloutStrategy::default(), 10)).await.unwrap();
        fakes.metrics.current.lock().unwrap().error_rate = 0.5;

        // The new release asks for fewer replicas than the stable one runs
        assert!(exec.execute(&plan("canary02", canary(20), 4)).await.is_err());
        let calls = fakes.cluster.calls();
        assert!(calls.contains(&"scale api-stable01 3".to_string()));
        assert_eq!(calls.last().map(String::as_str), Some("scale api-stable01 10"));
        assert_eq!(fakes.cluster.workload("api-stable01").unwrap().replicas, 10);
    }

    #[tokio::test]
    async fn test_canary_without_stable_deploys_directly() {
        let fakes = FakeAdapters::default();
        let exec = executor(&fakes);
        let outcome = exec.execute(&plan("first001", canary(10), 5)).await.unwrap();
        assert_eq!(outcome.workload, "api-first001");
        assert_eq!(fakes.cluster.workload("api-first001").unwrap().replicas, 5);
    }
}
