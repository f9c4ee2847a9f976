//! Cluster operator backed by the Kubernetes API.

use anyhow::{Context, Result};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{
    Deployment, DeploymentSpec, DeploymentStrategy, RollingUpdateDeployment,
};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, Pod, PodSpec, PodTemplateSpec, ResourceRequirements,
    Service, ServicePort, ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::config::KubeConfigOptions;
use kube::{Api, Client};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use super::{selector_string, ClusterOperator, Labels, PodInfo, ServiceRoute, Workload, WorkloadSpec};
use crate::config::KubernetesConfig;

const ROLLOUT_POLL_INTERVAL: Duration = Duration::from_secs(2);

pub struct KubernetesOperator {
    client: Client,
    field_manager: String,
}

impl KubernetesOperator {
    pub async fn connect(config: &KubernetesConfig) -> Result<Self> {
        let client = match &config.context {
            Some(context) => {
                let options = KubeConfigOptions {
                    context: Some(context.clone()),
                    ..Default::default()
                };
                let kube_config = kube::Config::from_kubeconfig(&options)
                    .await
                    .with_context(|| format!("Failed to load kubeconfig context {}", context))?;
                Client::try_from(kube_config)?
            }
            None => Client::try_default()
                .await
                .context("Failed to create Kubernetes client")?,
        };

        // Fail fast when the API server is unreachable
        client
            .apiserver_version()
            .await
            .context("Kubernetes API server is not reachable")?;

        Ok(Self {
            client,
            field_manager: config.field_manager.clone(),
        })
    }

    fn deployments(&self, namespace: &str) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn build_deployment(spec: &WorkloadSpec) -> Deployment {
    let env = spec
        .env
        .iter()
        .map(|(name, value)| EnvVar {
            name: name.clone(),
            value: Some(value.clone()),
            ..Default::default()
        })
        .collect::<Vec<_>>();

    let mut limits = BTreeMap::new();
    if let Some(cpu) = &spec.resources.cpu {
        limits.insert("cpu".to_string(), Quantity(cpu.clone()));
    }
    if let Some(memory) = &spec.resources.memory {
        limits.insert("memory".to_string(), Quantity(memory.clone()));
    }

    let strategy = if spec.max_surge.is_some() || spec.max_unavailable.is_some() {
        Some(DeploymentStrategy {
            type_: Some("RollingUpdate".to_string()),
            rolling_update: Some(RollingUpdateDeployment {
                max_surge: spec.max_surge.clone().map(int_or_string),
                max_unavailable: spec.max_unavailable.clone().map(int_or_string),
            }),
        })
    } else {
        None
    };

    Deployment {
        metadata: ObjectMeta {
            name: Some(spec.name.clone()),
            namespace: Some(spec.namespace.clone()),
            labels: Some(spec.labels.clone()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(spec.replicas as i32),
            selector: LabelSelector {
                match_labels: Some(spec.pod_labels.clone()),
                ..Default::default()
            },
            strategy,
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(spec.pod_labels.clone()),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: "app".to_string(),
                        image: Some(spec.image.clone()),
                        ports: Some(vec![ContainerPort {
                            container_port: spec.port as i32,
                            ..Default::default()
                        }]),
                        env: if env.is_empty() { None } else { Some(env) },
                        resources: if limits.is_empty() {
                            None
                        } else {
                            Some(ResourceRequirements {
                                limits: Some(limits),
                                ..Default::default()
                            })
                        },
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn int_or_string(value: String) -> IntOrString {
    match value.parse::<i32>() {
        Ok(n) => IntOrString::Int(n),
        Err(_) => IntOrString::String(value),
    }
}

fn to_workload(deployment: Deployment) -> Workload {
    let spec = deployment.spec.as_ref();
    let status = deployment.status.as_ref();
    Workload {
        name: deployment.metadata.name.clone().unwrap_or_default(),
        namespace: deployment.metadata.namespace.clone().unwrap_or_default(),
        image: spec
            .and_then(|s| s.template.spec.as_ref())
            .and_then(|p| p.containers.first())
            .and_then(|c| c.image.clone()),
        replicas: spec.and_then(|s| s.replicas).unwrap_or(0).max(0) as u32,
        ready_replicas: status.and_then(|s| s.ready_replicas).unwrap_or(0).max(0) as u32,
        labels: deployment.metadata.labels.clone().unwrap_or_default(),
    }
}

/// True once the controller has observed the latest spec and every replica is updated and ready
fn rollout_complete(deployment: &Deployment) -> bool {
    let desired = deployment.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
    let generation = deployment.metadata.generation.unwrap_or(0);
    let Some(status) = deployment.status.as_ref() else {
        return false;
    };
    status.observed_generation.unwrap_or(0) >= generation
        && status.updated_replicas.unwrap_or(0) >= desired
        && status.ready_replicas.unwrap_or(0) >= desired
        && status.replicas.unwrap_or(0) <= desired
}

#[async_trait]
impl ClusterOperator for KubernetesOperator {
    async fn create_workload(&self, spec: &WorkloadSpec) -> Result<()> {
        let deployment = build_deployment(spec);
        tracing::info!(name = %spec.name, namespace = %spec.namespace, image = %spec.image, "Creating workload");
        self.deployments(&spec.namespace)
            .create(&PostParams::default(), &deployment)
            .await
            .with_context(|| format!("Failed to create workload {}", spec.name))?;
        Ok(())
    }

    async fn update_workload(&self, spec: &WorkloadSpec) -> Result<()> {
        let deployment = build_deployment(spec);
        tracing::info!(name = %spec.name, namespace = %spec.namespace, image = %spec.image, "Updating workload");
        self.deployments(&spec.namespace)
            .patch(
                &spec.name,
                &PatchParams::apply(&self.field_manager).force(),
                &Patch::Apply(&deployment),
            )
            .await
            .with_context(|| format!("Failed to update workload {}", spec.name))?;
        Ok(())
    }

    async fn delete_workload(&self, namespace: &str, name: &str) -> Result<()> {
        tracing::info!(name = %name, namespace = %namespace, "Deleting workload");
        match self.deployments(namespace).delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(err)) if err.code == 404 => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to delete workload {}", name)),
        }
    }

    async fn scale_workload(&self, namespace: &str, name: &str, replicas: u32) -> Result<()> {
        tracing::info!(name = %name, namespace = %namespace, replicas, "Scaling workload");
        let patch = serde_json::json!({ "spec": { "replicas": replicas } });
        self.deployments(namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .with_context(|| format!("Failed to scale workload {}", name))?;
        Ok(())
    }

    async fn list_workloads(&self, namespace: &str, selector: &Labels) -> Result<Vec<Workload>> {
        let list = self
            .deployments(namespace)
            .list(&ListParams::default().labels(&selector_string(selector)))
            .await
            .context("Failed to list workloads")?;
        Ok(list.items.into_iter().map(to_workload).collect())
    }

    async fn label_workload(&self, namespace: &str, name: &str, labels: &Labels) -> Result<()> {
        let patch = serde_json::json!({ "metadata": { "labels": labels } });
        self.deployments(namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .with_context(|| format!("Failed to label workload {}", name))?;
        Ok(())
    }

    async fn wait_for_rollout(&self, namespace: &str, name: &str, timeout: Duration) -> Result<()> {
        let api = self.deployments(namespace);
        let started = Instant::now();

        loop {
            let deployment = api
                .get(name)
                .await
                .with_context(|| format!("Failed to read workload {}", name))?;
            if rollout_complete(&deployment) {
                tracing::debug!(name = %name, "Rollout complete");
                return Ok(());
            }
            if started.elapsed() >= timeout {
                let ready = deployment
                    .status
                    .as_ref()
                    .and_then(|s| s.ready_replicas)
                    .unwrap_or(0);
                anyhow::bail!(
                    "Workload {} did not become ready within {}s ({} replicas ready)",
                    name,
                    timeout.as_secs(),
                    ready
                );
            }
            tokio::time::sleep(ROLLOUT_POLL_INTERVAL).await;
        }
    }

    async fn get_pods(&self, namespace: &str, selector: &Labels) -> Result<Vec<PodInfo>> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let list = pods
            .list(&ListParams::default().labels(&selector_string(selector)))
            .await
            .context("Failed to list pods")?;

        Ok(list
            .items
            .into_iter()
            .map(|pod| {
                let ready = pod
                    .status
                    .as_ref()
                    .and_then(|s| s.conditions.as_ref())
                    .map(|conditions| {
                        conditions
                            .iter()
                            .any(|c| c.type_ == "Ready" && c.status == "True")
                    })
                    .unwrap_or(false);
                PodInfo {
                    name: pod.metadata.name.clone().unwrap_or_default(),
                    phase: pod
                        .status
                        .as_ref()
                        .and_then(|s| s.phase.clone())
                        .unwrap_or_else(|| "Unknown".to_string()),
                    ready,
                }
            })
            .collect())
    }

    async fn switch_service_selector(&self, route: &ServiceRoute) -> Result<()> {
        let services: Api<Service> = Api::namespaced(self.client.clone(), &route.namespace);

        match services.get(&route.name).await {
            Ok(_) => {
                tracing::info!(service = %route.name, selector = %selector_string(&route.selector), "Switching service selector");
                let patch = serde_json::json!({ "spec": { "selector": route.selector } });
                services
                    .patch(&route.name, &PatchParams::default(), &Patch::Merge(&patch))
                    .await
                    .with_context(|| format!("Failed to switch service {}", route.name))?;
            }
            Err(kube::Error::Api(err)) if err.code == 404 => {
                tracing::info!(service = %route.name, "Creating service");
                let service = Service {
                    metadata: ObjectMeta {
                        name: Some(route.name.clone()),
                        namespace: Some(route.namespace.clone()),
                        ..Default::default()
                    },
                    spec: Some(ServiceSpec {
                        selector: Some(route.selector.clone()),
                        ports: Some(vec![ServicePort {
                            port: route.port as i32,
                            target_port: Some(IntOrString::Int(route.port as i32)),
                            ..Default::default()
                        }]),
                        ..Default::default()
                    }),
                    ..Default::default()
                };
                services
                    .create(&PostParams::default(), &service)
                    .await
                    .with_context(|| format!("Failed to create service {}", route.name))?;
            }
            Err(e) => return Err(e).context("Failed to read service"),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::ResourceSpec;
    use k8s_openapi::api::apps::v1::DeploymentStatus as K8sDeploymentStatus;

    fn spec() -> WorkloadSpec {
        let mut pod_labels = Labels::new();
        pod_labels.insert("app".to_string(), "api".to_string());
        pod_labels.insert("release".to_string(), "abcd1234".to_string());
        let mut labels = pod_labels.clone();
        labels.insert("track".to_string(), "stable".to_string());

        WorkloadSpec {
            name: "api-abcd1234".to_string(),
            namespace: "apps".to_string(),
            image: "registry.test/api:1.0.0".to_string(),
            replicas: 3,
            labels,
            pod_labels,
            port: 8080,
            env: BTreeMap::from([("RUST_LOG".to_string(), "info".to_string())]),
            resources: ResourceSpec {
                cpu: Some("500m".to_string()),
                memory: None,
            },
            max_surge: Some("25%".to_string()),
            max_unavailable: Some("0".to_string()),
        }
    }

    #[test]
    fn test_build_deployment_shape() {
        let deployment = build_deployment(&spec());
        let dspec = deployment.spec.as_ref().unwrap();
        assert_eq!(dspec.replicas, Some(3));
        assert_eq!(
            dspec.selector.match_labels.as_ref().unwrap().get("release").map(String::as_str),
            Some("abcd1234")
        );
        let container = &dspec.template.spec.as_ref().unwrap().containers[0];
        assert_eq!(container.image.as_deref(), Some("registry.test/api:1.0.0"));
        let limits = container.resources.as_ref().unwrap().limits.as_ref().unwrap();
        assert_eq!(limits.get("cpu"), Some(&Quantity("500m".to_string())));
        assert!(!limits.contains_key("memory"));

        let rolling = dspec.strategy.as_ref().unwrap().rolling_update.as_ref().unwrap();
        assert_eq!(rolling.max_surge, Some(IntOrString::String("25%".to_string())));
        assert_eq!(rolling.max_unavailable, Some(IntOrString::Int(0)));

        let workload = to_workload(deployment);
        assert_eq!(workload.replicas, 3);
        assert_eq!(workload.ready_replicas, 0);
        assert_eq!(workload.labels.get("track").map(String::as_str), Some("stable"));
    }

    #[test]
    fn test_rollout_complete_requires_observed_generation() {
        let mut deployment = build_deployment(&spec());
        deployment.metadata.generation = Some(2);
        deployment.status = Some(K8sDeploymentStatus {
            observed_generation: Some(1),
            replicas: Some(3),
            updated_replicas: Some(3),
            ready_replicas: Some(3),
            ..Default::default()
        });
        assert!(!rollout_complete(&deployment));

        deployment.status.as_mut().unwrap().observed_generation = Some(2);
        assert!(rollout_complete(&deployment));

        // Old replicas still terminating
        deployment.status.as_mut().unwrap().replicas = Some(4);
        assert!(!rollout_complete(&deployment));
    }
}
