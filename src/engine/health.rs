//! Post-rollout health verification.

use anyhow::{Context, Result};
use std::time::{Duration, Instant};

use crate::adapters::{ClusterOperator, Labels};
use crate::db::{HealthCheckSpec, HealthProbe};

/// Where the probes of a release are aimed
#[derive(Debug, Clone)]
pub struct HealthTarget {
    pub namespace: String,
    pub service: String,
    pub port: u16,
    /// Selects the pods of the release for exec probes
    pub pod_selector: Labels,
}

impl HealthTarget {
    fn in_cluster_host(&self) -> String {
        format!("{}.{}.svc.cluster.local", self.service, self.namespace)
    }
}

/// Probe until healthy, giving up after `retries` attempts or `timeout_ms`.
///
/// A probe error counts as a failed attempt.
pub async fn verify(
    cluster: &dyn ClusterOperator,
    spec: &HealthCheckSpec,
    target: &HealthTarget,
) -> Result<()> {
    if spec.probe == HealthProbe::Skip {
        tracing::debug!(service = %target.service, "Health probes disabled");
        return Ok(());
    }

    let deadline = Instant::now() + Duration::from_millis(spec.timeout_ms);
    let interval = Duration::from_millis(spec.interval_ms);
    let attempts = spec.retries.max(1);
    let mut last_error = String::from("no probe attempted");

    for attempt in 1..=attempts {
        match probe(cluster, spec, target).await {
            Ok(()) => {
                tracing::info!(service = %target.service, attempt, "Health check passed");
                return Ok(());
            }
            Err(e) => {
                tracing::warn!(service = %target.service, attempt, error = %e, "Health check attempt failed");
                last_error = e.to_string();
            }
        }

        if attempt == attempts || Instant::now() + interval > deadline {
            break;
        }
        tokio::time::sleep(interval).await;
    }

    anyhow::bail!("Health check failed: {}", last_error)
}

async fn probe(cluster: &dyn ClusterOperator, spec: &HealthCheckSpec, target: &HealthTarget) -> Result<()> {
    // A single probe never outlives the whole budget
    let probe_timeout = Duration::from_millis(spec.timeout_ms).min(Duration::from_secs(10));

    match &spec.probe {
        HealthProbe::Http { path, port, url } => {
            let url = match url {
                Some(url) => url.clone(),
                None => format!(
                    "http://{}:{}{}",
                    target.in_cluster_host(),
                    port.unwrap_or(target.port),
                    path
                ),
            };
            let client = reqwest::Client::builder()
                .timeout(probe_timeout)
                .redirect(reqwest::redirect::Policy::none())
                .build()
                .context("Failed to build HTTP client")?;
            let response = client.get(&url).send().await.with_context(|| format!("GET {}", url))?;
            let status = response.status();
            if status.is_success() || status.is_redirection() {
                Ok(())
            } else {
                anyhow::bail!("{} returned status {}", url, status)
            }
        }
        HealthProbe::Tcp { host, port } => {
            let host = host.clone().unwrap_or_else(|| target.in_cluster_host());
            let address = format!("{}:{}", host, port.unwrap_or(target.port));
            tokio::time::timeout(probe_timeout, tokio::net::TcpStream::connect(&address))
                .await
                .with_context(|| format!("Timed out connecting to {}", address))?
                .with_context(|| format!("Failed to connect to {}", address))?;
            Ok(())
        }
        HealthProbe::Exec => {
            let pods = cluster.get_pods(&target.namespace, &target.pod_selector).await?;
            if pods.is_empty() {
                anyhow::bail!("No pods found for {}", target.service);
            }
            let unready: Vec<&str> = pods.iter().filter(|p| !p.ready).map(|p| p.name.as_str()).collect();
            if unready.is_empty() {
                Ok(())
            } else {
                anyhow::bail!("{} of {} pods not ready: {}", unready.len(), pods.len(), unready.join(", "))
            }
        }
        HealthProbe::Skip => Ok(()),
    }
}
