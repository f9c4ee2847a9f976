//! Metrics reader backed by the Prometheus HTTP API.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;

use super::{MetricsQuery, MetricsReader};
use crate::db::ApplicationMetrics;

pub struct PrometheusReader {
    base_url: String,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    status: String,
    #[serde(default)]
    data: Option<QueryData>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct QueryData {
    #[serde(default)]
    result: Vec<VectorSample>,
}

#[derive(Debug, Deserialize)]
struct VectorSample {
    /// (timestamp, value-as-string)
    value: (f64, String),
}

impl PrometheusReader {
    pub fn new(base_url: String) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    /// Run an instant query and return the first sample, 0 when empty
    async fn scalar(&self, promql: &str) -> Result<f64> {
        let response: QueryResponse = self
            .client
            .get(format!("{}/api/v1/query", self.base_url))
            .query(&[("query", promql)])
            .send()
            .await
            .context("Failed to query Prometheus")?
            .json()
            .await
            .context("Failed to parse Prometheus response")?;

        parse_scalar(response)
    }
}

fn parse_scalar(response: QueryResponse) -> Result<f64> {
    if response.status != "success" {
        anyhow::bail!(
            "Prometheus query failed: {}",
            response.error.unwrap_or_else(|| "unknown error".to_string())
        );
    }
    let value = response
        .data
        .and_then(|d| d.result.into_iter().next())
        .map(|sample| sample.value.1.parse::<f64>().unwrap_or(0.0))
        .unwrap_or(0.0);
    // 0/0 ratios come back as NaN when there is no traffic
    Ok(if value.is_finite() { value } else { 0.0 })
}

/// Label matchers for the application's request metrics
fn app_matchers(query: &MetricsQuery) -> String {
    let mut matchers = format!(
        "namespace=\"{}\",app=\"{}\"",
        query.namespace, query.application
    );
    if let Some(release) = &query.release {
        matchers.push_str(&format!(",release=\"{}\"", release));
    }
    matchers
}

/// Label matchers for the application's pods
fn pod_matchers(query: &MetricsQuery) -> String {
    let pattern = match &query.release {
        Some(release) => format!("{}-{}-.*", query.application, release),
        None => format!("{}-.*", query.application),
    };
    format!("namespace=\"{}\",pod=~\"{}\"", query.namespace, pattern)
}

#[async_trait]
impl MetricsReader for PrometheusReader {
    async fn get_application_metrics(&self, query: &MetricsQuery) -> Result<ApplicationMetrics> {
        let app = app_matchers(query);
        let pods = pod_matchers(query);

        let request_rate = self
            .scalar(&format!("sum(rate(http_requests_total{{{}}}[5m]))", app))
            .await?;
        let error_rate = self
            .scalar(&format!(
                "sum(rate(http_requests_total{{{},status=~\"5..\"}}[5m])) / sum(rate(http_requests_total{{{}}}[5m]))",
                app, app
            ))
            .await?;
        let response_time_ms = self
            .scalar(&format!(
                "1000 * sum(rate(http_request_duration_seconds_sum{{{}}}[5m])) / sum(rate(http_request_duration_seconds_count{{{}}}[5m]))",
                app, app
            ))
            .await?;
        let cpu = self
            .scalar(&format!(
                "sum(rate(container_cpu_usage_seconds_total{{{}}}[5m]))",
                pods
            ))
            .await?;
        let memory = self
            .scalar(&format!("sum(container_memory_working_set_bytes{{{}}})", pods))
            .await?;
        let pod_count = self
            .scalar(&format!("count(kube_pod_info{{{}}})", pods))
            .await?;
        let ready_pods = self
            .scalar(&format!(
                "sum(kube_pod_status_ready{{{},condition=\"true\"}})",
                pods
            ))
            .await?;

        Ok(ApplicationMetrics {
            cpu,
            memory,
            error_rate,
            response_time_ms,
            request_rate,
            pod_count: pod_count as u32,
            ready_pods: ready_pods as u32,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(release: Option<&str>) -> MetricsQuery {
        MetricsQuery {
            namespace: "apps".to_string(),
            application: "api".to_string(),
            release: release.map(String::from),
        }
    }

    #[test]
    fn test_matchers() {
        assert_eq!(app_matchers(&query(None)), "namespace=\"apps\",app=\"api\"");
        assert_eq!(
            app_matchers(&query(Some("abcd1234"))),
            "namespace=\"apps\",app=\"api\",release=\"abcd1234\""
        );
        assert_eq!(
            pod_matchers(&query(Some("abcd1234"))),
            "namespace=\"apps\",pod=~\"api-abcd1234-.*\""
        );
    }

    #[test]
    fn test_parse_scalar() {
        let ok: QueryResponse = serde_json::from_str(
            r#"{"status":"success","data":{"resultType":"vector","result":[{"metric":{},"value":[1700000000.1,"0.25"]}]}}"#,
        )
        .unwrap();
        assert_eq!(parse_scalar(ok).unwrap(), 0.25);

        let empty: QueryResponse =
            serde_json::from_str(r#"{"status":"success","data":{"resultType":"vector","result":[]}}"#).unwrap();
        assert_eq!(parse_scalar(empty).unwrap(), 0.0);

        let nan: QueryResponse = serde_json::from_str(
            r#"{"status":"success","data":{"resultType":"vector","result":[{"metric":{},"value":[1.0,"NaN"]}]}}"#,
        )
        .unwrap();
        assert_eq!(parse_scalar(nan).unwrap(), 0.0);

        let failed: QueryResponse =
            serde_json::from_str(r#"{"status":"error","errorType":"bad_data","error":"parse error"}"#).unwrap();
        assert!(parse_scalar(failed).unwrap_err().to_string().contains("parse error"));
    }
}
