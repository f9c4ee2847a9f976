//! Quality evaluator reached over HTTP.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};

use super::{DeployVerdict, QualityAnalysis, QualityEvaluator, QualityRequest, RollbackVerdict};
use crate::db::MonitoringThresholds;

pub struct HttpQualityEvaluator {
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct RollbackTriggers<'a> {
    deployment_id: &'a str,
    project_id: &'a str,
    baseline: &'a QualityAnalysis,
    thresholds: &'a MonitoringThresholds,
}

impl HttpQualityEvaluator {
    pub fn new(base_url: String, api_key: Option<String>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            client: reqwest::Client::new(),
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let builder = self
            .client
            .request(method, format!("{}/api/quality{}", self.base_url, path));
        match &self.api_key {
            Some(key) => builder.header("X-API-Key", key),
            None => builder,
        }
    }

    async fn send<T: DeserializeOwned>(&self, builder: reqwest::RequestBuilder) -> Result<T> {
        let response = builder
            .send()
            .await
            .context("Failed to reach quality evaluator")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Quality evaluator error: {} - {}", status, body);
        }

        response
            .json()
            .await
            .context("Failed to parse quality evaluator response")
    }
}

#[async_trait]
impl QualityEvaluator for HttpQualityEvaluator {
    async fn can_deploy(&self, request: &QualityRequest) -> Result<DeployVerdict> {
        self.send(self.request(reqwest::Method::POST, "/can-deploy").json(request))
            .await
    }

    async fn analyze_for_deployment(&self, request: &QualityRequest) -> Result<QualityAnalysis> {
        self.send(self.request(reqwest::Method::POST, "/analyze").json(request))
            .await
    }

    async fn setup_rollback_triggers(
        &self,
        deployment_id: &str,
        project_id: &str,
        baseline: &QualityAnalysis,
        thresholds: &MonitoringThresholds,
    ) -> Result<()> {
        let body = RollbackTriggers {
            deployment_id,
            project_id,
            baseline,
            thresholds,
        };
        let _: serde_json::Value = self
            .send(self.request(reqwest::Method::POST, "/rollback-triggers").json(&body))
            .await?;
        Ok(())
    }

    async fn check_rollback_needed(&self, deployment_id: &str) -> Result<RollbackVerdict> {
        self.send(self.request(
            reqwest::Method::GET,
            &format!("/rollback-triggers/{}", deployment_id),
        ))
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verdicts_parse_with_optional_fields() {
        let verdict: DeployVerdict = serde_json::from_str(r#"{"allowed": false}"#).unwrap();
        assert!(!verdict.allowed);
        assert!(verdict.reason.is_none());

        let analysis: QualityAnalysis = serde_json::from_str(
            r#"{"check_id": "qc-1", "score": 81.5, "passed": true,
                "blockers": [{"severity": "high", "category": "security", "message": "weak hash"}]}"#,
        )
        .unwrap();
        assert_eq!(analysis.blockers.len(), 1);
        assert_eq!(analysis.blockers[0].severity, crate::db::Severity::High);
    }

    #[test]
    fn test_rollback_trigger_body_shape() {
        let baseline = QualityAnalysis {
            check_id: "qc-1".to_string(),
            score: 90.0,
            passed: true,
            blockers: vec![],
        };
        let thresholds = MonitoringThresholds::default();
        let body = serde_json::to_value(RollbackTriggers {
            deployment_id: "d1",
            project_id: "p1",
            baseline: &baseline,
            thresholds: &thresholds,
        })
        .unwrap();
        assert_eq!(body["deployment_id"], "d1");
        assert_eq!(body["baseline"]["score"], 90.0);
        assert_eq!(body["thresholds"]["max_score_drop"], 10.0);
    }
}
