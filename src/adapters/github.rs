//! GitHub REST client for workflow dispatch and deployment statuses.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{SourceHosting, WorkflowDispatch, WorkflowRun};
use crate::db::Environment;

pub struct GitHubClient {
    access_token: String,
    api_url: String,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct WorkflowRunsResponse {
    #[serde(default)]
    workflow_runs: Vec<WorkflowRun>,
}

#[derive(Debug, Serialize)]
struct CreateDeployment<'a> {
    #[serde(rename = "ref")]
    git_ref: &'a str,
    environment: &'a str,
    auto_merge: bool,
    required_contexts: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct DeploymentResponse {
    id: u64,
}

#[derive(Debug, Serialize)]
struct CreateDeploymentStatus<'a> {
    state: &'a str,
    description: &'a str,
}

impl GitHubClient {
    pub fn new(access_token: String, api_url: String) -> Self {
        Self {
            access_token,
            api_url: api_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, format!("{}{}", self.api_url, path))
            .header("Authorization", format!("Bearer {}", self.access_token))
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", "Conveyor")
            .header("X-GitHub-Api-Version", "2022-11-28")
    }

    async fn send(&self, builder: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let response = builder
            .send()
            .await
            .context("Failed to make GitHub API request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("GitHub API error: {} - {}", status, body);
        }
        Ok(response)
    }
}

#[async_trait]
impl SourceHosting for GitHubClient {
    async fn trigger_workflow(&self, dispatch: &WorkflowDispatch) -> Result<()> {
        let path = format!(
            "/repos/{}/{}/actions/workflows/{}/dispatches",
            dispatch.owner, dispatch.repo, dispatch.workflow_id
        );
        let body = serde_json::json!({
            "ref": dispatch.git_ref,
            "inputs": dispatch.inputs,
        });

        tracing::info!(
            repo = %format!("{}/{}", dispatch.owner, dispatch.repo),
            workflow = %dispatch.workflow_id,
            git_ref = %dispatch.git_ref,
            "Dispatching workflow"
        );
        // Dispatch answers 204 with no body
        self.send(self.request(reqwest::Method::POST, &path).json(&body))
            .await?;
        Ok(())
    }

    async fn list_workflow_runs(
        &self,
        owner: &str,
        repo: &str,
        workflow_id: &str,
    ) -> Result<Vec<WorkflowRun>> {
        let path = format!(
            "/repos/{}/{}/actions/workflows/{}/runs?per_page=20",
            owner, repo, workflow_id
        );
        let response: WorkflowRunsResponse = self
            .send(self.request(reqwest::Method::GET, &path))
            .await?
            .json()
            .await
            .context("Failed to parse GitHub API response")?;
        Ok(response.workflow_runs)
    }

    async fn create_deployment_status(
        &self,
        owner: &str,
        repo: &str,
        git_ref: &str,
        environment: Environment,
        state: &str,
        description: &str,
    ) -> Result<()> {
        let deployment: DeploymentResponse = self
            .send(
                self.request(reqwest::Method::POST, &format!("/repos/{}/{}/deployments", owner, repo))
                    .json(&CreateDeployment {
                        git_ref,
                        environment: environment.as_str(),
                        auto_merge: false,
                        required_contexts: Vec::new(),
                    }),
            )
            .await?
            .json()
            .await
            .context("Failed to parse GitHub API response")?;

        let path = format!("/repos/{}/{}/deployments/{}/statuses", owner, repo, deployment.id);
        self.send(
            self.request(reqwest::Method::POST, &path)
                .json(&CreateDeploymentStatus { state, description }),
        )
        .await?;
        Ok(())
    }
}
