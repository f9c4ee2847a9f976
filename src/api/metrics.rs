//! Prometheus metrics endpoint and HTTP request tracking middleware.

use anyhow::{Context, Result};
use axum::{
    body::Body,
    extract::{MatchedPath, State},
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::Arc;
use std::time::Instant;

use crate::AppState;

pub const HTTP_REQUESTS_TOTAL: &str = "http_requests_total";
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "http_request_duration_seconds";
pub const DEPLOYMENTS_TOTAL: &str = "deployments_total";
pub const DEPLOYMENT_DURATION_SECONDS: &str = "deployment_duration_seconds";
pub const ROLLBACKS_TOTAL: &str = "rollbacks_total";
pub const PIPELINE_RUNS_TOTAL: &str = "pipeline_runs_total";
pub const PIPELINE_STEP_RETRIES_TOTAL: &str = "pipeline_step_retries_total";

/// Install the Prometheus recorder. Call once during startup.
pub fn init_metrics() -> Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .context("Failed to install Prometheus recorder")?;

    describe_counter!(HTTP_REQUESTS_TOTAL, "Total number of HTTP requests received");
    describe_histogram!(HTTP_REQUEST_DURATION_SECONDS, "HTTP request duration in seconds");
    describe_counter!(DEPLOYMENTS_TOTAL, "Finished deployments by final status");
    describe_histogram!(
        DEPLOYMENT_DURATION_SECONDS,
        "Time from deployment start to its final status"
    );
    describe_counter!(ROLLBACKS_TOTAL, "Rollbacks initiated, by trigger");
    describe_counter!(PIPELINE_RUNS_TOTAL, "Finished pipeline executions by status");
    describe_counter!(PIPELINE_STEP_RETRIES_TOTAL, "Step attempts that were retried");

    Ok(handle)
}

/// GET /metrics - Prometheus text format, no authentication
pub async fn metrics_endpoint(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.metrics_handle.as_ref() {
        Some(h) => (StatusCode::OK, h.render()),
        None => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Metrics not initialized".to_string(),
        ),
    }
}

/// Records `http_requests_total` and `http_request_duration_seconds`
pub async fn metrics_middleware(request: Request<Body>, next: Next) -> Response {
    let start = Instant::now();

    // Route template, so /api/deployments/:id is one series
    let path = request
        .extensions()
        .get::<MatchedPath>()
        .map(|mp| mp.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());

    let method = request.method().to_string();

    let response = next.run(request).await;

    let duration = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    counter!(HTTP_REQUESTS_TOTAL, "method" => method.clone(), "path" => path.clone(), "status" => status).increment(1);
    histogram!(HTTP_REQUEST_DURATION_SECONDS, "method" => method, "path" => path).record(duration);

    response
}
