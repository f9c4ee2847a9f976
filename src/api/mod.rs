pub mod auth;
mod deployments;
pub mod error;
pub mod metrics;
mod pipelines;
mod webhooks;

pub use deployments::CreatedResponse;

use axum::{
    extract::{Query, State},
    middleware,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::db::Job;
use crate::AppState;
use error::ApiError;

pub fn create_router(state: Arc<AppState>) -> Router {
    // Protected API routes
    let api_routes = Router::new()
        // Deployment configs
        .route(
            "/deployment-configs",
            get(deployments::list_configs).post(deployments::create_config),
        )
        .route("/deployment-configs/:id", get(deployments::get_config))
        .route("/deployment-configs/:id/deploy", post(deployments::deploy))
        // Deployments
        .route("/deployments", get(deployments::list_deployments))
        .route("/deployments/:id", get(deployments::get_deployment))
        .route("/deployments/:id/rollback", post(deployments::rollback))
        .route("/deployments/:id/cancel", post(deployments::cancel))
        .route(
            "/applications/:app/environments/:env/history",
            get(deployments::history),
        )
        // Pipelines
        .route(
            "/pipelines",
            get(pipelines::list_pipelines).post(pipelines::create_pipeline),
        )
        .route("/pipelines/:id", get(pipelines::get_pipeline))
        .route("/pipelines/:id/execute", post(pipelines::execute))
        .route("/executions", get(pipelines::list_executions))
        .route("/executions/:id", get(pipelines::get_execution))
        .route("/executions/:id/cancel", post(pipelines::cancel_execution))
        // Jobs
        .route("/jobs/dead-letter", get(dead_letter))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::auth_middleware,
        ));

    // Signed per pipeline, no bearer token
    let webhook_routes =
        Router::new().route("/pipelines/:id", post(webhooks::pipeline_webhook));

    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics::metrics_endpoint))
        .nest("/api", api_routes)
        .nest("/webhooks", webhook_routes)
        .layer(middleware::from_fn(metrics::metrics_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check() -> &'static str {
    "OK"
}

#[derive(Debug, Deserialize)]
struct DeadLetterQuery {
    queue: Option<String>,
}

/// Jobs that exhausted their attempts
async fn dead_letter(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DeadLetterQuery>,
) -> Result<Json<Vec<Job>>, ApiError> {
    Ok(Json(state.queue.list_dead_letter(query.queue.as_deref()).await?))
}
