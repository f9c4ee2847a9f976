use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::error::ApiError;
use crate::db::{Deployment, DeploymentConfig, DeploymentFilter, Environment};
use crate::engine::DeploymentOptions;
use crate::AppState;

#[derive(Debug, Serialize, Deserialize)]
pub struct CreatedResponse {
    pub id: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct RollbackRequest {
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    #[serde(default = "default_history_limit")]
    pub limit: u32,
}

fn default_history_limit() -> u32 {
    20
}

pub async fn create_config(
    State(state): State<Arc<AppState>>,
    Json(config): Json<DeploymentConfig>,
) -> Result<(StatusCode, Json<CreatedResponse>), ApiError> {
    let id = state.deployments.create_config(config).await?;
    Ok((StatusCode::CREATED, Json(CreatedResponse { id })))
}

pub async fn list_configs(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<DeploymentConfig>>, ApiError> {
    Ok(Json(state.deployments.list_configs().await?))
}

pub async fn get_config(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<DeploymentConfig>, ApiError> {
    Ok(Json(state.deployments.get_config(&id).await?))
}

/// Starts asynchronously; the body may be empty
pub async fn deploy(
    State(state): State<Arc<AppState>>,
    Path(config_id): Path<String>,
    options: Option<Json<DeploymentOptions>>,
) -> Result<(StatusCode, Json<CreatedResponse>), ApiError> {
    let options = options.map(|Json(o)| o).unwrap_or_default();
    let id = state.deployments.deploy(&config_id, options).await?;
    Ok((StatusCode::ACCEPTED, Json(CreatedResponse { id })))
}

pub async fn list_deployments(
    State(state): State<Arc<AppState>>,
    Query(filter): Query<DeploymentFilter>,
) -> Result<Json<Vec<Deployment>>, ApiError> {
    Ok(Json(state.deployments.list_deployments(&filter).await?))
}

pub async fn get_deployment(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Deployment>, ApiError> {
    Ok(Json(state.deployments.get_deployment(&id).await?))
}

pub async fn rollback(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    request: Option<Json<RollbackRequest>>,
) -> Result<(StatusCode, Json<CreatedResponse>), ApiError> {
    let reason = request.and_then(|Json(r)| r.reason);
    let rollback_id = state.deployments.rollback(&id, reason).await?;
    Ok((StatusCode::ACCEPTED, Json(CreatedResponse { id: rollback_id })))
}

pub async fn cancel(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Deployment>, ApiError> {
    Ok(Json(state.deployments.cancel(&id).await?))
}

pub async fn history(
    State(state): State<Arc<AppState>>,
    Path((application, environment)): Path<(String, String)>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<Deployment>>, ApiError> {
    let environment: Environment = environment.parse().map_err(ApiError::bad_request)?;
    Ok(Json(
        state
            .deployments
            .get_history(&application, environment, query.limit)
            .await?,
    ))
}
