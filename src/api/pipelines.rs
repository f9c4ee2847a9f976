use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;

use super::deployments::CreatedResponse;
use super::error::ApiError;
use crate::db::{PipelineConfig, PipelineExecution};
use crate::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct ExecuteRequest {
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    pub triggered_by: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ExecutionQuery {
    pub pipeline_id: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: u32,
}

fn default_limit() -> u32 {
    50
}

pub async fn create_pipeline(
    State(state): State<Arc<AppState>>,
    Json(config): Json<PipelineConfig>,
) -> Result<(StatusCode, Json<CreatedResponse>), ApiError> {
    let id = state.pipelines.create(config).await?;
    Ok((StatusCode::CREATED, Json(CreatedResponse { id })))
}

pub async fn list_pipelines(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<PipelineConfig>>, ApiError> {
    Ok(Json(state.pipelines.list_configs().await?))
}

pub async fn get_pipeline(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<PipelineConfig>, ApiError> {
    Ok(Json(state.pipelines.get_config(&id).await?))
}

pub async fn execute(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    request: Option<Json<ExecuteRequest>>,
) -> Result<(StatusCode, Json<CreatedResponse>), ApiError> {
    let request = request.map(|Json(r)| r).unwrap_or_default();
    let triggered_by = request.triggered_by.as_deref().unwrap_or("api");
    let execution_id = state
        .pipelines
        .execute(&id, triggered_by, request.env)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(CreatedResponse { id: execution_id })))
}

pub async fn list_executions(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ExecutionQuery>,
) -> Result<Json<Vec<PipelineExecution>>, ApiError> {
    Ok(Json(
        state
            .pipelines
            .list_executions(query.pipeline_id.as_deref(), query.limit)
            .await?,
    ))
}

pub async fn get_execution(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<PipelineExecution>, ApiError> {
    Ok(Json(state.pipelines.get_execution(&id).await?))
}

pub async fn cancel_execution(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<PipelineExecution>, ApiError> {
    Ok(Json(state.pipelines.cancel(&id).await?))
}
