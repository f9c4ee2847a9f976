//! Signed webhook trigger for pipelines.
//!
//! Requests carry `X-Hub-Signature-256: sha256=<hex>`, an HMAC-SHA256 of the
//! raw body keyed with the pipeline's webhook secret. Push payloads (with a
//! `ref`) only start the pipeline when it has a matching push trigger.

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::json;
use sha2::Sha256;
use std::collections::BTreeMap;
use std::sync::Arc;

use super::error::ApiError;
use crate::AppState;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "X-Hub-Signature-256";

/// Verify a `sha256=<hex>` signature over the payload
pub fn verify_signature(secret: &str, signature_header: &str, payload: &[u8]) -> bool {
    let Some(signature) = signature_header.strip_prefix("sha256=") else {
        return false;
    };

    let Ok(expected) = hex::decode(signature) else {
        return false;
    };

    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(payload);

    // Constant-time
    mac.verify_slice(&expected).is_ok()
}

#[derive(Debug, Default, Deserialize)]
struct WebhookPayload {
    #[serde(rename = "ref")]
    git_ref: Option<String>,
    #[serde(default)]
    env: BTreeMap<String, String>,
}

fn branch_of(git_ref: &str) -> &str {
    git_ref.strip_prefix("refs/heads/").unwrap_or(git_ref)
}

pub async fn pipeline_webhook(
    State(state): State<Arc<AppState>>,
    Path(pipeline_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let pipeline = state.pipelines.get_config(&pipeline_id).await?;

    let Some(secret) = pipeline.webhook_secret() else {
        return Err(ApiError::not_found(format!(
            "Pipeline {} has no webhook trigger",
            pipeline_id
        )));
    };

    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|h| h.to_str().ok())
        .unwrap_or_default();
    if !verify_signature(secret, signature, &body) {
        tracing::warn!(pipeline_id = %pipeline_id, "Webhook signature verification failed");
        return Err(ApiError::unauthorized("Invalid webhook signature"));
    }

    let payload: WebhookPayload = if body.is_empty() {
        WebhookPayload::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| ApiError::bad_request(format!("Invalid webhook payload: {}", e)))?
    };

    let mut env = payload.env;
    if let Some(git_ref) = &payload.git_ref {
        let branch = branch_of(git_ref);
        if !pipeline.triggered_by_push(branch) {
            tracing::info!(
                pipeline_id = %pipeline_id,
                branch = %branch,
                "Push does not match any trigger, ignoring"
            );
            return Ok((
                StatusCode::OK,
                Json(json!({ "status": "ignored", "branch": branch })),
            ));
        }
        env.entry("BRANCH".to_string())
            .or_insert_with(|| branch.to_string());
    }

    let execution_id = state.pipelines.execute(&pipeline_id, "webhook", env).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "status": "queued", "execution_id": execution_id })),
    ))
}
