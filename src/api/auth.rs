use axum::{
    body::Body,
    extract::State,
    http::Request,
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use subtle::ConstantTimeEq;

use super::error::ApiError;
use crate::AppState;

/// Token from `Authorization: Bearer ...` or `X-API-Key`
fn request_token(request: &Request<Body>) -> Option<&str> {
    if let Some(header) = request
        .headers()
        .get("Authorization")
        .and_then(|h| h.to_str().ok())
    {
        return Some(header.strip_prefix("Bearer ").unwrap_or(header));
    }
    request
        .headers()
        .get("X-API-Key")
        .and_then(|h| h.to_str().ok())
}

/// Constant-time comparison; lengths are checked first
pub fn token_matches(expected: &str, provided: &str) -> bool {
    let expected = expected.as_bytes();
    let provided = provided.as_bytes();
    expected.len() == provided.len() && expected.ct_eq(provided).into()
}

pub async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let authorized = request_token(&request)
        .map(|token| token_matches(&state.config.auth.admin_token, token))
        .unwrap_or(false);

    if !authorized {
        tracing::debug!(path = %request.uri().path(), "Rejected unauthenticated request");
        return ApiError::unauthorized("Missing or invalid API token").into_response();
    }

    next.run(request).await
}
