use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, Request, header},
    middleware::Next,
    response::{IntoResponse, Response},
};

use super::AppState;
use super::error::ApiError;
use crate::core::auth::AuthError;

/// Device id of the session that authorised the request.
#[derive(Debug, Clone)]
pub struct SessionDevice(pub String);

pub(crate) fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// `?token=` fallback for WebSocket clients that cannot set headers.
fn query_token(req: &Request<Body>) -> Option<String> {
    let query = req.uri().query()?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(k, _)| k == "token")
        .map(|(_, v)| v.into_owned())
        .filter(|v| !v.is_empty())
}

/// Everything except pairing answers 403 until a device is paired.
pub async fn require_paired(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    if !state.auth.is_paired().await {
        return ApiError::Auth(AuthError::NotPaired).into_response();
    }
    next.run(req).await
}

pub async fn require_session(
    State(state): State<AppState>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    let Some(token) = bearer_token(req.headers()).or_else(|| query_token(&req)) else {
        return ApiError::Auth(AuthError::InvalidOrExpiredToken).into_response();
    };
    match state.auth.validate_session(&token).await {
        Ok(device_id) => {
            req.extensions_mut().insert(SessionDevice(device_id));
            next.run(req).await
        }
        Err(e) => ApiError::Auth(e).into_response(),
    }
}
