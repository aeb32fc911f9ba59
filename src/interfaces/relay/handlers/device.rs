use axum::{Json, extract::State, http::Uri};

use crate::core::auth::{SignedRequest, TokenGrant};
use crate::interfaces::relay::AppState;
use crate::interfaces::relay::error::{ApiError, JsonBody};

/// Exchange a device-signed request for a bearer session token.
pub async fn create_session(
    State(state): State<AppState>,
    uri: Uri,
    JsonBody(payload): JsonBody<SignedRequest>,
) -> Result<Json<TokenGrant>, ApiError> {
    let grant = state
        .auth
        .create_session("POST", uri.path(), &payload)
        .await?;
    Ok(Json(grant))
}

pub async fn create_worker_join_token(
    State(state): State<AppState>,
    uri: Uri,
    JsonBody(payload): JsonBody<SignedRequest>,
) -> Result<Json<TokenGrant>, ApiError> {
    let grant = state
        .auth
        .create_join_token("POST", uri.path(), &payload)
        .await?;
    Ok(Json(grant))
}
