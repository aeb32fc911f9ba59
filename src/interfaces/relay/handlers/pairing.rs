use axum::{Json, extract::State};
use serde_json::{Value, json};

use crate::core::auth::{
    AuthError, ClaimRequest, ClaimResponse, ConfirmRequest, PairingStatus, qr_payload,
};
use crate::interfaces::relay::AppState;
use crate::interfaces::relay::error::{ApiError, JsonBody};

pub async fn status(State(state): State<AppState>) -> Result<Json<PairingStatus>, ApiError> {
    Ok(Json(state.auth.status().await?))
}

pub async fn claim(
    State(state): State<AppState>,
    JsonBody(payload): JsonBody<ClaimRequest>,
) -> Result<Json<ClaimResponse>, ApiError> {
    if payload.code.is_none() && payload.nonce.is_none() {
        return Err(ApiError::Validation(
            "either code or nonce is required".to_string(),
        ));
    }
    Ok(Json(state.auth.claim(&payload).await?))
}

pub async fn confirm(
    State(state): State<AppState>,
    JsonBody(payload): JsonBody<ConfirmRequest>,
) -> Result<Json<Value>, ApiError> {
    let device = state.auth.confirm(&payload).await?;
    let identity = state.auth.ensure_identity().await?;
    Ok(Json(json!({
        "device_id": device.device_id,
        "server_fingerprint": identity.fingerprint,
        "server_public_key": identity.public_key,
    })))
}

pub async fn qr(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let identity = state.auth.ensure_identity().await?;
    let record = state
        .auth
        .ensure_pairing()
        .await?
        .ok_or(AuthError::AlreadyPaired)?;
    let url = state.config.server.advertised_url();
    Ok(Json(json!({
        "payload": qr_payload(&url, &record.pairing_code, &identity.fingerprint),
        "server_url": url,
        "expires_at": record.expires_at,
    })))
}
