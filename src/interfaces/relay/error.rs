use axum::{
    Json,
    extract::{FromRequest, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;
use tracing::error;

use super::hub::HubError;
use crate::core::auth::AuthError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    Upstream(String),
    #[error("{0}")]
    Unavailable(String),
    #[error("{0}")]
    Internal(String),
}

impl From<HubError> for ApiError {
    fn from(e: HubError) -> Self {
        match e {
            HubError::AlreadyConnected => ApiError::Conflict(e.to_string()),
            HubError::NoWorker => ApiError::Unavailable(e.to_string()),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(e: JsonRejection) -> Self {
        ApiError::Validation(e.body_text())
    }
}

/// `Json` extractor whose rejection is a 400 with the usual error body.
#[derive(FromRequest)]
#[from_request(via(Json), rejection(ApiError))]
pub struct JsonBody<T>(pub T);

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Auth(AuthError::AlreadyPaired) => StatusCode::CONFLICT,
            ApiError::Auth(AuthError::NotPaired) => StatusCode::FORBIDDEN,
            ApiError::Auth(AuthError::Storage(_)) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Auth(_) => StatusCode::UNAUTHORIZED,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Upstream(_) => StatusCode::BAD_GATEWAY,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::Auth(e) => match e {
                AuthError::AlreadyPaired => "already_paired",
                AuthError::NotPaired => "not_paired",
                AuthError::InvalidPairingCode => "invalid_pairing_code",
                AuthError::NonceExpired => "nonce_expired",
                AuthError::InvalidSignature => "invalid_signature",
                AuthError::InvalidPublicKey => "invalid_public_key",
                AuthError::TimestampSkew => "timestamp_skew",
                AuthError::ReplayedNonce => "replayed_nonce",
                AuthError::UnknownDevice => "unknown_device",
                AuthError::InvalidOrExpiredToken => "invalid_or_expired_token",
                AuthError::Storage(_) => "storage_error",
            },
            ApiError::Conflict(_) => "conflict",
            ApiError::Validation(_) => "invalid_request",
            ApiError::Upstream(_) => "upstream_error",
            ApiError::Unavailable(_) => "unavailable",
            ApiError::Internal(_) => "internal_error",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("Request failed: {}", self);
        }
        let body = Json(serde_json::json!({
            "error": self.code(),
            "message": self.to_string(),
        }));
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(
            ApiError::from(AuthError::AlreadyPaired).status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError::from(AuthError::NotPaired).status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            ApiError::from(AuthError::ReplayedNonce).status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            ApiError::from(HubError::AlreadyConnected).status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError::from(HubError::NoWorker).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ApiError::Upstream("x".into()).status(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[tokio::test]
    async fn body_rejection_is_validation_failure() {
        use axum::body::{Body, to_bytes};
        use axum::http::Request;

        let req = Request::builder()
            .method("POST")
            .header("content-type", "application/json")
            .body(Body::from("{not json"))
            .unwrap();
        let Err(err) = JsonBody::<serde_json::Value>::from_request(req, &()).await else {
            panic!("malformed body was accepted");
        };
        assert_eq!(err.code(), "invalid_request");
        let resp = err.into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let bytes = to_bytes(resp.into_body(), 1024).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error"], "invalid_request");
        assert!(body["message"].is_string());
    }
}
