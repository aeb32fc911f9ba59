//! Minting short-lived client secrets for the realtime voice API.

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;

use super::error::ApiError;
use crate::core::config::RealtimeConfig;
use crate::core::retry::{Attempt, is_transient_status, with_backoff};

const MINT_ATTEMPTS: usize = 3;
const MINT_DELAYS: [Duration; 2] = [Duration::from_millis(500), Duration::from_millis(1500)];

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct EphemeralSession {
    pub ephemeral_key: String,
    pub expires_at: Option<i64>,
    pub model: String,
    pub voice: String,
}

#[derive(Deserialize)]
struct ClientSecretResponse {
    value: String,
    #[serde(default)]
    expires_at: Option<i64>,
}

pub async fn mint_ephemeral_key(
    http: &reqwest::Client,
    config: &RealtimeConfig,
    voice: &str,
) -> Result<EphemeralSession, ApiError> {
    let api_key = config
        .api_key()
        .ok_or_else(|| ApiError::Unavailable("OPENAI_API_KEY is not set".to_string()))?;
    let url = format!("{}/realtime/client_secrets", config.api_base.trim_end_matches('/'));
    let body = json!({
        "session": {
            "type": "realtime",
            "model": config.model,
            "audio": { "output": { "voice": voice } },
        }
    });

    let secret: ClientSecretResponse =
        with_backoff("realtime client secret", MINT_ATTEMPTS, &MINT_DELAYS, |_| {
            let request = http.post(&url).bearer_auth(&api_key).json(&body);
            async move {
                let resp = match request.send().await {
                    Ok(r) => r,
                    Err(e) => return Attempt::Retry(ApiError::Upstream(e.to_string())),
                };
                let status = resp.status().as_u16();
                if resp.status().is_success() {
                    return Attempt::Done(
                        resp.json::<ClientSecretResponse>()
                            .await
                            .map_err(|e| ApiError::Upstream(e.to_string())),
                    );
                }
                let text = resp.text().await.unwrap_or_default();
                let err = ApiError::Upstream(format!("realtime API returned {}: {}", status, text));
                if is_transient_status(status) {
                    Attempt::Retry(err)
                } else {
                    Attempt::Done(Err(err))
                }
            }
        })
        .await?;

    Ok(EphemeralSession {
        ephemeral_key: secret.value,
        expires_at: secret.expires_at,
        model: config.model.clone(),
        voice: voice.to_string(),
    })
}
