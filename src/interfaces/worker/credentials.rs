//! The worker's enrolment: exchanging a join token for a credential and
//! keeping that credential in `worker.json`.

use anyhow::{Context, Result, anyhow, bail};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::core::auth::WorkerGrant;
use crate::core::retry::{Attempt, is_transient_status, with_backoff};
use crate::platform::{NativePlatform, Platform};

const JOIN_ATTEMPTS: usize = 3;
const JOIN_DELAYS: [Duration; 2] = [Duration::from_millis(500), Duration::from_millis(1500)];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerCredentials {
    pub server_url: String,
    pub worker_id: String,
    pub credential: String,
}

impl WorkerCredentials {
    pub fn path(data_dir: &Path) -> PathBuf {
        data_dir.join("worker.json")
    }

    pub async fn load(data_dir: &Path) -> Result<Option<Self>> {
        let path = Self::path(data_dir);
        if !path.exists() {
            return Ok(None);
        }
        let content = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let creds = serde_json::from_str(&content)
            .with_context(|| format!("parsing {}", path.display()))?;
        Ok(Some(creds))
    }

    pub async fn save(&self, data_dir: &Path) -> Result<()> {
        tokio::fs::create_dir_all(data_dir).await?;
        let path = Self::path(data_dir);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_string_pretty(self)?).await?;
        NativePlatform::restrict_file_permissions(&tmp);
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("replacing {}", path.display()))?;
        Ok(())
    }
}

pub fn normalize_server_url(url: &str) -> String {
    url.trim().trim_end_matches('/').to_string()
}

/// `http(s)://host` → `ws(s)://host/worker`.
pub fn worker_socket_url(server_url: &str) -> Result<String> {
    let base = normalize_server_url(server_url);
    let ws = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else if base.starts_with("ws://") || base.starts_with("wss://") {
        base
    } else {
        bail!("unsupported server url '{}'", server_url);
    };
    Ok(format!("{}/worker", ws))
}

/// Trade a one-time join token for a persistent worker credential.
pub async fn join(
    http: &reqwest::Client,
    server_url: &str,
    token: &str,
) -> Result<WorkerCredentials> {
    let server_url = normalize_server_url(server_url);
    let url = format!("{}/worker/join", server_url);
    let name = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok());
    let body = json!({ "token": token.trim(), "name": name });

    let grant: WorkerGrant = with_backoff("worker join", JOIN_ATTEMPTS, &JOIN_DELAYS, |_| {
        let request = http.post(&url).json(&body);
        async move {
            let resp = match request.send().await {
                Ok(r) => r,
                Err(e) => return Attempt::Retry(anyhow!("join request failed: {}", e)),
            };
            let status = resp.status().as_u16();
            if resp.status().is_success() {
                return Attempt::Done(resp.json::<WorkerGrant>().await.map_err(Into::into));
            }
            let text = resp.text().await.unwrap_or_default();
            let err = anyhow!("server refused join ({}): {}", status, text);
            if is_transient_status(status) {
                Attempt::Retry(err)
            } else {
                Attempt::Done(Err(err))
            }
        }
    })
    .await?;

    info!(worker_id = %grant.worker_id, "Joined relay server");
    Ok(WorkerCredentials {
        server_url,
        worker_id: grant.worker_id,
        credential: grant.credential,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_url_follows_scheme() {
        assert_eq!(
            worker_socket_url("http://127.0.0.1:8787/").unwrap(),
            "ws://127.0.0.1:8787/worker"
        );
        assert_eq!(
            worker_socket_url("https://relay.example.com").unwrap(),
            "wss://relay.example.com/worker"
        );
        assert!(worker_socket_url("ftp://nope").is_err());
    }

    #[tokio::test]
    async fn credentials_survive_a_restart() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(WorkerCredentials::load(dir.path()).await.unwrap(), None);
        let creds = WorkerCredentials {
            server_url: "http://127.0.0.1:8787".into(),
            worker_id: "w-1".into(),
            credential: "secret".into(),
        };
        creds.save(dir.path()).await.unwrap();
        assert_eq!(
            WorkerCredentials::load(dir.path()).await.unwrap(),
            Some(creds)
        );
    }
}
