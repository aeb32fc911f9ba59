//! Durable server state: identity, the paired device, sessions, join tokens
//! and registered workers, kept in one JSON document.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::platform::{NativePlatform, Platform};

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerIdentity {
    /// Base64 Ed25519 secret key seed.
    pub secret_key: String,
    /// Base64 Ed25519 public key.
    pub public_key: String,
    /// Hex SHA-256 of the raw public key.
    pub fingerprint: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PairedDevice {
    pub device_id: String,
    pub public_key: String,
    pub paired_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PairingRecord {
    pub nonce: String,
    pub pairing_code: String,
    pub match_code: String,
    pub expires_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionRecord {
    pub device_id: String,
    pub expires_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JoinTokenRecord {
    pub device_id: String,
    pub expires_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerRecord {
    pub worker_id: String,
    #[serde(default)]
    pub public_key: Option<String>,
    pub credential_hash: String,
    #[serde(default)]
    pub name: Option<String>,
    pub created_at: i64,
    pub last_seen: i64,
}

/// Everything written to `state.json`. Session and join-token maps are keyed
/// by the SHA-256 hash of the raw token, never the token itself.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersistedState {
    #[serde(default)]
    pub identity: Option<ServerIdentity>,
    #[serde(default)]
    pub paired_device: Option<PairedDevice>,
    #[serde(default)]
    pub pairing: Option<PairingRecord>,
    #[serde(default)]
    pub sessions: HashMap<String, SessionRecord>,
    #[serde(default)]
    pub join_tokens: HashMap<String, JoinTokenRecord>,
    #[serde(default)]
    pub workers: HashMap<String, WorkerRecord>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PruneReport {
    pub sessions: usize,
    pub join_tokens: usize,
    pub pairing: bool,
}

impl PruneReport {
    pub fn is_empty(&self) -> bool {
        self.sessions == 0 && self.join_tokens == 0 && !self.pairing
    }
}

impl PersistedState {
    /// Remove every record whose `expires_at` is at or before `now`.
    pub fn prune(&mut self, now: i64) -> PruneReport {
        let sessions_before = self.sessions.len();
        self.sessions.retain(|_, s| s.expires_at > now);
        let tokens_before = self.join_tokens.len();
        self.join_tokens.retain(|_, t| t.expires_at > now);
        let pairing = match &self.pairing {
            Some(p) if p.expires_at <= now => {
                self.pairing = None;
                true
            }
            _ => false,
        };
        PruneReport {
            sessions: sessions_before - self.sessions.len(),
            join_tokens: tokens_before - self.join_tokens.len(),
            pairing,
        }
    }

    pub fn worker_by_credential_hash(&self, hash: &str) -> Option<&WorkerRecord> {
        self.workers.values().find(|w| w.credential_hash == hash)
    }
}

/// Shared handle to the state file. All mutations go through [`StateStore::mutate`],
/// which holds the lock across the write so the file always reflects the
/// last completed mutation.
pub struct StateStore {
    path: PathBuf,
    state: Mutex<PersistedState>,
}

impl StateStore {
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let state = if path.exists() {
            let content = tokio::fs::read_to_string(&path)
                .await
                .with_context(|| format!("reading {}", path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("parsing {}", path.display()))?
        } else {
            info!("No state file at {}, starting fresh.", path.display());
            PersistedState::default()
        };
        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run a read-only closure against the current state.
    pub async fn read<R>(&self, f: impl FnOnce(&PersistedState) -> R) -> R {
        let guard = self.state.lock().await;
        f(&guard)
    }

    /// Apply `f` and persist the result atomically.
    pub async fn mutate<R>(&self, f: impl FnOnce(&mut PersistedState) -> R) -> Result<R> {
        let mut guard = self.state.lock().await;
        let out = f(&mut guard);
        self.write(&guard).await?;
        Ok(out)
    }

    pub async fn prune(&self) -> Result<PruneReport> {
        let now = now_ms();
        let mut guard = self.state.lock().await;
        let report = guard.prune(now);
        if !report.is_empty() {
            self.write(&guard).await?;
            debug!(
                "Pruned state: sessions={}, join_tokens={}, pairing={}",
                report.sessions, report.join_tokens, report.pairing
            );
        }
        Ok(report)
    }

    async fn write(&self, state: &PersistedState) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(state)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json)
            .await
            .with_context(|| format!("writing {}", tmp.display()))?;
        NativePlatform::restrict_file_permissions(&tmp);
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("replacing {}", self.path.display()))?;
        Ok(())
    }
}
