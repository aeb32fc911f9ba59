//! Device pairing and signed-request authentication.
//!
//! A device pairs once by signing `pairing:{nonce}:{fingerprint}` with its
//! Ed25519 key. Afterwards every privileged call carries
//! `{device_id, timestamp, nonce, signature}` where the signature covers
//! `"{METHOD}\n{PATH}\n{timestamp}\n{nonce}"`.

mod crypto;

pub use crypto::{device_id_for, display_fingerprint, fingerprint_of, hash_token};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use ed25519_dalek::SigningKey;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

use crate::core::config::ServerConfig;
use crate::core::state::{
    JoinTokenRecord, PairedDevice, PairingRecord, ServerIdentity, SessionRecord, StateStore,
    WorkerRecord, now_ms,
};
use crate::core::ttl::TtlMap;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("a device is already paired with this server")]
    AlreadyPaired,
    #[error("no device is paired with this server")]
    NotPaired,
    #[error("pairing code or nonce does not match")]
    InvalidPairingCode,
    #[error("pairing nonce is unknown or expired")]
    NonceExpired,
    #[error("signature verification failed")]
    InvalidSignature,
    #[error("public key is malformed")]
    InvalidPublicKey,
    #[error("request timestamp is outside the allowed window")]
    TimestampSkew,
    #[error("request nonce was already used")]
    ReplayedNonce,
    #[error("device is not the paired device")]
    UnknownDevice,
    #[error("token is invalid or expired")]
    InvalidOrExpiredToken,
    #[error("state storage failed: {0}")]
    Storage(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClaimRequest {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub nonce: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ClaimResponse {
    pub server_fingerprint: String,
    pub pairing_nonce: String,
    pub match_code: String,
    pub expires_at: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConfirmRequest {
    pub pairing_nonce: String,
    pub device_public_key: String,
    pub signature: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedRequest {
    pub device_id: String,
    pub timestamp: i64,
    pub nonce: String,
    pub signature: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TokenGrant {
    pub token: String,
    pub expires_at: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WorkerJoinRequest {
    pub token: String,
    #[serde(default)]
    pub public_key: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerGrant {
    pub worker_id: String,
    pub credential: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PairingStatus {
    pub paired: bool,
    pub device_id: Option<String>,
    pub server_fingerprint: String,
    pub fingerprint_display: String,
}

/// Signing message for a device-authenticated request.
pub fn request_message(method: &str, path: &str, timestamp: i64, nonce: &str) -> String {
    format!("{}\n{}\n{}\n{}", method.to_ascii_uppercase(), path, timestamp, nonce)
}

pub fn pairing_message(nonce: &str, fingerprint: &str) -> String {
    format!("pairing:{}:{}", nonce, fingerprint)
}

/// Deep link a phone scans to start pairing.
pub fn qr_payload(server_url: &str, pairing_code: &str, fingerprint: &str) -> String {
    let query = url::form_urlencoded::Serializer::new(String::new())
        .append_pair("url", server_url)
        .append_pair("code", pairing_code)
        .append_pair("fp", fingerprint)
        .finish();
    format!("voicepilot://pair?{}", query)
}

fn random_hex(len: usize) -> String {
    let bytes: Vec<u8> = (0..len).map(|_| rand::random::<u8>()).collect();
    hex::encode(bytes)
}

fn random_pairing_code() -> String {
    format!("{:06}", rand::random::<u32>() % 1_000_000)
}

pub struct DeviceAuth {
    store: Arc<StateStore>,
    config: ServerConfig,
    nonces: Mutex<TtlMap<String, ()>>,
}

impl DeviceAuth {
    pub fn new(store: Arc<StateStore>, config: ServerConfig) -> Self {
        let window = Duration::from_secs(config.nonce_window_secs);
        Self {
            store,
            config,
            nonces: Mutex::new(TtlMap::new(window)),
        }
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    /// Load the server identity, generating a fresh keypair on first start.
    pub async fn ensure_identity(&self) -> Result<ServerIdentity, AuthError> {
        if let Some(identity) = self.store.read(|s| s.identity.clone()).await {
            return Ok(identity);
        }
        let signing = SigningKey::from_bytes(&rand::random::<[u8; 32]>());
        let public = signing.verifying_key().to_bytes();
        let identity = ServerIdentity {
            secret_key: B64.encode(signing.to_bytes()),
            public_key: B64.encode(public),
            fingerprint: fingerprint_of(&public),
            created_at: now_ms(),
        };
        let identity = self
            .store
            .mutate(|s| s.identity.get_or_insert(identity).clone())
            .await?;
        info!(
            "Server identity ready (fingerprint {})",
            display_fingerprint(&identity.fingerprint)
        );
        Ok(identity)
    }

    pub async fn is_paired(&self) -> bool {
        self.store.read(|s| s.paired_device.is_some()).await
    }

    pub async fn status(&self) -> Result<PairingStatus, AuthError> {
        let identity = self.ensure_identity().await?;
        let device_id = self
            .store
            .read(|s| s.paired_device.as_ref().map(|d| d.device_id.clone()))
            .await;
        Ok(PairingStatus {
            paired: device_id.is_some(),
            device_id,
            fingerprint_display: display_fingerprint(&identity.fingerprint),
            server_fingerprint: identity.fingerprint,
        })
    }

    /// Return the live pairing record, creating one if none exists or the
    /// previous one expired. `None` once a device is paired.
    pub async fn ensure_pairing(&self) -> Result<Option<PairingRecord>, AuthError> {
        let identity = self.ensure_identity().await?;
        let ttl_ms = (self.config.pairing_ttl_secs * 1000) as i64;
        let record = self
            .store
            .mutate(|s| {
                if s.paired_device.is_some() {
                    return None;
                }
                let now = now_ms();
                match &s.pairing {
                    Some(p) if p.expires_at > now => Some(p.clone()),
                    _ => {
                        let nonce = random_hex(16);
                        let record = PairingRecord {
                            match_code: crypto::match_code(&nonce, &identity.fingerprint),
                            nonce,
                            pairing_code: random_pairing_code(),
                            expires_at: now + ttl_ms,
                        };
                        s.pairing = Some(record.clone());
                        Some(record)
                    }
                }
            })
            .await?;
        Ok(record)
    }

    pub async fn claim(&self, req: &ClaimRequest) -> Result<ClaimResponse, AuthError> {
        if self.is_paired().await {
            return Err(AuthError::AlreadyPaired);
        }
        let identity = self.ensure_identity().await?;
        let record = self
            .ensure_pairing()
            .await?
            .ok_or(AuthError::AlreadyPaired)?;

        let code_ok = req
            .code
            .as_deref()
            .is_some_and(|c| c.trim() == record.pairing_code);
        let nonce_ok = req.nonce.as_deref().is_some_and(|n| n == record.nonce);
        if !code_ok && !nonce_ok {
            return Err(AuthError::InvalidPairingCode);
        }

        Ok(ClaimResponse {
            server_fingerprint: identity.fingerprint,
            pairing_nonce: record.nonce,
            match_code: record.match_code,
            expires_at: record.expires_at,
        })
    }

    pub async fn confirm(&self, req: &ConfirmRequest) -> Result<PairedDevice, AuthError> {
        let identity = self.ensure_identity().await?;
        let (paired, pairing) = self
            .store
            .read(|s| (s.paired_device.is_some(), s.pairing.clone()))
            .await;
        if paired {
            return Err(AuthError::AlreadyPaired);
        }
        let record = pairing
            .filter(|p| p.nonce == req.pairing_nonce && p.expires_at > now_ms())
            .ok_or(AuthError::NonceExpired)?;

        let key = crypto::decode_public_key(&req.device_public_key)?;
        let message = pairing_message(&record.nonce, &identity.fingerprint);
        crypto::verify(&key, message.as_bytes(), &req.signature)?;

        let device = PairedDevice {
            device_id: device_id_for(&key.to_bytes()),
            public_key: req.device_public_key.clone(),
            paired_at: now_ms(),
        };
        let stored = device.clone();
        let bound = self
            .store
            .mutate(move |s| {
                if s.paired_device.is_some() {
                    return false;
                }
                s.paired_device = Some(stored);
                s.pairing = None;
                true
            })
            .await?;
        if !bound {
            return Err(AuthError::AlreadyPaired);
        }
        info!(device_id = %device.device_id, "Device paired");
        Ok(device)
    }

    /// Verify a device-signed request and burn its nonce.
    /// Checks run cheapest first: paired, device, clock skew, replay, signature.
    pub async fn verify_signed(
        &self,
        method: &str,
        path: &str,
        req: &SignedRequest,
    ) -> Result<String, AuthError> {
        let device = self
            .store
            .read(|s| s.paired_device.clone())
            .await
            .ok_or(AuthError::NotPaired)?;
        if device.device_id != req.device_id {
            return Err(AuthError::UnknownDevice);
        }

        let skew_ms = (self.config.timestamp_skew_secs * 1000) as i64;
        if (now_ms() - req.timestamp).abs() > skew_ms {
            return Err(AuthError::TimestampSkew);
        }

        if req.nonce.is_empty() || self.nonce_seen(&req.nonce) {
            return Err(AuthError::ReplayedNonce);
        }

        let key = crypto::decode_public_key(&device.public_key)?;
        let message = request_message(method, path, req.timestamp, &req.nonce);
        crypto::verify(&key, message.as_bytes(), &req.signature)?;

        if !self.record_nonce(&req.nonce) {
            return Err(AuthError::ReplayedNonce);
        }
        Ok(device.device_id)
    }

    fn nonce_seen(&self, nonce: &str) -> bool {
        match self.nonces.lock() {
            Ok(mut cache) => cache.contains_key(&nonce.to_string()),
            Err(_) => true,
        }
    }

    fn record_nonce(&self, nonce: &str) -> bool {
        match self.nonces.lock() {
            Ok(mut cache) => cache.insert_if_absent(nonce.to_string(), ()),
            Err(_) => false,
        }
    }

    pub async fn create_session(
        &self,
        method: &str,
        path: &str,
        req: &SignedRequest,
    ) -> Result<TokenGrant, AuthError> {
        let device_id = self.verify_signed(method, path, req).await?;
        let token = random_hex(32);
        let expires_at = now_ms() + (self.config.session_ttl_secs * 1000) as i64;
        let hash = hash_token(&token);
        self.store
            .mutate(move |s| {
                s.sessions.insert(
                    hash,
                    SessionRecord {
                        device_id,
                        expires_at,
                    },
                );
            })
            .await?;
        Ok(TokenGrant { token, expires_at })
    }

    pub async fn create_join_token(
        &self,
        method: &str,
        path: &str,
        req: &SignedRequest,
    ) -> Result<TokenGrant, AuthError> {
        let device_id = self.verify_signed(method, path, req).await?;
        let token = random_hex(32);
        let expires_at = now_ms() + (self.config.join_token_ttl_secs * 1000) as i64;
        let hash = hash_token(&token);
        self.store
            .mutate(move |s| {
                s.join_tokens.insert(
                    hash,
                    JoinTokenRecord {
                        device_id,
                        expires_at,
                    },
                );
            })
            .await?;
        Ok(TokenGrant { token, expires_at })
    }

    /// Exchange a one-time join token for a persistent worker credential.
    /// The token is removed in the same mutation that creates the worker.
    pub async fn join_worker(&self, req: &WorkerJoinRequest) -> Result<WorkerGrant, AuthError> {
        if let Some(key) = &req.public_key {
            crypto::decode_public_key(key)?;
        }
        let hash = hash_token(&req.token);
        let credential = random_hex(32);
        let credential_hash = hash_token(&credential);
        let worker_id = uuid::Uuid::new_v4().to_string();
        let now = now_ms();
        let record = WorkerRecord {
            worker_id: worker_id.clone(),
            public_key: req.public_key.clone(),
            credential_hash,
            name: req.name.clone(),
            created_at: now,
            last_seen: now,
        };

        let joined = self
            .store
            .mutate(move |s| match s.join_tokens.remove(&hash) {
                Some(t) if t.expires_at > now => {
                    s.workers.insert(record.worker_id.clone(), record);
                    true
                }
                _ => false,
            })
            .await?;
        if !joined {
            return Err(AuthError::InvalidOrExpiredToken);
        }
        info!(worker_id = %worker_id, "Worker joined");
        Ok(WorkerGrant {
            worker_id,
            credential,
        })
    }

    pub async fn validate_session(&self, token: &str) -> Result<String, AuthError> {
        let hash = hash_token(token);
        let now = now_ms();
        self.store
            .read(|s| {
                if s.paired_device.is_none() {
                    return Err(AuthError::NotPaired);
                }
                match s.sessions.get(&hash) {
                    Some(rec) if rec.expires_at > now => Ok(rec.device_id.clone()),
                    _ => Err(AuthError::InvalidOrExpiredToken),
                }
            })
            .await
    }

    /// Resolve a worker credential to its worker id, touching `last_seen`.
    pub async fn validate_worker(&self, credential: &str) -> Result<String, AuthError> {
        let hash = hash_token(credential);
        let found = self
            .store
            .mutate(|s| {
                let id = s.worker_by_credential_hash(&hash)?.worker_id.clone();
                if let Some(w) = s.workers.get_mut(&id) {
                    w.last_seen = now_ms();
                }
                Some(id)
            })
            .await?;
        found.ok_or(AuthError::InvalidOrExpiredToken)
    }

    pub async fn touch_worker(&self, worker_id: &str) {
        let id = worker_id.to_string();
        if let Err(e) = self
            .store
            .mutate(move |s| {
                if let Some(w) = s.workers.get_mut(&id) {
                    w.last_seen = now_ms();
                }
            })
            .await
        {
            warn!("Failed to record worker heartbeat: {}", e);
        }
    }

    /// Forget the paired device along with every credential it minted.
    pub async fn unpair(&self) -> Result<bool, AuthError> {
        let was_paired = self
            .store
            .mutate(|s| {
                let was = s.paired_device.take().is_some();
                s.sessions.clear();
                s.join_tokens.clear();
                s.pairing = None;
                was
            })
            .await?;
        if was_paired {
            info!("Device unpaired");
        }
        Ok(was_paired)
    }
}
