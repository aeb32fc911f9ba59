use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use sha2::{Digest, Sha256};

use super::AuthError;

/// Storage form of bearer tokens and credentials.
pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    format!("{:x}", hasher.finalize())
}

pub fn fingerprint_of(public_key: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(public_key);
    format!("{:x}", hasher.finalize())
}

/// First 16 hex chars in groups of 4, e.g. `3f2a-91c0-7be4-0d18`.
pub fn display_fingerprint(fingerprint: &str) -> String {
    fingerprint
        .chars()
        .take(16)
        .collect::<Vec<_>>()
        .chunks(4)
        .map(|c| c.iter().collect::<String>())
        .collect::<Vec<_>>()
        .join("-")
}

pub fn device_id_for(public_key: &[u8]) -> String {
    fingerprint_of(public_key).chars().take(16).collect()
}

/// Six digits both sides can show so the user can confirm they match.
pub(super) fn match_code(nonce: &str, fingerprint: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{}:{}", nonce, fingerprint).as_bytes());
    let digest = hasher.finalize();
    let n = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    format!("{:06}", n % 1_000_000)
}

pub(super) fn decode_public_key(b64: &str) -> Result<VerifyingKey, AuthError> {
    let bytes = B64
        .decode(b64.trim())
        .map_err(|_| AuthError::InvalidPublicKey)?;
    let arr: [u8; 32] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| AuthError::InvalidPublicKey)?;
    VerifyingKey::from_bytes(&arr).map_err(|_| AuthError::InvalidPublicKey)
}

pub(super) fn verify(key: &VerifyingKey, message: &[u8], signature_b64: &str) -> Result<(), AuthError> {
    let bytes = B64
        .decode(signature_b64.trim())
        .map_err(|_| AuthError::InvalidSignature)?;
    let signature = Signature::from_slice(&bytes).map_err(|_| AuthError::InvalidSignature)?;
    key.verify(message, &signature)
        .map_err(|_| AuthError::InvalidSignature)
}
