//! Key derivation and payload encryption for workspace envelopes.
//!
//! One key per user, derived from the user key with PBKDF2-HMAC-SHA256 and a
//! fixed application-wide salt. Payloads are AES-256-GCM encrypted with a
//! fresh random 96-bit nonce per call; the wire form is URL-safe base64 of
//! `nonce ‖ ciphertext ‖ tag`, so the fixed-width nonce prefix is the only
//! framing needed.

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use pbkdf2::pbkdf2_hmac;
use rand::rngs::OsRng;
use rand::RngCore;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::errors::SyncError;

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const KDF_ROUNDS: u32 = 100_000;
const KDF_SALT: &[u8] = b"vitae.workspace.kdf.v1";

/// A derived 256-bit workspace key. Never logged, never serialized.
#[derive(Clone)]
pub struct WorkspaceKey([u8; KEY_LEN]);

impl std::fmt::Debug for WorkspaceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("WorkspaceKey(..)")
    }
}

/// Derives the symmetric key for a user key. Deterministic: the same secret
/// always yields the same key.
pub fn derive_key(secret: &str) -> WorkspaceKey {
    let mut key = [0u8; KEY_LEN];
    pbkdf2_hmac::<Sha256>(secret.as_bytes(), KDF_SALT, KDF_ROUNDS, &mut key);
    WorkspaceKey(key)
}

/// Encrypts a JSON payload under `key`, returning the base64 wire string.
pub fn encrypt(payload: &Value, key: &WorkspaceKey) -> Result<String, SyncError> {
    let plaintext =
        serde_json::to_vec(payload).map_err(|e| SyncError::Encoding(e.to_string()))?;

    let cipher = Aes256Gcm::new_from_slice(&key.0)
        .map_err(|_| SyncError::Encoding("cipher rejected derived key".to_string()))?;
    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);
    let ciphertext = cipher
        .encrypt(nonce, plaintext.as_ref())
        .map_err(|_| SyncError::Encoding("payload encryption failed".to_string()))?;

    let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    blob.extend_from_slice(&nonce_bytes);
    blob.extend_from_slice(&ciphertext);
    Ok(URL_SAFE_NO_PAD.encode(blob))
}

/// Decrypts a wire string produced by [`encrypt`] back into the JSON payload.
///
/// Fails with [`SyncError::Decryption`] on truncated input, authentication
/// failure (wrong key or tampered ciphertext), or non-JSON plaintext.
pub fn decrypt(encoded: &str, key: &WorkspaceKey) -> Result<Value, SyncError> {
    let blob = URL_SAFE_NO_PAD
        .decode(encoded.as_bytes())
        .map_err(|e| SyncError::Decryption(format!("base64 decode failed: {e}")))?;
    if blob.len() < NONCE_LEN {
        return Err(SyncError::Decryption(format!(
            "ciphertext shorter than {NONCE_LEN}-byte nonce prefix"
        )));
    }

    let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);
    let cipher = Aes256Gcm::new_from_slice(&key.0)
        .map_err(|_| SyncError::Decryption("cipher rejected derived key".to_string()))?;
    let plaintext = cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|_| SyncError::Decryption("authentication tag mismatch".to_string()))?;

    serde_json::from_slice(&plaintext)
        .map_err(|e| SyncError::Decryption(format!("plaintext is not valid JSON: {e}")))
}

/// Short non-reversible identifier for a user key, safe for log lines.
/// The reversible `encryptedUserKey` envelope field is wire metadata and must
/// never appear in logs; this tag is what logging uses instead.
pub fn user_tag(user_key: &str) -> String {
    let digest = Sha256::digest(user_key.as_bytes());
    hex::encode(&digest[..4])
}
