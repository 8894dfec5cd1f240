//! Envelope codec: the wire representation of workspace writes.
//!
//! Plain mode ships the sanitized payload itself with bookkeeping keys
//! stamped in; encrypted mode nests the payload as an AEAD blob. Reads must
//! tolerate both modes plus the legacy pre-encryption form, so the format is
//! resolved into an explicit [`EncodingFormat`] before any decoding happens.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use crate::crypto::{self, WorkspaceKey};
use crate::errors::SyncError;

pub const FIELD_ENCRYPTED_PAYLOAD: &str = "encryptedPayload";
const FIELD_ENCRYPTION_TYPE: &str = "encryptionType";
const ENCRYPTION_TYPE_AES_GCM: &str = "AES-GCM";
const MODE_ENCRYPTED: &str = "encrypted";
const MODE_PLAIN: &str = "plain";

/// Metadata keys are read in this order; the first non-empty string wins.
const ACTION_CANDIDATES: [&str; 3] = ["type", "etapa", "action"];
const DEFAULT_ACTION: &str = "update";

/// Wire shape of an encrypted workspace write.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EncryptedEnvelope {
    encrypted_payload: String,
    last_action: String,
    updated_at: String,
    encrypted_user_key: String,
    encryption_mode: String,
    encryption_type: String,
}

/// How a stored document represents its payload, resolved by inspecting the
/// envelope fields before any decode attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodingFormat {
    /// The document is the payload (current plain mode and legacy
    /// direct-shape documents alike).
    Plain,
    /// Pre-encryption scheme: `encryptedPayload` holds plain base64 of the
    /// JSON payload, unauthenticated. Read-only; never written anymore.
    LegacyWeak,
    /// Current encrypted mode: `encryptedPayload` holds an AEAD blob.
    AesGcm,
}

impl EncodingFormat {
    pub fn detect(raw: &Value) -> Result<Self, SyncError> {
        if raw.get(FIELD_ENCRYPTED_PAYLOAD).is_none() {
            return Ok(EncodingFormat::Plain);
        }
        match raw.get(FIELD_ENCRYPTION_TYPE).and_then(Value::as_str) {
            Some(ENCRYPTION_TYPE_AES_GCM) => Ok(EncodingFormat::AesGcm),
            Some(other) => Err(SyncError::Decryption(format!(
                "unknown encryption type '{other}'"
            ))),
            None => Ok(EncodingFormat::LegacyWeak),
        }
    }
}

/// Recursively strips absent-valued fields from a payload.
///
/// Object keys holding null are dropped (the document store rejects them);
/// array entries are kept in place, nulls staying explicit so positions
/// survive.
pub fn sanitize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (key, entry) in map {
                if entry.is_null() {
                    continue;
                }
                out.insert(key.clone(), sanitize(entry));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(sanitize).collect()),
        other => other.clone(),
    }
}

/// Deterministic reversible encoding of the user key, carried on the wire as
/// `encryptedUserKey` for indexing and debugging. NOT a security boundary;
/// anything needing confidentiality goes through [`crate::crypto`] instead.
pub fn opaque_user_id(user_key: &str) -> String {
    BASE64.encode(user_key.as_bytes())
}

/// Reverses [`opaque_user_id`]. Debugging helper.
pub fn decode_opaque_user_id(encoded: &str) -> Result<String, SyncError> {
    let bytes = BASE64
        .decode(encoded.as_bytes())
        .map_err(|e| SyncError::Encoding(format!("opaque user id decode failed: {e}")))?;
    String::from_utf8(bytes)
        .map_err(|_| SyncError::Encoding("opaque user id is not UTF-8".to_string()))
}

/// Builds the wire envelope for a workspace write.
///
/// Encryption is a property of the runtime environment, decided once per
/// call: `Some(key)` produces an encrypted envelope, `None` the plain form.
pub fn build_envelope(
    user_key: &str,
    data: &Value,
    key: Option<&WorkspaceKey>,
) -> Result<Value, SyncError> {
    let sanitized = sanitize(data);
    let payload = match sanitized {
        Value::Object(map) => map,
        _ => {
            return Err(SyncError::Encoding(
                "workspace payload must be a JSON object".to_string(),
            ))
        }
    };

    let last_action = derive_last_action(&payload);
    let updated_at = Utc::now().to_rfc3339();
    let encrypted_user_key = opaque_user_id(user_key);

    match key {
        Some(key) => {
            let encrypted_payload = crypto::encrypt(&Value::Object(payload), key)?;
            let envelope = EncryptedEnvelope {
                encrypted_payload,
                last_action,
                updated_at,
                encrypted_user_key,
                encryption_mode: MODE_ENCRYPTED.to_string(),
                encryption_type: ENCRYPTION_TYPE_AES_GCM.to_string(),
            };
            serde_json::to_value(envelope).map_err(|e| SyncError::Encoding(e.to_string()))
        }
        None => {
            let mut doc = payload;
            doc.insert("lastAction".to_string(), Value::String(last_action));
            doc.insert("updatedAt".to_string(), Value::String(updated_at));
            doc.insert(
                "encryptedUserKey".to_string(),
                Value::String(encrypted_user_key),
            );
            doc.insert(
                "encryptionMode".to_string(),
                Value::String(MODE_PLAIN.to_string()),
            );
            Ok(Value::Object(doc))
        }
    }
}

/// Decodes a stored document back into its payload.
///
/// Plain documents pass through as-is (bookkeeping keys included); encrypted
/// documents are decrypted under `key`; legacy-weak documents go through the
/// deprecated base64 path. Failures propagate in every format, and whether
/// an undecodable document is fatal or ignorable is the caller's call.
pub fn decode_envelope(raw: &Value, key: &WorkspaceKey) -> Result<Value, SyncError> {
    match EncodingFormat::detect(raw)? {
        EncodingFormat::Plain => Ok(raw.clone()),
        EncodingFormat::AesGcm => {
            let encoded = encrypted_payload_str(raw)?;
            crypto::decrypt(encoded, key)
        }
        EncodingFormat::LegacyWeak => {
            let encoded = encrypted_payload_str(raw)?;
            decode_legacy_weak(encoded).inspect_err(|_| {
                warn!("legacy-format workspace document failed to decode");
            })
        }
    }
}

fn encrypted_payload_str(raw: &Value) -> Result<&str, SyncError> {
    raw.get(FIELD_ENCRYPTED_PAYLOAD)
        .and_then(Value::as_str)
        .ok_or_else(|| SyncError::Decryption("encryptedPayload is not a string".to_string()))
}

/// The scheme that predates envelope encryption: plain base64 over the JSON
/// payload. Unauthenticated, kept only so documents written by old clients
/// stay readable.
fn decode_legacy_weak(encoded: &str) -> Result<Value, SyncError> {
    let bytes = BASE64
        .decode(encoded.as_bytes())
        .map_err(|e| SyncError::Decryption(format!("legacy base64 decode failed: {e}")))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| SyncError::Decryption(format!("legacy payload is not valid JSON: {e}")))
}

fn derive_last_action(payload: &Map<String, Value>) -> String {
    for field in ACTION_CANDIDATES {
        if let Some(action) = payload.get(field).and_then(Value::as_str) {
            if !action.is_empty() {
                return action.to_string();
            }
        }
    }
    DEFAULT_ACTION.to_string()
}
