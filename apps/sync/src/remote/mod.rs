//! Remote access layer: everything between the caller and the workspace
//! HTTP API.
//!
//! `WorkspaceStore` is the single entry point: it resolves collection names,
//! sanitizes child identifiers, runs payloads through the envelope codec and
//! keeps a per-user cache of derived keys. The actual transport sits behind
//! the [`WorkspaceBackend`] trait so the HTTP backend and the in-memory
//! backend are interchangeable.

pub mod http;
pub mod memory;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use crate::config::{Config, RuntimeMode};
use crate::crypto::{self, WorkspaceKey};
use crate::envelope;
use crate::errors::SyncError;

const DEFAULT_COLLECTION: &str = "workspaces";
const DEV_COLLECTION: &str = "workspaces_dev";

/// Raw result of a conditional workspace read, before envelope decoding.
#[derive(Debug, Clone)]
pub enum FetchOutcome {
    /// The document exists and was transferred; `validator` is the server's
    /// cache validator to echo on the next conditional read.
    Document {
        raw: Value,
        validator: Option<String>,
    },
    /// The supplied validator still matches; nothing was transferred.
    NotModified,
    /// No workspace exists for this key. A logical outcome, not an error.
    Missing,
}

/// Transport seam for the workspace API.
///
/// Implementations receive fully resolved collection names and sanitized
/// child identifiers; they do no envelope work of their own.
#[async_trait]
pub trait WorkspaceBackend: Send + Sync {
    async fn fetch(
        &self,
        collection: &str,
        user_key: &str,
        validator: Option<&str>,
    ) -> Result<FetchOutcome, SyncError>;

    async fn store(
        &self,
        collection: &str,
        user_key: &str,
        envelope: &Value,
    ) -> Result<(), SyncError>;

    async fn remove(&self, collection: &str, user_key: &str) -> Result<(), SyncError>;

    async fn fetch_child(
        &self,
        collection: &str,
        user_key: &str,
        child_collection: &str,
        child_id: &str,
    ) -> Result<Option<Value>, SyncError>;

    async fn store_child(
        &self,
        collection: &str,
        user_key: &str,
        child_collection: &str,
        child_id: &str,
        envelope: &Value,
        merge: bool,
    ) -> Result<(), SyncError>;

    async fn remove_child(
        &self,
        collection: &str,
        user_key: &str,
        child_collection: &str,
        child_id: &str,
    ) -> Result<(), SyncError>;
}

/// Restricts an identifier to `[A-Za-z0-9_.-]` before it is placed in a URL
/// path. Anything else becomes `_`; an empty input stays addressable as `_`.
pub fn sanitize_identifier(raw: &str) -> String {
    let sanitized: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if sanitized.is_empty() {
        "_".to_string()
    } else {
        sanitized
    }
}

/// High-level workspace document store.
///
/// Cheap to clone; all clones share the backend and the derived-key cache.
#[derive(Clone)]
pub struct WorkspaceStore {
    backend: Arc<dyn WorkspaceBackend>,
    collection: Option<String>,
    mode: RuntimeMode,
    keys: Arc<Mutex<HashMap<String, WorkspaceKey>>>,
}

impl WorkspaceStore {
    pub fn new(backend: Arc<dyn WorkspaceBackend>, config: &Config) -> Self {
        Self {
            backend,
            collection: config.collection.clone(),
            mode: config.mode,
            keys: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Resolution priority: explicit override > configured name >
    /// mode-derived name > `workspaces`.
    fn resolve_collection<'a>(&'a self, collection_override: Option<&'a str>) -> &'a str {
        collection_override
            .or(self.collection.as_deref())
            .unwrap_or(match self.mode {
                RuntimeMode::Development => DEV_COLLECTION,
                RuntimeMode::Production => DEFAULT_COLLECTION,
            })
    }

    /// Key derivation is expensive, so derived keys are cached per user.
    /// Needed regardless of mode: reads must decode documents written by
    /// clients running in the other mode.
    async fn key_for(&self, user_key: &str) -> WorkspaceKey {
        let mut keys = self.keys.lock().await;
        if let Some(key) = keys.get(user_key) {
            return key.clone();
        }
        let key = crypto::derive_key(user_key);
        keys.insert(user_key.to_string(), key.clone());
        key
    }

    /// Reads and decodes the workspace document. `Ok(None)` means no
    /// workspace exists yet.
    pub async fn get(
        &self,
        user_key: &str,
        collection_override: Option<&str>,
    ) -> Result<Option<Value>, SyncError> {
        let collection = self.resolve_collection(collection_override);
        let tag = crypto::user_tag(user_key);

        match self.backend.fetch(collection, user_key, None).await {
            Ok(FetchOutcome::Missing) => {
                debug!(user = %tag, collection, "workspace read: absent");
                Ok(None)
            }
            // Without a validator the backend never answers NotModified;
            // treat it as absent if one ever does.
            Ok(FetchOutcome::NotModified) => Ok(None),
            Ok(FetchOutcome::Document { raw, .. }) => {
                let payload = self.decode_document(user_key, &raw).await?;
                debug!(user = %tag, collection, "workspace read: ok");
                Ok(Some(payload))
            }
            Err(e) => {
                error!(user = %tag, collection, error = %e, "workspace read failed");
                Err(e)
            }
        }
    }

    /// Builds the envelope for `data` and overwrites the workspace document.
    pub async fn upsert(
        &self,
        user_key: &str,
        collection_override: Option<&str>,
        data: &Value,
    ) -> Result<(), SyncError> {
        let collection = self.resolve_collection(collection_override);
        let tag = crypto::user_tag(user_key);

        let envelope = self.build_envelope(user_key, data).await?;
        match self.backend.store(collection, user_key, &envelope).await {
            Ok(()) => {
                info!(user = %tag, collection, "workspace write committed");
                Ok(())
            }
            Err(e) => {
                error!(user = %tag, collection, error = %e, "workspace write failed");
                Err(e)
            }
        }
    }

    pub async fn delete(
        &self,
        user_key: &str,
        collection_override: Option<&str>,
    ) -> Result<(), SyncError> {
        let collection = self.resolve_collection(collection_override);
        let tag = crypto::user_tag(user_key);

        match self.backend.remove(collection, user_key).await {
            Ok(()) => {
                info!(user = %tag, collection, "workspace deleted");
                Ok(())
            }
            Err(e) => {
                error!(user = %tag, collection, error = %e, "workspace delete failed");
                Err(e)
            }
        }
    }

    /// Reads and decodes a child document nested under the workspace.
    pub async fn get_child(
        &self,
        user_key: &str,
        collection_override: Option<&str>,
        child_collection: &str,
        child_id: &str,
    ) -> Result<Option<Value>, SyncError> {
        let collection = self.resolve_collection(collection_override);
        let child_collection = sanitize_identifier(child_collection);
        let child_id = sanitize_identifier(child_id);
        let tag = crypto::user_tag(user_key);

        match self
            .backend
            .fetch_child(collection, user_key, &child_collection, &child_id)
            .await
        {
            Ok(None) => {
                debug!(user = %tag, collection, child = %child_collection, "child read: absent");
                Ok(None)
            }
            Ok(Some(raw)) => {
                let payload = self.decode_document(user_key, &raw).await?;
                debug!(user = %tag, collection, child = %child_collection, "child read: ok");
                Ok(Some(payload))
            }
            Err(e) => {
                error!(user = %tag, collection, child = %child_collection, error = %e, "child read failed");
                Err(e)
            }
        }
    }

    /// Writes a child document. With `merge` the server folds the envelope
    /// into the existing document instead of replacing it.
    pub async fn upsert_child(
        &self,
        user_key: &str,
        collection_override: Option<&str>,
        child_collection: &str,
        child_id: &str,
        data: &Value,
        merge: bool,
    ) -> Result<(), SyncError> {
        let collection = self.resolve_collection(collection_override);
        let child_collection = sanitize_identifier(child_collection);
        let child_id = sanitize_identifier(child_id);
        let tag = crypto::user_tag(user_key);

        let envelope = self.build_envelope(user_key, data).await?;
        match self
            .backend
            .store_child(
                collection,
                user_key,
                &child_collection,
                &child_id,
                &envelope,
                merge,
            )
            .await
        {
            Ok(()) => {
                info!(user = %tag, collection, child = %child_collection, merge, "child write committed");
                Ok(())
            }
            Err(e) => {
                error!(user = %tag, collection, child = %child_collection, error = %e, "child write failed");
                Err(e)
            }
        }
    }

    pub async fn delete_child(
        &self,
        user_key: &str,
        collection_override: Option<&str>,
        child_collection: &str,
        child_id: &str,
    ) -> Result<(), SyncError> {
        let collection = self.resolve_collection(collection_override);
        let child_collection = sanitize_identifier(child_collection);
        let child_id = sanitize_identifier(child_id);
        let tag = crypto::user_tag(user_key);

        match self
            .backend
            .remove_child(collection, user_key, &child_collection, &child_id)
            .await
        {
            Ok(()) => {
                info!(user = %tag, collection, child = %child_collection, "child deleted");
                Ok(())
            }
            Err(e) => {
                error!(user = %tag, collection, child = %child_collection, error = %e, "child delete failed");
                Err(e)
            }
        }
    }

    /// Conditional read for the poll loop: echoes `validator` so the server
    /// can answer 304 for unchanged documents.
    pub(crate) async fn fetch_conditional(
        &self,
        user_key: &str,
        collection_override: Option<&str>,
        validator: Option<&str>,
    ) -> Result<FetchOutcome, SyncError> {
        let collection = self.resolve_collection(collection_override);
        self.backend.fetch(collection, user_key, validator).await
    }

    /// Decodes a raw stored document into its payload, logging and
    /// rethrowing cipher failures.
    pub(crate) async fn decode_document(
        &self,
        user_key: &str,
        raw: &Value,
    ) -> Result<Value, SyncError> {
        let key = self.key_for(user_key).await;
        envelope::decode_envelope(raw, &key).map_err(|e| {
            error!(user = %crypto::user_tag(user_key), error = %e, "stored document failed to decode");
            e
        })
    }

    async fn build_envelope(&self, user_key: &str, data: &Value) -> Result<Value, SyncError> {
        if self.mode.encryption_enabled() {
            let key = self.key_for(user_key).await;
            envelope::build_envelope(user_key, data, Some(&key))
        } else {
            envelope::build_envelope(user_key, data, None)
        }
    }
}
