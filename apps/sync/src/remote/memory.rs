//! In-memory workspace backend for tests and offline development.
//!
//! Mirrors the HTTP backend's observable behavior without any I/O. Each
//! stored document carries a monotonic revision that doubles as the cache
//! validator. Tests can inject transport failures or slow responses and
//! count the fetches a poll loop actually performs.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

use super::{FetchOutcome, WorkspaceBackend};
use crate::errors::SyncError;

type DocKey = (String, String);
type ChildKey = (String, String, String, String);

struct StoredDocument {
    value: Value,
    revision: u64,
}

#[derive(Default)]
struct Inner {
    documents: HashMap<DocKey, StoredDocument>,
    children: HashMap<ChildKey, Value>,
    next_revision: u64,
    fail_requests: bool,
    fetch_delay: Option<Duration>,
    fetches: u64,
}

impl Inner {
    fn bump_revision(&mut self) -> u64 {
        self.next_revision += 1;
        self.next_revision
    }

    fn check_available(&self) -> Result<(), SyncError> {
        if self.fail_requests {
            return Err(SyncError::Transport {
                message: "injected transport failure".to_string(),
            });
        }
        Ok(())
    }
}

/// Deterministic [`WorkspaceBackend`] holding documents in memory.
#[derive(Default)]
pub struct MemoryBackend {
    inner: Mutex<Inner>,
}

impl MemoryBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Makes every subsequent operation fail with a transport error.
    pub async fn fail_requests(&self, fail: bool) {
        self.inner.lock().await.fail_requests = fail;
    }

    /// Holds every fetch in flight for `delay` before it reaches the store,
    /// so cancellation can race it.
    pub async fn set_fetch_delay(&self, delay: Duration) {
        self.inner.lock().await.fetch_delay = Some(delay);
    }

    /// Number of fetches that reached the store. A fetch cancelled while the
    /// injected delay was pending is not counted.
    pub async fn fetch_count(&self) -> u64 {
        self.inner.lock().await.fetches
    }

    /// Inserts a raw document, bypassing the envelope codec. Lets tests seed
    /// legacy or corrupted shapes.
    pub async fn seed_document(&self, collection: &str, user_key: &str, raw: Value) {
        let mut inner = self.inner.lock().await;
        let revision = inner.bump_revision();
        inner.documents.insert(
            doc_key(collection, user_key),
            StoredDocument {
                value: raw,
                revision,
            },
        );
    }

    /// Raw stored workspace document, envelope included.
    pub async fn document(&self, collection: &str, user_key: &str) -> Option<Value> {
        self.inner
            .lock()
            .await
            .documents
            .get(&doc_key(collection, user_key))
            .map(|doc| doc.value.clone())
    }

    /// Raw stored child document.
    pub async fn child_document(
        &self,
        collection: &str,
        user_key: &str,
        child_collection: &str,
        child_id: &str,
    ) -> Option<Value> {
        self.inner
            .lock()
            .await
            .children
            .get(&child_key(collection, user_key, child_collection, child_id))
            .cloned()
    }
}

fn doc_key(collection: &str, user_key: &str) -> DocKey {
    (collection.to_string(), user_key.to_string())
}

fn child_key(
    collection: &str,
    user_key: &str,
    child_collection: &str,
    child_id: &str,
) -> ChildKey {
    (
        collection.to_string(),
        user_key.to_string(),
        child_collection.to_string(),
        child_id.to_string(),
    )
}

#[async_trait]
impl WorkspaceBackend for MemoryBackend {
    async fn fetch(
        &self,
        collection: &str,
        user_key: &str,
        validator: Option<&str>,
    ) -> Result<FetchOutcome, SyncError> {
        let delay = self.inner.lock().await.fetch_delay;
        if let Some(delay) = delay {
            // Sleep outside the lock so writes can land meanwhile.
            tokio::time::sleep(delay).await;
        }

        let mut inner = self.inner.lock().await;
        inner.fetches += 1;
        inner.check_available()?;

        match inner.documents.get(&doc_key(collection, user_key)) {
            None => Ok(FetchOutcome::Missing),
            Some(doc) => {
                let current = format!("rev-{}", doc.revision);
                if validator == Some(current.as_str()) {
                    Ok(FetchOutcome::NotModified)
                } else {
                    Ok(FetchOutcome::Document {
                        raw: doc.value.clone(),
                        validator: Some(current),
                    })
                }
            }
        }
    }

    async fn store(
        &self,
        collection: &str,
        user_key: &str,
        envelope: &Value,
    ) -> Result<(), SyncError> {
        let mut inner = self.inner.lock().await;
        inner.check_available()?;
        let revision = inner.bump_revision();
        inner.documents.insert(
            doc_key(collection, user_key),
            StoredDocument {
                value: envelope.clone(),
                revision,
            },
        );
        Ok(())
    }

    async fn remove(&self, collection: &str, user_key: &str) -> Result<(), SyncError> {
        let mut inner = self.inner.lock().await;
        inner.check_available()?;
        inner.documents.remove(&doc_key(collection, user_key));
        Ok(())
    }

    async fn fetch_child(
        &self,
        collection: &str,
        user_key: &str,
        child_collection: &str,
        child_id: &str,
    ) -> Result<Option<Value>, SyncError> {
        let inner = self.inner.lock().await;
        inner.check_available()?;
        Ok(inner
            .children
            .get(&child_key(collection, user_key, child_collection, child_id))
            .cloned())
    }

    async fn store_child(
        &self,
        collection: &str,
        user_key: &str,
        child_collection: &str,
        child_id: &str,
        envelope: &Value,
        merge: bool,
    ) -> Result<(), SyncError> {
        let mut inner = self.inner.lock().await;
        inner.check_available()?;

        let key = child_key(collection, user_key, child_collection, child_id);
        let merged = merge
            && match (inner.children.get_mut(&key), envelope) {
                (Some(Value::Object(existing)), Value::Object(incoming)) => {
                    for (field, value) in incoming {
                        existing.insert(field.clone(), value.clone());
                    }
                    true
                }
                _ => false,
            };
        if !merged {
            inner.children.insert(key, envelope.clone());
        }
        Ok(())
    }

    async fn remove_child(
        &self,
        collection: &str,
        user_key: &str,
        child_collection: &str,
        child_id: &str,
    ) -> Result<(), SyncError> {
        let mut inner = self.inner.lock().await;
        inner.check_available()?;
        inner
            .children
            .remove(&child_key(collection, user_key, child_collection, child_id));
        Ok(())
    }
}
