//! HTTP workspace backend over the remote workspace API.
//!
//! Verbs map one-to-one onto the API surface: conditional reads are `GET`
//! with `If-Modified-Since`, writes go through `POST` and `DELETE`. Child
//! documents hang off `/child/{collection}/{id}` with an optional merge
//! flag. Status codes are translated into domain outcomes here: a 404 read
//! is a logical "no workspace yet" and a 304 a validator hit, so nothing of
//! the HTTP layer leaks upward.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{IF_MODIFIED_SINCE, LAST_MODIFIED};
use reqwest::{Client, StatusCode, Url};
use serde_json::Value;

use super::{FetchOutcome, WorkspaceBackend};
use crate::errors::SyncError;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Production [`WorkspaceBackend`] speaking to the workspace HTTP API.
pub struct HttpBackend {
    client: Client,
    base: Url,
}

impl HttpBackend {
    pub fn new(base_url: &str) -> Result<Arc<Self>, SyncError> {
        let base = Url::parse(base_url).map_err(|e| SyncError::Transport {
            message: format!("invalid workspace API base URL: {e}"),
        })?;
        if base.cannot_be_a_base() {
            return Err(SyncError::Transport {
                message: format!("workspace API base URL '{base}' cannot carry path segments"),
            });
        }

        Ok(Arc::new(Self {
            client: Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .expect("Failed to build HTTP client"),
            base,
        }))
    }

    /// `{base}/workspaces/{userKey}?collectionOverride=…`. The user key is
    /// percent-encoded as a single path segment, so slashes in a key cannot
    /// escape into the route.
    fn workspace_url(&self, collection: &str, user_key: &str) -> Url {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .expect("base URL validated at construction")
            .pop_if_empty()
            .push("workspaces")
            .push(user_key);
        url.query_pairs_mut()
            .append_pair("collectionOverride", collection);
        url
    }

    fn child_url(
        &self,
        collection: &str,
        user_key: &str,
        child_collection: &str,
        child_id: &str,
        merge: bool,
    ) -> Url {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .expect("base URL validated at construction")
            .pop_if_empty()
            .push("workspaces")
            .push(user_key)
            .push("child")
            .push(child_collection)
            .push(child_id);
        url.query_pairs_mut()
            .append_pair("collectionOverride", collection);
        if merge {
            url.query_pairs_mut().append_pair("merge", "true");
        }
        url
    }
}

fn write_outcome(status: StatusCode) -> Result<(), SyncError> {
    if status.is_success() {
        Ok(())
    } else {
        Err(SyncError::Http {
            status: status.as_u16(),
        })
    }
}

#[async_trait]
impl WorkspaceBackend for HttpBackend {
    async fn fetch(
        &self,
        collection: &str,
        user_key: &str,
        validator: Option<&str>,
    ) -> Result<FetchOutcome, SyncError> {
        let mut request = self.client.get(self.workspace_url(collection, user_key));
        if let Some(validator) = validator {
            request = request.header(IF_MODIFIED_SINCE, validator);
        }
        let response = request.send().await?;

        let status = response.status();
        match status {
            StatusCode::NOT_MODIFIED => Ok(FetchOutcome::NotModified),
            StatusCode::NOT_FOUND => Ok(FetchOutcome::Missing),
            s if s.is_success() => {
                let validator = response
                    .headers()
                    .get(LAST_MODIFIED)
                    .and_then(|value| value.to_str().ok())
                    .map(String::from);
                let raw: Value = response.json().await?;
                Ok(FetchOutcome::Document { raw, validator })
            }
            s => Err(SyncError::Http {
                status: s.as_u16(),
            }),
        }
    }

    async fn store(
        &self,
        collection: &str,
        user_key: &str,
        envelope: &Value,
    ) -> Result<(), SyncError> {
        let response = self
            .client
            .post(self.workspace_url(collection, user_key))
            .json(envelope)
            .send()
            .await?;
        write_outcome(response.status())
    }

    async fn remove(&self, collection: &str, user_key: &str) -> Result<(), SyncError> {
        let response = self
            .client
            .delete(self.workspace_url(collection, user_key))
            .send()
            .await?;
        write_outcome(response.status())
    }

    async fn fetch_child(
        &self,
        collection: &str,
        user_key: &str,
        child_collection: &str,
        child_id: &str,
    ) -> Result<Option<Value>, SyncError> {
        let url = self.child_url(collection, user_key, child_collection, child_id, false);
        let response = self.client.get(url).send().await?;

        let status = response.status();
        match status {
            StatusCode::NOT_FOUND => Ok(None),
            s if s.is_success() => Ok(Some(response.json().await?)),
            s => Err(SyncError::Http {
                status: s.as_u16(),
            }),
        }
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
        let url = self.child_url(collection, user_key, child_collection, child_id, merge);
        let response = self.client.post(url).json(envelope).send().await?;
        write_outcome(response.status())
    }

    async fn remove_child(
        &self,
        collection: &str,
        user_key: &str,
        child_collection: &str,
        child_id: &str,
    ) -> Result<(), SyncError> {
        let url = self.child_url(collection, user_key, child_collection, child_id, false);
        let response = self.client.delete(url).send().await?;
        write_outcome(response.status())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workspace_url_shape() {
        let backend = HttpBackend::new("https://api.vitae.app").unwrap();
        let url = backend.workspace_url("workspaces", "alice");

        assert_eq!(
            url.as_str(),
            "https://api.vitae.app/workspaces/alice?collectionOverride=workspaces"
        );
    }

    #[test]
    fn test_workspace_url_encodes_user_key_as_one_segment() {
        let backend = HttpBackend::new("https://api.vitae.app").unwrap();
        let url = backend.workspace_url("workspaces", "alice/../bob");

        assert_eq!(url.path(), "/workspaces/alice%2F..%2Fbob");
    }

    #[test]
    fn test_base_url_path_prefix_is_preserved() {
        let backend = HttpBackend::new("https://api.vitae.app/v1/").unwrap();
        let url = backend.workspace_url("workspaces", "alice");

        assert_eq!(url.path(), "/v1/workspaces/alice");
    }

    #[test]
    fn test_child_url_carries_merge_flag_only_when_set() {
        let backend = HttpBackend::new("https://api.vitae.app").unwrap();

        let merged = backend.child_url("workspaces", "alice", "steps", "s1", true);
        assert_eq!(merged.path(), "/workspaces/alice/child/steps/s1");
        assert_eq!(merged.query(), Some("collectionOverride=workspaces&merge=true"));

        let replaced = backend.child_url("workspaces", "alice", "steps", "s1", false);
        assert_eq!(replaced.query(), Some("collectionOverride=workspaces"));
    }

    #[test]
    fn test_rejects_unusable_base_urls() {
        assert!(matches!(
            HttpBackend::new("not a url"),
            Err(SyncError::Transport { .. })
        ));
        assert!(matches!(
            HttpBackend::new("mailto:alice@example.com"),
            Err(SyncError::Transport { .. })
        ));
    }
}
