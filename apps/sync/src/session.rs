//! Local consent/session record.
//!
//! The browser build of the product keeps a session identifier and consent
//! preferences in local storage; here they live in a small JSON file. Values
//! are wrapped in the same reversible base64 obfuscation the wire envelope
//! uses for its user id: opaque to a casual reader, not encrypted.

use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tracing::debug;
use uuid::Uuid;

use crate::config::Config;

pub const SESSION_KEY: &str = "vitae.session";
pub const CONSENT_KEY: &str = "vitae.consent";

#[derive(Debug, Clone)]
pub struct SessionStore {
    path: PathBuf,
}

impl SessionStore {
    pub fn for_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `$XDG_CONFIG_HOME/vitae/session.json`, falling back to
    /// `~/.config/vitae/session.json`, then to a relative `.vitae/` directory.
    pub fn default_local() -> Self {
        Self::for_path(default_session_path())
    }

    pub fn from_config(config: &Config) -> Self {
        match &config.session_store_path {
            Some(path) => Self::for_path(path),
            None => Self::default_local(),
        }
    }

    /// Durable session identifier; generated and persisted on first use.
    pub fn session_id(&self) -> Result<String> {
        let mut record = self.read_record()?;
        if let Some(encoded) = record.get(SESSION_KEY) {
            return decode_value(encoded);
        }

        let id = Uuid::new_v4().to_string();
        record.insert(SESSION_KEY.to_string(), encode_value(&id));
        self.write_record(&record)?;
        debug!(path = %self.path.display(), "created new session record");
        Ok(id)
    }

    /// `None` until the user has answered the consent prompt.
    pub fn consent(&self) -> Result<Option<bool>> {
        let record = self.read_record()?;
        let Some(encoded) = record.get(CONSENT_KEY) else {
            return Ok(None);
        };
        let raw = decode_value(encoded)?;
        raw.parse::<bool>()
            .map(Some)
            .with_context(|| format!("consent record holds non-boolean value '{raw}'"))
    }

    pub fn set_consent(&self, granted: bool) -> Result<()> {
        let mut record = self.read_record()?;
        record.insert(CONSENT_KEY.to_string(), encode_value(&granted.to_string()));
        self.write_record(&record)
    }

    fn read_record(&self) -> Result<BTreeMap<String, String>> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }
        let raw = fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read session record at {}", self.path.display()))?;
        if raw.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        serde_json::from_str(&raw)
            .with_context(|| format!("session record at {} is not valid JSON", self.path.display()))
    }

    fn write_record(&self, record: &BTreeMap<String, String>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let serialized =
            serde_json::to_vec_pretty(record).context("session record serialization failed")?;
        atomic_write(&self.path, &serialized)
            .with_context(|| format!("failed to write session record at {}", self.path.display()))
    }
}

fn default_session_path() -> PathBuf {
    if let Ok(xdg_config_home) = env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg_config_home)
            .join("vitae")
            .join("session.json");
    }
    if let Ok(home) = env::var("HOME") {
        return PathBuf::from(home)
            .join(".config")
            .join("vitae")
            .join("session.json");
    }
    PathBuf::from(".vitae").join("session.json")
}

fn encode_value(raw: &str) -> String {
    BASE64.encode(raw.as_bytes())
}

fn decode_value(encoded: &str) -> Result<String> {
    let bytes = BASE64
        .decode(encoded.as_bytes())
        .context("session value is not valid base64")?;
    String::from_utf8(bytes).context("session value is not UTF-8")
}

/// Write-then-rename so a crash cannot leave a half-written record.
fn atomic_write(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let mut tmp = path.to_path_buf();
    tmp.set_extension("tmp");
    fs::write(&tmp, data)?;
    fs::rename(tmp, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_session_id_is_stable_across_instances() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("session.json");

        let first = SessionStore::for_path(&path).session_id().unwrap();
        let second = SessionStore::for_path(&path).session_id().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_consent_round_trips_without_plaintext_in_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("session.json");
        let store = SessionStore::for_path(&path);

        assert_eq!(store.consent().unwrap(), None);

        store.set_consent(true).unwrap();
        assert_eq!(store.consent().unwrap(), Some(true));

        // Values are wrapped, never stored verbatim.
        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(!raw.contains("true"));

        store.set_consent(false).unwrap();
        assert_eq!(store.consent().unwrap(), Some(false));
    }

    #[test]
    fn test_consent_updates_keep_session_id() {
        let dir = tempdir().unwrap();
        let store = SessionStore::for_path(dir.path().join("session.json"));

        let id = store.session_id().unwrap();
        store.set_consent(true).unwrap();
        assert_eq!(store.session_id().unwrap(), id);
    }

    #[test]
    fn test_missing_record_reads_as_empty() {
        let dir = tempdir().unwrap();
        let store = SessionStore::for_path(dir.path().join("absent.json"));
        assert_eq!(store.consent().unwrap(), None);
    }

    #[test]
    fn test_nested_store_path_is_created() {
        let dir = tempdir().unwrap();
        let store = SessionStore::for_path(dir.path().join("deep").join("session.json"));
        assert!(!store.session_id().unwrap().is_empty());
    }
}
