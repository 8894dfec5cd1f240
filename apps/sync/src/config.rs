use std::path::PathBuf;

use anyhow::{bail, Context, Result};

/// Runtime mode of the embedding application.
/// Development disables envelope encryption so local documents stay inspectable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeMode {
    Development,
    Production,
}

impl RuntimeMode {
    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "development" => Ok(RuntimeMode::Development),
            "production" => Ok(RuntimeMode::Production),
            other => bail!("VITAE_MODE must be 'development' or 'production', got '{other}'"),
        }
    }

    pub fn encryption_enabled(self) -> bool {
        matches!(self, RuntimeMode::Production)
    }
}

/// Sync-engine configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the workspace HTTP API, e.g. `https://api.vitae.app`.
    pub base_url: String,
    /// Optional collection-name override; beats the mode-derived name.
    pub collection: Option<String>,
    pub mode: RuntimeMode,
    /// Location of the local consent/session record.
    pub session_store_path: Option<PathBuf>,
    pub rust_log: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // load .env if present; ignore if missing

        let mode = match std::env::var("VITAE_MODE") {
            Ok(raw) => RuntimeMode::parse(&raw)?,
            Err(_) => RuntimeMode::Production,
        };

        Ok(Config {
            base_url: require_env("WORKSPACE_API_URL")?,
            collection: std::env::var("WORKSPACE_COLLECTION").ok(),
            mode,
            session_store_path: std::env::var("SESSION_STORE_PATH").ok().map(PathBuf::from),
            rust_log: std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
        })
    }
}

fn require_env(key: &str) -> Result<String> {
    std::env::var(key).with_context(|| format!("Required environment variable '{key}' is not set"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_parse_development() {
        assert_eq!(
            RuntimeMode::parse("development").unwrap(),
            RuntimeMode::Development
        );
    }

    #[test]
    fn test_mode_parse_rejects_unknown() {
        assert!(RuntimeMode::parse("staging").is_err());
    }

    #[test]
    fn test_development_disables_encryption() {
        assert!(!RuntimeMode::Development.encryption_enabled());
        assert!(RuntimeMode::Production.encryption_enabled());
    }
}
