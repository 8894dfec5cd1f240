//! Follows a user's workspace and logs change events as they arrive.
//!
//! Usage: `workspace-tail <user-key>` with `WORKSPACE_API_URL` set. Only
//! event kinds and payload sizes are logged, never payload contents.

use anyhow::{Context, Result};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use vitae_sync::{
    crypto, Config, HttpBackend, PollConfig, SessionStore, WorkspaceEvent, WorkspaceStore,
    WorkspaceWatcher,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first (fails on missing required env vars)
    let config = Config::from_env()?;

    // Initialize structured logging
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            // Filter targets use the crate name, underscores included
            EnvFilter::new(format!(
                "{}={}",
                env!("CARGO_PKG_NAME").replace('-', "_"),
                &config.rust_log
            ))
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting workspace-tail v{}", env!("CARGO_PKG_VERSION"));

    let user_key = std::env::args()
        .nth(1)
        .context("usage: workspace-tail <user-key>")?;

    // Local session record, as the browser client would keep in local storage
    let session = SessionStore::from_config(&config);
    info!(session = %session.session_id()?, "session record loaded");

    let backend = HttpBackend::new(&config.base_url)?;
    let store = WorkspaceStore::new(backend, &config);

    let watcher = WorkspaceWatcher::new(store, PollConfig::default());
    let mut subscription = watcher.subscribe(&user_key, None);
    info!(user = %crypto::user_tag(&user_key), "following workspace");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
            event = subscription.recv() => match event {
                Some(WorkspaceEvent::Changed(payload)) => {
                    info!(bytes = payload.to_string().len(), "workspace changed");
                }
                Some(WorkspaceEvent::Deleted) => {
                    info!("workspace deleted");
                }
                Some(WorkspaceEvent::SyncFailed(err)) => {
                    warn!(error = %err, "sync failed, retrying with backoff");
                }
                None => break,
            },
        }
    }

    subscription.unsubscribe().await;
    Ok(())
}
