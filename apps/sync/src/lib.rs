//! Client-side workspace synchronization for the Vitae CV builder.
//!
//! A user's working document (the "workspace") lives on a remote HTTP API.
//! This crate keeps a local consumer in step with it:
//!
//! * [`crypto`] derives a per-user AES-256-GCM key from the user's secret
//!   and encrypts/decrypts workspace payloads.
//! * [`envelope`] wraps payloads in the wire envelope (sanitization,
//!   metadata stamping, encrypted/plain/legacy formats).
//! * [`remote`] talks to the API: [`WorkspaceStore`] over a pluggable
//!   [`WorkspaceBackend`], with [`HttpBackend`] for production and
//!   [`MemoryBackend`] as a deterministic test double.
//! * [`poll`] watches a workspace for changes with an adaptive,
//!   visibility-aware poll loop and delivers [`WorkspaceEvent`]s.
//!
//! ```no_run
//! use vitae_sync::{
//!     Config, HttpBackend, PollConfig, WorkspaceEvent, WorkspaceStore, WorkspaceWatcher,
//! };
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = Config::from_env()?;
//! let backend = HttpBackend::new(&config.base_url)?;
//! let store = WorkspaceStore::new(backend, &config);
//!
//! let watcher = WorkspaceWatcher::new(store, PollConfig::default());
//! let mut subscription = watcher.subscribe("user-key", None);
//! while let Some(event) = subscription.recv().await {
//!     match event {
//!         WorkspaceEvent::Changed(payload) => println!("{} bytes", payload.to_string().len()),
//!         WorkspaceEvent::Deleted => break,
//!         WorkspaceEvent::SyncFailed(err) => eprintln!("sync failed: {err}"),
//!     }
//! }
//! subscription.unsubscribe().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod crypto;
pub mod envelope;
pub mod errors;
pub mod poll;
pub mod remote;
pub mod session;

pub use config::{Config, RuntimeMode};
pub use errors::SyncError;
pub use poll::{PollConfig, Subscription, Visibility, WorkspaceEvent, WorkspaceWatcher};
pub use remote::http::HttpBackend;
pub use remote::memory::MemoryBackend;
pub use remote::{FetchOutcome, WorkspaceBackend, WorkspaceStore};
pub use session::SessionStore;
