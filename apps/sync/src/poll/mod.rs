//! Adaptive workspace poll scheduler.
//!
//! Each subscription runs its own poll loop against the remote store. The
//! loop starts at the minimum interval and adapts to what it observes:
//!
//! * unchanged document → interval grows by a fixed linear step
//! * workspace missing → interval grows by x1.5
//! * transport or decode failure → interval doubles
//! * content changed → interval snaps back to the minimum
//!
//! Every interval is capped at the configured maximum and stretched by a
//! small random jitter so a fleet of clients does not fall into lockstep
//! against the API. A hidden workspace tab polls nothing at all; flipping
//! back to visible forces an immediate poll. Dropping or unsubscribing a
//! [`Subscription`] stops the loop at once, abandoning any request still in
//! flight.

use std::time::Duration;

use rand::Rng;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::crypto;
use crate::errors::SyncError;
use crate::remote::{FetchOutcome, WorkspaceStore};

/// Growth factor applied while the workspace does not exist yet.
const MISSING_BACKOFF_FACTOR: f64 = 1.5;
/// Growth factor applied after a failed poll.
const ERROR_BACKOFF_FACTOR: f64 = 2.0;

/// Tuning knobs for the poll loop.
#[derive(Debug, Clone, Copy)]
pub struct PollConfig {
    /// Interval used right after a change and as the floor for all waits.
    pub min_interval: Duration,
    /// Hard ceiling for every computed interval.
    pub max_interval: Duration,
    /// Linear step added while the document exists but does not change.
    pub backoff_step: Duration,
    /// Jitter fraction; each wait is scaled by a factor drawn uniformly
    /// from `[1 - jitter, 1 + jitter]`.
    pub jitter: f64,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_secs(5),
            max_interval: Duration::from_secs(60),
            backoff_step: Duration::from_secs(2),
            jitter: 0.1,
        }
    }
}

impl PollConfig {
    fn grow_linear(&self, current: Duration) -> Duration {
        (current + self.backoff_step).min(self.max_interval)
    }

    fn grow_scaled(&self, current: Duration, factor: f64) -> Duration {
        current.mul_f64(factor).min(self.max_interval)
    }
}

/// Whether the surface owning the subscriptions is currently on screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Visible,
    Hidden,
}

/// What a subscription observes about its workspace document.
#[derive(Debug)]
pub enum WorkspaceEvent {
    /// The decoded payload differs from the last one delivered. Also fired
    /// once for the initial state when the workspace exists at subscribe
    /// time.
    Changed(Value),
    /// A previously observed workspace no longer exists.
    Deleted,
    /// A poll failed; the loop keeps retrying with a doubled interval.
    SyncFailed(SyncError),
}

/// Spawns and coordinates poll loops for workspace subscriptions.
///
/// One watcher serves any number of subscriptions; they share the store and
/// the visibility signal but poll independently.
pub struct WorkspaceWatcher {
    store: WorkspaceStore,
    config: PollConfig,
    visibility: watch::Sender<Visibility>,
}

impl WorkspaceWatcher {
    pub fn new(store: WorkspaceStore, config: PollConfig) -> Self {
        let (visibility, _) = watch::channel(Visibility::Visible);
        Self {
            store,
            config,
            visibility,
        }
    }

    /// Mirrors the host surface's visibility into every poll loop. The wake
    /// is unconditional: announcing `Visible` forces an immediate poll even
    /// when the tab was already visible.
    pub fn set_visibility(&self, visibility: Visibility) {
        self.visibility.send_replace(visibility);
    }

    /// Starts polling the workspace for `user_key`. The first poll fires
    /// immediately. Must be called from within a tokio runtime.
    pub fn subscribe(&self, user_key: &str, collection_override: Option<&str>) -> Subscription {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = PollTask {
            store: self.store.clone(),
            user_key: user_key.to_string(),
            tag: crypto::user_tag(user_key),
            collection_override: collection_override.map(String::from),
            config: self.config,
            events: events_tx,
            visibility: self.visibility.subscribe(),
            visibility_attached: true,
            shutdown: shutdown_rx,
        };
        debug!(user = %task.tag, "starting workspace poll loop");

        Subscription {
            events: events_rx,
            shutdown: shutdown_tx,
            task: Some(tokio::spawn(task.run())),
        }
    }
}

/// Live poll loop handle. Dropping it stops the loop.
pub struct Subscription {
    events: mpsc::UnboundedReceiver<WorkspaceEvent>,
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    /// Next event, or `None` once the loop has stopped.
    pub async fn recv(&mut self) -> Option<WorkspaceEvent> {
        self.events.recv().await
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Option<WorkspaceEvent> {
        self.events.try_recv().ok()
    }

    /// Stops the poll loop and waits for it to wind down. A request still in
    /// flight is abandoned; no event is delivered for it.
    pub async fn unsubscribe(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

/// Per-subscription scheduler state.
struct PollSession {
    interval: Duration,
    last_hash: Option<String>,
    validator: Option<String>,
}

/// Classified result of one poll, ready to be applied to the session.
enum PollStep {
    NotModified,
    Unchanged { validator: Option<String> },
    Fresh {
        payload: Value,
        hash: String,
        validator: Option<String>,
    },
    Missing,
    Failed(SyncError),
}

enum WaitOutcome {
    Elapsed,
    Woken,
    Shutdown,
}

struct PollTask {
    store: WorkspaceStore,
    user_key: String,
    tag: String,
    collection_override: Option<String>,
    config: PollConfig,
    events: mpsc::UnboundedSender<WorkspaceEvent>,
    visibility: watch::Receiver<Visibility>,
    visibility_attached: bool,
    shutdown: watch::Receiver<bool>,
}

impl PollTask {
    async fn run(mut self) {
        let mut session = PollSession {
            interval: self.config.min_interval,
            last_hash: None,
            validator: None,
        };

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            // A hidden tab issues no requests. The wait still wakes on
            // visibility changes, so flipping back to visible polls at once.
            if *self.visibility.borrow() == Visibility::Hidden {
                match self.wait(self.config.min_interval).await {
                    WaitOutcome::Shutdown => break,
                    WaitOutcome::Elapsed | WaitOutcome::Woken => continue,
                }
            }

            let Some(step) = self.poll_once(&session).await else {
                break;
            };
            if !self.apply(step, &mut session) {
                break;
            }

            match self.wait(session.interval).await {
                WaitOutcome::Shutdown => break,
                WaitOutcome::Elapsed | WaitOutcome::Woken => {}
            }
        }

        debug!(user = %self.tag, "workspace poll loop stopped");
    }

    /// One conditional fetch. `None` means shutdown fired while the request
    /// was in flight and the loop must exit without emitting anything.
    async fn poll_once(&mut self, session: &PollSession) -> Option<PollStep> {
        let outcome = tokio::select! {
            biased;
            _ = self.shutdown.changed() => return None,
            outcome = self.store.fetch_conditional(
                &self.user_key,
                self.collection_override.as_deref(),
                session.validator.as_deref(),
            ) => outcome,
        };

        let step = match outcome {
            Ok(FetchOutcome::NotModified) => PollStep::NotModified,
            Ok(FetchOutcome::Missing) => PollStep::Missing,
            Ok(FetchOutcome::Document { raw, validator }) => {
                match self.store.decode_document(&self.user_key, &raw).await {
                    Ok(payload) => {
                        let hash = content_hash(&payload);
                        if session.last_hash.as_deref() == Some(hash.as_str()) {
                            PollStep::Unchanged { validator }
                        } else {
                            PollStep::Fresh {
                                payload,
                                hash,
                                validator,
                            }
                        }
                    }
                    Err(e) => PollStep::Failed(e),
                }
            }
            Err(e) => PollStep::Failed(e),
        };
        Some(step)
    }

    /// Folds a poll result into the session and emits events. Returns false
    /// once the subscriber is gone.
    fn apply(&self, step: PollStep, session: &mut PollSession) -> bool {
        match step {
            PollStep::NotModified => {
                session.interval = self.config.grow_linear(session.interval);
                true
            }
            // A fresh envelope around identical content: keep quiet, but
            // adopt the new validator so the server can answer 304 again.
            PollStep::Unchanged { validator } => {
                session.validator = validator;
                session.interval = self.config.grow_linear(session.interval);
                true
            }
            PollStep::Fresh {
                payload,
                hash,
                validator,
            } => {
                debug!(user = %self.tag, "workspace changed");
                session.last_hash = Some(hash);
                session.validator = validator;
                session.interval = self.config.min_interval;
                self.events.send(WorkspaceEvent::Changed(payload)).is_ok()
            }
            PollStep::Missing => {
                let vanished = session.last_hash.take().is_some();
                session.validator = None;
                session.interval = self
                    .config
                    .grow_scaled(session.interval, MISSING_BACKOFF_FACTOR);
                if vanished {
                    debug!(user = %self.tag, "workspace disappeared");
                    self.events.send(WorkspaceEvent::Deleted).is_ok()
                } else {
                    true
                }
            }
            PollStep::Failed(err) => {
                warn!(user = %self.tag, error = %err, "workspace poll failed");
                session.interval = self
                    .config
                    .grow_scaled(session.interval, ERROR_BACKOFF_FACTOR);
                self.events.send(WorkspaceEvent::SyncFailed(err)).is_ok()
            }
        }
    }

    /// Sleeps for the jittered interval, waking early on shutdown or on a
    /// visibility announcement.
    async fn wait(&mut self, base: Duration) -> WaitOutcome {
        let timer = tokio::time::sleep(jittered(base, self.config.jitter));
        tokio::pin!(timer);

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.changed() => return WaitOutcome::Shutdown,
                changed = self.visibility.changed(), if self.visibility_attached => {
                    match changed {
                        Ok(()) => return WaitOutcome::Woken,
                        // The watcher is gone; no further wakes can arrive.
                        Err(_) => self.visibility_attached = false,
                    }
                }
                _ = &mut timer => return WaitOutcome::Elapsed,
            }
        }
    }
}

/// ThreadRng is not Send, so the factor is sampled before any await.
fn jittered(base: Duration, jitter: f64) -> Duration {
    if jitter <= 0.0 {
        return base;
    }
    let factor = rand::thread_rng().gen_range(1.0 - jitter..=1.0 + jitter);
    base.mul_f64(factor)
}

/// Change detection runs on decoded payloads, so runtime metadata stamped
/// into the stored envelope does not count as a change.
fn content_hash(payload: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, RuntimeMode};
    use crate::remote::memory::MemoryBackend;
    use serde_json::json;
    use std::sync::Arc;
    use tokio::time::{sleep, Instant};

    fn test_config() -> PollConfig {
        // Deterministic timings; jitter gets its own test.
        PollConfig {
            jitter: 0.0,
            ..PollConfig::default()
        }
    }

    fn make_watcher() -> (Arc<MemoryBackend>, WorkspaceStore, WorkspaceWatcher) {
        let backend = MemoryBackend::new();
        let config = Config {
            base_url: "http://localhost:8080".to_string(),
            collection: Some("test".to_string()),
            mode: RuntimeMode::Production,
            session_store_path: None,
            rust_log: "info".to_string(),
        };
        let store = WorkspaceStore::new(backend.clone(), &config);
        let watcher = WorkspaceWatcher::new(store.clone(), test_config());
        (backend, store, watcher)
    }

    async fn expect_changed(sub: &mut Subscription) -> Value {
        match sub.recv().await {
            Some(WorkspaceEvent::Changed(payload)) => payload,
            other => panic!("expected Changed, got {other:?}"),
        }
    }

    #[test]
    fn test_interval_growth_is_capped() {
        let config = test_config();

        assert_eq!(
            config.grow_linear(Duration::from_secs(5)),
            Duration::from_secs(7)
        );
        assert_eq!(
            config.grow_linear(Duration::from_secs(59)),
            Duration::from_secs(60)
        );
        assert_eq!(
            config.grow_linear(Duration::from_secs(60)),
            Duration::from_secs(60)
        );

        assert_eq!(
            config.grow_scaled(Duration::from_secs(5), MISSING_BACKOFF_FACTOR),
            Duration::from_millis(7_500)
        );
        assert_eq!(
            config.grow_scaled(Duration::from_secs(40), ERROR_BACKOFF_FACTOR),
            Duration::from_secs(60)
        );
    }

    #[test]
    fn test_jitter_keeps_waits_near_base() {
        let base = Duration::from_secs(10);
        for _ in 0..200 {
            let jittered = jittered(base, 0.1);
            assert!(jittered >= Duration::from_secs(9));
            assert!(jittered <= Duration::from_secs(11));
        }
        assert_eq!(jittered(base, 0.0), base);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_backs_off_linearly_and_resets_on_change() {
        let (backend, store, watcher) = make_watcher();
        store
            .upsert("alice", None, &json!({"summary": "v1"}))
            .await
            .unwrap();

        let start = Instant::now();
        let mut sub = watcher.subscribe("alice", None);

        let first = expect_changed(&mut sub).await;
        assert_eq!(first["summary"], "v1");
        assert_eq!(start.elapsed(), Duration::ZERO);

        // Unchanged polls at 5s, 12s and 21s grow the interval to 7s, 9s
        // and 11s.
        sleep(Duration::from_secs(25)).await;
        assert_eq!(backend.fetch_count().await, 4);

        store
            .upsert("alice", None, &json!({"summary": "v2"}))
            .await
            .unwrap();

        let second = expect_changed(&mut sub).await;
        assert_eq!(second["summary"], "v2");
        assert_eq!(start.elapsed(), Duration::from_secs(32));

        // The change snapped the interval back to the minimum.
        sleep(Duration::from_millis(5_100)).await;
        assert_eq!(backend.fetch_count().await, 6);

        sub.unsubscribe().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_workspace_backs_off_by_half_steps() {
        let (backend, store, watcher) = make_watcher();

        let start = Instant::now();
        let mut sub = watcher.subscribe("alice", None);

        // 404s at 0s, 7.5s and 18.75s; the interval grows by x1.5 each time
        // and no event fires for a workspace that never existed.
        sleep(Duration::from_secs(20)).await;
        assert_eq!(backend.fetch_count().await, 3);
        assert!(sub.try_recv().is_none());

        store
            .upsert("alice", None, &json!({"summary": "fresh"}))
            .await
            .unwrap();

        let payload = expect_changed(&mut sub).await;
        assert_eq!(payload["summary"], "fresh");
        assert_eq!(start.elapsed(), Duration::from_millis(35_625));

        sub.unsubscribe().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_vanished_workspace_emits_deleted_once() {
        let (_backend, store, watcher) = make_watcher();
        store
            .upsert("alice", None, &json!({"summary": "v1"}))
            .await
            .unwrap();

        let start = Instant::now();
        let mut sub = watcher.subscribe("alice", None);
        expect_changed(&mut sub).await;

        store.delete("alice", None).await.unwrap();

        match sub.recv().await {
            Some(WorkspaceEvent::Deleted) => {}
            other => panic!("expected Deleted, got {other:?}"),
        }
        assert_eq!(start.elapsed(), Duration::from_secs(5));

        // Still missing at 12.5s; Deleted is not repeated.
        sleep(Duration::from_secs(10)).await;
        assert!(sub.try_recv().is_none());

        sub.unsubscribe().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_double_interval_and_emit_sync_failed() {
        let (backend, store, watcher) = make_watcher();
        backend.fail_requests(true).await;

        let start = Instant::now();
        let mut sub = watcher.subscribe("alice", None);

        // Failures at 0s, 10s, 30s, 70s and 130s: the interval doubles from
        // 5s and caps at 60s.
        for expected in [0u64, 10, 30, 70, 130] {
            match sub.recv().await {
                Some(WorkspaceEvent::SyncFailed(SyncError::Transport { .. })) => {}
                other => panic!("expected SyncFailed, got {other:?}"),
            }
            assert_eq!(start.elapsed(), Duration::from_secs(expected));
        }

        backend.fail_requests(false).await;
        store
            .upsert("alice", None, &json!({"summary": "back"}))
            .await
            .unwrap();

        let payload = expect_changed(&mut sub).await;
        assert_eq!(payload["summary"], "back");
        assert_eq!(start.elapsed(), Duration::from_secs(190));

        sub.unsubscribe().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_rewrite_with_same_content_is_unchanged() {
        let (backend, store, watcher) = make_watcher();
        let data = json!({"summary": "stable"});
        store.upsert("alice", None, &data).await.unwrap();

        let mut sub = watcher.subscribe("alice", None);
        expect_changed(&mut sub).await;

        // Rewriting the same payload produces a fresh envelope (new nonce,
        // new validator) that decodes to identical content.
        store.upsert("alice", None, &data).await.unwrap();

        // The 5s poll sees a full document whose hash matches, so no event.
        // The 12s poll gets a 304 against the refreshed validator.
        sleep(Duration::from_secs(13)).await;
        assert_eq!(backend.fetch_count().await, 3);
        assert!(sub.try_recv().is_none());

        sub.unsubscribe().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_undecodable_document_reports_sync_failed() {
        let (backend, store, watcher) = make_watcher();
        backend
            .seed_document(
                "test",
                "alice",
                json!({
                    "encryptedPayload": "bm90LXJlYWwtY2lwaGVydGV4dA",
                    "encryptionType": "AES-GCM",
                    "encryptionMode": "encrypted",
                    "lastAction": "update",
                }),
            )
            .await;

        let start = Instant::now();
        let mut sub = watcher.subscribe("alice", None);

        match sub.recv().await {
            Some(WorkspaceEvent::SyncFailed(SyncError::Decryption(_))) => {}
            other => panic!("expected SyncFailed, got {other:?}"),
        }
        assert_eq!(start.elapsed(), Duration::ZERO);

        // Overwriting with a well-formed document recovers at the doubled
        // interval.
        store
            .upsert("alice", None, &json!({"summary": "repaired"}))
            .await
            .unwrap();

        let payload = expect_changed(&mut sub).await;
        assert_eq!(payload["summary"], "repaired");
        assert_eq!(start.elapsed(), Duration::from_secs(10));

        sub.unsubscribe().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_hidden_subscription_never_polls() {
        let (backend, store, watcher) = make_watcher();
        store
            .upsert("alice", None, &json!({"summary": "v1"}))
            .await
            .unwrap();
        watcher.set_visibility(Visibility::Hidden);

        let start = Instant::now();
        let mut sub = watcher.subscribe("alice", None);

        sleep(Duration::from_secs(30)).await;
        assert_eq!(backend.fetch_count().await, 0);
        assert!(sub.try_recv().is_none());

        watcher.set_visibility(Visibility::Visible);

        let payload = expect_changed(&mut sub).await;
        assert_eq!(payload["summary"], "v1");
        assert_eq!(start.elapsed(), Duration::from_secs(30));

        sub.unsubscribe().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_visibility_wake_polls_immediately() {
        let (backend, store, watcher) = make_watcher();
        store
            .upsert("alice", None, &json!({"summary": "v1"}))
            .await
            .unwrap();

        let mut sub = watcher.subscribe("alice", None);
        expect_changed(&mut sub).await;
        assert_eq!(backend.fetch_count().await, 1);

        sleep(Duration::from_secs(1)).await;
        // Re-announcing an already-visible tab still forces a poll.
        watcher.set_visibility(Visibility::Visible);

        sleep(Duration::from_millis(100)).await;
        assert_eq!(backend.fetch_count().await, 2);

        // That early poll was unchanged, so the next lands 7s after it.
        sleep(Duration::from_secs(7)).await;
        assert_eq!(backend.fetch_count().await, 3);

        sub.unsubscribe().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsubscribe_cancels_inflight_fetch() {
        let (backend, store, watcher) = make_watcher();
        store
            .upsert("alice", None, &json!({"summary": "v1"}))
            .await
            .unwrap();
        backend.set_fetch_delay(Duration::from_secs(10)).await;

        let start = Instant::now();
        let mut sub = watcher.subscribe("alice", None);

        sleep(Duration::from_secs(1)).await;
        assert!(sub.try_recv().is_none());

        // The first fetch still has 9s to go; unsubscribe must not wait for
        // it.
        sub.unsubscribe().await;
        assert_eq!(start.elapsed(), Duration::from_secs(1));
        assert_eq!(backend.fetch_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_subscription_stops_polling() {
        let (backend, store, watcher) = make_watcher();
        store
            .upsert("alice", None, &json!({"summary": "v1"}))
            .await
            .unwrap();

        let mut sub = watcher.subscribe("alice", None);
        expect_changed(&mut sub).await;
        drop(sub);

        sleep(Duration::from_secs(30)).await;
        assert_eq!(backend.fetch_count().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscriptions_poll_independently() {
        let (_backend, store, watcher) = make_watcher();
        store
            .upsert("alice", None, &json!({"owner": "alice"}))
            .await
            .unwrap();
        store
            .upsert("bob", None, &json!({"owner": "bob"}))
            .await
            .unwrap();

        let mut alice = watcher.subscribe("alice", None);
        let mut bob = watcher.subscribe("bob", None);

        assert_eq!(expect_changed(&mut alice).await["owner"], "alice");
        assert_eq!(expect_changed(&mut bob).await["owner"], "bob");

        alice.unsubscribe().await;
        bob.unsubscribe().await;
    }
}
