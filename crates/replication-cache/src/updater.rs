//! Change-feed-driven cache updater.
//!
//! The updater is the only writer of change-driven cache mutations. Every
//! change is applied to the [`EntryCache`] before its position is reported
//! as processed, so while the updater is connected the cache never lags
//! behind a position it claims to have seen.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use parking_lot::Mutex;
use record_store::record::decode_row;
use serde::Serialize;
use sqlx::PgPool;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::entry_cache::EntryCache;
use crate::feed::{ChangeFeed, ChangeKind, FeedPosition, RowChange};
use crate::pg_feed::PgNotifyFeed;
use crate::settings::StoreSettings;
use crate::{CacheError, Result};

/// Lifecycle state of an updater.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdaterState {
    Stopped,
    Starting,
    Connected,
    Disconnected,
    /// The feed rejected its configuration; no further attempts are made.
    Failed,
}

/// Keeps an [`EntryCache`] in sync with committed writes.
#[async_trait]
pub trait Updater: Send + Sync {
    /// Starts the background task. Starting a running updater is a no-op.
    fn start(&self) -> Result<()>;

    /// Stops the background task and releases the feed subscription.
    ///
    /// Idempotent.
    async fn stop(&self);

    /// Returns true while the background task is alive.
    fn is_running(&self) -> bool;

    /// Returns true while every committed change is being observed.
    fn is_connected(&self) -> bool;

    fn state(&self) -> UpdaterState;

    /// Position of the last change applied to the cache, if tracked.
    fn processed_position(&self) -> Option<FeedPosition> {
        None
    }

    /// When the current subscription was established.
    fn connected_since(&self) -> Option<DateTime<Utc>> {
        None
    }
}

/// State shared between the updater handle and its task.
struct Shared {
    state: watch::Sender<UpdaterState>,
    position: watch::Sender<FeedPosition>,
    connected_since: Mutex<Option<DateTime<Utc>>>,
}

impl Shared {
    fn set_state(&self, state: UpdaterState) {
        if state != UpdaterState::Connected {
            *self.connected_since.lock() = None;
        }
        self.state.send_replace(state);
    }

    fn set_connected(&self) {
        *self.connected_since.lock() = Some(Utc::now());
        self.state.send_replace(UpdaterState::Connected);
    }
}

struct RunningTask {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// [`Updater`] that follows a [`ChangeFeed`].
///
/// On every (re)connect the cache is cleared, since changes committed while
/// no subscription was open were never observed. A lost subscription is
/// retried after the reconnect delay until the updater is stopped.
pub struct ReplicationUpdater {
    cache: Arc<EntryCache>,
    feed: Arc<dyn ChangeFeed>,
    reconnect_delay: Duration,
    shared: Arc<Shared>,
    task: Mutex<Option<RunningTask>>,
}

impl ReplicationUpdater {
    /// Creates an updater bound to `cache`.
    ///
    /// Fails with [`CacheError::Configuration`] when the feed configuration
    /// is invalid.
    pub fn new(
        cache: Arc<EntryCache>,
        feed: Arc<dyn ChangeFeed>,
        reconnect_delay: Duration,
    ) -> Result<Self> {
        feed.validate()?;

        let (state, _) = watch::channel(UpdaterState::Stopped);
        let (position, _) = watch::channel(FeedPosition::zero());

        Ok(Self {
            cache,
            feed,
            reconnect_delay,
            shared: Arc::new(Shared {
                state,
                position,
                connected_since: Mutex::new(None),
            }),
            task: Mutex::new(None),
        })
    }

    /// Returns the cache this updater maintains.
    pub fn cache(&self) -> &Arc<EntryCache> {
        &self.cache
    }

    /// Waits until the updater is connected, up to `timeout`.
    pub async fn wait_until_connected(&self, timeout: Duration) -> bool {
        let mut state = self.shared.state.subscribe();
        let connected = state.wait_for(|s| *s == UpdaterState::Connected);
        matches!(tokio::time::timeout(timeout, connected).await, Ok(Ok(_)))
    }

    /// Waits until the change at `position` has been applied, up to `timeout`.
    pub async fn wait_for_position(&self, position: FeedPosition, timeout: Duration) -> bool {
        let mut processed = self.shared.position.subscribe();
        let reached = processed.wait_for(|p| *p >= position);
        matches!(tokio::time::timeout(timeout, reached).await, Ok(Ok(_)))
    }
}

#[async_trait]
impl Updater for ReplicationUpdater {
    fn start(&self) -> Result<()> {
        let mut task = self.task.lock();
        if task.as_ref().is_some_and(|t| !t.handle.is_finished()) {
            return Ok(());
        }

        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| CacheError::Configuration(format!("no async runtime: {e}")))?;

        let (shutdown, shutdown_rx) = watch::channel(false);
        let worker = Worker {
            cache: Arc::clone(&self.cache),
            feed: Arc::clone(&self.feed),
            reconnect_delay: self.reconnect_delay,
            shared: Arc::clone(&self.shared),
        };

        self.shared.set_state(UpdaterState::Starting);
        let handle = runtime.spawn(worker.run(shutdown_rx));
        *task = Some(RunningTask { shutdown, handle });
        Ok(())
    }

    async fn stop(&self) {
        let running = self.task.lock().take();
        let Some(running) = running else {
            return;
        };

        let _ = running.shutdown.send(true);
        if let Err(e) = running.handle.await {
            tracing::warn!(error = %e, "replication updater task ended abnormally");
        }
        self.shared.set_state(UpdaterState::Stopped);
    }

    fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .is_some_and(|t| !t.handle.is_finished())
    }

    fn is_connected(&self) -> bool {
        *self.shared.state.borrow() == UpdaterState::Connected
    }

    fn state(&self) -> UpdaterState {
        *self.shared.state.borrow()
    }

    fn processed_position(&self) -> Option<FeedPosition> {
        Some(*self.shared.position.borrow())
    }

    fn connected_since(&self) -> Option<DateTime<Utc>> {
        *self.shared.connected_since.lock()
    }
}

impl std::fmt::Debug for ReplicationUpdater {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationUpdater")
            .field("feed", &self.feed.name())
            .field("state", &self.state())
            .finish()
    }
}

enum Outcome {
    Shutdown,
    Lost(CacheError),
}

/// The background task.
struct Worker {
    cache: Arc<EntryCache>,
    feed: Arc<dyn ChangeFeed>,
    reconnect_delay: Duration,
    shared: Arc<Shared>,
}

impl Worker {
    #[tracing::instrument(skip_all, fields(feed = self.feed.name()))]
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!("replication updater started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let outcome = tokio::select! {
                _ = shutdown.changed() => Outcome::Shutdown,
                lost = self.follow() => Outcome::Lost(lost),
            };

            let error = match outcome {
                Outcome::Shutdown => break,
                Outcome::Lost(error) => error,
            };

            if let CacheError::Configuration(_) = error {
                tracing::error!(error = %error, "change feed rejected, updater giving up");
                self.shared.set_state(UpdaterState::Failed);
                return;
            }

            self.shared.set_state(UpdaterState::Disconnected);
            metrics::counter!("replication_cache_reconnects").increment(1);
            tracing::warn!(
                error = %error,
                retry_in_ms = self.reconnect_delay.as_millis() as u64,
                "change feed disconnected"
            );

            let resumed = tokio::select! {
                _ = shutdown.changed() => false,
                () = tokio::time::sleep(self.reconnect_delay) => true,
            };
            if !resumed {
                break;
            }
            self.shared.set_state(UpdaterState::Starting);
        }

        self.shared.set_state(UpdaterState::Stopped);
        tracing::info!("replication updater stopped");
    }

    /// Follows one subscription until it fails. Never returns on success.
    async fn follow(&self) -> CacheError {
        let mut stream = match self.feed.subscribe().await {
            Ok(stream) => stream,
            Err(e) => return e,
        };

        // Anything committed before the subscription opened is unobserved.
        self.cache.invalidate_all();
        self.shared.set_connected();
        tracing::info!("change feed connected");

        while let Some(change) = stream.next().await {
            match change {
                Ok(change) => self.apply(change),
                Err(e) => return e,
            }
        }
        CacheError::Feed("change feed ended".to_string())
    }

    fn apply(&self, change: RowChange) {
        match change.kind {
            ChangeKind::Upsert(row) => {
                let id = row.id;
                match decode_row(row) {
                    Ok(decoded) if !decoded.type_id.is_zero() => {
                        self.cache.put(decoded.id, decoded.into());
                    }
                    Ok(decoded) => {
                        self.cache.remove(&decoded.id);
                    }
                    Err(e) => {
                        tracing::debug!(id = ?id, error = %e, "dropping undecodable change");
                        if let Some(id) = id {
                            self.cache.remove(&id);
                        }
                    }
                }
            }
            ChangeKind::Delete(id) => {
                self.cache.remove(&id);
            }
        }

        self.shared.position.send_replace(change.position);
        metrics::counter!("replication_cache_changes_applied").increment(1);
    }
}

/// Builds updaters for a store during initialization.
pub trait UpdaterFactory: Send + Sync {
    /// Creates an updater bound to `cache`. The store starts it.
    fn create(&self, cache: Arc<EntryCache>, settings: &StoreSettings)
    -> Result<Arc<dyn Updater>>;
}

type FeedBuilder = dyn Fn(&StoreSettings) -> Arc<dyn ChangeFeed> + Send + Sync;

/// Factory producing [`ReplicationUpdater`]s.
pub struct ReplicationUpdaterFactory {
    feed: Box<FeedBuilder>,
}

impl ReplicationUpdaterFactory {
    /// Every updater follows the given feed.
    pub fn new(feed: Arc<dyn ChangeFeed>) -> Self {
        Self {
            feed: Box::new(move |_| Arc::clone(&feed)),
        }
    }

    /// Every updater follows the configured notification channel of the
    /// database behind `pool`.
    pub fn postgres(pool: PgPool) -> Self {
        Self {
            feed: Box::new(move |settings| {
                Arc::new(PgNotifyFeed::new(
                    pool.clone(),
                    settings.replication_channel.clone(),
                ))
            }),
        }
    }
}

impl UpdaterFactory for ReplicationUpdaterFactory {
    fn create(
        &self,
        cache: Arc<EntryCache>,
        settings: &StoreSettings,
    ) -> Result<Arc<dyn Updater>> {
        let feed = (self.feed)(settings);
        let updater = ReplicationUpdater::new(cache, feed, settings.reconnect_delay)?;
        Ok(Arc::new(updater))
    }
}
