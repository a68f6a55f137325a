//! Config store: persisted preferences with transactional edits and a
//! shared live feed
//!
//! Edits are pure `Preferences -> Preferences` mutations applied through the
//! storage backend's atomic update, one at a time. I/O failures are retried
//! with exponential backoff; on final failure the persisted record is left
//! as it was. Every successful edit is published once to the live feed.

mod feed;
pub mod storage;

pub use feed::{FeedItem, PreferenceFeed};
pub use storage::{FileStorage, MemoryStorage, PreferenceStorage};

use chrono::Utc;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

use crate::config::Preferences;
use crate::constants::{
    FEED_GRACE_PERIOD, STORE_RETRY_BASE_DELAY, STORE_RETRY_MAX_DELAY, STORE_WRITE_ATTEMPTS,
};
use crate::error::{StorageError, StoreError};
use feed::FeedSlot;

/// Backoff schedule for failed writes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: STORE_WRITE_ATTEMPTS,
            base_delay: STORE_RETRY_BASE_DELAY,
            max_delay: STORE_RETRY_MAX_DELAY,
        }
    }
}

impl RetryPolicy {
    /// Delay after failed attempt `n` (0-based): `base * 2^n`, capped.
    pub fn delay_for(&self, n: u32) -> Duration {
        let factor = 2u32.saturating_pow(n);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreOptions {
    pub retry: RetryPolicy,
    /// How long the live feed stays open after its last subscriber leaves
    pub grace_period: Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            grace_period: FEED_GRACE_PERIOD,
        }
    }
}

/// Outcome of [`ConfigStore::edit`]
#[derive(Debug)]
pub enum EditResult {
    Success(Arc<Preferences>),
    FailWrite(StoreError),
}

impl EditResult {
    pub fn is_success(&self) -> bool {
        matches!(self, EditResult::Success(_))
    }

    pub fn preferences(&self) -> Option<&Arc<Preferences>> {
        match self {
            EditResult::Success(prefs) => Some(prefs),
            EditResult::FailWrite(_) => None,
        }
    }
}

pub(crate) struct StoreInner {
    storage: Arc<dyn PreferenceStorage>,
    retry: RetryPolicy,
    grace_period: Duration,
    write_lock: tokio::sync::Mutex<()>,
    feed: Mutex<FeedSlot>,
}

impl StoreInner {
    fn publish(&self, prefs: Arc<Preferences>) {
        let slot = self.feed.lock();
        if let Some(sender) = &slot.sender {
            sender.send_replace(FeedItem::Ready(prefs));
        }
    }
}

/// Handle to the preference store. Cheap to clone; clones share the feed
/// and the edit queue.
#[derive(Clone)]
pub struct ConfigStore {
    inner: Arc<StoreInner>,
}

impl ConfigStore {
    pub fn new(storage: impl PreferenceStorage) -> Self {
        Self::with_options(Arc::new(storage), StoreOptions::default())
    }

    pub fn with_options(storage: Arc<dyn PreferenceStorage>, options: StoreOptions) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                storage,
                retry: options.retry,
                grace_period: options.grace_period,
                write_lock: tokio::sync::Mutex::new(()),
                feed: Mutex::new(FeedSlot::default()),
            }),
        }
    }

    /// File storage at the platform default location, or volatile storage
    /// when no home directory can be determined.
    pub fn open_default() -> Self {
        match FileStorage::default_location() {
            Some(path) => {
                tracing::info!("Preferences file: {}", path.display());
                Self::new(FileStorage::new(path))
            }
            None => {
                tracing::warn!("No config directory available, preferences will not persist");
                Self::new(MemoryStorage::default())
            }
        }
    }

    /// Subscribe to the live preferences. Must be called within a Tokio
    /// runtime: the first subscriber of an active period triggers one load
    /// from storage.
    pub fn read(&self) -> PreferenceFeed {
        feed::attach(&self.inner)
    }

    /// Current record, through the shared feed
    pub async fn snapshot(&self) -> Result<Arc<Preferences>, StoreError> {
        let mut feed = self.read();
        feed.next()
            .await
            .unwrap_or_else(|| Err(StoreError::FeedFailed("feed closed".into())))
    }

    /// Whether the live feed is currently open
    pub fn feed_active(&self) -> bool {
        self.inner.feed.lock().sender.is_some()
    }

    /// Apply `mutation` to the persisted record.
    ///
    /// Concurrent edits are applied one at a time, each against the latest
    /// persisted record. I/O errors are retried per the store's
    /// [`RetryPolicy`]; any other storage error fails immediately.
    pub async fn edit<F>(&self, mutation: F) -> EditResult
    where
        F: Fn(&Preferences) -> Preferences + Send + Sync + 'static,
    {
        let _serial = self.inner.write_lock.lock().await;

        let stamped = Arc::new(move |current: &Preferences| {
            let mut next = mutation(current);
            next.updated_at = Some(Utc::now());
            next
        });

        let policy = self.inner.retry;
        let attempts = policy.attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let storage = self.inner.storage.clone();
            let apply = stamped.clone();

            match tokio::task::spawn_blocking(move || storage.update(&*apply)).await {
                Ok(Ok(prefs)) => {
                    let prefs = Arc::new(prefs);
                    self.inner.publish(prefs.clone());
                    tracing::info!("Preferences saved ({} -> {})", prefs.protocol, prefs.host);
                    return EditResult::Success(prefs);
                }
                Ok(Err(StorageError::Io(e))) if attempt < attempts => {
                    let delay = policy.delay_for(attempt - 1);
                    tracing::warn!(
                        "Preference write attempt {}/{} failed: {}; retrying in {:?}",
                        attempt,
                        attempts,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Ok(Err(last)) => {
                    tracing::error!("Preference write failed after {} attempts: {}", attempt, last);
                    return EditResult::FailWrite(StoreError::WriteFailed {
                        attempts: attempt,
                        last,
                    });
                }
                Err(e) => {
                    return EditResult::FailWrite(StoreError::Task(e.to_string()));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StreamProtocol;
    use std::io;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Memory storage that fails the first `fail_writes` updates with an I/O
    /// error and counts loads.
    struct FlakyStorage {
        inner: MemoryStorage,
        fail_writes: AtomicU32,
        loads: AtomicU32,
        updates: AtomicU32,
        load_error: Mutex<Option<StorageError>>,
    }

    impl FlakyStorage {
        fn new(fail_writes: u32) -> Self {
            Self {
                inner: MemoryStorage::default(),
                fail_writes: AtomicU32::new(fail_writes),
                loads: AtomicU32::new(0),
                updates: AtomicU32::new(0),
                load_error: Mutex::new(None),
            }
        }

        fn failing_load(error: StorageError) -> Self {
            let storage = Self::new(0);
            *storage.load_error.lock() = Some(error);
            storage
        }
    }

    impl PreferenceStorage for FlakyStorage {
        fn load(&self) -> Result<Preferences, StorageError> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            if let Some(e) = self.load_error.lock().take() {
                return Err(e);
            }
            self.inner.load()
        }

        fn update(
            &self,
            transform: &(dyn Fn(&Preferences) -> Preferences + Send + Sync),
        ) -> Result<Preferences, StorageError> {
            self.updates.fetch_add(1, Ordering::SeqCst);
            let remaining = self.fail_writes.load(Ordering::SeqCst);
            if remaining > 0 {
                self.fail_writes.store(remaining - 1, Ordering::SeqCst);
                return Err(io::Error::new(io::ErrorKind::Other, "disk full").into());
            }
            self.inner.update(transform)
        }
    }

    fn fast_options(grace: Duration) -> StoreOptions {
        StoreOptions {
            retry: RetryPolicy {
                attempts: 3,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
            },
            grace_period: grace,
        }
    }

    fn store(storage: &Arc<FlakyStorage>, grace: Duration) -> ConfigStore {
        ConfigStore::with_options(storage.clone(), fast_options(grace))
    }

    fn set_host(host: &'static str) -> impl Fn(&Preferences) -> Preferences + Send + Sync {
        move |p: &Preferences| Preferences {
            protocol: StreamProtocol::Tcp,
            host: host.to_string(),
            ..p.clone()
        }
    }

    #[test]
    fn test_retry_delay_doubles_and_caps() {
        let policy = RetryPolicy {
            attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for(40), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn test_edit_fails_after_three_io_errors() {
        let storage = Arc::new(FlakyStorage::new(3));
        let store = store(&storage, Duration::ZERO);
        let before = store.snapshot().await.unwrap();

        let result = store.edit(set_host("10.0.0.9")).await;
        match result {
            EditResult::FailWrite(StoreError::WriteFailed { attempts, last }) => {
                assert_eq!(attempts, 3);
                assert!(matches!(last, StorageError::Io(_)));
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(storage.updates.load(Ordering::SeqCst), 3);
        assert_eq!(store.snapshot().await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_edit_succeeds_on_second_attempt_and_emits_once() {
        let storage = Arc::new(FlakyStorage::new(1));
        let store = store(&storage, Duration::from_secs(5));

        let mut feed = store.read();
        let initial = feed.next().await.unwrap().unwrap();
        assert_eq!(*initial, Preferences::default());

        let result = store.edit(set_host("10.0.0.9")).await;
        assert!(result.is_success());
        let saved = result.preferences().unwrap().clone();
        assert_eq!(saved.host, "10.0.0.9");
        assert!(saved.updated_at.is_some());
        assert_eq!(storage.updates.load(Ordering::SeqCst), 2);

        let emitted = feed.next().await.unwrap().unwrap();
        assert_eq!(emitted, saved);

        let extra = tokio::time::timeout(Duration::from_millis(50), feed.next()).await;
        assert!(extra.is_err(), "edit must be published exactly once");
    }

    #[tokio::test]
    async fn test_non_io_write_error_is_not_retried() {
        struct CorruptStorage;

        impl PreferenceStorage for CorruptStorage {
            fn load(&self) -> Result<Preferences, StorageError> {
                Ok(Preferences::default())
            }

            fn update(
                &self,
                _transform: &(dyn Fn(&Preferences) -> Preferences + Send + Sync),
            ) -> Result<Preferences, StorageError> {
                Err(StorageError::Corrupt("bad record".into()))
            }
        }

        let store = ConfigStore::with_options(Arc::new(CorruptStorage), fast_options(Duration::ZERO));
        match store.edit(set_host("h")).await {
            EditResult::FailWrite(StoreError::WriteFailed { attempts, .. }) => assert_eq!(attempts, 1),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_edits_are_serialized() {
        let storage = Arc::new(FlakyStorage::new(0));
        let store = store(&storage, Duration::ZERO);

        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .edit(|p| Preferences {
                        host: format!("{}x", p.host),
                        ..p.clone()
                    })
                    .await
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().is_success());
        }

        let prefs = store.snapshot().await.unwrap();
        assert_eq!(prefs.host.len(), Preferences::default().host.len() + 16);
    }

    #[tokio::test]
    async fn test_feed_replays_latest_to_new_subscriber() {
        let storage = Arc::new(FlakyStorage::new(0));
        let store = store(&storage, Duration::from_secs(5));

        let mut first = store.read();
        first.next().await.unwrap().unwrap();
        assert!(store.edit(set_host("192.0.2.1")).await.is_success());

        let mut second = store.read();
        let replayed = second.next().await.unwrap().unwrap();
        assert_eq!(replayed.host, "192.0.2.1");
        assert_eq!(storage.loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_feed_survives_grace_window_then_closes() {
        let storage = Arc::new(FlakyStorage::new(0));
        let store = store(&storage, Duration::from_millis(100));

        let mut feed = store.read();
        feed.next().await.unwrap().unwrap();
        drop(feed);
        assert!(store.feed_active());

        // resubscribing inside the window reuses the open feed
        tokio::time::sleep(Duration::from_millis(20)).await;
        let mut feed = store.read();
        feed.next().await.unwrap().unwrap();
        assert_eq!(storage.loads.load(Ordering::SeqCst), 1);
        drop(feed);

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(!store.feed_active());

        let mut feed = store.read();
        feed.next().await.unwrap().unwrap();
        assert_eq!(storage.loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_recoverable_read_error_emits_defaults() {
        let storage = Arc::new(FlakyStorage::failing_load(StorageError::Corrupt("garbage".into())));
        let store = store(&storage, Duration::ZERO);

        let prefs = store.snapshot().await.unwrap();
        assert_eq!(*prefs, Preferences::default());
    }

    #[tokio::test]
    async fn test_fatal_read_error_fails_feed() {
        let storage = Arc::new(FlakyStorage::failing_load(StorageError::Other("locked".into())));
        let store = store(&storage, Duration::from_secs(5));

        let mut feed = store.read();
        assert!(matches!(feed.next().await, Some(Err(StoreError::FeedFailed(_)))));
        assert!(feed.next().await.is_none());
        assert!(matches!(feed.current(), FeedItem::Failed(_)));
    }

    #[tokio::test]
    async fn test_file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prefs.toml");
        let store = ConfigStore::new(FileStorage::new(&path));

        let result = store.edit(set_host("relay.example.net")).await;
        assert!(result.is_success());

        let reopened = ConfigStore::new(FileStorage::new(&path));
        let prefs = reopened.snapshot().await.unwrap();
        assert_eq!(prefs.host, "relay.example.net");
        assert_eq!(prefs.protocol, StreamProtocol::Tcp);
    }

    #[tokio::test]
    async fn test_edit_recovers_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prefs.toml");
        std::fs::write(&path, "host = \"unterminated").unwrap();
        let store = ConfigStore::new(FileStorage::new(&path));

        // readers fall back to defaults
        assert_eq!(*store.snapshot().await.unwrap(), Preferences::default());

        let result = store.edit(set_host("repaired.example.net")).await;
        assert!(result.is_success());

        let reopened = ConfigStore::new(FileStorage::new(&path));
        let prefs = reopened.snapshot().await.unwrap();
        assert_eq!(prefs.host, "repaired.example.net");
        assert_eq!(prefs.protocol, StreamProtocol::Tcp);
    }
}
