//! Shared live preference feed

use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;

use super::StoreInner;
use crate::config::Preferences;
use crate::error::StoreError;

/// Value carried by the live feed
#[derive(Debug, Clone, PartialEq)]
pub enum FeedItem {
    /// Initial load from storage still running
    Loading,
    Ready(Arc<Preferences>),
    /// Storage failed in a way the feed cannot recover from
    Failed(String),
}

/// Bookkeeping for the single shared feed of a store.
#[derive(Debug, Default)]
pub(super) struct FeedSlot {
    pub(super) sender: Option<Arc<watch::Sender<FeedItem>>>,
    pub(super) subscribers: usize,
    /// Bumped on every attach and on every last detach; a grace timer only
    /// closes the feed if the epoch it captured is still current.
    pub(super) idle_epoch: u64,
}

/// Attach a subscriber, opening the feed (and kicking off its load) if needed.
pub(super) fn attach(inner: &Arc<StoreInner>) -> PreferenceFeed {
    let mut slot = inner.feed.lock();
    slot.subscribers += 1;
    slot.idle_epoch = slot.idle_epoch.wrapping_add(1);

    let sender = match &slot.sender {
        Some(sender) => sender.clone(),
        None => {
            let (tx, _) = watch::channel(FeedItem::Loading);
            let tx = Arc::new(tx);
            slot.sender = Some(tx.clone());
            tracing::debug!("Opening preference feed");
            tokio::spawn(load(inner.clone(), tx.clone()));
            tx
        }
    };

    PreferenceFeed {
        rx: sender.subscribe(),
        store: inner.clone(),
        replayed: false,
        finished: false,
    }
}

async fn load(inner: Arc<StoreInner>, tx: Arc<watch::Sender<FeedItem>>) {
    let storage = inner.storage.clone();
    let item = match tokio::task::spawn_blocking(move || storage.load()).await {
        Ok(Ok(prefs)) => FeedItem::Ready(Arc::new(prefs)),
        Ok(Err(e)) if e.is_recoverable() => {
            tracing::warn!("Failed to read preferences, using defaults: {}", e);
            FeedItem::Ready(Arc::new(Preferences::default()))
        }
        Ok(Err(e)) => {
            tracing::error!("Preference storage failed: {}", e);
            FeedItem::Failed(e.to_string())
        }
        Err(e) => {
            tracing::error!("Preference load task failed: {}", e);
            FeedItem::Failed(e.to_string())
        }
    };

    // An edit that finished while loading already published a newer record.
    tx.send_if_modified(move |current| {
        if matches!(current, FeedItem::Loading) {
            *current = item;
            true
        } else {
            false
        }
    });
}

fn detach(inner: &Arc<StoreInner>) {
    let mut slot = inner.feed.lock();
    slot.subscribers = slot.subscribers.saturating_sub(1);
    if slot.subscribers > 0 {
        return;
    }

    slot.idle_epoch = slot.idle_epoch.wrapping_add(1);
    let epoch = slot.idle_epoch;
    let grace = inner.grace_period;

    match tokio::runtime::Handle::try_current() {
        Ok(handle) if !grace.is_zero() => {
            handle.spawn(close_after(Arc::downgrade(inner), epoch, grace));
        }
        _ => {
            slot.sender = None;
            tracing::debug!("Preference feed closed");
        }
    }
}

async fn close_after(inner: Weak<StoreInner>, epoch: u64, grace: Duration) {
    tokio::time::sleep(grace).await;
    let Some(inner) = inner.upgrade() else {
        return;
    };
    let mut slot = inner.feed.lock();
    if slot.subscribers == 0 && slot.idle_epoch == epoch {
        slot.sender = None;
        tracing::debug!("Preference feed closed after {:?} idle", grace);
    }
}

/// One subscription to the store's live preferences.
///
/// The first [`next`](Self::next) yields the most recent record (waiting for
/// the initial load if it is still running); later calls yield each
/// successful edit.
pub struct PreferenceFeed {
    rx: watch::Receiver<FeedItem>,
    store: Arc<StoreInner>,
    replayed: bool,
    finished: bool,
}

impl PreferenceFeed {
    /// Next record. A storage failure is yielded once as an error, after
    /// which the feed is finished and returns `None`.
    pub async fn next(&mut self) -> Option<Result<Arc<Preferences>, StoreError>> {
        loop {
            if self.finished {
                return None;
            }

            let item = if !self.replayed {
                self.replayed = true;
                match self
                    .rx
                    .wait_for(|item| !matches!(item, FeedItem::Loading))
                    .await
                {
                    Ok(item) => item.clone(),
                    Err(_) => {
                        self.finished = true;
                        return None;
                    }
                }
            } else {
                if self.rx.changed().await.is_err() {
                    self.finished = true;
                    return None;
                }
                self.rx.borrow_and_update().clone()
            };

            match item {
                FeedItem::Loading => continue,
                FeedItem::Ready(prefs) => return Some(Ok(prefs)),
                FeedItem::Failed(reason) => {
                    self.finished = true;
                    return Some(Err(StoreError::FeedFailed(reason)));
                }
            }
        }
    }

    /// Latest value without waiting
    pub fn current(&self) -> FeedItem {
        self.rx.borrow().clone()
    }
}

impl Drop for PreferenceFeed {
    fn drop(&mut self) {
        detach(&self.store);
    }
}
