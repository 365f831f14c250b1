//! Live change-feed fan-out.
//!
//! Wraps the document store's live subscription (future changes only) and
//! fans each change out to registered callbacks. Callbacks are held as weak
//! references: unsubscription is simply dropping the handle. For each change
//! the callbacks run sequentially and are awaited in order; a failing
//! callback is logged and never prevents the rest from running, and never
//! stops the feed itself.

use crate::store::{ChangeRecord, DocumentStore};
use futures::future::BoxFuture;
use std::sync::{Arc, Weak};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Async callback invoked for every change.
pub type ChangeCallback =
    dyn Fn(ChangeRecord) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync;

/// Handle keeping a callback subscribed; dropping it unsubscribes.
pub type CallbackHandle = Arc<ChangeCallback>;

/// Fans out live document changes to weak-referenced listeners.
pub struct ChangeManager {
    store: Arc<dyn DocumentStore>,
    callbacks: Arc<Mutex<Vec<Weak<ChangeCallback>>>>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl ChangeManager {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            store,
            callbacks: Arc::new(Mutex::new(Vec::new())),
            watcher: Mutex::new(None),
        }
    }

    /// Register a callback for future changes. The returned handle is the
    /// subscription: dropping it unsubscribes (best-effort, collected on the
    /// next dispatch).
    pub async fn add_callback<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(ChangeRecord) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync + 'static,
    {
        let handle: CallbackHandle = Arc::new(callback);
        self.callbacks
            .lock()
            .await
            .push(Arc::downgrade(&handle));
        handle
    }

    /// Start watching the live feed. Idempotent: an already-running watcher
    /// is left alone.
    pub async fn start_watch(&self) {
        let mut watcher = self.watcher.lock().await;
        if watcher.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }

        let mut rx = self.store.live_changes();
        let callbacks = self.callbacks.clone();
        *watcher = Some(tokio::spawn(async move {
            loop {
                let change = match rx.recv().await {
                    Ok(change) => change,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "change feed lagged, continuing");
                        continue;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                };

                // Prune dead subscriptions, then dispatch sequentially in
                // registration order.
                let live: Vec<CallbackHandle> = {
                    let mut list = callbacks.lock().await;
                    list.retain(|weak| weak.strong_count() > 0);
                    list.iter().filter_map(Weak::upgrade).collect()
                };
                for callback in live {
                    if let Err(e) = callback(change.clone()).await {
                        warn!(id = %change.id, error = %e, "change callback failed");
                    }
                }
            }
            debug!("change feed watcher stopped");
        }));
    }

    /// Stop watching. Idempotent; leaves no dangling subscription.
    pub async fn teardown(&self) {
        if let Some(handle) = self.watcher.lock().await.take() {
            handle.abort();
        }
    }

    /// Tear down and start a fresh watch over the feed.
    pub async fn restart_watch(&self) {
        self.teardown().await;
        self.start_watch().await;
    }
}
