//! Per-key serialized task queues.
//!
//! Operations tagged with the same string key (`"file:" + path`,
//! `"journal-sync"`, ...) run strictly one at a time; different keys run
//! fully concurrently. `run_skip_duplicated` coalesces repeated triggers of
//! the same key into the run already in flight.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Registry of per-key serialization locks.
#[derive(Default)]
pub struct KeyedQueue {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    running: Mutex<HashSet<String>>,
}

impl KeyedQueue {
    pub fn new() -> Self {
        Self::default()
    }

    async fn lock_for(&self, key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn release(&self, key: &str, lock: &Arc<Mutex<()>>) {
        let mut locks = self.locks.lock().await;
        // Drop the registry entry once nobody else holds a handle.
        if Arc::strong_count(lock) == 2 {
            locks.remove(key);
        }
    }

    /// Run `task` serialized against everything else under `key`.
    pub async fn run<F, Fut, T>(&self, key: &str, task: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let lock = self.lock_for(key).await;
        let guard = lock.lock().await;
        let result = task().await;
        drop(guard);
        self.release(key, &lock).await;
        result
    }

    /// Like [`run`](Self::run), but returns `None` immediately if a task
    /// under `key` is already queued or running.
    pub async fn run_skip_duplicated<F, Fut, T>(&self, key: &str, task: F) -> Option<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        {
            let mut running = self.running.lock().await;
            if !running.insert(key.to_string()) {
                return None;
            }
        }
        let result = self.run(key, task).await;
        self.running.lock().await.remove(key);
        Some(result)
    }
}
