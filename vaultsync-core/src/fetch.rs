//! On-demand remote chunk fetching.
//!
//! Listens for the chunk store's "missing chunks" events, deduplicates the
//! ids into a queue and drains it in capped batches against the active
//! replicator. Batch size, minimum inter-request interval and concurrency
//! are all settings-driven; the interval is measured start-to-start so slow
//! bulk backends with aggressive rate limits are respected even when
//! concurrency slots are free.

use crate::chunk_store::{ChunkStore, WriteOptions};
use crate::config::VaultSettings;
use crate::document::{ChunkDoc, DocumentId};
use async_trait::async_trait;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, Notify, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

/// A remote capable of serving chunk requests.
#[async_trait]
pub trait Replicator: Send + Sync {
    /// Fetch the chunks for `ids`; ids unknown to the remote are simply
    /// absent from the result.
    async fn fetch_remote_chunks(&self, ids: &[DocumentId]) -> anyhow::Result<Vec<ChunkDoc>>;
}

#[derive(Default)]
struct FetchQueue {
    pending: VecDeque<DocumentId>,
    queued: HashSet<DocumentId>,
}

impl FetchQueue {
    fn enqueue(&mut self, ids: Vec<DocumentId>) -> usize {
        let mut added = 0;
        for id in ids {
            if self.queued.insert(id.clone()) {
                self.pending.push_back(id);
                added += 1;
            }
        }
        added
    }

    fn take_batch(&mut self, max: usize) -> Vec<DocumentId> {
        let take = self.pending.len().min(max);
        let batch: Vec<_> = self.pending.drain(..take).collect();
        for id in &batch {
            self.queued.remove(id);
        }
        batch
    }

    fn requeue_front(&mut self, ids: Vec<DocumentId>) {
        for id in ids.into_iter().rev() {
            if self.queued.insert(id.clone()) {
                self.pending.push_front(id);
            }
        }
    }
}

/// Batches and paces remote requests for locally-missing chunks.
pub struct ChunkFetcher {
    chunks: Arc<ChunkStore>,
    replicator: Arc<RwLock<Option<Arc<dyn Replicator>>>>,
    queue: Arc<Mutex<FetchQueue>>,
    work: Arc<Notify>,
    semaphore: Arc<Semaphore>,
    last_start: Arc<Mutex<Option<Instant>>>,
    stopped: Arc<AtomicBool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    batch_size: usize,
    interval: Duration,
}

impl ChunkFetcher {
    pub fn new(chunks: Arc<ChunkStore>, settings: &VaultSettings) -> Self {
        Self {
            chunks,
            replicator: Arc::new(RwLock::new(None)),
            queue: Arc::new(Mutex::new(FetchQueue::default())),
            work: Arc::new(Notify::new()),
            semaphore: Arc::new(Semaphore::new(settings.fetch_concurrency.max(1))),
            last_start: Arc::new(Mutex::new(None)),
            stopped: Arc::new(AtomicBool::new(false)),
            tasks: Mutex::new(Vec::new()),
            batch_size: settings.fetch_batch_size.max(1),
            interval: Duration::from_millis(settings.fetch_interval_ms),
        }
    }

    /// Install (or replace) the active replicator and wake the queue.
    pub async fn set_replicator(&self, replicator: Arc<dyn Replicator>) {
        *self.replicator.write().await = Some(replicator);
        self.work.notify_one();
    }

    /// Start the listener and drain tasks.
    pub async fn start(&self) {
        let mut tasks = self.tasks.lock().await;
        if !tasks.is_empty() {
            return;
        }

        // Listener: missing-chunk announcements feed the dedup queue.
        let mut missing_rx = self.chunks.subscribe_missing();
        let queue = self.queue.clone();
        let work = self.work.clone();
        let stopped = self.stopped.clone();
        tasks.push(tokio::spawn(async move {
            while let Ok(ids) = missing_rx.recv().await {
                if stopped.load(Ordering::SeqCst) {
                    break;
                }
                let added = queue.lock().await.enqueue(ids);
                if added > 0 {
                    work.notify_one();
                }
            }
        }));

        // Drain loop: paced, bounded-concurrency batch requests.
        let chunks = self.chunks.clone();
        let replicator = self.replicator.clone();
        let queue = self.queue.clone();
        let work = self.work.clone();
        let semaphore = self.semaphore.clone();
        let last_start = self.last_start.clone();
        let stopped = self.stopped.clone();
        let batch_size = self.batch_size;
        let interval = self.interval;
        tasks.push(tokio::spawn(async move {
            loop {
                if stopped.load(Ordering::SeqCst) {
                    break;
                }
                let batch = queue.lock().await.take_batch(batch_size);
                if batch.is_empty() {
                    work.notified().await;
                    continue;
                }

                let Some(active) = replicator.read().await.clone() else {
                    // Soft failure: leave the ids queued until a replicator
                    // becomes available; waiters time out upstream.
                    warn!(ids = batch.len(), "no active replicator for chunk fetch");
                    queue.lock().await.requeue_front(batch);
                    work.notified().await;
                    continue;
                };

                // Minimum wall-clock spacing between request starts.
                let wait = {
                    let last = last_start.lock().await;
                    last.map(|t| (t + interval).saturating_duration_since(Instant::now()))
                        .unwrap_or(Duration::ZERO)
                };
                if !wait.is_zero() {
                    tokio::time::sleep(wait).await;
                }
                *last_start.lock().await = Some(Instant::now());

                let Ok(permit) = semaphore.clone().acquire_owned().await else {
                    break;
                };
                let chunks = chunks.clone();
                tokio::spawn(async move {
                    process_batch(&chunks, active.as_ref(), batch).await;
                    drop(permit);
                });
            }
        }));
    }

    /// Stop both tasks. Idempotent.
    pub async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.work.notify_waiters();
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
    }
}

async fn process_batch(chunks: &ChunkStore, replicator: &dyn Replicator, ids: Vec<DocumentId>) {
    match replicator.fetch_remote_chunks(&ids).await {
        Ok(fetched) => {
            debug!(requested = ids.len(), fetched = fetched.len(), "remote chunk batch");
            // Known-good content from the remote: forced write, no cache check.
            let write = chunks
                .write(fetched.clone(), &WriteOptions { force: true }, "fetch")
                .await;
            if let Err(e) = write {
                warn!(error = %e, "failed to store fetched chunks");
                for id in &ids {
                    chunks.note_chunk_missing(id).await;
                }
                return;
            }
            let returned: HashSet<_> = fetched.iter().map(|c| c.id.clone()).collect();
            for chunk in fetched {
                chunks.note_chunk_fetched(chunk).await;
            }
            for id in ids.iter().filter(|id| !returned.contains(*id)) {
                chunks.note_chunk_missing(id).await;
            }
        }
        Err(e) => {
            warn!(error = %e, ids = ids.len(), "remote chunk fetch failed");
            for id in &ids {
                chunks.note_chunk_missing(id).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk_store::ReadOptions;
    use crate::hash::ChunkHasher;
    use crate::store::{DocumentStore, MemoryDocStore};

    struct MockRemote {
        chunks: std::collections::HashMap<DocumentId, ChunkDoc>,
        calls: Mutex<Vec<(Instant, Vec<DocumentId>)>>,
    }

    impl MockRemote {
        fn new(data: &[&str]) -> Self {
            let hasher = ChunkHasher::new(&VaultSettings::default());
            let chunks = data
                .iter()
                .map(|d| {
                    let id = hasher.compute(d);
                    (id.clone(), ChunkDoc::new(id, *d))
                })
                .collect();
            Self {
                chunks,
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Replicator for MockRemote {
        async fn fetch_remote_chunks(&self, ids: &[DocumentId]) -> anyhow::Result<Vec<ChunkDoc>> {
            self.calls.lock().await.push((Instant::now(), ids.to_vec()));
            Ok(ids
                .iter()
                .filter_map(|id| self.chunks.get(id).cloned())
                .collect())
        }
    }

    fn settings_fast() -> VaultSettings {
        VaultSettings {
            fetch_interval_ms: 10,
            fetch_batch_size: 2,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn fetches_missing_chunks_and_resolves_read() {
        let store = Arc::new(MemoryDocStore::new());
        let settings = settings_fast();
        let chunks = Arc::new(ChunkStore::new(store.clone(), &settings));
        let fetcher = ChunkFetcher::new(chunks.clone(), &settings);

        let remote = Arc::new(MockRemote::new(&["remote content"]));
        fetcher.set_replicator(remote.clone()).await;
        fetcher.start().await;

        let id = ChunkHasher::new(&settings).compute("remote content");
        let result = chunks
            .read(
                std::slice::from_ref(&id),
                &ReadOptions {
                    timeout: Duration::from_millis(2000),
                    ..Default::default()
                },
                None,
            )
            .await
            .unwrap();
        assert_eq!(result[0].as_ref().unwrap().data, "remote content");

        // The fetched chunk was persisted locally too.
        assert!(store.get(&id).await.unwrap().is_some());
        fetcher.stop().await;
    }

    #[tokio::test]
    async fn unknown_ids_resolve_to_missing() {
        let store = Arc::new(MemoryDocStore::new());
        let settings = settings_fast();
        let chunks = Arc::new(ChunkStore::new(store, &settings));
        let fetcher = ChunkFetcher::new(chunks.clone(), &settings);
        fetcher.set_replicator(Arc::new(MockRemote::new(&[]))).await;
        fetcher.start().await;

        let started = Instant::now();
        let result = chunks
            .read(
                &[DocumentId::new("h:unknown")],
                &ReadOptions {
                    timeout: Duration::from_millis(2000),
                    ..Default::default()
                },
                None,
            )
            .await
            .unwrap();
        assert_eq!(result, vec![None]);
        // Resolved by the missing-on-remote event, not the timeout.
        assert!(started.elapsed() < Duration::from_millis(1500));
        fetcher.stop().await;
    }

    #[tokio::test]
    async fn requests_are_paced_by_minimum_interval() {
        let store = Arc::new(MemoryDocStore::new());
        let settings = VaultSettings {
            fetch_interval_ms: 80,
            fetch_batch_size: 1,
            ..Default::default()
        };
        let chunks = Arc::new(ChunkStore::new(store, &settings));
        let fetcher = ChunkFetcher::new(chunks.clone(), &settings);
        let remote = Arc::new(MockRemote::new(&["one", "two"]));
        fetcher.set_replicator(remote.clone()).await;
        fetcher.start().await;

        let hasher = ChunkHasher::new(&settings);
        let ids = [hasher.compute("one"), hasher.compute("two")];
        let read = chunks
            .read(
                &ids,
                &ReadOptions {
                    timeout: Duration::from_millis(3000),
                    ..Default::default()
                },
                None,
            )
            .await
            .unwrap();
        assert!(read.iter().all(|c| c.is_some()));

        let calls = remote.calls.lock().await;
        assert_eq!(calls.len(), 2, "batch size 1 forces two requests");
        let gap = calls[1].0.duration_since(calls[0].0);
        assert!(gap >= Duration::from_millis(80), "gap was {:?}", gap);
        drop(calls);
        fetcher.stop().await;
    }

    #[tokio::test]
    async fn pending_ids_are_deduplicated() {
        let mut queue = FetchQueue::default();
        assert_eq!(
            queue.enqueue(vec![DocumentId::new("h:a"), DocumentId::new("h:b")]),
            2
        );
        assert_eq!(queue.enqueue(vec![DocumentId::new("h:a")]), 0);
        let batch = queue.take_batch(10);
        assert_eq!(batch.len(), 2);
    }
}
