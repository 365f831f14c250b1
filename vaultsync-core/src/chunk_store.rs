//! Content-addressed chunk store.
//!
//! Read/write/cache of leaf chunks with write-side dedup, conflict detection
//! on concurrent chunk creation, and event-driven signaling for chunks that
//! are missing locally. Chunks are immutable: the content fully determines
//! the id, so the same id must always carry the same bytes; a mismatch is a
//! fatal consistency violation, never silently resolved.

use crate::cache::ChunkCache;
use crate::config::VaultSettings;
use crate::document::{ChunkDoc, DocumentId, EntryDoc};
use crate::error::{Result, StoreError};
use crate::store::{DocumentStore, PutStatus};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, Notify, broadcast, watch};
use tracing::debug;

/// Options for [`ChunkStore::read`].
#[derive(Debug, Clone, Default)]
pub struct ReadOptions {
    /// How long to wait for a chunk that is missing locally. Zero never
    /// waits and never emits a missing-chunks event.
    pub timeout: Duration,
    /// Suppress the missing-chunks event even when waiting (local-only
    /// probing, or a remote that cannot serve chunk requests).
    pub prevent_remote_request: bool,
}

/// Options for [`ChunkStore::write`].
#[derive(Debug, Clone, Copy, Default)]
pub struct WriteOptions {
    /// Skip the cache dedup check and write unconditionally (used for
    /// known-good chunks arriving from a remote).
    pub force: bool,
}

/// Granular per-batch write accounting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteProcessed {
    /// Skipped because the identical chunk was cache-resident.
    pub cached: usize,
    /// Reserved for hot-pack batching (stabilization hook).
    pub hot_pack: usize,
    /// Newly inserted into the store.
    pub written: usize,
    /// Insert conflicted with an identical already-stored chunk.
    pub duplicated: usize,
}

/// Result of a chunk write batch.
#[derive(Debug, Clone, Copy, Default)]
pub struct WriteResult {
    pub processed: WriteProcessed,
}

#[derive(Debug, Clone)]
enum WaitState {
    Pending,
    Arrived(ChunkDoc),
    MissingOnRemote,
}

#[derive(Default)]
struct TxnState {
    depth: usize,
    stabilizing: bool,
}

/// The chunk store.
pub struct ChunkStore {
    store: Arc<dyn DocumentStore>,
    cache: Mutex<ChunkCache>,
    waiters: Mutex<HashMap<DocumentId, watch::Sender<WaitState>>>,
    missing_tx: broadcast::Sender<Vec<DocumentId>>,
    txn: Mutex<TxnState>,
    txn_released: Notify,
    stabilize_runs: AtomicUsize,
}

impl ChunkStore {
    pub fn new(store: Arc<dyn DocumentStore>, settings: &VaultSettings) -> Self {
        let (missing_tx, _) = broadcast::channel(256);
        Self {
            store,
            cache: Mutex::new(ChunkCache::new(settings.chunk_cache_capacity)),
            waiters: Mutex::new(HashMap::new()),
            missing_tx,
            txn: Mutex::new(TxnState::default()),
            txn_released: Notify::new(),
            stabilize_runs: AtomicUsize::new(0),
        }
    }

    /// Subscribe to "missing chunks" events. External fetchers listen here
    /// and deliver results back via [`note_chunk_fetched`](Self::note_chunk_fetched)
    /// / [`note_chunk_missing`](Self::note_chunk_missing).
    pub fn subscribe_missing(&self) -> broadcast::Receiver<Vec<DocumentId>> {
        self.missing_tx.subscribe()
    }

    /// Reverse cache lookup: id of already-known content, if cached.
    pub async fn cached_id_of(&self, content: &str) -> Option<DocumentId> {
        self.cache.lock().await.id_of_content(content)
    }

    /// Read chunks preserving input order, including duplicates.
    ///
    /// Resolution order: `preloaded` map, then the MRU cache, then a bulk
    /// store lookup; ids still missing wait for an arrival or
    /// missing-on-remote event under one shared deadline of
    /// `options.timeout`. An id that resolves nowhere in time yields `None`
    /// in its position.
    pub async fn read(
        &self,
        ids: &[DocumentId],
        options: &ReadOptions,
        preloaded: Option<&HashMap<DocumentId, ChunkDoc>>,
    ) -> Result<Vec<Option<ChunkDoc>>> {
        let mut resolved: HashMap<DocumentId, ChunkDoc> = HashMap::new();
        let mut pending: Vec<DocumentId> = Vec::new();
        for id in ids {
            if resolved.contains_key(id) || pending.contains(id) {
                continue;
            }
            if let Some(chunk) = preloaded.and_then(|m| m.get(id)) {
                resolved.insert(id.clone(), chunk.clone());
            } else {
                pending.push(id.clone());
            }
        }

        if !pending.is_empty() {
            let mut cache = self.cache.lock().await;
            pending.retain(|id| match cache.get(id) {
                Some(chunk) => {
                    resolved.insert(id.clone(), chunk);
                    false
                }
                None => true,
            });
        }

        if !pending.is_empty() {
            let records = self.store.bulk_get(&pending).await?;
            let mut cache = self.cache.lock().await;
            let mut still_missing = Vec::new();
            for (id, record) in pending.into_iter().zip(records) {
                match record.map(|r| r.doc) {
                    Some(EntryDoc::Chunk(chunk)) if !chunk.deleted => {
                        cache.insert(chunk.clone());
                        resolved.insert(id, chunk);
                    }
                    Some(_) => {
                        // Malformed or non-leaf document under a chunk id:
                        // treated as missing, not as corruption.
                        debug!(%id, "non-chunk document under chunk id, treating as missing");
                        still_missing.push(id);
                    }
                    None => still_missing.push(id),
                }
            }
            pending = still_missing;
        }

        if !pending.is_empty() && !options.timeout.is_zero() {
            let receivers: Vec<(DocumentId, watch::Receiver<WaitState>)> = {
                let mut waiters = self.waiters.lock().await;
                pending
                    .iter()
                    .map(|id| {
                        let tx = waiters.entry(id.clone()).or_insert_with(|| {
                            let (tx, _) = watch::channel(WaitState::Pending);
                            tx
                        });
                        (id.clone(), tx.subscribe())
                    })
                    .collect()
            };

            if !options.prevent_remote_request {
                let _ = self.missing_tx.send(pending.clone());
            }

            // One deadline for the whole batch, not per id.
            let deadline = tokio::time::Instant::now() + options.timeout;
            for (id, mut rx) in receivers {
                let waited = tokio::time::timeout_at(deadline, async {
                    loop {
                        let state = rx.borrow().clone();
                        match state {
                            WaitState::Pending => {
                                if rx.changed().await.is_err() {
                                    return WaitState::MissingOnRemote;
                                }
                            }
                            other => return other,
                        }
                    }
                })
                .await;

                match waited {
                    Ok(WaitState::Arrived(chunk)) => {
                        resolved.insert(id, chunk);
                    }
                    Ok(_) | Err(_) => {
                        // Our receiver must be gone before the count check.
                        drop(rx);
                        self.gc_waiter(&id).await;
                    }
                }
            }
        }

        Ok(ids.iter().map(|id| resolved.get(id).cloned()).collect())
    }

    /// Write a batch of chunks with dedup.
    ///
    /// Cache-resident chunks are skipped (content addressing guarantees the
    /// stored bytes are identical). Insert conflicts are re-read and compared
    /// byte for byte: identical content counts as a benign duplicate; a
    /// genuine mismatch aborts with the fatal [`StoreError::Collision`].
    pub async fn write(
        &self,
        chunks: Vec<ChunkDoc>,
        options: &WriteOptions,
        origin: &str,
    ) -> Result<WriteResult> {
        let mut processed = WriteProcessed::default();
        let mut to_write = Vec::with_capacity(chunks.len());

        if options.force {
            to_write = chunks;
        } else {
            let cache = self.cache.lock().await;
            for chunk in chunks {
                if cache.contains(&chunk.id) {
                    processed.cached += 1;
                } else {
                    to_write.push(chunk);
                }
            }
        }

        if to_write.is_empty() {
            return Ok(WriteResult { processed });
        }

        let statuses = self
            .store
            .bulk_put(to_write.iter().cloned().map(EntryDoc::Chunk).collect())
            .await?;

        let mut cache = self.cache.lock().await;
        for (chunk, status) in to_write.into_iter().zip(statuses) {
            match status {
                PutStatus::Ok { .. } => {
                    processed.written += 1;
                    cache.insert(chunk);
                }
                PutStatus::Conflict => {
                    let existing = self.store.get(&chunk.id).await?;
                    match existing.and_then(|r| r.doc.as_chunk().cloned()) {
                        Some(stored) if stored.data == chunk.data => {
                            processed.duplicated += 1;
                            cache.insert(stored);
                        }
                        _ => {
                            return Err(StoreError::Collision {
                                id: chunk.id.clone(),
                            });
                        }
                    }
                }
                PutStatus::Error(message) => {
                    return Err(StoreError::Backend(message));
                }
            }
        }

        debug!(
            origin,
            written = processed.written,
            cached = processed.cached,
            duplicated = processed.duplicated,
            "chunk write batch"
        );
        Ok(WriteResult { processed })
    }

    /// Inbound event: a chunk arrived from the remote. Caches it, resolves
    /// waiters and promotes it to most-recently-used.
    pub async fn note_chunk_fetched(&self, chunk: ChunkDoc) {
        self.cache.lock().await.insert(chunk.clone());
        if let Some(tx) = self.waiters.lock().await.remove(&chunk.id) {
            let _ = tx.send(WaitState::Arrived(chunk));
        }
    }

    /// Inbound event: the remote does not have this chunk either. Resolves
    /// waiters to "not found".
    pub async fn note_chunk_missing(&self, id: &DocumentId) {
        if let Some(tx) = self.waiters.lock().await.remove(id) {
            let _ = tx.send(WaitState::MissingOnRemote);
        }
    }

    async fn gc_waiter(&self, id: &DocumentId) {
        let mut waiters = self.waiters.lock().await;
        if let Some(tx) = waiters.get(id) {
            if tx.receiver_count() == 0 {
                waiters.remove(id);
            }
        }
    }

    /// Run `task` inside the stabilization barrier.
    ///
    /// Concurrent transactions stack; only when the last one finishes does
    /// the stabilization hook run. New transactions queue behind an
    /// in-progress stabilization.
    pub async fn transaction<F, Fut, T>(&self, task: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        loop {
            {
                let mut txn = self.txn.lock().await;
                if !txn.stabilizing {
                    txn.depth += 1;
                    break;
                }
            }
            self.txn_released.notified().await;
        }

        let result = task().await;

        let last = {
            let mut txn = self.txn.lock().await;
            txn.depth -= 1;
            if txn.depth == 0 {
                txn.stabilizing = true;
                true
            } else {
                false
            }
        };
        if last {
            self.stabilize().await;
            self.txn.lock().await.stabilizing = false;
            self.txn_released.notify_waiters();
        }
        result
    }

    /// Stabilization hook behind the transaction barrier. Reserved for
    /// batched hot-pack compaction; currently only accounting.
    async fn stabilize(&self) {
        self.stabilize_runs.fetch_add(1, Ordering::SeqCst);
        debug!("chunk store stabilized");
    }

    #[cfg(test)]
    pub(crate) fn stabilize_count(&self) -> usize {
        self.stabilize_runs.load(Ordering::SeqCst)
    }
}
