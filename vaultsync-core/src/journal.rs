//! Journal-based replication through a shared bucket.
//!
//! Devices never talk to each other directly: each node packs its local
//! changes into compressed NDJSON journal files, uploads them under a
//! timestamped key, and applies every journal file it has not seen yet.
//! Progress is tracked in a durable checkpoint that only advances after the
//! corresponding upload or apply succeeded, so an interrupted sync re-sends
//! rather than loses. A shared milestone document gates incompatible or
//! locked remotes before any data moves.

use crate::bucket::{BucketClient, download_json, upload_json};
use crate::checkpoint::{CheckPointInfo, KvStore, load_checkpoint, save_checkpoint};
use crate::config::VaultSettings;
use crate::document::{
    ChunkDoc, DocumentId, EntryDoc, MilestoneDoc, NodeChunkInfo, Revision,
};
use crate::error::StoreError;
use crate::fetch::Replicator;
use crate::queue::KeyedQueue;
use crate::store::DocumentStore;
use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use flate2::Compression;
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use std::collections::HashSet;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Key prefix for uploaded journal packs.
const JOURNAL_PREFIX: &str = "journal/";

/// Bucket key of the shared milestone document.
const MILESTONE_KEY: &str = "milestone.json";

/// Journal format version this build reads and writes.
const JOURNAL_VERSION: u32 = 1;

/// Oldest journal format version this build still reads.
const JOURNAL_VERSION_MIN: u32 = 1;

/// Fresh random node id for a device joining a remote for the first time.
/// Hosts persist it alongside the checkpoint.
pub fn new_node_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// One document in a journal pack. The parent revision carries just enough
/// ancestry for the receiver to extend its tree instead of forking it.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct JournalLine {
    id: DocumentId,
    rev: Revision,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    parent: Option<Revision>,
    doc: EntryDoc,
}

/// Where a synchronization run currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Idle,
    Receiving,
    Sending,
    Completed,
    Failed,
}

/// Replicates the local document store through a bucket of journal files.
pub struct JournalSyncReplicator {
    store: Arc<dyn DocumentStore>,
    bucket: Arc<dyn BucketClient>,
    kv: Arc<dyn KvStore>,
    settings: VaultSettings,
    node_id: String,
    checkpoint_key: String,
    queue: KeyedQueue,
    phase: Mutex<SyncPhase>,
    stop_requested: AtomicBool,
    last_pack_millis: AtomicI64,
}

impl JournalSyncReplicator {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        bucket: Arc<dyn BucketClient>,
        kv: Arc<dyn KvStore>,
        settings: VaultSettings,
        node_id: impl Into<String>,
        checkpoint_key: impl Into<String>,
    ) -> Self {
        Self {
            store,
            bucket,
            kv,
            settings,
            node_id: node_id.into(),
            checkpoint_key: checkpoint_key.into(),
            queue: KeyedQueue::new(),
            phase: Mutex::new(SyncPhase::Idle),
            stop_requested: AtomicBool::new(false),
            last_pack_millis: AtomicI64::new(0),
        }
    }

    pub fn phase(&self) -> SyncPhase {
        self.phase.lock().map(|p| *p).unwrap_or(SyncPhase::Failed)
    }

    fn set_phase(&self, phase: SyncPhase) {
        if let Ok(mut current) = self.phase.lock() {
            *current = phase;
        }
    }

    /// Ask a running sync to stop at the next file or batch boundary.
    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
    }

    fn check_stop(&self) -> Result<()> {
        if self.stop_requested.load(Ordering::SeqCst) {
            bail!("synchronization stopped by request");
        }
        Ok(())
    }

    /// Run one full synchronization: milestone gate, receive, then send.
    ///
    /// Coalesced: a call while a sync is already running returns
    /// `Ok(false)` immediately. Receive failures short-circuit the send so
    /// a node never publishes on top of a remote it could not read.
    pub async fn sync(&self) -> Result<bool> {
        self.stop_requested.store(false, Ordering::SeqCst);
        match self
            .queue
            .run_skip_duplicated("journal-sync", || async { self.sync_once().await })
            .await
        {
            Some(result) => result.map(|()| true),
            None => {
                debug!("journal sync already running, skipped");
                Ok(false)
            }
        }
    }

    async fn sync_once(&self) -> Result<()> {
        let run = async {
            self.ensure_milestone().await?;
            self.set_phase(SyncPhase::Receiving);
            self.receive().await?;
            self.set_phase(SyncPhase::Sending);
            self.send().await?;
            Ok(())
        };
        match run.await {
            Ok(()) => {
                self.set_phase(SyncPhase::Completed);
                Ok(())
            }
            Err(e) => {
                self.set_phase(SyncPhase::Failed);
                Err(e)
            }
        }
    }

    /// Download (or create) the milestone and verify this node may sync.
    async fn ensure_milestone(&self) -> Result<MilestoneDoc> {
        let Some(mut milestone) =
            download_json::<MilestoneDoc>(self.bucket.as_ref(), MILESTONE_KEY).await?
        else {
            let milestone = MilestoneDoc {
                created: Utc::now().timestamp_millis(),
                locked: false,
                cleaned: false,
                accepted_nodes: vec![self.node_id.clone()],
                node_chunk_info: [(self.node_id.clone(), self.version_info())]
                    .into_iter()
                    .collect(),
            };
            upload_json(self.bucket.as_ref(), MILESTONE_KEY, &milestone).await?;
            info!("milestone created on remote");
            return Ok(milestone);
        };

        if milestone.cleaned && !self.settings.accept_cleaned_remote {
            bail!("remote was cleaned; refusing to sync without operator confirmation");
        }
        if milestone.locked && !milestone.accepted_nodes.contains(&self.node_id) {
            bail!("remote is locked and this device is not on the accepted list");
        }
        for (node, version) in &milestone.node_chunk_info {
            if version.min > JOURNAL_VERSION {
                bail!(
                    "node {node} requires journal format {} but this build writes {}",
                    version.min,
                    JOURNAL_VERSION
                );
            }
            if version.current < JOURNAL_VERSION_MIN {
                bail!(
                    "node {node} writes journal format {} older than supported {}",
                    version.current,
                    JOURNAL_VERSION_MIN
                );
            }
        }

        if !milestone.node_chunk_info.contains_key(&self.node_id) {
            milestone
                .node_chunk_info
                .insert(self.node_id.clone(), self.version_info());
            if !milestone.accepted_nodes.contains(&self.node_id) {
                milestone.accepted_nodes.push(self.node_id.clone());
            }
            upload_json(self.bucket.as_ref(), MILESTONE_KEY, &milestone).await?;
            debug!(node = %self.node_id, "registered on milestone");
        }
        Ok(milestone)
    }

    fn version_info(&self) -> NodeChunkInfo {
        NodeChunkInfo {
            min: JOURNAL_VERSION_MIN,
            max: JOURNAL_VERSION,
            current: JOURNAL_VERSION,
        }
    }

    /// Apply every journal file not yet recorded in the checkpoint.
    async fn receive(&self) -> Result<()> {
        let mut checkpoint = load_checkpoint(self.kv.as_ref(), &self.checkpoint_key).await?;
        let files = self.bucket.list_files(JOURNAL_PREFIX).await?;

        for key in files {
            self.check_stop()?;
            if checkpoint.received_files.contains(&key) {
                continue;
            }
            if checkpoint.sent_files.contains(&key) {
                // Our own upload; recording it is enough.
                checkpoint.received_files.insert(key.clone());
                save_checkpoint(self.kv.as_ref(), &self.checkpoint_key, &checkpoint).await?;
                debug!(key, "own journal file, marked received");
                continue;
            }

            let Some(body) = self.bucket.download_file(&key).await? else {
                warn!(key, "journal file listed but not downloadable, skipping");
                continue;
            };
            let lines = decode_pack(&body).with_context(|| format!("decoding {key}"))?;
            let applied = self.apply_lines(lines, &mut checkpoint).await?;
            info!(key, applied, "journal file applied");

            checkpoint.received_files.insert(key);
            save_checkpoint(self.kv.as_ref(), &self.checkpoint_key, &checkpoint).await?;
        }
        Ok(())
    }

    /// Splice journal lines into the local store, skipping revisions already
    /// present. Every line becomes known regardless, so the send path never
    /// echoes remote documents back.
    async fn apply_lines(
        &self,
        lines: Vec<JournalLine>,
        checkpoint: &mut CheckPointInfo,
    ) -> Result<usize> {
        let pairs: Vec<(DocumentId, Revision)> = lines
            .iter()
            .map(|l| (l.id.clone(), l.rev.clone()))
            .collect();
        let missing: HashSet<(DocumentId, Revision)> =
            self.store.revs_diff(&pairs).await?.into_iter().collect();

        let mut applied = 0;
        for line in lines {
            if line.doc.id() != line.id {
                warn!(id = %line.id, "journal line id mismatch, skipped");
                continue;
            }
            let key = CheckPointInfo::doc_key(line.id.as_str(), line.rev.as_str());
            if missing.contains(&(line.id.clone(), line.rev.clone())) {
                self.store
                    .put_existing(line.doc, line.rev, line.parent)
                    .await?;
                applied += 1;
            }
            checkpoint.known_ids.insert(key);
        }
        Ok(applied)
    }

    /// Pack local changes past the checkpoint into journal files and upload
    /// them. The checkpoint advances per change-feed page, and only after
    /// every pack of that page landed on the remote.
    async fn send(&self) -> Result<()> {
        let mut checkpoint = load_checkpoint(self.kv.as_ref(), &self.checkpoint_key).await?;

        loop {
            self.check_stop()?;
            let page = self
                .store
                .changes_since(checkpoint.last_local_seq, self.settings.journal_batch_size)
                .await?;
            if page.changes.is_empty() {
                break;
            }

            let mut lines = Vec::new();
            for change in &page.changes {
                if checkpoint.knows(change.id.as_str(), change.rev.as_str()) {
                    continue;
                }
                let Some(doc) = self.store.get_rev(&change.id, &change.rev).await? else {
                    debug!(id = %change.id, rev = %change.rev, "revision body gone, skipped");
                    continue;
                };
                let parent = self.store.rev_parent(&change.id, &change.rev).await?;
                lines.push(JournalLine {
                    id: change.id.clone(),
                    rev: change.rev.clone(),
                    parent,
                    doc,
                });
            }

            let mut sent_keys = Vec::new();
            let mut sent_files = Vec::new();
            for pack in self.build_packs(&lines)? {
                self.check_stop()?;
                let file = format!(
                    "{JOURNAL_PREFIX}{:016}-{}.jsonl.gz",
                    self.next_pack_millis(),
                    self.node_id
                );
                self.bucket
                    .upload_file(&file, Bytes::from(pack.body), "application/octet-stream")
                    .await
                    .with_context(|| format!("uploading {file}"))?;
                debug!(file, docs = pack.doc_keys.len(), "journal file uploaded");
                sent_keys.extend(pack.doc_keys);
                sent_files.push(file);
            }

            // Durable on the remote; now, and only now, move the cursor.
            checkpoint.sent_ids.extend(sent_keys.iter().cloned());
            checkpoint.known_ids.extend(sent_keys);
            checkpoint.sent_files.extend(sent_files);
            checkpoint.last_local_seq = page.last_seq;
            save_checkpoint(self.kv.as_ref(), &self.checkpoint_key, &checkpoint).await?;

            if !page.more {
                break;
            }
        }
        Ok(())
    }

    /// Serialize lines into deflate-compressed NDJSON packs bounded by the
    /// configured document and byte limits.
    fn build_packs(&self, lines: &[JournalLine]) -> Result<Vec<Pack>> {
        let max_docs = self.settings.journal_max_docs.max(1);
        let max_bytes = self.settings.journal_max_bytes.max(1);

        let mut packs = Vec::new();
        let mut raw: Vec<u8> = Vec::new();
        let mut doc_keys = Vec::new();
        for line in lines {
            let serialized = serde_json::to_vec(line).context("serializing journal line")?;
            if !doc_keys.is_empty()
                && (doc_keys.len() >= max_docs || raw.len() + serialized.len() > max_bytes)
            {
                packs.push(Pack::compress(std::mem::take(&mut raw), std::mem::take(&mut doc_keys))?);
            }
            raw.extend_from_slice(&serialized);
            raw.push(b'\n');
            doc_keys.push(CheckPointInfo::doc_key(line.id.as_str(), line.rev.as_str()));
        }
        if !doc_keys.is_empty() {
            packs.push(Pack::compress(raw, doc_keys)?);
        }
        Ok(packs)
    }

    /// Strictly increasing pack timestamp, even within one millisecond.
    fn next_pack_millis(&self) -> i64 {
        let now = Utc::now().timestamp_millis();
        let mut prev = self.last_pack_millis.load(Ordering::SeqCst);
        loop {
            let next = now.max(prev + 1);
            match self.last_pack_millis.compare_exchange(
                prev,
                next,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return next,
                Err(actual) => prev = actual,
            }
        }
    }
}

struct Pack {
    body: Vec<u8>,
    doc_keys: Vec<String>,
}

impl Pack {
    fn compress(raw: Vec<u8>, doc_keys: Vec<String>) -> Result<Self> {
        let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&raw).context("compressing journal pack")?;
        let body = encoder.finish().context("finishing journal pack")?;
        Ok(Self { body, doc_keys })
    }
}

fn decode_pack(body: &[u8]) -> Result<Vec<JournalLine>> {
    let mut text = String::new();
    DeflateDecoder::new(body)
        .read_to_string(&mut text)
        .context("inflating journal pack")?;
    let mut lines = Vec::new();
    for raw in text.lines().filter(|l| !l.trim().is_empty()) {
        let line = serde_json::from_str(raw)
            .map_err(StoreError::from)
            .context("parsing journal line")?;
        lines.push(line);
    }
    Ok(lines)
}

/// Journals are the only transport: a chunk request pulls any unseen
/// journal files and then answers from the local store.
#[async_trait]
impl Replicator for JournalSyncReplicator {
    async fn fetch_remote_chunks(&self, ids: &[DocumentId]) -> Result<Vec<ChunkDoc>> {
        self.sync().await?;
        let records = self.store.bulk_get(ids).await?;
        Ok(records
            .into_iter()
            .flatten()
            .filter_map(|r| r.doc.as_chunk().cloned())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket::MemoryBucket;
    use crate::checkpoint::MemoryKvStore;
    use crate::chunk_store::ChunkStore;
    use crate::entry::{EntryFileManager, GetOptions, NewFileEntry};
    use crate::split::SplitMode;
    use crate::store::MemoryDocStore;

    struct Node {
        store: Arc<MemoryDocStore>,
        entries: Arc<EntryFileManager>,
        kv: Arc<MemoryKvStore>,
        replicator: JournalSyncReplicator,
    }

    fn node(name: &str, bucket: Arc<MemoryBucket>) -> Node {
        let settings = VaultSettings::default();
        let store = Arc::new(MemoryDocStore::new());
        let chunks = Arc::new(ChunkStore::new(store.clone(), &settings));
        let entries = Arc::new(EntryFileManager::new(
            store.clone(),
            chunks,
            settings.clone(),
        ));
        let kv = Arc::new(MemoryKvStore::new());
        let replicator = JournalSyncReplicator::new(
            store.clone(),
            bucket,
            kv.clone(),
            settings,
            name,
            format!("ck-{name}"),
        );
        Node {
            store,
            entries,
            kv,
            replicator,
        }
    }

    fn note(path: &str, data: &str) -> NewFileEntry {
        NewFileEntry {
            path: path.to_string(),
            data: data.to_string(),
            ctime: 1_000,
            mtime: 2_000,
            mode: SplitMode::PlainText,
        }
    }

    #[tokio::test]
    async fn round_trips_documents_between_two_nodes() {
        let bucket = Arc::new(MemoryBucket::new());
        let a = node("alpha", bucket.clone());
        let b = node("beta", bucket.clone());

        let content = "# Shared\n\nwritten on alpha, read on beta\n";
        a.entries.put_entry(note("shared.md", content)).await.unwrap();
        assert!(a.replicator.sync().await.unwrap());
        assert!(b.replicator.sync().await.unwrap());

        let read = b
            .entries
            .get_entry("shared.md", &GetOptions::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(read.data, content);
    }

    #[tokio::test]
    async fn checkpoint_only_advances_after_successful_upload() {
        let bucket = Arc::new(MemoryBucket::new());
        let a = node("alpha", bucket.clone());
        a.entries.put_entry(note("a.md", "body one\n")).await.unwrap();

        bucket.set_fail_uploads(true);
        assert!(a.replicator.sync().await.is_err());
        let ck = load_checkpoint(a.kv.as_ref(), "ck-alpha").await.unwrap();
        assert_eq!(ck.last_local_seq, 0);
        assert!(ck.sent_files.is_empty());
        assert_eq!(a.replicator.phase(), SyncPhase::Failed);

        bucket.set_fail_uploads(false);
        assert!(a.replicator.sync().await.unwrap());
        let ck = load_checkpoint(a.kv.as_ref(), "ck-alpha").await.unwrap();
        assert_eq!(ck.last_local_seq, a.store.current_seq().await.unwrap());
        assert_eq!(ck.sent_files.len(), 1);
        assert_eq!(a.replicator.phase(), SyncPhase::Completed);
    }

    #[tokio::test]
    async fn own_journal_files_are_not_downloaded() {
        let bucket = Arc::new(MemoryBucket::new());
        let a = node("alpha", bucket.clone());
        a.entries.put_entry(note("a.md", "body\n")).await.unwrap();
        a.replicator.sync().await.unwrap();

        let after_first = bucket.download_count();
        a.replicator.sync().await.unwrap();
        // The second run downloads the milestone only; the journal file it
        // uploaded itself is recognized from the checkpoint.
        assert_eq!(bucket.download_count(), after_first + 1);
        let ck = load_checkpoint(a.kv.as_ref(), "ck-alpha").await.unwrap();
        assert_eq!(ck.received_files.len(), 1);
    }

    #[tokio::test]
    async fn incremental_sync_sends_only_new_changes() {
        let bucket = Arc::new(MemoryBucket::new());
        let a = node("alpha", bucket.clone());
        a.entries.put_entry(note("one.md", "first note\n")).await.unwrap();
        a.replicator.sync().await.unwrap();
        let journals_before = bucket.list_files(JOURNAL_PREFIX).await.unwrap().len();

        a.entries.put_entry(note("two.md", "second note\n")).await.unwrap();
        a.replicator.sync().await.unwrap();
        let journals_after = bucket.list_files(JOURNAL_PREFIX).await.unwrap().len();
        assert_eq!(journals_after, journals_before + 1);

        // Nothing new: no further upload.
        a.replicator.sync().await.unwrap();
        assert_eq!(
            bucket.list_files(JOURNAL_PREFIX).await.unwrap().len(),
            journals_after
        );
    }

    #[tokio::test]
    async fn locked_remote_rejects_unlisted_node() {
        let bucket = Arc::new(MemoryBucket::new());
        let milestone = MilestoneDoc {
            created: 0,
            locked: true,
            cleaned: false,
            accepted_nodes: vec!["other".into()],
            node_chunk_info: Default::default(),
        };
        upload_json(bucket.as_ref(), MILESTONE_KEY, &milestone).await.unwrap();

        let a = node("alpha", bucket.clone());
        a.entries.put_entry(note("a.md", "body\n")).await.unwrap();
        assert!(a.replicator.sync().await.is_err());
        assert!(bucket.list_files(JOURNAL_PREFIX).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn cleaned_remote_requires_operator_override() {
        let bucket = Arc::new(MemoryBucket::new());
        let milestone = MilestoneDoc {
            created: 0,
            locked: false,
            cleaned: true,
            accepted_nodes: Vec::new(),
            node_chunk_info: Default::default(),
        };
        upload_json(bucket.as_ref(), MILESTONE_KEY, &milestone).await.unwrap();

        let a = node("alpha", bucket.clone());
        assert!(a.replicator.sync().await.is_err());

        let settings = VaultSettings {
            accept_cleaned_remote: true,
            ..Default::default()
        };
        let store = Arc::new(MemoryDocStore::new());
        let accepting = JournalSyncReplicator::new(
            store,
            bucket.clone(),
            Arc::new(MemoryKvStore::new()),
            settings,
            "accepting",
            "ck-accepting",
        );
        assert!(accepting.sync().await.unwrap());
    }

    #[tokio::test]
    async fn incompatible_journal_version_blocks_sync() {
        let bucket = Arc::new(MemoryBucket::new());
        let milestone = MilestoneDoc {
            created: 0,
            locked: false,
            cleaned: false,
            accepted_nodes: vec!["future".into()],
            node_chunk_info: [(
                "future".to_string(),
                NodeChunkInfo {
                    min: JOURNAL_VERSION + 1,
                    max: JOURNAL_VERSION + 1,
                    current: JOURNAL_VERSION + 1,
                },
            )]
            .into_iter()
            .collect(),
        };
        upload_json(bucket.as_ref(), MILESTONE_KEY, &milestone).await.unwrap();

        let a = node("alpha", bucket);
        assert!(a.replicator.sync().await.is_err());
    }

    #[tokio::test]
    async fn corrupt_journal_pack_fails_receive() {
        let bucket = Arc::new(MemoryBucket::new());
        let garbage = Pack::compress(b"not a journal line\n".to_vec(), Vec::new()).unwrap();
        bucket
            .upload_file(
                &format!("{JOURNAL_PREFIX}0000000000000001-rogue.jsonl.gz"),
                Bytes::from(garbage.body),
                "application/octet-stream",
            )
            .await
            .unwrap();

        let a = node("alpha", bucket);
        let err = a.replicator.sync().await.unwrap_err();
        assert!(err.chain().any(|cause| matches!(
            cause.downcast_ref::<StoreError>(),
            Some(StoreError::Serialization(_))
        )));
        assert_eq!(a.replicator.phase(), SyncPhase::Failed);
    }

    #[tokio::test]
    async fn concurrent_edits_surface_as_store_conflict() {
        let bucket = Arc::new(MemoryBucket::new());
        let a = node("alpha", bucket.clone());
        let b = node("beta", bucket.clone());

        // Both start from the same base.
        a.entries.put_entry(note("n.md", "base line\n")).await.unwrap();
        a.replicator.sync().await.unwrap();
        b.replicator.sync().await.unwrap();

        // Divergent edits on both nodes, then full exchange.
        a.entries.put_entry(note("n.md", "alpha line\n")).await.unwrap();
        b.entries.put_entry(note("n.md", "beta line\n")).await.unwrap();
        a.replicator.sync().await.unwrap();
        b.replicator.sync().await.unwrap();
        a.replicator.sync().await.unwrap();

        let id = DocumentId::new("n.md");
        assert_eq!(a.store.conflicts(&id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn pack_bounds_split_large_batches() {
        let bucket = Arc::new(MemoryBucket::new());
        let settings = VaultSettings {
            journal_max_docs: 2,
            ..Default::default()
        };
        let store = Arc::new(MemoryDocStore::new());
        let chunks = Arc::new(ChunkStore::new(store.clone(), &settings));
        let entries = EntryFileManager::new(store.clone(), chunks, settings.clone());
        let replicator = JournalSyncReplicator::new(
            store,
            bucket.clone(),
            Arc::new(MemoryKvStore::new()),
            settings,
            "alpha",
            "ck-alpha",
        );

        // Several entries produce more than two documents (chunks + parents).
        for i in 0..3 {
            entries
                .put_entry(note(
                    &format!("note-{i}.md"),
                    &format!("content of note number {i}\n"),
                ))
                .await
                .unwrap();
        }
        replicator.sync().await.unwrap();
        assert!(bucket.list_files(JOURNAL_PREFIX).await.unwrap().len() >= 2);
    }

    #[tokio::test]
    async fn serves_chunks_as_fetch_replicator() {
        let bucket = Arc::new(MemoryBucket::new());
        let a = node("alpha", bucket.clone());
        let b = node("beta", bucket.clone());

        let content = "chunk fetch target content, long enough to split\n";
        a.entries.put_entry(note("f.md", content)).await.unwrap();
        a.replicator.sync().await.unwrap();

        let record = a.store.get(&DocumentId::new("f.md")).await.unwrap().unwrap();
        let children = record.doc.as_file().unwrap().children.clone();
        let fetched = b.replicator.fetch_remote_chunks(&children).await.unwrap();
        assert_eq!(fetched.len(), children.len());
    }
}
