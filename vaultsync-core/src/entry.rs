//! Whole-file entry assembly and disassembly.
//!
//! An entry is metadata plus an ordered chunk-id list; writing a file splits
//! its content into pieces, dedups them into chunks and persists the parent
//! document, and reading reverses that. Very small pieces may be inlined in
//! the parent ("eden") until they graduate to independent leaves. Writers
//! and deleters of the same path are serialized so read-modify-write
//! revision updates never interleave.

use crate::chunk_store::{ChunkStore, ReadOptions, WriteOptions, WriteProcessed};
use crate::config::VaultSettings;
use crate::document::{ChunkDoc, DocumentId, EdenChunk, EntryDoc, FileEntry, Revision};
use crate::hash::ChunkHasher;
use crate::queue::KeyedQueue;
use crate::split::{ContentSplitter, SplitMode};
use crate::store::DocumentStore;
use anyhow::{Context, Result};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

/// A file entering the store.
#[derive(Debug, Clone)]
pub struct NewFileEntry {
    pub path: String,
    pub data: String,
    pub ctime: i64,
    pub mtime: i64,
    pub mode: SplitMode,
}

/// A fully reconstructed file entry.
#[derive(Debug, Clone)]
pub struct ReadEntry {
    pub path: String,
    pub data: String,
    pub ctime: i64,
    pub mtime: i64,
    pub size: u64,
    pub rev: Revision,
    pub mode: SplitMode,
}

/// Outcome of a write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PutOutcome {
    Saved { id: DocumentId, rev: Revision },
    /// The path is excluded from synchronization; not an error.
    Skipped,
}

/// Read-context options; the chunk wait timeout varies by caller intent.
#[derive(Debug, Clone, Copy, Default)]
pub struct GetOptions {
    /// Wait for chunks that in-flight replication may still deliver.
    pub wait_for_replication: bool,
    /// Only check local availability; never signal the remote.
    pub local_only: bool,
}

/// Assembles and disassembles file entries over the chunk store.
pub struct EntryFileManager {
    store: Arc<dyn DocumentStore>,
    chunks: Arc<ChunkStore>,
    splitter: ContentSplitter,
    hasher: ChunkHasher,
    settings: VaultSettings,
    file_queue: KeyedQueue,
}

impl EntryFileManager {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        chunks: Arc<ChunkStore>,
        settings: VaultSettings,
    ) -> Self {
        Self {
            store,
            chunks,
            splitter: ContentSplitter::new(&settings),
            hasher: ChunkHasher::new(&settings),
            settings,
            file_queue: KeyedQueue::new(),
        }
    }

    fn entry_id(&self, path: &str) -> DocumentId {
        DocumentId::from_path(path, self.settings.obfuscate_paths)
    }

    fn read_options(&self, opts: &GetOptions) -> ReadOptions {
        let timeout = if opts.wait_for_replication {
            Duration::from_millis(self.settings.chunk_wait_timeout_ms)
        } else {
            Duration::ZERO
        };
        ReadOptions {
            timeout,
            prevent_remote_request: opts.local_only || !self.settings.enable_on_demand_fetch,
        }
    }

    /// Store a file as chunks plus a parent entry document.
    ///
    /// Serialized per path; runs inside a chunk-store transaction. A
    /// pattern-excluded path is a success-like no-op.
    pub async fn put_entry(&self, new: NewFileEntry) -> Result<PutOutcome> {
        if self.settings.is_excluded(&new.path) {
            debug!(path = %new.path, "excluded from sync, skipping");
            return Ok(PutOutcome::Skipped);
        }

        let key = format!("file:{}", new.path);
        self.file_queue
            .run(&key, || async { self.put_entry_inner(new).await })
            .await
    }

    async fn put_entry_inner(&self, new: NewFileEntry) -> Result<PutOutcome> {
        let id = self.entry_id(&new.path);
        self.chunks
            .transaction(|| async {
                let previous = self
                    .store
                    .get(&id)
                    .await
                    .with_context(|| format!("loading previous revision of {}", new.path))?;
                let prev_rev = previous.as_ref().map(|r| r.rev.clone());
                let prev_eden = previous
                    .as_ref()
                    .and_then(|r| r.doc.as_file())
                    .map(|f| f.eden.clone())
                    .unwrap_or_default();

                let (children, eden, totals) = self.disassemble(&new, &prev_eden).await?;

                let entry = FileEntry {
                    id: id.clone(),
                    path: new.path.clone(),
                    ctime: new.ctime,
                    mtime: new.mtime,
                    size: new.data.len() as u64,
                    children,
                    eden,
                    deleted: false,
                };
                let doc = match new.mode {
                    SplitMode::PlainText => EntryDoc::Plain(entry),
                    SplitMode::Binary => EntryDoc::Binary(entry),
                };

                let rev = self
                    .store
                    .put(doc, prev_rev.as_ref())
                    .await
                    .with_context(|| format!("persisting entry for {}", new.path))?;
                debug!(
                    path = %new.path,
                    written = totals.written,
                    cached = totals.cached,
                    duplicated = totals.duplicated,
                    "entry stored"
                );
                Ok(PutOutcome::Saved { id: id.clone(), rev })
            })
            .await
    }

    /// Split, hash and dedup content into chunk writes, returning the
    /// ordered child list and the surviving eden map.
    async fn disassemble(
        &self,
        new: &NewFileEntry,
        prev_eden: &BTreeMap<DocumentId, EdenChunk>,
    ) -> Result<(Vec<DocumentId>, BTreeMap<DocumentId, EdenChunk>, WriteProcessed)> {
        let mut children = Vec::new();
        let mut eden: BTreeMap<DocumentId, EdenChunk> = BTreeMap::new();
        let mut buffer: Vec<ChunkDoc> = Vec::new();
        let mut buffered_bytes = 0usize;
        let mut queued: HashSet<DocumentId> = HashSet::new();
        let mut totals = WriteProcessed::default();

        for piece in self.splitter.split(&new.data, new.mode) {
            let inline = self.settings.eden_max_chunk_size > 0
                && piece.len() <= self.settings.eden_max_chunk_size;

            // Reverse-cache dedup first: known content needs no hashing.
            let chunk_id = match self.chunks.cached_id_of(&piece).await {
                Some(id) => id,
                None => self.hasher.compute(&piece),
            };

            if inline {
                let epoch = prev_eden
                    .get(&chunk_id)
                    .map(|e| e.epoch + 1)
                    .unwrap_or(1);
                eden.insert(chunk_id.clone(), EdenChunk { data: piece, epoch });
                children.push(chunk_id);
                continue;
            }

            children.push(chunk_id.clone());
            if queued.insert(chunk_id.clone()) {
                buffered_bytes += piece.len();
                buffer.push(ChunkDoc::new(chunk_id, piece));
                if buffered_bytes >= self.settings.write_flush_bytes {
                    self.flush_chunks(&mut buffer, &mut totals).await?;
                    buffered_bytes = 0;
                }
            }
        }

        self.graduate_eden(&mut eden, &mut buffer, &mut totals);
        self.flush_chunks(&mut buffer, &mut totals).await?;
        Ok((children, eden, totals))
    }

    async fn flush_chunks(
        &self,
        buffer: &mut Vec<ChunkDoc>,
        totals: &mut WriteProcessed,
    ) -> Result<()> {
        if buffer.is_empty() {
            return Ok(());
        }
        let result = self
            .chunks
            .write(std::mem::take(buffer), &WriteOptions::default(), "put_entry")
            .await?;
        totals.written += result.processed.written;
        totals.cached += result.processed.cached;
        totals.duplicated += result.processed.duplicated;
        Ok(())
    }

    /// Move eden chunks that outgrew incubation into the write buffer.
    fn graduate_eden(
        &self,
        eden: &mut BTreeMap<DocumentId, EdenChunk>,
        buffer: &mut Vec<ChunkDoc>,
        totals: &mut WriteProcessed,
    ) {
        let total_bytes: usize = eden.values().map(|e| e.data.len()).sum();
        let graduate_all = eden.len() > self.settings.eden_max_chunks
            || total_bytes > self.settings.eden_max_bytes;

        let graduating: Vec<DocumentId> = eden
            .iter()
            .filter(|(_, e)| graduate_all || e.epoch > self.settings.eden_max_epoch_age)
            .map(|(id, _)| id.clone())
            .collect();
        for id in graduating {
            if let Some(e) = eden.remove(&id) {
                totals.hot_pack += 1;
                buffer.push(ChunkDoc::new(id, e.data));
            }
        }
    }

    /// Load and reconstruct a file entry.
    ///
    /// Any unresolved chunk aborts the whole read: a document is never
    /// returned partially reconstructed. A missing document is a normal
    /// `None`, not an error.
    pub async fn get_entry(&self, path: &str, opts: &GetOptions) -> Result<Option<ReadEntry>> {
        let id = self.entry_id(path);
        let Some(record) = self
            .store
            .get(&id)
            .await
            .with_context(|| format!("loading entry for {path}"))?
        else {
            return Ok(None);
        };
        self.assemble(path, &record.doc, record.rev, opts).await
    }

    /// Reconstruct a specific revision of a file entry (conflict handling).
    pub async fn get_entry_at_rev(
        &self,
        path: &str,
        rev: &Revision,
        opts: &GetOptions,
    ) -> Result<Option<ReadEntry>> {
        let id = self.entry_id(path);
        let Some(doc) = self
            .store
            .get_rev(&id, rev)
            .await
            .with_context(|| format!("loading revision {rev} of {path}"))?
        else {
            return Ok(None);
        };
        self.assemble(path, &doc, rev.clone(), opts).await
    }

    async fn assemble(
        &self,
        path: &str,
        doc: &EntryDoc,
        rev: Revision,
        opts: &GetOptions,
    ) -> Result<Option<ReadEntry>> {
        let (entry, mode) = match doc {
            EntryDoc::Plain(e) => (e, SplitMode::PlainText),
            EntryDoc::Binary(e) => (e, SplitMode::Binary),
            _ => return Ok(None),
        };
        if entry.deleted {
            return Ok(None);
        }

        let preloaded: HashMap<DocumentId, ChunkDoc> = entry
            .eden
            .iter()
            .map(|(id, e)| (id.clone(), ChunkDoc::new(id.clone(), e.data.clone())))
            .collect();

        let resolved = self
            .chunks
            .read(&entry.children, &self.read_options(opts), Some(&preloaded))
            .await?;

        let mut data = String::with_capacity(entry.size as usize);
        for (child, chunk) in entry.children.iter().zip(resolved) {
            match chunk {
                Some(c) => data.push_str(&c.data),
                None => {
                    // Unreconstructable entry: corruption signal, whole read
                    // aborts rather than returning partial content.
                    error!(path, chunk = %child, "chunk unresolved, cannot reconstruct entry");
                    return Ok(None);
                }
            }
        }

        Ok(Some(ReadEntry {
            path: path.to_string(),
            data,
            ctime: entry.ctime,
            mtime: entry.mtime,
            size: entry.size,
            rev,
            mode,
        }))
    }

    /// Mark an entry deleted: a store tombstone, or a logical flag with a
    /// bumped mtime when deleted-file metadata is retained. Returns `false`
    /// when the entry does not exist.
    pub async fn delete_entry(&self, path: &str) -> Result<bool> {
        let key = format!("file:{path}");
        self.file_queue
            .run(&key, || async {
                let id = self.entry_id(path);
                let Some(record) = self
                    .store
                    .get(&id)
                    .await
                    .with_context(|| format!("loading entry for {path}"))?
                else {
                    return Ok(false);
                };

                if self.settings.keep_deleted_metadata {
                    let Some(entry) = record.doc.as_file() else {
                        return Ok(false);
                    };
                    let mut entry = entry.clone();
                    entry.deleted = true;
                    entry.children = Vec::new();
                    entry.eden = BTreeMap::new();
                    entry.mtime = chrono::Utc::now().timestamp_millis();
                    let doc = match record.doc {
                        EntryDoc::Binary(_) => EntryDoc::Binary(entry),
                        _ => EntryDoc::Plain(entry),
                    };
                    self.store
                        .put(doc, Some(&record.rev))
                        .await
                        .with_context(|| format!("marking {path} deleted"))?;
                } else {
                    self.store
                        .remove(&id, &record.rev)
                        .await
                        .with_context(|| format!("tombstoning {path}"))?;
                }
                Ok(true)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryDocStore;

    fn manager_with(settings: VaultSettings) -> (Arc<MemoryDocStore>, EntryFileManager) {
        let store = Arc::new(MemoryDocStore::new());
        let chunks = Arc::new(ChunkStore::new(store.clone(), &settings));
        let manager = EntryFileManager::new(store.clone(), chunks, settings);
        (store, manager)
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
    async fn put_then_get_round_trips_content() {
        let (_, manager) = manager_with(VaultSettings::default());
        let content = "# Title\n\nfirst paragraph\n\nsecond paragraph\n";
        let outcome = manager.put_entry(note("notes/a.md", content)).await.unwrap();
        assert!(matches!(outcome, PutOutcome::Saved { .. }));

        let entry = manager
            .get_entry("notes/a.md", &GetOptions::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.data, content);
        assert_eq!(entry.mtime, 2_000);
    }

    #[tokio::test]
    async fn identical_content_shares_chunks_across_files() {
        let (store, manager) = manager_with(VaultSettings::default());
        let content = "shared paragraph of sufficient length to chunk\n";
        manager.put_entry(note("a.md", content)).await.unwrap();
        manager.put_entry(note("b.md", content)).await.unwrap();

        let a = store.get(&DocumentId::new("a.md")).await.unwrap().unwrap();
        let b = store.get(&DocumentId::new("b.md")).await.unwrap().unwrap();
        assert_eq!(
            a.doc.as_file().unwrap().children,
            b.doc.as_file().unwrap().children
        );
    }

    #[tokio::test]
    async fn excluded_path_is_skipped() {
        let (store, manager) = manager_with(VaultSettings {
            sync_exclusions: vec![".obsidian/".into()],
            ..Default::default()
        });
        let outcome = manager
            .put_entry(note(".obsidian/workspace.json", "{}"))
            .await
            .unwrap();
        assert_eq!(outcome, PutOutcome::Skipped);
        assert!(
            store
                .get(&DocumentId::new(".obsidian/workspace.json"))
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn update_reuses_unchanged_chunks() {
        let (store, manager) = manager_with(VaultSettings::default());
        let v1 = "paragraph one stays the same\n\nparagraph two will change\n";
        let v2 = "paragraph one stays the same\n\nparagraph two has changed\n";
        manager.put_entry(note("a.md", v1)).await.unwrap();
        let before = store.current_seq().await.unwrap();
        manager.put_entry(note("a.md", v2)).await.unwrap();

        let entry = manager
            .get_entry("a.md", &GetOptions::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.data, v2);
        // Only the changed chunk plus the entry doc were written.
        let after = store.current_seq().await.unwrap();
        assert!(after - before <= 3);
    }

    #[tokio::test]
    async fn logical_delete_keeps_metadata() {
        let (store, manager) = manager_with(VaultSettings::default());
        manager.put_entry(note("a.md", "body\n")).await.unwrap();
        assert!(manager.delete_entry("a.md").await.unwrap());

        // Hidden from reads but still present as a flagged document.
        assert!(
            manager
                .get_entry("a.md", &GetOptions::default())
                .await
                .unwrap()
                .is_none()
        );
        let record = store.get(&DocumentId::new("a.md")).await.unwrap().unwrap();
        assert!(record.doc.is_deleted());
        assert!(record.doc.as_file().unwrap().children.is_empty());
    }

    #[tokio::test]
    async fn tombstone_delete_removes_document() {
        let (store, manager) = manager_with(VaultSettings {
            keep_deleted_metadata: false,
            ..Default::default()
        });
        manager.put_entry(note("a.md", "body\n")).await.unwrap();
        assert!(manager.delete_entry("a.md").await.unwrap());
        assert!(store.get(&DocumentId::new("a.md")).await.unwrap().is_none());
        // Deleting again finds nothing.
        assert!(!manager.delete_entry("a.md").await.unwrap());
    }

    #[tokio::test]
    async fn unresolved_chunk_aborts_read() {
        let (store, manager) = manager_with(VaultSettings::default());
        let entry = FileEntry {
            id: DocumentId::new("broken.md"),
            path: "broken.md".into(),
            ctime: 0,
            mtime: 0,
            size: 4,
            children: vec![DocumentId::new("h:never-written")],
            eden: BTreeMap::new(),
            deleted: false,
        };
        store.put(EntryDoc::Plain(entry), None).await.unwrap();

        let read = manager
            .get_entry("broken.md", &GetOptions::default())
            .await
            .unwrap();
        assert!(read.is_none());
    }

    #[tokio::test]
    async fn eden_inlines_small_chunks() {
        let settings = VaultSettings {
            eden_max_chunk_size: 1024,
            eden_max_chunks: 100,
            eden_max_bytes: 64 * 1024,
            ..Default::default()
        };
        let (store, manager) = manager_with(settings);
        let content = "tiny note\n";
        manager.put_entry(note("tiny.md", content)).await.unwrap();

        let record = store
            .get(&DocumentId::new("tiny.md"))
            .await
            .unwrap()
            .unwrap();
        let file = record.doc.as_file().unwrap();
        assert_eq!(file.eden.len(), 1);
        // The chunk lives only inside the parent document.
        assert!(
            store
                .get(&file.children[0])
                .await
                .unwrap()
                .is_none()
        );

        let read = manager
            .get_entry("tiny.md", &GetOptions::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(read.data, content);
    }

    #[tokio::test]
    async fn eden_graduates_when_over_budget() {
        let settings = VaultSettings {
            eden_max_chunk_size: 1024,
            eden_max_chunks: 0,
            eden_max_bytes: 0,
            ..Default::default()
        };
        let (store, manager) = manager_with(settings);
        manager.put_entry(note("tiny.md", "tiny note\n")).await.unwrap();

        let record = store
            .get(&DocumentId::new("tiny.md"))
            .await
            .unwrap()
            .unwrap();
        let file = record.doc.as_file().unwrap();
        assert!(file.eden.is_empty());
        // Graduated to an independent leaf.
        assert!(store.get(&file.children[0]).await.unwrap().is_some());
    }
}
