//! Document store interface.
//!
//! The underlying database engine is a consumed capability: a keyed,
//! revisioned document store with conflict-revision exposure, `new_edits:
//! false` puts that preserve a supplied revision tree, bulk key lookup and a
//! "changes since" feed. `MemoryDocStore` implements the trait in memory for
//! tests and for hosts without a live database.

use crate::document::{DocumentId, EntryDoc, Revision, Seq};
use crate::error::{Result, StoreError};
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::{RwLock, broadcast};

/// A stored document with its winning revision and last-modified sequence.
#[derive(Debug, Clone)]
pub struct DocRecord {
    pub doc: EntryDoc,
    pub rev: Revision,
    pub seq: Seq,
}

/// Per-document outcome of a bulk insert.
#[derive(Debug, Clone)]
pub enum PutStatus {
    Ok { rev: Revision },
    /// The key already holds a document (409-equivalent).
    Conflict,
    Error(String),
}

/// One row of the changes feed.
#[derive(Debug, Clone)]
pub struct ChangeRecord {
    pub id: DocumentId,
    pub seq: Seq,
    pub rev: Revision,
    pub deleted: bool,
}

/// One page of the changes feed.
#[derive(Debug, Clone)]
pub struct ChangesPage {
    pub changes: Vec<ChangeRecord>,
    pub last_seq: Seq,
    pub more: bool,
}

/// Keyed, revisioned document store with a changes feed.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Winning revision of a document, or `None` if absent or tombstoned.
    async fn get(&self, id: &DocumentId) -> Result<Option<DocRecord>>;

    /// A specific revision's body, if still available.
    async fn get_rev(&self, id: &DocumentId, rev: &Revision) -> Result<Option<EntryDoc>>;

    /// Revision-checked write. `expected_rev` must match the current winner
    /// (or be `None` for a new document) or the put fails with `Conflict`.
    async fn put(&self, doc: EntryDoc, expected_rev: Option<&Revision>) -> Result<Revision>;

    /// `new_edits: false` write: splice `rev` (with optional parent) into the
    /// document's revision tree without generating a new revision. Idempotent
    /// for revisions already present.
    async fn put_existing(
        &self,
        doc: EntryDoc,
        rev: Revision,
        parent: Option<Revision>,
    ) -> Result<()>;

    /// Bulk key lookup preserving input order.
    async fn bulk_get(&self, ids: &[DocumentId]) -> Result<Vec<Option<DocRecord>>>;

    /// Bulk insert of new documents, reporting ok-or-conflict per document.
    async fn bulk_put(&self, docs: Vec<EntryDoc>) -> Result<Vec<PutStatus>>;

    /// Conflicting (non-winning) leaf revisions of a document.
    async fn conflicts(&self, id: &DocumentId) -> Result<Vec<Revision>>;

    /// Which of the supplied (id, rev) pairs are missing locally.
    async fn revs_diff(
        &self,
        pairs: &[(DocumentId, Revision)],
    ) -> Result<Vec<(DocumentId, Revision)>>;

    /// Recorded parent of a revision, if its history is known.
    async fn rev_parent(&self, id: &DocumentId, rev: &Revision) -> Result<Option<Revision>>;

    /// Nearest common ancestor of two revisions, excluding the revisions
    /// themselves. `None` when the trees share no recorded history.
    async fn common_ancestor(
        &self,
        id: &DocumentId,
        a: &Revision,
        b: &Revision,
    ) -> Result<Option<Revision>>;

    /// Tombstone one leaf revision.
    async fn remove(&self, id: &DocumentId, rev: &Revision) -> Result<()>;

    /// One page of changes strictly after `since`.
    async fn changes_since(&self, since: Seq, limit: usize) -> Result<ChangesPage>;

    /// Live subscription to future changes.
    fn live_changes(&self) -> broadcast::Receiver<ChangeRecord>;

    /// Current update sequence.
    async fn current_seq(&self) -> Result<Seq>;
}

#[derive(Debug, Default)]
struct DocState {
    bodies: HashMap<Revision, EntryDoc>,
    parents: HashMap<Revision, Option<Revision>>,
    /// Active leaf revisions (winner plus conflicts plus tombstoned leaves).
    leaves: BTreeSet<Revision>,
    tombstones: BTreeSet<Revision>,
    seq: Seq,
}

impl DocState {
    /// Winning live leaf, or `None` when every leaf is tombstoned.
    fn winner(&self) -> Option<&Revision> {
        self.leaves.iter().rev().find(|r| !self.tombstones.contains(*r))
    }

    /// Top leaf including tombstoned ones; the chain a revive extends.
    fn top_leaf(&self) -> Option<&Revision> {
        self.leaves.iter().next_back()
    }
}

#[derive(Default)]
struct Inner {
    docs: HashMap<DocumentId, DocState>,
    seq: Seq,
}

/// In-memory `DocumentStore` with CouchDB-like revision chains.
pub struct MemoryDocStore {
    inner: Arc<RwLock<Inner>>,
    changes_tx: broadcast::Sender<ChangeRecord>,
}

impl Default for MemoryDocStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDocStore {
    pub fn new() -> Self {
        let (changes_tx, _) = broadcast::channel(1024);
        Self {
            inner: Arc::new(RwLock::new(Inner::default())),
            changes_tx,
        }
    }

    fn record_change(inner: &mut Inner, id: &DocumentId) -> Seq {
        inner.seq += 1;
        let seq = inner.seq;
        if let Some(state) = inner.docs.get_mut(id) {
            state.seq = seq;
        }
        seq
    }

    fn emit(&self, id: DocumentId, seq: Seq, rev: Revision, deleted: bool) {
        // No receivers is fine; live consumers subscribe on demand.
        let _ = self.changes_tx.send(ChangeRecord { id, seq, rev, deleted });
    }

    fn insert_new(inner: &mut Inner, doc: EntryDoc) -> std::result::Result<Revision, PutStatus> {
        let id = doc.id();
        let state = inner.docs.entry(id.clone()).or_default();
        if state.winner().is_some() {
            return Err(PutStatus::Conflict);
        }
        let parent = state.top_leaf().cloned();
        let rev = Revision::next(parent.as_ref(), &doc);
        if let Some(p) = &parent {
            state.leaves.remove(p);
        }
        state.bodies.insert(rev.clone(), doc);
        state.parents.insert(rev.clone(), parent);
        state.leaves.insert(rev.clone());
        Ok(rev)
    }
}

#[async_trait]
impl DocumentStore for MemoryDocStore {
    async fn get(&self, id: &DocumentId) -> Result<Option<DocRecord>> {
        let inner = self.inner.read().await;
        let Some(state) = inner.docs.get(id) else {
            return Ok(None);
        };
        let Some(rev) = state.winner() else {
            return Ok(None);
        };
        let doc = state
            .bodies
            .get(rev)
            .ok_or_else(|| StoreError::Backend(format!("missing body for {id} {rev}")))?;
        Ok(Some(DocRecord {
            doc: doc.clone(),
            rev: rev.clone(),
            seq: state.seq,
        }))
    }

    async fn get_rev(&self, id: &DocumentId, rev: &Revision) -> Result<Option<EntryDoc>> {
        let inner = self.inner.read().await;
        Ok(inner
            .docs
            .get(id)
            .and_then(|state| state.bodies.get(rev))
            .cloned())
    }

    async fn put(&self, doc: EntryDoc, expected_rev: Option<&Revision>) -> Result<Revision> {
        let id = doc.id();
        let mut inner = self.inner.write().await;
        let state = inner.docs.entry(id.clone()).or_default();

        // Updates target the live winner; a tombstoned conflict branch may
        // sort above it and must not block the put.
        let winner = state.winner().cloned();
        let parent = match (&winner, expected_rev) {
            (Some(current), Some(expected)) if current == expected => winner.clone(),
            // New document, or a revive over a fully tombstoned chain.
            (None, None) => state.top_leaf().cloned(),
            _ => return Err(StoreError::Conflict(id)),
        };

        let rev = Revision::next(parent.as_ref(), &doc);
        if let Some(p) = &parent {
            state.leaves.remove(p);
        }
        state.bodies.insert(rev.clone(), doc);
        state.parents.insert(rev.clone(), parent);
        state.leaves.insert(rev.clone());
        let fully_deleted = state.winner().is_none();

        let seq = Self::record_change(&mut inner, &id);
        drop(inner);
        self.emit(id, seq, rev.clone(), fully_deleted);
        Ok(rev)
    }

    async fn put_existing(
        &self,
        doc: EntryDoc,
        rev: Revision,
        parent: Option<Revision>,
    ) -> Result<()> {
        let id = doc.id();
        let mut inner = self.inner.write().await;
        let state = inner.docs.entry(id.clone()).or_default();

        if state.bodies.contains_key(&rev) {
            return Ok(());
        }

        // The body's deleted flag is document-level metadata, not a store
        // tombstone; only `remove` tombstones. Flagged documents stay
        // fetchable and readers filter them.
        state.bodies.insert(rev.clone(), doc);
        state.parents.insert(rev.clone(), parent.clone());
        if let Some(p) = &parent {
            // The supplied parent stops being a leaf once extended.
            state.leaves.remove(p);
        }
        state.leaves.insert(rev.clone());
        let fully_deleted = state.winner().is_none();

        let seq = Self::record_change(&mut inner, &id);
        drop(inner);
        self.emit(id, seq, rev, fully_deleted);
        Ok(())
    }

    async fn bulk_get(&self, ids: &[DocumentId]) -> Result<Vec<Option<DocRecord>>> {
        let inner = self.inner.read().await;
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            let record = inner.docs.get(id).and_then(|state| {
                let rev = state.winner()?;
                let doc = state.bodies.get(rev)?;
                Some(DocRecord {
                    doc: doc.clone(),
                    rev: rev.clone(),
                    seq: state.seq,
                })
            });
            out.push(record);
        }
        Ok(out)
    }

    async fn bulk_put(&self, docs: Vec<EntryDoc>) -> Result<Vec<PutStatus>> {
        let mut statuses = Vec::with_capacity(docs.len());
        let mut emitted = Vec::new();
        {
            let mut inner = self.inner.write().await;
            for doc in docs {
                let id = doc.id();
                match Self::insert_new(&mut inner, doc) {
                    Ok(rev) => {
                        let seq = Self::record_change(&mut inner, &id);
                        emitted.push((id, seq, rev.clone()));
                        statuses.push(PutStatus::Ok { rev });
                    }
                    Err(status) => statuses.push(status),
                }
            }
        }
        for (id, seq, rev) in emitted {
            self.emit(id, seq, rev, false);
        }
        Ok(statuses)
    }

    async fn conflicts(&self, id: &DocumentId) -> Result<Vec<Revision>> {
        let inner = self.inner.read().await;
        let Some(state) = inner.docs.get(id) else {
            return Ok(Vec::new());
        };
        let Some(winner) = state.winner().cloned() else {
            return Ok(Vec::new());
        };
        Ok(state
            .leaves
            .iter()
            .filter(|r| **r != winner && !state.tombstones.contains(*r))
            .cloned()
            .collect())
    }

    async fn revs_diff(
        &self,
        pairs: &[(DocumentId, Revision)],
    ) -> Result<Vec<(DocumentId, Revision)>> {
        let inner = self.inner.read().await;
        Ok(pairs
            .iter()
            .filter(|(id, rev)| {
                inner
                    .docs
                    .get(id)
                    .map(|state| !state.bodies.contains_key(rev))
                    .unwrap_or(true)
            })
            .cloned()
            .collect())
    }

    async fn rev_parent(&self, id: &DocumentId, rev: &Revision) -> Result<Option<Revision>> {
        let inner = self.inner.read().await;
        Ok(inner
            .docs
            .get(id)
            .and_then(|state| state.parents.get(rev))
            .cloned()
            .flatten())
    }

    async fn common_ancestor(
        &self,
        id: &DocumentId,
        a: &Revision,
        b: &Revision,
    ) -> Result<Option<Revision>> {
        let inner = self.inner.read().await;
        let Some(state) = inner.docs.get(id) else {
            return Ok(None);
        };

        let mut seen = std::collections::HashSet::new();
        let mut cursor = state.parents.get(a).cloned().flatten();
        while let Some(rev) = cursor {
            cursor = state.parents.get(&rev).cloned().flatten();
            seen.insert(rev);
        }

        let mut cursor = state.parents.get(b).cloned().flatten();
        while let Some(rev) = cursor {
            if seen.contains(&rev) {
                return Ok(Some(rev));
            }
            cursor = state.parents.get(&rev).cloned().flatten();
        }
        Ok(None)
    }

    async fn remove(&self, id: &DocumentId, rev: &Revision) -> Result<()> {
        let mut inner = self.inner.write().await;
        let state = inner
            .docs
            .get_mut(id)
            .ok_or_else(|| StoreError::Conflict(id.clone()))?;
        if !state.leaves.contains(rev) {
            return Err(StoreError::Conflict(id.clone()));
        }

        let mut doc = state
            .bodies
            .get(rev)
            .cloned()
            .ok_or_else(|| StoreError::Backend(format!("missing body for {id} {rev}")))?;
        match &mut doc {
            EntryDoc::Chunk(c) => c.deleted = true,
            EntryDoc::Plain(e) | EntryDoc::Binary(e) => e.deleted = true,
            EntryDoc::Milestone(_) => {}
        }

        let tomb = Revision::next(Some(rev), &doc);
        state.leaves.remove(rev);
        state.bodies.insert(tomb.clone(), doc);
        state.parents.insert(tomb.clone(), Some(rev.clone()));
        state.leaves.insert(tomb.clone());
        state.tombstones.insert(tomb.clone());
        let fully_deleted = state.winner().is_none();

        let seq = Self::record_change(&mut inner, id);
        drop(inner);
        self.emit(id.clone(), seq, tomb, fully_deleted);
        Ok(())
    }

    async fn changes_since(&self, since: Seq, limit: usize) -> Result<ChangesPage> {
        let inner = self.inner.read().await;
        let mut rows: Vec<_> = inner
            .docs
            .iter()
            .filter(|(_, state)| state.seq > since)
            .map(|(id, state)| {
                let rev = state
                    .winner()
                    .or_else(|| state.top_leaf())
                    .cloned()
                    .unwrap_or_else(|| Revision::parse("0-missing"));
                ChangeRecord {
                    id: id.clone(),
                    seq: state.seq,
                    deleted: state.winner().is_none(),
                    rev,
                }
            })
            .collect();
        rows.sort_by_key(|c| c.seq);

        let more = rows.len() > limit;
        rows.truncate(limit);
        let last_seq = rows.last().map(|c| c.seq).unwrap_or(since);
        Ok(ChangesPage {
            changes: rows,
            last_seq,
            more,
        })
    }

    fn live_changes(&self) -> broadcast::Receiver<ChangeRecord> {
        self.changes_tx.subscribe()
    }

    async fn current_seq(&self) -> Result<Seq> {
        Ok(self.inner.read().await.seq)
    }
}
