//! Bounded MRU cache for chunks.
//!
//! Keyed by chunk id with a reverse content-to-id index so the write path
//! can dedup known content before hashing. The capacity bound is a soft cap
//! enforced on every insert; reads promote entries to most-recently-used.

use crate::document::{ChunkDoc, DocumentId};
use lru::LruCache;
use std::collections::HashMap;
use std::num::NonZeroUsize;

/// MRU chunk cache with reverse content lookup.
pub struct ChunkCache {
    entries: LruCache<DocumentId, ChunkDoc>,
    by_content: HashMap<String, DocumentId>,
}

impl ChunkCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(capacity),
            by_content: HashMap::new(),
        }
    }

    /// Insert a chunk, evicting the oldest entries when over budget.
    pub fn insert(&mut self, chunk: ChunkDoc) {
        if let Some((old_id, old)) = self.entries.push(chunk.id.clone(), chunk.clone()) {
            // `push` returns the evicted pair (or the replaced value under
            // the same key); keep the reverse index in step either way.
            if old_id != chunk.id || old.data != chunk.data {
                self.by_content.remove(&old.data);
            }
        }
        self.by_content.insert(chunk.data, chunk.id);
    }

    /// Fetch a chunk and promote it to most-recently-used.
    pub fn get(&mut self, id: &DocumentId) -> Option<ChunkDoc> {
        self.entries.get(id).cloned()
    }

    pub fn contains(&self, id: &DocumentId) -> bool {
        self.entries.peek(id).is_some()
    }

    /// Reverse lookup: the id of already-cached content, if any.
    pub fn id_of_content(&self, content: &str) -> Option<DocumentId> {
        self.by_content.get(content).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
