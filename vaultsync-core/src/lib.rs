//! VaultSync Core Library
//!
//! Synchronization core for a note vault:
//! - Document model (content-addressed chunks, file entries, milestone)
//! - Content splitting and chunk hashing (plain and salted)
//! - Revisioned document store abstraction with in-memory implementation
//! - Chunk store with MRU cache, read waiters and missing-chunk events
//! - On-demand remote chunk fetching with batching and pacing
//! - Whole-file entry assembly/disassembly with inline ("eden") chunks
//! - Three-way conflict resolution for text and structured JSON
//! - Journal-based replication through a shared object bucket

pub mod bucket;
pub mod cache;
pub mod change_feed;
pub mod checkpoint;
pub mod chunk_store;
pub mod config;
pub mod document;
pub mod entry;
pub mod error;
pub mod fetch;
pub mod hash;
pub mod journal;
pub mod merge;
pub mod queue;
pub mod split;
pub mod store;

#[cfg(test)]
mod sync_tests;

pub use bucket::{BucketClient, MemoryBucket, download_json, upload_json};
pub use cache::ChunkCache;
pub use change_feed::{CallbackHandle, ChangeCallback, ChangeManager};
pub use checkpoint::{
    CheckPointInfo, KvStore, MemoryKvStore, checkpoint_key, load_checkpoint, save_checkpoint,
};
pub use chunk_store::{ChunkStore, ReadOptions, WriteOptions, WriteProcessed, WriteResult};
pub use config::{HashAlgorithm, VaultSettings};
pub use document::{
    CHUNK_ID_PREFIX, ChunkDoc, DocumentId, ENCRYPTED_ID_SUFFIX, EdenChunk, EntryDoc, FileEntry,
    MILESTONE_DOC_ID, MilestoneDoc, NodeChunkInfo, Revision, Seq,
};
pub use entry::{EntryFileManager, GetOptions, NewFileEntry, PutOutcome, ReadEntry};
pub use error::{Result, StoreError};
pub use fetch::{ChunkFetcher, Replicator};
pub use hash::ChunkHasher;
pub use journal::{JournalSyncReplicator, SyncPhase, new_node_id};
pub use merge::{ConflictLeaf, ConflictResolver, MergeOutcome};
pub use queue::KeyedQueue;
pub use split::{ContentSplitter, SplitMode};
pub use store::{
    ChangeRecord, ChangesPage, DocRecord, DocumentStore, MemoryDocStore, PutStatus,
};
