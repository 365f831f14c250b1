//! Settings for the synchronization core.
//!
//! One flat struct shared by the splitter, hasher, chunk store, fetcher,
//! entry manager, conflict resolver and journal replicator. Loaded by the
//! host application (settings UI / validation are external collaborators);
//! everything here has a production default.

use serde::{Deserialize, Serialize};

/// Hash algorithm used for chunk content addressing.
///
/// Selected once at construction; an encryption passphrase switches the
/// default to the salted variant so ids do not leak content across
/// passphrase boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum HashAlgorithm {
    /// Plain SHA-256 of the piece content.
    #[default]
    Sha256,
    /// SHA-256 over passphrase-salted content; ids carry a `+` marker.
    SaltedSha256,
}

/// Settings for the synchronization core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultSettings {
    /// End-to-end encryption passphrase. `Some` switches chunk ids to the
    /// salted format regardless of `hash_algorithm`.
    pub passphrase: Option<String>,
    /// Chunk id hash strategy.
    pub hash_algorithm: HashAlgorithm,

    /// Minimum piece size for the plain-text splitter; a piece only closes
    /// at a natural boundary once it reached this size.
    pub min_chunk_size: usize,
    /// Lower clamp bound for the adaptive binary piece size.
    pub binary_piece_size_min: usize,
    /// Upper clamp bound for the adaptive binary piece size.
    pub binary_piece_size_max: usize,

    /// Maximum number of chunks resident in the MRU cache.
    pub chunk_cache_capacity: usize,

    /// Whether a locally-missing chunk may be requested from the remote.
    pub enable_on_demand_fetch: bool,
    /// Maximum ids per remote fetch batch.
    pub fetch_batch_size: usize,
    /// Minimum wall-clock milliseconds between consecutive remote fetch
    /// request starts, regardless of concurrency.
    pub fetch_interval_ms: u64,
    /// How many fetch batches may be in flight at once.
    pub fetch_concurrency: usize,

    /// Milliseconds to wait for an in-flight chunk when reading an entry
    /// while replication may still deliver it.
    pub chunk_wait_timeout_ms: u64,
    /// Buffered chunk bytes before `put_entry` flushes a write batch.
    pub write_flush_bytes: usize,

    /// Inline ("eden") chunk support: pieces at or below this size are kept
    /// inside the parent document instead of stored as independent leaves.
    /// Zero disables inlining.
    pub eden_max_chunk_size: usize,
    /// Graduation threshold: max inlined chunks per document.
    pub eden_max_chunks: usize,
    /// Graduation threshold: max total inlined bytes per document.
    pub eden_max_bytes: usize,
    /// Graduation threshold: incubation epochs before a chunk leaves eden.
    pub eden_max_epoch_age: u32,

    /// Path substrings excluded from synchronization; a matching path is a
    /// silent no-op on write.
    pub sync_exclusions: Vec<String>,
    /// Obfuscate entry ids (hash of path) instead of using the path itself.
    pub obfuscate_paths: bool,
    /// Keep a logical `deleted` flag (metadata retained) instead of a store
    /// tombstone when deleting an entry.
    pub keep_deleted_metadata: bool,

    /// Allow automatic three-way merge of plain-text conflicts.
    pub enable_text_auto_merge: bool,
    /// Tie-break for divergent same-position inserts: older edit first.
    /// Heuristic policy, not a correctness guarantee.
    pub merge_older_edit_first: bool,

    /// Journal pack bounds: max documents per uploaded pack.
    pub journal_max_docs: usize,
    /// Journal pack bounds: max serialized bytes per uploaded pack.
    pub journal_max_bytes: usize,
    /// Change-feed page size for the journal send path.
    pub journal_batch_size: usize,
    /// Operator override to sync against a remote marked as cleaned.
    pub accept_cleaned_remote: bool,
}

impl Default for VaultSettings {
    fn default() -> Self {
        Self {
            passphrase: None,
            hash_algorithm: HashAlgorithm::Sha256,
            min_chunk_size: 20,
            binary_piece_size_min: 1024,
            binary_piece_size_max: 100 * 1024 * 1024,
            chunk_cache_capacity: 300,
            enable_on_demand_fetch: true,
            fetch_batch_size: 100,
            fetch_interval_ms: 100,
            fetch_concurrency: 2,
            chunk_wait_timeout_ms: 30_000,
            write_flush_bytes: 1024 * 1024,
            eden_max_chunk_size: 0,
            eden_max_chunks: 10,
            eden_max_bytes: 1024,
            eden_max_epoch_age: 10,
            sync_exclusions: Vec::new(),
            obfuscate_paths: false,
            keep_deleted_metadata: true,
            enable_text_auto_merge: true,
            merge_older_edit_first: true,
            journal_max_docs: 250,
            journal_max_bytes: 1024 * 1024,
            journal_batch_size: 100,
            accept_cleaned_remote: false,
        }
    }
}

impl VaultSettings {
    /// Effective hash algorithm: a passphrase always forces the salted form.
    pub fn effective_hash_algorithm(&self) -> HashAlgorithm {
        if self.passphrase.is_some() {
            HashAlgorithm::SaltedSha256
        } else {
            self.hash_algorithm
        }
    }

    /// Whether a path is excluded from synchronization.
    pub fn is_excluded(&self, path: &str) -> bool {
        self.sync_exclusions.iter().any(|pat| !pat.is_empty() && path.contains(pat.as_str()))
    }
}
