//! Document model for the vault synchronization core.
//!
//! Everything stored in the document database is an `EntryDoc`: a
//! content-addressed chunk (leaf), a plain or binary file entry referencing
//! an ordered list of chunks, or the milestone record shared by all
//! synchronizing devices. Consumers match exhaustively on the variant.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Prefix for content-addressed chunk document ids.
pub const CHUNK_ID_PREFIX: &str = "h:";

/// Suffix marking a chunk id whose content is stored encrypted.
pub const ENCRYPTED_ID_SUFFIX: char = '+';

/// Fixed id of the milestone document.
pub const MILESTONE_DOC_ID: &str = "_vaultsync_milestone";

/// Opaque string key in the document store.
///
/// Chunk ids are `h:` + content hash (trailing `+` when the content is
/// encrypted); file entries use path-derived or obfuscated ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(String);

impl DocumentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Derive an entry id from a vault path.
    pub fn from_path(path: &str, obfuscate: bool) -> Self {
        if obfuscate {
            let digest = Sha256::digest(path.as_bytes());
            Self(format!("f:{}", hex::encode(digest)))
        } else {
            Self(path.to_string())
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this id addresses a chunk (leaf) document.
    pub fn is_chunk(&self) -> bool {
        self.0.starts_with(CHUNK_ID_PREFIX)
    }

    /// Whether this chunk id refers to encrypted content.
    pub fn is_encrypted(&self) -> bool {
        self.0.ends_with(ENCRYPTED_ID_SUFFIX)
    }
}

impl std::fmt::Display for DocumentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DocumentId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Sequence number in the document store's change feed.
pub type Seq = u64;

/// CouchDB-style revision: `generation-hash`.
///
/// Ordering follows the store's winner rule: higher generation wins, ties
/// broken by the lexicographically greater hash, so every replica picks the
/// same winner deterministically.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Revision(String);

impl Revision {
    /// Build a revision for `doc` following `parent`.
    pub fn next(parent: Option<&Revision>, doc: &EntryDoc) -> Self {
        let generation = parent.map(|p| p.generation() + 1).unwrap_or(1);
        let body = serde_json::to_vec(doc).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(generation.to_le_bytes());
        hasher.update(&body);
        let digest = hasher.finalize();
        Self(format!("{}-{}", generation, &hex::encode(digest)[..16]))
    }

    pub fn parse(s: &str) -> Self {
        Self(s.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Generation component (the number before the dash).
    pub fn generation(&self) -> u64 {
        self.0
            .split_once('-')
            .and_then(|(g, _)| g.parse().ok())
            .unwrap_or(0)
    }
}

impl PartialOrd for Revision {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Revision {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.generation()
            .cmp(&other.generation())
            .then_with(|| self.0.cmp(&other.0))
    }
}

impl std::fmt::Display for Revision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Content-addressed leaf chunk. Immutable once written: the content fully
/// determines the id, so two writes of identical content converge on the
/// same stored bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkDoc {
    pub id: DocumentId,
    pub data: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub deleted: bool,
}

impl ChunkDoc {
    pub fn new(id: DocumentId, data: impl Into<String>) -> Self {
        Self {
            id,
            data: data.into(),
            deleted: false,
        }
    }
}

/// A small chunk inlined in its parent document while incubating.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdenChunk {
    pub data: String,
    /// Incubation epoch: bumped each time the parent is rewritten while the
    /// chunk stays inlined.
    pub epoch: u32,
}

/// File entry: metadata plus the ordered chunk list whose concatenation
/// (with eden substitution) reproduces the exact original content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub id: DocumentId,
    pub path: String,
    pub ctime: i64,
    pub mtime: i64,
    pub size: u64,
    pub children: Vec<DocumentId>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub eden: BTreeMap<DocumentId, EdenChunk>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub deleted: bool,
}

/// Per-node journal version info carried by the milestone document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeChunkInfo {
    pub min: u32,
    pub max: u32,
    pub current: u32,
}

/// Versioning/compatibility record shared by all devices via the remote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MilestoneDoc {
    pub created: i64,
    pub locked: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub cleaned: bool,
    pub accepted_nodes: Vec<String>,
    pub node_chunk_info: BTreeMap<String, NodeChunkInfo>,
}

/// Everything the document store holds, tagged by kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EntryDoc {
    #[serde(rename = "chunk")]
    Chunk(ChunkDoc),
    #[serde(rename = "plain")]
    Plain(FileEntry),
    #[serde(rename = "binary")]
    Binary(FileEntry),
    #[serde(rename = "milestone")]
    Milestone(MilestoneDoc),
}

impl EntryDoc {
    /// Document id this doc is stored under.
    pub fn id(&self) -> DocumentId {
        match self {
            EntryDoc::Chunk(c) => c.id.clone(),
            EntryDoc::Plain(e) | EntryDoc::Binary(e) => e.id.clone(),
            EntryDoc::Milestone(_) => DocumentId::new(MILESTONE_DOC_ID),
        }
    }

    pub fn is_deleted(&self) -> bool {
        match self {
            EntryDoc::Chunk(c) => c.deleted,
            EntryDoc::Plain(e) | EntryDoc::Binary(e) => e.deleted,
            EntryDoc::Milestone(_) => false,
        }
    }

    pub fn as_chunk(&self) -> Option<&ChunkDoc> {
        match self {
            EntryDoc::Chunk(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_file(&self) -> Option<&FileEntry> {
        match self {
            EntryDoc::Plain(e) | EntryDoc::Binary(e) => Some(e),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_id_prefix_and_marker() {
        let plain = DocumentId::new("h:abcdef");
        assert!(plain.is_chunk());
        assert!(!plain.is_encrypted());

        let encrypted = DocumentId::new("h:abcdef+");
        assert!(encrypted.is_chunk());
        assert!(encrypted.is_encrypted());

        let entry = DocumentId::from_path("notes/today.md", false);
        assert!(!entry.is_chunk());
        assert_eq!(entry.as_str(), "notes/today.md");
    }

    #[test]
    fn obfuscated_path_id_is_deterministic() {
        let a = DocumentId::from_path("notes/today.md", true);
        let b = DocumentId::from_path("notes/today.md", true);
        assert_eq!(a, b);
        assert!(a.as_str().starts_with("f:"));
        assert_ne!(a, DocumentId::from_path("notes/tomorrow.md", true));
    }

    #[test]
    fn revision_ordering_follows_generation_then_hash() {
        let r1 = Revision::parse("1-aa");
        let r2 = Revision::parse("2-aa");
        let r2b = Revision::parse("2-bb");
        assert!(r1 < r2);
        assert!(r2 < r2b);
        assert_eq!(r2b.generation(), 2);
    }

    #[test]
    fn entry_doc_tagged_round_trip() {
        let doc = EntryDoc::Chunk(ChunkDoc::new(DocumentId::new("h:00ff"), "hello"));
        let json = serde_json::to_string(&doc).unwrap();
        assert!(json.contains("\"type\":\"chunk\""));
        let back: EntryDoc = serde_json::from_str(&json).unwrap();
        assert_eq!(back, doc);
    }
}
