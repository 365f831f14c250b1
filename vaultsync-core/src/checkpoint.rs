//! Durable journal-sync progress.
//!
//! The checkpoint records everything a node must not repeat: the local
//! change-feed position already packed, the document revisions known to be
//! on the remote, and the journal files already sent or received. It is
//! keyed by a digest of the remote endpoint so pointing the same vault at a
//! different bucket starts from a clean slate.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use tokio::sync::Mutex;

use crate::document::Seq;

/// Small persistent key/value surface for checkpoints.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
    async fn keys(&self, prefix: &str) -> Result<Vec<String>>;
}

/// Progress of journal synchronization against one remote.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckPointInfo {
    /// Local change-feed seq up to which documents have been packed.
    pub last_local_seq: Seq,
    /// `id-rev` pairs known to exist on the remote (sent or received).
    pub known_ids: BTreeSet<String>,
    /// `id-rev` pairs this node itself has packed and uploaded.
    pub sent_ids: BTreeSet<String>,
    /// Journal files already applied locally.
    pub received_files: BTreeSet<String>,
    /// Journal files this node itself uploaded.
    pub sent_files: BTreeSet<String>,
}

impl CheckPointInfo {
    /// The composite key used for dedup filtering.
    pub fn doc_key(id: &str, rev: &str) -> String {
        format!("{id}-{rev}")
    }

    pub fn knows(&self, id: &str, rev: &str) -> bool {
        let key = Self::doc_key(id, rev);
        self.known_ids.contains(&key) || self.sent_ids.contains(&key)
    }
}

/// Checkpoint storage key for a remote, stable across sessions.
pub fn checkpoint_key(endpoint: &str, bucket: &str, region: &str) -> String {
    let digest = Sha256::digest(format!("{endpoint}|{bucket}|{region}").as_bytes());
    format!("bucketsync-checkpoint-{}", hex::encode(digest))
}

/// Load the checkpoint for `key`, defaulting to a fresh one.
pub async fn load_checkpoint(kv: &dyn KvStore, key: &str) -> Result<CheckPointInfo> {
    match kv.get(key).await? {
        Some(raw) => {
            serde_json::from_str(&raw).with_context(|| format!("corrupt checkpoint at {key}"))
        }
        None => Ok(CheckPointInfo::default()),
    }
}

/// Persist the checkpoint under `key`.
pub async fn save_checkpoint(kv: &dyn KvStore, key: &str, info: &CheckPointInfo) -> Result<()> {
    let raw = serde_json::to_string(info).context("serializing checkpoint")?;
    kv.set(key, &raw).await
}

/// In-memory key/value store.
#[derive(Default)]
pub struct MemoryKvStore {
    entries: Mutex<BTreeMap<String, String>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.entries
            .lock()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.lock().await.remove(key);
        Ok(())
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .entries
            .lock()
            .await
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}
