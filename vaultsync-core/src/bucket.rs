//! Remote bucket abstraction for journal synchronization.
//!
//! The journal replicator only needs five primitives from an object store:
//! keyed upload/download of raw bytes, lexicographic listing under a prefix,
//! and the JSON convenience wrappers built on top. Real deployments plug an
//! S3-compatible client in behind this trait; tests use [`MemoryBucket`].

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::Mutex;
use tracing::debug;

/// Minimal object-store surface used by journal sync.
#[async_trait]
pub trait BucketClient: Send + Sync {
    /// Upload `body` under `key`, overwriting any existing object.
    async fn upload_file(&self, key: &str, body: Bytes, mime: &str) -> Result<()>;

    /// Download the object at `key`; `None` when absent.
    async fn download_file(&self, key: &str) -> Result<Option<Bytes>>;

    /// All keys starting with `prefix`, in ascending lexicographic order.
    async fn list_files(&self, prefix: &str) -> Result<Vec<String>>;

    /// Delete every object in the bucket.
    async fn reset_bucket(&self) -> Result<()>;
}

/// Serialize `value` and upload it as JSON under `key`.
pub async fn upload_json<T: Serialize + Sync>(
    client: &dyn BucketClient,
    key: &str,
    value: &T,
) -> Result<()> {
    let body = serde_json::to_vec(value).with_context(|| format!("serializing {key}"))?;
    client.upload_file(key, Bytes::from(body), "application/json").await
}

/// Download and deserialize the JSON object at `key`; `None` when absent.
pub async fn download_json<T: DeserializeOwned>(
    client: &dyn BucketClient,
    key: &str,
) -> Result<Option<T>> {
    let Some(body) = client.download_file(key).await? else {
        return Ok(None);
    };
    let value = serde_json::from_slice(&body).with_context(|| format!("deserializing {key}"))?;
    Ok(Some(value))
}

/// In-memory bucket with failure injection and download accounting.
#[derive(Default)]
pub struct MemoryBucket {
    objects: Mutex<BTreeMap<String, Bytes>>,
    fail_uploads: AtomicBool,
    downloads: AtomicUsize,
}

impl MemoryBucket {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent upload fail (simulated outage).
    pub fn set_fail_uploads(&self, fail: bool) {
        self.fail_uploads.store(fail, Ordering::SeqCst);
    }

    /// How many downloads have been served so far.
    pub fn download_count(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }

    pub async fn len(&self) -> usize {
        self.objects.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.objects.lock().await.is_empty()
    }
}

#[async_trait]
impl BucketClient for MemoryBucket {
    async fn upload_file(&self, key: &str, body: Bytes, _mime: &str) -> Result<()> {
        if self.fail_uploads.load(Ordering::SeqCst) {
            anyhow::bail!("upload of {key} refused (injected failure)");
        }
        debug!(key, bytes = body.len(), "bucket upload");
        self.objects.lock().await.insert(key.to_string(), body);
        Ok(())
    }

    async fn download_file(&self, key: &str) -> Result<Option<Bytes>> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        Ok(self.objects.lock().await.get(key).cloned())
    }

    async fn list_files(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .objects
            .lock()
            .await
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn reset_bucket(&self) -> Result<()> {
        self.objects.lock().await.clear();
        Ok(())
    }
}
