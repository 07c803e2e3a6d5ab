//! Object storage access for the ingestor
//! Uses Apache Arrow object_store crate
//!
//! Fetch results are classified so callers can decide between "give up"
//! and "try again" without inspecting backend error types:
//! `Ok(bytes_written) | Err(NotFound) | Err(InvalidKey) | Err(Transient)`.

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use object_store::gcp::GoogleCloudStorageBuilder;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::{ObjectStore, path::Path as StoragePath};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::config::{StorageConfig, StorageProvider};

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Object not found: {bucket}/{object}")]
    NotFound { bucket: String, object: String },

    #[error("Invalid object key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("Transient storage failure: {0}")]
    Transient(String),
}

impl From<std::io::Error> for FetchError {
    fn from(e: std::io::Error) -> Self {
        FetchError::Transient(format!("local I/O error: {e}"))
    }
}

/// Result type
pub type Result<T> = std::result::Result<T, FetchError>;

/// "Fetch bytes of object O from container B into a local file"
#[async_trait]
pub trait ObjectFetcher: Send + Sync {
    /// Download `object` from `bucket` into `dest`, returning bytes written.
    /// `dest` is replaced only once the whole body has arrived. Its parent
    /// directory must exist.
    async fn fetch(&self, bucket: &str, object: &str, dest: &Path) -> Result<u64>;
}

/// Fetcher backed by object_store, one store per bucket
pub struct ObjectStoreFetcher {
    provider: StorageProvider,
    root: PathBuf,
    stores: RwLock<HashMap<String, Arc<dyn ObjectStore>>>,
}

impl ObjectStoreFetcher {
    pub fn new(provider: StorageProvider, root: PathBuf) -> Self {
        Self {
            provider,
            root,
            stores: RwLock::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &StorageConfig) -> Self {
        Self::new(config.provider, config.root.clone())
    }

    /// In-memory buckets for testing/development
    pub fn in_memory() -> Self {
        Self::new(StorageProvider::Memory, PathBuf::new())
    }

    /// Register a pre-built store for `bucket`
    pub async fn insert_store(&self, bucket: &str, store: Arc<dyn ObjectStore>) {
        self.stores.write().await.insert(bucket.to_string(), store);
    }

    async fn store_for(&self, bucket: &str) -> Result<Arc<dyn ObjectStore>> {
        if let Some(store) = self.stores.read().await.get(bucket) {
            return Ok(store.clone());
        }

        let built = self.build_store(bucket)?;
        let mut stores = self.stores.write().await;
        Ok(stores.entry(bucket.to_string()).or_insert(built).clone())
    }

    fn build_store(&self, bucket: &str) -> Result<Arc<dyn ObjectStore>> {
        let store: Arc<dyn ObjectStore> = match self.provider {
            StorageProvider::Gcs => Arc::new(
                GoogleCloudStorageBuilder::from_env()
                    .with_bucket_name(bucket)
                    .build()
                    .map_err(|e| FetchError::Transient(e.to_string()))?,
            ),
            StorageProvider::Local => Arc::new(
                LocalFileSystem::new_with_prefix(self.root.join(bucket))
                    .map_err(|e| FetchError::Transient(e.to_string()))?,
            ),
            StorageProvider::Memory => Arc::new(InMemory::new()),
        };

        tracing::debug!(bucket, provider = ?self.provider, "Created object store");
        Ok(store)
    }
}

fn classify(e: object_store::Error, bucket: &str, object: &str) -> FetchError {
    match e {
        object_store::Error::NotFound { .. } => FetchError::NotFound {
            bucket: bucket.to_string(),
            object: object.to_string(),
        },
        other => FetchError::Transient(other.to_string()),
    }
}

enum WriteError {
    Source(object_store::Error),
    Io(std::io::Error),
}

impl From<std::io::Error> for WriteError {
    fn from(e: std::io::Error) -> Self {
        WriteError::Io(e)
    }
}

/// Sibling of `dest` the body is streamed into before the rename
fn partial_path(dest: &Path) -> PathBuf {
    let name = dest
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    dest.with_file_name(format!(".{name}.{}.part", Uuid::new_v4()))
}

/// Stream into a temporary file next to `dest`, then rename it over `dest`.
/// Readers see either the old file or the complete new one.
async fn write_atomically<S>(dest: &Path, stream: S) -> std::result::Result<u64, WriteError>
where
    S: Stream<Item = object_store::Result<Bytes>> + Unpin,
{
    let partial = partial_path(dest);
    let result = stream_to(&partial, stream).await;

    let result = match result {
        Ok(written) => tokio::fs::rename(&partial, dest)
            .await
            .map(|()| written)
            .map_err(WriteError::Io),
        Err(e) => Err(e),
    };

    if result.is_err() {
        let _ = tokio::fs::remove_file(&partial).await;
    }
    result
}

async fn stream_to<S>(path: &Path, mut stream: S) -> std::result::Result<u64, WriteError>
where
    S: Stream<Item = object_store::Result<Bytes>> + Unpin,
{
    let mut file = tokio::fs::File::create(path).await?;
    let mut written = 0u64;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(WriteError::Source)?;
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.sync_all().await?;

    Ok(written)
}

#[async_trait]
impl ObjectFetcher for ObjectStoreFetcher {
    async fn fetch(&self, bucket: &str, object: &str, dest: &Path) -> Result<u64> {
        let location = StoragePath::parse(object).map_err(|e| FetchError::InvalidKey {
            key: object.to_string(),
            reason: e.to_string(),
        })?;

        let store = self.store_for(bucket).await?;

        // Request the object before touching the destination so a missing
        // object never leaves an empty file behind.
        let result = store
            .get(&location)
            .await
            .map_err(|e| classify(e, bucket, object))?;

        let written = write_atomically(dest, result.into_stream())
            .await
            .map_err(|e| match e {
                WriteError::Source(e) => classify(e, bucket, object),
                WriteError::Io(e) => e.into(),
            })?;

        tracing::info!(bucket, object, size = written, path = %dest.display(), "Downloaded from storage");
        Ok(written)
    }
}
