/// Content Store Module
///
/// Local content-addressed blob cache keyed by CID. The store is a
/// collaborator interface so deployments can plug in a durable backend; the
/// core itself persists nothing. Each node owns its own store instance,
/// injected at construction and closed during shutdown. There is no
/// process-global store.
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use crate::content_id::ContentId;
use crate::error::{MeshError, MeshResult};

/// Pluggable content-addressed blob storage.
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Store bytes under a content id, replacing any previous value.
    async fn put(&self, cid: &ContentId, bytes: Vec<u8>) -> MeshResult<()>;

    /// Fetch bytes for a content id.
    async fn get(&self, cid: &ContentId) -> MeshResult<Option<Vec<u8>>>;

    /// True if the store holds the content id.
    async fn has(&self, cid: &ContentId) -> bool;

    /// Remove a content id; removing an absent id is not an error.
    async fn delete(&self, cid: &ContentId) -> MeshResult<()>;

    /// Release resources. Further calls must fail.
    async fn close(&self) -> MeshResult<()>;
}

/// Volatile in-process content store.
pub struct MemoryContentStore {
    blobs: RwLock<HashMap<ContentId, Arc<Vec<u8>>>>,
    closed: RwLock<bool>,
}

impl MemoryContentStore {
    pub fn new() -> Self {
        Self {
            blobs: RwLock::new(HashMap::new()),
            closed: RwLock::new(false),
        }
    }

    /// Number of stored blobs.
    pub async fn len(&self) -> usize {
        self.blobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.blobs.read().await.is_empty()
    }

    async fn ensure_open(&self) -> MeshResult<()> {
        if *self.closed.read().await {
            return Err(MeshError::BadRequest("content store is closed".to_string()));
        }
        Ok(())
    }
}

impl Default for MemoryContentStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContentStore for MemoryContentStore {
    async fn put(&self, cid: &ContentId, bytes: Vec<u8>) -> MeshResult<()> {
        self.ensure_open().await?;
        debug!("storing {} ({} bytes)", cid, bytes.len());
        self.blobs.write().await.insert(*cid, Arc::new(bytes));
        Ok(())
    }

    async fn get(&self, cid: &ContentId) -> MeshResult<Option<Vec<u8>>> {
        self.ensure_open().await?;
        Ok(self
            .blobs
            .read()
            .await
            .get(cid)
            .map(|bytes| bytes.as_ref().clone()))
    }

    async fn has(&self, cid: &ContentId) -> bool {
        self.blobs.read().await.contains_key(cid)
    }

    async fn delete(&self, cid: &ContentId) -> MeshResult<()> {
        self.ensure_open().await?;
        self.blobs.write().await.remove(cid);
        Ok(())
    }

    async fn close(&self) -> MeshResult<()> {
        *self.closed.write().await = true;
        self.blobs.write().await.clear();
        Ok(())
    }
}
