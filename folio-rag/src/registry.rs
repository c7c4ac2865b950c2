//! Live collection handles, owned by one long-lived service object.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::{RagError, Result};
use crate::vectorstore::{CollectionHandle, VectorStore};

/// Maps collection names to open [`CollectionHandle`]s on one store.
///
/// Handles are created lazily by [`collection`](Self::collection) and released
/// explicitly. [`close`](Self::close) flushes the store and releases
/// everything; a closed registry refuses to open collections.
pub struct CollectionRegistry {
    store: Arc<dyn VectorStore>,
    handles: RwLock<HashMap<String, CollectionHandle>>,
    closed: AtomicBool,
}

impl CollectionRegistry {
    /// Start a registry over `store`.
    pub fn open(store: Arc<dyn VectorStore>) -> Self {
        debug!(backend = store.backend(), "collection registry opened");
        Self { store, handles: RwLock::default(), closed: AtomicBool::new(false) }
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<dyn VectorStore> {
        &self.store
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RagError::VectorStoreError {
                backend: self.store.backend().to_string(),
                message: "collection registry is closed".to_string(),
            });
        }
        Ok(())
    }

    /// Handle for `name`, creating the collection on first use.
    pub async fn collection(&self, name: &str) -> Result<CollectionHandle> {
        self.ensure_open()?;
        if let Some(handle) = self.handles.read().await.get(name) {
            return Ok(handle.clone());
        }
        let mut handles = self.handles.write().await;
        if let Some(handle) = handles.get(name) {
            return Ok(handle.clone());
        }
        let handle = self.store.get_or_create(name).await?;
        handles.insert(name.to_string(), handle.clone());
        Ok(handle)
    }

    /// Handle for `name` only if the collection already exists.
    pub async fn existing(&self, name: &str) -> Result<Option<CollectionHandle>> {
        self.ensure_open()?;
        if let Some(handle) = self.handles.read().await.get(name) {
            return Ok(Some(handle.clone()));
        }
        if !self.store.exists(name).await? {
            return Ok(None);
        }
        self.collection(name).await.map(Some)
    }

    /// Forget the handle for `name`. The collection's data is kept.
    pub async fn release(&self, name: &str) -> bool {
        self.handles.write().await.remove(name).is_some()
    }

    /// Delete a collection and its chunks. Returns whether it existed.
    pub async fn drop_collection(&self, name: &str) -> Result<bool> {
        self.ensure_open()?;
        self.handles.write().await.remove(name);
        self.store.drop_collection(name).await
    }

    /// Names of collections with an open handle, sorted.
    pub async fn open_collections(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handles.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Flush the store and release every handle. Idempotent.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.store.flush().await?;
        let released = {
            let mut handles = self.handles.write().await;
            let n = handles.len();
            handles.clear();
            n
        };
        info!(backend = self.store.backend(), released, "collection registry closed");
        Ok(())
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
