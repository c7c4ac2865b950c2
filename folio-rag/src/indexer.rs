//! Document ingestion: chunk → embed → store, atomically per document.
//!
//! Re-indexing a document replaces its chunks. Embeddings are computed
//! before the store is touched; the old chunk set is then swapped for the new
//! one, and restored if any insert fails, so a failed call leaves the
//! collection exactly as it was for that document.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex as StdMutex, Weak};

use futures::{StreamExt, TryStreamExt, stream};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::chunking::Chunker;
use crate::document::{Chunk, Document, Embedding};
use crate::embedding::{EmbeddingProvider, ensure_batch_len};
use crate::error::{RagError, Result};
use crate::extract::{PlainTextExtractor, TextExtractor};
use crate::registry::CollectionRegistry;
use crate::retry::{RetryPolicy, with_retry};
use crate::vectorstore::CollectionHandle;

/// Summary of one successful [`DocumentIndexer::index`] call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexResult {
    pub document_id: String,
    /// Chunks now stored for the document.
    pub chunk_count: usize,
    /// Chunks of the previous version that were replaced.
    pub replaced: usize,
    /// Chunks whose embedding came from the cache.
    pub cache_hits: usize,
}

/// Per-document result of [`DocumentIndexer::index_batch`].
#[derive(Debug)]
pub struct DocumentOutcome {
    pub document_id: String,
    pub result: Result<IndexResult>,
}

impl DocumentOutcome {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

type CacheKey = [u8; 32];

/// Bounded embedding cache keyed on `sha256(provider name, text)`.
///
/// When full, the oldest entry is evicted first.
#[derive(Debug)]
pub struct EmbeddingCache {
    capacity: usize,
    inner: StdMutex<CacheInner>,
}

#[derive(Debug, Default)]
struct CacheInner {
    entries: HashMap<CacheKey, Embedding>,
    order: VecDeque<CacheKey>,
}

impl EmbeddingCache {
    /// Create a cache holding at most `capacity` embeddings.
    pub fn new(capacity: usize) -> Self {
        Self { capacity, inner: StdMutex::default() }
    }

    fn key(provider: &str, text: &str) -> CacheKey {
        let mut hasher = Sha256::new();
        hasher.update(provider.as_bytes());
        hasher.update([0u8]);
        hasher.update(text.as_bytes());
        hasher.finalize().into()
    }

    pub fn get(&self, provider: &str, text: &str) -> Option<Embedding> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.entries.get(&Self::key(provider, text)).cloned()
    }

    pub fn insert(&self, provider: &str, text: &str, embedding: Embedding) {
        if self.capacity == 0 {
            return;
        }
        let key = Self::key(provider, text);
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.entries.insert(key, embedding).is_none() {
            inner.order.push_back(key);
        }
        while inner.entries.len() > self.capacity {
            let Some(oldest) = inner.order.pop_front() else { break };
            inner.entries.remove(&oldest);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Orchestrates chunking, embedding and storage for documents.
///
/// # Example
///
/// ```rust,ignore
/// let indexer = DocumentIndexer::new(registry, embedder, Arc::new(RecursiveChunker::new(config)))
///     .with_batching(32, 4)
///     .with_cache(Arc::new(EmbeddingCache::new(10_000)));
///
/// let result = indexer.index("books", &document).await?;
/// ```
pub struct DocumentIndexer {
    registry: Arc<CollectionRegistry>,
    embedder: Arc<dyn EmbeddingProvider>,
    chunker: Arc<dyn Chunker>,
    extractor: Arc<dyn TextExtractor>,
    cache: Option<Arc<EmbeddingCache>>,
    retry: RetryPolicy,
    batch_size: usize,
    max_concurrent_batches: usize,
    locks: StdMutex<HashMap<(String, String), Weak<Mutex<()>>>>,
}

impl DocumentIndexer {
    pub fn new(
        registry: Arc<CollectionRegistry>,
        embedder: Arc<dyn EmbeddingProvider>,
        chunker: Arc<dyn Chunker>,
    ) -> Self {
        Self {
            registry,
            embedder,
            chunker,
            extractor: Arc::new(PlainTextExtractor),
            cache: None,
            retry: RetryPolicy::default(),
            batch_size: 32,
            max_concurrent_batches: 4,
            locks: StdMutex::default(),
        }
    }

    /// Texts per embedding call and embedding calls in flight per document.
    pub fn with_batching(mut self, batch_size: usize, max_concurrent_batches: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self.max_concurrent_batches = max_concurrent_batches.max(1);
        self
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    pub fn with_cache(mut self, cache: Arc<EmbeddingCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_extractor(mut self, extractor: Arc<dyn TextExtractor>) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn embedder(&self) -> &Arc<dyn EmbeddingProvider> {
        &self.embedder
    }

    pub fn chunker(&self) -> &Arc<dyn Chunker> {
        &self.chunker
    }

    /// Index `document` into `collection` with the configured chunker.
    pub async fn index(&self, collection: &str, document: &Document) -> Result<IndexResult> {
        self.index_with(collection, document, self.chunker.as_ref(), &CancellationToken::new())
            .await
    }

    /// Index `document` with an explicit chunker and cancellation signal.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::IndexingFailed`] wrapping the cause, or
    /// [`RagError::Cancelled`]. Either way the document's previous chunks are
    /// still in place.
    pub async fn index_with(
        &self,
        collection: &str,
        document: &Document,
        chunker: &dyn Chunker,
        cancel: &CancellationToken,
    ) -> Result<IndexResult> {
        let lock = self.document_lock(collection, &document.id);
        let _guard = lock.lock().await;

        self.index_locked(collection, document, chunker, cancel).await.map_err(|e| {
            error!(collection, document.id = %document.id, error = %e, "indexing failed");
            RagError::indexing_failed(&document.id, e)
        })
    }

    async fn index_locked(
        &self,
        collection: &str,
        document: &Document,
        chunker: &dyn Chunker,
        cancel: &CancellationToken,
    ) -> Result<IndexResult> {
        let handle = self.registry.collection(collection).await?;

        let mut chunks = chunker.chunk(document);
        let texts: Vec<&str> = chunks.iter().map(|c| c.text.as_str()).collect();
        let (embeddings, cache_hits) = self.embed_texts(&texts, cancel).await?;
        for (chunk, embedding) in chunks.iter_mut().zip(embeddings) {
            chunk.embedding = embedding;
        }

        if cancel.is_cancelled() {
            return Err(RagError::Cancelled);
        }
        let replaced = self.replace(&handle, &document.id, &chunks, cancel).await?;

        info!(
            collection,
            document.id = %document.id,
            chunk_count = chunks.len(),
            replaced,
            cache_hits,
            "indexed document"
        );
        Ok(IndexResult {
            document_id: document.id.clone(),
            chunk_count: chunks.len(),
            replaced,
            cache_hits,
        })
    }

    /// Embed `texts` in order, consulting the cache first.
    async fn embed_texts(
        &self,
        texts: &[&str],
        cancel: &CancellationToken,
    ) -> Result<(Vec<Embedding>, usize)> {
        let provider = self.embedder.name();
        let mut slots: Vec<Option<Embedding>> = texts
            .iter()
            .map(|text| self.cache.as_ref().and_then(|cache| cache.get(provider, text)))
            .collect();
        let cache_hits = slots.iter().filter(|slot| slot.is_some()).count();
        let missing: Vec<usize> = (0..texts.len()).filter(|&i| slots[i].is_none()).collect();

        let batch_size = self.batch_size.min(self.embedder.max_batch_size()).max(1);
        let batches: Vec<&[usize]> = missing.chunks(batch_size).collect();
        debug!(provider, missing = missing.len(), batches = batches.len(), cache_hits, "embedding chunks");

        let embedded: Vec<Vec<Embedding>> = stream::iter(batches.iter().map(|indices| async move {
            let batch: Vec<&str> = indices.iter().map(|&i| texts[i]).collect();
            let vectors =
                with_retry(&self.retry, cancel, || self.embedder.embed_batch(&batch)).await?;
            ensure_batch_len(provider, batch.len(), vectors.len())?;
            Ok::<_, RagError>(vectors)
        }))
        .buffered(self.max_concurrent_batches)
        .try_collect()
        .await?;

        for (indices, vectors) in batches.iter().zip(embedded) {
            for (&i, vector) in indices.iter().zip(vectors) {
                if let Some(cache) = &self.cache {
                    cache.insert(provider, texts[i], vector.clone());
                }
                slots[i] = Some(vector);
            }
        }

        let embeddings = slots.into_iter().collect::<Option<Vec<_>>>().ok_or_else(|| {
            RagError::ProviderUnavailable {
                provider: provider.to_string(),
                message: "embedding batch left chunks without vectors".to_string(),
            }
        })?;
        Ok((embeddings, cache_hits))
    }

    /// Swap the stored chunks of `document_id` for `chunks`.
    ///
    /// The new set goes in with one `add`, so readers see either no chunks of
    /// the document or all of the new version.
    async fn replace(
        &self,
        handle: &CollectionHandle,
        document_id: &str,
        chunks: &[Chunk],
        cancel: &CancellationToken,
    ) -> Result<usize> {
        let store = self.registry.store();
        let previous = store.chunks_for_document(handle, document_id).await?;
        let replaced = store.remove_by_document(handle, document_id).await?;

        let inserted = if cancel.is_cancelled() {
            Err(RagError::Cancelled)
        } else if chunks.is_empty() {
            Ok(())
        } else {
            store.add(handle, chunks).await
        };
        if let Err(e) = inserted {
            self.restore(handle, document_id, &previous).await;
            return Err(e);
        }
        Ok(replaced)
    }

    async fn restore(&self, handle: &CollectionHandle, document_id: &str, previous: &[Chunk]) {
        let store = self.registry.store();
        let restored = async {
            store.remove_by_document(handle, document_id).await?;
            if !previous.is_empty() {
                store.add(handle, previous).await?;
            }
            Ok::<_, RagError>(())
        }
        .await;
        match restored {
            Ok(()) => warn!(
                collection = %handle,
                document.id = document_id,
                restored = previous.len(),
                "rolled back partial insert"
            ),
            Err(e) => error!(
                collection = %handle,
                document.id = document_id,
                error = %e,
                "rollback failed; document left without chunks"
            ),
        }
    }

    /// Index many documents concurrently. One failure never stops the others.
    pub async fn index_batch(&self, collection: &str, documents: &[Document]) -> Vec<DocumentOutcome> {
        let outcomes: Vec<DocumentOutcome> = stream::iter(documents)
            .map(|document| async move {
                DocumentOutcome {
                    document_id: document.id.clone(),
                    result: self.index(collection, document).await,
                }
            })
            .buffered(self.max_concurrent_batches)
            .collect()
            .await;

        let failed = outcomes.iter().filter(|o| !o.is_ok()).count();
        info!(collection, indexed = outcomes.len() - failed, failed, "batch ingestion finished");
        outcomes
    }

    /// Extract text from raw bytes, then index it.
    ///
    /// Extraction failure aborts before any chunking.
    pub async fn index_bytes(
        &self,
        collection: &str,
        document_id: &str,
        bytes: &[u8],
        mime_type: &str,
        metadata: HashMap<String, String>,
    ) -> Result<IndexResult> {
        let text = self.extractor.extract_text(document_id, bytes, mime_type).inspect_err(|e| {
            error!(collection, document.id = document_id, mime_type, error = %e, "extraction failed");
        })?;
        let mut document = Document::new(document_id, text);
        document.metadata = metadata;
        self.index(collection, &document).await
    }

    /// Remove every chunk of a document. Unknown collections report zero.
    pub async fn remove_document(&self, collection: &str, document_id: &str) -> Result<usize> {
        let lock = self.document_lock(collection, document_id);
        let _guard = lock.lock().await;

        let Some(handle) = self.registry.existing(collection).await? else {
            return Ok(0);
        };
        let removed = self.registry.store().remove_by_document(&handle, document_id).await?;
        info!(collection, document.id = document_id, removed, "removed document");
        Ok(removed)
    }

    fn document_lock(&self, collection: &str, document_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.retain(|_, lock| lock.strong_count() > 0);
        let key = (collection.to_string(), document_id.to_string());
        if let Some(lock) = locks.get(&key).and_then(Weak::upgrade) {
            return lock;
        }
        let lock = Arc::new(Mutex::new(()));
        locks.insert(key, Arc::downgrade(&lock));
        lock
    }
}
