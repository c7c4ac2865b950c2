//! Vector store trait for storing and searching vector embeddings.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::document::{Chunk, MetadataFilter, RetrievalResult};
use crate::error::Result;

/// Handle to an open collection, returned by [`VectorStore::get_or_create`].
///
/// Handles are cheap to clone and carry no borrow of the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CollectionHandle {
    name: String,
}

impl CollectionHandle {
    /// Wrap a collection name. Backends create handles in `get_or_create`.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    /// The collection name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for CollectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// The similarity metric a store ranks by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SimilarityMetric {
    /// `score = 1 - cosine_distance = cos(a, b)`, clamped to `[0, 1]`.
    Cosine,
}

/// A storage backend for vector embeddings with similarity search.
///
/// A collection is *absent*, *empty* or *populated*; it changes state only via
/// [`get_or_create`](VectorStore::get_or_create), [`add`](VectorStore::add),
/// [`remove_by_document`](VectorStore::remove_by_document) and
/// [`drop_collection`](VectorStore::drop_collection).
///
/// # Example
///
/// ```rust,ignore
/// use folio_rag::{VectorStore, InMemoryVectorStore};
///
/// let store = InMemoryVectorStore::new();
/// let docs = store.get_or_create("docs").await?;
/// store.add(&docs, &chunks).await?;
/// let results = store.query(&docs, &query_embedding, 5, None).await?;
/// ```
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Name of the backend, used in logs and errors.
    fn backend(&self) -> &str;

    /// The metric used to compute [`RetrievalResult::score`].
    fn metric(&self) -> SimilarityMetric {
        SimilarityMetric::Cosine
    }

    /// Open a collection, allocating storage on the first call. Idempotent.
    async fn get_or_create(&self, name: &str) -> Result<CollectionHandle>;

    /// Whether the collection exists, without creating it.
    async fn exists(&self, name: &str) -> Result<bool>;

    /// Insert embedded chunks, replacing any chunk with the same id.
    ///
    /// All-or-nothing per call: a [`DimensionMismatch`](crate::RagError::DimensionMismatch)
    /// or any other failure leaves the collection unchanged.
    async fn add(&self, handle: &CollectionHandle, chunks: &[Chunk]) -> Result<()>;

    /// Return up to `k` chunks ordered by descending score.
    ///
    /// Only chunks whose metadata satisfies `filter` are considered. An
    /// unknown collection yields an empty result.
    async fn query(
        &self,
        handle: &CollectionHandle,
        embedding: &[f32],
        k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<RetrievalResult>>;

    /// All chunks stored for a document, in sequence order.
    async fn chunks_for_document(
        &self,
        handle: &CollectionHandle,
        document_id: &str,
    ) -> Result<Vec<Chunk>>;

    /// Remove every chunk of a document and return how many were removed.
    async fn remove_by_document(&self, handle: &CollectionHandle, document_id: &str)
    -> Result<usize>;

    /// Remove chunks by id and return how many were removed.
    async fn remove_chunks(&self, handle: &CollectionHandle, ids: &[&str]) -> Result<usize>;

    /// Number of chunks in the collection.
    async fn count(&self, handle: &CollectionHandle) -> Result<usize>;

    /// Delete a collection and all its chunks. Returns whether it existed.
    async fn drop_collection(&self, name: &str) -> Result<bool>;

    /// Persist any buffered state. The default does nothing.
    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}
