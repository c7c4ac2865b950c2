//! In-memory vector store using cosine similarity.
//!
//! This module provides [`InMemoryVectorStore`], a brute-force vector store
//! backed by per-collection tables behind `tokio::sync::RwLock`s. Queries scan
//! every chunk of the collection, which is fine up to a few hundred thousand
//! chunks. An optional snapshot directory persists each collection as a
//! JSON-lines file (see [`crate::snapshot`]).

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::document::{Chunk, MetadataFilter, RetrievalResult};
use crate::error::{RagError, Result};
use crate::snapshot;
use crate::vectorstore::{CollectionHandle, VectorStore};

const BACKEND: &str = "in-memory";

/// Chunks of one collection plus a per-document index.
#[derive(Debug, Default)]
struct ChunkTable {
    /// Established by the first insert; cleared when the table empties.
    dimensions: Option<usize>,
    chunks: HashMap<String, Chunk>,
    /// document id → sequence index → chunk id
    by_document: HashMap<String, BTreeMap<usize, String>>,
    dirty: bool,
}

impl ChunkTable {
    fn from_chunks(dimensions: Option<usize>, chunks: Vec<Chunk>) -> Self {
        let mut table = Self { dimensions, ..Self::default() };
        for chunk in chunks {
            table.insert(chunk);
        }
        if table.chunks.is_empty() {
            table.dimensions = None;
        }
        table.dirty = false;
        table
    }

    fn insert(&mut self, chunk: Chunk) {
        if let Some(previous) = self.chunks.get(&chunk.id) {
            let (doc, seq) = (previous.document_id.clone(), previous.sequence_index);
            self.unindex(&doc, seq);
        }
        self.by_document
            .entry(chunk.document_id.clone())
            .or_default()
            .insert(chunk.sequence_index, chunk.id.clone());
        self.chunks.insert(chunk.id.clone(), chunk);
        self.dirty = true;
    }

    fn remove(&mut self, id: &str) -> bool {
        let Some(chunk) = self.chunks.remove(id) else {
            return false;
        };
        self.unindex(&chunk.document_id, chunk.sequence_index);
        self.dirty = true;
        true
    }

    fn unindex(&mut self, document_id: &str, sequence_index: usize) {
        if let Some(entries) = self.by_document.get_mut(document_id) {
            entries.remove(&sequence_index);
            if entries.is_empty() {
                self.by_document.remove(document_id);
            }
        }
    }

    fn settle_dimensions(&mut self) {
        if self.chunks.is_empty() {
            self.dimensions = None;
        }
    }
}

type SharedTable = Arc<RwLock<ChunkTable>>;

/// An in-memory vector store using cosine similarity for search.
///
/// Each collection has its own lock, so writers to one collection never block
/// readers of another. A batch passed to [`add`](VectorStore::add) becomes
/// visible to queries all at once.
///
/// # Example
///
/// ```rust,ignore
/// use folio_rag::{InMemoryVectorStore, VectorStore};
///
/// let store = InMemoryVectorStore::new();
/// let docs = store.get_or_create("docs").await?;
/// store.add(&docs, &chunks).await?;
/// ```
#[derive(Debug, Default)]
pub struct InMemoryVectorStore {
    collections: RwLock<HashMap<String, SharedTable>>,
    snapshot_dir: Option<PathBuf>,
}

impl InMemoryVectorStore {
    /// Create a new empty in-memory vector store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store that loads collections from, and flushes them to, `dir`.
    ///
    /// Collections are loaded lazily on first open. Snapshots with an unknown
    /// format or version are ignored and the collection starts empty.
    pub fn with_snapshot_dir(dir: impl Into<PathBuf>) -> Self {
        Self { collections: RwLock::default(), snapshot_dir: Some(dir.into()) }
    }

    fn snapshot_path(&self, name: &str) -> Option<PathBuf> {
        self.snapshot_dir.as_ref().map(|dir| dir.join(format!("{name}.jsonl")))
    }

    async fn table(&self, name: &str) -> Option<SharedTable> {
        self.collections.read().await.get(name).cloned()
    }
}

/// Collection names become file names, so keep them to a safe alphabet.
fn validate_collection_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= 128
        && !name.starts_with('.')
        && name.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(RagError::InvalidInput {
            provider: BACKEND.to_string(),
            message: format!(
                "invalid collection name '{name}': use 1-128 ASCII letters, digits, '-', '_' or '.'"
            ),
        })
    }
}

/// Compute cosine similarity between two vectors.
///
/// Returns 0.0 if either vector has zero magnitude or the lengths differ.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

/// Cosine similarity mapped onto the `[0, 1]` score range.
pub fn cosine_score(a: &[f32], b: &[f32]) -> f32 {
    cosine_similarity(a, b).clamp(0.0, 1.0)
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    fn backend(&self) -> &str {
        BACKEND
    }

    async fn get_or_create(&self, name: &str) -> Result<CollectionHandle> {
        validate_collection_name(name)?;
        if self.table(name).await.is_some() {
            return Ok(CollectionHandle::new(name));
        }

        let mut collections = self.collections.write().await;
        if !collections.contains_key(name) {
            let table = match self.snapshot_path(name) {
                Some(path) => {
                    let loaded = snapshot::load(&path).await;
                    ChunkTable::from_chunks(loaded.dimensions, loaded.chunks)
                }
                None => ChunkTable::default(),
            };
            debug!(collection = name, chunk_count = table.chunks.len(), "collection opened");
            collections.insert(name.to_string(), Arc::new(RwLock::new(table)));
        }
        Ok(CollectionHandle::new(name))
    }

    async fn exists(&self, name: &str) -> Result<bool> {
        if self.table(name).await.is_some() {
            return Ok(true);
        }
        match self.snapshot_path(name) {
            Some(path) if validate_collection_name(name).is_ok() => {
                Ok(tokio::fs::try_exists(path).await?)
            }
            _ => Ok(false),
        }
    }

    async fn add(&self, handle: &CollectionHandle, chunks: &[Chunk]) -> Result<()> {
        let table = self.table(handle.name()).await.ok_or_else(|| RagError::VectorStoreError {
            backend: BACKEND.to_string(),
            message: format!("collection '{handle}' does not exist"),
        })?;
        if chunks.is_empty() {
            return Ok(());
        }

        let mut table = table.write().await;

        // Validate the whole batch before touching the table.
        let expected = table.dimensions.unwrap_or(chunks[0].embedding.len());
        for chunk in chunks {
            if chunk.embedding.is_empty() {
                return Err(RagError::InvalidInput {
                    provider: BACKEND.to_string(),
                    message: format!("chunk '{}' has no embedding", chunk.id),
                });
            }
            if chunk.embedding.len() != expected {
                return Err(RagError::DimensionMismatch {
                    collection: handle.name().to_string(),
                    expected,
                    actual: chunk.embedding.len(),
                });
            }
        }

        table.dimensions = Some(expected);
        for chunk in chunks {
            table.insert(chunk.clone());
        }
        debug!(collection = %handle, added = chunks.len(), total = table.chunks.len(), "chunks added");
        Ok(())
    }

    async fn query(
        &self,
        handle: &CollectionHandle,
        embedding: &[f32],
        k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<RetrievalResult>> {
        let Some(table) = self.table(handle.name()).await else {
            return Ok(Vec::new());
        };
        let table = table.read().await;
        if k == 0 || table.chunks.is_empty() {
            return Ok(Vec::new());
        }
        match table.dimensions {
            Some(expected) if expected != embedding.len() => {
                return Err(RagError::DimensionMismatch {
                    collection: handle.name().to_string(),
                    expected,
                    actual: embedding.len(),
                });
            }
            _ => {}
        }

        let mut scored: Vec<(f32, &Chunk)> = table
            .chunks
            .values()
            .filter(|chunk| filter.is_none_or(|f| f.matches(&chunk.metadata)))
            .map(|chunk| (cosine_score(&chunk.embedding, embedding), chunk))
            .collect();

        // Ties break on chunk id so results are reproducible.
        scored.sort_by(|(sa, ca), (sb, cb)| {
            sb.partial_cmp(sa).unwrap_or(std::cmp::Ordering::Equal).then_with(|| ca.id.cmp(&cb.id))
        });
        scored.truncate(k);

        Ok(scored
            .into_iter()
            .map(|(score, chunk)| RetrievalResult::new(chunk.clone(), score))
            .collect())
    }

    async fn chunks_for_document(
        &self,
        handle: &CollectionHandle,
        document_id: &str,
    ) -> Result<Vec<Chunk>> {
        let Some(table) = self.table(handle.name()).await else {
            return Ok(Vec::new());
        };
        let table = table.read().await;
        let Some(ids) = table.by_document.get(document_id) else {
            return Ok(Vec::new());
        };
        Ok(ids.values().filter_map(|id| table.chunks.get(id).cloned()).collect())
    }

    async fn remove_by_document(
        &self,
        handle: &CollectionHandle,
        document_id: &str,
    ) -> Result<usize> {
        let Some(table) = self.table(handle.name()).await else {
            return Ok(0);
        };
        let mut table = table.write().await;
        let ids: Vec<String> = table
            .by_document
            .get(document_id)
            .map(|entries| entries.values().cloned().collect())
            .unwrap_or_default();
        let removed = ids.iter().filter(|id| table.remove(id)).count();
        table.settle_dimensions();
        debug!(collection = %handle, document_id, removed, "document chunks removed");
        Ok(removed)
    }

    async fn remove_chunks(&self, handle: &CollectionHandle, ids: &[&str]) -> Result<usize> {
        let Some(table) = self.table(handle.name()).await else {
            return Ok(0);
        };
        let mut table = table.write().await;
        let removed = ids.iter().filter(|id| table.remove(id)).count();
        table.settle_dimensions();
        Ok(removed)
    }

    async fn count(&self, handle: &CollectionHandle) -> Result<usize> {
        match self.table(handle.name()).await {
            Some(table) => Ok(table.read().await.chunks.len()),
            None => Ok(0),
        }
    }

    async fn drop_collection(&self, name: &str) -> Result<bool> {
        let existed = self.collections.write().await.remove(name).is_some();
        let mut removed_file = false;
        if let Some(path) = self.snapshot_path(name).filter(|_| validate_collection_name(name).is_ok()) {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => removed_file = true,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        if existed || removed_file {
            info!(collection = name, "collection dropped");
        }
        Ok(existed || removed_file)
    }

    async fn flush(&self) -> Result<()> {
        if self.snapshot_dir.is_none() {
            return Ok(());
        }
        let tables: Vec<(String, SharedTable)> = self
            .collections
            .read()
            .await
            .iter()
            .map(|(name, table)| (name.clone(), Arc::clone(table)))
            .collect();

        for (name, table) in tables {
            let mut table = table.write().await;
            if !table.dirty {
                continue;
            }
            let Some(path) = self.snapshot_path(&name) else { continue };
            let mut chunks: Vec<&Chunk> = table.chunks.values().collect();
            chunks.sort_by(|a, b| a.id.cmp(&b.id));
            snapshot::save(&path, table.dimensions, &chunks).await?;
            debug!(collection = %name, chunk_count = chunks.len(), "collection flushed");
            table.dirty = false;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(doc: &str, seq: usize, embedding: Vec<f32>) -> Chunk {
        Chunk {
            id: Chunk::make_id(doc, seq),
            document_id: doc.to_string(),
            text: format!("{doc} part {seq}"),
            start_offset: 0,
            end_offset: 1,
            sequence_index: seq,
            embedding,
            metadata: HashMap::new(),
        }
    }

    #[test]
    fn cosine_of_opposite_vectors_scores_zero() {
        assert_eq!(cosine_score(&[1.0, 0.0], &[-1.0, 0.0]), 0.0);
        assert!((cosine_score(&[1.0, 1.0], &[2.0, 2.0]) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn collection_names_are_restricted() {
        assert!(validate_collection_name("books-2024_v1.0").is_ok());
        assert!(validate_collection_name("").is_err());
        assert!(validate_collection_name("../etc").is_err());
        assert!(validate_collection_name("a/b").is_err());
    }

    #[tokio::test]
    async fn mismatched_batch_leaves_collection_unchanged() {
        let store = InMemoryVectorStore::new();
        let handle = store.get_or_create("c").await.unwrap();
        store.add(&handle, &[chunk("a", 0, vec![1.0, 0.0])]).await.unwrap();

        let err = store
            .add(&handle, &[chunk("b", 0, vec![0.0, 1.0]), chunk("b", 1, vec![1.0, 0.0, 0.0])])
            .await
            .unwrap_err();

        assert!(matches!(err, RagError::DimensionMismatch { expected: 2, actual: 3, .. }));
        assert_eq!(store.count(&handle).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn emptied_collection_accepts_new_dimensions() {
        let store = InMemoryVectorStore::new();
        let handle = store.get_or_create("c").await.unwrap();
        store.add(&handle, &[chunk("a", 0, vec![1.0, 0.0])]).await.unwrap();
        assert_eq!(store.remove_by_document(&handle, "a").await.unwrap(), 1);

        store.add(&handle, &[chunk("a", 0, vec![1.0, 0.0, 0.0])]).await.unwrap();
        assert_eq!(store.count(&handle).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn replacing_a_chunk_id_keeps_document_index_consistent() {
        let store = InMemoryVectorStore::new();
        let handle = store.get_or_create("c").await.unwrap();
        store.add(&handle, &[chunk("a", 0, vec![1.0, 0.0])]).await.unwrap();
        store.add(&handle, &[chunk("a", 0, vec![0.0, 1.0])]).await.unwrap();

        let chunks = store.chunks_for_document(&handle, "a").await.unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].embedding, vec![0.0, 1.0]);
    }

    #[tokio::test]
    async fn flush_and_reopen_restores_collection() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = InMemoryVectorStore::with_snapshot_dir(dir.path());
            let handle = store.get_or_create("books").await.unwrap();
            store.add(&handle, &[chunk("a", 0, vec![1.0, 0.0]), chunk("a", 1, vec![0.0, 1.0])])
                .await
                .unwrap();
            store.flush().await.unwrap();
        }

        let store = InMemoryVectorStore::with_snapshot_dir(dir.path());
        assert!(store.exists("books").await.unwrap());
        let handle = store.get_or_create("books").await.unwrap();
        assert_eq!(store.count(&handle).await.unwrap(), 2);
        let results = store.query(&handle, &[0.0, 1.0], 1, None).await.unwrap();
        assert_eq!(results[0].chunk.id, "a_1");
        let err = store.add(&handle, &[chunk("b", 0, vec![1.0, 0.0, 0.0])]).await.unwrap_err();
        assert!(matches!(err, RagError::DimensionMismatch { expected: 2, actual: 3, .. }));

        assert!(store.drop_collection("books").await.unwrap());
        assert!(!store.exists("books").await.unwrap());
    }

    #[tokio::test]
    async fn snapshot_without_dimensions_reopens_empty() {
        let dir = tempfile::tempdir().unwrap();
        let header = r#"{"format":"folio-rag-snapshot","version":1,"dimensions":null,"metric":"cosine","saved_at":"2026-01-01T00:00:00Z"}"#;
        let record = |id: &str, vector: &str| {
            format!(
                r#"{{"chunk_id":"{id}_0","document_id":"{id}","text":"t","start_offset":0,"end_offset":1,"sequence_index":0,"metadata":{{}},"vector":{vector}}}"#
            )
        };
        let content = format!("{header}\n{}\n{}\n", record("a", "[1.0,0.0]"), record("b", "[0.0,1.0,0.0]"));
        tokio::fs::write(dir.path().join("books.jsonl"), content).await.unwrap();

        let store = InMemoryVectorStore::with_snapshot_dir(dir.path());
        let handle = store.get_or_create("books").await.unwrap();
        assert_eq!(store.count(&handle).await.unwrap(), 0);

        store.add(&handle, &[chunk("c", 0, vec![1.0, 0.0])]).await.unwrap();
        let err = store.add(&handle, &[chunk("d", 0, vec![1.0; 5])]).await.unwrap_err();
        assert!(matches!(err, RagError::DimensionMismatch { expected: 2, actual: 5, .. }));
    }
}
