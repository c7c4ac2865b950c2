//! Similarity retrieval: embed the query, search, rerank, threshold.

use std::fmt;
use std::sync::Arc;

use futures::future::join_all;
use tracing::{debug, info};

use crate::document::{Chunk, Embedding, MetadataFilter, RetrievalResult};
use crate::embedding::EmbeddingProvider;
use crate::error::Result;
use crate::registry::CollectionRegistry;
use crate::reranker::Reranker;

/// Pure query transformation applied before embedding.
pub type QueryRewriter = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// Per-query retrieval knobs.
#[derive(Debug, Clone, PartialEq)]
pub struct RetrievalOptions {
    /// Candidates fetched from the store before thresholding.
    pub k: usize,
    /// Results scoring below this are dropped. Higher trades recall for precision.
    pub min_score: f32,
    /// Metadata equality constraints.
    pub filter: Option<MetadataFilter>,
}

impl Default for RetrievalOptions {
    fn default() -> Self {
        Self { k: 5, min_score: 0.0, filter: None }
    }
}

impl RetrievalOptions {
    pub fn new(k: usize) -> Self {
        Self { k, ..Self::default() }
    }

    pub fn with_min_score(mut self, min_score: f32) -> Self {
        self.min_score = min_score;
        self
    }

    pub fn with_filter(mut self, filter: MetadataFilter) -> Self {
        self.filter = Some(filter);
        self
    }
}

/// Answers similarity queries against registry collections.
///
/// Failures are returned as-is; the retriever never retries on its own.
pub struct Retriever {
    registry: Arc<CollectionRegistry>,
    embedder: Arc<dyn EmbeddingProvider>,
    reranker: Option<Arc<dyn Reranker>>,
    rewriter: Option<QueryRewriter>,
}

impl fmt::Debug for Retriever {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Retriever")
            .field("embedder", &self.embedder.name())
            .field("reranker", &self.reranker.is_some())
            .field("rewriter", &self.rewriter.is_some())
            .finish()
    }
}

impl Retriever {
    pub fn new(registry: Arc<CollectionRegistry>, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        Self { registry, embedder, reranker: None, rewriter: None }
    }

    /// Rerank candidates before the score threshold is applied.
    pub fn with_reranker(mut self, reranker: Arc<dyn Reranker>) -> Self {
        self.reranker = Some(reranker);
        self
    }

    /// Rewrite queries (e.g. expansion) before they are embedded.
    pub fn with_query_rewriter(mut self, rewriter: QueryRewriter) -> Self {
        self.rewriter = Some(rewriter);
        self
    }

    /// Retrieve up to `k` chunks of `collection` scoring at least `min_score`.
    ///
    /// An unknown collection, or nothing clearing the threshold, yields an
    /// empty result rather than an error.
    pub async fn retrieve(
        &self,
        query: &str,
        collection: &str,
        k: usize,
        min_score: f32,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<RetrievalResult>> {
        let Some(handle) = self.registry.existing(collection).await? else {
            debug!(collection, "query against unknown collection");
            return Ok(Vec::new());
        };
        if k == 0 {
            return Ok(Vec::new());
        }

        let rewritten = self.rewriter.as_ref().map(|rewrite| rewrite(query));
        let embedding = self.embedder.embed(rewritten.as_deref().unwrap_or(query)).await?;
        let candidates = self.registry.store().query(&handle, &embedding, k, filter).await?;
        let fetched = candidates.len();

        let mut results = match &self.reranker {
            Some(reranker) => reranker.rerank(query, candidates).await?,
            None => candidates,
        };
        results.retain(|r| r.score >= min_score);
        results.truncate(k);

        info!(collection, k, min_score, fetched, result_count = results.len(), "query completed");
        Ok(results)
    }

    /// [`retrieve`](Self::retrieve) with bundled options.
    pub async fn retrieve_with(
        &self,
        query: &str,
        collection: &str,
        options: &RetrievalOptions,
    ) -> Result<Vec<RetrievalResult>> {
        self.retrieve(query, collection, options.k, options.min_score, options.filter.as_ref()).await
    }

    /// Run independent queries concurrently; results follow input order.
    pub async fn retrieve_many(
        &self,
        queries: &[&str],
        collection: &str,
        options: &RetrievalOptions,
    ) -> Vec<Result<Vec<RetrievalResult>>> {
        join_all(queries.iter().map(|query| self.retrieve_with(query, collection, options))).await
    }

    /// Find up to `k` documents resembling the stored document `document_id`.
    ///
    /// The store is queried with the mean of the document's chunk embeddings.
    /// Each other document is represented by its best-scoring chunk; the
    /// source document never appears. No embedding call is made.
    pub async fn similar_documents(
        &self,
        collection: &str,
        document_id: &str,
        k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<RetrievalResult>> {
        let Some(handle) = self.registry.existing(collection).await? else {
            debug!(collection, "similarity lookup against unknown collection");
            return Ok(Vec::new());
        };
        if k == 0 {
            return Ok(Vec::new());
        }
        let store = self.registry.store();
        let source = store.chunks_for_document(&handle, document_id).await?;
        let Some(centroid) = mean_embedding(&source) else {
            debug!(collection, document.id = document_id, "no stored chunks to compare against");
            return Ok(Vec::new());
        };

        let mut fetch = k + source.len();
        let results = loop {
            let candidates = store.query(&handle, &centroid, fetch, filter).await?;
            let exhausted = candidates.len() < fetch;
            let mut best: Vec<RetrievalResult> = Vec::new();
            for candidate in candidates {
                if candidate.document_id != document_id
                    && !best.iter().any(|r| r.document_id == candidate.document_id)
                {
                    best.push(candidate);
                }
            }
            if best.len() >= k || exhausted {
                best.truncate(k);
                break best;
            }
            fetch *= 2;
        };

        info!(collection, document.id = document_id, k, result_count = results.len(), "similar documents");
        Ok(results)
    }
}

fn mean_embedding(chunks: &[Chunk]) -> Option<Embedding> {
    let dimensions = chunks.first()?.embedding.len();
    let mut sum = vec![0.0f32; dimensions];
    for chunk in chunks {
        for (total, value) in sum.iter_mut().zip(&chunk.embedding) {
            *total += value;
        }
    }
    let n = chunks.len() as f32;
    Some(sum.into_iter().map(|total| total / n).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashingEmbeddingProvider;
    use crate::inmemory::InMemoryVectorStore;

    async fn setup() -> Retriever {
        let registry = Arc::new(CollectionRegistry::open(Arc::new(InMemoryVectorStore::new())));
        let embedder: Arc<dyn EmbeddingProvider> = Arc::new(HashingEmbeddingProvider::new(64).unwrap());
        let handle = registry.collection("notes").await.unwrap();
        let texts = ["rust borrow checker", "python garbage collector", "rust async runtime"];
        let mut chunks = Vec::new();
        for (i, text) in texts.iter().enumerate() {
            chunks.push(Chunk {
                id: format!("doc{i}_0"),
                document_id: format!("doc{i}"),
                text: text.to_string(),
                start_offset: 0,
                end_offset: text.len(),
                sequence_index: 0,
                embedding: embedder.embed(text).await.unwrap(),
                metadata: [("lang".to_string(), if i == 1 { "py" } else { "rs" }.to_string())]
                    .into_iter()
                    .collect(),
            });
        }
        registry.store().add(&handle, &chunks).await.unwrap();
        Retriever::new(registry, embedder)
    }

    #[tokio::test]
    async fn unknown_collection_is_empty() {
        let retriever = setup().await;
        assert!(retriever.retrieve("rust", "missing", 5, 0.0, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn filter_restricts_results() {
        let retriever = setup().await;
        let filter = MetadataFilter::new().require("lang", "py");
        let results = retriever.retrieve("rust garbage", "notes", 5, 0.0, Some(&filter)).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].document_id, "doc1");
    }

    #[tokio::test]
    async fn rewriter_changes_what_is_embedded() {
        let retriever =
            setup().await.with_query_rewriter(Arc::new(|_: &str| "python collector".to_string()));
        let results = retriever.retrieve("anything", "notes", 1, 0.1, None).await.unwrap();
        assert_eq!(results[0].document_id, "doc1");
    }

    #[tokio::test]
    async fn similar_documents_exclude_the_source() {
        let retriever = setup().await;

        let similar = retriever.similar_documents("notes", "doc0", 5, None).await.unwrap();
        let ids: Vec<&str> = similar.iter().map(|r| r.document_id.as_str()).collect();
        assert_eq!(ids.len(), 2);
        assert!(!ids.contains(&"doc0"));
        assert_eq!(ids[0], "doc2");

        let one = retriever.similar_documents("notes", "doc0", 1, None).await.unwrap();
        assert_eq!(one.len(), 1);
        assert_eq!(one[0].document_id, "doc2");

        let filter = MetadataFilter::new().require("lang", "py");
        let py = retriever.similar_documents("notes", "doc0", 5, Some(&filter)).await.unwrap();
        assert_eq!(py.len(), 1);
        assert_eq!(py[0].document_id, "doc1");

        assert!(retriever.similar_documents("notes", "absent", 5, None).await.unwrap().is_empty());
        assert!(retriever.similar_documents("missing", "doc0", 5, None).await.unwrap().is_empty());
        assert!(retriever.similar_documents("notes", "doc0", 0, None).await.unwrap().is_empty());
    }

    #[test]
    fn mean_embedding_averages_component_wise() {
        let chunk = |embedding: Vec<f32>| Chunk {
            id: "d_0".into(),
            document_id: "d".into(),
            text: String::new(),
            start_offset: 0,
            end_offset: 0,
            sequence_index: 0,
            embedding,
            metadata: Default::default(),
        };
        assert_eq!(mean_embedding(&[chunk(vec![1.0, 0.0]), chunk(vec![0.0, 1.0])]), Some(vec![0.5, 0.5]));
        assert_eq!(mean_embedding(&[]), None);
    }

    #[tokio::test]
    async fn retrieve_many_keeps_query_order() {
        let retriever = setup().await;
        let results = retriever
            .retrieve_many(&["python garbage", "borrow checker"], "notes", &RetrievalOptions::new(1))
            .await;
        assert_eq!(results[0].as_ref().unwrap()[0].document_id, "doc1");
        assert_eq!(results[1].as_ref().unwrap()[0].document_id, "doc0");
    }
}
