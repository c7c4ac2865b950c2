//! RAG pipeline orchestrator.
//!
//! The [`RagPipeline`] wires a [`CollectionRegistry`], a [`DocumentIndexer`],
//! a [`Retriever`] and an [`AnswerGenerator`] around one embedding provider,
//! one completion provider and one vector store.
//!
//! # Example
//!
//! ```rust,ignore
//! use folio_rag::{Document, RagConfig, RagPipeline};
//!
//! let pipeline = RagPipeline::from_config(&RagConfig::from_file("folio.toml")?)?;
//!
//! pipeline.ingest("books", &Document::new("moby-dick", text)).await?;
//! let answer = pipeline.ask("books", "Who is Ishmael?").await?;
//! println!("{} {:?}", answer.answer, answer.cited_document_ids);
//! pipeline.close().await?;
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::chunking::{ChunkConfig, Chunker, RecursiveChunker};
use crate::completion::CompletionProvider;
use crate::config::RagConfig;
use crate::document::{Document, MetadataFilter, RetrievalResult};
use crate::embedding::EmbeddingProvider;
use crate::error::{RagError, Result};
use crate::generator::{AnswerGenerator, AnswerStream, GeneratedAnswer, PromptTemplate};
use crate::indexer::{DocumentIndexer, DocumentOutcome, EmbeddingCache, IndexResult};
use crate::inmemory::InMemoryVectorStore;
use crate::provider::{build_completion_provider, build_embedding_provider};
use crate::registry::CollectionRegistry;
use crate::reranker::Reranker;
use crate::retriever::{QueryRewriter, RetrievalOptions, Retriever};
use crate::vectorstore::VectorStore;

/// The RAG pipeline orchestrator.
///
/// Coordinates document ingestion (extract → chunk → embed → store) and query
/// execution (embed → search → rerank → filter → generate). Construct one via
/// [`RagPipeline::builder()`] or [`RagPipeline::from_config`].
pub struct RagPipeline {
    config: RagConfig,
    registry: Arc<CollectionRegistry>,
    indexer: DocumentIndexer,
    retriever: Retriever,
    generator: Option<AnswerGenerator>,
}

impl RagPipeline {
    /// Create a new [`RagPipelineBuilder`].
    pub fn builder() -> RagPipelineBuilder {
        RagPipelineBuilder::default()
    }

    /// Validate `config` and build the providers and store it names.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::ConfigError`] for invalid settings or missing credentials.
    pub fn from_config(config: &RagConfig) -> Result<Self> {
        config.validate()?;
        Self::builder()
            .config(config.clone())
            .embedding_provider(build_embedding_provider(&config.embedding)?)
            .completion_provider(build_completion_provider(&config.completion)?)
            .build()
    }

    /// Return a reference to the pipeline configuration.
    pub fn config(&self) -> &RagConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<CollectionRegistry> {
        &self.registry
    }

    pub fn indexer(&self) -> &DocumentIndexer {
        &self.indexer
    }

    pub fn retriever(&self) -> &Retriever {
        &self.retriever
    }

    fn generator(&self) -> Result<&AnswerGenerator> {
        self.generator.as_ref().ok_or_else(|| {
            RagError::ConfigError("no completion provider configured for this pipeline".to_string())
        })
    }

    /// Index a document, replacing any previous version.
    pub async fn ingest(&self, collection: &str, document: &Document) -> Result<IndexResult> {
        self.indexer.index(collection, document).await
    }

    /// Extract text from raw bytes and index it.
    pub async fn ingest_bytes(
        &self,
        collection: &str,
        document_id: &str,
        bytes: &[u8],
        mime_type: &str,
        metadata: HashMap<String, String>,
    ) -> Result<IndexResult> {
        self.indexer.index_bytes(collection, document_id, bytes, mime_type, metadata).await
    }

    /// Index several documents, reporting a result for each.
    pub async fn ingest_batch(&self, collection: &str, documents: &[Document]) -> Vec<DocumentOutcome> {
        self.indexer.index_batch(collection, documents).await
    }

    /// Remove a document's chunks. Returns how many were removed.
    pub async fn remove_document(&self, collection: &str, document_id: &str) -> Result<usize> {
        self.indexer.remove_document(collection, document_id).await
    }

    /// Retrieve with the configured `top_k` and `min_score`.
    pub async fn query(&self, collection: &str, query: &str) -> Result<Vec<RetrievalResult>> {
        self.retriever
            .retrieve(query, collection, self.config.top_k, self.config.min_score, None)
            .await
    }

    /// Retrieve with explicit options.
    pub async fn query_with(
        &self,
        collection: &str,
        query: &str,
        options: &RetrievalOptions,
    ) -> Result<Vec<RetrievalResult>> {
        self.retriever.retrieve_with(query, collection, options).await
    }

    /// Documents resembling `document_id`, best chunk per document, the
    /// source excluded. See [`Retriever::similar_documents`].
    pub async fn similar_documents(
        &self,
        collection: &str,
        document_id: &str,
        k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<RetrievalResult>> {
        self.retriever.similar_documents(collection, document_id, k, filter).await
    }

    /// Retrieve, then generate a grounded answer.
    pub async fn ask(&self, collection: &str, question: &str) -> Result<GeneratedAnswer> {
        let generator = self.generator()?;
        let retrieved = self.query(collection, question).await?;
        generator.generate(question, &retrieved).await
    }

    /// [`ask`](Self::ask) with explicit retrieval options, template and cancellation.
    pub async fn ask_with(
        &self,
        collection: &str,
        question: &str,
        options: &RetrievalOptions,
        template: &PromptTemplate,
        cancel: &CancellationToken,
    ) -> Result<GeneratedAnswer> {
        let generator = self.generator()?;
        let retrieved = self.query_with(collection, question, options).await?;
        generator.generate_with(question, &retrieved, template, cancel).await
    }

    /// Retrieve, then stream a grounded answer.
    pub async fn ask_stream(
        &self,
        collection: &str,
        question: &str,
        cancel: CancellationToken,
    ) -> Result<AnswerStream> {
        let generator = self.generator()?;
        let retrieved = self.query(collection, question).await?;
        generator.generate_stream(question, &retrieved, cancel).await
    }

    /// Delete a collection and everything in it.
    pub async fn drop_collection(&self, name: &str) -> Result<bool> {
        self.registry.drop_collection(name).await
    }

    /// Flush the store and release all collections.
    pub async fn close(&self) -> Result<()> {
        self.registry.close().await?;
        info!("pipeline closed");
        Ok(())
    }
}

/// Builder for constructing a [`RagPipeline`].
///
/// Only the embedding provider is required. The vector store defaults to an
/// [`InMemoryVectorStore`] (snapshotting to `config.snapshot_dir` when set),
/// the chunker to a [`RecursiveChunker`] sized by the config. Without a
/// completion provider the pipeline can ingest and query but not answer.
///
/// # Example
///
/// ```rust,ignore
/// let pipeline = RagPipeline::builder()
///     .config(RagConfig::default())
///     .embedding_provider(Arc::new(embedder))
///     .completion_provider(Arc::new(llm))
///     .reranker(Arc::new(reranker))  // optional
///     .build()?;
/// ```
#[derive(Default)]
pub struct RagPipelineBuilder {
    config: Option<RagConfig>,
    embedding_provider: Option<Arc<dyn EmbeddingProvider>>,
    completion_provider: Option<Arc<dyn CompletionProvider>>,
    vector_store: Option<Arc<dyn VectorStore>>,
    chunker: Option<Arc<dyn Chunker>>,
    reranker: Option<Arc<dyn Reranker>>,
    query_rewriter: Option<QueryRewriter>,
    prompt_template: Option<PromptTemplate>,
}

impl RagPipelineBuilder {
    /// Set the pipeline configuration.
    pub fn config(mut self, config: RagConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Set the embedding provider.
    pub fn embedding_provider(mut self, provider: Arc<dyn EmbeddingProvider>) -> Self {
        self.embedding_provider = Some(provider);
        self
    }

    /// Set the completion provider used by `ask`.
    pub fn completion_provider(mut self, provider: Arc<dyn CompletionProvider>) -> Self {
        self.completion_provider = Some(provider);
        self
    }

    /// Set the vector store backend.
    pub fn vector_store(mut self, store: Arc<dyn VectorStore>) -> Self {
        self.vector_store = Some(store);
        self
    }

    /// Set the document chunker.
    pub fn chunker(mut self, chunker: Arc<dyn Chunker>) -> Self {
        self.chunker = Some(chunker);
        self
    }

    /// Set an optional reranker applied before score thresholding.
    pub fn reranker(mut self, reranker: Arc<dyn Reranker>) -> Self {
        self.reranker = Some(reranker);
        self
    }

    /// Set an optional query rewriter.
    pub fn query_rewriter(mut self, rewriter: QueryRewriter) -> Self {
        self.query_rewriter = Some(rewriter);
        self
    }

    /// Replace the default grounded-answer prompt.
    pub fn prompt_template(mut self, template: PromptTemplate) -> Self {
        self.prompt_template = Some(template);
        self
    }

    /// Build the [`RagPipeline`].
    ///
    /// # Errors
    ///
    /// Returns [`RagError::ConfigError`] if the embedding provider is missing
    /// or the chunk settings are invalid.
    pub fn build(self) -> Result<RagPipeline> {
        let config = self.config.unwrap_or_default();
        let embedder = self
            .embedding_provider
            .ok_or_else(|| RagError::ConfigError("embedding_provider is required".to_string()))?;
        let chunker = match self.chunker {
            Some(chunker) => chunker,
            None => Arc::new(RecursiveChunker::new(ChunkConfig::new(
                config.chunk_size,
                config.chunk_overlap,
            )?)),
        };
        let store: Arc<dyn VectorStore> = match (self.vector_store, &config.snapshot_dir) {
            (Some(store), _) => store,
            (None, Some(dir)) => Arc::new(InMemoryVectorStore::with_snapshot_dir(dir)),
            (None, None) => Arc::new(InMemoryVectorStore::new()),
        };
        let registry = Arc::new(CollectionRegistry::open(store));

        let mut indexer = DocumentIndexer::new(Arc::clone(&registry), Arc::clone(&embedder), chunker)
            .with_batching(config.embed_batch_size, config.max_concurrent_batches)
            .with_retry(config.retry.clone());
        if config.embedding_cache_capacity > 0 {
            indexer = indexer.with_cache(Arc::new(EmbeddingCache::new(config.embedding_cache_capacity)));
        }

        let mut retriever = Retriever::new(Arc::clone(&registry), embedder);
        if let Some(reranker) = self.reranker {
            retriever = retriever.with_reranker(reranker);
        }
        if let Some(rewriter) = self.query_rewriter {
            retriever = retriever.with_query_rewriter(rewriter);
        }

        let generator = self.completion_provider.map(|completion| {
            AnswerGenerator::new(completion)
                .with_template(self.prompt_template.unwrap_or_default())
                .with_options(config.completion.generation_options())
                .with_max_context_chars(config.max_context_chars)
                .with_retry(config.retry.clone())
        });

        Ok(RagPipeline { config, registry, indexer, retriever, generator })
    }
}
