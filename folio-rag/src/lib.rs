//! Retrieval-Augmented Generation for document libraries.
//!
//! `folio-rag` turns documents into searchable vector chunks, retrieves the
//! chunks most similar to a query, and asks a language model for an answer
//! grounded in them, with citations mapped back to chunk and document ids.
//!
//! - [`chunking`]: overlapping, boundary-aware text spans
//! - [`embedding`] / [`completion`]: provider traits, with OpenAI-compatible,
//!   Ollama and offline hashing backends selected by [`ProviderKind`]
//! - [`vectorstore`] / [`inmemory`]: collection storage and cosine search,
//!   with optional JSON-lines snapshots
//! - [`indexer`], [`retriever`], [`generator`]: the three pipeline stages
//! - [`pipeline`]: [`RagPipeline`], which wires everything from a [`RagConfig`]
//!
//! ```rust,ignore
//! use folio_rag::{Document, RagConfig, RagPipeline};
//!
//! let pipeline = RagPipeline::from_config(&RagConfig::default())?;
//! pipeline.ingest("notes", &Document::new("d1", "The cat sat. The dog ran.")).await?;
//! let hits = pipeline.query("notes", "animal on the mat").await?;
//! ```

pub mod chunking;
pub mod completion;
pub mod config;
pub mod document;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod generator;
pub mod indexer;
pub mod inmemory;
pub mod pipeline;
pub mod provider;
pub mod registry;
pub mod reranker;
pub mod retriever;
pub mod retry;
pub mod snapshot;
pub mod telemetry;
pub mod vectorstore;

#[cfg(any(feature = "openai", feature = "ollama"))]
mod http;
#[cfg(feature = "ollama")]
pub mod ollama;
#[cfg(feature = "openai")]
pub mod openai;

pub use chunking::{ChunkConfig, Chunker, FixedSizeChunker, RecursiveChunker, Spans, TextSpan, chunk_text};
pub use completion::{CompletionProvider, CompletionStream, GenerationOptions};
pub use config::{ProviderSettings, RagConfig, RagConfigBuilder};
pub use document::{Chunk, Document, Embedding, MetadataFilter, RetrievalResult};
pub use embedding::{EmbeddingProvider, HashingEmbeddingProvider};
pub use error::{RagError, Result};
pub use extract::{PlainTextExtractor, TextExtractor, normalize_text};
pub use generator::{AnswerGenerator, AnswerStream, GeneratedAnswer, PreparedPrompt, PromptTemplate};
pub use indexer::{DocumentIndexer, DocumentOutcome, EmbeddingCache, IndexResult};
pub use inmemory::InMemoryVectorStore;
pub use pipeline::{RagPipeline, RagPipelineBuilder};
pub use provider::{ProviderKind, build_completion_provider, build_embedding_provider};
pub use registry::CollectionRegistry;
pub use reranker::{NoOpReranker, Reranker, TermOverlapReranker};
pub use retriever::{QueryRewriter, RetrievalOptions, Retriever};
pub use retry::{RetryPolicy, with_retry};
pub use vectorstore::{CollectionHandle, SimilarityMetric, VectorStore};
#[cfg(feature = "ollama")]
pub use ollama::OllamaProvider;
#[cfg(feature = "openai")]
pub use openai::OpenAIProvider;
