//! End-to-end behaviour of the pipeline with offline providers.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use folio_rag::completion::{CompletionStream, GenerationOptions};
use folio_rag::document::{Chunk, Embedding, MetadataFilter, RetrievalResult};
use folio_rag::{
    Chunker, CollectionHandle, CompletionProvider, Document, EmbeddingProvider, HashingEmbeddingProvider,
    InMemoryVectorStore, RagConfig, RagError, RagPipeline, Result, RetrievalOptions, RetryPolicy,
    VectorStore,
};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;

fn config() -> RagConfig {
    RagConfig::builder()
        .chunk_size(50)
        .chunk_overlap(10)
        .retry(RetryPolicy::none())
        .build()
        .unwrap()
}

fn hashing(dimensions: usize) -> Arc<dyn EmbeddingProvider> {
    Arc::new(HashingEmbeddingProvider::new(dimensions).unwrap())
}

/// Replies with a fixed answer and records the prompts it saw.
struct Scripted {
    reply: String,
    prompts: std::sync::Mutex<Vec<String>>,
}

impl Scripted {
    fn new(reply: &str) -> Arc<Self> {
        Arc::new(Self { reply: reply.to_string(), prompts: std::sync::Mutex::default() })
    }

    fn last_prompt(&self) -> String {
        self.prompts.lock().unwrap().last().cloned().unwrap_or_default()
    }
}

#[async_trait]
impl CompletionProvider for Scripted {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete_stream(
        &self,
        prompt: &str,
        _options: &GenerationOptions,
    ) -> Result<CompletionStream> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        let words: Vec<Result<String>> =
            self.reply.split_inclusive(' ').map(|w| Ok(w.to_string())).collect();
        Ok(Box::pin(futures::stream::iter(words)))
    }
}

/// Hashing embedder that rejects any text containing "poison".
struct Picky(HashingEmbeddingProvider);

#[async_trait]
impl EmbeddingProvider for Picky {
    fn name(&self) -> &str {
        "picky"
    }

    async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Embedding>> {
        if texts.iter().any(|t| t.contains("poison")) {
            return Err(RagError::InvalidInput {
                provider: "picky".to_string(),
                message: "refusing poisoned text".to_string(),
            });
        }
        self.0.embed_batch(texts).await
    }

    fn dimensions(&self) -> usize {
        self.0.dimensions()
    }
}

/// Hashing embedder that sleeps before every batch; earlier calls sleep longer.
struct Slow {
    inner: HashingEmbeddingProvider,
    calls: AtomicUsize,
}

impl Slow {
    fn new(dimensions: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: HashingEmbeddingProvider::new(dimensions).unwrap(),
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl EmbeddingProvider for Slow {
    fn name(&self) -> &str {
        "slow"
    }

    async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Embedding>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) as u64;
        tokio::time::sleep(Duration::from_millis(80u64.saturating_sub(call * 10))).await;
        self.inner.embed_batch(texts).await
    }

    fn dimensions(&self) -> usize {
        self.inner.dimensions()
    }
}

/// In-memory store whose `add` fails while `broken` is set.
struct Flaky {
    inner: InMemoryVectorStore,
    broken: AtomicBool,
    adds: AtomicUsize,
}

impl Flaky {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: InMemoryVectorStore::new(),
            broken: AtomicBool::new(false),
            adds: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl VectorStore for Flaky {
    fn backend(&self) -> &str {
        "flaky"
    }

    async fn get_or_create(&self, name: &str) -> Result<CollectionHandle> {
        self.inner.get_or_create(name).await
    }

    async fn exists(&self, name: &str) -> Result<bool> {
        self.inner.exists(name).await
    }

    async fn add(&self, handle: &CollectionHandle, chunks: &[Chunk]) -> Result<()> {
        self.adds.fetch_add(1, Ordering::SeqCst);
        // Fail only on the new version; restoring the previous chunks must still work.
        if self.broken.load(Ordering::SeqCst) && chunks.iter().any(|c| c.text.contains("v2")) {
            return Err(RagError::VectorStoreError {
                backend: "flaky".to_string(),
                message: "disk full".to_string(),
            });
        }
        self.inner.add(handle, chunks).await
    }

    async fn query(
        &self,
        handle: &CollectionHandle,
        embedding: &[f32],
        k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<RetrievalResult>> {
        self.inner.query(handle, embedding, k, filter).await
    }

    async fn chunks_for_document(
        &self,
        handle: &CollectionHandle,
        document_id: &str,
    ) -> Result<Vec<Chunk>> {
        self.inner.chunks_for_document(handle, document_id).await
    }

    async fn remove_by_document(
        &self,
        handle: &CollectionHandle,
        document_id: &str,
    ) -> Result<usize> {
        self.inner.remove_by_document(handle, document_id).await
    }

    async fn remove_chunks(&self, handle: &CollectionHandle, ids: &[&str]) -> Result<usize> {
        self.inner.remove_chunks(handle, ids).await
    }

    async fn count(&self, handle: &CollectionHandle) -> Result<usize> {
        self.inner.count(handle).await
    }

    async fn drop_collection(&self, name: &str) -> Result<bool> {
        self.inner.drop_collection(name).await
    }
}

#[tokio::test]
async fn short_document_is_found_by_overlapping_query() {
    let pipeline =
        RagPipeline::builder().config(config()).embedding_provider(hashing(256)).build().unwrap();

    let result =
        pipeline.ingest("notes", &Document::new("D1", "The cat sat. The dog ran.")).await.unwrap();
    assert_eq!(result.chunk_count, 1);
    assert_eq!(result.replaced, 0);

    let hits = pipeline.query_with("notes", "animal on the mat", &RetrievalOptions::new(1)).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].document_id, "D1");
    assert!(hits[0].score > 0.0);

    let strict = RetrievalOptions::new(1).with_min_score(0.99);
    assert!(pipeline.query_with("notes", "animal on the mat", &strict).await.unwrap().is_empty());
}

#[tokio::test]
async fn reindexing_replaces_previous_chunks() {
    let pipeline =
        RagPipeline::builder().config(config()).embedding_provider(hashing(128)).build().unwrap();
    let long = "Whales swim in the deep sea. ".repeat(6);

    let first = pipeline.ingest("books", &Document::new("moby", long.as_str())).await.unwrap();
    assert!(first.chunk_count > 1);

    let again = pipeline.ingest("books", &Document::new("moby", long.as_str())).await.unwrap();
    assert_eq!(again.chunk_count, first.chunk_count);
    assert_eq!(again.replaced, first.chunk_count);

    let shorter = pipeline.ingest("books", &Document::new("moby", "Call me Ishmael.")).await.unwrap();
    assert_eq!(shorter.chunk_count, 1);

    let store = pipeline.registry().store();
    let handle = pipeline.registry().collection("books").await.unwrap();
    assert_eq!(store.count(&handle).await.unwrap(), 1);
    let chunks = store.chunks_for_document(&handle, "moby").await.unwrap();
    assert_eq!(chunks[0].text, "Call me Ishmael.");

    assert_eq!(pipeline.remove_document("books", "moby").await.unwrap(), 1);
    assert_eq!(pipeline.remove_document("books", "moby").await.unwrap(), 0);
    assert!(pipeline.query("books", "Ishmael").await.unwrap().is_empty());
}

#[tokio::test]
async fn repeated_ingestion_hits_the_embedding_cache() {
    let pipeline =
        RagPipeline::builder().config(config()).embedding_provider(hashing(64)).build().unwrap();
    let document = Document::new("d", "Cached text is embedded once.");

    assert_eq!(pipeline.ingest("c", &document).await.unwrap().cache_hits, 0);
    assert_eq!(pipeline.ingest("c", &document).await.unwrap().cache_hits, 1);
}

#[tokio::test]
async fn failed_insert_restores_the_previous_version() {
    let store = Flaky::new();
    let pipeline = RagPipeline::builder()
        .config(config())
        .embedding_provider(hashing(64))
        .vector_store(store.clone())
        .build()
        .unwrap();

    pipeline.ingest("lib", &Document::new("D1", "harbour map v1")).await.unwrap();
    store.broken.store(true, Ordering::SeqCst);

    let err = pipeline.ingest("lib", &Document::new("D1", "harbour map v2")).await.unwrap_err();
    match err {
        RagError::IndexingFailed { document_id, source } => {
            assert_eq!(document_id, "D1");
            assert!(matches!(*source, RagError::VectorStoreError { .. }));
        }
        other => panic!("unexpected error: {other}"),
    }

    let hits = pipeline.query("lib", "harbour map").await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].chunk.text, "harbour map v1");
}

#[tokio::test]
async fn reindexing_inserts_the_new_version_in_one_step() {
    let store = Flaky::new();
    let config = RagConfig::builder()
        .chunk_size(50)
        .chunk_overlap(10)
        .embed_batch_size(1)
        .retry(RetryPolicy::none())
        .build()
        .unwrap();
    let pipeline = RagPipeline::builder()
        .config(config)
        .embedding_provider(hashing(64))
        .vector_store(store.clone())
        .build()
        .unwrap();
    let long = "Whales swim in the deep sea. ".repeat(6);

    let first = pipeline.ingest("books", &Document::new("moby", long.as_str())).await.unwrap();
    assert!(first.chunk_count > 1);
    assert_eq!(store.adds.load(Ordering::SeqCst), 1);

    pipeline.ingest("books", &Document::new("moby", long.as_str())).await.unwrap();
    assert_eq!(store.adds.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn concurrent_reindexing_of_one_document_keeps_a_single_version() {
    let pipeline =
        RagPipeline::builder().config(config()).embedding_provider(Slow::new(64)).build().unwrap();
    let first = Document::new(
        "D1",
        (0..5).map(|i| format!("Old chart {i} marks the reef.")).collect::<Vec<_>>().join(" "),
    );
    let second = Document::new(
        "D1",
        (0..3).map(|i| format!("New survey {i} of the lighthouse.")).collect::<Vec<_>>().join(" "),
    );

    let (a, b) = tokio::join!(pipeline.ingest("charts", &first), pipeline.ingest("charts", &second));
    let (a, b) = (a.unwrap(), b.unwrap());
    assert!(
        (a.replaced == 0 && b.replaced == a.chunk_count) || (b.replaced == 0 && a.replaced == b.chunk_count),
        "runs overlapped: {a:?} / {b:?}"
    );

    let store = pipeline.registry().store();
    let handle = pipeline.registry().collection("charts").await.unwrap();
    let stored = store.chunks_for_document(&handle, "D1").await.unwrap();
    let texts: Vec<String> = stored.iter().map(|c| c.text.clone()).collect();
    let version = |doc: &Document| -> Vec<String> {
        pipeline.indexer().chunker().chunk(doc).into_iter().map(|c| c.text).collect()
    };
    assert!(texts == version(&first) || texts == version(&second), "mixed chunks: {texts:?}");

    let sequence: Vec<usize> = stored.iter().map(|c| c.sequence_index).collect();
    assert_eq!(sequence, (0..stored.len()).collect::<Vec<_>>());
    assert_eq!(store.count(&handle).await.unwrap(), stored.len());
}

#[tokio::test(start_paused = true)]
async fn concurrent_embedding_batches_stay_in_chunk_order() {
    let config = RagConfig::builder()
        .chunk_size(50)
        .chunk_overlap(10)
        .embed_batch_size(1)
        .max_concurrent_batches(4)
        .embedding_cache_capacity(0)
        .retry(RetryPolicy::none())
        .build()
        .unwrap();
    let embedder = Slow::new(64);
    let pipeline =
        RagPipeline::builder().config(config).embedding_provider(embedder.clone()).build().unwrap();
    let text = (0..8).map(|i| format!("Entry {i} logs harbour {i}.")).collect::<Vec<_>>().join(" ");

    let result = pipeline.ingest("log", &Document::new("D1", text)).await.unwrap();
    assert!(result.chunk_count > 4);
    assert_eq!(embedder.calls.load(Ordering::SeqCst), result.chunk_count);

    let handle = pipeline.registry().collection("log").await.unwrap();
    let stored = pipeline.registry().store().chunks_for_document(&handle, "D1").await.unwrap();
    let reference = HashingEmbeddingProvider::new(64).unwrap();
    for chunk in &stored {
        assert_eq!(chunk.embedding, reference.embed(&chunk.text).await.unwrap(), "chunk {}", chunk.id);
    }
}

#[tokio::test]
async fn embedding_failure_leaves_collection_untouched() {
    let embedder: Arc<dyn EmbeddingProvider> =
        Arc::new(Picky(HashingEmbeddingProvider::new(64).unwrap()));
    let pipeline =
        RagPipeline::builder().config(config()).embedding_provider(embedder).build().unwrap();

    pipeline.ingest("lib", &Document::new("D1", "clean water")).await.unwrap();
    let err = pipeline.ingest("lib", &Document::new("D1", "poison water")).await.unwrap_err();
    assert!(matches!(
        err,
        RagError::IndexingFailed { ref source, .. } if matches!(**source, RagError::InvalidInput { .. })
    ));

    let hits = pipeline.query("lib", "water").await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].chunk.text, "clean water");
}

#[tokio::test]
async fn batch_failures_are_isolated_per_document() {
    let embedder: Arc<dyn EmbeddingProvider> =
        Arc::new(Picky(HashingEmbeddingProvider::new(64).unwrap()));
    let pipeline =
        RagPipeline::builder().config(config()).embedding_provider(embedder).build().unwrap();

    let documents = vec![
        Document::new("a", "apples and pears"),
        Document::new("b", "poison ivy"),
        Document::new("c", "cherries and plums"),
    ];
    let outcomes = pipeline.ingest_batch("fruit", &documents).await;

    let ids: Vec<&str> = outcomes.iter().map(|o| o.document_id.as_str()).collect();
    assert_eq!(ids, vec!["a", "b", "c"]);
    assert!(outcomes[0].is_ok());
    assert!(!outcomes[1].is_ok());
    assert!(outcomes[2].is_ok());

    let handle = pipeline.registry().collection("fruit").await.unwrap();
    assert_eq!(pipeline.registry().store().count(&handle).await.unwrap(), 2);
}

#[tokio::test]
async fn switching_embedders_on_a_populated_collection_is_rejected() {
    let store: Arc<dyn VectorStore> = Arc::new(InMemoryVectorStore::new());
    let small = RagPipeline::builder()
        .config(config())
        .embedding_provider(hashing(32))
        .vector_store(Arc::clone(&store))
        .build()
        .unwrap();
    let large = RagPipeline::builder()
        .config(config())
        .embedding_provider(hashing(48))
        .vector_store(Arc::clone(&store))
        .build()
        .unwrap();

    small.ingest("shared", &Document::new("D1", "lighthouse keeper")).await.unwrap();
    let err = large.ingest("shared", &Document::new("D2", "lighthouse lamp")).await.unwrap_err();
    assert!(matches!(
        err,
        RagError::IndexingFailed { ref source, .. }
            if matches!(**source, RagError::DimensionMismatch { expected: 32, actual: 48, .. })
    ));

    let hits = small.query("shared", "lighthouse").await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].document_id, "D1");
}

#[tokio::test]
async fn answers_cite_retrieved_chunks() {
    let completion = Scripted::new("Cats sit on mats [1]. Unrelated [7].");
    let pipeline = RagPipeline::builder()
        .config(config())
        .embedding_provider(hashing(128))
        .completion_provider(completion.clone())
        .build()
        .unwrap();
    pipeline
        .ingest("pets", &Document::new("D1", "The cat sat on the mat.").with_metadata("title", "Pets"))
        .await
        .unwrap();

    let answer = pipeline.ask("pets", "Where did the cat sit?").await.unwrap();
    assert_eq!(answer.answer, "Cats sit on mats [1]. Unrelated [7].");
    assert_eq!(answer.cited_chunk_ids, vec!["D1_0".to_string()]);
    assert_eq!(answer.cited_document_ids, vec!["D1".to_string()]);

    let prompt = completion.last_prompt();
    assert!(prompt.contains("[1] Pets\nThe cat sat on the mat."));
    assert!(prompt.ends_with("Question: Where did the cat sit?\n\nAnswer:"));
}

#[tokio::test]
async fn empty_retrieval_answers_with_the_no_context_notice() {
    let completion = Scripted::new("I cannot say.");
    let pipeline = RagPipeline::builder()
        .config(config())
        .embedding_provider(hashing(64))
        .completion_provider(completion.clone())
        .build()
        .unwrap();

    let answer = pipeline.ask("empty", "What is the capital of Peru?").await.unwrap();
    assert!(answer.answer.starts_with("No supporting context was found"));
    assert!(answer.answer.ends_with("I cannot say."));
    assert!(answer.cited_chunk_ids.is_empty());
    assert!(completion.last_prompt().contains("No supporting context was found"));
}

#[tokio::test]
async fn streamed_answer_matches_buffered_text() {
    let pipeline = RagPipeline::builder()
        .config(config())
        .embedding_provider(hashing(64))
        .completion_provider(Scripted::new("The cat sat [1]."))
        .build()
        .unwrap();
    pipeline.ingest("pets", &Document::new("D1", "The cat sat.")).await.unwrap();

    let stream = pipeline.ask_stream("pets", "cat", CancellationToken::new()).await.unwrap();
    let fragments: Vec<String> = stream.fragments.map(|f| f.unwrap()).collect().await;
    assert!(fragments.len() > 1);
    let text = fragments.concat();
    assert_eq!(text, "The cat sat [1].");

    let answer = folio_rag::GeneratedAnswer::from_text(text, &stream.prepared);
    assert_eq!(answer.cited_chunk_ids, vec!["D1_0".to_string()]);
}

#[tokio::test]
async fn asking_without_a_completion_provider_is_a_config_error() {
    let pipeline =
        RagPipeline::builder().config(config()).embedding_provider(hashing(64)).build().unwrap();
    let err = pipeline.ask("any", "question").await.unwrap_err();
    assert!(matches!(err, RagError::ConfigError(_)));
}

#[tokio::test]
async fn cancelled_indexing_keeps_prior_state() {
    let pipeline =
        RagPipeline::builder().config(config()).embedding_provider(hashing(64)).build().unwrap();
    pipeline.ingest("lib", &Document::new("D1", "first edition")).await.unwrap();

    let cancel = CancellationToken::new();
    cancel.cancel();
    let indexer = pipeline.indexer();
    let err = indexer
        .index_with("lib", &Document::new("D1", "second edition"), indexer.chunker().as_ref(), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, RagError::Cancelled));

    let hits = pipeline.query("lib", "edition").await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].chunk.text, "first edition");
}

#[tokio::test]
async fn bytes_are_extracted_before_indexing() {
    let pipeline =
        RagPipeline::builder().config(config()).embedding_provider(hashing(64)).build().unwrap();

    let metadata = HashMap::from([("title".to_string(), "Memo".to_string())]);
    let result = pipeline
        .ingest_bytes("inbox", "memo", b"\xEF\xBB\xBFquarterly report\r\n", "text/plain", metadata)
        .await
        .unwrap();
    assert_eq!(result.chunk_count, 1);
    let hits = pipeline.query("inbox", "quarterly").await.unwrap();
    assert_eq!(hits[0].chunk.text, "quarterly report\n");
    assert_eq!(hits[0].chunk.metadata.get("title").map(String::as_str), Some("Memo"));

    let err = pipeline
        .ingest_bytes("inbox", "blob", &[0xff, 0xfe, 0x00], "text/plain", HashMap::new())
        .await
        .unwrap_err();
    assert!(matches!(err, RagError::ExtractionFailed { .. }));
}

#[tokio::test]
async fn snapshots_survive_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config();
    config.snapshot_dir = Some(dir.path().to_path_buf());

    let first =
        RagPipeline::builder().config(config.clone()).embedding_provider(hashing(64)).build().unwrap();
    first.ingest("archive", &Document::new("D1", "Letters from the archive.")).await.unwrap();
    first.close().await.unwrap();
    assert!(first.ingest("archive", &Document::new("D2", "late")).await.is_err());

    let second = RagPipeline::builder().config(config).embedding_provider(hashing(64)).build().unwrap();
    let hits = second.query("archive", "archive letters").await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].chunk.id, "D1_0");

    assert!(second.drop_collection("archive").await.unwrap());
    assert!(second.query("archive", "archive letters").await.unwrap().is_empty());
}

#[tokio::test]
async fn filters_restrict_retrieval() {
    let pipeline =
        RagPipeline::builder().config(config()).embedding_provider(hashing(64)).build().unwrap();
    pipeline
        .ingest("lib", &Document::new("a", "tide tables").with_metadata("shelf", "maps"))
        .await
        .unwrap();
    pipeline
        .ingest("lib", &Document::new("b", "tide poems").with_metadata("shelf", "poetry"))
        .await
        .unwrap();

    let options = RetrievalOptions::new(5).with_filter(MetadataFilter::new().require("shelf", "poetry"));
    let hits = pipeline.query_with("lib", "tide", &options).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].document_id, "b");
}

#[tokio::test]
async fn similar_documents_skip_the_source() {
    let pipeline =
        RagPipeline::builder().config(config()).embedding_provider(hashing(128)).build().unwrap();
    pipeline.ingest("ocean", &Document::new("whales", "Whales swim in the deep sea.")).await.unwrap();
    pipeline.ingest("ocean", &Document::new("dolphins", "Dolphins swim in the sea.")).await.unwrap();
    pipeline.ingest("ocean", &Document::new("trains", "Trains run on steel rails.")).await.unwrap();

    let similar = pipeline.similar_documents("ocean", "whales", 2, None).await.unwrap();
    let ids: Vec<&str> = similar.iter().map(|r| r.document_id.as_str()).collect();
    assert_eq!(ids, vec!["dolphins", "trains"]);
    assert!(similar[0].score > similar[1].score);

    assert!(pipeline.similar_documents("ocean", "submarines", 2, None).await.unwrap().is_empty());
}
