//! Embedding provider trait for generating vector embeddings from text.

use async_trait::async_trait;

use crate::document::Embedding;
use crate::error::{RagError, Result};

/// A provider that generates vector embeddings from text input.
///
/// Implementations wrap specific embedding backends (OpenAI, Ollama, local
/// servers) behind a unified async interface. The batch call is the primary
/// contract: one call may embed many chunks and the result order matches the
/// input order exactly.
///
/// Providers must not cache results; the indexer owns caching.
///
/// # Errors
///
/// - [`RagError::ProviderUnavailable`] / [`RagError::Timeout`] when the service
///   cannot be reached (retryable)
/// - [`RagError::RateLimited`] when throttled (retryable after backoff)
/// - [`RagError::InvalidInput`] when a text exceeds the provider's limit (not
///   retryable; re-chunk smaller)
///
/// # Example
///
/// ```rust,ignore
/// use folio_rag::EmbeddingProvider;
///
/// let provider = MyEmbeddingProvider::new();
/// let vectors = provider.embed_batch(&["hello", "world"]).await?;
/// assert_eq!(vectors[0].len(), provider.dimensions());
/// ```
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Identity of the provider and model, e.g. `openai/text-embedding-3-small`.
    fn name(&self) -> &str;

    /// Generate embedding vectors for a batch of text inputs, in input order.
    async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Embedding>>;

    /// Generate an embedding vector for a single text input.
    async fn embed(&self, text: &str) -> Result<Embedding> {
        self.embed_batch(&[text]).await?.into_iter().next().ok_or_else(|| {
            RagError::ProviderUnavailable {
                provider: self.name().to_string(),
                message: "provider returned no embedding".to_string(),
            }
        })
    }

    /// Return the dimensionality of embeddings produced by this provider.
    fn dimensions(&self) -> usize;

    /// Maximum number of texts the provider accepts per call.
    fn max_batch_size(&self) -> usize {
        64
    }
}

/// Check that a provider answered with one vector per input.
pub(crate) fn ensure_batch_len(provider: &str, expected: usize, got: usize) -> Result<()> {
    if expected != got {
        return Err(RagError::ProviderUnavailable {
            provider: provider.to_string(),
            message: format!("expected {expected} embeddings, received {got}"),
        });
    }
    Ok(())
}

/// A deterministic, offline embedder based on feature hashing.
///
/// Lower-cased alphanumeric word tokens are hashed (FNV-1a) into
/// `dimensions` buckets and the resulting term-count vector is L2-normalised.
/// Texts sharing words therefore have positive cosine similarity. Useful for
/// tests, demos and air-gapped installations; it captures lexical overlap
/// only, not meaning.
#[derive(Debug, Clone)]
pub struct HashingEmbeddingProvider {
    dimensions: usize,
    name: String,
}

impl HashingEmbeddingProvider {
    /// Create a hashing embedder producing vectors of `dimensions` length.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::ConfigError`] if `dimensions` is zero.
    pub fn new(dimensions: usize) -> Result<Self> {
        if dimensions == 0 {
            return Err(RagError::ConfigError(
                "hashing embedder dimensions must be greater than zero".to_string(),
            ));
        }
        Ok(Self { dimensions, name: format!("hashing/{dimensions}") })
    }

    fn embed_text(&self, text: &str) -> Embedding {
        let mut vector = vec![0.0f32; self.dimensions];
        for token in text.split(|c: char| !c.is_alphanumeric()).filter(|t| !t.is_empty()) {
            let bucket = (fnv1a(&token.to_lowercase()) % self.dimensions as u64) as usize;
            vector[bucket] += 1.0;
        }
        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|x| *x /= norm);
        }
        vector
    }
}

fn fnv1a(token: &str) -> u64 {
    token.bytes().fold(0xcbf2_9ce4_8422_2325u64, |hash, b| {
        (hash ^ u64::from(b)).wrapping_mul(0x0000_0100_0000_01b3)
    })
}

#[async_trait]
impl EmbeddingProvider for HashingEmbeddingProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Embedding>> {
        Ok(texts.iter().map(|text| self.embed_text(text)).collect())
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn max_batch_size(&self) -> usize {
        usize::MAX
    }
}
