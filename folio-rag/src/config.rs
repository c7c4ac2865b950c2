//! Configuration for the RAG pipeline.
//!
//! [`RagConfig`] is plain data: build it in code with [`RagConfig::builder`]
//! or load it from TOML. Every keyed section is optional and missing keys take
//! their defaults.
//!
//! ```toml
//! chunk_size = 800
//! chunk_overlap = 100
//! top_k = 8
//! min_score = 0.25
//! snapshot_dir = "/var/lib/folio/vectors"
//!
//! [embedding]
//! provider = "ollama"
//! model = "nomic-embed-text"
//!
//! [completion]
//! provider = "openai"
//! model = "gpt-4o-mini"
//! temperature = 0.2
//!
//! [retry]
//! max_attempts = 4
//! initial_backoff = 250
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::completion::GenerationOptions;
use crate::error::{RagError, Result};
use crate::provider::{self, ProviderKind};
use crate::retry::RetryPolicy;

/// Environment variable consulted when an OpenAI provider has no `api_key`.
pub const OPENAI_API_KEY_ENV: &str = "OPENAI_API_KEY";

/// Connection and sampling settings for one provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProviderSettings {
    /// Which backend to use.
    pub provider: ProviderKind,
    /// Model name. Each provider has a default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Override for the provider's default endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// API key. OpenAI falls back to `OPENAI_API_KEY`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Sampling temperature in `[0, 2]`.
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Maximum tokens to generate.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Per-call timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Embedding dimensions. Required for models the crate does not know.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dimensions: Option<usize>,
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_tokens() -> u32 {
    512
}

fn default_timeout_secs() -> u64 {
    30
}

impl ProviderSettings {
    /// Settings for `provider` with every other field at its default.
    pub fn new(provider: ProviderKind) -> Self {
        Self {
            provider,
            model: None,
            base_url: None,
            api_key: None,
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            timeout_secs: default_timeout_secs(),
            dimensions: None,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn with_dimensions(mut self, dimensions: usize) -> Self {
        self.dimensions = Some(dimensions);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    /// The per-call timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// The endpoint to call, without a trailing slash.
    pub fn base_url(&self) -> Option<String> {
        self.base_url
            .as_deref()
            .or(self.provider.default_base_url())
            .map(|url| url.trim_end_matches('/').to_string())
    }

    /// The configured key, or `OPENAI_API_KEY` for the OpenAI provider.
    pub fn resolved_api_key(&self) -> Option<String> {
        self.api_key.clone().filter(|key| !key.is_empty()).or_else(|| {
            (self.provider == ProviderKind::OpenAI)
                .then(|| std::env::var(OPENAI_API_KEY_ENV).ok())
                .flatten()
                .filter(|key| !key.is_empty())
        })
    }

    /// Sampling parameters for completion calls.
    pub fn generation_options(&self) -> GenerationOptions {
        GenerationOptions { max_tokens: self.max_tokens, temperature: self.temperature }
    }

    fn validate(&self, section: &str) -> Result<()> {
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(RagError::ConfigError(format!(
                "[{section}] temperature ({}) must be within [0, 2]",
                self.temperature
            )));
        }
        if self.max_tokens == 0 {
            return Err(RagError::ConfigError(format!(
                "[{section}] max_tokens must be greater than zero"
            )));
        }
        if self.timeout_secs == 0 {
            return Err(RagError::ConfigError(format!(
                "[{section}] timeout_secs must be greater than zero"
            )));
        }
        if self.dimensions == Some(0) {
            return Err(RagError::ConfigError(format!(
                "[{section}] dimensions must be greater than zero"
            )));
        }
        if self.provider == ProviderKind::OpenAI && self.resolved_api_key().is_none() {
            return Err(RagError::ConfigError(format!(
                "[{section}] the openai provider needs `api_key` or {OPENAI_API_KEY_ENV}"
            )));
        }
        Ok(())
    }
}

/// Configuration parameters for the RAG pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RagConfig {
    /// Maximum chunk size in characters.
    pub chunk_size: usize,
    /// Number of overlapping characters between consecutive chunks.
    pub chunk_overlap: usize,
    /// Number of candidates fetched from the vector store per query.
    pub top_k: usize,
    /// Results scoring below this are discarded.
    pub min_score: f32,
    /// Texts per embedding call.
    pub embed_batch_size: usize,
    /// Embedding calls in flight per document.
    pub max_concurrent_batches: usize,
    /// Character budget for retrieved context in a prompt.
    pub max_context_chars: usize,
    /// Embeddings kept by the indexer's cache. Zero disables caching.
    pub embedding_cache_capacity: usize,
    pub embedding: ProviderSettings,
    pub completion: ProviderSettings,
    pub retry: RetryPolicy,
    /// Directory for collection snapshots. `None` keeps everything in memory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot_dir: Option<PathBuf>,
}

impl Default for RagConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            chunk_overlap: 200,
            top_k: 5,
            min_score: 0.0,
            embed_batch_size: 32,
            max_concurrent_batches: 4,
            max_context_chars: 4000,
            embedding_cache_capacity: 10_000,
            embedding: ProviderSettings::new(ProviderKind::Hashing),
            completion: ProviderSettings::new(ProviderKind::Ollama),
            retry: RetryPolicy::default(),
            snapshot_dir: None,
        }
    }
}

impl RagConfig {
    /// Create a new builder for constructing a [`RagConfig`].
    pub fn builder() -> RagConfigBuilder {
        RagConfigBuilder::default()
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let config: Self = toml::from_str(input)
            .map_err(|e| RagError::ConfigError(format!("invalid TOML configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let input = std::fs::read_to_string(path).map_err(|e| {
            RagError::ConfigError(format!("cannot read configuration {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&input)
    }

    /// Check every field, failing on the first problem found.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::ConfigError`] if:
    /// - `chunk_size == 0` or `chunk_overlap >= chunk_size`
    /// - `top_k == 0`, or `min_score` lies outside `[0, 1]`
    /// - a batch size, concurrency limit or context budget is zero
    /// - a provider section is invalid, including a missing OpenAI key
    /// - the embedding dimensions cannot be determined
    /// - the completion provider is `hashing`
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(RagError::ConfigError("chunk_size must be greater than zero".to_string()));
        }
        if self.chunk_overlap >= self.chunk_size {
            return Err(RagError::ConfigError(format!(
                "chunk_overlap ({}) must be less than chunk_size ({})",
                self.chunk_overlap, self.chunk_size
            )));
        }
        if self.top_k == 0 {
            return Err(RagError::ConfigError("top_k must be greater than zero".to_string()));
        }
        if !(0.0..=1.0).contains(&self.min_score) {
            return Err(RagError::ConfigError(format!(
                "min_score ({}) must be within [0, 1]",
                self.min_score
            )));
        }
        if self.embed_batch_size == 0 || self.max_concurrent_batches == 0 {
            return Err(RagError::ConfigError(
                "embed_batch_size and max_concurrent_batches must be greater than zero".to_string(),
            ));
        }
        if self.max_context_chars == 0 {
            return Err(RagError::ConfigError(
                "max_context_chars must be greater than zero".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(RagError::ConfigError(
                "retry.max_attempts must be greater than zero".to_string(),
            ));
        }
        self.embedding.validate("embedding")?;
        self.completion.validate("completion")?;
        if provider::embedding_dimensions(&self.embedding).is_none() {
            return Err(RagError::ConfigError(
                "[embedding] dimensions must be set for this model".to_string(),
            ));
        }
        if self.completion.provider == ProviderKind::Hashing {
            return Err(RagError::ConfigError(
                "[completion] the hashing provider cannot generate completions".to_string(),
            ));
        }
        Ok(())
    }
}

/// Builder for constructing a validated [`RagConfig`].
#[derive(Debug, Clone, Default)]
pub struct RagConfigBuilder {
    config: RagConfig,
}

impl RagConfigBuilder {
    /// Set the maximum chunk size in characters.
    pub fn chunk_size(mut self, size: usize) -> Self {
        self.config.chunk_size = size;
        self
    }

    /// Set the overlap between consecutive chunks in characters.
    pub fn chunk_overlap(mut self, overlap: usize) -> Self {
        self.config.chunk_overlap = overlap;
        self
    }

    /// Set the number of candidates fetched per query.
    pub fn top_k(mut self, k: usize) -> Self {
        self.config.top_k = k;
        self
    }

    /// Set the minimum score a result needs to be returned.
    pub fn min_score(mut self, score: f32) -> Self {
        self.config.min_score = score;
        self
    }

    pub fn embed_batch_size(mut self, size: usize) -> Self {
        self.config.embed_batch_size = size;
        self
    }

    pub fn max_concurrent_batches(mut self, n: usize) -> Self {
        self.config.max_concurrent_batches = n;
        self
    }

    pub fn max_context_chars(mut self, chars: usize) -> Self {
        self.config.max_context_chars = chars;
        self
    }

    pub fn embedding_cache_capacity(mut self, capacity: usize) -> Self {
        self.config.embedding_cache_capacity = capacity;
        self
    }

    pub fn embedding(mut self, settings: ProviderSettings) -> Self {
        self.config.embedding = settings;
        self
    }

    pub fn completion(mut self, settings: ProviderSettings) -> Self {
        self.config.completion = settings;
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.config.retry = policy;
        self
    }

    pub fn snapshot_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.snapshot_dir = Some(dir.into());
        self
    }

    /// Build the [`RagConfig`], validating that parameters are consistent.
    ///
    /// # Errors
    ///
    /// See [`RagConfig::validate`].
    pub fn build(self) -> Result<RagConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
