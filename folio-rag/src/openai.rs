//! OpenAI-compatible provider for embeddings and chat completions.
//!
//! Talks to `/embeddings` and `/chat/completions` under a base URL, so the
//! same adapter serves the OpenAI cloud API and local servers that mimic it
//! (llama.cpp, vLLM, LM Studio).
//!
//! This module is only available when the `openai` feature is enabled.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::completion::{CompletionProvider, CompletionStream, GenerationOptions};
use crate::config::ProviderSettings;
use crate::document::Embedding;
use crate::embedding::{EmbeddingProvider, ensure_batch_len};
use crate::error::{RagError, Result};
use crate::http;
use crate::provider::ProviderKind;

/// The OpenAI cloud endpoint.
const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

/// The default model for OpenAI embeddings.
const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-3-small";

/// The default dimensionality for `text-embedding-3-small`.
const DEFAULT_DIMENSIONS: usize = 1536;

/// Inputs per embeddings request accepted by the OpenAI API.
const MAX_BATCH: usize = 2048;

/// An [`EmbeddingProvider`] and [`CompletionProvider`] backed by an
/// OpenAI-compatible HTTP API.
///
/// # Configuration
///
/// - `model`: defaults to `text-embedding-3-small`.
/// - `dimensions`: optional Matryoshka dimension override.
/// - `api_key`: from the constructor or the `OPENAI_API_KEY` environment
///   variable. Local servers may run without one.
///
/// # Example
///
/// ```rust,ignore
/// use folio_rag::openai::OpenAIProvider;
///
/// let provider = OpenAIProvider::new("sk-...")?;
/// let embedding = provider.embed("hello world").await?;
/// ```
pub struct OpenAIProvider {
    client: reqwest::Client,
    name: String,
    base_url: String,
    api_key: Option<String>,
    model: String,
    dimensions: usize,
    /// If set, passed to the API for Matryoshka dimension truncation.
    request_dimensions: Option<usize>,
    timeout: Duration,
}

impl OpenAIProvider {
    /// Create a provider for the OpenAI cloud API.
    ///
    /// Uses the default model (`text-embedding-3-small`) and dimensions (1536).
    pub fn new(api_key: impl Into<String>) -> Result<Self> {
        let api_key = api_key.into();
        if api_key.is_empty() {
            return Err(RagError::ConfigError("OpenAI API key must not be empty".into()));
        }
        Self::build(
            OPENAI_BASE_URL.to_string(),
            Some(api_key),
            DEFAULT_EMBEDDING_MODEL.to_string(),
            Duration::from_secs(30),
        )
    }

    /// Create a provider for an OpenAI-compatible server at `base_url`.
    pub fn local(base_url: impl Into<String>, model: impl Into<String>) -> Result<Self> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self::build(base_url, None, model.into(), Duration::from_secs(30))
    }

    /// Build the embedding side from validated settings.
    pub fn for_embeddings(settings: &ProviderSettings, dimensions: usize) -> Result<Self> {
        let mut provider = Self::from_settings(
            settings,
            settings.model.as_deref().unwrap_or(settings.provider.default_embedding_model()),
        )?;
        provider.dimensions = dimensions;
        provider.request_dimensions = settings.dimensions;
        Ok(provider)
    }

    /// Build the completion side from validated settings.
    pub fn for_completions(settings: &ProviderSettings) -> Result<Self> {
        let model = settings
            .model
            .as_deref()
            .or(settings.provider.default_completion_model())
            .unwrap_or_default();
        Self::from_settings(settings, model)
    }

    fn from_settings(settings: &ProviderSettings, model: &str) -> Result<Self> {
        let base_url = settings.base_url().unwrap_or_else(|| OPENAI_BASE_URL.to_string());
        let api_key = settings.resolved_api_key();
        if settings.provider == ProviderKind::OpenAI && api_key.is_none() {
            return Err(RagError::ConfigError(
                "the openai provider needs `api_key` or OPENAI_API_KEY".into(),
            ));
        }
        let mut provider = Self::build(base_url, api_key, model.to_string(), settings.timeout())?;
        if settings.provider == ProviderKind::LocalServer {
            provider.name = format!("local-server/{model}");
        }
        Ok(provider)
    }

    fn build(base_url: String, api_key: Option<String>, model: String, timeout: Duration) -> Result<Self> {
        let name = format!("openai/{model}");
        Ok(Self {
            client: http::client(&name, timeout)?,
            name,
            base_url,
            api_key,
            model,
            dimensions: DEFAULT_DIMENSIONS,
            request_dimensions: None,
            timeout,
        })
    }

    /// Set the output dimensions (Matryoshka support).
    ///
    /// When set, the API returns embeddings truncated to this size.
    /// This also updates the value returned by [`dimensions()`](EmbeddingProvider::dimensions).
    pub fn with_dimensions(mut self, dims: usize) -> Self {
        self.dimensions = dims;
        self.request_dimensions = Some(dims);
        self
    }

    /// Set the per-call timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        let request = self.client.post(format!("{}{path}", self.base_url));
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }
}

// ── API request/response types ─────────────────────────────────────

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [&'a str],
    #[serde(skip_serializing_if = "Option::is_none")]
    dimensions: Option<usize>,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    #[serde(default)]
    index: Option<usize>,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 1],
    max_tokens: u32,
    temperature: f32,
    stream: bool,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatContent,
}

#[derive(Deserialize)]
struct ChatChunk {
    choices: Vec<ChatDelta>,
}

#[derive(Deserialize)]
struct ChatDelta {
    delta: ChatContent,
}

#[derive(Deserialize)]
struct ChatContent {
    #[serde(default)]
    content: Option<String>,
}

/// Interpret one server-sent-events line.
///
/// `Ok(None)` means the line carries no text (comments, role-only deltas).
fn parse_sse_line(provider: &str, line: &str) -> Option<Result<Option<String>>> {
    let data = line.strip_prefix("data:")?.trim();
    if data == "[DONE]" {
        return None;
    }
    Some(
        serde_json::from_str::<ChatChunk>(data)
            .map(|chunk| chunk.choices.into_iter().next().and_then(|c| c.delta.content))
            .map_err(|e| RagError::GenerationError {
                provider: provider.to_string(),
                message: format!("malformed stream event: {e}"),
            }),
    )
}

// ── EmbeddingProvider implementation ───────────────────────────────

#[async_trait]
impl EmbeddingProvider for OpenAIProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Embedding>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        debug!(provider = %self.name, batch_size = texts.len(), "embedding batch");

        let request_body =
            EmbeddingRequest { model: &self.model, input: texts, dimensions: self.request_dimensions };

        let response = self
            .post("/embeddings")
            .timeout(self.timeout)
            .json(&request_body)
            .send()
            .await
            .map_err(|e| http::transport_error(&self.name, self.timeout, e))?;
        let response = http::check_status(&self.name, response).await?;

        let mut parsed: EmbeddingResponse = response.json().await.map_err(|e| {
            error!(provider = %self.name, error = %e, "failed to parse response");
            RagError::ProviderUnavailable {
                provider: self.name.clone(),
                message: format!("failed to parse response: {e}"),
            }
        })?;

        parsed.data.sort_by_key(|d| d.index.unwrap_or(usize::MAX));
        ensure_batch_len(&self.name, texts.len(), parsed.data.len())?;
        Ok(parsed.data.into_iter().map(|d| d.embedding).collect())
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn max_batch_size(&self) -> usize {
        MAX_BATCH
    }
}

// ── CompletionProvider implementation ──────────────────────────────

#[async_trait]
impl CompletionProvider for OpenAIProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, prompt: &str, options: &GenerationOptions) -> Result<String> {
        let request_body = ChatRequest {
            model: &self.model,
            messages: [ChatMessage { role: "user", content: prompt }],
            max_tokens: options.max_tokens,
            temperature: options.temperature,
            stream: false,
        };

        let response = self
            .post("/chat/completions")
            .timeout(self.timeout)
            .json(&request_body)
            .send()
            .await
            .map_err(|e| http::transport_error(&self.name, self.timeout, e))?;
        let response = http::check_status(&self.name, response).await?;

        let parsed: ChatResponse = response.json().await.map_err(|e| RagError::GenerationError {
            provider: self.name.clone(),
            message: format!("failed to parse response: {e}"),
        })?;
        parsed.choices.into_iter().next().and_then(|c| c.message.content).ok_or_else(|| {
            RagError::GenerationError {
                provider: self.name.clone(),
                message: "response contained no choices".into(),
            }
        })
    }

    async fn complete_stream(
        &self,
        prompt: &str,
        options: &GenerationOptions,
    ) -> Result<CompletionStream> {
        let request_body = ChatRequest {
            model: &self.model,
            messages: [ChatMessage { role: "user", content: prompt }],
            max_tokens: options.max_tokens,
            temperature: options.temperature,
            stream: true,
        };

        let send = self.post("/chat/completions").json(&request_body).send();
        let response = tokio::time::timeout(self.timeout, send)
            .await
            .map_err(|_| RagError::Timeout { provider: self.name.clone(), after: self.timeout })?
            .map_err(|e| http::transport_error(&self.name, self.timeout, e))?;
        let response = http::check_status(&self.name, response).await?;

        let provider = self.name.clone();
        let mut lines = Box::pin(http::lines(provider.clone(), self.timeout, response.bytes_stream()));
        Ok(Box::pin(async_stream::stream! {
            while let Some(line) = lines.next().await {
                let line = match line {
                    Ok(line) => line,
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                };
                match parse_sse_line(&provider, &line) {
                    None if line.starts_with("data:") => return,
                    None => {}
                    Some(Ok(Some(fragment))) => yield Ok(fragment),
                    Some(Ok(None)) => {}
                    Some(Err(e)) => {
                        yield Err(e);
                        return;
                    }
                }
            }
        }))
    }
}
