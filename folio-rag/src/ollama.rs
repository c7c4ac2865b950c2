//! Ollama provider for embeddings and text generation.
//!
//! Uses `/api/embed` for batched embeddings and `/api/generate`, which
//! streams newline-delimited JSON objects.
//!
//! This module is only available when the `ollama` feature is enabled.

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

const DEFAULT_BASE_URL: &str = "http://localhost:11434";

/// An [`EmbeddingProvider`] and [`CompletionProvider`] backed by a local
/// Ollama daemon.
///
/// ```rust,ignore
/// use folio_rag::ollama::OllamaProvider;
///
/// let provider = OllamaProvider::new("nomic-embed-text", 768)?;
/// let vectors = provider.embed_batch(&["first", "second"]).await?;
/// ```
pub struct OllamaProvider {
    client: reqwest::Client,
    name: String,
    base_url: String,
    model: String,
    dimensions: usize,
    timeout: Duration,
}

impl OllamaProvider {
    /// Create a provider for `model` on the default local endpoint.
    pub fn new(model: impl Into<String>, dimensions: usize) -> Result<Self> {
        Self::build(DEFAULT_BASE_URL.to_string(), model.into(), dimensions, Duration::from_secs(30))
    }

    /// Build the embedding side from validated settings.
    pub fn for_embeddings(settings: &ProviderSettings, dimensions: usize) -> Result<Self> {
        let model = settings.model.as_deref().unwrap_or(settings.provider.default_embedding_model());
        Self::build(
            settings.base_url().unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            model.to_string(),
            dimensions,
            settings.timeout(),
        )
    }

    /// Build the completion side from validated settings.
    pub fn for_completions(settings: &ProviderSettings) -> Result<Self> {
        let model = settings
            .model
            .as_deref()
            .or(settings.provider.default_completion_model())
            .unwrap_or_default();
        Self::build(
            settings.base_url().unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            model.to_string(),
            0,
            settings.timeout(),
        )
    }

    fn build(base_url: String, model: String, dimensions: usize, timeout: Duration) -> Result<Self> {
        let name = format!("ollama/{model}");
        Ok(Self { client: http::client(&name, timeout)?, name, base_url, model, dimensions, timeout })
    }

    /// Point the provider at a different daemon.
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    /// Set the per-call timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[derive(Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a [&'a str],
}

#[derive(Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    options: GenerateOptions,
}

#[derive(Serialize)]
struct GenerateOptions {
    temperature: f32,
    num_predict: u32,
}

#[derive(Deserialize)]
struct GenerateChunk {
    #[serde(default)]
    response: String,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

#[async_trait]
impl EmbeddingProvider for OllamaProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Embedding>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        debug!(provider = %self.name, batch_size = texts.len(), "embedding batch");

        let response = self
            .client
            .post(format!("{}/api/embed", self.base_url))
            .timeout(self.timeout)
            .json(&EmbedRequest { model: &self.model, input: texts })
            .send()
            .await
            .map_err(|e| http::transport_error(&self.name, self.timeout, e))?;
        let response = http::check_status(&self.name, response).await?;

        let parsed: EmbedResponse = response.json().await.map_err(|e| {
            error!(provider = %self.name, error = %e, "failed to parse response");
            RagError::ProviderUnavailable {
                provider: self.name.clone(),
                message: format!("failed to parse response: {e}"),
            }
        })?;
        ensure_batch_len(&self.name, texts.len(), parsed.embeddings.len())?;
        Ok(parsed.embeddings)
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

#[async_trait]
impl CompletionProvider for OllamaProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete_stream(
        &self,
        prompt: &str,
        options: &GenerationOptions,
    ) -> Result<CompletionStream> {
        let request = GenerateRequest {
            model: &self.model,
            prompt,
            stream: true,
            options: GenerateOptions {
                temperature: options.temperature,
                num_predict: options.max_tokens,
            },
        };

        let send = self.client.post(format!("{}/api/generate", self.base_url)).json(&request).send();
        let response = tokio::time::timeout(self.timeout, send)
            .await
            .map_err(|_| RagError::Timeout { provider: self.name.clone(), after: self.timeout })?
            .map_err(|e| http::transport_error(&self.name, self.timeout, e))?;
        let response = http::check_status(&self.name, response).await?;

        let provider = self.name.clone();
        let mut lines = Box::pin(http::lines(provider.clone(), self.timeout, response.bytes_stream()));
        Ok(Box::pin(async_stream::stream! {
            while let Some(line) = lines.next().await {
                let chunk = line.and_then(|line| {
                    serde_json::from_str::<GenerateChunk>(&line).map_err(|e| RagError::GenerationError {
                        provider: provider.clone(),
                        message: format!("malformed stream line: {e}"),
                    })
                });
                match chunk {
                    Ok(GenerateChunk { error: Some(message), .. }) => {
                        yield Err(RagError::GenerationError { provider: provider.clone(), message });
                        return;
                    }
                    Ok(chunk) => {
                        if !chunk.response.is_empty() {
                            yield Ok(chunk.response);
                        }
                        if chunk.done {
                            return;
                        }
                    }
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                }
            }
        }))
    }
}
