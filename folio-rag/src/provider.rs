//! Provider selection.
//!
//! The set of backends is closed: [`ProviderKind`] names every supported
//! service and the builders here turn validated [`ProviderSettings`] into
//! trait objects once, at startup.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::completion::CompletionProvider;
use crate::config::ProviderSettings;
use crate::embedding::{EmbeddingProvider, HashingEmbeddingProvider};
use crate::error::{RagError, Result};

/// Dimensions used by the hashing embedder when none are configured.
pub const DEFAULT_HASHING_DIMENSIONS: usize = 384;

/// The supported embedding and completion backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderKind {
    /// The OpenAI cloud API.
    #[serde(rename = "openai")]
    OpenAI,
    /// A local Ollama daemon.
    Ollama,
    /// Any server exposing the OpenAI-compatible API (llama.cpp, vLLM, LM Studio).
    LocalServer,
    /// The offline feature-hashing embedder. Embedding only.
    Hashing,
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::OpenAI => "openai",
            Self::Ollama => "ollama",
            Self::LocalServer => "local-server",
            Self::Hashing => "hashing",
        })
    }
}

impl ProviderKind {
    /// Base URL used when the settings do not name one.
    pub fn default_base_url(self) -> Option<&'static str> {
        match self {
            Self::OpenAI => Some("https://api.openai.com/v1"),
            Self::Ollama => Some("http://localhost:11434"),
            Self::LocalServer => Some("http://localhost:8080/v1"),
            Self::Hashing => None,
        }
    }

    /// Embedding model used when the settings do not name one.
    pub fn default_embedding_model(self) -> &'static str {
        match self {
            Self::OpenAI => "text-embedding-3-small",
            Self::Ollama => "nomic-embed-text",
            Self::LocalServer => "local-model",
            Self::Hashing => "hashing",
        }
    }

    /// Completion model used when the settings do not name one.
    pub fn default_completion_model(self) -> Option<&'static str> {
        match self {
            Self::OpenAI => Some("gpt-4o-mini"),
            Self::Ollama => Some("llama3.1"),
            Self::LocalServer => Some("local-model"),
            Self::Hashing => None,
        }
    }
}

/// Output size of well-known embedding models.
fn known_dimensions(model: &str) -> Option<usize> {
    match model {
        "text-embedding-3-small" | "text-embedding-ada-002" => Some(1536),
        "text-embedding-3-large" => Some(3072),
        "nomic-embed-text" => Some(768),
        "mxbai-embed-large" => Some(1024),
        "all-minilm" | "all-MiniLM-L6-v2" => Some(384),
        "all-mpnet-base-v2" => Some(768),
        _ => None,
    }
}

/// Dimensionality the configured embedding model produces, if it can be known.
pub fn embedding_dimensions(settings: &ProviderSettings) -> Option<usize> {
    if let Some(dimensions) = settings.dimensions {
        return Some(dimensions);
    }
    match settings.provider {
        ProviderKind::Hashing => Some(DEFAULT_HASHING_DIMENSIONS),
        kind => known_dimensions(settings.model.as_deref().unwrap_or(kind.default_embedding_model())),
    }
}

/// Construct the embedding backend named by `settings`.
///
/// # Errors
///
/// Returns [`RagError::ConfigError`] when the backend's crate feature is
/// disabled, credentials are missing, or the output dimensions cannot be
/// determined.
pub fn build_embedding_provider(settings: &ProviderSettings) -> Result<Arc<dyn EmbeddingProvider>> {
    let dimensions = embedding_dimensions(settings).ok_or_else(|| {
        RagError::ConfigError(format!(
            "embedding dimensions for {} model '{}' are unknown; set `dimensions`",
            settings.provider,
            settings.model.as_deref().unwrap_or(settings.provider.default_embedding_model())
        ))
    })?;

    match settings.provider {
        ProviderKind::Hashing => Ok(Arc::new(HashingEmbeddingProvider::new(dimensions)?)),
        #[cfg(feature = "openai")]
        ProviderKind::OpenAI | ProviderKind::LocalServer => Ok(Arc::new(
            crate::openai::OpenAIProvider::for_embeddings(settings, dimensions)?,
        )),
        #[cfg(feature = "ollama")]
        ProviderKind::Ollama => {
            Ok(Arc::new(crate::ollama::OllamaProvider::for_embeddings(settings, dimensions)?))
        }
        #[allow(unreachable_patterns)]
        kind => Err(feature_disabled(kind)),
    }
}

/// Construct the completion backend named by `settings`.
///
/// # Errors
///
/// Returns [`RagError::ConfigError`] for [`ProviderKind::Hashing`], which has
/// no completion side, and for the same reasons as [`build_embedding_provider`].
pub fn build_completion_provider(settings: &ProviderSettings) -> Result<Arc<dyn CompletionProvider>> {
    match settings.provider {
        ProviderKind::Hashing => Err(RagError::ConfigError(
            "the hashing provider cannot generate completions".to_string(),
        )),
        #[cfg(feature = "openai")]
        ProviderKind::OpenAI | ProviderKind::LocalServer => {
            Ok(Arc::new(crate::openai::OpenAIProvider::for_completions(settings)?))
        }
        #[cfg(feature = "ollama")]
        ProviderKind::Ollama => Ok(Arc::new(crate::ollama::OllamaProvider::for_completions(settings)?)),
        #[allow(unreachable_patterns)]
        kind => Err(feature_disabled(kind)),
    }
}

fn feature_disabled(kind: ProviderKind) -> RagError {
    let feature = if kind == ProviderKind::Ollama { "ollama" } else { "openai" };
    RagError::ConfigError(format!(
        "provider '{kind}' requires folio-rag to be built with the `{feature}` feature"
    ))
}
