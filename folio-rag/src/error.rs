//! Error types for the `folio-rag` crate.

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur in RAG operations.
///
/// Variants fall into four groups:
///
/// - fatal configuration problems ([`ConfigError`](RagError::ConfigError)), raised at startup;
/// - transient provider failures ([`ProviderUnavailable`](RagError::ProviderUnavailable),
///   [`RateLimited`](RagError::RateLimited), [`Timeout`](RagError::Timeout)) that
///   [`with_retry`](crate::retry::with_retry) may retry;
/// - caller errors ([`InvalidInput`](RagError::InvalidInput),
///   [`DimensionMismatch`](RagError::DimensionMismatch)) that are surfaced immediately;
/// - per-document failures ([`ExtractionFailed`](RagError::ExtractionFailed),
///   [`IndexingFailed`](RagError::IndexingFailed)) that never abort a batch ingestion.
#[derive(Debug, Error)]
pub enum RagError {
    /// A configuration validation error.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// The backing service could not be reached.
    #[error("Provider unavailable ({provider}): {message}")]
    ProviderUnavailable {
        /// The provider that produced the error.
        provider: String,
        /// A description of the failure.
        message: String,
    },

    /// The provider rejected the request because of rate limiting.
    #[error("Rate limited by {provider}{}", .retry_after.map(|d| format!(" (retry after {}ms)", d.as_millis())).unwrap_or_default())]
    RateLimited {
        /// The provider that produced the error.
        provider: String,
        /// Provider-supplied delay before the next attempt, if any.
        retry_after: Option<Duration>,
    },

    /// An external call exceeded its timeout.
    #[error("Timeout ({provider}) after {}ms", .after.as_millis())]
    Timeout {
        /// The provider that timed out.
        provider: String,
        /// The timeout that elapsed.
        after: Duration,
    },

    /// The input was rejected by the provider, e.g. it exceeds the token limit.
    #[error("Invalid input ({provider}): {message}")]
    InvalidInput {
        /// The provider that rejected the input.
        provider: String,
        /// A description of the failure.
        message: String,
    },

    /// An embedding's length disagrees with the collection's dimensionality.
    #[error(
        "Dimension mismatch in collection '{collection}': expected {expected}, got {actual}"
    )]
    DimensionMismatch {
        /// The target collection.
        collection: String,
        /// Dimensionality established by the collection.
        expected: usize,
        /// Dimensionality of the rejected embedding.
        actual: usize,
    },

    /// Text could not be extracted from a source file.
    #[error("Extraction failed for document '{document_id}': {message}")]
    ExtractionFailed {
        /// The document being extracted.
        document_id: String,
        /// A description of the failure.
        message: String,
    },

    /// A document could not be indexed; the collection holds its pre-indexing state.
    #[error("Indexing failed for document '{document_id}': {source}")]
    IndexingFailed {
        /// The document being indexed.
        document_id: String,
        /// The underlying cause.
        #[source]
        source: Box<RagError>,
    },

    /// An error occurred in the vector store backend.
    #[error("Vector store error ({backend}): {message}")]
    VectorStoreError {
        /// The vector store backend that produced the error.
        backend: String,
        /// A description of the failure.
        message: String,
    },

    /// The completion provider returned an unusable response.
    #[error("Generation error ({provider}): {message}")]
    GenerationError {
        /// The completion provider that produced the error.
        provider: String,
        /// A description of the failure.
        message: String,
    },

    /// The operation was cancelled by the caller.
    #[error("Operation cancelled")]
    Cancelled,

    /// An I/O error, e.g. while reading or writing a snapshot.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A JSON (de)serialization error.
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

impl RagError {
    /// Whether the failure is transient and the call may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RagError::ProviderUnavailable { .. } | RagError::RateLimited { .. } | RagError::Timeout { .. }
        )
    }

    /// Provider-supplied retry delay, when the error carries one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            RagError::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Wrap an error as [`RagError::IndexingFailed`] for the given document.
    ///
    /// Cancellation and errors that are already document-scoped pass through unchanged.
    pub fn indexing_failed(document_id: impl Into<String>, cause: RagError) -> Self {
        match cause {
            RagError::Cancelled
            | RagError::IndexingFailed { .. }
            | RagError::ExtractionFailed { .. } => cause,
            other => RagError::IndexingFailed {
                document_id: document_id.into(),
                source: Box::new(other),
            },
        }
    }
}

/// A convenience result type for RAG operations.
pub type Result<T> = std::result::Result<T, RagError>;
