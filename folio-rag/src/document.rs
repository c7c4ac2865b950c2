//! Data types for documents, chunks, and retrieval results.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// A fixed-length vector produced by one embedding model.
pub type Embedding = Vec<f32>;

/// Metadata key holding the parent document id on every stored chunk.
pub const META_DOCUMENT_ID: &str = "document_id";
/// Metadata key holding the chunk's sequence index.
pub const META_CHUNK_INDEX: &str = "chunk_index";
/// Metadata key holding the chunk's start offset in the source text.
pub const META_START_OFFSET: &str = "start_offset";
/// Metadata key holding the chunk's end offset in the source text.
pub const META_END_OFFSET: &str = "end_offset";

/// A source document containing text content and metadata.
///
/// Documents are immutable once chunked. Re-ingesting a document with the
/// same `id` supersedes the previous version.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Document {
    /// Stable external identifier for the document.
    pub id: String,
    /// The full extracted text of the document.
    pub text: String,
    /// Key-value metadata associated with the document (title, author, tags).
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    /// Optional URI pointing to the original source.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_uri: Option<String>,
}

impl Document {
    /// Create a document with no metadata.
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self { id: id.into(), text: text.into(), metadata: HashMap::new(), source_uri: None }
    }

    /// Add a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Set the source URI.
    pub fn with_source_uri(mut self, uri: impl Into<String>) -> Self {
        self.source_uri = Some(uri.into());
        self
    }
}

/// A segment of a [`Document`] with its vector embedding.
///
/// Chunk ids are deterministic (`{document_id}_{sequence_index}`), so
/// re-chunking the same text with the same configuration yields the same ids.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Chunk {
    /// Unique identifier for the chunk.
    pub id: String,
    /// The ID of the parent [`Document`].
    pub document_id: String,
    /// The text content of the chunk, a substring of the document text.
    pub text: String,
    /// Character offset where the chunk starts in the document text.
    pub start_offset: usize,
    /// Character offset one past the chunk's last character.
    pub end_offset: usize,
    /// Position of the chunk within its document.
    pub sequence_index: usize,
    /// The vector embedding for this chunk's text. Empty until embedded.
    #[serde(default)]
    pub embedding: Embedding,
    /// Key-value metadata inherited from the parent document plus chunk-specific fields.
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Chunk {
    /// Build the deterministic chunk id for a document and sequence index.
    pub fn make_id(document_id: &str, sequence_index: usize) -> String {
        format!("{document_id}_{sequence_index}")
    }
}

/// A retrieved [`Chunk`] paired with a relevance score.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalResult {
    /// The retrieved chunk.
    pub chunk: Chunk,
    /// Similarity in `[0, 1]`; 1 means the vectors point in the same direction.
    pub score: f32,
    /// The ID of the document the chunk belongs to.
    pub document_id: String,
}

impl RetrievalResult {
    /// Pair a chunk with its score.
    pub fn new(chunk: Chunk, score: f32) -> Self {
        let document_id = chunk.document_id.clone();
        Self { chunk, score, document_id }
    }
}

/// Equality constraints on chunk metadata.
///
/// A chunk matches when every constraint key is present in its metadata with
/// exactly the given value. An empty filter matches everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MetadataFilter {
    constraints: HashMap<String, String>,
}

impl MetadataFilter {
    /// Create an empty filter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Require `key` to equal `value`.
    pub fn require(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.constraints.insert(key.into(), value.into());
        self
    }

    /// Whether the filter has no constraints.
    pub fn is_empty(&self) -> bool {
        self.constraints.is_empty()
    }

    /// Check a metadata map against every constraint.
    pub fn matches(&self, metadata: &HashMap<String, String>) -> bool {
        self.constraints.iter().all(|(k, v)| metadata.get(k) == Some(v))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for MetadataFilter {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self { constraints: iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect() }
    }
}
