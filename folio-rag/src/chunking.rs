//! Document chunking strategies.
//!
//! This module provides the [`Chunker`] trait and two implementations:
//!
//! - [`RecursiveChunker`]: cuts at the best semantic boundary available:
//!   paragraph break, then sentence break, then word break, then a raw character cut
//! - [`FixedSizeChunker`]: always cuts at exactly `size` characters
//!
//! Both produce [`TextSpan`]s that are contiguous-with-overlap: for consecutive
//! spans `next.start_offset == prev.end_offset - overlap`. Offsets and sizes are
//! counted in characters (Unicode scalar values), so a span never splits a
//! multi-byte character.

use serde::{Deserialize, Serialize};

use crate::document::{
    Chunk, Document, META_CHUNK_INDEX, META_DOCUMENT_ID, META_END_OFFSET, META_START_OFFSET,
};
use crate::error::{RagError, Result};

/// Validated span size and overlap, both in characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawChunkConfig")]
pub struct ChunkConfig {
    size: usize,
    overlap: usize,
}

#[derive(Deserialize)]
struct RawChunkConfig {
    size: usize,
    overlap: usize,
}

impl TryFrom<RawChunkConfig> for ChunkConfig {
    type Error = RagError;

    fn try_from(raw: RawChunkConfig) -> Result<Self> {
        ChunkConfig::new(raw.size, raw.overlap)
    }
}

impl ChunkConfig {
    /// Create a chunk configuration.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::ConfigError`] if `size == 0` or `overlap >= size`.
    pub fn new(size: usize, overlap: usize) -> Result<Self> {
        if size == 0 {
            return Err(RagError::ConfigError("chunk size must be greater than zero".to_string()));
        }
        if overlap >= size {
            return Err(RagError::ConfigError(format!(
                "chunk_overlap ({overlap}) must be less than chunk_size ({size})"
            )));
        }
        Ok(Self { size, overlap })
    }

    /// Target maximum span length in characters.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of trailing characters repeated at the start of the next span.
    pub fn overlap(&self) -> usize {
        self.overlap
    }
}

/// A slice of the source text with its position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextSpan<'a> {
    /// The span text, borrowed from the source.
    pub text: &'a str,
    /// Character offset of the first character.
    pub start_offset: usize,
    /// Character offset one past the last character.
    pub end_offset: usize,
    /// Position of the span in the sequence.
    pub index: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Boundary {
    Paragraph,
    Sentence,
    Word,
}

const SEMANTIC_BOUNDARIES: &[Boundary] = &[Boundary::Paragraph, Boundary::Sentence, Boundary::Word];

/// Lazy iterator over the spans of one text.
///
/// Created by [`Chunker::spans`]; calling `spans` again on the same text
/// restarts from the beginning and yields identical spans.
#[derive(Debug, Clone)]
pub struct Spans<'a> {
    text: &'a str,
    /// Byte position of every character, followed by `text.len()`.
    char_starts: Vec<usize>,
    config: ChunkConfig,
    boundaries: &'static [Boundary],
    next_start: Option<usize>,
    index: usize,
}

impl<'a> Spans<'a> {
    fn new(text: &'a str, config: ChunkConfig, boundaries: &'static [Boundary]) -> Self {
        let mut char_starts: Vec<usize> = text.char_indices().map(|(i, _)| i).collect();
        char_starts.push(text.len());
        let next_start = if text.is_empty() { None } else { Some(0) };
        Self { text, char_starts, config, boundaries, next_start, index: 0 }
    }

    fn char_count(&self) -> usize {
        self.char_starts.len() - 1
    }

    fn byte_at(&self, char_pos: usize) -> usize {
        self.char_starts[char_pos]
    }

    fn char_at(&self, byte_pos: usize) -> usize {
        // Separators are ASCII, so every cut lands on a character boundary.
        self.char_starts.binary_search(&byte_pos).unwrap_or_else(|i| i)
    }

    /// Choose where the span starting at `start` ends.
    ///
    /// A cut must leave the next span starting after `start`, i.e. it must lie
    /// beyond `start + overlap`.
    fn find_cut(&self, start: usize) -> usize {
        let limit = start + self.config.size;
        let min_end = start + self.config.overlap + 1;
        let window_offset = self.byte_at(start);
        let window = &self.text[window_offset..self.byte_at(limit)];

        for boundary in self.boundaries {
            let cut = match boundary {
                Boundary::Paragraph => window.rfind("\n\n").map(|pos| pos + 2),
                Boundary::Sentence => last_sentence_break(window),
                Boundary::Word => window
                    .char_indices()
                    .rev()
                    .find(|(_, c)| c.is_whitespace())
                    .map(|(pos, c)| pos + c.len_utf8()),
            };
            if let Some(cut) = cut {
                let end = self.char_at(window_offset + cut);
                if end >= min_end {
                    return end;
                }
            }
        }
        limit
    }
}

/// Byte position just after the last `.`, `!` or `?` followed by whitespace.
fn last_sentence_break(window: &str) -> Option<usize> {
    let mut prev: Option<(usize, char)> = None;
    for (pos, c) in window.char_indices().rev() {
        if let Some((ws_pos, ws)) = prev {
            if matches!(c, '.' | '!' | '?') && ws.is_whitespace() {
                return Some(ws_pos + ws.len_utf8());
            }
        }
        prev = Some((pos, c));
    }
    None
}

impl<'a> Iterator for Spans<'a> {
    type Item = TextSpan<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let start = self.next_start?;
        let total = self.char_count();
        let end = if total - start <= self.config.size { total } else { self.find_cut(start) };

        let span = TextSpan {
            text: &self.text[self.byte_at(start)..self.byte_at(end)],
            start_offset: start,
            end_offset: end,
            index: self.index,
        };
        self.index += 1;
        self.next_start = if end >= total { None } else { Some(end - self.config.overlap) };
        Some(span)
    }
}

impl std::iter::FusedIterator for Spans<'_> {}

/// A strategy for splitting documents into chunks.
///
/// Implementations produce [`Chunk`]s with text, offsets and metadata but no
/// embeddings. Embeddings are attached later by the indexer.
pub trait Chunker: Send + Sync {
    /// The span configuration this chunker was built with.
    fn config(&self) -> &ChunkConfig;

    /// Split text into spans. Empty text yields no spans.
    fn spans<'a>(&self, text: &'a str) -> Spans<'a>;

    /// Split a document into chunks.
    ///
    /// Chunk IDs are `{document_id}_{index}`. Each chunk inherits the parent
    /// document's metadata plus `document_id`, `chunk_index`, `start_offset`
    /// and `end_offset` fields.
    fn chunk(&self, document: &Document) -> Vec<Chunk> {
        self.spans(&document.text)
            .map(|span| {
                let mut metadata = document.metadata.clone();
                metadata.insert(META_DOCUMENT_ID.to_string(), document.id.clone());
                metadata.insert(META_CHUNK_INDEX.to_string(), span.index.to_string());
                metadata.insert(META_START_OFFSET.to_string(), span.start_offset.to_string());
                metadata.insert(META_END_OFFSET.to_string(), span.end_offset.to_string());
                if let Some(uri) = &document.source_uri {
                    metadata.entry("source_uri".to_string()).or_insert_with(|| uri.clone());
                }

                Chunk {
                    id: Chunk::make_id(&document.id, span.index),
                    document_id: document.id.clone(),
                    text: span.text.to_string(),
                    start_offset: span.start_offset,
                    end_offset: span.end_offset,
                    sequence_index: span.index,
                    embedding: Vec::new(),
                    metadata,
                }
            })
            .collect()
    }
}

/// Splits text at the best available boundary: paragraphs → sentences → words.
///
/// Each span is at most `size` characters. Within that window the chunker
/// cuts after the last paragraph break (`\n\n`); failing that after the last
/// sentence terminator followed by whitespace; failing that after the last
/// whitespace; and only then at exactly `size` characters.
///
/// # Example
///
/// ```rust
/// use folio_rag::{ChunkConfig, Chunker, RecursiveChunker};
///
/// let chunker = RecursiveChunker::new(ChunkConfig::new(10, 4).unwrap());
/// let spans: Vec<_> = chunker.spans("AAAA BBBB CCCC DDDD").map(|s| s.text).collect();
/// assert_eq!(spans, vec!["AAAA BBBB ", "BBB CCCC ", "CCC DDDD"]);
/// ```
#[derive(Debug, Clone)]
pub struct RecursiveChunker {
    config: ChunkConfig,
}

impl RecursiveChunker {
    /// Create a new `RecursiveChunker`.
    pub fn new(config: ChunkConfig) -> Self {
        Self { config }
    }
}

impl Chunker for RecursiveChunker {
    fn config(&self) -> &ChunkConfig {
        &self.config
    }

    fn spans<'a>(&self, text: &'a str) -> Spans<'a> {
        Spans::new(text, self.config, SEMANTIC_BOUNDARIES)
    }
}

/// Splits text into fixed-size spans by character count with configurable overlap.
#[derive(Debug, Clone)]
pub struct FixedSizeChunker {
    config: ChunkConfig,
}

impl FixedSizeChunker {
    /// Create a new `FixedSizeChunker`.
    pub fn new(config: ChunkConfig) -> Self {
        Self { config }
    }
}

impl Chunker for FixedSizeChunker {
    fn config(&self) -> &ChunkConfig {
        &self.config
    }

    fn spans<'a>(&self, text: &'a str) -> Spans<'a> {
        Spans::new(text, self.config, &[])
    }
}

/// Split `text` with the boundary-aware strategy of [`RecursiveChunker`].
pub fn chunk_text<'a>(text: &'a str, config: &ChunkConfig) -> Spans<'a> {
    Spans::new(text, *config, SEMANTIC_BOUNDARIES)
}
