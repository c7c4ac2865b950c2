//! Grounded answer generation.
//!
//! Retrieved chunks are numbered `[1]`, `[2]`, ... in the prompt. Markers the
//! model echoes back (`[2]`, `[1, 3]`) are mapped to chunk and document ids;
//! numbers outside the provided range are dropped and logged.

use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::completion::{CompletionProvider, CompletionStream, GenerationOptions, cancellable};
use crate::document::RetrievalResult;
use crate::error::Result;
use crate::retry::{RetryPolicy, with_retry};

const CITATION_PATTERN: &str = r"\[(\d+(?:\s*,\s*\d+)*)\]";

static CITATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(CITATION_PATTERN).expect("citation pattern compiles"));

/// Chunks shorter than this after truncation are left out of the context.
const MIN_TRUNCATED_CHARS: usize = 100;
const TRUNCATION_MARK: &str = "... [truncated]";

/// The text wrapped around retrieved context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptTemplate {
    /// Fixed instruction placed before the template body.
    pub system_instruction: String,
    /// Used as the context when nothing was retrieved, and prefixed to the answer.
    pub no_context_notice: String,
    /// Body with `{context}` and `{question}` placeholders.
    pub template: String,
}

impl Default for PromptTemplate {
    fn default() -> Self {
        Self {
            system_instruction: "You are a helpful assistant that answers questions based on the \
                provided context. Cite the passages you rely on by their numbers, for example [1] \
                or [2, 3]. If the context doesn't contain enough information, say so explicitly."
                .to_string(),
            no_context_notice: "No supporting context was found in the library for this question."
                .to_string(),
            template: "Context:\n{context}\n\nQuestion: {question}\n\nAnswer:".to_string(),
        }
    }
}

impl PromptTemplate {
    /// Substitute placeholders in one pass, so text inside `context` or
    /// `question` is never itself treated as a placeholder.
    fn render(&self, context: &str, question: &str) -> String {
        let mut body = String::with_capacity(self.template.len() + context.len() + question.len());
        let mut rest = self.template.as_str();
        while let Some(pos) = rest.find('{') {
            body.push_str(&rest[..pos]);
            let tail = &rest[pos..];
            if let Some(after) = tail.strip_prefix("{context}") {
                body.push_str(context);
                rest = after;
            } else if let Some(after) = tail.strip_prefix("{question}") {
                body.push_str(question);
                rest = after;
            } else {
                body.push('{');
                rest = &tail[1..];
            }
        }
        body.push_str(rest);
        format!("{}\n\n{}", self.system_instruction.trim_end(), body)
    }
}

/// A chunk that made it into the prompt under citation number `index + 1`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CitableChunk {
    pub chunk_id: String,
    pub document_id: String,
}

/// A rendered prompt plus what its citation numbers refer to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PreparedPrompt {
    pub prompt: String,
    pub citable: Vec<CitableChunk>,
    /// Set when no chunk made it into the context; the answer then starts
    /// with this notice.
    pub no_context_notice: Option<String>,
}

impl PreparedPrompt {
    fn without_context(query: &str, template: &PromptTemplate) -> Self {
        Self {
            prompt: template.render(&template.no_context_notice, query),
            citable: Vec::new(),
            no_context_notice: Some(template.no_context_notice.clone()),
        }
    }
}

/// The model's answer with resolved citations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GeneratedAnswer {
    pub answer: String,
    /// Cited chunk ids in order of first mention.
    pub cited_chunk_ids: Vec<String>,
    /// Documents of the cited chunks, deduplicated.
    pub cited_document_ids: Vec<String>,
    pub prompt: String,
}

impl GeneratedAnswer {
    /// Resolve citations in `text` against the chunks of `prepared`.
    pub fn from_text(text: impl Into<String>, prepared: &PreparedPrompt) -> Self {
        let text = text.into();
        let answer = match &prepared.no_context_notice {
            Some(notice) if !text.starts_with(notice.as_str()) => {
                format!("{notice}\n\n{}", text.trim_start())
            }
            _ => text,
        };

        let mut cited_chunk_ids: Vec<String> = Vec::new();
        let mut cited_document_ids: Vec<String> = Vec::new();
        for number in citation_numbers(&answer) {
            let Some(chunk) = number.checked_sub(1).and_then(|i| prepared.citable.get(i)) else {
                warn!(citation = number, available = prepared.citable.len(), "dropping out-of-range citation");
                continue;
            };
            if !cited_chunk_ids.contains(&chunk.chunk_id) {
                cited_chunk_ids.push(chunk.chunk_id.clone());
            }
            if !cited_document_ids.contains(&chunk.document_id) {
                cited_document_ids.push(chunk.document_id.clone());
            }
        }

        Self { answer, cited_chunk_ids, cited_document_ids, prompt: prepared.prompt.clone() }
    }
}

fn citation_numbers(text: &str) -> Vec<usize> {
    CITATION
        .captures_iter(text)
        .filter_map(|caps| caps.get(1))
        .flat_map(|group| group.as_str().split(','))
        .filter_map(|n| n.trim().parse::<usize>().ok())
        .collect()
}

/// A streamed answer: fragments plus what is needed to resolve citations
/// once the caller has the full text.
pub struct AnswerStream {
    pub prepared: PreparedPrompt,
    pub fragments: CompletionStream,
}

/// Builds grounded prompts and delegates to a [`CompletionProvider`].
pub struct AnswerGenerator {
    completion: Arc<dyn CompletionProvider>,
    template: PromptTemplate,
    options: GenerationOptions,
    max_context_chars: usize,
    retry: RetryPolicy,
}

impl AnswerGenerator {
    pub fn new(completion: Arc<dyn CompletionProvider>) -> Self {
        Self {
            completion,
            template: PromptTemplate::default(),
            options: GenerationOptions::default(),
            max_context_chars: 4000,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_template(mut self, template: PromptTemplate) -> Self {
        self.template = template;
        self
    }

    pub fn with_options(mut self, options: GenerationOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_max_context_chars(mut self, chars: usize) -> Self {
        self.max_context_chars = chars;
        self
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    pub fn template(&self) -> &PromptTemplate {
        &self.template
    }

    /// Render the prompt for `query` over `retrieved` using `template`.
    ///
    /// Chunks are included in rank order until `max_context_chars` is used
    /// up; the chunk crossing the budget is truncated, or left out when too
    /// little room remains. Left-out chunks cannot be cited. When not even
    /// the first chunk fits, the prompt falls back to the no-context notice.
    pub fn prepare(
        &self,
        query: &str,
        retrieved: &[RetrievalResult],
        template: &PromptTemplate,
    ) -> PreparedPrompt {
        if retrieved.is_empty() {
            return PreparedPrompt::without_context(query, template);
        }

        let mut parts = Vec::new();
        let mut citable = Vec::new();
        let mut used = 0usize;
        for result in retrieved {
            let chunk = &result.chunk;
            let len = chunk.text.chars().count();
            let text = if used + len > self.max_context_chars {
                let remaining = self.max_context_chars.saturating_sub(used + MIN_TRUNCATED_CHARS);
                if remaining <= MIN_TRUNCATED_CHARS {
                    break;
                }
                let cut: String = chunk.text.chars().take(remaining).collect();
                format!("{cut}{TRUNCATION_MARK}")
            } else {
                chunk.text.clone()
            };
            used += text.chars().count();

            let source = chunk
                .metadata
                .get("title")
                .or_else(|| chunk.metadata.get("source_uri"))
                .unwrap_or(&chunk.document_id);
            parts.push(format!("[{}] {source}\n{text}", citable.len() + 1));
            citable.push(CitableChunk {
                chunk_id: chunk.id.clone(),
                document_id: chunk.document_id.clone(),
            });
            if used >= self.max_context_chars {
                break;
            }
        }
        if citable.is_empty() {
            debug!(
                retrieved = retrieved.len(),
                budget = self.max_context_chars,
                "no chunk fits the context budget"
            );
            return PreparedPrompt::without_context(query, template);
        }
        if citable.len() < retrieved.len() {
            debug!(
                included = citable.len(),
                retrieved = retrieved.len(),
                budget = self.max_context_chars,
                "context budget reached"
            );
        }

        PreparedPrompt {
            prompt: template.render(&parts.join("\n\n"), query),
            citable,
            no_context_notice: None,
        }
    }

    /// Generate an answer with the generator's own template.
    pub async fn generate(&self, query: &str, retrieved: &[RetrievalResult]) -> Result<GeneratedAnswer> {
        self.generate_with(query, retrieved, &self.template, &CancellationToken::new()).await
    }

    /// Generate an answer with an explicit template and cancellation signal.
    pub async fn generate_with(
        &self,
        query: &str,
        retrieved: &[RetrievalResult],
        template: &PromptTemplate,
        cancel: &CancellationToken,
    ) -> Result<GeneratedAnswer> {
        let prepared = self.prepare(query, retrieved, template);
        let text = with_retry(&self.retry, cancel, || {
            self.completion.complete(&prepared.prompt, &self.options)
        })
        .await?;

        let answer = GeneratedAnswer::from_text(text, &prepared);
        info!(
            provider = self.completion.name(),
            context_chunks = prepared.citable.len(),
            cited = answer.cited_chunk_ids.len(),
            grounded = prepared.no_context_notice.is_none(),
            "answer generated"
        );
        Ok(answer)
    }

    /// Stream the answer. Cancelling `cancel` ends the stream with
    /// [`RagError::Cancelled`](crate::RagError::Cancelled).
    ///
    /// When nothing was retrieved the first fragment is the no-context
    /// notice. Pass the buffered text to [`GeneratedAnswer::from_text`] to
    /// resolve citations.
    pub async fn generate_stream(
        &self,
        query: &str,
        retrieved: &[RetrievalResult],
        cancel: CancellationToken,
    ) -> Result<AnswerStream> {
        let prepared = self.prepare(query, retrieved, &self.template);
        let stream = with_retry(&self.retry, &cancel, || {
            self.completion.complete_stream(&prepared.prompt, &self.options)
        })
        .await?;

        let fragments = match &prepared.no_context_notice {
            Some(notice) => {
                let lead = futures::stream::iter([Ok(format!("{notice}\n\n"))]);
                Box::pin(futures::StreamExt::chain(lead, stream)) as CompletionStream
            }
            None => stream,
        };
        Ok(AnswerStream { prepared, fragments: cancellable(fragments, cancel) })
    }
}
