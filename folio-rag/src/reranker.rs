//! Reranker trait for re-scoring retrieval results.

use async_trait::async_trait;

use crate::document::RetrievalResult;
use crate::error::Result;

/// A reranker that re-scores and reorders retrieval results.
///
/// Implementations can use cross-encoder models, LLM-based scoring, or
/// other strategies to improve precision beyond initial vector similarity.
/// The retriever applies the score threshold after reranking, so rerankers
/// must keep scores within `[0, 1]`.
#[async_trait]
pub trait Reranker: Send + Sync {
    /// Rerank results given the original (unrewritten) query.
    ///
    /// Returns results in a new order with potentially updated scores.
    async fn rerank(&self, query: &str, results: Vec<RetrievalResult>) -> Result<Vec<RetrievalResult>>;
}

/// A no-op reranker that returns results unchanged.
///
/// # Example
///
/// ```rust,ignore
/// use folio_rag::NoOpReranker;
///
/// let reranker = NoOpReranker;
/// let reranked = reranker.rerank("query", results).await?;
/// // reranked == results (same order, same scores)
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpReranker;

#[async_trait]
impl Reranker for NoOpReranker {
    async fn rerank(&self, _query: &str, results: Vec<RetrievalResult>) -> Result<Vec<RetrievalResult>> {
        Ok(results)
    }
}

/// Blends vector similarity with the share of query terms present in a chunk.
///
/// `score = (1 - weight) * similarity + weight * term_overlap`, both in
/// `[0, 1]`. A cheap stand-in for a cross-encoder when exact wording matters.
#[derive(Debug, Clone, Copy)]
pub struct TermOverlapReranker {
    weight: f32,
}

impl TermOverlapReranker {
    /// `weight` is clamped to `[0, 1]`.
    pub fn new(weight: f32) -> Self {
        Self { weight: weight.clamp(0.0, 1.0) }
    }
}

impl Default for TermOverlapReranker {
    fn default() -> Self {
        Self::new(0.3)
    }
}

fn terms(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric()).filter(|t| t.len() > 2).map(str::to_lowercase)
}

#[async_trait]
impl Reranker for TermOverlapReranker {
    async fn rerank(&self, query: &str, mut results: Vec<RetrievalResult>) -> Result<Vec<RetrievalResult>> {
        let query_terms: std::collections::HashSet<String> = terms(query).collect();
        if query_terms.is_empty() {
            return Ok(results);
        }
        for result in &mut results {
            let chunk_terms: std::collections::HashSet<String> = terms(&result.chunk.text).collect();
            let overlap = query_terms.intersection(&chunk_terms).count() as f32 / query_terms.len() as f32;
            result.score = ((1.0 - self.weight) * result.score + self.weight * overlap).clamp(0.0, 1.0);
        }
        results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        Ok(results)
    }
}
