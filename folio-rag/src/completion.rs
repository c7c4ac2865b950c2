//! Completion provider trait for LLM text generation.

use std::pin::Pin;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::{RagError, Result};

/// A finite, non-restartable stream of generated text fragments.
pub type CompletionStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Sampling parameters for one completion call.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GenerationOptions {
    /// Maximum number of tokens to generate.
    pub max_tokens: u32,
    /// Sampling temperature in `[0, 2]`.
    pub temperature: f32,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self { max_tokens: 512, temperature: 0.7 }
    }
}

/// A language model that turns a prompt into text.
///
/// Backends implement [`complete_stream`](CompletionProvider::complete_stream);
/// the default [`complete`](CompletionProvider::complete) buffers the fragments.
/// Backends with a cheaper non-streaming endpoint may override `complete`.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Identity of the provider and model, e.g. `ollama/llama3.1`.
    fn name(&self) -> &str;

    /// Start a completion and return its fragments as they arrive.
    async fn complete_stream(
        &self,
        prompt: &str,
        options: &GenerationOptions,
    ) -> Result<CompletionStream>;

    /// Run a completion to the end and return the full text.
    async fn complete(&self, prompt: &str, options: &GenerationOptions) -> Result<String> {
        let mut stream = self.complete_stream(prompt, options).await?;
        let mut text = String::new();
        while let Some(fragment) = stream.next().await {
            text.push_str(&fragment?);
        }
        Ok(text)
    }
}

/// Stop a completion stream as soon as `cancel` fires.
///
/// The wrapped stream is dropped on cancellation, which closes the underlying
/// connection without waiting for the provider to finish. The final item is
/// `Err(RagError::Cancelled)`.
pub fn cancellable(mut inner: CompletionStream, cancel: CancellationToken) -> CompletionStream {
    Box::pin(async_stream::stream! {
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                item = inner.next() => Some(item),
            };
            match next {
                None => {
                    yield Err(RagError::Cancelled);
                    break;
                }
                Some(Some(item)) => yield item,
                Some(None) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fragments(Vec<&'static str>);

    #[async_trait]
    impl CompletionProvider for Fragments {
        fn name(&self) -> &str {
            "fragments"
        }

        async fn complete_stream(
            &self,
            _prompt: &str,
            _options: &GenerationOptions,
        ) -> Result<CompletionStream> {
            let items: Vec<Result<String>> = self.0.iter().map(|s| Ok(s.to_string())).collect();
            Ok(Box::pin(futures::stream::iter(items)))
        }
    }

    #[tokio::test]
    async fn complete_buffers_all_fragments() {
        let provider = Fragments(vec!["Hello", ", ", "world"]);
        let text = provider.complete("hi", &GenerationOptions::default()).await.unwrap();
        assert_eq!(text, "Hello, world");
    }

    #[tokio::test]
    async fn cancellation_stops_fragment_production() {
        let cancel = CancellationToken::new();
        let pending: CompletionStream =
            Box::pin(futures::stream::iter(vec![Ok("first".to_string())]).chain(futures::stream::pending()));
        let mut stream = cancellable(pending, cancel.clone());

        assert_eq!(stream.next().await.unwrap().unwrap(), "first");
        cancel.cancel();
        assert!(matches!(stream.next().await, Some(Err(RagError::Cancelled))));
        assert!(stream.next().await.is_none());
    }
}
