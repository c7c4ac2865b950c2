//! Shared HTTP plumbing for the provider adapters: client construction,
//! error mapping and line framing for streamed responses.

use std::time::Duration;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Response, StatusCode};
use tracing::error;

use crate::error::RagError;

/// Build a client whose connect phase is bounded by `timeout`.
///
/// Whole-request timeouts are applied per request, since streamed
/// completions may legitimately outlive them.
pub(crate) fn client(provider: &str, timeout: Duration) -> Result<reqwest::Client, RagError> {
    reqwest::Client::builder().connect_timeout(timeout).build().map_err(|e| {
        RagError::ConfigError(format!("failed to build HTTP client for {provider}: {e}"))
    })
}

/// Map a transport-level failure.
pub(crate) fn transport_error(provider: &str, timeout: Duration, err: reqwest::Error) -> RagError {
    if err.is_timeout() {
        RagError::Timeout { provider: provider.to_string(), after: timeout }
    } else {
        error!(provider, error = %err, "request failed");
        RagError::ProviderUnavailable {
            provider: provider.to_string(),
            message: format!("request failed: {err}"),
        }
    }
}

/// Return the response unchanged on 2xx, otherwise the mapped error.
pub(crate) async fn check_status(provider: &str, response: Response) -> Result<Response, RagError> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status();
    let retry_after = retry_after(response.headers());
    let body = response.text().await.unwrap_or_default();
    error!(provider, %status, "provider returned an error status");
    Err(status_error(provider, status, retry_after, error_detail(&body)))
}

/// Translate an HTTP status into the error taxonomy.
pub(crate) fn status_error(
    provider: &str,
    status: StatusCode,
    retry_after: Option<Duration>,
    detail: String,
) -> RagError {
    let provider = provider.to_string();
    match status.as_u16() {
        429 => RagError::RateLimited { provider, retry_after },
        400 | 413 | 422 => RagError::InvalidInput { provider, message: detail },
        s if s >= 500 => {
            RagError::ProviderUnavailable { provider, message: format!("HTTP {status}: {detail}") }
        }
        _ => RagError::ConfigError(format!("{provider} rejected the request ({status}): {detail}")),
    }
}

/// `Retry-After` in delta-seconds form. HTTP dates are ignored.
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Pull a human-readable message out of an error body.
///
/// Understands `{"error": {"message": ".."}}` and `{"error": ".."}`.
pub(crate) fn error_detail(body: &str) -> String {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(body) else {
        return body.trim().to_string();
    };
    let error = &value["error"];
    error["message"]
        .as_str()
        .or_else(|| error.as_str())
        .map_or_else(|| body.trim().to_string(), str::to_string)
}

/// Split a byte stream into text lines, tolerating chunk boundaries that
/// fall inside a line or inside a multi-byte character.
pub(crate) fn lines<S>(provider: String, timeout: Duration, bytes: S) -> impl Stream<Item = Result<String, RagError>> + Send
where
    S: Stream<Item = reqwest::Result<Bytes>> + Send + 'static,
{
    async_stream::stream! {
        let mut bytes = Box::pin(bytes);
        let mut buffer: Vec<u8> = Vec::new();
        loop {
            let next = match tokio::time::timeout(timeout, bytes.next()).await {
                Ok(next) => next,
                Err(_) => {
                    yield Err(RagError::Timeout { provider: provider.clone(), after: timeout });
                    return;
                }
            };
            match next {
                Some(Ok(chunk)) => {
                    buffer.extend_from_slice(&chunk);
                    while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                        let line: Vec<u8> = buffer.drain(..=pos).collect();
                        let line = String::from_utf8_lossy(&line).trim_end().to_string();
                        if !line.is_empty() {
                            yield Ok(line);
                        }
                    }
                }
                Some(Err(e)) => {
                    yield Err(transport_error(&provider, timeout, e));
                    return;
                }
                None => break,
            }
        }
        let rest = String::from_utf8_lossy(&buffer).trim().to_string();
        if !rest.is_empty() {
            yield Ok(rest);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_map_onto_the_error_taxonomy() {
        let secs = Some(Duration::from_secs(2));
        assert!(matches!(
            status_error("p", StatusCode::TOO_MANY_REQUESTS, secs, String::new()),
            RagError::RateLimited { retry_after: Some(d), .. } if d == Duration::from_secs(2)
        ));
        assert!(matches!(
            status_error("p", StatusCode::PAYLOAD_TOO_LARGE, None, "too long".into()),
            RagError::InvalidInput { .. }
        ));
        assert!(matches!(
            status_error("p", StatusCode::BAD_GATEWAY, None, String::new()),
            RagError::ProviderUnavailable { .. }
        ));
        assert!(matches!(
            status_error("p", StatusCode::UNAUTHORIZED, None, String::new()),
            RagError::ConfigError(_)
        ));
    }

    #[test]
    fn error_detail_understands_both_shapes() {
        assert_eq!(error_detail(r#"{"error":{"message":"bad key"}}"#), "bad key");
        assert_eq!(error_detail(r#"{"error":"model not found"}"#), "model not found");
        assert_eq!(error_detail("plain text\n"), "plain text");
    }

    #[test]
    fn retry_after_reads_delta_seconds() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, "7".parse().unwrap());
        assert_eq!(retry_after(&headers), Some(Duration::from_secs(7)));
        headers.insert(RETRY_AFTER, "Wed, 21 Oct 2015 07:28:00 GMT".parse().unwrap());
        assert_eq!(retry_after(&headers), None);
    }

    #[tokio::test]
    async fn lines_reassemble_split_chunks() {
        let parts: Vec<reqwest::Result<Bytes>> = vec![
            Ok(Bytes::from_static(b"data: one\nda")),
            Ok(Bytes::from_static(b"ta: t\xc3")),
            Ok(Bytes::from_static(b"\xa9\n\ntail")),
        ];
        let collected: Vec<String> =
            lines("p".into(), Duration::from_secs(5), futures::stream::iter(parts))
                .map(|line| line.unwrap())
                .collect()
                .await;
        assert_eq!(collected, vec!["data: one", "data: té", "tail"]);
    }
}
