//! Text extraction and normalisation ahead of chunking.

use crate::error::{RagError, Result};

/// Turns raw file bytes into plain text.
///
/// Format-specific parsers (PDF, DOCX, EPUB) live outside this crate and plug
/// in here. Any failure must surface as [`RagError::ExtractionFailed`].
pub trait TextExtractor: Send + Sync {
    /// Extract the text of `document_id` from `bytes` of the given MIME type.
    fn extract_text(&self, document_id: &str, bytes: &[u8], mime_type: &str) -> Result<String>;
}

/// Extracts UTF-8 text formats: `text/plain`, `text/markdown`, `text/csv`
/// and `application/json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainTextExtractor;

const SUPPORTED: &[&str] = &["text/plain", "text/markdown", "text/csv", "application/json"];

impl TextExtractor for PlainTextExtractor {
    fn extract_text(&self, document_id: &str, bytes: &[u8], mime_type: &str) -> Result<String> {
        let failed = |message: String| RagError::ExtractionFailed {
            document_id: document_id.to_string(),
            message,
        };

        let mut parts = mime_type.split(';');
        let essence = parts.next().unwrap_or_default().trim().to_ascii_lowercase();
        if !SUPPORTED.contains(&essence.as_str()) {
            return Err(failed(format!("unsupported MIME type '{mime_type}'")));
        }
        let charset = parts
            .filter_map(|p| p.trim().split_once('='))
            .find(|(k, _)| k.trim().eq_ignore_ascii_case("charset"))
            .map(|(_, v)| v.trim().trim_matches('"').to_ascii_lowercase());
        if let Some(charset) = charset.filter(|c| c != "utf-8" && c != "utf8" && c != "us-ascii") {
            return Err(failed(format!("unsupported charset '{charset}'")));
        }

        let text = std::str::from_utf8(bytes).map_err(|e| failed(format!("invalid UTF-8: {e}")))?;
        if essence == "application/json" {
            serde_json::from_str::<serde_json::Value>(text)
                .map_err(|e| failed(format!("invalid JSON: {e}")))?;
        }
        Ok(normalize_text(text))
    }
}

/// Normalise text before chunking.
///
/// Strips a leading byte-order mark, converts `\r\n` and lone `\r` to `\n`,
/// and drops control characters other than newline and tab. Chunk offsets
/// refer to the normalised text.
pub fn normalize_text(text: &str) -> String {
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\r' => {
                if chars.peek() == Some(&'\n') {
                    chars.next();
                }
                out.push('\n');
            }
            '\n' | '\t' => out.push(c),
            c if c.is_control() => {}
            c => out.push(c),
        }
    }
    out
}
