//! On-disk snapshots for the in-memory vector store.
//!
//! One JSON-lines file per collection. The first line is a [`SnapshotHeader`];
//! every following line is one [`SnapshotRecord`]. Loading fails closed: an
//! unknown format, a version mismatch, a malformed line or a vector that
//! disagrees with the header's dimensions yields an empty collection and a
//! warning, never a partially loaded one.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::document::Chunk;
use crate::error::Result;
use crate::vectorstore::SimilarityMetric;

/// Format tag written in every snapshot header.
pub const SNAPSHOT_FORMAT: &str = "folio-rag-snapshot";
/// Current snapshot version.
pub const SNAPSHOT_VERSION: u32 = 1;

/// First line of a snapshot file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SnapshotHeader {
    pub format: String,
    pub version: u32,
    pub dimensions: Option<usize>,
    pub metric: SimilarityMetric,
    pub saved_at: DateTime<Utc>,
}

/// One persisted chunk.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SnapshotRecord {
    pub chunk_id: String,
    pub document_id: String,
    pub text: String,
    pub start_offset: usize,
    pub end_offset: usize,
    pub sequence_index: usize,
    pub metadata: HashMap<String, String>,
    pub vector: Vec<f32>,
}

impl From<&Chunk> for SnapshotRecord {
    fn from(chunk: &Chunk) -> Self {
        Self {
            chunk_id: chunk.id.clone(),
            document_id: chunk.document_id.clone(),
            text: chunk.text.clone(),
            start_offset: chunk.start_offset,
            end_offset: chunk.end_offset,
            sequence_index: chunk.sequence_index,
            metadata: chunk.metadata.clone(),
            vector: chunk.embedding.clone(),
        }
    }
}

impl From<SnapshotRecord> for Chunk {
    fn from(record: SnapshotRecord) -> Self {
        Chunk {
            id: record.chunk_id,
            document_id: record.document_id,
            text: record.text,
            start_offset: record.start_offset,
            end_offset: record.end_offset,
            sequence_index: record.sequence_index,
            embedding: record.vector,
            metadata: record.metadata,
        }
    }
}

/// Contents recovered from a snapshot file.
#[derive(Debug, Default)]
pub struct LoadedSnapshot {
    pub dimensions: Option<usize>,
    pub chunks: Vec<Chunk>,
}

/// Read a collection snapshot. Missing or invalid files load as empty.
pub async fn load(path: &Path) -> LoadedSnapshot {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            debug!(path = %path.display(), "no snapshot found");
            return LoadedSnapshot::default();
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "unreadable snapshot, starting empty");
            return LoadedSnapshot::default();
        }
    };

    match parse(&content) {
        Ok(loaded) => {
            debug!(path = %path.display(), chunk_count = loaded.chunks.len(), "snapshot loaded");
            loaded
        }
        Err(reason) => {
            warn!(path = %path.display(), %reason, "rejected snapshot, starting empty");
            LoadedSnapshot::default()
        }
    }
}

fn parse(content: &str) -> std::result::Result<LoadedSnapshot, String> {
    let mut lines = content.lines().filter(|line| !line.trim().is_empty());
    let header_line = lines.next().ok_or("empty file")?;
    let header: SnapshotHeader =
        serde_json::from_str(header_line).map_err(|e| format!("bad header: {e}"))?;

    if header.format != SNAPSHOT_FORMAT {
        return Err(format!("unknown format '{}'", header.format));
    }
    if header.version != SNAPSHOT_VERSION {
        return Err(format!(
            "version {} does not match supported version {SNAPSHOT_VERSION}",
            header.version
        ));
    }

    let mut chunks = Vec::new();
    for (line_no, line) in lines.enumerate() {
        let record: SnapshotRecord =
            serde_json::from_str(line).map_err(|e| format!("record {}: {e}", line_no + 1))?;
        let Some(dimensions) = header.dimensions else {
            return Err("records present but header has no dimensions".into());
        };
        if record.vector.len() != dimensions {
            return Err(format!(
                "record {} has {} dimensions, header says {dimensions}",
                line_no + 1,
                record.vector.len()
            ));
        }
        chunks.push(Chunk::from(record));
    }

    Ok(LoadedSnapshot { dimensions: header.dimensions, chunks })
}

/// Write a collection snapshot atomically (temporary file, then rename).
pub async fn save(path: &Path, dimensions: Option<usize>, chunks: &[&Chunk]) -> Result<()> {
    let header = SnapshotHeader {
        format: SNAPSHOT_FORMAT.to_string(),
        version: SNAPSHOT_VERSION,
        dimensions,
        metric: SimilarityMetric::Cosine,
        saved_at: Utc::now(),
    };

    let mut out = serde_json::to_string(&header)?;
    out.push('\n');
    for chunk in chunks {
        out.push_str(&serde_json::to_string(&SnapshotRecord::from(*chunk))?);
        out.push('\n');
    }

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("jsonl.tmp");
    tokio::fs::write(&tmp, out).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}
