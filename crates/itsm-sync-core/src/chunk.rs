//! Paragraph-boundary record chunker.
//!
//! [`ParagraphChunker`] turns a [`Record`] into [`TextChunk`]s:
//!
//! 1. One `summary` chunk: title plus status/group header.
//! 2. The description split on paragraph boundaries (`description`, or
//!    `article_content` for knowledge articles).
//! 3. The resolution, split the same way, when present.
//! 4. One `work_log` chunk per non-empty work log, hard-split if oversized.
//!
//! Chunk ids are UUID v5 values over `category:source_id:sequence`, so
//! re-chunking the same record yields the same ids. Each chunk carries a
//! SHA-256 hash of its content.
//!
//! # Example
//!
//! ```rust
//! use itsm_sync_core::chunk::split_text;
//!
//! let parts = split_text("Hello world.\n\nSecond paragraph.", 250);
//! assert_eq!(parts.len(), 1);
//! ```

use std::collections::BTreeMap;

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::models::{Category, ChunkType, Record, TextChunk};
use crate::source::Chunker;

/// Approximate characters-per-token ratio.
const CHARS_PER_TOKEN: usize = 4;

/// Chunker that respects a `max_tokens` budget per chunk.
#[derive(Debug, Clone)]
pub struct ParagraphChunker {
    max_tokens: usize,
}

impl ParagraphChunker {
    pub fn new(max_tokens: usize) -> Self {
        Self {
            max_tokens: max_tokens.max(1),
        }
    }
}

impl Chunker for ParagraphChunker {
    fn chunk(&self, record: &Record) -> Vec<TextChunk> {
        let metadata = record_metadata(record);
        let mut chunks = Vec::new();
        let mut seq: i64 = 0;
        let mut push = |chunk_type: ChunkType, text: &str, chunks: &mut Vec<TextChunk>| {
            chunks.push(make_chunk(record, chunk_type, seq, text, &metadata));
            seq += 1;
        };

        push(ChunkType::Summary, &summary_text(record), &mut chunks);

        let body_type = if record.category == Category::KnowledgeArticle {
            ChunkType::ArticleContent
        } else {
            ChunkType::Description
        };
        for part in split_text(&record.description, self.max_tokens) {
            push(body_type, &part, &mut chunks);
        }

        if let Some(resolution) = record.resolution.as_deref() {
            for part in split_text(resolution, self.max_tokens) {
                push(ChunkType::Resolution, &part, &mut chunks);
            }
        }

        for log in &record.work_logs {
            if log.text.trim().is_empty() {
                continue;
            }
            let mut text = String::new();
            if let Some(kind) = &log.kind {
                text.push_str(&format!("[{}] ", kind));
            }
            if let Some(submitter) = &log.submitter {
                text.push_str(&format!("{}: ", submitter));
            }
            text.push_str(log.text.trim());
            for part in split_text(&text, self.max_tokens) {
                push(ChunkType::WorkLog, &part, &mut chunks);
            }
        }

        chunks
    }
}

fn summary_text(record: &Record) -> String {
    let mut text = format!("{} {}: {}", record.category, record.source_id, record.title.trim());
    if let Some(status) = &record.status {
        text.push_str(&format!("\nStatus: {}", status));
    }
    if let Some(group) = &record.assigned_group {
        text.push_str(&format!("\nAssigned group: {}", group));
    }
    text
}

fn record_metadata(record: &Record) -> BTreeMap<String, String> {
    let mut metadata = BTreeMap::new();
    metadata.insert("source_type".to_string(), record.category.to_string());
    metadata.insert("source_id".to_string(), record.source_id.clone());
    if !record.title.is_empty() {
        metadata.insert("title".to_string(), record.title.clone());
    }
    if let Some(status) = &record.status {
        metadata.insert("status".to_string(), status.clone());
    }
    if let Some(group) = &record.assigned_group {
        metadata.insert("assigned_group".to_string(), group.clone());
    }
    if let Some(entry_id) = &record.entry_id {
        metadata.insert("entry_id".to_string(), entry_id.clone());
    }
    metadata
}

/// Split text into pieces on paragraph boundaries, respecting `max_tokens`.
///
/// Paragraphs (`\n\n`) are accumulated until the next one would exceed the
/// budget; oversized paragraphs are hard-split at the last newline or space
/// before the limit. Empty or whitespace-only text yields no pieces.
pub fn split_text(text: &str, max_tokens: usize) -> Vec<String> {
    let max_chars = max_tokens.max(1) * CHARS_PER_TOKEN;
    let mut pieces = Vec::new();
    let mut current_buf = String::new();

    for para in text.split("\n\n") {
        let trimmed = para.trim();
        if trimmed.is_empty() {
            continue;
        }

        let would_be = if current_buf.is_empty() {
            trimmed.len()
        } else {
            current_buf.len() + 2 + trimmed.len()
        };

        if would_be > max_chars && !current_buf.is_empty() {
            pieces.push(std::mem::take(&mut current_buf));
        }

        if trimmed.len() > max_chars {
            let mut remaining = trimmed;
            while !remaining.is_empty() {
                let split_at = hard_split_point(remaining, max_chars);
                let piece = remaining[..split_at].trim();
                if !piece.is_empty() {
                    pieces.push(piece.to_string());
                }
                remaining = &remaining[split_at..];
            }
        } else {
            if !current_buf.is_empty() {
                current_buf.push_str("\n\n");
            }
            current_buf.push_str(trimmed);
        }
    }

    if !current_buf.is_empty() {
        pieces.push(current_buf);
    }

    pieces
}

/// Byte index to cut `s` at: the last newline/space before `max_chars`,
/// else `max_chars` itself, always on a char boundary and never zero.
fn hard_split_point(s: &str, max_chars: usize) -> usize {
    if s.len() <= max_chars {
        return s.len();
    }
    let limit = snap_to_char_boundary(s, max_chars);
    let cut = s[..limit]
        .rfind('\n')
        .or_else(|| s[..limit].rfind(' '))
        .map(|pos| pos + 1)
        .unwrap_or(limit);
    if cut == 0 {
        s.char_indices().nth(1).map(|(i, _)| i).unwrap_or(s.len())
    } else {
        cut
    }
}

/// Snap a byte index back to the nearest valid UTF-8 char boundary.
fn snap_to_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut i = index;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

/// Deterministic chunk id for a record position.
pub fn chunk_id(category: Category, source_id: &str, sequence: i64) -> String {
    let key = format!("{}:{}:{}", category, source_id, sequence);
    Uuid::new_v5(&Uuid::NAMESPACE_OID, key.as_bytes()).to_string()
}

fn make_chunk(
    record: &Record,
    chunk_type: ChunkType,
    sequence: i64,
    text: &str,
    metadata: &BTreeMap<String, String>,
) -> TextChunk {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let hash = format!("{:x}", hasher.finalize());

    TextChunk {
        chunk_id: chunk_id(record.category, &record.source_id, sequence),
        category: record.category,
        source_id: record.source_id.clone(),
        chunk_type,
        sequence,
        content: text.to_string(),
        hash,
        metadata: metadata.clone(),
    }
}
