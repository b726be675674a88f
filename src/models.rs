//! Core data models for the indexing and retrieval pipeline.

use serde::{Deserialize, Serialize};

/// A token-bounded contiguous span of a document's text.
///
/// Identity is `(uri, chunk_index)`; the token offsets locate the span
/// within the parent document's token stream. The `hash` is the SHA-256
/// of the chunk text and keys the embedding cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    /// Parent document identifier.
    pub uri: String,
    /// Position within the document's chunk sequence, starting at 0.
    pub chunk_index: usize,
    /// First token offset (inclusive).
    pub start_token: usize,
    /// Last token offset (exclusive).
    pub end_token: usize,
    /// Exact slice of source text spanning the token range.
    pub text: String,
    /// SHA-256 hex digest of `text`.
    pub hash: String,
}

impl Chunk {
    /// Token length of the chunk.
    pub fn token_len(&self) -> usize {
        self.end_token - self.start_token
    }
}

/// A scored chunk match produced by a query.
#[derive(Debug, Clone, Serialize)]
pub struct QueryResult {
    /// Originating document uri.
    pub uri: String,
    /// Index of the matching chunk within its document.
    pub chunk_index: usize,
    /// Cosine similarity against the query vector, in `[-1, 1]`.
    pub score: f32,
    /// Chunk text, for snippet display.
    pub text: String,
}

/// A budget-bounded, order-preserving merge of one document's chunks.
#[derive(Debug, Clone, PartialEq)]
pub struct Section {
    /// Merged chunk texts, in original document order.
    pub text: String,
    /// Index of the first chunk in this section (inclusive).
    pub first_chunk: usize,
    /// Index of the last chunk in this section (inclusive).
    pub last_chunk: usize,
}

/// A file handed to the workspace index for ingestion.
///
/// `content` may be supplied inline or populated by a
/// [`ContentResolver`](crate::workspace::ContentResolver). Files whose
/// content stays unresolved, or that carry a non-text `encoding`, are
/// skipped rather than indexed.
#[derive(Debug, Clone, Default)]
pub struct WorkspaceFile {
    pub uri: String,
    pub content: Option<String>,
    /// Set for binary payloads (e.g. `"base64"`); text files leave it `None`.
    pub encoding: Option<String>,
}

impl WorkspaceFile {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            content: None,
            encoding: None,
        }
    }

    pub fn with_content(uri: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            content: Some(content.into()),
            encoding: None,
        }
    }
}

/// A ranked file returned from [`search`](crate::workspace::WorkspaceFileIndex::search),
/// with section-rendered content.
#[derive(Debug, Clone, Serialize)]
pub struct FileSearchResult {
    pub uri: String,
    /// Budget-bounded concatenation of the document's highest-scoring sections.
    pub content: String,
    /// Best chunk similarity for this document.
    pub score: f32,
}

/// Counters reported by an `insert_or_update` batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InsertOutcome {
    /// Documents chunked, embedded, and committed.
    pub indexed: usize,
    /// Documents whose content hash was unchanged (no work done).
    pub unchanged: usize,
    /// Documents skipped: unresolved content, binary encoding, or a
    /// per-document provider failure.
    pub skipped: usize,
}
