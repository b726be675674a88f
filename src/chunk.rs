//! Token-window text chunker.
//!
//! Splits a document's token stream into overlapping windows of at most
//! `chunk_size` tokens, advancing by `chunk_size - chunk_overlap` tokens
//! per step. The final window holds any remainder of at least one token.
//! Each chunk's text is the exact source slice spanning its token range:
//! BPE tokens can hold partial UTF-8 sequences, so window boundaries are
//! mapped to byte offsets and widened to the enclosing character
//! boundaries rather than decoded directly.
//!
//! Chunking is pure and deterministic: the same document and config
//! always produce the same chunk sequence, which is what lets the
//! content-hash cache key short-circuit re-embedding.

use sha2::{Digest, Sha256};

use crate::config::ChunkingConfig;
use crate::error::Result;
use crate::models::Chunk;
use crate::tokenizer::Tokenizer;

/// SHA-256 hex digest of a text span.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Split `text` into overlapping token windows.
///
/// Returns chunks in source order with contiguous indices starting at 0.
/// An empty token stream yields no chunks. Fails with a configuration
/// error when `chunk_overlap >= chunk_size`.
pub fn chunk_document(
    uri: &str,
    text: &str,
    config: &ChunkingConfig,
    tokenizer: &dyn Tokenizer,
) -> Result<Vec<Chunk>> {
    config.validate()?;

    let tokens = tokenizer.encode(text);
    if tokens.is_empty() {
        return Ok(Vec::new());
    }

    // Byte offset of every token boundary within the source text.
    let mut offsets = Vec::with_capacity(tokens.len() + 1);
    let mut pos = 0usize;
    offsets.push(pos);
    for i in 0..tokens.len() {
        pos += tokenizer.decode_bytes(&tokens[i..i + 1])?.len();
        offsets.push(pos);
    }

    let step = config.step();
    let mut chunks = Vec::new();
    let mut start = 0usize;

    loop {
        let end = (start + config.chunk_size).min(tokens.len());
        let chunk_text = slice_at_boundaries(text, offsets[start], offsets[end]);
        chunks.push(Chunk {
            uri: uri.to_string(),
            chunk_index: chunks.len(),
            start_token: start,
            end_token: end,
            hash: content_hash(chunk_text),
            text: chunk_text.to_string(),
        });

        if end == tokens.len() {
            break;
        }
        start += step;
    }

    Ok(chunks)
}

/// Slice `text` by byte range, widening both ends outward to the nearest
/// character boundary. Token boundaries can fall inside a multi-byte
/// character.
fn slice_at_boundaries(text: &str, start: usize, end: usize) -> &str {
    let mut start = start.min(text.len());
    let mut end = end.min(text.len());
    while !text.is_char_boundary(start) {
        start -= 1;
    }
    while !text.is_char_boundary(end) {
        end += 1;
    }
    &text[start..end]
}
