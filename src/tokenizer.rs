//! Tokenization behind a trait seam.
//!
//! The chunker operates on token streams, not bytes, so the tokenizer is
//! a pure, stateless capability resolved per model family. Production
//! code uses the tiktoken BPE rankings; tests substitute deterministic
//! toy tokenizers through the same trait.

use std::sync::Arc;

use tiktoken_rs::CoreBPE;

use crate::error::{IndexError, Result};

/// Converts text to and from a token stream for one model family.
///
/// `decode_bytes(encode(text)) == text.as_bytes()`, and decoding any
/// contiguous sub-range of a full encoding reproduces the exact source
/// bytes (BPE tokens partition the byte stream). Individual tokens may
/// hold partial UTF-8 sequences, so only [`decode_bytes`](Self::decode_bytes)
/// is total; [`decode`](Self::decode) additionally requires the range to
/// align with character boundaries.
pub trait Tokenizer: Send + Sync {
    fn encode(&self, text: &str) -> Vec<u32>;

    /// Raw bytes of a contiguous token range.
    fn decode_bytes(&self, tokens: &[u32]) -> Result<Vec<u8>>;

    /// Text of a contiguous token range. Fails when the range splits a
    /// multi-byte character.
    fn decode(&self, tokens: &[u32]) -> Result<String> {
        String::from_utf8(self.decode_bytes(tokens)?).map_err(|e| {
            IndexError::Config(format!(
                "token range does not align with character boundaries: {e}"
            ))
        })
    }

    /// Token count of `text`.
    fn count(&self, text: &str) -> usize {
        self.encode(text).len()
    }
}

/// Tokenizer backed by the tiktoken BPE rankings.
pub struct TiktokenTokenizer {
    bpe: CoreBPE,
}

impl TiktokenTokenizer {
    /// Pick the encoding for a model identifier.
    ///
    /// `gpt-4o`/`o200k`-era models use the o200k ranking; everything else
    /// (including unrecognized ids) falls back to cl100k, the encoding
    /// shared by the text-embedding model family.
    pub fn for_model(model: &str) -> Result<Self> {
        let lower = model.to_ascii_lowercase();
        let bpe = if lower.contains("gpt-4o") || lower.contains("o200k") {
            tiktoken_rs::o200k_base()
        } else {
            tiktoken_rs::cl100k_base()
        }
        .map_err(|e| IndexError::Config(format!("failed to load tokenizer for '{model}': {e}")))?;
        Ok(Self { bpe })
    }
}

impl Tokenizer for TiktokenTokenizer {
    fn encode(&self, text: &str) -> Vec<u32> {
        self.bpe.encode_with_special_tokens(text)
    }

    fn decode_bytes(&self, tokens: &[u32]) -> Result<Vec<u8>> {
        Ok(self
            .bpe
            ._decode_native_and_split(tokens.to_vec())
            .flatten()
            .collect())
    }
}

/// Resolve the tokenizer for a model identifier.
pub fn resolve_tokenizer(model: &str) -> Result<Arc<dyn Tokenizer>> {
    Ok(Arc::new(TiktokenTokenizer::for_model(model)?))
}
