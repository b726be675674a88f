//! Configuration types and validation.
//!
//! Mirrors the split in the data model: chunking parameters travel with
//! the index manifest, embedding model parameters travel with the
//! provider. All validation happens up front — an invalid configuration
//! fails the creating call, never a later operation.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{IndexError, Result};

/// Index name used when the caller passes an empty or fully-invalid name.
pub const DEFAULT_INDEX_NAME: &str = "default";

/// Token-window chunking parameters, persisted in the index manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkingConfig {
    /// Maximum tokens per chunk.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Tokens shared between consecutive chunks. Must be < `chunk_size`.
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
        }
    }
}

fn default_chunk_size() -> usize {
    512
}
fn default_chunk_overlap() -> usize {
    128
}

impl ChunkingConfig {
    /// Reject degenerate window parameters.
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(IndexError::Config("chunk_size must be > 0".into()));
        }
        if self.chunk_overlap >= self.chunk_size {
            return Err(IndexError::Config(format!(
                "chunk_overlap ({}) must be strictly less than chunk_size ({})",
                self.chunk_overlap, self.chunk_size
            )));
        }
        Ok(())
    }

    /// Tokens advanced per window.
    pub fn step(&self) -> usize {
        self.chunk_size - self.chunk_overlap
    }
}

/// Embedding model connection parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct EmbeddingModelConfig {
    /// Model identifier (e.g. `"text-embedding-3-small"`). Part of the
    /// cache key: changing it supersedes all cached vectors.
    pub model: String,
    /// Vector dimensionality the model produces.
    pub dims: usize,
    /// Base URL override (Ollama host or OpenAI-compatible endpoint).
    #[serde(default)]
    pub url: Option<String>,
    /// Maximum input tokens the model accepts; longer query text is
    /// truncated before embedding.
    #[serde(default = "default_max_input_tokens")]
    pub max_input_tokens: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_max_input_tokens() -> usize {
    512
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

impl EmbeddingModelConfig {
    /// Config with defaults for everything but model id and dims.
    pub fn for_model(model: impl Into<String>, dims: usize) -> Self {
        Self {
            model: model.into(),
            dims,
            url: None,
            max_input_tokens: default_max_input_tokens(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.model.trim().is_empty() {
            return Err(IndexError::Config("embedding model id must not be empty".into()));
        }
        if self.dims == 0 {
            return Err(IndexError::Config("embedding dims must be > 0".into()));
        }
        if self.max_input_tokens == 0 {
            return Err(IndexError::Config("max_input_tokens must be > 0".into()));
        }
        Ok(())
    }
}

/// Options accepted by the index factory.
#[derive(Debug, Clone)]
pub struct IndexOptions {
    /// Manifest schema version. A stored manifest with a different
    /// version forces a full rebuild.
    pub version: u32,
    /// Discard any prior state for this index name before creating.
    pub delete_if_exists: bool,
    pub chunking: ChunkingConfig,
    /// Dimensionality every vector in the index must have.
    pub vector_size: usize,
    /// Cap on simultaneous in-flight embedding provider calls.
    pub max_concurrent_embeddings: usize,
}

impl Default for IndexOptions {
    fn default() -> Self {
        Self {
            version: 1,
            delete_if_exists: false,
            chunking: ChunkingConfig::default(),
            vector_size: 1536,
            max_concurrent_embeddings: 4,
        }
    }
}

impl IndexOptions {
    pub fn validate(&self) -> Result<()> {
        self.chunking.validate()?;
        if self.vector_size == 0 {
            return Err(IndexError::Config("vector_size must be > 0".into()));
        }
        if self.max_concurrent_embeddings == 0 {
            return Err(IndexError::Config(
                "max_concurrent_embeddings must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// Reduce an index name to an identifier-safe string.
///
/// Keeps ASCII alphanumerics (lowercased); everything else is dropped.
/// An empty result falls back to [`DEFAULT_INDEX_NAME`].
pub fn sanitize_index_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect();
    if cleaned.is_empty() {
        DEFAULT_INDEX_NAME.to_string()
    } else {
        cleaned
    }
}

/// Load an [`EmbeddingModelConfig`] from a TOML file and validate it.
pub fn load_model_config(path: &Path) -> Result<EmbeddingModelConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))
        .map_err(|e| IndexError::Config(e.to_string()))?;

    let config: EmbeddingModelConfig = toml::from_str(&content)
        .map_err(|e| IndexError::Config(format!("failed to parse config file: {e}")))?;

    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_index_name() {
        assert_eq!(sanitize_index_name("My Docs!"), "mydocs");
        assert_eq!(sanitize_index_name("docs"), "docs");
        assert_eq!(sanitize_index_name("../../etc"), "etc");
        assert_eq!(sanitize_index_name(""), "default");
        assert_eq!(sanitize_index_name("___"), "default");
    }

    #[test]
    fn test_chunking_overlap_must_be_smaller() {
        let bad = ChunkingConfig {
            chunk_size: 128,
            chunk_overlap: 128,
        };
        assert!(matches!(bad.validate(), Err(IndexError::Config(_))));

        let good = ChunkingConfig {
            chunk_size: 128,
            chunk_overlap: 32,
        };
        assert!(good.validate().is_ok());
        assert_eq!(good.step(), 96);
    }

    #[test]
    fn test_zero_chunk_size_rejected() {
        let bad = ChunkingConfig {
            chunk_size: 0,
            chunk_overlap: 0,
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_model_config_validation() {
        assert!(EmbeddingModelConfig::for_model("", 8).validate().is_err());
        assert!(EmbeddingModelConfig::for_model("m", 0).validate().is_err());
        assert!(EmbeddingModelConfig::for_model("m", 8).validate().is_ok());
    }

    #[test]
    fn test_load_model_config_from_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.toml");
        std::fs::write(
            &path,
            r#"
model = "text-embedding-3-small"
dims = 1536
timeout_secs = 10
"#,
        )
        .unwrap();

        let config = load_model_config(&path).unwrap();
        assert_eq!(config.model, "text-embedding-3-small");
        assert_eq!(config.dims, 1536);
        assert_eq!(config.timeout_secs, 10);
        assert_eq!(config.max_retries, 5);
    }

    #[test]
    fn test_load_model_config_rejects_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.toml");
        std::fs::write(&path, "model = \"m\"\ndims = 0\n").unwrap();
        assert!(load_model_config(&path).is_err());
    }
}
