//! Embedding provider abstraction and implementations.
//!
//! Defines the [`EmbeddingProvider`] trait the index factory is handed,
//! plus concrete implementations:
//! - **[`OpenAiProvider`]** — calls the OpenAI embeddings API with retry and backoff.
//! - **[`OllamaProvider`]** — calls a local Ollama instance's `/api/embed` endpoint.
//! - **[`MockEmbeddingProvider`]** — deterministic bag-of-words vectors for
//!   tests and offline runs.
//!
//! Also provides pure vector utilities:
//! - [`cosine_similarity`] — similarity between two embedding vectors
//! - [`vec_to_blob`] / [`blob_to_vec`] — little-endian f32 byte encoding
//! - [`encode_vector`] / [`decode_vector`] — base64 wrapping of the blob
//!   form, used by the persisted record and cache files
//!
//! # Retry strategy
//!
//! The HTTP providers use exponential backoff for transient errors:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

use crate::config::EmbeddingModelConfig;
use crate::error::{IndexError, Result};

/// External capability that maps text to a numeric vector.
///
/// Supplied by the caller to the index factory; its absence is a
/// configuration error, not a silent no-op. Implementations may fail or
/// be unavailable — failures surface as [`IndexError::Provider`] and are
/// retryable by the caller.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Model identifier (e.g. `"text-embedding-3-small"`). Part of every
    /// cache key.
    fn model_name(&self) -> &str;

    /// Vector dimensionality this provider produces.
    fn dims(&self) -> usize;

    /// Maximum input tokens the model accepts. Query text beyond this is
    /// truncated before embedding.
    fn max_input_tokens(&self) -> usize {
        512
    }

    /// Embed a single text span.
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

// ============ OpenAI ============

/// Embedding provider using the OpenAI embeddings API.
///
/// Calls `POST {base}/v1/embeddings` with the configured model. Requires
/// the `OPENAI_API_KEY` environment variable.
pub struct OpenAiProvider {
    config: EmbeddingModelConfig,
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl OpenAiProvider {
    pub fn new(config: EmbeddingModelConfig) -> Result<Self> {
        config.validate()?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| IndexError::Config("OPENAI_API_KEY environment variable not set".into()))?;
        let base_url = config
            .url
            .clone()
            .unwrap_or_else(|| "https://api.openai.com".to_string());
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| IndexError::Config(format!("failed to build http client: {e}")))?;
        Ok(Self {
            config,
            client,
            api_key,
            base_url,
        })
    }

    async fn request(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        let body = serde_json::json!({
            "model": self.config.model,
            "input": [text],
        });

        let mut last_err = None;

        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let resp = self
                .client
                .post(format!("{}/v1/embeddings", self.base_url))
                .header("Authorization", format!("Bearer {}", self.api_key))
                .header("Content-Type", "application/json")
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let json: serde_json::Value = response.json().await?;
                        return parse_openai_response(&json);
                    }

                    if status.as_u16() == 429 || status.is_server_error() {
                        let body_text = response.text().await.unwrap_or_default();
                        last_err = Some(anyhow::anyhow!("OpenAI API error {}: {}", status, body_text));
                        continue;
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    bail!("OpenAI API error {}: {}", status, body_text);
                }
                Err(e) => {
                    last_err = Some(e.into());
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("embedding failed after retries")))
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiProvider {
    fn model_name(&self) -> &str {
        &self.config.model
    }

    fn dims(&self) -> usize {
        self.config.dims
    }

    fn max_input_tokens(&self) -> usize {
        self.config.max_input_tokens
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.request(text)
            .await
            .map_err(|e| IndexError::Provider(e.to_string()))
    }
}

fn parse_openai_response(json: &serde_json::Value) -> anyhow::Result<Vec<f32>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| anyhow::anyhow!("invalid OpenAI response: missing data array"))?;

    let embedding = data
        .first()
        .and_then(|item| item.get("embedding"))
        .and_then(|e| e.as_array())
        .ok_or_else(|| anyhow::anyhow!("invalid OpenAI response: missing embedding"))?;

    Ok(embedding
        .iter()
        .map(|v| v.as_f64().unwrap_or(0.0) as f32)
        .collect())
}

// ============ Ollama ============

/// Embedding provider using a local Ollama instance.
///
/// Calls `POST {url}/api/embed` (default `http://localhost:11434`).
/// Requires an embedding model pulled (e.g. `ollama pull nomic-embed-text`).
pub struct OllamaProvider {
    config: EmbeddingModelConfig,
    client: reqwest::Client,
    base_url: String,
}

impl OllamaProvider {
    pub fn new(config: EmbeddingModelConfig) -> Result<Self> {
        config.validate()?;
        let base_url = config
            .url
            .clone()
            .unwrap_or_else(|| "http://localhost:11434".to_string());
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| IndexError::Config(format!("failed to build http client: {e}")))?;
        Ok(Self {
            config,
            client,
            base_url,
        })
    }

    async fn request(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        let body = serde_json::json!({
            "model": self.config.model,
            "input": [text],
        });

        let mut last_err = None;

        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let resp = self
                .client
                .post(format!("{}/api/embed", self.base_url))
                .header("Content-Type", "application/json")
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let json: serde_json::Value = response.json().await?;
                        return parse_ollama_response(&json);
                    }

                    if status.as_u16() == 429 || status.is_server_error() {
                        let body_text = response.text().await.unwrap_or_default();
                        last_err = Some(anyhow::anyhow!("Ollama API error {}: {}", status, body_text));
                        continue;
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    bail!("Ollama API error {}: {}", status, body_text);
                }
                Err(e) => {
                    last_err = Some(anyhow::anyhow!(
                        "Ollama connection error (is Ollama running at {}?): {}",
                        self.base_url,
                        e
                    ));
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("Ollama embedding failed after retries")))
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaProvider {
    fn model_name(&self) -> &str {
        &self.config.model
    }

    fn dims(&self) -> usize {
        self.config.dims
    }

    fn max_input_tokens(&self) -> usize {
        self.config.max_input_tokens
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.request(text)
            .await
            .map_err(|e| IndexError::Provider(e.to_string()))
    }
}

fn parse_ollama_response(json: &serde_json::Value) -> anyhow::Result<Vec<f32>> {
    let embeddings = json
        .get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| anyhow::anyhow!("invalid Ollama response: missing embeddings array"))?;

    let embedding = embeddings
        .first()
        .and_then(|e| e.as_array())
        .ok_or_else(|| anyhow::anyhow!("invalid Ollama response: empty embeddings array"))?;

    Ok(embedding
        .iter()
        .map(|v| v.as_f64().unwrap_or(0.0) as f32)
        .collect())
}

// ============ Mock ============

/// Deterministic offline embedding provider.
///
/// Produces an L2-normalized bag-of-words vector: each lowercased word is
/// hashed into a dimension bucket. Identical texts map to identical
/// vectors and texts sharing vocabulary score positively, which is enough
/// signal for tests and local smoke runs.
pub struct MockEmbeddingProvider {
    dims: usize,
}

impl MockEmbeddingProvider {
    pub fn new(dims: usize) -> Self {
        Self { dims }
    }

    fn vector_for(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dims];
        for word in text.split(|c: char| !c.is_alphanumeric()) {
            if word.is_empty() {
                continue;
            }
            let mut hasher = DefaultHasher::new();
            word.to_lowercase().hash(&mut hasher);
            let bucket = (hasher.finish() % self.dims as u64) as usize;
            v[bucket] += 1.0;
        }
        normalize(&mut v);
        v
    }
}

#[async_trait]
impl EmbeddingProvider for MockEmbeddingProvider {
    fn model_name(&self) -> &str {
        "mock-embed"
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.vector_for(text))
    }
}

// ============ Vector utilities ============

/// L2-normalize in place. A zero vector is left unchanged.
pub fn normalize(v: &mut [f32]) {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

/// Compute cosine similarity between two embedding vectors.
///
/// Equivalent to the dot product of the L2-normalized vectors, in
/// `[-1.0, 1.0]`. Returns `0.0` for empty vectors or vectors of
/// different lengths.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

/// Encode a float vector as little-endian f32 bytes.
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode little-endian f32 bytes back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Encode a vector for storage in a JSON record line.
pub fn encode_vector(vec: &[f32]) -> String {
    BASE64.encode(vec_to_blob(vec))
}

/// Decode a stored vector field.
pub fn decode_vector(encoded: &str) -> Result<Vec<f32>> {
    let blob = BASE64
        .decode(encoded)
        .map_err(|e| IndexError::Corrupt(format!("invalid vector encoding: {e}")))?;
    if blob.len() % 4 != 0 {
        return Err(IndexError::Corrupt(format!(
            "vector blob length {} is not a multiple of 4",
            blob.len()
        )));
    }
    Ok(blob_to_vec(&blob))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vec_blob_roundtrip() {
        let vec = vec![1.0f32, -2.5, 3.125, 0.0, -0.001];
        let blob = vec_to_blob(&vec);
        let restored = blob_to_vec(&blob);
        assert_eq!(vec, restored);
    }

    #[test]
    fn test_encoded_vector_roundtrip() {
        let vec = vec![0.25f32, -1.5, 42.0];
        let encoded = encode_vector(&vec);
        assert_eq!(decode_vector(&encoded).unwrap(), vec);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode_vector("not base64!!!").is_err());
        // Valid base64, wrong blob length.
        let encoded = BASE64.encode([1u8, 2, 3]);
        assert!(decode_vector(&encoded).is_err());
    }

    #[test]
    fn test_cosine_identical() {
        let v = vec![1.0, 2.0, 3.0];
        let sim = cosine_similarity(&v, &v);
        assert!((sim - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_orthogonal() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![0.0, 1.0, 0.0];
        assert!(cosine_similarity(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_opposite() {
        let a = vec![1.0, 0.0];
        let b = vec![-1.0, 0.0];
        assert!((cosine_similarity(&a, &b) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_empty_and_mismatched() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
    }

    #[test]
    fn test_normalize_unit_length() {
        let mut v = vec![3.0, 4.0];
        normalize(&mut v);
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_mock_provider_deterministic() {
        let provider = MockEmbeddingProvider::new(64);
        let a = provider.embed("hello world").await.unwrap();
        let b = provider.embed("hello world").await.unwrap();
        let c = provider.embed("goodbye moon").await.unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }

    #[tokio::test]
    async fn test_mock_provider_related_text_scores_higher() {
        let provider = MockEmbeddingProvider::new(128);
        let doc = provider.embed("markdown syntax basics for writers").await.unwrap();
        let related = provider.embed("what is markdown syntax").await.unwrap();
        let unrelated = provider.embed("orbital mechanics of jupiter").await.unwrap();
        assert!(cosine_similarity(&doc, &related) > cosine_similarity(&doc, &unrelated));
    }

    #[tokio::test]
    async fn test_ollama_provider_parses_response() {
        let server = httpmock::MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(httpmock::Method::POST).path("/api/embed");
                then.status(200)
                    .json_body(serde_json::json!({ "embeddings": [[0.1, 0.2, 0.3]] }));
            })
            .await;

        let mut config = EmbeddingModelConfig::for_model("nomic-embed-text", 3);
        config.url = Some(server.base_url());
        config.max_retries = 0;

        let provider = OllamaProvider::new(config).unwrap();
        let vec = provider.embed("hello").await.unwrap();
        assert_eq!(vec.len(), 3);
        assert!((vec[1] - 0.2).abs() < 1e-6);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_ollama_provider_client_error_fails_fast() {
        let server = httpmock::MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(httpmock::Method::POST).path("/api/embed");
                then.status(404).body("model not found");
            })
            .await;

        let mut config = EmbeddingModelConfig::for_model("missing-model", 3);
        config.url = Some(server.base_url());
        config.max_retries = 3;

        let provider = OllamaProvider::new(config).unwrap();
        let err = provider.embed("hello").await.unwrap_err();
        assert!(matches!(err, IndexError::Provider(_)));
    }
}
