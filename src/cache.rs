//! Content-addressed embedding cache with single-flight computation.
//!
//! The cache maps `(content hash, model id)` to a vector. Identical
//! content never re-invokes the embedding provider for the same model:
//! entries are looked up in an in-memory map built at open time, and
//! misses are computed at most once even under concurrent callers — late
//! arrivals for an in-flight key await the leader's outcome through a
//! `watch` channel instead of issuing duplicate provider calls.
//!
//! Persistence is an append-only JSONL log. Entries are immutable and
//! never evicted; a model change simply produces new keys. A torn
//! trailing line (crash mid-append) is skipped at load time.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::{watch, Mutex};
use tracing::{debug, warn};

use crate::cancel::CancellationToken;
use crate::embedding::{decode_vector, encode_vector};
use crate::error::{IndexError, Result};

/// Cache key: content hash plus model id. Uniquely determines a vector.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub content_hash: String,
    pub model: String,
}

impl CacheKey {
    pub fn new(content_hash: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            content_hash: content_hash.into(),
            model: model.into(),
        }
    }
}

/// One line of the append-only cache log.
#[derive(Serialize, Deserialize)]
struct CacheLine {
    hash: String,
    model: String,
    dims: usize,
    vector: String,
}

/// `None` while the leader is still computing; `Some` once it published.
/// Errors travel as strings so waiters can clone them.
type FlightOutcome = Option<std::result::Result<Vec<f32>, String>>;

struct CacheInner {
    entries: HashMap<CacheKey, Vec<f32>>,
    in_flight: HashMap<CacheKey, watch::Receiver<FlightOutcome>>,
}

/// Handle to one index's embedding cache file.
///
/// Opened at index creation and owned by the index; there is no global
/// cache registry.
pub struct EmbeddingCache {
    path: PathBuf,
    inner: Mutex<CacheInner>,
}

impl EmbeddingCache {
    /// Open (or create) the cache log at `path` and build the in-memory
    /// index over it.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let entries = match tokio::fs::read_to_string(&path).await {
            Ok(content) => parse_log(&content, &path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };
        debug!(path = %path.display(), entries = entries.len(), "opened embedding cache");
        Ok(Self {
            path,
            inner: Mutex::new(CacheInner {
                entries,
                in_flight: HashMap::new(),
            }),
        })
    }

    /// Look up `key`, computing and persisting the vector on a miss.
    ///
    /// Single-flight: concurrent callers for the same key share one
    /// `compute` invocation. A failed computation is surfaced to every
    /// waiter and is not cached, so the next call retries.
    pub async fn get_or_compute<F, Fut>(
        &self,
        key: &CacheKey,
        cancel: &CancellationToken,
        compute: F,
    ) -> Result<Vec<f32>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<Vec<f32>>>,
    {
        let publisher = {
            let mut inner = self.inner.lock().await;
            if let Some(vector) = inner.entries.get(key) {
                return Ok(vector.clone());
            }
            if let Some(rx) = inner.in_flight.get(key) {
                let mut rx = rx.clone();
                drop(inner);
                return await_leader(&mut rx).await;
            }
            let (tx, rx) = watch::channel(None);
            inner.in_flight.insert(key.clone(), rx);
            tx
        };

        // This caller is the leader for the key.
        let outcome = match cancel.check() {
            Ok(()) => compute().await,
            Err(e) => Err(e),
        };

        let mut inner = self.inner.lock().await;
        inner.in_flight.remove(key);

        match outcome {
            Ok(vector) => {
                inner.entries.insert(key.clone(), vector.clone());
                // Appends are serialized by the inner lock held here.
                if let Err(e) = self.append(key, &vector).await {
                    warn!(error = %e, "failed to append embedding cache entry");
                }
                let _ = publisher.send(Some(Ok(vector.clone())));
                Ok(vector)
            }
            Err(e) => {
                let _ = publisher.send(Some(Err(e.to_string())));
                Err(e)
            }
        }
    }

    /// Cached vector for `key`, if present.
    pub async fn get(&self, key: &CacheKey) -> Option<Vec<f32>> {
        self.inner.lock().await.entries.get(key).cloned()
    }

    /// Number of cached entries.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn append(&self, key: &CacheKey, vector: &[f32]) -> Result<()> {
        let line = serde_json::to_string(&CacheLine {
            hash: key.content_hash.clone(),
            model: key.model.clone(),
            dims: vector.len(),
            vector: encode_vector(vector),
        })?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        Ok(())
    }
}

/// Wait for the in-flight leader to publish its outcome.
async fn await_leader(rx: &mut watch::Receiver<FlightOutcome>) -> Result<Vec<f32>> {
    loop {
        if let Some(outcome) = rx.borrow_and_update().clone() {
            return outcome.map_err(IndexError::Provider);
        }
        if rx.changed().await.is_err() {
            // Leader dropped without publishing (e.g. its task panicked).
            if let Some(outcome) = rx.borrow().clone() {
                return outcome.map_err(IndexError::Provider);
            }
            return Err(IndexError::Provider(
                "embedding computation was abandoned".into(),
            ));
        }
    }
}

fn parse_log(content: &str, path: &Path) -> HashMap<CacheKey, Vec<f32>> {
    let mut entries = HashMap::new();
    for line in content.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let parsed: CacheLine = match serde_json::from_str(line) {
            Ok(l) => l,
            Err(_) => {
                // Crash mid-append leaves a torn final line.
                warn!(path = %path.display(), "skipping unparseable cache log line");
                continue;
            }
        };
        match decode_vector(&parsed.vector) {
            Ok(vector) if vector.len() == parsed.dims => {
                entries.insert(CacheKey::new(parsed.hash, parsed.model), vector);
            }
            _ => {
                warn!(path = %path.display(), "skipping cache entry with invalid vector");
            }
        }
    }
    entries
}
