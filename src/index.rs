//! Durable vector index: manifest, chunk/vector records, and queries.
//!
//! One [`VectorIndex`] owns one directory:
//!
//! ```text
//! <dir>/
//!   manifest.json    # configuration + document membership, atomic tmp+rename
//!   records.jsonl    # one chunk+vector record per line, atomic tmp+rename
//!   cache.jsonl      # append-only embedding cache log
//! ```
//!
//! The manifest rename is the commit point, and records for uris absent
//! from the manifest are dropped at load time. Upserts therefore write
//! records first and the manifest last; deletes write the manifest first
//! and the records last. Either way a crash mid-update leaves the prior
//! consistent state or the fully-updated one, never a manifested document
//! without its records.
//!
//! Queries are brute-force cosine similarity over the in-memory working
//! set — O(stored chunks) per query, which is the design target for
//! local, single-workspace corpora. Ties on exactly equal scores break
//! by (document insertion sequence, chunk index); a document keeps its
//! first-insertion sequence across content updates, so ordering is
//! stable across re-upserts and repeated runs.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock, Semaphore};
use tracing::{debug, info, warn};

use crate::cache::{CacheKey, EmbeddingCache};
use crate::cancel::CancellationToken;
use crate::chunk::{chunk_document, content_hash};
use crate::config::{ChunkingConfig, IndexOptions};
use crate::embedding::{cosine_similarity, decode_vector, encode_vector, EmbeddingProvider};
use crate::error::{IndexError, Result};
use crate::models::{Chunk, QueryResult};
use crate::tokenizer::Tokenizer;

pub const MANIFEST_FILE: &str = "manifest.json";
pub const RECORDS_FILE: &str = "records.jsonl";
pub const CACHE_FILE: &str = "cache.jsonl";

/// Per-document manifest entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentEntry {
    /// SHA-256 of the document's full text; unchanged hash short-circuits
    /// re-upserts.
    pub hash: String,
    /// First-insertion sequence number, used for ranking tie-breaks.
    pub seq: u64,
    pub updated_at: DateTime<Utc>,
}

/// Persisted per-index configuration and document membership.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexManifest {
    pub name: String,
    /// Schema version; any mismatch forces a full rebuild.
    pub version: u32,
    /// Dimensionality every vector in this index must have.
    pub vector_size: usize,
    pub chunking: ChunkingConfig,
    /// Embedding model id the stored vectors were produced with.
    pub model: String,
    pub documents: BTreeMap<String, DocumentEntry>,
    next_seq: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One line of `records.jsonl`.
#[derive(Serialize, Deserialize)]
struct RecordLine {
    uri: String,
    chunk_index: usize,
    start_token: usize,
    end_token: usize,
    text: String,
    hash: String,
    seq: u64,
    vector: String,
}

/// In-memory chunk+vector record.
#[derive(Debug, Clone)]
struct StoredChunk {
    chunk: Chunk,
    vector: Vec<f32>,
    doc_seq: u64,
}

/// Outcome of an upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertStatus {
    /// New document indexed.
    Inserted,
    /// Existing document re-chunked and re-embedded.
    Updated,
    /// Content hash unchanged; nothing was done.
    Unchanged,
}

/// Durable collection of chunk+vector records for one named index.
pub struct VectorIndex {
    dir: PathBuf,
    manifest: RwLock<IndexManifest>,
    records: RwLock<Vec<StoredChunk>>,
    cache: EmbeddingCache,
    provider: Arc<dyn EmbeddingProvider>,
    tokenizer: Arc<dyn Tokenizer>,
    /// Serializes upserts and deletes; queries proceed against the
    /// pre-write snapshot.
    write_lock: Mutex<()>,
    /// Fair (FIFO) cap on simultaneous in-flight provider calls.
    embed_limiter: Arc<Semaphore>,
}

impl std::fmt::Debug for VectorIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VectorIndex")
            .field("dir", &self.dir)
            .finish_non_exhaustive()
    }
}

impl VectorIndex {
    /// Whether an index already exists in `dir`.
    pub fn is_created(dir: &Path) -> bool {
        dir.join(MANIFEST_FILE).exists()
    }

    /// Create a fresh index in `dir`.
    ///
    /// Fails with a configuration error if the index already exists,
    /// unless `options.delete_if_exists` is set, in which case prior
    /// state is discarded first.
    pub async fn create(
        dir: impl Into<PathBuf>,
        name: &str,
        provider: Arc<dyn EmbeddingProvider>,
        tokenizer: Arc<dyn Tokenizer>,
        options: &IndexOptions,
    ) -> Result<Self> {
        let dir = dir.into();
        options.validate()?;
        check_provider_dims(provider.as_ref(), options.vector_size)?;

        if Self::is_created(&dir) {
            if options.delete_if_exists {
                info!(dir = %dir.display(), "discarding existing index state");
                tokio::fs::remove_dir_all(&dir).await?;
            } else {
                return Err(IndexError::Config(format!(
                    "index '{}' already exists at {} (set delete_if_exists to rebuild)",
                    name,
                    dir.display()
                )));
            }
        }
        tokio::fs::create_dir_all(&dir).await?;

        let now = Utc::now();
        let manifest = IndexManifest {
            name: name.to_string(),
            version: options.version,
            vector_size: options.vector_size,
            chunking: options.chunking,
            model: provider.model_name().to_string(),
            documents: BTreeMap::new(),
            next_seq: 0,
            created_at: now,
            updated_at: now,
        };
        write_manifest(&dir, &manifest).await?;
        write_records(&dir, &[]).await?;

        let cache = EmbeddingCache::open(dir.join(CACHE_FILE)).await?;
        info!(name, dir = %dir.display(), dims = options.vector_size, "created index");

        Ok(Self::assemble(dir, manifest, Vec::new(), cache, provider, tokenizer, options))
    }

    /// Open an existing index in `dir`.
    ///
    /// Fails with [`IndexError::Corrupt`] when the stored manifest
    /// disagrees with the requested options or the provider — the caller
    /// recovers by rebuilding with `delete_if_exists`.
    pub async fn open(
        dir: impl Into<PathBuf>,
        provider: Arc<dyn EmbeddingProvider>,
        tokenizer: Arc<dyn Tokenizer>,
        options: &IndexOptions,
    ) -> Result<Self> {
        let dir = dir.into();
        options.validate()?;
        check_provider_dims(provider.as_ref(), options.vector_size)?;

        let manifest = read_manifest(&dir).await?;
        if manifest.version != options.version {
            return Err(IndexError::Corrupt(format!(
                "manifest version {} does not match requested version {}",
                manifest.version, options.version
            )));
        }
        if manifest.vector_size != options.vector_size {
            return Err(IndexError::Corrupt(format!(
                "manifest vector_size {} does not match requested {}",
                manifest.vector_size, options.vector_size
            )));
        }
        if manifest.chunking != options.chunking {
            return Err(IndexError::Corrupt(
                "manifest chunking config does not match requested config".into(),
            ));
        }
        if manifest.model != provider.model_name() {
            return Err(IndexError::Corrupt(format!(
                "index was built with model '{}' but provider is '{}'",
                manifest.model,
                provider.model_name()
            )));
        }

        let records = read_records(&dir, &manifest).await?;
        let cache = EmbeddingCache::open(dir.join(CACHE_FILE)).await?;
        debug!(
            name = %manifest.name,
            documents = manifest.documents.len(),
            chunks = records.len(),
            "opened index"
        );

        Ok(Self::assemble(dir, manifest, records, cache, provider, tokenizer, options))
    }

    fn assemble(
        dir: PathBuf,
        manifest: IndexManifest,
        records: Vec<StoredChunk>,
        cache: EmbeddingCache,
        provider: Arc<dyn EmbeddingProvider>,
        tokenizer: Arc<dyn Tokenizer>,
        options: &IndexOptions,
    ) -> Self {
        Self {
            dir,
            manifest: RwLock::new(manifest),
            records: RwLock::new(records),
            cache,
            provider,
            tokenizer,
            write_lock: Mutex::new(()),
            embed_limiter: Arc::new(Semaphore::new(options.max_concurrent_embeddings)),
        }
    }

    /// Snapshot of the current manifest.
    pub async fn manifest(&self) -> IndexManifest {
        self.manifest.read().await.clone()
    }

    /// Insert or replace a document.
    ///
    /// If the content hash matches the stored manifest entry this is a
    /// no-op. Otherwise the document's chunks are recomputed, embedded
    /// through the cache, and committed atomically (records, then
    /// manifest). A provider failure aborts the whole document without
    /// committing anything.
    pub async fn upsert_document(
        &self,
        uri: &str,
        text: &str,
        cancel: &CancellationToken,
    ) -> Result<UpsertStatus> {
        let _guard = self.write_lock.lock().await;
        cancel.check()?;

        let doc_hash = content_hash(text);
        let (existing_seq, chunking, expected_dims) = {
            let manifest = self.manifest.read().await;
            match manifest.documents.get(uri) {
                Some(entry) if entry.hash == doc_hash => {
                    debug!(uri, "content hash unchanged, skipping upsert");
                    return Ok(UpsertStatus::Unchanged);
                }
                Some(entry) => (Some(entry.seq), manifest.chunking, manifest.vector_size),
                None => (None, manifest.chunking, manifest.vector_size),
            }
        };

        let chunks = chunk_document(uri, text, &chunking, self.tokenizer.as_ref())?;
        let model = self.provider.model_name().to_string();

        let mut vectors = Vec::with_capacity(chunks.len());
        for chunk in &chunks {
            cancel.check()?;
            let key = CacheKey::new(chunk.hash.clone(), model.clone());
            let provider = self.provider.clone();
            let limiter = self.embed_limiter.clone();
            let chunk_text = chunk.text.clone();
            let inner_cancel = cancel.clone();
            let vector = self
                .cache
                .get_or_compute(&key, cancel, move || async move {
                    let _permit = limiter
                        .acquire_owned()
                        .await
                        .map_err(|_| IndexError::Provider("embedding limiter closed".into()))?;
                    inner_cancel.check()?;
                    provider.embed(&chunk_text).await
                })
                .await?;
            if vector.len() != expected_dims {
                return Err(IndexError::DimensionMismatch {
                    expected: expected_dims,
                    actual: vector.len(),
                });
            }
            vectors.push(vector);
        }
        cancel.check()?;

        let mut manifest = self.manifest.write().await;
        let mut records = self.records.write().await;

        let seq = existing_seq.unwrap_or(manifest.next_seq);
        let mut new_records: Vec<StoredChunk> = records
            .iter()
            .filter(|r| r.chunk.uri != uri)
            .cloned()
            .collect();
        new_records.extend(
            chunks
                .into_iter()
                .zip(vectors)
                .map(|(chunk, vector)| StoredChunk {
                    chunk,
                    vector,
                    doc_seq: seq,
                }),
        );

        let mut new_manifest = manifest.clone();
        if existing_seq.is_none() {
            new_manifest.next_seq += 1;
        }
        new_manifest.documents.insert(
            uri.to_string(),
            DocumentEntry {
                hash: doc_hash,
                seq,
                updated_at: Utc::now(),
            },
        );
        new_manifest.updated_at = Utc::now();

        // Records first, manifest last: the manifest rename is the commit.
        write_records(&self.dir, &new_records).await?;
        write_manifest(&self.dir, &new_manifest).await?;

        let status = if existing_seq.is_some() {
            UpsertStatus::Updated
        } else {
            UpsertStatus::Inserted
        };
        info!(uri, documents = new_manifest.documents.len(), ?status, "upserted document");

        *manifest = new_manifest;
        *records = new_records;
        Ok(status)
    }

    /// Remove a document and its records. Returns `false` when the uri
    /// was not indexed.
    pub async fn delete_document(&self, uri: &str, cancel: &CancellationToken) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        cancel.check()?;

        let mut manifest = self.manifest.write().await;
        if !manifest.documents.contains_key(uri) {
            return Ok(false);
        }
        let mut records = self.records.write().await;

        let new_records: Vec<StoredChunk> = records
            .iter()
            .filter(|r| r.chunk.uri != uri)
            .cloned()
            .collect();
        let mut new_manifest = manifest.clone();
        new_manifest.documents.remove(uri);
        new_manifest.updated_at = Utc::now();

        // Manifest first for deletes: its rename commits the removal, and
        // leftover records for an unmanifested uri are dropped at load. The
        // reverse order could strand the uri in the manifest with its
        // records gone, which the content-hash short-circuit would then
        // never repair.
        write_manifest(&self.dir, &new_manifest).await?;
        write_records(&self.dir, &new_records).await?;

        info!(uri, "deleted document");
        *manifest = new_manifest;
        *records = new_records;
        Ok(true)
    }

    /// Rank stored chunks against `text`.
    ///
    /// The query is embedded as a single chunk (truncated to the model's
    /// max input length), scored against every stored vector by cosine
    /// similarity, and the top `max_documents` results are returned in
    /// descending score order. Zero matches is a normal empty list, not
    /// an error.
    pub async fn query_documents(
        &self,
        text: &str,
        max_documents: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<QueryResult>> {
        cancel.check()?;
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }

        let max_tokens = self.provider.max_input_tokens();
        let tokens = self.tokenizer.encode(text);
        let query_text = if tokens.len() > max_tokens {
            // The cut-off token can hold a partial character; trim back to
            // the boundary instead of decoding an invalid range.
            let keep = self.tokenizer.decode_bytes(&tokens[..max_tokens])?.len();
            let mut cut = keep.min(text.len());
            while !text.is_char_boundary(cut) {
                cut -= 1;
            }
            text[..cut].to_string()
        } else {
            text.to_string()
        };

        let query_vec = {
            let _permit = self
                .embed_limiter
                .acquire()
                .await
                .map_err(|_| IndexError::Provider("embedding limiter closed".into()))?;
            cancel.check()?;
            self.provider.embed(&query_text).await?
        };

        let expected = self.manifest.read().await.vector_size;
        if query_vec.len() != expected {
            return Err(IndexError::DimensionMismatch {
                expected,
                actual: query_vec.len(),
            });
        }

        cancel.check()?;
        let records = self.records.read().await;
        let mut scored: Vec<(f32, usize)> = records
            .iter()
            .enumerate()
            .map(|(i, r)| (cosine_similarity(&query_vec, &r.vector), i))
            .collect();
        scored.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    let ra = &records[a.1];
                    let rb = &records[b.1];
                    (ra.doc_seq, ra.chunk.chunk_index).cmp(&(rb.doc_seq, rb.chunk.chunk_index))
                })
        });
        scored.truncate(max_documents);

        Ok(scored
            .into_iter()
            .map(|(score, i)| {
                let r = &records[i];
                QueryResult {
                    uri: r.chunk.uri.clone(),
                    chunk_index: r.chunk.chunk_index,
                    score,
                    text: r.chunk.text.clone(),
                }
            })
            .collect())
    }

    /// All chunks of one document, in original order.
    pub async fn document_chunks(&self, uri: &str) -> Vec<Chunk> {
        let records = self.records.read().await;
        let mut chunks: Vec<Chunk> = records
            .iter()
            .filter(|r| r.chunk.uri == uri)
            .map(|r| r.chunk.clone())
            .collect();
        chunks.sort_by_key(|c| c.chunk_index);
        chunks
    }
}

fn check_provider_dims(provider: &dyn EmbeddingProvider, vector_size: usize) -> Result<()> {
    if provider.dims() != vector_size {
        return Err(IndexError::DimensionMismatch {
            expected: vector_size,
            actual: provider.dims(),
        });
    }
    Ok(())
}

async fn read_manifest(dir: &Path) -> Result<IndexManifest> {
    let path = dir.join(MANIFEST_FILE);
    let content = tokio::fs::read_to_string(&path).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            IndexError::Corrupt(format!("no index manifest at {}", path.display()))
        } else {
            IndexError::Io(e)
        }
    })?;
    serde_json::from_str(&content)
        .map_err(|e| IndexError::Corrupt(format!("unreadable manifest: {e}")))
}

async fn write_manifest(dir: &Path, manifest: &IndexManifest) -> Result<()> {
    let path = dir.join(MANIFEST_FILE);
    let tmp = dir.join(format!("{MANIFEST_FILE}.tmp"));
    tokio::fs::write(&tmp, serde_json::to_string_pretty(manifest)?).await?;
    tokio::fs::rename(&tmp, &path).await?;
    Ok(())
}

async fn read_records(dir: &Path, manifest: &IndexManifest) -> Result<Vec<StoredChunk>> {
    let path = dir.join(RECORDS_FILE);
    let content = match tokio::fs::read_to_string(&path).await {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut records = Vec::new();
    for line in content.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let parsed: RecordLine = match serde_json::from_str(line) {
            Ok(r) => r,
            Err(e) => {
                return Err(IndexError::Corrupt(format!("unreadable record line: {e}")));
            }
        };
        // Records for uris outside the manifest are leftovers from an
        // interrupted update; drop them.
        let Some(entry) = manifest.documents.get(&parsed.uri) else {
            warn!(uri = %parsed.uri, "dropping record for unmanifested document");
            continue;
        };
        let vector = decode_vector(&parsed.vector)?;
        if vector.len() != manifest.vector_size {
            return Err(IndexError::Corrupt(format!(
                "stored vector for '{}' has {} dimensions, manifest says {}",
                parsed.uri,
                vector.len(),
                manifest.vector_size
            )));
        }
        records.push(StoredChunk {
            chunk: Chunk {
                uri: parsed.uri,
                chunk_index: parsed.chunk_index,
                start_token: parsed.start_token,
                end_token: parsed.end_token,
                text: parsed.text,
                hash: parsed.hash,
            },
            vector,
            doc_seq: entry.seq,
        });
    }
    Ok(records)
}

async fn write_records(dir: &Path, records: &[StoredChunk]) -> Result<()> {
    let path = dir.join(RECORDS_FILE);
    let tmp = dir.join(format!("{RECORDS_FILE}.tmp"));

    let mut out = String::new();
    for r in records {
        let line = RecordLine {
            uri: r.chunk.uri.clone(),
            chunk_index: r.chunk.chunk_index,
            start_token: r.chunk.start_token,
            end_token: r.chunk.end_token,
            text: r.chunk.text.clone(),
            hash: r.chunk.hash.clone(),
            seq: r.doc_seq,
            vector: encode_vector(&r.vector),
        };
        out.push_str(&serde_json::to_string(&line)?);
        out.push('\n');
    }

    tokio::fs::write(&tmp, out).await?;
    tokio::fs::rename(&tmp, &path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::MockEmbeddingProvider;
    use crate::tokenizer::resolve_tokenizer;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const DIMS: usize = 64;

    /// Counts provider invocations, for cache short-circuit assertions.
    struct CountingProvider {
        inner: MockEmbeddingProvider,
        calls: AtomicUsize,
    }

    impl CountingProvider {
        fn new() -> Self {
            Self {
                inner: MockEmbeddingProvider::new(DIMS),
                calls: AtomicUsize::new(0),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl EmbeddingProvider for CountingProvider {
        fn model_name(&self) -> &str {
            self.inner.model_name()
        }
        fn dims(&self) -> usize {
            self.inner.dims()
        }
        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.embed(text).await
        }
    }

    fn options() -> IndexOptions {
        IndexOptions {
            vector_size: DIMS,
            chunking: ChunkingConfig {
                chunk_size: 32,
                chunk_overlap: 8,
            },
            ..Default::default()
        }
    }

    async fn make_index(dir: &Path) -> VectorIndex {
        let provider = Arc::new(MockEmbeddingProvider::new(DIMS));
        let tokenizer = resolve_tokenizer("mock-embed").unwrap();
        VectorIndex::create(dir, "docs", provider, tokenizer, &options())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_create_then_open() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("docs");
        let cancel = CancellationToken::new();

        let index = make_index(&dir).await;
        index
            .upsert_document("a.md", "hello semantic world", &cancel)
            .await
            .unwrap();
        drop(index);

        assert!(VectorIndex::is_created(&dir));
        let provider = Arc::new(MockEmbeddingProvider::new(DIMS));
        let tokenizer = resolve_tokenizer("mock-embed").unwrap();
        let reopened = VectorIndex::open(&dir, provider, tokenizer, &options())
            .await
            .unwrap();
        let manifest = reopened.manifest().await;
        assert_eq!(manifest.documents.len(), 1);
        assert!(!reopened.document_chunks("a.md").await.is_empty());
    }

    #[tokio::test]
    async fn test_create_refuses_existing_without_delete() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("docs");
        make_index(&dir).await;

        let provider = Arc::new(MockEmbeddingProvider::new(DIMS));
        let tokenizer = resolve_tokenizer("mock-embed").unwrap();
        let err = VectorIndex::create(&dir, "docs", provider.clone(), tokenizer.clone(), &options())
            .await
            .unwrap_err();
        assert!(matches!(err, IndexError::Config(_)));

        let mut opts = options();
        opts.delete_if_exists = true;
        VectorIndex::create(&dir, "docs", provider, tokenizer, &opts)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_upsert_then_query_self_similarity() {
        let tmp = tempfile::tempdir().unwrap();
        let index = make_index(&tmp.path().join("docs")).await;
        let cancel = CancellationToken::new();

        let text = "Rust ownership and borrowing explained for systems programmers";
        index.upsert_document("rust.md", text, &cancel).await.unwrap();

        let results = index.query_documents(text, 3, &cancel).await.unwrap();
        assert!(!results.is_empty());
        assert_eq!(results[0].uri, "rust.md");
        assert!(results[0].score > 0.99, "self-similarity was {}", results[0].score);
    }

    #[tokio::test]
    async fn test_unchanged_reupsert_makes_no_provider_calls() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("docs");
        let provider = Arc::new(CountingProvider::new());
        let tokenizer = resolve_tokenizer("mock-embed").unwrap();
        let index = VectorIndex::create(&dir, "docs", provider.clone(), tokenizer, &options())
            .await
            .unwrap();
        let cancel = CancellationToken::new();

        let status = index
            .upsert_document("a.md", "stable content", &cancel)
            .await
            .unwrap();
        assert_eq!(status, UpsertStatus::Inserted);
        let calls_after_insert = provider.calls();
        assert!(calls_after_insert > 0);

        let status = index
            .upsert_document("a.md", "stable content", &cancel)
            .await
            .unwrap();
        assert_eq!(status, UpsertStatus::Unchanged);
        assert_eq!(provider.calls(), calls_after_insert);
    }

    #[tokio::test]
    async fn test_changed_content_updates() {
        let tmp = tempfile::tempdir().unwrap();
        let index = make_index(&tmp.path().join("docs")).await;
        let cancel = CancellationToken::new();

        index.upsert_document("a.md", "first version", &cancel).await.unwrap();
        let status = index
            .upsert_document("a.md", "second version entirely different", &cancel)
            .await
            .unwrap();
        assert_eq!(status, UpsertStatus::Updated);

        let manifest = index.manifest().await;
        assert_eq!(manifest.documents.len(), 1);
        let chunks = index.document_chunks("a.md").await;
        assert!(chunks[0].text.contains("second"));
    }

    #[tokio::test]
    async fn test_delete_document() {
        let tmp = tempfile::tempdir().unwrap();
        let index = make_index(&tmp.path().join("docs")).await;
        let cancel = CancellationToken::new();

        index.upsert_document("a.md", "alpha content", &cancel).await.unwrap();
        index.upsert_document("b.md", "beta content", &cancel).await.unwrap();

        assert!(index.delete_document("a.md", &cancel).await.unwrap());
        assert!(!index.delete_document("a.md", &cancel).await.unwrap());

        let results = index.query_documents("alpha content", 10, &cancel).await.unwrap();
        assert!(results.iter().all(|r| r.uri != "a.md"));
        assert!(index.document_chunks("a.md").await.is_empty());
    }

    #[tokio::test]
    async fn test_provider_dims_must_match_vector_size() {
        let tmp = tempfile::tempdir().unwrap();
        let provider = Arc::new(MockEmbeddingProvider::new(768));
        let tokenizer = resolve_tokenizer("mock-embed").unwrap();
        let mut opts = options();
        opts.vector_size = 1536;

        let err = VectorIndex::create(tmp.path().join("docs"), "docs", provider, tokenizer, &opts)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            IndexError::DimensionMismatch {
                expected: 1536,
                actual: 768
            }
        ));
    }

    #[tokio::test]
    async fn test_open_rejects_model_mismatch() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("docs");
        make_index(&dir).await;

        struct RenamedProvider(MockEmbeddingProvider);
        #[async_trait]
        impl EmbeddingProvider for RenamedProvider {
            fn model_name(&self) -> &str {
                "other-model"
            }
            fn dims(&self) -> usize {
                self.0.dims()
            }
            async fn embed(&self, text: &str) -> Result<Vec<f32>> {
                self.0.embed(text).await
            }
        }

        let provider = Arc::new(RenamedProvider(MockEmbeddingProvider::new(DIMS)));
        let tokenizer = resolve_tokenizer("mock-embed").unwrap();
        let err = VectorIndex::open(&dir, provider, tokenizer, &options())
            .await
            .unwrap_err();
        assert!(matches!(err, IndexError::Corrupt(_)));
    }

    #[tokio::test]
    async fn test_open_rejects_version_mismatch() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("docs");
        make_index(&dir).await;

        let provider = Arc::new(MockEmbeddingProvider::new(DIMS));
        let tokenizer = resolve_tokenizer("mock-embed").unwrap();
        let mut opts = options();
        opts.version = 2;
        let err = VectorIndex::open(&dir, provider, tokenizer, &opts)
            .await
            .unwrap_err();
        assert!(matches!(err, IndexError::Corrupt(_)));
    }

    #[tokio::test]
    async fn test_reopen_serves_stored_vectors_without_reembedding() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("docs");
        let cancel = CancellationToken::new();

        {
            let provider = Arc::new(MockEmbeddingProvider::new(DIMS));
            let tokenizer = resolve_tokenizer("mock-embed").unwrap();
            let index = VectorIndex::create(&dir, "docs", provider, tokenizer, &options())
                .await
                .unwrap();
            index
                .upsert_document("a.md", "persistent document content", &cancel)
                .await
                .unwrap();
        }

        let provider = Arc::new(CountingProvider::new());
        let tokenizer = resolve_tokenizer("mock-embed").unwrap();
        let index = VectorIndex::open(&dir, provider.clone(), tokenizer, &options())
            .await
            .unwrap();
        let results = index
            .query_documents("persistent document content", 5, &cancel)
            .await
            .unwrap();
        assert_eq!(results[0].uri, "a.md");
        // Only the query itself hit the provider.
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_upsert_leaves_index_unchanged() {
        let tmp = tempfile::tempdir().unwrap();
        let index = make_index(&tmp.path().join("docs")).await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = index
            .upsert_document("a.md", "never committed", &cancel)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert!(index.manifest().await.documents.is_empty());
    }

    #[tokio::test]
    async fn test_interrupted_delete_recovers_on_reupsert() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("docs");
        let cancel = CancellationToken::new();
        let text = "astronomy telescopes and star charts";

        {
            let index = make_index(&dir).await;
            index.upsert_document("a.md", text, &cancel).await.unwrap();
        }

        // A delete commits by rewriting the manifest; simulate a crash
        // right after that commit, before the records rewrite.
        let manifest_path = dir.join(MANIFEST_FILE);
        let mut manifest: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&manifest_path).unwrap()).unwrap();
        manifest["documents"]
            .as_object_mut()
            .unwrap()
            .remove("a.md");
        std::fs::write(&manifest_path, serde_json::to_string_pretty(&manifest).unwrap()).unwrap();

        let provider = Arc::new(MockEmbeddingProvider::new(DIMS));
        let tokenizer = resolve_tokenizer("mock-embed").unwrap();
        let index = VectorIndex::open(&dir, provider, tokenizer, &options())
            .await
            .unwrap();
        // Stale records do not resurrect the document.
        assert!(index.document_chunks("a.md").await.is_empty());

        // Re-upserting identical content must fully restore it, not
        // short-circuit on the old hash.
        let status = index.upsert_document("a.md", text, &cancel).await.unwrap();
        assert_eq!(status, UpsertStatus::Inserted);
        let results = index.query_documents(text, 5, &cancel).await.unwrap();
        assert_eq!(results[0].uri, "a.md");
    }

    #[tokio::test]
    async fn test_multibyte_document_upserts_and_queries() {
        let tmp = tempfile::tempdir().unwrap();
        let index = make_index(&tmp.path().join("docs")).await;
        let cancel = CancellationToken::new();

        // Emoji token boundaries fall mid-character for this chunking.
        let text = format!("Reactions log: {}", "🤖".repeat(600));
        index.upsert_document("log.md", &text, &cancel).await.unwrap();

        // Long enough to exercise the query truncation path too.
        let query = format!("Reactions log {}", "🤖".repeat(400));
        let results = index.query_documents(&query, 3, &cancel).await.unwrap();
        assert_eq!(results[0].uri, "log.md");
    }

    #[tokio::test]
    async fn test_identical_documents_tie_break_by_insertion_order() {
        let tmp = tempfile::tempdir().unwrap();
        let index = make_index(&tmp.path().join("docs")).await;
        let cancel = CancellationToken::new();

        let text = "identical twin document body";
        index.upsert_document("first.md", text, &cancel).await.unwrap();
        index.upsert_document("second.md", text, &cancel).await.unwrap();

        for _ in 0..3 {
            let results = index.query_documents(text, 10, &cancel).await.unwrap();
            assert!(results.len() >= 2);
            assert!((results[0].score - results[1].score).abs() < 1e-6);
            assert_eq!(results[0].uri, "first.md");
            assert_eq!(results[1].uri, "second.md");
        }
    }

    #[tokio::test]
    async fn test_empty_query_returns_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let index = make_index(&tmp.path().join("docs")).await;
        let cancel = CancellationToken::new();
        index.upsert_document("a.md", "some content", &cancel).await.unwrap();
        let results = index.query_documents("   ", 5, &cancel).await.unwrap();
        assert!(results.is_empty());
    }
}
