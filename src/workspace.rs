//! Workspace-level facade over the vector index.
//!
//! [`create_workspace_file_index`] is the main entry point: it resolves
//! the tokenizer for the configured model, opens (or rebuilds) a named
//! index under the workspace's index root, and returns a
//! [`WorkspaceFileIndex`] that ingests [`WorkspaceFile`]s and answers
//! free-text searches with section-rendered file content.
//!
//! Search results are whole-file oriented: matched chunks are grouped by
//! document, the document's chunks are re-merged into sections, and each
//! file's returned content is its best-scoring sections (in original
//! document order, separated by `"\n...\n"`) within a fixed character
//! budget.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::cancel::CancellationToken;
use crate::config::{sanitize_index_name, EmbeddingModelConfig, IndexOptions};
use crate::embedding::EmbeddingProvider;
use crate::error::{IndexError, Result};
use crate::index::{UpsertStatus, VectorIndex};
use crate::models::{FileSearchResult, InsertOutcome, WorkspaceFile};
use crate::sections::render_all_sections;
use crate::tokenizer::resolve_tokenizer;

/// Character budget for one file's rendered search content.
pub const SECTION_CHAR_BUDGET: usize = 8000;

/// Separator between non-adjacent sections of the same file.
const SECTION_SEPARATOR: &str = "\n...\n";

/// Supplies file content for files handed in without any.
#[async_trait]
pub trait ContentResolver: Send + Sync {
    /// Populate `file.content` when possible. Leaving it `None` (for a
    /// missing or non-text file) is not an error; the file is skipped.
    async fn resolve(&self, file: &mut WorkspaceFile) -> Result<()>;
}

/// Resolves file uris as paths on the local filesystem.
///
/// Relative uris are joined onto the workspace root. Files that do not
/// exist or do not decode as UTF-8 are left unresolved.
pub struct FsContentResolver {
    root: PathBuf,
}

impl FsContentResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, uri: &str) -> PathBuf {
        let path = Path::new(uri);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }
}

#[async_trait]
impl ContentResolver for FsContentResolver {
    async fn resolve(&self, file: &mut WorkspaceFile) -> Result<()> {
        if file.content.is_some() {
            return Ok(());
        }
        let path = self.path_for(&file.uri);
        match tokio::fs::read(&path).await {
            Ok(bytes) => match String::from_utf8(bytes) {
                Ok(text) => file.content = Some(text),
                Err(_) => {
                    debug!(uri = %file.uri, "file is not valid UTF-8, leaving unresolved");
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(uri = %file.uri, "file not found, leaving unresolved");
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }
}

/// Search knobs for [`WorkspaceFileIndex::search`].
#[derive(Debug, Clone, Copy)]
pub struct SearchOptions {
    /// Maximum number of chunk matches to consider.
    pub top_k: usize,
    /// Hard similarity floor; chunks scoring below it are dropped even
    /// when fewer than `top_k` matches remain.
    pub min_score: f32,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            top_k: 5,
            min_score: 0.0,
        }
    }
}

/// File-oriented semantic index for one workspace.
pub struct WorkspaceFileIndex {
    name: String,
    index: VectorIndex,
    resolver: Option<Arc<dyn ContentResolver>>,
}

impl std::fmt::Debug for WorkspaceFileIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkspaceFileIndex")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Open or create the named index under `index_root`.
///
/// The name is sanitized to ASCII alphanumerics before use, so distinct
/// caller-supplied names may map to the same index. An existing index
/// whose stored configuration no longer matches (schema version, chunking
/// parameters, vector size, or model) is discarded and rebuilt rather
/// than surfaced as an error.
pub async fn create_workspace_file_index(
    index_root: impl AsRef<Path>,
    name: &str,
    model: EmbeddingModelConfig,
    provider: Arc<dyn EmbeddingProvider>,
    options: IndexOptions,
) -> Result<WorkspaceFileIndex> {
    model.validate()?;
    options.validate()?;

    let name = sanitize_index_name(name);
    let dir = index_root.as_ref().join(&name);
    let tokenizer = resolve_tokenizer(&model.model)?;

    let index = if options.delete_if_exists || !VectorIndex::is_created(&dir) {
        VectorIndex::create(&dir, &name, provider, tokenizer, &options).await?
    } else {
        match VectorIndex::open(&dir, provider.clone(), tokenizer.clone(), &options).await {
            Ok(index) => index,
            Err(IndexError::Corrupt(reason)) => {
                warn!(index = %name, %reason, "stored index unusable, rebuilding");
                let rebuild = IndexOptions {
                    delete_if_exists: true,
                    ..options
                };
                VectorIndex::create(&dir, &name, provider, tokenizer, &rebuild).await?
            }
            Err(e) => return Err(e),
        }
    };

    Ok(WorkspaceFileIndex {
        name,
        index,
        resolver: None,
    })
}

impl WorkspaceFileIndex {
    /// Sanitized index name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Install a resolver used to populate content for files handed in
    /// without any.
    pub fn with_resolver(mut self, resolver: Arc<dyn ContentResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// The underlying chunk-level index.
    pub fn vector_index(&self) -> &VectorIndex {
        &self.index
    }

    /// Ingest a batch of files.
    ///
    /// Files without content are run through the resolver first. Files
    /// that stay unresolved, carry a binary `encoding`, or fail at the
    /// embedding provider are counted as skipped; the rest of the batch
    /// still goes through. Cancellation and local I/O failures abort the
    /// whole batch.
    pub async fn insert_or_update(
        &self,
        files: &mut [WorkspaceFile],
        cancel: &CancellationToken,
    ) -> Result<InsertOutcome> {
        let mut outcome = InsertOutcome::default();

        for file in files.iter_mut() {
            cancel.check()?;

            if file.content.is_none() {
                if let Some(resolver) = &self.resolver {
                    resolver.resolve(file).await?;
                }
            }
            if file.encoding.is_some() {
                debug!(uri = %file.uri, "skipping non-text file");
                outcome.skipped += 1;
                continue;
            }
            let Some(content) = file.content.as_deref() else {
                debug!(uri = %file.uri, "skipping file with unresolved content");
                outcome.skipped += 1;
                continue;
            };

            match self.index.upsert_document(&file.uri, content, cancel).await {
                Ok(UpsertStatus::Unchanged) => outcome.unchanged += 1,
                Ok(_) => outcome.indexed += 1,
                Err(IndexError::Provider(reason)) => {
                    warn!(uri = %file.uri, %reason, "embedding failed, skipping file");
                    outcome.skipped += 1;
                }
                Err(e) => return Err(e),
            }
        }

        info!(
            index = %self.name,
            indexed = outcome.indexed,
            unchanged = outcome.unchanged,
            skipped = outcome.skipped,
            "insert_or_update finished"
        );
        Ok(outcome)
    }

    /// Remove one file from the index. Returns `false` when the uri was
    /// not indexed.
    pub async fn delete(&self, uri: &str, cancel: &CancellationToken) -> Result<bool> {
        self.index.delete_document(uri, cancel).await
    }

    /// Free-text search over indexed files.
    ///
    /// The top `top_k` chunk matches at or above `min_score` are grouped
    /// by file; files rank by their best chunk score. Each file's content
    /// is the merge of its best-scoring sections, kept in original
    /// document order, within [`SECTION_CHAR_BUDGET`] characters.
    pub async fn search(
        &self,
        query: &str,
        options: SearchOptions,
        cancel: &CancellationToken,
    ) -> Result<Vec<FileSearchResult>> {
        let matches = self
            .index
            .query_documents(query, options.top_k, cancel)
            .await?;

        // Group matched chunks by file, preserving rank order of first
        // appearance.
        let mut files: Vec<(String, f32, Vec<(usize, f32)>)> = Vec::new();
        for m in matches {
            if m.score < options.min_score {
                continue;
            }
            match files.iter_mut().find(|(uri, _, _)| *uri == m.uri) {
                Some((_, best, hits)) => {
                    *best = best.max(m.score);
                    hits.push((m.chunk_index, m.score));
                }
                None => files.push((m.uri, m.score, vec![(m.chunk_index, m.score)])),
            }
        }

        let mut results = Vec::with_capacity(files.len());
        for (uri, best, hits) in files {
            cancel.check()?;
            let chunks = self.index.document_chunks(&uri).await;
            let content =
                render_matched_content(&chunks, &hits, SECTION_CHAR_BUDGET, SECTION_CHAR_BUDGET);
            results.push(FileSearchResult {
                uri,
                content,
                score: best,
            });
        }
        Ok(results)
    }
}

/// Pick the file's best-scoring sections within the total character
/// budget and merge them in document order.
fn render_matched_content(
    chunks: &[crate::models::Chunk],
    hits: &[(usize, f32)],
    section_chars: usize,
    total_chars: usize,
) -> String {
    let sections: Vec<_> = render_all_sections(chunks, section_chars).collect();

    // Score each section by the best matched chunk it contains.
    let mut scored: Vec<(f32, usize)> = sections
        .iter()
        .enumerate()
        .filter_map(|(i, s)| {
            hits.iter()
                .filter(|(idx, _)| *idx >= s.first_chunk && *idx <= s.last_chunk)
                .map(|(_, score)| *score)
                .fold(None, |acc: Option<f32>, score| {
                    Some(acc.map_or(score, |a| a.max(score)))
                })
                .map(|score| (score, i))
        })
        .collect();
    scored.sort_by(|a, b| {
        b.0.partial_cmp(&a.0)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.1.cmp(&b.1))
    });

    // Greedily take sections until the budget runs out, then restore
    // document order.
    let mut taken: Vec<usize> = Vec::new();
    let mut used = 0usize;
    for (_, i) in scored {
        let len = sections[i].text.len();
        let sep = if taken.is_empty() {
            0
        } else {
            SECTION_SEPARATOR.len()
        };
        if used + sep + len > total_chars && !taken.is_empty() {
            continue;
        }
        used += sep + len;
        taken.push(i);
    }
    taken.sort_unstable();

    taken
        .into_iter()
        .map(|i| sections[i].text.as_str())
        .collect::<Vec<_>>()
        .join(SECTION_SEPARATOR)
}
