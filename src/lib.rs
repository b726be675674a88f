//! # semdex
//!
//! A local, file-backed semantic search engine. Documents are split into
//! overlapping token-bounded chunks, embedded through a pluggable
//! [`EmbeddingProvider`](embedding::EmbeddingProvider), and persisted as a
//! per-index directory (manifest + chunk/vector records + append-only
//! embedding cache). Queries embed the query text and rank stored chunks
//! by brute-force cosine similarity.
//!
//! The main entry point is [`workspace::create_workspace_file_index`],
//! which returns a [`workspace::WorkspaceFileIndex`] exposing
//! `insert_or_update` and `search`.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use semdex::config::{EmbeddingModelConfig, IndexOptions};
//! use semdex::embedding::MockEmbeddingProvider;
//! use semdex::models::WorkspaceFile;
//! use semdex::workspace::{create_workspace_file_index, SearchOptions};
//!
//! # async fn run() -> semdex::error::Result<()> {
//! let provider = Arc::new(MockEmbeddingProvider::new(384));
//! let model = EmbeddingModelConfig::for_model("mock-embed", 384);
//! let options = IndexOptions {
//!     vector_size: 384,
//!     ..Default::default()
//! };
//! let index =
//!     create_workspace_file_index("/tmp/indexes", "docs", model, provider, options).await?;
//!
//! let mut files = vec![WorkspaceFile::with_content("a.md", "# Markdown basics")];
//! index.insert_or_update(&mut files, &Default::default()).await?;
//!
//! let hits = index
//!     .search("What is Markdown?", SearchOptions::default(), &Default::default())
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod cancel;
pub mod chunk;
pub mod config;
pub mod embedding;
pub mod error;
pub mod index;
pub mod models;
pub mod sections;
pub mod tokenizer;
pub mod workspace;

pub use cancel::CancellationToken;
pub use error::{IndexError, Result};
