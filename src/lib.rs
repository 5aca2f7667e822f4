//! # RAG Harness
//!
//! Retrieval-augmented question answering over a local document corpus.
//!
//! Documents are split into parent/child chunks, each child is embedded
//! twice (dense vector plus BM25-weighted sparse terms), and both
//! representations are stored in SQLite. A question is normalized,
//! searched densely and sparsely in parallel, fused with reciprocal rank
//! fusion, reranked, optionally filtered to supporting passages, widened
//! to parent context within a character budget, and answered by a
//! streaming chat-completion backend with `[n]`
//! citations.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌──────────────┐   ┌───────────┐
//! │ Filesystem │──▶│ Chunk+Embed  │──▶│  SQLite   │
//! │ connector  │   │ (ingest)     │   │ dense+BM25│
//! └────────────┘   └──────────────┘   └─────┬─────┘
//!                                           │
//!         ┌─────────────────────────────────┤
//!         ▼                                 ▼
//!  ┌──────────────┐  fuse+rerank  ┌──────────────────┐
//!  │ HybridRetr.  │──────────────▶│ context + stream │──▶ CLI / HTTP SSE
//!  └──────────────┘               └──────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! rag init                              # create database
//! rag ingest --root ./docs              # index local files
//! rag search "vacation policy"          # inspect candidates
//! rag ask "What is our vacation policy?"
//! rag serve                             # POST /chat (SSE)
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`logging`] | `tracing` subscriber setup |
//! | [`db`] / [`migrate`] | SQLite connection and schema |
//! | [`sqlite_store`] | `VectorStore` over SQLite |
//! | [`embedding`] | Dense embedding providers |
//! | [`connector_fs`] | Filesystem document source |
//! | [`ingest`] | Chunk, embed and atomically index documents |
//! | [`retriever`] | Concurrent dense/sparse search with fusion |
//! | [`rerank`] | Network rerank backends |
//! | [`generation`] | Streaming chat completions with cancel and timeouts |
//! | [`pipeline`] | Per-query orchestration |
//! | [`search`] / [`ask`] | CLI commands |
//! | [`server`] | HTTP server |
//!
//! The runtime-free algorithms (chunker, fusion, context assembly, query
//! preprocessing, citation checks) live in the `rag_harness_core` crate.

pub mod ask;
pub mod config;
pub mod connector_fs;
pub mod db;
pub mod embedding;
pub mod generation;
pub mod ingest;
pub mod logging;
pub mod migrate;
pub mod pipeline;
pub mod rerank;
pub mod retriever;
pub mod search;
pub mod server;
pub mod sqlite_store;

use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::SqlitePool;

use rag_harness_core::embedding::Vectorizer;
use rag_harness_core::store::VectorStore;

use crate::config::Config;
use crate::pipeline::QueryPipeline;
use crate::retriever::HybridRetriever;

/// Connect to the index (creating the schema if needed) and build the
/// configured vectorizer. The same vectorizer handle must serve both
/// ingestion and queries.
pub async fn open_index(config: &Config) -> Result<(SqlitePool, Arc<dyn VectorStore>, Vectorizer)> {
    let pool = db::connect(config).await?;
    migrate::migrate(&pool).await?;
    let store: Arc<dyn VectorStore> = Arc::new(sqlite_store::SqliteStore::new(pool.clone()));
    let vectorizer = embedding::create_vectorizer(&config.embedding)?;
    Ok((pool, store, vectorizer))
}

/// Construct every long-lived handle once and wire them into a pipeline.
pub async fn build_pipeline(config: &Config) -> Result<QueryPipeline> {
    let (_pool, store, vectorizer) = open_index(config).await?;
    let retriever = HybridRetriever::open(store, vectorizer, (&config.retrieval).into())
        .await
        .context("Index and configured embedding model disagree; re-ingest or fix [embedding]")?;
    let reranker = rerank::create_reranker(&config.rerank)?;
    let support = rerank::create_support_filter(&config.support)?;
    let generator = generation::create_backend(&config.generation)?;
    Ok(QueryPipeline::new(
        config.query.preprocessor(),
        retriever,
        reranker,
        generator,
        config.into(),
    )
    .with_support_filter(support))
}
