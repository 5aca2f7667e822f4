//! # RAG Harness Core
//!
//! Runtime-free logic for RAG Harness: data models, hierarchical chunking,
//! sparse term encoding, reciprocal rank fusion, rerank ordering, evidence
//! filtering, query preprocessing, context assembly, prompt construction,
//! citation checks, and the vector store abstraction.
//!
//! This crate contains no tokio, sqlx, HTTP client, or filesystem I/O.
//! Everything here is deterministic and synchronous except the
//! [`store::VectorStore`] trait, whose in-memory implementation returns
//! immediately-ready futures.

pub mod chunk;
pub mod citation;
pub mod context;
pub mod embedding;
pub mod error;
pub mod fusion;
pub mod models;
pub mod prompt;
pub mod query;
pub mod rerank;
pub mod store;
pub mod support;
