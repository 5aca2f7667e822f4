//! Vector store abstraction.
//!
//! The [`VectorStore`] trait covers what the pipeline needs from the
//! index: an atomic per-document replace, delete by document, and two
//! independent ranked searches (dense and sparse). Implementations must be
//! `Send + Sync`; the retriever calls both searches concurrently.
//!
//! | Method | Purpose |
//! |--------|---------|
//! | [`replace_document`](VectorStore::replace_document) | Swap a document's whole chunk set |
//! | [`delete_document`](VectorStore::delete_document) | Remove a document and its chunks |
//! | [`dense_search`](VectorStore::dense_search) | Cosine similarity over child vectors |
//! | [`sparse_search`](VectorStore::sparse_search) | BM25-style term scoring |
//! | [`get_chunks`](VectorStore::get_chunks) | Fetch chunks by id (parent expansion) |
//! | [`index_fingerprint`](VectorStore::index_fingerprint) | Vectorizer the index was built with |

pub mod memory;

use async_trait::async_trait;

use crate::embedding::Vectorizer;
use crate::error::{EmbeddingError, RagError, StoreError};
use crate::models::{CandidateSource, Chunk, Document, EmbeddingPair, SearchCandidate, SparseVector};

/// A chunk ready for indexing. Parents carry no embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexedChunk {
    pub chunk: Chunk,
    pub embedding: Option<EmbeddingPair>,
}

/// One ranked search result with its payload.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreHit {
    pub chunk_id: String,
    pub document_id: String,
    pub parent_id: Option<String>,
    pub score: f64,
    pub text: String,
    pub title: String,
}

impl StoreHit {
    pub fn into_candidate(self, source: CandidateSource) -> SearchCandidate {
        SearchCandidate {
            chunk_id: self.chunk_id,
            document_id: self.document_id,
            parent_id: self.parent_id,
            score: self.score,
            source,
            text: self.text,
            title: self.title,
        }
    }
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Replace everything stored for `doc` with `chunks`.
    ///
    /// Readers see either the old chunk set or the new one, never a mix.
    async fn replace_document(&self, doc: &Document, chunks: &[IndexedChunk]) -> Result<(), StoreError>;

    /// Returns the number of chunks removed.
    async fn delete_document(&self, document_id: &str) -> Result<usize, StoreError>;

    async fn dense_search(&self, query: &[f32], limit: usize) -> Result<Vec<StoreHit>, StoreError>;

    async fn sparse_search(&self, query: &SparseVector, limit: usize) -> Result<Vec<StoreHit>, StoreError>;

    /// Chunks for the given ids, in no particular order. Unknown ids are skipped.
    async fn get_chunks(&self, ids: &[String]) -> Result<Vec<Chunk>, StoreError>;

    async fn index_fingerprint(&self) -> Result<Option<String>, StoreError>;

    async fn set_index_fingerprint(&self, fingerprint: &str) -> Result<(), StoreError>;
}

/// Fail if the index was built with a different vectorizer.
///
/// With `record` set, an index with no fingerprint yet adopts this one.
pub async fn ensure_fingerprint(
    store: &dyn VectorStore,
    vectorizer: &Vectorizer,
    record: bool,
) -> Result<(), RagError> {
    let configured = vectorizer.fingerprint();
    match store.index_fingerprint().await? {
        Some(indexed) if indexed != configured => Err(EmbeddingError::ModelMismatch { indexed, configured }.into()),
        Some(_) => Ok(()),
        None if record => Ok(store.set_index_fingerprint(&configured).await?),
        None => Ok(()),
    }
}
