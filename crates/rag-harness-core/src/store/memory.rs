//! In-memory [`VectorStore`] for tests and small corpora.
//!
//! All state sits behind one `std::sync::RwLock`, so a document replace is
//! a single write-locked swap and readers never see half of it. Searches
//! are brute force.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use crate::embedding::{cosine_similarity, idf};
use crate::error::StoreError;
use crate::models::{Chunk, Document, SparseVector};

use super::{IndexedChunk, StoreHit, VectorStore};

#[derive(Default)]
struct State {
    docs: HashMap<String, Document>,
    chunks: HashMap<String, IndexedChunk>,
    by_doc: HashMap<String, Vec<String>>,
    fingerprint: Option<String>,
}

impl State {
    fn remove_doc(&mut self, document_id: &str) -> usize {
        self.docs.remove(document_id);
        let ids = self.by_doc.remove(document_id).unwrap_or_default();
        for id in &ids {
            self.chunks.remove(id);
        }
        ids.len()
    }

    fn hit(&self, entry: &IndexedChunk, score: f64) -> StoreHit {
        let c = &entry.chunk;
        StoreHit {
            chunk_id: c.id.clone(),
            document_id: c.document_id.clone(),
            parent_id: c.parent_id.clone(),
            score,
            text: c.text.clone(),
            title: self
                .docs
                .get(&c.document_id)
                .map(|d| d.title.clone())
                .unwrap_or_default(),
        }
    }
}

#[derive(Default)]
pub struct InMemoryStore {
    state: RwLock<State>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, State>, StoreError> {
        self.state
            .read()
            .map_err(|_| StoreError::Unavailable("store lock poisoned".into()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, State>, StoreError> {
        self.state
            .write()
            .map_err(|_| StoreError::Unavailable("store lock poisoned".into()))
    }

    pub fn chunk_count(&self) -> usize {
        self.read().map(|s| s.chunks.len()).unwrap_or(0)
    }
}

fn rank(mut scored: Vec<(f64, StoreHit)>, limit: usize) -> Vec<StoreHit> {
    scored.sort_by(|a, b| {
        b.0.partial_cmp(&a.0)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.1.chunk_id.cmp(&b.1.chunk_id))
    });
    scored.truncate(limit);
    scored.into_iter().map(|(_, h)| h).collect()
}

#[async_trait]
impl VectorStore for InMemoryStore {
    async fn replace_document(&self, doc: &Document, chunks: &[IndexedChunk]) -> Result<(), StoreError> {
        let mut state = self.write()?;
        state.remove_doc(&doc.id);
        state.docs.insert(doc.id.clone(), doc.clone());
        let ids: Vec<String> = chunks.iter().map(|c| c.chunk.id.clone()).collect();
        for c in chunks {
            state.chunks.insert(c.chunk.id.clone(), c.clone());
        }
        state.by_doc.insert(doc.id.clone(), ids);
        Ok(())
    }

    async fn delete_document(&self, document_id: &str) -> Result<usize, StoreError> {
        Ok(self.write()?.remove_doc(document_id))
    }

    async fn dense_search(&self, query: &[f32], limit: usize) -> Result<Vec<StoreHit>, StoreError> {
        let state = self.read()?;
        let scored = state
            .chunks
            .values()
            .filter_map(|entry| {
                let emb = entry.embedding.as_ref()?;
                let score = cosine_similarity(query, &emb.dense) as f64;
                Some((score, state.hit(entry, score)))
            })
            .collect();
        Ok(rank(scored, limit))
    }

    async fn sparse_search(&self, query: &SparseVector, limit: usize) -> Result<Vec<StoreHit>, StoreError> {
        let state = self.read()?;
        let indexed: Vec<(&IndexedChunk, &SparseVector)> = state
            .chunks
            .values()
            .filter_map(|e| e.embedding.as_ref().map(|emb| (e, &emb.sparse)))
            .collect();
        let total = indexed.len();

        let idfs: HashMap<u32, f32> = query
            .keys()
            .map(|term| {
                let df = indexed.iter().filter(|(_, sv)| sv.contains_key(term)).count();
                (*term, idf(total, df))
            })
            .collect();

        let scored = indexed
            .iter()
            .filter_map(|(entry, sv)| {
                let score: f32 = query
                    .iter()
                    .filter_map(|(term, qw)| sv.get(term).map(|dw| qw * idfs[term] * dw))
                    .sum();
                (score > 0.0).then(|| (score as f64, state.hit(entry, score as f64)))
            })
            .collect();
        Ok(rank(scored, limit))
    }

    async fn get_chunks(&self, ids: &[String]) -> Result<Vec<Chunk>, StoreError> {
        let state = self.read()?;
        Ok(ids
            .iter()
            .filter_map(|id| state.chunks.get(id).map(|e| e.chunk.clone()))
            .collect())
    }

    async fn index_fingerprint(&self) -> Result<Option<String>, StoreError> {
        Ok(self.read()?.fingerprint.clone())
    }

    async fn set_index_fingerprint(&self, fingerprint: &str) -> Result<(), StoreError> {
        self.write()?.fingerprint = Some(fingerprint.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{chunk_document, ChunkSpec};
    use crate::embedding::{HashingEmbedder, SparseEncoder, Vectorizer};
    use crate::store::ensure_fingerprint;
    use std::sync::Arc;

    fn doc(id: &str, text: &str) -> Document {
        Document {
            id: id.to_string(),
            title: format!("Title {}", id),
            text: text.to_string(),
            source_timestamp: 0,
        }
    }

    async fn index(store: &InMemoryStore, v: &Vectorizer, d: &Document) {
        let chunks = chunk_document(&d.id, &d.text, &ChunkSpec::PARENT, &ChunkSpec::CHILD);
        let texts: Vec<String> = chunks.children.iter().map(|c| c.text.clone()).collect();
        let pairs = v.embed_documents(&texts).await.unwrap();
        let mut indexed: Vec<IndexedChunk> = chunks
            .parents
            .iter()
            .map(|c| IndexedChunk {
                chunk: c.clone(),
                embedding: None,
            })
            .collect();
        indexed.extend(chunks.children.iter().zip(pairs).map(|(c, p)| IndexedChunk {
            chunk: c.clone(),
            embedding: Some(p),
        }));
        store.replace_document(d, &indexed).await.unwrap();
    }

    fn vectorizer() -> Vectorizer {
        Vectorizer::new(Arc::new(HashingEmbedder::new(128)), SparseEncoder::default())
    }

    #[tokio::test]
    async fn test_search_both_sides() {
        let store = InMemoryStore::new();
        let v = vectorizer();
        index(&store, &v, &doc("hr", "All employees receive 21 days of paid vacation per year.")).await;
        index(&store, &v, &doc("ops", "Deployments go out through the release pipeline.")).await;

        let q = v.embed_query("vacation days").await.unwrap();
        let dense = store.dense_search(&q.dense, 5).await.unwrap();
        assert_eq!(dense[0].document_id, "hr");
        assert_eq!(dense[0].title, "Title hr");

        let sparse = store.sparse_search(&q.sparse, 5).await.unwrap();
        assert_eq!(sparse.len(), 1);
        assert_eq!(sparse[0].document_id, "hr");
        assert!(sparse[0].parent_id.is_some());
    }

    #[tokio::test]
    async fn test_replace_is_whole_document() {
        let store = InMemoryStore::new();
        let v = vectorizer();
        index(&store, &v, &doc("a", "first version text")).await;
        let before = store.chunk_count();
        index(&store, &v, &doc("a", "second version text")).await;
        assert_eq!(store.chunk_count(), before);

        let q = v.embed_query("first").await.unwrap();
        assert!(store.sparse_search(&q.sparse, 5).await.unwrap().is_empty());

        assert_eq!(store.delete_document("a").await.unwrap(), before);
        assert_eq!(store.chunk_count(), 0);
    }

    #[tokio::test]
    async fn test_fingerprint_guard() {
        let store = InMemoryStore::new();
        let v = vectorizer();
        ensure_fingerprint(&store, &v, true).await.unwrap();
        assert_eq!(store.index_fingerprint().await.unwrap(), Some(v.fingerprint()));

        let other = Vectorizer::new(Arc::new(HashingEmbedder::new(64)), SparseEncoder::default());
        let err = ensure_fingerprint(&store, &other, false).await.unwrap_err();
        assert_eq!(err.code(), "embedding");
    }
}
