//! Hybrid dense + sparse retrieval.
//!
//! [`HybridRetriever::search`] embeds the query once, runs the dense and
//! sparse searches concurrently, and fuses the two rankings with
//! reciprocal rank fusion. Each source gets its own timeout and bounded
//! exponential-backoff retries. A source that still fails (or comes back
//! empty while the other has results) is reported in
//! [`RetrievalOutcome::degraded_sources`] and fused as an empty list. Only
//! when both sources fail does the search fail.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use rag_harness_core::embedding::Vectorizer;
use rag_harness_core::error::{RagError, RetrievalError, StoreError, ValidationError};
use rag_harness_core::fusion::rrf_fuse;
use rag_harness_core::models::{CandidateSource, SearchCandidate};
use rag_harness_core::store::{ensure_fingerprint, StoreHit, VectorStore};

use crate::config::RetrievalConfig;

#[derive(Debug, Clone, Copy)]
pub struct RetrievalSettings {
    pub rrf_k: u32,
    pub source_timeout: Duration,
    pub max_retries: u32,
    pub backoff: Duration,
}

impl Default for RetrievalSettings {
    fn default() -> Self {
        (&RetrievalConfig::default()).into()
    }
}

impl From<&RetrievalConfig> for RetrievalSettings {
    fn from(c: &RetrievalConfig) -> Self {
        Self {
            rrf_k: c.rrf_k,
            source_timeout: Duration::from_millis(c.source_timeout_ms),
            max_retries: c.max_retries,
            backoff: Duration::from_millis(c.backoff_ms),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RetrievalOutcome {
    pub candidates: Vec<SearchCandidate>,
    /// `"dense"` and/or `"sparse"` when that source contributed nothing.
    pub degraded_sources: Vec<String>,
}

impl RetrievalOutcome {
    pub fn is_degraded(&self) -> bool {
        !self.degraded_sources.is_empty()
    }
}

#[derive(Clone)]
pub struct HybridRetriever {
    store: Arc<dyn VectorStore>,
    vectorizer: Vectorizer,
    settings: RetrievalSettings,
}

impl HybridRetriever {
    pub fn new(store: Arc<dyn VectorStore>, vectorizer: Vectorizer, settings: RetrievalSettings) -> Self {
        Self {
            store,
            vectorizer,
            settings,
        }
    }

    /// Like [`new`](Self::new), but refuses an index built by a different
    /// vectorizer.
    pub async fn open(
        store: Arc<dyn VectorStore>,
        vectorizer: Vectorizer,
        settings: RetrievalSettings,
    ) -> Result<Self, RagError> {
        ensure_fingerprint(store.as_ref(), &vectorizer, false).await?;
        Ok(Self::new(store, vectorizer, settings))
    }

    pub fn store(&self) -> &Arc<dyn VectorStore> {
        &self.store
    }

    pub fn vectorizer(&self) -> &Vectorizer {
        &self.vectorizer
    }

    pub async fn search(&self, query_text: &str, limit: usize) -> Result<RetrievalOutcome, RagError> {
        if query_text.trim().is_empty() {
            return Err(ValidationError::EmptyQuery.into());
        }
        if limit == 0 {
            return Ok(RetrievalOutcome::default());
        }

        let pair = self.vectorizer.embed_query(query_text).await?;

        let (dense, sparse) = tokio::join!(
            self.with_retries("dense", || self.store.dense_search(&pair.dense, limit)),
            self.with_retries("sparse", || self.store.sparse_search(&pair.sparse, limit)),
        );

        let (dense, sparse) = match (dense, sparse) {
            (Err(dense), Err(sparse)) => return Err(RetrievalError { dense, sparse }.into()),
            (dense, sparse) => (dense, sparse),
        };

        let failed = [dense.is_err(), sparse.is_err()];
        let dense = into_candidates(dense, CandidateSource::Dense);
        let sparse = into_candidates(sparse, CandidateSource::Sparse);
        let mut degraded_sources = Vec::new();
        for (name, failed, list, other) in [
            ("dense", failed[0], &dense, &sparse),
            ("sparse", failed[1], &sparse, &dense),
        ] {
            if failed || (list.is_empty() && !other.is_empty()) {
                degraded_sources.push(name.to_string());
            }
        }

        let candidates = rrf_fuse(&[&dense, &sparse], self.settings.rrf_k, limit);
        debug!(
            dense = dense.len(),
            sparse = sparse.len(),
            fused = candidates.len(),
            "hybrid search complete"
        );

        Ok(RetrievalOutcome {
            candidates,
            degraded_sources,
        })
    }

    /// Run one source search with a per-attempt timeout and exponential
    /// backoff between attempts.
    async fn with_retries<F, Fut>(&self, source: &'static str, mut search: F) -> Result<Vec<StoreHit>, String>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Vec<StoreHit>, StoreError>>,
    {
        let mut last_err = String::new();
        for attempt in 0..=self.settings.max_retries {
            if attempt > 0 {
                let delay = self.settings.backoff * 2u32.saturating_pow(attempt - 1);
                debug!(source, attempt, ?delay, "retrying search");
                tokio::time::sleep(delay).await;
            }
            match tokio::time::timeout(self.settings.source_timeout, search()).await {
                Ok(Ok(hits)) => return Ok(hits),
                Ok(Err(e)) => last_err = e.to_string(),
                Err(_) => {
                    last_err = format!("timed out after {} ms", self.settings.source_timeout.as_millis())
                }
            }
        }
        warn!(source, error = %last_err, "search source failed, continuing without it");
        Err(last_err)
    }
}

fn into_candidates(hits: Result<Vec<StoreHit>, String>, source: CandidateSource) -> Vec<SearchCandidate> {
    hits.unwrap_or_default()
        .into_iter()
        .map(|h| h.into_candidate(source))
        .collect()
}
