//! Cross-encoder reranking with explicit fallback.
//!
//! A [`RerankBackend`] scores every `(query, passage)` pair in one batched
//! call. [`Reranker`] turns those scores into a stable top-n ordering, and
//! when the backend is missing or fails it returns the first `top_n` fused
//! candidates unchanged with `reranked = false`.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;

use crate::embedding::tokenize;
use crate::error::RerankError;
use crate::models::{CandidateSource, SearchCandidate};

#[async_trait]
pub trait RerankBackend: Send + Sync {
    fn name(&self) -> &str;

    /// One relevance score per passage, in passage order. Higher is better.
    async fn score(&self, query: &str, passages: &[String]) -> Result<Vec<f64>, RerankError>;
}

#[derive(Debug)]
pub struct RerankOutcome {
    pub candidates: Vec<SearchCandidate>,
    pub reranked: bool,
    /// Set when the backend failed and the fallback order was used.
    pub error: Option<RerankError>,
}

#[derive(Clone, Default)]
pub struct Reranker {
    backend: Option<Arc<dyn RerankBackend>>,
}

impl Reranker {
    pub fn new(backend: Arc<dyn RerankBackend>) -> Self {
        Self {
            backend: Some(backend),
        }
    }

    pub fn disabled() -> Self {
        Self { backend: None }
    }

    pub fn backend_name(&self) -> &str {
        self.backend.as_ref().map_or("disabled", |b| b.name())
    }

    /// Rerank `candidates` against the raw user question.
    pub async fn rerank(&self, query: &str, candidates: Vec<SearchCandidate>, top_n: usize) -> RerankOutcome {
        let Some(backend) = &self.backend else {
            return RerankOutcome {
                candidates: fallback(candidates, top_n),
                reranked: false,
                error: None,
            };
        };
        if candidates.is_empty() {
            return RerankOutcome {
                candidates,
                reranked: true,
                error: None,
            };
        }

        let passages: Vec<String> = candidates.iter().map(|c| c.text.clone()).collect();
        let result = backend
            .score(query, &passages)
            .await
            .and_then(|scores| order_by_scores(candidates.clone(), &scores, top_n));

        match result {
            Ok(ordered) => RerankOutcome {
                candidates: ordered,
                reranked: true,
                error: None,
            },
            Err(err) => RerankOutcome {
                candidates: fallback(candidates, top_n),
                reranked: false,
                error: Some(err),
            },
        }
    }
}

/// Sort by descending score; ties keep the incoming (fused) order.
pub fn order_by_scores(
    candidates: Vec<SearchCandidate>,
    scores: &[f64],
    top_n: usize,
) -> Result<Vec<SearchCandidate>, RerankError> {
    if scores.len() != candidates.len() {
        return Err(RerankError::ScoreCount {
            expected: candidates.len(),
            got: scores.len(),
        });
    }
    if scores.iter().any(|s| s.is_nan()) {
        return Err(RerankError::Malformed("NaN score".into()));
    }

    let mut scored: Vec<(f64, SearchCandidate)> = scores.iter().copied().zip(candidates).collect();
    // sort_by is stable
    scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(Ordering::Equal));
    scored.truncate(top_n);

    Ok(scored
        .into_iter()
        .map(|(score, c)| SearchCandidate {
            score,
            source: CandidateSource::Reranked,
            ..c
        })
        .collect())
}

/// First `top_n` candidates, untouched.
pub fn fallback(mut candidates: Vec<SearchCandidate>, top_n: usize) -> Vec<SearchCandidate> {
    candidates.truncate(top_n);
    candidates
}

/// Offline scorer: query-term coverage plus an adjacent-pair bonus.
#[derive(Debug, Clone, Copy, Default)]
pub struct LexicalReranker;

impl LexicalReranker {
    pub fn score_one(query: &str, passage: &str) -> f64 {
        let q = tokenize(query);
        if q.is_empty() {
            return 0.0;
        }
        let p = tokenize(passage);
        let vocab: HashSet<&str> = p.iter().map(String::as_str).collect();
        let distinct: HashSet<&str> = q.iter().map(String::as_str).collect();
        let covered = distinct.iter().filter(|t| vocab.contains(*t)).count();
        let coverage = covered as f64 / distinct.len() as f64;

        let pairs: HashSet<(&str, &str)> = p.windows(2).map(|w| (w[0].as_str(), w[1].as_str())).collect();
        let q_pairs = q.windows(2).count();
        let adjacent = if q_pairs == 0 {
            0.0
        } else {
            q.windows(2)
                .filter(|w| pairs.contains(&(w[0].as_str(), w[1].as_str())))
                .count() as f64
                / q_pairs as f64
        };

        coverage + 0.5 * adjacent
    }
}

#[async_trait]
impl RerankBackend for LexicalReranker {
    fn name(&self) -> &str {
        "lexical"
    }

    async fn score(&self, query: &str, passages: &[String]) -> Result<Vec<f64>, RerankError> {
        Ok(passages.iter().map(|p| Self::score_one(query, p)).collect())
    }
}
