//! Evidence filtering between reranking and context assembly.
//!
//! A [`SupportJudge`] picks the passages that directly support an answer
//! to the question. [`SupportFilter`] keeps exactly those, in their
//! incoming order. When the judge picks nothing, picks only unknown
//! passages, or fails, every candidate is kept and `filtered` is false.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::RerankError;
use crate::models::SearchCandidate;

#[async_trait]
pub trait SupportJudge: Send + Sync {
    fn name(&self) -> &str;

    /// Zero-based indices of the supporting passages. Order and repeats
    /// don't matter; out-of-range indices are ignored.
    async fn supported(&self, query: &str, passages: &[String]) -> Result<Vec<usize>, RerankError>;
}

#[derive(Debug)]
pub struct SupportOutcome {
    pub candidates: Vec<SearchCandidate>,
    /// The judge's pick was applied.
    pub filtered: bool,
    pub error: Option<RerankError>,
}

impl SupportOutcome {
    fn unfiltered(candidates: Vec<SearchCandidate>, error: Option<RerankError>) -> Self {
        Self {
            candidates,
            filtered: false,
            error,
        }
    }
}

#[derive(Clone, Default)]
pub struct SupportFilter {
    judge: Option<Arc<dyn SupportJudge>>,
}

impl SupportFilter {
    pub fn new(judge: Arc<dyn SupportJudge>) -> Self {
        Self { judge: Some(judge) }
    }

    pub fn disabled() -> Self {
        Self { judge: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.judge.is_some()
    }

    pub fn judge_name(&self) -> &str {
        self.judge.as_ref().map_or("disabled", |j| j.name())
    }

    pub async fn filter(&self, query: &str, candidates: Vec<SearchCandidate>) -> SupportOutcome {
        let Some(judge) = &self.judge else {
            return SupportOutcome::unfiltered(candidates, None);
        };
        if candidates.is_empty() {
            return SupportOutcome::unfiltered(candidates, None);
        }

        let passages: Vec<String> = candidates.iter().map(|c| c.text.clone()).collect();
        let keep: HashSet<usize> = match judge.supported(query, &passages).await {
            Ok(indices) => indices.into_iter().filter(|i| *i < candidates.len()).collect(),
            Err(err) => return SupportOutcome::unfiltered(candidates, Some(err)),
        };
        if keep.is_empty() {
            return SupportOutcome::unfiltered(candidates, None);
        }

        SupportOutcome {
            candidates: candidates
                .into_iter()
                .enumerate()
                .filter(|(i, _)| keep.contains(i))
                .map(|(_, c)| c)
                .collect(),
            filtered: true,
            error: None,
        }
    }
}
