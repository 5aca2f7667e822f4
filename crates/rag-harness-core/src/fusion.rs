//! Reciprocal Rank Fusion: score = Σ 1/(k + rank_i)
//!
//! Combines the dense and sparse ranked lists into one ranking without
//! normalizing their incompatible raw scores. Ranks are 1-based; a
//! candidate missing from a list simply gets no term from it.
//!
//! Ordering is fully deterministic: fused score descending, then best
//! (lowest) rank in any list, then chunk id ascending.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use crate::models::{CandidateSource, SearchCandidate};

pub const DEFAULT_RRF_K: u32 = 60;

struct Entry {
    candidate: SearchCandidate,
    score: f64,
    best_rank: usize,
}

/// Fuse ranked lists, keeping at most `limit` candidates.
///
/// The payload of a fused candidate comes from the first list it appears
/// in. Repeats of a chunk inside one list only count at their first rank.
pub fn rrf_fuse(lists: &[&[SearchCandidate]], k: u32, limit: usize) -> Vec<SearchCandidate> {
    let mut entries: HashMap<String, Entry> = HashMap::new();

    for list in lists {
        let mut seen: HashSet<&str> = HashSet::with_capacity(list.len());
        let mut rank = 0usize;
        for cand in list.iter() {
            if !seen.insert(cand.chunk_id.as_str()) {
                continue;
            }
            rank += 1;

            let rrf = 1.0 / (k as f64 + rank as f64);
            let entry = entries.entry(cand.chunk_id.clone()).or_insert_with(|| Entry {
                candidate: cand.clone(),
                score: 0.0,
                best_rank: rank,
            });
            entry.score += rrf;
            entry.best_rank = entry.best_rank.min(rank);
        }
    }

    let mut fused: Vec<Entry> = entries.into_values().collect();
    fused.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then(a.best_rank.cmp(&b.best_rank))
            .then_with(|| a.candidate.chunk_id.cmp(&b.candidate.chunk_id))
    });
    fused.truncate(limit);

    fused
        .into_iter()
        .map(|e| SearchCandidate {
            score: e.score,
            source: CandidateSource::Fused,
            ..e.candidate
        })
        .collect()
}
