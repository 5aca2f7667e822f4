//! Context window assembly with citation markers.
//!
//! # Algorithm
//!
//! 1. Walk reranked candidates in rank order, keeping each while its
//!    rendered passage fits `max_context_chars`. The first one that does
//!    not fit ends the walk, so the lowest-ranked candidates are the ones
//!    dropped. Passages are never cut.
//! 2. Walk the kept passages again in rank order. A child whose parent is
//!    known is widened to the parent text when the extra characters fit;
//!    later siblings of that parent are then redundant and removed. A
//!    sibling of an already widened parent is removed outright.
//! 3. Number the surviving passages `[1]..[n]` and emit one [`Citation`]
//!    per passage.
//!
//! History has its own, smaller budget. Turns are taken newest first and
//! returned in chronological order.

use std::collections::{HashMap, HashSet};

use serde::Serialize;

use crate::error::ValidationError;
use crate::models::{Chunk, Citation, ConversationTurn, SearchCandidate};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextBudget {
    pub max_context_chars: usize,
    pub max_history_chars: usize,
}

impl Default for ContextBudget {
    fn default() -> Self {
        Self {
            max_context_chars: 6000,
            max_history_chars: 1500,
        }
    }
}

impl ContextBudget {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.max_context_chars == 0 {
            return Err(ValidationError::Budget("max_context_chars must be > 0".into()));
        }
        if self.max_history_chars >= self.max_context_chars {
            return Err(ValidationError::Budget(format!(
                "max_history_chars ({}) must be smaller than max_context_chars ({})",
                self.max_history_chars, self.max_context_chars
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContextPassage {
    pub marker: usize,
    /// The matched chunk, even when `text` is its parent's.
    pub chunk_id: String,
    pub document_id: String,
    pub title: String,
    pub text: String,
    pub widened: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AssembledContext {
    pub passages: Vec<ContextPassage>,
    pub citations: Vec<Citation>,
    pub history: Vec<ConversationTurn>,
    /// Candidates that did not make it into the context.
    pub dropped: usize,
}

impl AssembledContext {
    pub fn is_empty(&self) -> bool {
        self.passages.is_empty()
    }

    /// Numbered source blocks, as placed in the prompt.
    pub fn render(&self) -> String {
        self.passages
            .iter()
            .map(|p| render_passage(p.marker, &p.title, &p.text))
            .collect()
    }

    pub fn context_chars(&self) -> usize {
        self.render().len()
    }
}

fn render_passage(marker: usize, title: &str, text: &str) -> String {
    format!("[{}] {}\n{}\n\n", marker, title, text)
}

// Markers are at most a few digits; reserve a fixed width so costs do not
// shift when passages are renumbered.
fn cost(title: &str, text: &str) -> usize {
    render_passage(0, title, text).len() + 3
}

struct Slot<'a> {
    cand: &'a SearchCandidate,
    text: &'a str,
    widened_parent: Option<&'a str>,
    cost: usize,
}

/// Build the context for one query.
///
/// `parents` maps parent chunk id to the parent chunk; candidates whose
/// parent is absent stay at child granularity.
pub fn assemble(
    candidates: &[SearchCandidate],
    parents: &HashMap<String, Chunk>,
    history: &[ConversationTurn],
    budget: &ContextBudget,
) -> AssembledContext {
    let mut used = 0usize;
    let mut slots: Vec<Option<Slot>> = Vec::new();
    for cand in candidates {
        let c = cost(&cand.title, &cand.text);
        if used + c > budget.max_context_chars {
            break;
        }
        used += c;
        slots.push(Some(Slot {
            cand,
            text: &cand.text,
            widened_parent: None,
            cost: c,
        }));
    }

    let mut widened: HashSet<&str> = HashSet::new();
    for i in 0..slots.len() {
        let (cand, own_cost) = match &slots[i] {
            Some(s) => (s.cand, s.cost),
            None => continue,
        };
        let Some(parent_id) = cand.parent_id.as_deref() else {
            continue;
        };
        if widened.contains(parent_id) {
            used -= own_cost;
            slots[i] = None;
            continue;
        }
        let Some(parent) = parents.get(parent_id) else {
            continue;
        };

        let later_siblings: Vec<usize> = (i + 1..slots.len())
            .filter(|j| {
                slots[*j]
                    .as_ref()
                    .is_some_and(|s| s.cand.parent_id.as_deref() == Some(parent_id))
            })
            .collect();
        let freed: usize = own_cost
            + later_siblings
                .iter()
                .filter_map(|j| slots[*j].as_ref().map(|s| s.cost))
                .sum::<usize>();
        let parent_cost = cost(&cand.title, &parent.text);

        if used - freed + parent_cost <= budget.max_context_chars {
            used = used - freed + parent_cost;
            for j in later_siblings {
                slots[j] = None;
            }
            if let Some(slot) = slots[i].as_mut() {
                slot.text = &parent.text;
                slot.widened_parent = Some(parent_id);
                slot.cost = parent_cost;
            }
            widened.insert(parent_id);
        }
    }

    let kept: Vec<Slot> = slots.into_iter().flatten().collect();
    let dropped = candidates.len() - kept.len();
    let passages: Vec<ContextPassage> = kept
        .into_iter()
        .enumerate()
        .map(|(i, s)| ContextPassage {
            marker: i + 1,
            chunk_id: s.cand.chunk_id.clone(),
            document_id: s.cand.document_id.clone(),
            title: s.cand.title.clone(),
            text: s.text.to_string(),
            widened: s.widened_parent.is_some(),
        })
        .collect();
    let citations = passages
        .iter()
        .map(|p| Citation {
            marker: p.marker,
            chunk_id: p.chunk_id.clone(),
            document_id: p.document_id.clone(),
            title: p.title.clone(),
        })
        .collect();

    AssembledContext {
        passages,
        citations,
        history: select_history(history, budget.max_history_chars),
        dropped,
    }
}

/// Newest turns that fit `max_chars`, oldest first.
pub fn select_history(history: &[ConversationTurn], max_chars: usize) -> Vec<ConversationTurn> {
    let mut used = 0usize;
    let mut picked: Vec<ConversationTurn> = Vec::new();
    for turn in history.iter().rev() {
        let c = turn.role.as_str().len() + 2 + turn.text.len();
        if used + c > max_chars {
            break;
        }
        used += c;
        picked.push(turn.clone());
    }
    picked.reverse();
    picked
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CandidateSource, ChunkLevel, Role};

    fn cand(id: &str, parent: Option<&str>, text: &str) -> SearchCandidate {
        SearchCandidate {
            chunk_id: id.to_string(),
            document_id: "doc".to_string(),
            parent_id: parent.map(str::to_string),
            score: 1.0,
            source: CandidateSource::Reranked,
            text: text.to_string(),
            title: "T".to_string(),
        }
    }

    fn parent(id: &str, text: &str) -> Chunk {
        Chunk {
            id: id.to_string(),
            document_id: "doc".to_string(),
            parent_id: None,
            text: text.to_string(),
            start_offset: 0,
            end_offset: text.len(),
            level: ChunkLevel::Parent,
            child_ids: Vec::new(),
            hash: String::new(),
        }
    }

    fn turn(role: Role, text: &str) -> ConversationTurn {
        ConversationTurn {
            role,
            text: text.to_string(),
        }
    }

    #[test]
    fn test_markers_and_citations() {
        let cands = vec![cand("a", None, "alpha"), cand("b", None, "beta")];
        let ctx = assemble(&cands, &HashMap::new(), &[], &ContextBudget::default());
        assert_eq!(ctx.passages.len(), 2);
        assert_eq!(ctx.citations[0].marker, 1);
        assert_eq!(ctx.citations[1].chunk_id, "b");
        assert!(ctx.render().starts_with("[1] T\nalpha\n\n[2] T\nbeta"));
    }

    #[test]
    fn test_drops_lowest_ranked_never_truncates() {
        let cands = vec![
            cand("a", None, &"x".repeat(40)),
            cand("b", None, &"y".repeat(40)),
            cand("c", None, &"z".repeat(40)),
        ];
        let budget = ContextBudget {
            max_context_chars: 110,
            max_history_chars: 10,
        };
        let ctx = assemble(&cands, &HashMap::new(), &[], &budget);
        let ids: Vec<_> = ctx.passages.iter().map(|p| p.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(ctx.dropped, 1);
        assert!(ctx.passages.iter().all(|p| p.text.len() == 40));
    }

    #[test]
    fn test_widens_to_parent_and_drops_siblings() {
        let cands = vec![
            cand("c1", Some("p1"), "child one"),
            cand("x", None, "other"),
            cand("c2", Some("p1"), "child two"),
        ];
        let mut parents = HashMap::new();
        parents.insert("p1".to_string(), parent("p1", "intro. child one. child two. outro."));
        let ctx = assemble(&cands, &parents, &[], &ContextBudget::default());
        let ids: Vec<_> = ctx.passages.iter().map(|p| p.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["c1", "x"]);
        assert!(ctx.passages[0].widened);
        assert_eq!(ctx.passages[0].text, "intro. child one. child two. outro.");
        assert_eq!(ctx.passages[1].marker, 2);
    }

    #[test]
    fn test_keeps_child_when_parent_too_large() {
        let cands = vec![cand("c1", Some("p1"), "child")];
        let mut parents = HashMap::new();
        parents.insert("p1".to_string(), parent("p1", &"w".repeat(500)));
        let budget = ContextBudget {
            max_context_chars: 100,
            max_history_chars: 10,
        };
        let ctx = assemble(&cands, &parents, &[], &budget);
        assert!(!ctx.passages[0].widened);
        assert_eq!(ctx.passages[0].text, "child");
    }

    #[test]
    fn test_history_newest_first_chronological_output() {
        let history = vec![
            turn(Role::User, &"old question ".repeat(5)),
            turn(Role::Assistant, "old answer"),
            turn(Role::User, "recent question"),
        ];
        let picked = select_history(&history, 50);
        let texts: Vec<_> = picked.iter().map(|t| t.text.as_str()).collect();
        assert_eq!(texts, vec!["old answer", "recent question"]);
    }

    #[test]
    fn test_budget_validation() {
        assert!(ContextBudget::default().validate().is_ok());
        let bad = ContextBudget {
            max_context_chars: 100,
            max_history_chars: 100,
        };
        assert!(bad.validate().is_err());
    }
}
