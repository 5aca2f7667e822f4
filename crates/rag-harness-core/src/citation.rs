//! Post-generation citation checks.
//!
//! The answer is scanned for bracket references. Numeric markers (`[2]`,
//! `[1, 3]`) are matched against the citations handed to the generator;
//! textual references (`[Employee Handbook]`, or the text part of a
//! markdown link) are matched case-insensitively against source titles.
//! Anything that matches nothing is reported as invalid.

use std::collections::BTreeSet;

use serde::Serialize;

use crate::models::Citation;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CitationReport {
    /// Markers that were cited and exist, ascending.
    pub cited: Vec<usize>,
    /// References that match no provided source.
    pub invalid: Vec<String>,
    /// Provided markers the answer never referenced.
    pub uncited: Vec<usize>,
    /// `valid / total` references; `1.0` when nothing was cited.
    pub accuracy: f64,
}

impl CitationReport {
    pub fn has_invalid(&self) -> bool {
        !self.invalid.is_empty()
    }
}

pub fn check_citations(answer: &str, citations: &[Citation]) -> CitationReport {
    let mut cited: BTreeSet<usize> = BTreeSet::new();
    let mut invalid = Vec::new();
    let mut valid_refs = 0usize;

    for reference in bracket_refs(answer) {
        match parse_markers(reference) {
            Some(markers) => {
                for m in markers {
                    if citations.iter().any(|c| c.marker == m) {
                        cited.insert(m);
                        valid_refs += 1;
                    } else {
                        invalid.push(format!("[{}]", m));
                    }
                }
            }
            None => {
                let wanted = reference.trim().to_lowercase();
                match citations.iter().find(|c| c.title.trim().to_lowercase() == wanted) {
                    Some(c) => {
                        cited.insert(c.marker);
                        valid_refs += 1;
                    }
                    None => invalid.push(format!("[{}]", reference)),
                }
            }
        }
    }

    let total = valid_refs + invalid.len();
    let uncited = citations
        .iter()
        .map(|c| c.marker)
        .filter(|m| !cited.contains(m))
        .collect();

    CitationReport {
        cited: cited.into_iter().collect(),
        invalid,
        uncited,
        accuracy: if total == 0 {
            1.0
        } else {
            valid_refs as f64 / total as f64
        },
    }
}

/// Contents of `[...]` groups. Markdown link targets are skipped.
fn bracket_refs(text: &str) -> Vec<&str> {
    let mut refs = Vec::new();
    let mut rest = text;
    while let Some(open) = rest.find('[') {
        let after = &rest[open + 1..];
        let Some(close) = after.find(']') else { break };
        let inner = &after[..close];
        if inner.contains('[') {
            rest = &after[inner.rfind('[').unwrap_or(0)..];
            continue;
        }
        if !inner.trim().is_empty() {
            refs.push(inner);
        }
        rest = &after[close + 1..];
        if rest.starts_with('(') {
            rest = rest.find(')').map_or("", |i| &rest[i + 1..]);
        }
    }
    refs
}

/// `"1"`, `"1, 2"` or `"1,2"`; `None` if any part is not a number.
fn parse_markers(inner: &str) -> Option<Vec<usize>> {
    inner
        .split(',')
        .map(|p| p.trim().parse::<usize>().ok())
        .collect()
}
