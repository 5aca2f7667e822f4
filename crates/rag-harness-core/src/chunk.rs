//! Hierarchical parent/child text chunker.
//!
//! A document is split into overlapping parent spans, and every parent is
//! split again into overlapping child spans. Children are what get
//! vectorized and searched; parents supply the surrounding context when a
//! child matches.
//!
//! # Algorithm
//!
//! For a span `[pos, end)`:
//!
//! 1. If the rest fits in `max_chars`, emit it as the final chunk.
//! 2. Otherwise the break must land in `(pos + overlap, hard]`, where
//!    `hard = min(pos + max_chars, end - min_chars)`. Capping at
//!    `end - min_chars` means the last chunk always carries at least
//!    `min_chars` of new text instead of a dangling fragment.
//! 3. Try each separator in [`SEPARATORS`] in priority order, taking its
//!    last occurrence in the back half of the window; then anywhere in the
//!    window. With no separator at all, force-split at `hard`.
//! 4. The next chunk starts `overlap_chars` before the break, moved
//!    forward to the next word start when one exists.
//!
//! Sizes are measured in UTF-8 bytes and every offset is snapped to a char
//! boundary. Chunk ids are UUIDv5 over `(document_id, level, start, end)`,
//! so identical input always yields identical ids.

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::ValidationError;
use crate::models::{Chunk, ChunkLevel};

/// Break points, strongest first. The break lands after the separator.
pub const SEPARATORS: &[&str] = &["\n\n", "\n", ". ", "! ", "? ", "; ", ", ", " "];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSpec {
    pub max_chars: usize,
    pub overlap_chars: usize,
    pub min_chars: usize,
}

impl ChunkSpec {
    pub const PARENT: ChunkSpec = ChunkSpec {
        max_chars: 1400,
        overlap_chars: 200,
        min_chars: 100,
    };

    pub const CHILD: ChunkSpec = ChunkSpec {
        max_chars: 400,
        overlap_chars: 80,
        min_chars: 40,
    };

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.max_chars == 0 {
            return Err(ValidationError::ChunkSpec("max_chars must be > 0".into()));
        }
        if self.overlap_chars + self.min_chars >= self.max_chars {
            return Err(ValidationError::ChunkSpec(format!(
                "overlap_chars ({}) + min_chars ({}) must be < max_chars ({})",
                self.overlap_chars, self.min_chars, self.max_chars
            )));
        }
        Ok(())
    }
}

/// Output of [`chunk_document`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HierarchicalChunks {
    pub parents: Vec<Chunk>,
    /// All children, grouped by parent in parent order.
    pub children: Vec<Chunk>,
}

impl HierarchicalChunks {
    pub fn is_empty(&self) -> bool {
        self.parents.is_empty()
    }

    pub fn children_of<'a>(&'a self, parent_id: &'a str) -> impl Iterator<Item = &'a Chunk> + 'a {
        self.children
            .iter()
            .filter(move |c| c.parent_id.as_deref() == Some(parent_id))
    }
}

/// Split a document into parents and children.
///
/// Whitespace-only text yields no chunks. Chunk text is taken verbatim
/// from `text`, so [`stitch`] over a parent's children reproduces the
/// parent exactly.
pub fn chunk_document(
    document_id: &str,
    text: &str,
    parent: &ChunkSpec,
    child: &ChunkSpec,
) -> HierarchicalChunks {
    let mut out = HierarchicalChunks::default();
    if text.trim().is_empty() {
        return out;
    }

    for (p_start, p_end) in split_spans(text, 0, text.len(), parent) {
        let mut parent_chunk = make_chunk(document_id, text, p_start, p_end, ChunkLevel::Parent, None);
        for (c_start, c_end) in split_spans(text, p_start, p_end, child) {
            let child_chunk = make_chunk(
                document_id,
                text,
                c_start,
                c_end,
                ChunkLevel::Child,
                Some(parent_chunk.id.clone()),
            );
            parent_chunk.child_ids.push(child_chunk.id.clone());
            out.children.push(child_chunk);
        }
        out.parents.push(parent_chunk);
    }

    out
}

/// Compute `(start, end)` byte spans covering `text[start..end]`.
///
/// Spans are contiguous modulo overlap: each span starts at or before the
/// previous span's end, and the last span ends at `end`.
pub fn split_spans(text: &str, start: usize, end: usize, spec: &ChunkSpec) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    if start >= end {
        return spans;
    }

    let mut pos = start;
    loop {
        if end - pos <= spec.max_chars {
            spans.push((pos, end));
            break;
        }

        let hard = (pos + spec.max_chars).min(end.saturating_sub(spec.min_chars));
        let hard = floor_boundary(text, hard.max(pos));
        let brk = find_break(text, pos, hard, spec.overlap_chars);
        spans.push((pos, brk));

        let next = overlap_start(text, pos, brk, spec.overlap_chars);
        pos = if next > pos { next } else { brk };
    }

    spans
}

/// Reassemble consecutive chunks, counting each overlapped byte once.
pub fn stitch(chunks: &[Chunk]) -> String {
    let mut out = String::new();
    let mut covered: Option<usize> = None;
    for c in chunks {
        let skip = covered
            .map_or(0, |end| end.saturating_sub(c.start_offset))
            .min(c.text.len());
        out.push_str(&c.text[skip..]);
        covered = Some(c.end_offset);
    }
    out
}

fn find_break(text: &str, pos: usize, hard: usize, overlap: usize) -> usize {
    let floor = pos + overlap;

    if hard > floor {
        let back_half = ceil_boundary(text, (pos + (hard - pos) / 2).max(floor));
        for lo in [back_half, ceil_boundary(text, floor)] {
            if lo >= hard {
                continue;
            }
            let window = &text[lo..hard];
            for sep in SEPARATORS {
                if let Some(i) = window.rfind(sep) {
                    let brk = lo + i + sep.len();
                    if brk > floor {
                        return brk;
                    }
                }
            }
        }
    }

    // Forced split.
    if hard > pos {
        hard
    } else {
        next_boundary(text, pos)
    }
}

fn overlap_start(text: &str, pos: usize, brk: usize, overlap: usize) -> usize {
    if overlap == 0 {
        return brk;
    }
    let start = ceil_boundary(text, brk.saturating_sub(overlap).max(pos));
    if start >= brk {
        return brk;
    }
    // Prefer starting the overlap on a word.
    let region = &text[start..brk];
    match region.find(char::is_whitespace) {
        Some(i) => {
            let ws_len = region[i..].chars().next().map_or(1, char::len_utf8);
            let word = start + i + ws_len;
            if word < brk {
                word
            } else {
                start
            }
        }
        None => start,
    }
}

fn floor_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut i = index;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

fn ceil_boundary(s: &str, index: usize) -> usize {
    let mut i = index.min(s.len());
    while i < s.len() && !s.is_char_boundary(i) {
        i += 1;
    }
    i
}

fn next_boundary(s: &str, pos: usize) -> usize {
    s[pos..]
        .chars()
        .next()
        .map_or(s.len(), |c| pos + c.len_utf8())
}

/// Deterministic chunk id for a span.
pub fn chunk_id(document_id: &str, level: ChunkLevel, start: usize, end: usize) -> String {
    let name = format!("{}:{}:{}:{}", document_id, level.as_str(), start, end);
    Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()).to_string()
}

fn make_chunk(
    document_id: &str,
    text: &str,
    start: usize,
    end: usize,
    level: ChunkLevel,
    parent_id: Option<String>,
) -> Chunk {
    let span = &text[start..end];
    let mut hasher = Sha256::new();
    hasher.update(span.as_bytes());
    let hash = format!("{:x}", hasher.finalize());

    Chunk {
        id: chunk_id(document_id, level, start, end),
        document_id: document_id.to_string(),
        parent_id,
        text: span.to_string(),
        start_offset: start,
        end_offset: end,
        level,
        child_ids: Vec::new(),
        hash,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> (ChunkSpec, ChunkSpec) {
        (
            ChunkSpec {
                max_chars: 200,
                overlap_chars: 40,
                min_chars: 20,
            },
            ChunkSpec {
                max_chars: 60,
                overlap_chars: 12,
                min_chars: 8,
            },
        )
    }

    fn sentences(n: usize) -> String {
        (0..n)
            .map(|i| format!("Sentence number {} talks about topic {}.", i, i % 7))
            .collect::<Vec<_>>()
            .join(" ")
    }

    #[test]
    fn test_small_text_single_parent_single_child() {
        let (p, c) = small();
        let out = chunk_document("doc1", "Hello, world!", &p, &c);
        assert_eq!(out.parents.len(), 1);
        assert_eq!(out.children.len(), 1);
        assert_eq!(out.parents[0].text, "Hello, world!");
        assert_eq!(out.children[0].parent_id.as_deref(), Some(out.parents[0].id.as_str()));
        assert_eq!(out.parents[0].child_ids, vec![out.children[0].id.clone()]);
        assert_ne!(out.parents[0].id, out.children[0].id);
    }

    #[test]
    fn test_whitespace_only_yields_nothing() {
        let (p, c) = small();
        assert!(chunk_document("doc1", "", &p, &c).is_empty());
        assert!(chunk_document("doc1", "  \n\n\t ", &p, &c).is_empty());
    }

    #[test]
    fn test_spans_never_exceed_max() {
        let (p, c) = small();
        let text = sentences(60);
        let out = chunk_document("doc1", &text, &p, &c);
        assert!(out.parents.len() > 1);
        for ch in &out.parents {
            assert!(ch.text.len() <= p.max_chars, "parent too long: {}", ch.text.len());
        }
        for ch in &out.children {
            assert!(ch.text.len() <= c.max_chars, "child too long: {}", ch.text.len());
        }
    }

    #[test]
    fn test_prefers_sentence_boundaries() {
        let (_, c) = small();
        let text = sentences(10);
        let spans = split_spans(&text, 0, text.len(), &c);
        for (_, end) in &spans[..spans.len() - 1] {
            let before = &text[..*end];
            assert!(before.ends_with(". ") || before.ends_with(' '), "bad break: {:?}", before);
        }
    }

    #[test]
    fn test_paragraph_break_wins_over_sentence_break() {
        let spec = ChunkSpec {
            max_chars: 50,
            overlap_chars: 0,
            min_chars: 5,
        };
        let text = "First part of the text is here.\n\nSecond. Third sentence runs on and on.";
        let spans = split_spans(text, 0, text.len(), &spec);
        assert_eq!(&text[spans[0].0..spans[0].1], "First part of the text is here.\n\n");
    }

    #[test]
    fn test_force_split_without_separators() {
        let spec = ChunkSpec {
            max_chars: 100,
            overlap_chars: 10,
            min_chars: 5,
        };
        let text = "a".repeat(1000);
        let spans = split_spans(&text, 0, text.len(), &spec);
        assert!(spans.len() >= 10);
        for (s, e) in &spans {
            assert!(e - s <= 100);
        }
        assert_eq!(spans.last().map(|s| s.1), Some(text.len()));
    }

    #[test]
    fn test_final_chunk_absorbs_short_remainder() {
        let spec = ChunkSpec {
            max_chars: 100,
            overlap_chars: 0,
            min_chars: 30,
        };
        let text = "word ".repeat(24);
        let spans = split_spans(&text, 0, text.len(), &spec);
        let last = spans[spans.len() - 1];
        let prev = spans[spans.len() - 2];
        assert!(last.1 - prev.1 >= 30);
    }

    #[test]
    fn test_overlap_bounded() {
        let (_, c) = small();
        let text = sentences(20);
        let spans = split_spans(&text, 0, text.len(), &c);
        for pair in spans.windows(2) {
            let overlap = pair[0].1.saturating_sub(pair[1].0);
            assert!(overlap <= c.overlap_chars);
            assert!(pair[1].0 > pair[0].0);
        }
    }

    #[test]
    fn test_children_stitch_to_parent() {
        let (p, c) = small();
        let text = format!("{}\n\n{}", sentences(15), sentences(9));
        let out = chunk_document("doc1", &text, &p, &c);
        for parent in &out.parents {
            let kids: Vec<Chunk> = out.children_of(&parent.id).cloned().collect();
            assert_eq!(stitch(&kids), parent.text);
        }
        assert_eq!(stitch(&out.parents), text);
    }

    #[test]
    fn test_deterministic_ids() {
        let (p, c) = small();
        let text = sentences(30);
        let a = chunk_document("doc1", &text, &p, &c);
        let b = chunk_document("doc1", &text, &p, &c);
        assert_eq!(a, b);
        let other = chunk_document("doc2", &text, &p, &c);
        assert_ne!(a.parents[0].id, other.parents[0].id);
    }

    #[test]
    fn test_multibyte_utf8() {
        let spec = ChunkSpec {
            max_chars: 16,
            overlap_chars: 3,
            min_chars: 2,
        };
        let text = "┌──────────────────┐\n│ Hello world      │\n└──────────────────┘";
        let spans = split_spans(text, 0, text.len(), &spec);
        for (s, e) in &spans {
            assert!(text.is_char_boundary(*s) && text.is_char_boundary(*e));
        }
        assert_eq!(spans.last().map(|s| s.1), Some(text.len()));
    }

    #[test]
    fn test_validate() {
        assert!(ChunkSpec::PARENT.validate().is_ok());
        assert!(ChunkSpec::CHILD.validate().is_ok());
        let bad = ChunkSpec {
            max_chars: 50,
            overlap_chars: 40,
            min_chars: 10,
        };
        assert!(bad.validate().is_err());
    }
}
