//! Core data models shared by the ingestion and query paths.
//!
//! [`Document`], [`Chunk`] and [`EmbeddingPair`] are created at ingestion
//! time and never mutated afterwards. [`SearchCandidate`] and [`Citation`]
//! live for a single query.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Input document handed over by a connector. Treated as read-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub title: String,
    pub text: String,
    /// Unix seconds.
    pub source_timestamp: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkLevel {
    Parent,
    Child,
}

impl ChunkLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkLevel::Parent => "parent",
            ChunkLevel::Child => "child",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "parent" => Some(ChunkLevel::Parent),
            "child" => Some(ChunkLevel::Child),
            _ => None,
        }
    }
}

/// A span of a document's text.
///
/// Offsets are byte offsets into [`Document::text`], always on UTF-8 char
/// boundaries. A child has exactly one `parent_id`; a parent lists its
/// children in order in `child_ids`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub parent_id: Option<String>,
    pub text: String,
    pub start_offset: usize,
    pub end_offset: usize,
    pub level: ChunkLevel,
    pub child_ids: Vec<String>,
    /// SHA-256 of `text`, hex encoded.
    pub hash: String,
}

/// Term index to non-negative weight. Ordered so serialization is stable.
pub type SparseVector = BTreeMap<u32, f32>;

/// Dense and sparse representation of one text span.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingPair {
    pub dense: Vec<f32>,
    pub sparse: SparseVector,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CandidateSource {
    Dense,
    Sparse,
    Fused,
    Reranked,
}

/// A chunk surfaced by one query. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchCandidate {
    pub chunk_id: String,
    pub document_id: String,
    pub parent_id: Option<String>,
    pub score: f64,
    pub source: CandidateSource,
    pub text: String,
    pub title: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: Role,
    pub text: String,
}

/// Links a `[marker]` in the generated answer back to its chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Citation {
    pub marker: usize,
    pub chunk_id: String,
    pub document_id: String,
    pub title: String,
}
