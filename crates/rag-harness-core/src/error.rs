//! Error taxonomy for the query and ingestion paths.
//!
//! Each failure class has its own type so callers can decide whether to
//! reject, degrade, or fail. [`RagError`] aggregates them for code that
//! only needs to propagate.

/// Rejected before any backend call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("query is empty")]
    EmptyQuery,

    #[error("query is {len} chars, limit is {max}")]
    QueryTooLong { len: usize, max: usize },

    #[error("invalid chunk spec: {0}")]
    ChunkSpec(String),

    #[error("invalid context budget: {0}")]
    Budget(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EmbeddingError {
    #[error("embedding backend unavailable: {0}")]
    Unavailable(String),

    #[error("invalid embedding input: {0}")]
    InvalidInput(String),

    #[error("malformed embedding response: {0}")]
    Malformed(String),

    #[error("index was built with '{indexed}' but the vectorizer is '{configured}'")]
    ModelMismatch { indexed: String, configured: String },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("vector store unavailable: {0}")]
    Unavailable(String),

    #[error("vector store query failed: {0}")]
    Query(String),

    #[error("vector store write failed: {0}")]
    Write(String),
}

/// Both search sources failed for one query.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("retrieval failed: dense: {dense}; sparse: {sparse}")]
pub struct RetrievalError {
    pub dense: String,
    pub sparse: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RerankError {
    #[error("rerank backend unavailable: {0}")]
    Unavailable(String),

    #[error("rerank backend returned {got} scores for {expected} candidates")]
    ScoreCount { expected: usize, got: usize },

    #[error("malformed rerank response: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GenerationError {
    #[error("generation timed out after {0} ms")]
    Timeout(u64),

    #[error("generation stream interrupted: {0}")]
    Interrupted(String),

    #[error("generation backend returned {status}: {body}")]
    Backend { status: u16, body: String },

    #[error("generation backend unreachable: {0}")]
    Connect(String),
}

#[derive(Debug, thiserror::Error)]
pub enum RagError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Embedding(#[from] EmbeddingError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Retrieval(#[from] RetrievalError),

    #[error(transparent)]
    Rerank(#[from] RerankError),

    #[error(transparent)]
    Generation(#[from] GenerationError),
}

impl RagError {
    /// Short machine-readable class name, used in error events.
    pub fn code(&self) -> &'static str {
        match self {
            RagError::Validation(_) => "validation",
            RagError::Embedding(_) => "embedding",
            RagError::Store(_) => "store",
            RagError::Retrieval(_) => "retrieval",
            RagError::Rerank(_) => "rerank",
            RagError::Generation(_) => "generation",
        }
    }
}

pub type Result<T> = std::result::Result<T, RagError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes() {
        let err: RagError = ValidationError::EmptyQuery.into();
        assert_eq!(err.code(), "validation");
        let err: RagError = RetrievalError {
            dense: "timeout".into(),
            sparse: "timeout".into(),
        }
        .into();
        assert_eq!(err.code(), "retrieval");
        assert!(err.to_string().contains("dense: timeout"));
    }

    #[test]
    fn test_model_mismatch_message() {
        let err = EmbeddingError::ModelMismatch {
            indexed: "openai:a:3".into(),
            configured: "hashing:b:3".into(),
        };
        assert!(err.to_string().contains("openai:a:3"));
    }
}
