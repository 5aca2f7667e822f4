//! Vectorizer: dense embedder trait, sparse term encoder, and vector math.
//!
//! A [`Vectorizer`] pairs one [`DenseEmbedder`] with one [`SparseEncoder`]
//! and is built once per process. Ingestion and querying share the same
//! handle, and its [`fingerprint`](Vectorizer::fingerprint) is recorded in
//! the index so a store built with one model cannot be queried with another.
//!
//! Network-backed embedders (OpenAI, Ollama, fastembed) live in the
//! `rag-harness` app crate. [`HashingEmbedder`] is a deterministic offline
//! embedder used for tests and air-gapped setups.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::EmbeddingError;
use crate::models::{EmbeddingPair, SparseVector};

/// Dense embedding backend.
#[async_trait]
pub trait DenseEmbedder: Send + Sync {
    /// Provider family, e.g. `"openai"` or `"hashing"`.
    fn provider(&self) -> &str;
    /// Returns the model identifier (e.g. `"text-embedding-3-small"`).
    fn model_name(&self) -> &str;
    /// Returns the embedding vector dimensionality (e.g. `1536`).
    fn dims(&self) -> usize;
    /// Embed a batch. Output order matches input order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError>;
}

/// BM25 term-frequency saturation parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SparseParams {
    pub k1: f32,
    pub b: f32,
    /// Expected document length in tokens.
    pub avg_doc_len: f32,
}

impl Default for SparseParams {
    fn default() -> Self {
        Self {
            k1: 1.2,
            b: 0.75,
            avg_doc_len: 60.0,
        }
    }
}

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "do", "does", "for", "from", "how", "i",
    "in", "is", "it", "my", "of", "on", "or", "our", "that", "the", "this", "to", "was", "we",
    "what", "when", "where", "which", "who", "why", "with", "you", "your",
];

/// Lowercased alphanumeric tokens with stop words removed.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .filter(|t| !STOPWORDS.contains(&t.as_str()))
        .collect()
}

/// 32-bit FNV-1a. Stable across platforms and releases.
pub fn fnv1a(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for b in bytes {
        hash ^= u32::from(*b);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

/// Keyword-side encoder.
///
/// Documents get BM25 saturated term frequencies; queries get weight `1.0`
/// per distinct term. IDF is applied by the store at search time, since
/// only the store knows corpus statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SparseEncoder {
    pub params: SparseParams,
}

impl SparseEncoder {
    pub fn new(params: SparseParams) -> Self {
        Self { params }
    }

    pub fn term_index(term: &str) -> u32 {
        fnv1a(term.as_bytes())
    }

    pub fn encode_document(&self, text: &str) -> SparseVector {
        let tokens = tokenize(text);
        if tokens.is_empty() {
            return SparseVector::new();
        }
        let mut tf: BTreeMap<u32, f32> = BTreeMap::new();
        for t in &tokens {
            *tf.entry(Self::term_index(t)).or_insert(0.0) += 1.0;
        }
        let SparseParams { k1, b, avg_doc_len } = self.params;
        let len_norm = 1.0 - b + b * (tokens.len() as f32 / avg_doc_len.max(1.0));
        tf.into_iter()
            .map(|(idx, f)| (idx, f * (k1 + 1.0) / (f + k1 * len_norm)))
            .collect()
    }

    pub fn encode_query(&self, text: &str) -> SparseVector {
        tokenize(text)
            .iter()
            .map(|t| (Self::term_index(t), 1.0))
            .collect()
    }
}

/// Shared dense + sparse vectorizer handle.
///
/// Cheap to clone; every clone embeds with the same model.
#[derive(Clone)]
pub struct Vectorizer {
    dense: Arc<dyn DenseEmbedder>,
    sparse: SparseEncoder,
}

impl std::fmt::Debug for Vectorizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vectorizer")
            .field("fingerprint", &self.fingerprint())
            .finish()
    }
}

impl Vectorizer {
    pub fn new(dense: Arc<dyn DenseEmbedder>, sparse: SparseEncoder) -> Self {
        Self { dense, sparse }
    }

    /// `provider:model:dims:k1:b:avg_doc_len`.
    pub fn fingerprint(&self) -> String {
        let p = self.sparse.params;
        format!(
            "{}:{}:{}:{}:{}:{}",
            self.dense.provider(),
            self.dense.model_name(),
            self.dense.dims(),
            p.k1,
            p.b,
            p.avg_doc_len
        )
    }

    pub fn dims(&self) -> usize {
        self.dense.dims()
    }

    /// Embed a query. Sparse side uses query weighting.
    pub async fn embed_query(&self, text: &str) -> Result<EmbeddingPair, EmbeddingError> {
        let mut dense = self.dense_batch(&[text.to_string()]).await?;
        let dense = dense
            .pop()
            .ok_or_else(|| EmbeddingError::Malformed("empty response".into()))?;
        Ok(EmbeddingPair {
            dense,
            sparse: self.sparse.encode_query(text),
        })
    }

    /// Embed document spans. Either every text is embedded or the call fails.
    pub async fn embed_documents(&self, texts: &[String]) -> Result<Vec<EmbeddingPair>, EmbeddingError> {
        let dense = self.dense_batch(texts).await?;
        Ok(dense
            .into_iter()
            .zip(texts)
            .map(|(dense, text)| EmbeddingPair {
                dense,
                sparse: self.sparse.encode_document(text),
            })
            .collect())
    }

    async fn dense_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if let Some(i) = texts.iter().position(|t| t.trim().is_empty()) {
            return Err(EmbeddingError::InvalidInput(format!("text {} is empty", i)));
        }
        let vectors = self.dense.embed_batch(texts).await?;
        if vectors.len() != texts.len() {
            return Err(EmbeddingError::Malformed(format!(
                "expected {} vectors, got {}",
                texts.len(),
                vectors.len()
            )));
        }
        let dims = self.dense.dims();
        for v in &vectors {
            if v.len() != dims {
                return Err(EmbeddingError::Malformed(format!(
                    "expected {} dims, got {}",
                    dims,
                    v.len()
                )));
            }
            if v.iter().any(|x| !x.is_finite()) || v.iter().all(|x| *x == 0.0) {
                return Err(EmbeddingError::Malformed("degenerate vector".into()));
            }
        }
        Ok(vectors)
    }
}

/// Deterministic feature-hashing embedder.
///
/// Word tokens and character trigrams are hashed into `dims` buckets with a
/// sign bit, then L2-normalized. Texts sharing vocabulary land close
/// together, which is enough for offline use and tests.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dims: usize,
    model: String,
}

impl HashingEmbedder {
    pub fn new(dims: usize) -> Self {
        Self {
            dims,
            model: format!("fnv-hash-{}", dims),
        }
    }

    pub fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dims];
        if self.dims == 0 {
            return v;
        }
        let mut add = |feature: &str, weight: f32| {
            let h = fnv1a(feature.as_bytes());
            let idx = (h as usize) % self.dims;
            let sign = if h & 0x8000_0000 == 0 { 1.0 } else { -1.0 };
            v[idx] += sign * weight;
        };
        let mut fired = false;
        for token in tokenize(text) {
            add(&token, 1.0);
            fired = true;
        }
        let joined = text
            .to_lowercase()
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ");
        let lowered: Vec<char> = joined.chars().collect();
        for tri in lowered.windows(3) {
            let s: String = tri.iter().collect();
            add(&format!("#{}", s), 0.25);
            fired = true;
        }
        // Short stopword-only text ("a", "I.") still needs a direction.
        if !fired && !joined.is_empty() {
            add(&format!("$whole:{}", joined), 1.0);
        }
        l2_normalize(&mut v);
        v
    }
}

#[async_trait]
impl DenseEmbedder for HashingEmbedder {
    fn provider(&self) -> &str {
        "hashing"
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

pub fn l2_normalize(v: &mut [f32]) {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

/// Encode a float vector as a BLOB (little-endian f32 bytes).
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Cosine similarity in `[-1.0, 1.0]`; `0.0` for empty or mismatched vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

/// Okapi BM25 inverse document frequency.
pub fn idf(total_docs: usize, doc_freq: usize) -> f32 {
    let n = total_docs as f32;
    let df = doc_freq as f32;
    (1.0 + (n - df + 0.5) / (df + 0.5)).ln()
}
