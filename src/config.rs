//! Configuration parsing and validation.
//!
//! One TOML file describes the whole process: index location, chunk
//! sizes, the vectorizer, retrieval and rerank knobs, context budgets,
//! the generation backend, query dictionaries, server bind address and
//! logging. It is parsed once at startup by [`load_config`], validated,
//! and then passed by reference everywhere.
//!
//! # Example
//!
//! ```toml
//! [db]
//! path = "./data/rag.sqlite"
//!
//! [chunking.parent]
//! max_chars = 1400
//! overlap_chars = 200
//!
//! [embedding]
//! provider = "openai"
//! model = "text-embedding-3-small"
//! dims = 1536
//!
//! [retrieval]
//! rrf_k = 60
//! search_limit = 20
//!
//! [rerank]
//! provider = "http"
//! url = "http://localhost:8080"
//! top_n = 5
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use rag_harness_core::chunk::ChunkSpec;
use rag_harness_core::context::ContextBudget;
use rag_harness_core::embedding::SparseParams;
use rag_harness_core::query::{QueryDictionaries, QueryPreprocessor};
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub rerank: RerankConfig,
    #[serde(default)]
    pub support: SupportConfig,
    #[serde(default)]
    pub context: ContextConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub query: QueryConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone, Copy)]
pub struct ChunkSizeConfig {
    pub max_chars: usize,
    #[serde(default)]
    pub overlap_chars: usize,
    #[serde(default)]
    pub min_chars: usize,
}

impl From<ChunkSizeConfig> for ChunkSpec {
    fn from(c: ChunkSizeConfig) -> Self {
        ChunkSpec {
            max_chars: c.max_chars,
            overlap_chars: c.overlap_chars,
            min_chars: c.min_chars,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_parent_chunk")]
    pub parent: ChunkSizeConfig,
    #[serde(default = "default_child_chunk")]
    pub child: ChunkSizeConfig,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            parent: default_parent_chunk(),
            child: default_child_chunk(),
        }
    }
}

fn default_parent_chunk() -> ChunkSizeConfig {
    ChunkSizeConfig {
        max_chars: ChunkSpec::PARENT.max_chars,
        overlap_chars: ChunkSpec::PARENT.overlap_chars,
        min_chars: ChunkSpec::PARENT.min_chars,
    }
}

fn default_child_chunk() -> ChunkSizeConfig {
    ChunkSizeConfig {
        max_chars: ChunkSpec::CHILD.max_chars,
        overlap_chars: ChunkSpec::CHILD.overlap_chars,
        min_chars: ChunkSpec::CHILD.min_chars,
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_dims")]
    pub dims: usize,
    /// Base URL for `openai` (default api.openai.com) and `ollama`.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Embedding batches in flight during ingestion.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub sparse: SparseConfig,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: None,
            dims: default_dims(),
            url: None,
            api_key_env: default_api_key_env(),
            batch_size: default_batch_size(),
            concurrency: default_concurrency(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
            sparse: SparseConfig::default(),
        }
    }
}

fn default_embedding_provider() -> String {
    "hashing".to_string()
}
fn default_dims() -> usize {
    384
}
fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_concurrency() -> usize {
    4
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone, Copy)]
pub struct SparseConfig {
    #[serde(default = "default_k1")]
    pub k1: f32,
    #[serde(default = "default_b")]
    pub b: f32,
    #[serde(default = "default_avg_doc_len")]
    pub avg_doc_len: f32,
}

impl Default for SparseConfig {
    fn default() -> Self {
        let p = SparseParams::default();
        Self {
            k1: p.k1,
            b: p.b,
            avg_doc_len: p.avg_doc_len,
        }
    }
}

impl From<SparseConfig> for SparseParams {
    fn from(c: SparseConfig) -> Self {
        SparseParams {
            k1: c.k1,
            b: c.b,
            avg_doc_len: c.avg_doc_len,
        }
    }
}

fn default_k1() -> f32 {
    SparseParams::default().k1
}
fn default_b() -> f32 {
    SparseParams::default().b
}
fn default_avg_doc_len() -> f32 {
    SparseParams::default().avg_doc_len
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_rrf_k")]
    pub rrf_k: u32,
    /// Candidates requested from each source and kept after fusion.
    #[serde(default = "default_search_limit")]
    pub search_limit: usize,
    /// Per-attempt timeout for one dense or sparse search.
    #[serde(default = "default_source_timeout_ms")]
    pub source_timeout_ms: u64,
    #[serde(default = "default_search_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            rrf_k: default_rrf_k(),
            search_limit: default_search_limit(),
            source_timeout_ms: default_source_timeout_ms(),
            max_retries: default_search_retries(),
            backoff_ms: default_backoff_ms(),
        }
    }
}

fn default_rrf_k() -> u32 {
    rag_harness_core::fusion::DEFAULT_RRF_K
}
fn default_search_limit() -> usize {
    20
}
fn default_source_timeout_ms() -> u64 {
    2000
}
fn default_search_retries() -> u32 {
    2
}
fn default_backoff_ms() -> u64 {
    100
}

#[derive(Debug, Deserialize, Clone)]
pub struct RerankConfig {
    /// `disabled`, `lexical`, `http` (cross-encoder server) or `ollama`.
    #[serde(default = "default_rerank_provider")]
    pub provider: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_top_n")]
    pub top_n: usize,
    #[serde(default = "default_rerank_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for RerankConfig {
    fn default() -> Self {
        Self {
            provider: default_rerank_provider(),
            url: None,
            model: None,
            top_n: default_top_n(),
            timeout_secs: default_rerank_timeout_secs(),
        }
    }
}

fn default_rerank_provider() -> String {
    "lexical".to_string()
}
fn default_top_n() -> usize {
    5
}
fn default_rerank_timeout_secs() -> u64 {
    10
}

/// Optional LLM pass that drops reranked passages not supporting an answer.
#[derive(Debug, Deserialize, Clone)]
pub struct SupportConfig {
    /// `disabled` or `ollama`.
    #[serde(default = "default_support_provider")]
    pub provider: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_support_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for SupportConfig {
    fn default() -> Self {
        Self {
            provider: default_support_provider(),
            url: None,
            model: None,
            timeout_secs: default_support_timeout_secs(),
        }
    }
}

fn default_support_provider() -> String {
    "disabled".to_string()
}
fn default_support_timeout_secs() -> u64 {
    90
}

#[derive(Debug, Deserialize, Clone, Copy)]
pub struct ContextConfig {
    #[serde(default = "default_max_context_chars")]
    pub max_context_chars: usize,
    #[serde(default = "default_max_history_chars")]
    pub max_history_chars: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_context_chars: default_max_context_chars(),
            max_history_chars: default_max_history_chars(),
        }
    }
}

impl From<ContextConfig> for ContextBudget {
    fn from(c: ContextConfig) -> Self {
        ContextBudget {
            max_context_chars: c.max_context_chars,
            max_history_chars: c.max_history_chars,
        }
    }
}

fn default_max_context_chars() -> usize {
    ContextBudget::default().max_context_chars
}
fn default_max_history_chars() -> usize {
    ContextBudget::default().max_history_chars
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    /// `openai` (any OpenAI-compatible server) or `extractive` (offline).
    #[serde(default = "default_generation_provider")]
    pub provider: String,
    /// OpenAI-compatible base URL, e.g. `http://localhost:11434/v1`.
    #[serde(default = "default_generation_url")]
    pub base_url: String,
    #[serde(default = "default_generation_model")]
    pub model: String,
    /// Environment variable holding the bearer token. Unset means no auth.
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_first_token_timeout_secs")]
    pub first_token_timeout_secs: u64,
    #[serde(default = "default_total_timeout_secs")]
    pub total_timeout_secs: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            provider: default_generation_provider(),
            base_url: default_generation_url(),
            model: default_generation_model(),
            api_key_env: None,
            temperature: default_temperature(),
            first_token_timeout_secs: default_first_token_timeout_secs(),
            total_timeout_secs: default_total_timeout_secs(),
        }
    }
}

fn default_generation_provider() -> String {
    "openai".to_string()
}
fn default_generation_url() -> String {
    "http://localhost:11434/v1".to_string()
}
fn default_generation_model() -> String {
    "llama3.1".to_string()
}
fn default_temperature() -> f32 {
    0.2
}
fn default_first_token_timeout_secs() -> u64 {
    30
}
fn default_total_timeout_secs() -> u64 {
    120
}

#[derive(Debug, Deserialize, Clone)]
pub struct QueryConfig {
    #[serde(default = "default_max_query_chars")]
    pub max_query_chars: usize,
    #[serde(default = "default_max_expansion_terms")]
    pub max_expansion_terms: usize,
    #[serde(default)]
    pub spell_corrections: BTreeMap<String, String>,
    #[serde(default)]
    pub acronyms: BTreeMap<String, String>,
    #[serde(default)]
    pub synonyms: BTreeMap<String, Vec<String>>,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            max_query_chars: default_max_query_chars(),
            max_expansion_terms: default_max_expansion_terms(),
            spell_corrections: BTreeMap::new(),
            acronyms: BTreeMap::new(),
            synonyms: BTreeMap::new(),
        }
    }
}

impl QueryConfig {
    pub fn preprocessor(&self) -> QueryPreprocessor {
        let dictionaries =
            QueryDictionaries::default().merge(&self.spell_corrections, &self.acronyms, &self.synonyms);
        QueryPreprocessor::new(dictionaries, self.max_query_chars, self.max_expansion_terms)
    }
}

fn default_max_query_chars() -> usize {
    rag_harness_core::query::DEFAULT_MAX_QUERY_CHARS
}
fn default_max_expansion_terms() -> usize {
    rag_harness_core::query::DEFAULT_MAX_EXPANSION_TERMS
}

/// Filesystem source for `rag ingest`.
#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    #[serde(default)]
    pub root: Option<PathBuf>,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
    /// Attempts for the final index write of one document.
    #[serde(default = "default_write_attempts")]
    pub write_attempts: u32,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            root: None,
            include_globs: default_include_globs(),
            exclude_globs: Vec::new(),
            follow_symlinks: false,
            write_attempts: default_write_attempts(),
        }
    }
}

fn default_include_globs() -> Vec<String> {
    vec!["**/*.md".to_string(), "**/*.txt".to_string()]
}
fn default_write_attempts() -> u32 {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { bind: default_bind() }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7331".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// `text` or `json`.
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "text".to_string()
}

impl Config {
    pub fn parent_spec(&self) -> ChunkSpec {
        self.chunking.parent.into()
    }

    pub fn child_spec(&self) -> ChunkSpec {
        self.chunking.child.into()
    }

    pub fn context_budget(&self) -> ContextBudget {
        self.context.into()
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config = parse_config(&content)?;
    validate(&config)?;
    Ok(config)
}

pub fn parse_config(content: &str) -> Result<Config> {
    toml::from_str(content).with_context(|| "Failed to parse config file")
}

pub fn validate(config: &Config) -> Result<()> {
    // Validate chunking
    let parent = config.parent_spec();
    let child = config.child_spec();
    parent.validate().context("chunking.parent")?;
    child.validate().context("chunking.child")?;
    if child.max_chars > parent.max_chars {
        bail!("chunking.child.max_chars must be <= chunking.parent.max_chars");
    }

    // Validate retrieval
    if config.retrieval.rrf_k == 0 {
        bail!("retrieval.rrf_k must be > 0");
    }
    if config.retrieval.search_limit < 1 {
        bail!("retrieval.search_limit must be >= 1");
    }
    if config.retrieval.source_timeout_ms == 0 {
        bail!("retrieval.source_timeout_ms must be > 0");
    }

    // Validate rerank
    if config.rerank.top_n < 1 {
        bail!("rerank.top_n must be >= 1");
    }
    match config.rerank.provider.as_str() {
        "disabled" | "lexical" => {}
        "http" | "ollama" => {
            if config.rerank.url.is_none() {
                bail!("rerank.url must be set when provider is '{}'", config.rerank.provider);
            }
        }
        other => bail!(
            "Unknown rerank provider: '{}'. Must be disabled, lexical, http, or ollama.",
            other
        ),
    }
    if config.rerank.provider == "ollama" && config.rerank.model.is_none() {
        bail!("rerank.model must be set when provider is 'ollama'");
    }

    // Validate support filter
    match config.support.provider.as_str() {
        "disabled" => {}
        "ollama" => {
            if config.support.url.is_none() || config.support.model.is_none() {
                bail!("support.url and support.model must be set when provider is 'ollama'");
            }
        }
        other => bail!("Unknown support provider: '{}'. Must be disabled or ollama.", other),
    }

    // Validate context
    config.context_budget().validate().context("context")?;

    // Validate embedding
    match config.embedding.provider.as_str() {
        "hashing" | "openai" | "ollama" | "local" => {}
        other => bail!(
            "Unknown embedding provider: '{}'. Must be hashing, openai, ollama, or local.",
            other
        ),
    }
    if config.embedding.dims == 0 {
        bail!("embedding.dims must be > 0");
    }
    if matches!(config.embedding.provider.as_str(), "openai" | "ollama") && config.embedding.model.is_none() {
        bail!(
            "embedding.model must be specified when provider is '{}'",
            config.embedding.provider
        );
    }
    if config.embedding.batch_size == 0 || config.embedding.concurrency == 0 {
        bail!("embedding.batch_size and embedding.concurrency must be > 0");
    }

    // Validate query and generation
    if config.query.max_query_chars < 1 {
        bail!("query.max_query_chars must be >= 1");
    }
    match config.generation.provider.as_str() {
        "openai" | "extractive" => {}
        other => bail!(
            "Unknown generation provider: '{}'. Must be openai or extractive.",
            other
        ),
    }
    if config.generation.first_token_timeout_secs == 0 || config.generation.total_timeout_secs == 0 {
        bail!("generation timeouts must be > 0");
    }
    if config.ingest.write_attempts == 0 {
        bail!("ingest.write_attempts must be >= 1");
    }

    match config.logging.format.as_str() {
        "text" | "json" => {}
        other => bail!("Unknown logging.format: '{}'. Must be text or json.", other),
    }

    Ok(())
}
