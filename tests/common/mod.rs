#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};

use rag_harness::generation::{GenerationBackend, StreamLimits, TokenStream};
use rag_harness::ingest::Ingestor;
use rag_harness::pipeline::{PipelineSettings, QueryPipeline};
use rag_harness::retriever::{HybridRetriever, RetrievalSettings};
use rag_harness_core::context::ContextBudget;
use rag_harness_core::embedding::{HashingEmbedder, SparseEncoder, Vectorizer};
use rag_harness_core::error::GenerationError;
use rag_harness_core::models::Document;
use rag_harness_core::prompt::PromptMessage;
use rag_harness_core::query::QueryPreprocessor;
use rag_harness_core::rerank::{LexicalReranker, Reranker};
use rag_harness_core::store::memory::InMemoryStore;

pub const CORPUS: &[(&str, &str, &str)] = &[
    (
        "hr/vacation.md",
        "Vacation Policy",
        "All employees receive 21 days of paid vacation per year. Unused days carry over until March.",
    ),
    (
        "hr/benefits.md",
        "Benefits Overview",
        "Health insurance covers employees and dependents. Dental plans are optional and billed monthly.",
    ),
    (
        "eng/deploy.md",
        "Deploy Guide",
        "Deployments go out through the release pipeline every Tuesday after the change review meeting.",
    ),
    (
        "it/vpn.md",
        "VPN Setup",
        "Connect to the VPN before opening internal dashboards. Reset your token in the IT portal.",
    ),
    (
        "eng/oncall.md",
        "On-call Rotation",
        "The on-call engineer acknowledges pages within fifteen minutes and writes the incident summary.",
    ),
];

/// Emits `tokens` with `delay` before each one, then `tail` if set.
pub struct ScriptedBackend {
    pub tokens: Vec<String>,
    pub delay: Duration,
    pub tail: Option<GenerationError>,
}

impl ScriptedBackend {
    pub fn new(tokens: &[&str], delay: Duration) -> Self {
        Self {
            tokens: tokens.iter().map(|t| t.to_string()).collect(),
            delay,
            tail: None,
        }
    }
}

#[async_trait]
impl GenerationBackend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn stream(&self, _messages: &[PromptMessage]) -> Result<TokenStream, GenerationError> {
        let delay = self.delay;
        let mut items: Vec<Result<String, GenerationError>> = self.tokens.iter().cloned().map(Ok).collect();
        if let Some(e) = &self.tail {
            items.push(Err(e.clone()));
        }
        Ok(stream::iter(items)
            .then(move |item| async move {
                tokio::time::sleep(delay).await;
                item
            })
            .boxed())
    }
}

pub fn vectorizer() -> Vectorizer {
    Vectorizer::new(Arc::new(HashingEmbedder::new(256)), SparseEncoder::default())
}

pub async fn indexed_store() -> Arc<InMemoryStore> {
    let store = Arc::new(InMemoryStore::new());
    let ingestor = Ingestor::new(store.clone(), vectorizer());
    for (id, title, text) in CORPUS {
        let doc = Document {
            id: id.to_string(),
            title: title.to_string(),
            text: text.to_string(),
            source_timestamp: 0,
        };
        ingestor.ingest_document(&doc).await.unwrap();
    }
    store
}

pub fn settings(total: Duration) -> PipelineSettings {
    PipelineSettings {
        search_limit: 20,
        top_n: 5,
        budget: ContextBudget::default(),
        limits: StreamLimits {
            first_token: Duration::from_secs(2),
            total,
        },
    }
}

pub async fn pipeline_with(backend: Arc<dyn GenerationBackend>, reranker: Reranker, total: Duration) -> QueryPipeline {
    let store = indexed_store().await;
    let retriever = HybridRetriever::new(store, vectorizer(), RetrievalSettings::default());
    QueryPipeline::new(QueryPreprocessor::default(), retriever, reranker, backend, settings(total))
}

pub async fn pipeline(backend: Arc<dyn GenerationBackend>) -> QueryPipeline {
    pipeline_with(backend, Reranker::new(Arc::new(LexicalReranker)), Duration::from_secs(10)).await
}
