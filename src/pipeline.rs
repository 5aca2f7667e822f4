//! Per-query orchestration.
//!
//! ```text
//! received → preprocessing → retrieving → fusing → reranking
//!          → filtering → context-assembling → generating → streaming
//!          → completed | cancelled | failed
//! ```
//!
//! A [`QueryPipeline`] is built once at startup from shared handles and
//! cloned into each request. It holds no per-query state; every call to
//! [`QueryPipeline::run`] owns its own candidates, context and answer, so
//! any number of queries can run concurrently.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

use rag_harness_core::citation::check_citations;
use rag_harness_core::context::{assemble, AssembledContext, ContextBudget};
use rag_harness_core::error::{RagError, ValidationError};
use rag_harness_core::models::{Citation, ConversationTurn, SearchCandidate};
use rag_harness_core::prompt::build_messages;
use rag_harness_core::query::{ProcessedQuery, QueryPreprocessor};
use rag_harness_core::rerank::Reranker;
use rag_harness_core::support::SupportFilter;

use crate::config::Config;
use crate::generation::{stream_answer, CancelToken, GenerationBackend, StreamEnd, StreamLimits};
use crate::retriever::HybridRetriever;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Received,
    Preprocessing,
    Retrieving,
    Fusing,
    Reranking,
    Filtering,
    ContextAssembling,
    Generating,
    Streaming,
    Completed,
    Cancelled,
    Failed,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Received => "received",
            Stage::Preprocessing => "preprocessing",
            Stage::Retrieving => "retrieving",
            Stage::Fusing => "fusing",
            Stage::Reranking => "reranking",
            Stage::Filtering => "filtering",
            Stage::ContextAssembling => "context_assembling",
            Stage::Generating => "generating",
            Stage::Streaming => "streaming",
            Stage::Completed => "completed",
            Stage::Cancelled => "cancelled",
            Stage::Failed => "failed",
        }
    }
}

/// Body of `POST /chat`. `history` is a snapshot owned by the caller.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub session_id: Option<String>,
    pub message: String,
    #[serde(default)]
    pub history: Vec<ConversationTurn>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DoneEvent {
    pub sources: Vec<Citation>,
    pub done: bool,
    /// `completed` or `failed` (partial answer after a backend failure).
    pub status: &'static str,
    pub reranked: bool,
    /// Unsupported passages were dropped before context assembly.
    pub filtered: bool,
    pub degraded_sources: Vec<String>,
    pub incomplete: bool,
    pub cited: Vec<usize>,
    pub invalid_citations: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

/// One item on the caller-facing event stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ChatEvent {
    Token { token: String },
    Done(DoneEvent),
    Error { error: ErrorBody },
    Cancelled { cancelled: bool },
}

impl ChatEvent {
    pub fn error(err: &RagError) -> Self {
        ChatEvent::Error {
            error: ErrorBody {
                code: err.code().to_string(),
                message: err.to_string(),
            },
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ChatEvent::Token { .. })
    }
}

/// Candidates for one query, after fusion and (optionally) reranking and
/// support filtering.
#[derive(Debug, Clone)]
pub struct Retrieved {
    pub processed: ProcessedQuery,
    pub candidates: Vec<SearchCandidate>,
    pub reranked: bool,
    pub filtered: bool,
    pub degraded_sources: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryOutcome {
    /// Terminal stage.
    pub stage: Stage,
    pub answer: String,
    pub incomplete: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct PipelineSettings {
    pub search_limit: usize,
    pub top_n: usize,
    pub budget: ContextBudget,
    pub limits: StreamLimits,
}

impl From<&Config> for PipelineSettings {
    fn from(c: &Config) -> Self {
        Self {
            search_limit: c.retrieval.search_limit,
            top_n: c.rerank.top_n,
            budget: c.context_budget(),
            limits: (&c.generation).into(),
        }
    }
}

#[derive(Clone)]
pub struct QueryPipeline {
    preprocessor: Arc<QueryPreprocessor>,
    retriever: HybridRetriever,
    reranker: Reranker,
    support: SupportFilter,
    generator: Arc<dyn GenerationBackend>,
    settings: PipelineSettings,
}

impl QueryPipeline {
    pub fn new(
        preprocessor: QueryPreprocessor,
        retriever: HybridRetriever,
        reranker: Reranker,
        generator: Arc<dyn GenerationBackend>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            preprocessor: Arc::new(preprocessor),
            retriever,
            reranker,
            support: SupportFilter::disabled(),
            generator,
            settings,
        }
    }

    pub fn with_support_filter(mut self, support: SupportFilter) -> Self {
        self.support = support;
        self
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Cheap checks that must pass before any backend is called.
    pub fn validate(&self, message: &str) -> Result<(), ValidationError> {
        self.preprocessor.validate(message)
    }

    /// Preprocess, search, rerank and filter. The expanded query drives the
    /// search; the raw question drives the reranker and the support filter.
    /// With `rerank = false` the fused order is returned untouched.
    pub async fn retrieve(&self, question: &str, rerank: bool) -> Result<Retrieved, RagError> {
        stage(Stage::Preprocessing);
        let processed = self.preprocessor.process(question)?;
        debug!(
            intent = processed.intent.as_str(),
            expanded = %processed.expanded,
            "query preprocessed"
        );

        stage(Stage::Retrieving);
        let search = self
            .retriever
            .search(&processed.expanded, self.settings.search_limit)
            .await?;
        stage(Stage::Fusing);
        if search.is_degraded() {
            warn!(sources = ?search.degraded_sources, "retrieval degraded");
        }

        if !rerank {
            let mut candidates = search.candidates;
            candidates.truncate(self.settings.top_n);
            return Ok(Retrieved {
                processed,
                candidates,
                reranked: false,
                filtered: false,
                degraded_sources: search.degraded_sources,
            });
        }

        stage(Stage::Reranking);
        let outcome = self
            .reranker
            .rerank(question.trim(), search.candidates, self.settings.top_n)
            .await;
        if let Some(err) = &outcome.error {
            warn!(backend = self.reranker.backend_name(), error = %err, "rerank failed, using fused order");
        }

        let reranked = outcome.reranked;
        let mut candidates = outcome.candidates;
        let mut filtered = false;
        if self.support.is_enabled() {
            stage(Stage::Filtering);
            let before = candidates.len();
            let support = self.support.filter(question.trim(), candidates).await;
            if let Some(err) = &support.error {
                warn!(judge = self.support.judge_name(), error = %err, "support filter failed, keeping all passages");
            }
            debug!(before, after = support.candidates.len(), "support filter applied");
            candidates = support.candidates;
            filtered = support.filtered;
        }

        Ok(Retrieved {
            processed,
            candidates,
            reranked,
            filtered,
            degraded_sources: search.degraded_sources,
        })
    }

    /// Build the prompt context, widening children to their parents.
    pub async fn assemble_context(&self, candidates: &[SearchCandidate], history: &[ConversationTurn]) -> AssembledContext {
        let mut seen = HashSet::new();
        let parent_ids: Vec<String> = candidates
            .iter()
            .filter_map(|c| c.parent_id.clone())
            .filter(|id| seen.insert(id.clone()))
            .collect();

        let parents: HashMap<String, _> = match self.retriever.store().get_chunks(&parent_ids).await {
            Ok(chunks) => chunks.into_iter().map(|c| (c.id.clone(), c)).collect(),
            Err(e) => {
                warn!(error = %e, "parent lookup failed, using child passages only");
                HashMap::new()
            }
        };

        assemble(candidates, &parents, history, &self.settings.budget)
    }

    /// Answer one chat request, pushing events to `events` as they happen.
    ///
    /// Exactly one terminal event is sent unless the receiver is gone.
    /// After cancellation no further tokens are sent.
    pub async fn run(&self, request: &ChatRequest, cancel: &CancelToken, events: &UnboundedSender<ChatEvent>) -> QueryOutcome {
        stage(Stage::Received);
        let cancelled = || {
            let _ = events.send(ChatEvent::Cancelled { cancelled: true });
            stage(Stage::Cancelled);
            QueryOutcome {
                stage: Stage::Cancelled,
                answer: String::new(),
                incomplete: false,
            }
        };
        let failed = |err: RagError| {
            warn!(code = err.code(), error = %err, "query failed");
            let _ = events.send(ChatEvent::error(&err));
            stage(Stage::Failed);
            QueryOutcome {
                stage: Stage::Failed,
                answer: String::new(),
                incomplete: false,
            }
        };

        let retrieved = tokio::select! {
            biased;
            _ = cancel.cancelled() => return cancelled(),
            r = self.retrieve(&request.message, true) => match r {
                Ok(r) => r,
                Err(e) => return failed(e),
            },
        };

        stage(Stage::ContextAssembling);
        let ctx = tokio::select! {
            biased;
            _ = cancel.cancelled() => return cancelled(),
            ctx = self.assemble_context(&retrieved.candidates, &request.history) => ctx,
        };
        let messages = build_messages(&request.message, &ctx);

        stage(Stage::Generating);
        let mut streaming = false;
        let outcome = stream_answer(self.generator.as_ref(), &messages, self.settings.limits, cancel, |token| {
            if !streaming {
                streaming = true;
                stage(Stage::Streaming);
            }
            events
                .send(ChatEvent::Token {
                    token: token.to_string(),
                })
                .is_ok()
        })
        .await;

        let status = match &outcome.end {
            StreamEnd::Cancelled => return cancelled(),
            StreamEnd::Failed(e) if outcome.text.is_empty() => return failed(e.clone().into()),
            StreamEnd::Failed(e) => {
                warn!(error = %e, chars = outcome.text.len(), "generation failed after partial answer");
                Stage::Failed
            }
            StreamEnd::Completed => Stage::Completed,
        };

        let report = check_citations(&outcome.text, &ctx.citations);
        if report.has_invalid() {
            warn!(invalid = ?report.invalid, "answer cites unknown sources");
        }
        let done = DoneEvent {
            sources: ctx.citations.clone(),
            done: true,
            status: status.as_str(),
            reranked: retrieved.reranked,
            filtered: retrieved.filtered,
            degraded_sources: retrieved.degraded_sources.clone(),
            incomplete: outcome.incomplete(),
            cited: report.cited,
            invalid_citations: report.invalid,
        };
        let _ = events.send(ChatEvent::Done(done));

        info!(
            status = status.as_str(),
            sources = ctx.citations.len(),
            reranked = retrieved.reranked,
            filtered = retrieved.filtered,
            chars = outcome.text.len(),
            "query finished"
        );
        QueryOutcome {
            stage: status,
            incomplete: outcome.incomplete(),
            answer: outcome.text,
        }
    }
}

fn stage(s: Stage) {
    debug!(stage = s.as_str(), "pipeline stage");
}
