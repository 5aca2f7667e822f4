//! End-to-end query pipeline tests over an in-memory index.
//!
//! Each test indexes a small corpus with the hashing embedder, then drives
//! [`QueryPipeline::run`] and inspects the emitted event sequence.

mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use rag_harness::generation::{CancelToken, ExtractiveBackend};
use rag_harness::pipeline::{ChatEvent, ChatRequest, QueryOutcome, QueryPipeline, Stage};
use rag_harness_core::error::{GenerationError, RerankError};
use rag_harness_core::models::CandidateSource;
use rag_harness_core::rerank::{RerankBackend, Reranker};
use rag_harness_core::support::{SupportFilter, SupportJudge};

use common::{pipeline, pipeline_with, ScriptedBackend};

fn request(message: &str) -> ChatRequest {
    ChatRequest {
        session_id: None,
        message: message.to_string(),
        history: Vec::new(),
    }
}

async fn run_collect(p: &QueryPipeline, message: &str, cancel: &CancelToken) -> (QueryOutcome, Vec<ChatEvent>) {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let outcome = p.run(&request(message), cancel, &tx).await;
    drop(tx);
    let mut events = Vec::new();
    while let Some(ev) = rx.recv().await {
        events.push(ev);
    }
    (outcome, events)
}

fn tokens(events: &[ChatEvent]) -> String {
    events
        .iter()
        .filter_map(|e| match e {
            ChatEvent::Token { token } => Some(token.as_str()),
            _ => None,
        })
        .collect()
}

fn assert_single_terminal_last(events: &[ChatEvent]) {
    let terminals = events.iter().filter(|e| e.is_terminal()).count();
    assert_eq!(terminals, 1, "events: {:?}", events);
    assert!(events.last().unwrap().is_terminal());
}

struct BrokenReranker;

#[async_trait]
impl RerankBackend for BrokenReranker {
    fn name(&self) -> &str {
        "broken"
    }

    async fn score(&self, _query: &str, _passages: &[String]) -> Result<Vec<f64>, RerankError> {
        Err(RerankError::Unavailable("connection refused".into()))
    }
}

/// Supports every passage mentioning `term`.
struct TermJudge(&'static str);

#[async_trait]
impl SupportJudge for TermJudge {
    fn name(&self) -> &str {
        "term"
    }

    async fn supported(&self, _query: &str, passages: &[String]) -> Result<Vec<usize>, RerankError> {
        Ok(passages
            .iter()
            .enumerate()
            .filter(|(_, p)| p.contains(self.0))
            .map(|(i, _)| i)
            .collect())
    }
}

#[tokio::test]
async fn test_vacation_question_is_answered_with_citation() {
    let p = pipeline(Arc::new(ExtractiveBackend)).await;

    let retrieved = p.retrieve("How many vacation days do employees get?", true).await.unwrap();
    assert!(retrieved.reranked);
    assert!(retrieved.candidates.len() <= 5);
    assert_eq!(retrieved.candidates[0].document_id, "hr/vacation.md");
    assert!(retrieved
        .candidates
        .iter()
        .all(|c| c.source == CandidateSource::Reranked));
    assert!(retrieved.processed.expansions.iter().any(|t| t == "leave"));

    let (outcome, events) = run_collect(&p, "How many vacation days do employees get?", &CancelToken::new()).await;
    assert_eq!(outcome.stage, Stage::Completed);
    assert!(!outcome.incomplete);
    assert_single_terminal_last(&events);
    assert_eq!(
        tokens(&events),
        "According to [1], All employees receive 21 days of paid vacation per year."
    );

    let ChatEvent::Done(done) = events.last().unwrap() else {
        panic!("expected done, got {:?}", events.last());
    };
    assert!(done.done);
    assert_eq!(done.status, "completed");
    assert!(done.reranked);
    assert!(!done.filtered);
    assert!(done.degraded_sources.is_empty());
    assert_eq!(done.cited, vec![1]);
    assert!(done.invalid_citations.is_empty());
    assert_eq!(done.sources[0].marker, 1);
    assert_eq!(done.sources[0].document_id, "hr/vacation.md");
    assert_eq!(done.sources[0].title, "Vacation Policy");
}

#[tokio::test]
async fn test_no_lexical_overlap_is_degraded_but_answered() {
    let p = pipeline(Arc::new(ExtractiveBackend)).await;
    let (outcome, events) = run_collect(&p, "xylophone quartet rehearsal", &CancelToken::new()).await;

    assert_eq!(outcome.stage, Stage::Completed);
    assert_single_terminal_last(&events);
    let ChatEvent::Done(done) = events.last().unwrap() else {
        panic!("expected done, got {:?}", events.last());
    };
    assert_eq!(done.degraded_sources, vec!["sparse".to_string()]);
    assert!(!done.sources.is_empty());
}

#[tokio::test]
async fn test_rerank_failure_falls_back_to_fused_order() {
    let p = pipeline_with(
        Arc::new(ExtractiveBackend),
        Reranker::new(Arc::new(BrokenReranker)),
        Duration::from_secs(10),
    )
    .await;

    let retrieved = p.retrieve("vacation days", true).await.unwrap();
    assert!(!retrieved.reranked);
    assert!(!retrieved.candidates.is_empty());
    assert!(retrieved.candidates.len() <= 5);
    assert!(retrieved
        .candidates
        .iter()
        .all(|c| c.source == CandidateSource::Fused));

    let (outcome, events) = run_collect(&p, "vacation days", &CancelToken::new()).await;
    assert_eq!(outcome.stage, Stage::Completed);
    let ChatEvent::Done(done) = events.last().unwrap() else {
        panic!("expected done, got {:?}", events.last());
    };
    assert!(!done.reranked);
}

#[tokio::test]
async fn test_support_filter_drops_unsupported_sources() {
    let p = pipeline(Arc::new(ExtractiveBackend))
        .await
        .with_support_filter(SupportFilter::new(Arc::new(TermJudge("vacation"))));

    let retrieved = p.retrieve("vacation days", true).await.unwrap();
    assert!(retrieved.reranked);
    assert!(retrieved.filtered);
    assert!(!retrieved.candidates.is_empty());
    assert!(retrieved.candidates.iter().all(|c| c.document_id == "hr/vacation.md"));

    let (outcome, events) = run_collect(&p, "vacation days", &CancelToken::new()).await;
    assert_eq!(outcome.stage, Stage::Completed);
    assert_single_terminal_last(&events);
    let ChatEvent::Done(done) = events.last().unwrap() else {
        panic!("expected done, got {:?}", events.last());
    };
    assert!(done.filtered);
    assert_eq!(done.sources.len(), 1);
    assert_eq!(done.sources[0].document_id, "hr/vacation.md");
}

#[tokio::test]
async fn test_support_filter_with_no_pick_keeps_reranked_sources() {
    let p = pipeline(Arc::new(ExtractiveBackend))
        .await
        .with_support_filter(SupportFilter::new(Arc::new(TermJudge("submarine"))));

    let retrieved = p.retrieve("vacation days", true).await.unwrap();
    assert!(retrieved.reranked);
    assert!(!retrieved.filtered);
    assert!(retrieved.candidates.len() > 1);

    let unfiltered = p.retrieve("vacation days", false).await.unwrap();
    assert!(!unfiltered.filtered);
}

#[tokio::test]
async fn test_cancel_mid_stream_stops_tokens() {
    let backend = ScriptedBackend::new(&["one ", "two ", "three ", "four ", "five ", "six "], Duration::from_millis(40));
    let p = pipeline(Arc::new(backend)).await;

    let cancel = CancelToken::new();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let runner = {
        let p = p.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { p.run(&request("vacation days"), &cancel, &tx).await })
    };

    let mut events = Vec::new();
    let mut cancelled_at = None;
    while let Some(ev) = rx.recv().await {
        let is_token = matches!(ev, ChatEvent::Token { .. });
        events.push(ev);
        if is_token && cancelled_at.is_none() && events.len() == 2 {
            cancel.cancel();
            cancelled_at = Some(events.len());
        }
    }
    let outcome = runner.await.unwrap();

    assert_eq!(outcome.stage, Stage::Cancelled);
    assert!(outcome.answer.is_empty());
    assert_single_terminal_last(&events);
    assert_eq!(events.last(), Some(&ChatEvent::Cancelled { cancelled: true }));

    // At most one token already in flight may land after cancel().
    let after = &events[cancelled_at.expect("cancel was never triggered")..];
    let (terminal, late) = after.split_last().expect("no events after cancel");
    assert_eq!(terminal, &ChatEvent::Cancelled { cancelled: true });
    assert!(late.len() <= 1, "tokens kept streaming after cancel: {:?}", after);
    assert!(late.iter().all(|e| matches!(e, ChatEvent::Token { .. })), "{:?}", after);
}

#[tokio::test]
async fn test_cancel_before_start_sends_only_cancelled() {
    let p = pipeline(Arc::new(ExtractiveBackend)).await;
    let cancel = CancelToken::new();
    cancel.cancel();

    let (outcome, events) = run_collect(&p, "vacation days", &cancel).await;
    assert_eq!(outcome.stage, Stage::Cancelled);
    assert_eq!(events, vec![ChatEvent::Cancelled { cancelled: true }]);
}

#[tokio::test]
async fn test_total_timeout_keeps_partial_answer() {
    let backend = ScriptedBackend::new(&["partial ", "answer ", "never ", "finished "], Duration::from_millis(100));
    let p = pipeline_with(
        Arc::new(backend),
        Reranker::disabled(),
        Duration::from_millis(250),
    )
    .await;

    let (outcome, events) = run_collect(&p, "vacation days", &CancelToken::new()).await;
    assert_eq!(outcome.stage, Stage::Failed);
    assert!(outcome.incomplete);
    assert_eq!(outcome.answer, "partial answer ");
    assert_eq!(tokens(&events), "partial answer ");
    assert_single_terminal_last(&events);

    let ChatEvent::Done(done) = events.last().unwrap() else {
        panic!("expected done, got {:?}", events.last());
    };
    assert_eq!(done.status, "failed");
    assert!(done.incomplete);
}

#[tokio::test]
async fn test_backend_failure_before_any_token_is_an_error_event() {
    let mut backend = ScriptedBackend::new(&[], Duration::from_millis(1));
    backend.tail = Some(GenerationError::Interrupted("connection reset".into()));
    let p = pipeline(Arc::new(backend)).await;

    let (outcome, events) = run_collect(&p, "vacation days", &CancelToken::new()).await;
    assert_eq!(outcome.stage, Stage::Failed);
    assert_eq!(events.len(), 1);
    let ChatEvent::Error { error } = &events[0] else {
        panic!("expected error, got {:?}", events[0]);
    };
    assert_eq!(error.code, "generation");
    assert!(error.message.contains("connection reset"));
}

#[tokio::test]
async fn test_empty_message_is_rejected() {
    let p = pipeline(Arc::new(ExtractiveBackend)).await;
    assert!(p.validate("   ").is_err());

    let (outcome, events) = run_collect(&p, "   ", &CancelToken::new()).await;
    assert_eq!(outcome.stage, Stage::Failed);
    assert_eq!(events.len(), 1);
    let ChatEvent::Error { error } = &events[0] else {
        panic!("expected error, got {:?}", events[0]);
    };
    assert_eq!(error.code, "validation");
}

#[tokio::test]
async fn test_concurrent_queries_are_independent() {
    let p = pipeline(Arc::new(ExtractiveBackend)).await;
    let questions = [
        "How many vacation days do employees get?",
        "When do deployments go out through the release pipeline?",
        "How do I connect to the VPN?",
        "What does health insurance cover?",
    ];

    let handles: Vec<_> = questions
        .iter()
        .cycle()
        .take(12)
        .map(|q| {
            let p = p.clone();
            let q = q.to_string();
            tokio::spawn(async move {
                let (outcome, events) = run_collect(&p, &q, &CancelToken::new()).await;
                (q, outcome, events)
            })
        })
        .collect();

    for h in handles {
        let (q, outcome, events) = h.await.unwrap();
        assert_eq!(outcome.stage, Stage::Completed, "{}", q);
        assert_single_terminal_last(&events);
        let expected = p.retrieve(&q, true).await.unwrap();
        let ChatEvent::Done(done) = events.last().unwrap() else {
            panic!("expected done for {}", q);
        };
        assert_eq!(done.sources[0].chunk_id, expected.candidates[0].chunk_id, "{}", q);
    }
}

#[tokio::test]
async fn test_history_is_carried_into_context_only() {
    let p = pipeline(Arc::new(ExtractiveBackend)).await;
    let history = vec![
        rag_harness_core::models::ConversationTurn {
            role: rag_harness_core::models::Role::User,
            text: "hello".into(),
        },
        rag_harness_core::models::ConversationTurn {
            role: rag_harness_core::models::Role::Assistant,
            text: "Hi, ask me about company policy.".into(),
        },
    ];
    let retrieved = p.retrieve("vacation days", true).await.unwrap();
    let ctx = p.assemble_context(&retrieved.candidates, &history).await;
    assert_eq!(ctx.history, history);
    assert!(!ctx.passages.is_empty());
    assert_eq!(ctx.passages[0].marker, 1);
    assert_eq!(ctx.citations.len(), ctx.passages.len());
}
