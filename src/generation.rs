//! Token-streamed answer generation.
//!
//! A [`GenerationBackend`] turns prompt messages into a stream of text
//! increments. [`stream_answer`] drives that stream for one query: it
//! relays each increment to the caller as it arrives, stops promptly on
//! cancellation, and enforces a first-token and a total deadline.
//!
//! | Outcome | Partial text |
//! |---------|--------------|
//! | [`StreamEnd::Completed`] | full answer |
//! | [`StreamEnd::Cancelled`] | discarded |
//! | [`StreamEnd::Failed`] | kept, flagged incomplete |
//!
//! Dropping the backend stream drops the underlying HTTP response, which
//! aborts the request.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use rag_harness_core::error::GenerationError;
use rag_harness_core::prompt::PromptMessage;

use crate::config::GenerationConfig;

pub type TokenStream = BoxStream<'static, Result<String, GenerationError>>;

#[async_trait]
pub trait GenerationBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Start a streaming completion. Resolves once the backend accepted the
    /// request; tokens follow on the returned stream.
    async fn stream(&self, messages: &[PromptMessage]) -> Result<TokenStream, GenerationError>;
}

pub fn create_backend(config: &GenerationConfig) -> Result<Arc<dyn GenerationBackend>> {
    match config.provider.as_str() {
        "openai" => Ok(Arc::new(OpenAiChatBackend::new(config)?)),
        "extractive" => Ok(Arc::new(ExtractiveBackend)),
        other => bail!("Unknown generation provider: {}", other),
    }
}

// ============ Cancellation ============

/// Cloneable cancel signal shared by a query and whoever may abort it.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

#[derive(Default)]
struct CancelInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// True when both handles control the same query.
    pub fn same_as(&self, other: &CancelToken) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once [`cancel`](Self::cancel) has been called.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

// ============ Stream driver ============

#[derive(Debug, Clone, Copy)]
pub struct StreamLimits {
    pub first_token: Duration,
    pub total: Duration,
}

impl From<&GenerationConfig> for StreamLimits {
    fn from(c: &GenerationConfig) -> Self {
        Self {
            first_token: Duration::from_secs(c.first_token_timeout_secs),
            total: Duration::from_secs(c.total_timeout_secs),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEnd {
    Completed,
    Cancelled,
    Failed(GenerationError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamOutcome {
    /// Everything delivered so far. Empty after cancellation.
    pub text: String,
    pub end: StreamEnd,
}

impl StreamOutcome {
    pub fn incomplete(&self) -> bool {
        matches!(self.end, StreamEnd::Failed(_))
    }
}

/// Drive one generation. `on_token` receives every non-empty increment in
/// arrival order and returns `false` when the consumer has gone away,
/// which is treated as cancellation.
pub async fn stream_answer<F>(
    backend: &dyn GenerationBackend,
    messages: &[PromptMessage],
    limits: StreamLimits,
    cancel: &CancelToken,
    mut on_token: F,
) -> StreamOutcome
where
    F: FnMut(&str) -> bool,
{
    let started = Instant::now();
    let total_deadline = started + limits.total;
    let first_deadline = (started + limits.first_token).min(total_deadline);
    let timeout_ms = |deadline: Instant| deadline.duration_since(started).as_millis() as u64;

    let cancelled = || StreamOutcome {
        text: String::new(),
        end: StreamEnd::Cancelled,
    };

    let mut tokens = tokio::select! {
        biased;
        _ = cancel.cancelled() => return cancelled(),
        _ = tokio::time::sleep_until(first_deadline) => {
            return StreamOutcome {
                text: String::new(),
                end: StreamEnd::Failed(GenerationError::Timeout(timeout_ms(first_deadline))),
            };
        }
        accepted = backend.stream(messages) => match accepted {
            Ok(s) => s,
            Err(e) => return StreamOutcome { text: String::new(), end: StreamEnd::Failed(e) },
        },
    };

    let mut text = String::new();
    let mut got_first = false;
    loop {
        let deadline = if got_first { total_deadline } else { first_deadline };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(backend = backend.name(), "generation cancelled");
                return cancelled();
            }
            _ = tokio::time::sleep_until(deadline) => {
                return StreamOutcome {
                    text,
                    end: StreamEnd::Failed(GenerationError::Timeout(timeout_ms(deadline))),
                };
            }
            next = tokens.next() => match next {
                Some(Ok(token)) => {
                    if token.is_empty() {
                        continue;
                    }
                    got_first = true;
                    text.push_str(&token);
                    if !on_token(&token) {
                        return cancelled();
                    }
                }
                Some(Err(e)) => return StreamOutcome { text, end: StreamEnd::Failed(e) },
                None => return StreamOutcome { text, end: StreamEnd::Completed },
            },
        }
    }
}

// ============ OpenAI-compatible chat completions ============

/// `POST {base_url}/chat/completions` with `stream: true`.
pub struct OpenAiChatBackend {
    client: reqwest::Client,
    url: String,
    model: String,
    api_key: Option<String>,
    temperature: f32,
}

impl OpenAiChatBackend {
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        let api_key = match &config.api_key_env {
            Some(var) => Some(
                std::env::var(var).map_err(|_| anyhow::anyhow!("{} environment variable not set", var))?,
            ),
            None => None,
        };
        // Only connecting is bounded here; stream deadlines belong to the driver.
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            url: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
            model: config.model.clone(),
            api_key,
            temperature: config.temperature,
        })
    }
}

#[async_trait]
impl GenerationBackend for OpenAiChatBackend {
    fn name(&self) -> &str {
        "openai"
    }

    async fn stream(&self, messages: &[PromptMessage]) -> Result<TokenStream, GenerationError> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": messages,
            "temperature": self.temperature,
            "stream": true,
        });
        let mut req = self.client.post(&self.url).json(&body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let response = req
            .send()
            .await
            .map_err(|e| GenerationError::Connect(format!("{}: {}", self.url, e)))?;
        let status = response.status();
        if !status.is_success() {
            return Err(GenerationError::Backend {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }

        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map(|b| b.to_vec()).map_err(|e| e.to_string()))
            .boxed();
        Ok(sse_tokens(body))
    }
}

#[derive(Debug, PartialEq)]
enum SseLine {
    Token(String),
    Done,
    Skip,
}

/// One line of an OpenAI-style SSE body.
fn parse_sse_line(line: &str) -> Result<SseLine, GenerationError> {
    let Some(data) = line.strip_prefix("data:") else {
        return Ok(SseLine::Skip);
    };
    let data = data.trim();
    if data == "[DONE]" {
        return Ok(SseLine::Done);
    }
    if data.is_empty() {
        return Ok(SseLine::Skip);
    }

    let json: serde_json::Value = serde_json::from_str(data)
        .map_err(|e| GenerationError::Interrupted(format!("malformed stream chunk: {}", e)))?;
    if let Some(err) = json.get("error") {
        return Err(GenerationError::Interrupted(err.to_string()));
    }
    Ok(json
        .pointer("/choices/0/delta/content")
        .and_then(|c| c.as_str())
        .map(|c| SseLine::Token(c.to_string()))
        .unwrap_or(SseLine::Skip))
}

struct SseState {
    body: BoxStream<'static, Result<Vec<u8>, String>>,
    buf: Vec<u8>,
    pending: VecDeque<String>,
    failure: Option<GenerationError>,
    done: bool,
}

/// Split raw body bytes into lines and lines into content tokens. Bytes are
/// buffered until a newline so multi-byte characters never get split.
fn sse_tokens(body: BoxStream<'static, Result<Vec<u8>, String>>) -> TokenStream {
    let state = SseState {
        body,
        buf: Vec::new(),
        pending: VecDeque::new(),
        failure: None,
        done: false,
    };
    stream::unfold(state, |mut st| async move {
        loop {
            if let Some(token) = st.pending.pop_front() {
                return Some((Ok(token), st));
            }
            if let Some(e) = st.failure.take() {
                return Some((Err(e), st));
            }
            if st.done {
                return None;
            }
            match st.body.next().await {
                Some(Ok(bytes)) => {
                    st.buf.extend_from_slice(&bytes);
                    while let Some(pos) = st.buf.iter().position(|b| *b == b'\n') {
                        let line: Vec<u8> = st.buf.drain(..=pos).collect();
                        let line = String::from_utf8_lossy(&line);
                        match parse_sse_line(line.trim_end()) {
                            Ok(SseLine::Token(t)) => st.pending.push_back(t),
                            Ok(SseLine::Done) => {
                                st.done = true;
                                break;
                            }
                            Ok(SseLine::Skip) => {}
                            Err(e) => {
                                st.failure = Some(e);
                                st.done = true;
                                break;
                            }
                        }
                    }
                }
                Some(Err(e)) => {
                    st.failure = Some(GenerationError::Interrupted(e));
                    st.done = true;
                }
                None => {
                    st.done = true;
                    // The final line may arrive without a trailing newline.
                    let rest = std::mem::take(&mut st.buf);
                    let rest = String::from_utf8_lossy(&rest);
                    let ended = || GenerationError::Interrupted("stream ended before [DONE]".into());
                    match parse_sse_line(rest.trim_end()) {
                        Ok(SseLine::Done) => {}
                        Ok(SseLine::Token(t)) => {
                            st.pending.push_back(t);
                            st.failure = Some(ended());
                        }
                        Ok(SseLine::Skip) => st.failure = Some(ended()),
                        Err(e) => st.failure = Some(e),
                    }
                }
            }
        }
    })
    .boxed()
}

// ============ Extractive ============

/// Offline backend that answers with the first sentence of the top source,
/// cited as `[1]`. Deterministic; used for demos and tests without a model.
pub struct ExtractiveBackend;

const NO_ANSWER: &str = "I don't have enough information in the provided documentation to answer that question.";

fn extract_answer(messages: &[PromptMessage]) -> String {
    let Some(user) = messages.iter().rev().find(|m| m.role == "user") else {
        return NO_ANSWER.to_string();
    };
    let mut lines = user.content.lines().skip_while(|l| !l.starts_with("[1] "));
    if lines.next().is_none() {
        return NO_ANSWER.to_string();
    }
    let body: Vec<&str> = lines.take_while(|l| !l.trim().is_empty()).collect();
    let body = body.join(" ");
    let sentence = match body.find(". ") {
        Some(pos) => &body[..=pos],
        None => body.as_str(),
    };
    format!("According to [1], {}", sentence.trim())
}

#[async_trait]
impl GenerationBackend for ExtractiveBackend {
    fn name(&self) -> &str {
        "extractive"
    }

    async fn stream(&self, messages: &[PromptMessage]) -> Result<TokenStream, GenerationError> {
        let answer = extract_answer(messages);
        let tokens: Vec<Result<String, GenerationError>> = answer
            .split_inclusive(' ')
            .map(|t| Ok(t.to_string()))
            .collect();
        Ok(stream::iter(tokens).boxed())
    }
}
