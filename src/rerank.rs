//! Network rerank backends and reranker construction.
//!
//! - **[`HttpCrossEncoder`]**: a cross-encoder server, `POST {url}/rerank`
//!   with `{query, texts}` answering `[{index, score}]`.
//! - **[`OllamaJudge`]**: an LLM asked to rate every passage in a single
//!   `/api/generate` call, answering a JSON array of `{id, score}`.
//!
//! Both score the whole candidate list in one request. Failures surface as
//! [`RerankError`]; the [`Reranker`] turns them into the fused-order
//! fallback.
//!
//! [`OllamaSupportJudge`] backs the optional [`SupportFilter`]: the same
//! `/api/generate` call, answering the ids of passages that support an
//! answer.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;

use rag_harness_core::error::RerankError;
use rag_harness_core::rerank::{LexicalReranker, RerankBackend, Reranker};
use rag_harness_core::support::{SupportFilter, SupportJudge};

use crate::config::{RerankConfig, SupportConfig};

/// Characters of each passage shown to the LLM judge.
const JUDGE_SNIPPET_CHARS: usize = 500;

pub fn create_reranker(config: &RerankConfig) -> Result<Reranker> {
    let backend: Arc<dyn RerankBackend> = match config.provider.as_str() {
        "disabled" => return Ok(Reranker::disabled()),
        "lexical" => Arc::new(LexicalReranker),
        "http" => Arc::new(HttpCrossEncoder::new(config)?),
        "ollama" => Arc::new(OllamaJudge::new(config)?),
        other => bail!("Unknown rerank provider: {}", other),
    };
    Ok(Reranker::new(backend))
}

pub fn create_support_filter(config: &SupportConfig) -> Result<SupportFilter> {
    match config.provider.as_str() {
        "disabled" => Ok(SupportFilter::disabled()),
        "ollama" => Ok(SupportFilter::new(Arc::new(OllamaSupportJudge::new(config)?))),
        other => bail!("Unknown support provider: {}", other),
    }
}

fn require_url(config: &RerankConfig) -> Result<String> {
    match &config.url {
        Some(url) => Ok(url.trim_end_matches('/').to_string()),
        None => bail!("rerank.url required for {} provider", config.provider),
    }
}

fn http_client(timeout_secs: u64) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()?)
}

async fn post_json(
    client: &reqwest::Client,
    url: &str,
    body: &serde_json::Value,
) -> Result<serde_json::Value, RerankError> {
    let response = client
        .post(url)
        .json(body)
        .send()
        .await
        .map_err(|e| RerankError::Unavailable(format!("{}: {}", url, e)))?;
    let status = response.status();
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        return Err(RerankError::Unavailable(format!("{} from {}: {}", status, url, text)));
    }
    response
        .json()
        .await
        .map_err(|e| RerankError::Malformed(e.to_string()))
}

// ============ Cross-encoder server ============

pub struct HttpCrossEncoder {
    client: reqwest::Client,
    url: String,
}

impl HttpCrossEncoder {
    pub fn new(config: &RerankConfig) -> Result<Self> {
        Ok(Self {
            client: http_client(config.timeout_secs)?,
            url: format!("{}/rerank", require_url(config)?),
        })
    }
}

#[async_trait]
impl RerankBackend for HttpCrossEncoder {
    fn name(&self) -> &str {
        "http"
    }

    async fn score(&self, query: &str, passages: &[String]) -> Result<Vec<f64>, RerankError> {
        let body = serde_json::json!({ "query": query, "texts": passages });
        let json = post_json(&self.client, &self.url, &body).await?;
        parse_index_scores(&json, passages.len())
    }
}

/// `[{index, score}, ...]` in any order, one entry per passage.
fn parse_index_scores(json: &serde_json::Value, expected: usize) -> Result<Vec<f64>, RerankError> {
    let items = json
        .as_array()
        .ok_or_else(|| RerankError::Malformed("expected a JSON array".into()))?;
    if items.len() != expected {
        return Err(RerankError::ScoreCount {
            expected,
            got: items.len(),
        });
    }

    let mut scores = vec![None; expected];
    for item in items {
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .filter(|i| *i < expected)
            .ok_or_else(|| RerankError::Malformed(format!("bad index in {}", item)))?;
        let score = item
            .get("score")
            .and_then(|s| s.as_f64())
            .ok_or_else(|| RerankError::Malformed(format!("bad score in {}", item)))?;
        scores[index] = Some(score);
    }
    scores
        .into_iter()
        .enumerate()
        .map(|(i, s)| s.ok_or_else(|| RerankError::Malformed(format!("no score for passage {}", i))))
        .collect()
}

// ============ LLM judge ============

pub struct OllamaJudge {
    client: reqwest::Client,
    url: String,
    model: String,
}

impl OllamaJudge {
    pub fn new(config: &RerankConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("rerank.model required for ollama provider"))?;
        Ok(Self {
            client: http_client(config.timeout_secs)?,
            url: format!("{}/api/generate", require_url(config)?),
            model,
        })
    }
}

fn judge_prompt(query: &str, passages: &[String]) -> String {
    let mut rows = vec![
        "Rate the relevance of each context chunk to the user question on a 0-1 scale.".to_string(),
        "Return a JSON array of objects with id and score keys.".to_string(),
        format!("Question: {}", query),
        "Contexts:".to_string(),
    ];
    for (i, passage) in passages.iter().enumerate() {
        let snippet: String = passage.chars().take(JUDGE_SNIPPET_CHARS).collect();
        rows.push(format!("{}. id={} text={}", i + 1, i + 1, snippet));
    }
    rows.push("JSON Response:".to_string());
    rows.join("\n")
}

/// Scores keyed by 1-based `id`. Passages the judge skipped score 0.
fn parse_judge_scores(response: &str, expected: usize) -> Result<Vec<f64>, RerankError> {
    let json: serde_json::Value =
        serde_json::from_str(response).map_err(|e| RerankError::Malformed(e.to_string()))?;
    // `format: json` sometimes wraps the array in an object.
    let items = match &json {
        serde_json::Value::Array(a) => a,
        serde_json::Value::Object(o) => o
            .values()
            .find_map(|v| v.as_array())
            .ok_or_else(|| RerankError::Malformed("no array in judge response".into()))?,
        _ => return Err(RerankError::Malformed("judge response is not JSON array".into())),
    };

    let mut scores = vec![0.0; expected];
    for item in items {
        let id = match item.get("id") {
            Some(serde_json::Value::Number(n)) => n.as_u64(),
            Some(serde_json::Value::String(s)) => s.trim().parse().ok(),
            _ => None,
        };
        let score = item.get("score").and_then(|s| s.as_f64());
        if let (Some(id), Some(score)) = (id, score) {
            if id >= 1 && (id as usize) <= expected {
                scores[id as usize - 1] = score;
            }
        }
    }
    Ok(scores)
}

#[async_trait]
impl RerankBackend for OllamaJudge {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn score(&self, query: &str, passages: &[String]) -> Result<Vec<f64>, RerankError> {
        let body = serde_json::json!({
            "model": self.model,
            "prompt": judge_prompt(query, passages),
            "format": "json",
            "stream": false,
        });
        let json = post_json(&self.client, &self.url, &body).await?;
        let text = json
            .get("response")
            .and_then(|r| r.as_str())
            .ok_or_else(|| RerankError::Malformed("missing response field".into()))?;
        parse_judge_scores(text, passages.len())
    }
}

// ============ Support judge ============

pub struct OllamaSupportJudge {
    client: reqwest::Client,
    url: String,
    model: String,
}

impl OllamaSupportJudge {
    pub fn new(config: &SupportConfig) -> Result<Self> {
        let (Some(url), Some(model)) = (&config.url, &config.model) else {
            bail!("support.url and support.model required for ollama provider");
        };
        Ok(Self {
            client: http_client(config.timeout_secs)?,
            url: format!("{}/api/generate", url.trim_end_matches('/')),
            model: model.clone(),
        })
    }
}

fn support_prompt(query: &str, passages: &[String]) -> String {
    let mut rows = vec![
        "Given the question and contexts, return the ids of contexts that directly support an answer.".to_string(),
        "Use a JSON array of ids only.".to_string(),
        format!("Question: {}", query),
        "Contexts:".to_string(),
    ];
    for (i, passage) in passages.iter().enumerate() {
        let snippet: String = passage.chars().take(JUDGE_SNIPPET_CHARS).collect();
        rows.push(format!("id={} text={}", i + 1, snippet));
    }
    rows.push("Supported ids as JSON array:".to_string());
    rows.join("\n")
}

/// 1-based ids in, 0-based indices out. Unknown ids are dropped.
fn parse_support_ids(response: &str, expected: usize) -> Result<Vec<usize>, RerankError> {
    let json: serde_json::Value =
        serde_json::from_str(response).map_err(|e| RerankError::Malformed(e.to_string()))?;
    let items = match &json {
        serde_json::Value::Array(a) => a,
        serde_json::Value::Object(o) => o
            .values()
            .find_map(|v| v.as_array())
            .ok_or_else(|| RerankError::Malformed("no array in support response".into()))?,
        _ => return Err(RerankError::Malformed("support response is not JSON array".into())),
    };

    Ok(items
        .iter()
        .filter_map(|item| match item {
            serde_json::Value::Number(n) => n.as_u64(),
            serde_json::Value::String(s) => s.trim().parse().ok(),
            _ => None,
        })
        .filter(|id| *id >= 1 && (*id as usize) <= expected)
        .map(|id| id as usize - 1)
        .collect())
}

#[async_trait]
impl SupportJudge for OllamaSupportJudge {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn supported(&self, query: &str, passages: &[String]) -> Result<Vec<usize>, RerankError> {
        let body = serde_json::json!({
            "model": self.model,
            "prompt": support_prompt(query, passages),
            "format": "json",
            "stream": false,
        });
        let json = post_json(&self.client, &self.url, &body).await?;
        let text = json
            .get("response")
            .and_then(|r| r.as_str())
            .ok_or_else(|| RerankError::Malformed("missing response field".into()))?;
        parse_support_ids(text, passages.len())
    }
}
