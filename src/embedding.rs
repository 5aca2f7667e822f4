//! Dense embedding providers.
//!
//! Implementations of [`DenseEmbedder`] for remote and local backends, and
//! [`create_vectorizer`], which pairs the configured dense provider with the
//! BM25 sparse encoder.
//!
//! | Config Value | Provider |
//! |-------------|----------|
//! | `"hashing"` | [`HashingEmbedder`] (offline, deterministic) |
//! | `"openai"` | [`OpenAIEmbedder`] (`POST {url}/embeddings`) |
//! | `"ollama"` | [`OllamaEmbedder`] (`POST {url}/api/embed`) |
//! | `"local"` | `LocalEmbedder` (fastembed, behind `local-embeddings-fastembed`) |
//!
//! # Retry Strategy
//!
//! Remote providers use exponential backoff for transient errors:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;

use rag_harness_core::embedding::{DenseEmbedder, HashingEmbedder, SparseEncoder, Vectorizer};
use rag_harness_core::error::EmbeddingError;

use crate::config::EmbeddingConfig;

const OPENAI_URL: &str = "https://api.openai.com/v1";
const OLLAMA_URL: &str = "http://localhost:11434";

/// Build the vectorizer described by `config`.
///
/// # Errors
///
/// Returns an error for unknown provider names or if the provider cannot
/// be initialized (missing model, API key, or feature flag).
pub fn create_vectorizer(config: &EmbeddingConfig) -> Result<Vectorizer> {
    let dense: Arc<dyn DenseEmbedder> = match config.provider.as_str() {
        "hashing" => Arc::new(HashingEmbedder::new(config.dims)),
        "openai" => Arc::new(OpenAIEmbedder::new(config)?),
        "ollama" => Arc::new(OllamaEmbedder::new(config)?),
        #[cfg(feature = "local-embeddings-fastembed")]
        "local" => Arc::new(LocalEmbedder::new(config)?),
        #[cfg(not(feature = "local-embeddings-fastembed"))]
        "local" => bail!("Local embedding provider requires --features local-embeddings-fastembed"),
        other => bail!("Unknown embedding provider: {}", other),
    };
    Ok(Vectorizer::new(dense, SparseEncoder::new(config.sparse.into())))
}

fn http_client(timeout_secs: u64) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()?)
}

fn require_model(config: &EmbeddingConfig, provider: &str) -> Result<String> {
    config
        .model
        .clone()
        .ok_or_else(|| anyhow::anyhow!("embedding.model required for {} provider", provider))
}

/// POST `body` to `url`, retrying transient failures, and hand the JSON
/// response to `parse`.
async fn post_embeddings(
    client: &reqwest::Client,
    url: &str,
    bearer: Option<&str>,
    body: &serde_json::Value,
    max_retries: u32,
    parse: fn(&serde_json::Value) -> Result<Vec<Vec<f32>>, EmbeddingError>,
) -> Result<Vec<Vec<f32>>, EmbeddingError> {
    let mut last_err = None;

    for attempt in 0..=max_retries {
        if attempt > 0 {
            let delay = Duration::from_secs(1 << (attempt - 1).min(5));
            tracing::debug!(url, attempt, ?delay, "retrying embedding request");
            tokio::time::sleep(delay).await;
        }

        let mut req = client.post(url).json(body);
        if let Some(key) = bearer {
            req = req.bearer_auth(key);
        }

        match req.send().await {
            Ok(response) => {
                let status = response.status();

                if status.is_success() {
                    let json: serde_json::Value = response
                        .json()
                        .await
                        .map_err(|e| EmbeddingError::Malformed(e.to_string()))?;
                    return parse(&json);
                }

                let body_text = response.text().await.unwrap_or_default();

                // Rate limited or server error, retry
                if status.as_u16() == 429 || status.is_server_error() {
                    last_err = Some(EmbeddingError::Unavailable(format!("{} from {}: {}", status, url, body_text)));
                    continue;
                }

                if status.as_u16() == 400 || status.as_u16() == 413 {
                    return Err(EmbeddingError::InvalidInput(format!("{}: {}", status, body_text)));
                }
                return Err(EmbeddingError::Unavailable(format!("{} from {}: {}", status, url, body_text)));
            }
            Err(e) => {
                last_err = Some(EmbeddingError::Unavailable(format!("connection to {} failed: {}", url, e)));
                continue;
            }
        }
    }

    Err(last_err.unwrap_or_else(|| EmbeddingError::Unavailable("embedding failed after retries".into())))
}

/// Extract `data[].embedding`, ordered by each item's `index` when present.
fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>, EmbeddingError> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| EmbeddingError::Malformed("missing data array".into()))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (pos, item) in data.iter().enumerate() {
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(pos);
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| EmbeddingError::Malformed("missing embedding".into()))?;
        indexed.push((index, to_floats(embedding)?));
    }
    indexed.sort_by_key(|(i, _)| *i);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

fn parse_ollama_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>, EmbeddingError> {
    json.get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| EmbeddingError::Malformed("missing embeddings array".into()))?
        .iter()
        .map(|e| {
            e.as_array()
                .ok_or_else(|| EmbeddingError::Malformed("embedding is not an array".into()))
                .and_then(|a| to_floats(a))
        })
        .collect()
}

fn to_floats(values: &[serde_json::Value]) -> Result<Vec<f32>, EmbeddingError> {
    values
        .iter()
        .map(|v| {
            v.as_f64()
                .map(|f| f as f32)
                .ok_or_else(|| EmbeddingError::Malformed("non-numeric embedding value".into()))
        })
        .collect()
}

// ============ OpenAI ============

/// Embeddings via an OpenAI-compatible `/embeddings` endpoint.
pub struct OpenAIEmbedder {
    client: reqwest::Client,
    url: String,
    model: String,
    dims: usize,
    api_key: String,
    max_retries: u32,
}

impl OpenAIEmbedder {
    /// # Errors
    ///
    /// Returns an error if `model` is unset or the API key variable is
    /// missing from the environment.
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = require_model(config, "OpenAI")?;
        let api_key = std::env::var(&config.api_key_env)
            .map_err(|_| anyhow::anyhow!("{} environment variable not set", config.api_key_env))?;
        let base = config.url.as_deref().unwrap_or(OPENAI_URL).trim_end_matches('/');

        Ok(Self {
            client: http_client(config.timeout_secs)?,
            url: format!("{}/embeddings", base),
            model,
            dims: config.dims,
            api_key,
            max_retries: config.max_retries,
        })
    }
}

#[async_trait]
impl DenseEmbedder for OpenAIEmbedder {
    fn provider(&self) -> &str {
        "openai"
    }
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });
        post_embeddings(
            &self.client,
            &self.url,
            Some(&self.api_key),
            &body,
            self.max_retries,
            parse_openai_response,
        )
        .await
    }
}

// ============ Ollama ============

/// Embeddings from a local Ollama instance.
///
/// Requires an embedding model pulled (e.g. `ollama pull nomic-embed-text`).
pub struct OllamaEmbedder {
    client: reqwest::Client,
    url: String,
    model: String,
    dims: usize,
    max_retries: u32,
}

impl OllamaEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = require_model(config, "Ollama")?;
        let base = config.url.as_deref().unwrap_or(OLLAMA_URL).trim_end_matches('/');

        Ok(Self {
            client: http_client(config.timeout_secs)?,
            url: format!("{}/api/embed", base),
            model,
            dims: config.dims,
            max_retries: config.max_retries,
        })
    }
}

#[async_trait]
impl DenseEmbedder for OllamaEmbedder {
    fn provider(&self) -> &str {
        "ollama"
    }
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });
        post_embeddings(&self.client, &self.url, None, &body, self.max_retries, parse_ollama_response).await
    }
}

// ============ Local (fastembed) ============

/// Local inference via fastembed. The model is downloaded from Hugging Face
/// on first use and cached; after that no network calls are made.
#[cfg(feature = "local-embeddings-fastembed")]
pub struct LocalEmbedder {
    model_name: String,
    model: fastembed::EmbeddingModel,
    dims: usize,
    batch_size: usize,
    loaded: Arc<std::sync::Mutex<Option<fastembed::TextEmbedding>>>,
}

#[cfg(feature = "local-embeddings-fastembed")]
impl LocalEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model_name = config
            .model
            .clone()
            .unwrap_or_else(|| "all-minilm-l6-v2".to_string());
        let (model, dims) = match model_name.as_str() {
            "all-minilm-l6-v2" => (fastembed::EmbeddingModel::AllMiniLML6V2, 384),
            "bge-small-en-v1.5" => (fastembed::EmbeddingModel::BGESmallENV15, 384),
            "bge-base-en-v1.5" => (fastembed::EmbeddingModel::BGEBaseENV15, 768),
            "bge-large-en-v1.5" => (fastembed::EmbeddingModel::BGELargeENV15, 1024),
            "nomic-embed-text-v1.5" => (fastembed::EmbeddingModel::NomicEmbedTextV15, 768),
            other => bail!(
                "Unknown local embedding model: '{}'. Supported models: \
                 all-minilm-l6-v2, bge-small-en-v1.5, bge-base-en-v1.5, bge-large-en-v1.5, \
                 nomic-embed-text-v1.5",
                other
            ),
        };
        if config.dims != dims {
            bail!("embedding.dims = {} but {} produces {}", config.dims, model_name, dims);
        }
        Ok(Self {
            model_name,
            model,
            dims,
            batch_size: config.batch_size,
            loaded: Arc::new(std::sync::Mutex::new(None)),
        })
    }
}

#[cfg(feature = "local-embeddings-fastembed")]
#[async_trait]
impl DenseEmbedder for LocalEmbedder {
    fn provider(&self) -> &str {
        "local"
    }
    fn model_name(&self) -> &str {
        &self.model_name
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let loaded = self.loaded.clone();
        let model = self.model.clone();
        let batch_size = self.batch_size;
        let texts = texts.to_vec();

        tokio::task::spawn_blocking(move || {
            let mut guard = loaded
                .lock()
                .map_err(|_| EmbeddingError::Unavailable("local model lock poisoned".into()))?;
            if guard.is_none() {
                let init = fastembed::InitOptions::new(model).with_show_download_progress(true);
                let te = fastembed::TextEmbedding::try_new(init)
                    .map_err(|e| EmbeddingError::Unavailable(format!("failed to load local model: {}", e)))?;
                *guard = Some(te);
            }
            let te = guard
                .as_mut()
                .ok_or_else(|| EmbeddingError::Unavailable("local model not loaded".into()))?;
            te.embed(texts, Some(batch_size))
                .map_err(|e| EmbeddingError::Unavailable(format!("local embedding failed: {}", e)))
        })
        .await
        .map_err(|e| EmbeddingError::Unavailable(e.to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::{Json, Router};

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn ollama_config(url: String) -> EmbeddingConfig {
        EmbeddingConfig {
            provider: "ollama".into(),
            model: Some("nomic-embed-text".into()),
            dims: 3,
            url: Some(url),
            max_retries: 0,
            ..EmbeddingConfig::default()
        }
    }

    #[test]
    fn test_parse_openai_orders_by_index() {
        let json = serde_json::json!({
            "data": [
                {"index": 1, "embedding": [0.0, 1.0]},
                {"index": 0, "embedding": [1.0, 0.0]}
            ]
        });
        let v = parse_openai_response(&json).unwrap();
        assert_eq!(v, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
    }

    #[test]
    fn test_parse_rejects_missing_fields() {
        assert!(matches!(
            parse_openai_response(&serde_json::json!({"object": "list"})),
            Err(EmbeddingError::Malformed(_))
        ));
        assert!(matches!(
            parse_ollama_response(&serde_json::json!({"embeddings": [["x"]]})),
            Err(EmbeddingError::Malformed(_))
        ));
    }

    #[test]
    fn test_create_vectorizer_hashing_default() {
        let v = create_vectorizer(&EmbeddingConfig::default()).unwrap();
        assert_eq!(v.dims(), 384);
        assert!(v.fingerprint().starts_with("hashing:fnv-hash-384:384:"));
    }

    #[test]
    fn test_create_vectorizer_unknown_provider() {
        let config = EmbeddingConfig {
            provider: "nope".into(),
            ..EmbeddingConfig::default()
        };
        assert!(create_vectorizer(&config).is_err());
    }

    #[test]
    fn test_ollama_requires_model() {
        let config = EmbeddingConfig {
            provider: "ollama".into(),
            ..EmbeddingConfig::default()
        };
        assert!(create_vectorizer(&config).is_err());
    }

    #[tokio::test]
    async fn test_ollama_roundtrip() {
        let app = Router::new().route(
            "/api/embed",
            post(|Json(body): Json<serde_json::Value>| async move {
                let n = body["input"].as_array().map(|a| a.len()).unwrap_or(0);
                let embeddings: Vec<Vec<f32>> = (0..n).map(|i| vec![1.0, i as f32, 0.5]).collect();
                Json(serde_json::json!({ "embeddings": embeddings }))
            }),
        );
        let url = serve(app).await;
        let v = create_vectorizer(&ollama_config(url)).unwrap();
        let pairs = v
            .embed_documents(&["paid vacation".to_string(), "release pipeline".to_string()])
            .await
            .unwrap();
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[1].dense, vec![1.0, 1.0, 0.5]);
        assert!(!pairs[0].sparse.is_empty());
    }

    #[tokio::test]
    async fn test_ollama_client_error_not_retried() {
        let app = Router::new().route("/api/embed", post(|| async { (StatusCode::BAD_REQUEST, "too long") }));
        let url = serve(app).await;
        let v = create_vectorizer(&ollama_config(url)).unwrap();
        let err = v.embed_query("hello").await.unwrap_err();
        assert!(matches!(err, EmbeddingError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_ollama_unreachable_is_unavailable() {
        let v = create_vectorizer(&ollama_config("http://127.0.0.1:9".into())).unwrap();
        let err = v.embed_query("hello").await.unwrap_err();
        assert!(matches!(err, EmbeddingError::Unavailable(_)));
    }
}
