//! HTTP server.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/chat` | Answer a question as a server-sent event stream |
//! | `POST` | `/chat/cancel` | Cancel the in-flight query of a session |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! `/chat` takes `{session_id, message, history}` and streams `{token}`
//! events, then one terminal event: `{sources, done: true, ...}`,
//! `{error: {code, message}}` or `{cancelled: true}`. Dropping the
//! connection cancels the query. The session id (generated when the
//! request has none) is returned in the `x-session-id` header and can be
//! passed to `/chat/cancel`.
//!
//! # Error Contract
//!
//! Errors raised before the stream starts are plain JSON responses:
//!
//! ```json
//! { "error": { "code": "validation", "message": "query is empty" } }
//! ```
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted to support browser-based
//! chat front ends.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::{Arc, Mutex};

use axum::{
    extract::State,
    http::{HeaderValue, StatusCode},
    response::sse::{Event, KeepAlive, Sse},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use rag_harness_core::error::RagError;

use crate::config::Config;
use crate::generation::CancelToken;
use crate::pipeline::{ChatEvent, ChatRequest, QueryPipeline};

#[derive(Clone)]
struct AppState {
    pipeline: QueryPipeline,
    /// In-flight queries by session id.
    sessions: Arc<Mutex<HashMap<String, CancelToken>>>,
}

/// Starts the HTTP server on `[server].bind`. Runs until the process is
/// terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let pipeline = crate::build_pipeline(config).await?;
    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    info!(bind = %config.server.bind, "server listening");
    println!("RAG server listening on http://{}", config.server.bind);
    axum::serve(listener, router(pipeline)).await?;
    Ok(())
}

/// The application routes, for embedding in another server or tests.
pub fn router(pipeline: QueryPipeline) -> Router {
    let state = AppState {
        pipeline,
        sessions: Arc::new(Mutex::new(HashMap::new())),
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/chat", post(handle_chat))
        .route("/chat/cancel", post(handle_cancel))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state)
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<RagError> for AppError {
    fn from(err: RagError) -> Self {
        let status = match err {
            RagError::Validation(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        AppError {
            status,
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found".to_string(),
        message: message.into(),
    }
}

// ============ POST /chat ============

/// Cancels its query when the response stream is dropped.
struct CancelOnDrop(CancelToken);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

fn to_sse(event: &ChatEvent) -> Event {
    Event::default()
        .json_data(event)
        .unwrap_or_else(|_| Event::default().comment("unserializable event"))
}

async fn handle_chat(
    State(state): State<AppState>,
    Json(mut request): Json<ChatRequest>,
) -> Result<Response, AppError> {
    state
        .pipeline
        .validate(&request.message)
        .map_err(|e| AppError::from(RagError::from(e)))?;

    let session_id = request
        .session_id
        .get_or_insert_with(|| uuid::Uuid::new_v4().to_string())
        .clone();
    let header = HeaderValue::from_str(&session_id).map_err(|_| AppError {
        status: StatusCode::BAD_REQUEST,
        code: "validation".to_string(),
        message: "session_id must be a visible ASCII string".to_string(),
    })?;

    let cancel = CancelToken::new();
    if let Ok(mut sessions) = state.sessions.lock() {
        if let Some(previous) = sessions.insert(session_id.clone(), cancel.clone()) {
            previous.cancel();
        }
    }

    let (tx, rx) = mpsc::unbounded_channel();
    let query_cancel = cancel.clone();
    let sessions = state.sessions.clone();
    let pipeline = state.pipeline.clone();
    tokio::spawn(async move {
        pipeline.run(&request, &query_cancel, &tx).await;
        if let Ok(mut sessions) = sessions.lock() {
            if sessions.get(&session_id).is_some_and(|t| t.same_as(&query_cancel)) {
                sessions.remove(&session_id);
            }
        }
    });

    Ok(([("x-session-id", header)], event_stream(rx, cancel)).into_response())
}

fn event_stream(
    rx: mpsc::UnboundedReceiver<ChatEvent>,
    cancel: CancelToken,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let events = stream::unfold((rx, CancelOnDrop(cancel)), |(mut rx, guard)| async move {
        let event = rx.recv().await?;
        Some((Ok(to_sse(&event)), (rx, guard)))
    });
    Sse::new(events).keep_alive(KeepAlive::default())
}

// ============ POST /chat/cancel ============

#[derive(Deserialize)]
struct CancelRequest {
    session_id: String,
}

#[derive(Serialize)]
struct CancelResponse {
    cancelled: bool,
}

async fn handle_cancel(
    State(state): State<AppState>,
    Json(req): Json<CancelRequest>,
) -> Result<Json<CancelResponse>, AppError> {
    let token = state
        .sessions
        .lock()
        .ok()
        .and_then(|mut sessions| sessions.remove(&req.session_id));
    match token {
        Some(token) => {
            token.cancel();
            info!(session = %req.session_id, "query cancelled by request");
            Ok(Json(CancelResponse { cancelled: true }))
        }
        None => Err(not_found(format!("no active query for session '{}'", req.session_id))),
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}
