//! HTTP facade.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`/`POST` | `/construct_index/` | Fetch documents and (re)build a session index |
//! | `GET`/`POST` | `/query_index/` | Answer a question from a session index |
//! | `GET`/`POST` | `/query/` | Answer a question over freshly fetched documents |
//! | `GET`  | `/` | Welcome banner |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! Parameters are read from the query string for both methods.
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "invalid_input", "message": "missing required parameter 'api_key'" } }
//! ```
//!
//! | Code | Status |
//! |------|--------|
//! | `invalid_input` | 400 |
//! | `upstream_auth` | 401 |
//! | `index_not_found` | 404 |
//! | `context_too_large` | 413 |
//! | `parse_failed` | 422 |
//! | `upstream_rate_limited` | 429 |
//! | `fetch_failed`, `upstream_unavailable`, `upstream_rejected` | 502 |
//! | `internal` | 500 |
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted.

use axum::{
    extract::{rejection::QueryRejection, Query, Request, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::error::{PipelineError, UpstreamErrorKind};
use crate::llm::{ModelProvider, OpenAiProvider};
use crate::pipeline::Pipeline;

/// Shared application state passed to all route handlers via Axum's `State` extractor.
#[derive(Clone)]
struct AppState {
    /// Request operations, shared by every handler (wrapped in `Arc` for cheap cloning).
    pipeline: Arc<Pipeline>,
}

/// Starts the HTTP server on `[server].bind` with the OpenAI provider.
///
/// Runs until the process is terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let provider = OpenAiProvider::new(&config.llm, config.chunking.max_input_size)?;
    let app = router(config.clone(), Arc::new(provider))?;

    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    tracing::info!(
        addr = %listener.local_addr()?,
        storage = %config.storage.root.display(),
        "docqa server listening"
    );
    axum::serve(listener, app).await?;

    Ok(())
}

/// Builds the application router around `provider`.
///
/// Tests pass a provider pointing at a mock upstream.
pub fn router(config: Config, provider: Arc<dyn ModelProvider>) -> crate::error::Result<Router> {
    let pipeline = Pipeline::new(config, provider)?;
    let state = AppState {
        pipeline: Arc::new(pipeline),
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Ok(Router::new()
        .route(
            "/construct_index/",
            get(handle_construct_index).post(handle_construct_index),
        )
        .route(
            "/query_index/",
            get(handle_query_index).post(handle_query_index),
        )
        .route("/query/", get(handle_query).post(handle_query))
        .route("/", get(handle_home))
        .route("/health", get(handle_health))
        // Spans carry the path only: the query string holds the API key.
        .layer(
            TraceLayer::new_for_http().make_span_with(|req: &Request<_>| {
                tracing::info_span!("request", method = %req.method(), path = %req.uri().path())
            }),
        )
        .layer(cors)
        .with_state(state))
}

// ============ Error response ============

/// JSON error response body: `{"error": {"code": ..., "message": ...}}`.
#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

/// Inner error detail with a machine-readable code and human-readable message.
#[derive(Serialize)]
struct ErrorDetail {
    /// Machine-readable error code (e.g., `"invalid_input"`, `"index_not_found"`).
    code: String,
    /// Human-readable error message.
    message: String,
}

/// Internal error type that converts into an Axum HTTP response.
struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<PipelineError> for AppError {
    fn from(err: PipelineError) -> Self {
        let status = match &err {
            PipelineError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            PipelineError::FetchFailure { .. } => StatusCode::BAD_GATEWAY,
            PipelineError::ParseFailure { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            PipelineError::IndexNotFound(_) => StatusCode::NOT_FOUND,
            PipelineError::Upstream { kind, .. } => match kind {
                UpstreamErrorKind::RateLimited => StatusCode::TOO_MANY_REQUESTS,
                UpstreamErrorKind::Auth => StatusCode::UNAUTHORIZED,
                UpstreamErrorKind::Unavailable | UpstreamErrorKind::Rejected => {
                    StatusCode::BAD_GATEWAY
                }
            },
            PipelineError::ContextTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            PipelineError::Storage(_) | PipelineError::Io(_) | PipelineError::Database(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        if status.is_server_error() {
            tracing::error!(code = err.code(), error = %err, "request failed");
        } else {
            tracing::warn!(code = err.code(), error = %err, "request rejected");
        }

        AppError {
            status,
            code: err.code(),
            message: err.to_string(),
        }
    }
}

/// A query string axum could not deserialize (e.g. a repeated parameter).
impl From<QueryRejection> for AppError {
    fn from(rejection: QueryRejection) -> Self {
        AppError::from(PipelineError::invalid_input(rejection.body_text()))
    }
}

// ============ Handlers ============

/// Raw query-string parameters; presence is checked by the pipeline.
#[derive(Deserialize, Default)]
struct Params {
    api_key: Option<String>,
    fileurls: Option<String>,
    session_id: Option<String>,
    question: Option<String>,
}

/// Unwraps the query extractor, turning a rejection into the JSON error body.
fn params(query: Result<Query<Params>, QueryRejection>) -> Result<Params, AppError> {
    let Query(params) = query?;
    Ok(params)
}

/// Response body for `/construct_index/`.
#[derive(Serialize)]
struct ConstructResponse {
    /// Session whose index was (re)built.
    session_id: String,
    /// Number of documents indexed.
    documents: usize,
    /// Number of nodes embedded across all documents.
    nodes: usize,
}

/// `{"message": ...}` envelope shared by both query routes.
#[derive(Serialize)]
struct MessageResponse<T: Serialize> {
    message: T,
}

/// Handler for `GET|POST /construct_index/`.
///
/// Downloads `fileurls` and replaces the index of `session_id`.
async fn handle_construct_index(
    State(state): State<AppState>,
    query: Result<Query<Params>, QueryRejection>,
) -> Result<Json<ConstructResponse>, AppError> {
    let params = params(query)?;
    let summary = state
        .pipeline
        .construct_index(
            params.api_key.as_deref(),
            params.fileurls.as_deref(),
            params.session_id.as_deref(),
        )
        .await?;
    Ok(Json(ConstructResponse {
        session_id: summary.session_id,
        documents: summary.documents,
        nodes: summary.nodes,
    }))
}

/// Handler for `GET|POST /query_index/`.
///
/// Answers `question` from the persisted index of `session_id`.
async fn handle_query_index(
    State(state): State<AppState>,
    query: Result<Query<Params>, QueryRejection>,
) -> Result<Json<MessageResponse<String>>, AppError> {
    let params = params(query)?;
    let answer = state
        .pipeline
        .query_index(
            params.api_key.as_deref(),
            params.session_id.as_deref(),
            params.question.as_deref(),
        )
        .await?;
    Ok(Json(MessageResponse { message: answer }))
}

/// Handler for `GET|POST /query/`.
///
/// Returns the completion API response untouched under `message`, or a
/// bare `{}` when `fileurls` is `[]`.
async fn handle_query(
    State(state): State<AppState>,
    query: Result<Query<Params>, QueryRejection>,
) -> Result<Response, AppError> {
    let params = params(query)?;
    let raw = state
        .pipeline
        .query_raw(
            params.api_key.as_deref(),
            params.fileurls.as_deref(),
            params.question.as_deref(),
        )
        .await?;
    if raw.as_object().is_some_and(|o| o.is_empty()) {
        return Ok(Json(raw).into_response());
    }
    Ok(Json(MessageResponse { message: raw }).into_response())
}

/// Handler for `GET /`.
async fn handle_home() -> Html<&'static str> {
    Html("<h1>Welcome to our server !!</h1>")
}

/// Response body for `GET /health`.
#[derive(Serialize)]
struct HealthResponse {
    /// Always `"ok"` when the server is running.
    status: String,
    /// Crate version from `Cargo.toml`.
    version: String,
}

/// Handler for `GET /health`.
async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}
