//! HTTP boundary for the vault.
//!
//! The caller's identity is taken from the `x-user-id` header, set by the
//! upstream authenticator. Requests without it are rejected with `401`.
//!
//! # Endpoints
//!
//! | Method   | Path | Description |
//! |----------|------|-------------|
//! | `POST`   | `/api/v1/vault/upload` | Multipart upload (`file`, `title`, `notes`) → `202` + summary |
//! | `GET`    | `/api/v1/vault/documents` | `{ "documents": [...] }`, newest first |
//! | `GET`    | `/api/v1/vault/documents/{id}` | One summary, or `404` |
//! | `DELETE` | `/api/v1/vault/documents/{id}` | `204`, or `404` |
//! | `POST`   | `/api/v1/vault/query` | `{ query, top_k? }` → answer with citations |
//! | `GET`    | `/health` | Health check (returns version) |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "embedding_unavailable", "message": "...", "retryable": true } }
//! ```
//!
//! | Code | Status |
//! |------|--------|
//! | `bad_request` | 400 (also malformed JSON or multipart bodies) |
//! | `unauthorized` | 401 |
//! | `not_found` | 404 |
//! | `payload_too_large` | 413 |
//! | `embedding_rejected` | 422 |
//! | `internal` | 500 |
//! | `generation_failed` | 502 |
//! | `embedding_unavailable` | 503 |
//! | `timeout` | 504 |

use axum::{
    extract::{
        multipart::MultipartRejection, rejection::JsonRejection,
        DefaultBodyLimit, FromRequestParts, Multipart, Path, State,
    },
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

use crate::config::Config;
use crate::error::{EmbedError, QueryError, VaultError};
use crate::models::{DocumentSummary, Upload};
use crate::query::QueryAnswer;
use crate::vault::Vault;

pub const USER_HEADER: &str = "x-user-id";

#[derive(Clone)]
struct AppState {
    vault: Arc<Vault>,
}

/// Opens the vault and serves it on `[server].bind` until the process ends.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let vault = Arc::new(Vault::open(config).await?);
    let app = router(vault, config.ingest.max_upload_bytes);

    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    info!(bind = %config.server.bind, "vault server listening");
    axum::serve(listener, app).await?;

    Ok(())
}

/// Build the application router around an opened vault.
pub fn router(vault: Arc<Vault>, max_upload_bytes: usize) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/v1/vault/upload", post(handle_upload))
        .route("/api/v1/vault/documents", get(handle_list))
        .route(
            "/api/v1/vault/documents/{id}",
            get(handle_get).delete(handle_delete),
        )
        .route("/api/v1/vault/query", post(handle_query))
        .route("/health", get(handle_health))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(cors)
        .with_state(AppState { vault })
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
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    retryable: bool,
}

struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
    retryable: bool,
}

impl AppError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            retryable: false,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
                retryable: self.retryable,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError::new(StatusCode::BAD_REQUEST, "bad_request", message)
}

impl From<VaultError> for AppError {
    fn from(err: VaultError) -> Self {
        match err {
            VaultError::BadRequest(m) => bad_request(m),
            VaultError::NotFound(id) => AppError::new(
                StatusCode::NOT_FOUND,
                "not_found",
                format!("document not found: {}", id),
            ),
            VaultError::Query(QueryError::InvalidQuery(m)) => bad_request(m),
            VaultError::Query(QueryError::Embedding(EmbedError::Unavailable(m))) => AppError {
                retryable: true,
                ..AppError::new(StatusCode::SERVICE_UNAVAILABLE, "embedding_unavailable", m)
            },
            VaultError::Query(QueryError::Embedding(EmbedError::Rejected(m))) => {
                AppError::new(StatusCode::UNPROCESSABLE_ENTITY, "embedding_rejected", m)
            }
            VaultError::Query(QueryError::Generation(e)) => {
                AppError::new(StatusCode::BAD_GATEWAY, "generation_failed", e.0)
            }
            VaultError::Query(QueryError::Timeout(m)) => AppError {
                retryable: true,
                ..AppError::new(StatusCode::GATEWAY_TIMEOUT, "timeout", m)
            },
            VaultError::Internal(e) | VaultError::Query(QueryError::Internal(e)) => {
                error!(error = %e, "internal error");
                AppError::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal",
                    "internal server error",
                )
            }
        }
    }
}

// ============ Identity ============

/// Authenticated user id from the [`USER_HEADER`] header.
struct UserId(String);

impl<S: Send + Sync> FromRequestParts<S> for UserId {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(USER_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(|v| UserId(v.to_string()))
            .ok_or_else(|| {
                AppError::new(
                    StatusCode::UNAUTHORIZED,
                    "unauthorized",
                    format!("missing {} header", USER_HEADER),
                )
            })
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

// ============ POST /api/v1/vault/upload ============

fn multipart_error(err: axum::extract::multipart::MultipartError) -> AppError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        AppError::new(StatusCode::PAYLOAD_TOO_LARGE, "payload_too_large", err.body_text())
    } else {
        bad_request(err.body_text())
    }
}

/// Reads the multipart form; answers `202 Accepted` with the `PROCESSING`
/// summary (or the terminal one when ingestion runs inline).
async fn handle_upload(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<(StatusCode, Json<DocumentSummary>), AppError> {
    let mut multipart = multipart.map_err(|e| bad_request(e.body_text()))?;
    let mut upload = Upload {
        user_id,
        filename: None,
        content_type: None,
        title: None,
        notes: None,
        bytes: Vec::new(),
    };
    let mut has_file = false;

    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("file") => {
                upload.filename = field.file_name().map(str::to_string);
                upload.content_type = field.content_type().map(str::to_string);
                upload.bytes = field.bytes().await.map_err(multipart_error)?.to_vec();
                has_file = true;
            }
            Some("title") => {
                upload.title = Some(field.text().await.map_err(multipart_error)?);
            }
            Some("notes") => {
                let notes = field.text().await.map_err(multipart_error)?;
                upload.notes = Some(notes).filter(|n| !n.trim().is_empty());
            }
            _ => {}
        }
    }

    if !has_file {
        return Err(bad_request("no file uploaded"));
    }

    let doc = state.vault.upload(upload).await?;
    Ok((StatusCode::ACCEPTED, Json(doc.summary())))
}

// ============ GET /api/v1/vault/documents ============

#[derive(Serialize, Deserialize)]
pub struct DocumentList {
    pub documents: Vec<DocumentSummary>,
}

async fn handle_list(
    State(state): State<AppState>,
    UserId(user_id): UserId,
) -> Result<Json<DocumentList>, AppError> {
    let documents = state
        .vault
        .list(&user_id)
        .await?
        .iter()
        .map(|d| d.summary())
        .collect();
    Ok(Json(DocumentList { documents }))
}

// ============ GET / DELETE /api/v1/vault/documents/{id} ============

async fn handle_get(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    Path(id): Path<String>,
) -> Result<Json<DocumentSummary>, AppError> {
    let doc = state.vault.get(&user_id, &id).await?;
    Ok(Json(doc.summary()))
}

async fn handle_delete(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    state.vault.delete(&user_id, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ============ POST /api/v1/vault/query ============

#[derive(Deserialize)]
pub struct QueryRequest {
    pub query: String,
    #[serde(default)]
    pub top_k: Option<usize>,
}

async fn handle_query(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    request: Result<Json<QueryRequest>, JsonRejection>,
) -> Result<Json<QueryAnswer>, AppError> {
    let Json(request) = request.map_err(|e| bad_request(e.body_text()))?;
    let answer = state
        .vault
        .query(&user_id, &request.query, request.top_k)
        .await?;
    Ok(Json(answer))
}
