//! HTTP API for memvault
//!
//! A thin JSON adapter over [`VaultService`]. Every handler maps one boundary
//! operation; errors are rendered as `{"error": {"code", "message"}}`.
//!
//! ## Endpoint Map
//!
//! | Method   | Path                          | Operation          |
//! |----------|-------------------------------|--------------------|
//! | `GET`    | `/health`                     | Health probe       |
//! | `GET`    | `/api/v1/memories?tags=a,b`   | `list_memories`    |
//! | `POST`   | `/api/v1/memories`            | `add_memory`       |
//! | `GET`    | `/api/v1/memories/:id`        | `get_memory_by_id` |
//! | `GET`    | `/api/v1/memories/:id/media`  | Raw media bytes    |
//! | `PATCH`  | `/api/v1/memories/:id`        | `update_memory`    |
//! | `DELETE` | `/api/v1/memories/:id`        | `delete_memory`    |
//! | `GET`    | `/api/v1/sync/status`         | Sync status        |

use crate::error::Error;
use crate::index::{
    ListFilter, MemoryId, MemoryPatch, MemoryRecord, TitleConflict, TranscriptionConflict,
};
use crate::ingest::{parse_tags, NewMemory};
use crate::service::VaultService;
use crate::sync::{SyncEngine, SyncStatus};
use crate::vault::MemoryDetail;
use axum::{
    extract::{DefaultBodyLimit, Path, Query, State},
    http::{header, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Shared state for the vault handlers
#[derive(Clone)]
pub struct AppState {
    pub service: VaultService,
    /// Present when background sync is enabled
    pub sync: Option<Arc<SyncEngine>>,
}

/// Build the complete HTTP application with CORS and request tracing
pub fn build_app(state: AppState, cors_origins: &[String]) -> Router {
    vault_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(build_cors(cors_origins))
}

/// Vault routes without middleware
pub fn vault_router(state: AppState) -> Router {
    // Base64 inflates media by a third
    let max_media = state.service.vault().config().ingest.max_media_bytes;
    let body_limit = max_media / 3 * 4 + 64 * 1024;

    Router::new()
        .route("/health", get(health_check))
        .route("/api/v1/memories", get(list_memories).post(add_memory))
        .route(
            "/api/v1/memories/:id",
            get(get_memory).patch(update_memory).delete(delete_memory),
        )
        .route("/api/v1/memories/:id/media", get(get_media))
        .route("/api/v1/sync/status", get(sync_status))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}

// =============================================================================
// Errors
// =============================================================================

/// API error body
#[derive(Debug, Serialize)]
pub struct ApiError {
    #[serde(skip)]
    status: StatusCode,
    pub error: ApiErrorDetail,
}

/// API error detail
#[derive(Debug, Serialize)]
pub struct ApiErrorDetail {
    pub code: String,
    pub message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            error: ApiErrorDetail {
                code: "BAD_REQUEST".to_string(),
                message: message.into(),
            },
        }
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        let status = status_for(&err);
        if status.is_server_error() {
            tracing::warn!(code = err.code(), "Request failed: {}", err);
        }
        Self {
            status,
            error: ApiErrorDetail {
                code: err.code().to_string(),
                message: err.to_string(),
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

fn status_for(err: &Error) -> StatusCode {
    match err {
        Error::Validation(_) => StatusCode::BAD_REQUEST,
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::Conflict(_) | Error::SyncConflict(_) => StatusCode::CONFLICT,
        Error::VersionMismatch { .. } => StatusCode::PRECONDITION_FAILED,
        Error::Corruption(_) | Error::Crypto(_) | Error::HashCollision(_) => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        Error::VaultLocked => StatusCode::LOCKED,
        Error::StorageExhausted(_) => StatusCode::INSUFFICIENT_STORAGE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

fn parse_id(id: &str) -> ApiResult<MemoryId> {
    Ok(id.parse::<MemoryId>()?)
}

// =============================================================================
// Request / response bodies
// =============================================================================

/// Tags as a JSON array or a comma-separated string
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TagsInput {
    List(Vec<String>),
    Csv(String),
}

impl Default for TagsInput {
    fn default() -> Self {
        TagsInput::List(Vec::new())
    }
}

impl TagsInput {
    fn into_set(self) -> BTreeSet<String> {
        match self {
            TagsInput::List(tags) => tags
                .into_iter()
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect(),
            TagsInput::Csv(csv) => parse_tags(&csv),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateMemoryRequest {
    title: String,
    #[serde(default)]
    tags: TagsInput,
    /// Standard base64
    media_data: String,
    #[serde(default)]
    filename: String,
    #[serde(default)]
    media_type: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateMemoryRequest {
    title: Option<String>,
    tags: Option<TagsInput>,
    /// Empty string removes the transcription
    transcription: Option<String>,
    #[serde(default)]
    clear_conflicts: bool,
    expected_version: u64,
}

#[derive(Debug, Default, Deserialize)]
struct ListQuery {
    tags: Option<String>,
    tag: Option<String>,
}

/// Record metadata as exposed over HTTP (no key material)
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MemoryView {
    id: MemoryId,
    title: String,
    tags: BTreeSet<String>,
    created_at: DateTime<Utc>,
    media_type: String,
    filename: String,
    content_hash: String,
    size_bytes: u64,
    version: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    transcription: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    conflicts: Vec<TitleConflict>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    transcription_conflicts: Vec<TranscriptionConflict>,
}

impl From<&MemoryRecord> for MemoryView {
    fn from(record: &MemoryRecord) -> Self {
        Self {
            id: record.id,
            title: record.title.clone(),
            tags: record.tags.clone(),
            created_at: record.created_at,
            media_type: record.media_type.clone(),
            filename: record.filename.clone(),
            content_hash: record.content_hash.to_string(),
            size_bytes: record.size_bytes,
            version: record.version,
            transcription: record.transcription.clone(),
            conflicts: record.conflicts.clone(),
            transcription_conflicts: record.transcription_conflicts.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MemoryDetailView {
    id: MemoryId,
    title: String,
    tags: BTreeSet<String>,
    created_at: DateTime<Utc>,
    media_type: String,
    filename: String,
    size_bytes: u64,
    version: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    transcription: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    conflicts: Vec<TitleConflict>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    transcription_conflicts: Vec<TranscriptionConflict>,
    media_data: String,
}

impl From<MemoryDetail> for MemoryDetailView {
    fn from(detail: MemoryDetail) -> Self {
        Self {
            media_data: STANDARD.encode(&detail.media),
            id: detail.id,
            title: detail.title,
            tags: detail.tags,
            created_at: detail.created_at,
            media_type: detail.media_type,
            filename: detail.filename,
            size_bytes: detail.size_bytes,
            version: detail.version,
            transcription: detail.transcription,
            conflicts: detail.conflicts,
            transcription_conflicts: detail.transcription_conflicts,
        }
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Serialize)]
struct SyncStatusResponse {
    enabled: bool,
    #[serde(flatten)]
    status: Option<SyncStatus>,
}

// =============================================================================
// Handlers
// =============================================================================

async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// GET /api/v1/memories
async fn list_memories(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> ApiResult<impl IntoResponse> {
    let mut tags = BTreeSet::new();
    for csv in query.tags.iter().chain(query.tag.iter()) {
        tags.extend(parse_tags(csv));
    }
    let summaries = state.service.list_memories(ListFilter::tags(tags)).await?;
    Ok(Json(summaries))
}

/// POST /api/v1/memories
async fn add_memory(
    State(state): State<AppState>,
    Json(request): Json<CreateMemoryRequest>,
) -> ApiResult<impl IntoResponse> {
    let media = STANDARD
        .decode(request.media_data.trim())
        .map_err(|e| ApiError::bad_request(format!("mediaData is not valid base64: {}", e)))?;

    let record = state
        .service
        .add_memory(NewMemory {
            title: request.title,
            tags: request.tags.into_set(),
            media,
            filename: request.filename,
            media_type: request.media_type,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(MemoryView::from(&record))))
}

/// GET /api/v1/memories/:id
async fn get_memory(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let detail = state.service.get_memory_by_id(parse_id(&id)?).await?;
    Ok(Json(MemoryDetailView::from(detail)))
}

/// GET /api/v1/memories/:id/media
async fn get_media(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let detail = state.service.get_memory_by_id(parse_id(&id)?).await?;
    let disposition = format!("inline; filename=\"{}\"", detail.filename.replace('"', ""));
    Ok((
        [
            (header::CONTENT_TYPE, detail.media_type),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        detail.media,
    ))
}

/// PATCH /api/v1/memories/:id
async fn update_memory(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<UpdateMemoryRequest>,
) -> ApiResult<impl IntoResponse> {
    let patch = MemoryPatch {
        title: request.title,
        tags: request.tags.map(TagsInput::into_set),
        transcription: request.transcription,
        clear_conflicts: request.clear_conflicts,
    };
    let record = state
        .service
        .update_memory(parse_id(&id)?, patch, request.expected_version)
        .await?;
    Ok(Json(MemoryView::from(&record)))
}

/// DELETE /api/v1/memories/:id
async fn delete_memory(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    state.service.delete_memory(parse_id(&id)?).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /api/v1/sync/status
async fn sync_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(SyncStatusResponse {
        enabled: state.sync.is_some(),
        status: state.sync.as_ref().map(|engine| engine.status()),
    })
}

// =============================================================================
// CORS
// =============================================================================

fn build_cors(origins: &[String]) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([header::CONTENT_TYPE, header::ACCEPT]);

    if origins.is_empty() {
        cors.allow_origin(Any)
    } else {
        let parsed: Vec<_> = origins.iter().filter_map(|o| o.parse().ok()).collect();
        cors.allow_origin(parsed)
    }
}
