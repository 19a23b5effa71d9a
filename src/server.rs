//! Conduit's HTTP API.
//!
//! Served over a Unix domain socket rather than TCP — the daemon is meant to
//! be reached only by local tooling. JSON bodies throughout; errors follow
//! the schema below.
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "query must not be empty" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `semantic_unavailable` (409),
//! `internal` (500).

use std::sync::Arc;

use axum::extract::{Path as AxumPath, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::Utc;
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use tokio::net::UnixListener;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt as _;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;
use uuid::Uuid;

use crate::capability::{CapabilityDetector, CapabilitySnapshot};
use crate::config::Config;
use crate::embedding::EmbeddingProvider;
use crate::error::ConduitError;
use crate::events::EventBus;
use crate::graph_store::GraphStore;
use crate::ingest::{Ingestor, SyncReport};
use crate::models::{Source, SyncMode};
use crate::search::{SearchMode, SearchOptions, Searcher};
use crate::store::Store;
use crate::vector_store::{VectorStore, CHUNKS_COLLECTION};

pub struct AppContext {
    pub config: Config,
    pub store: Store,
    pub vector_store: Option<VectorStore>,
    pub embedder: Option<Box<dyn EmbeddingProvider>>,
    pub graph_store: Option<GraphStore>,
    pub events: EventBus,
}

#[derive(Clone)]
struct AppState(Arc<AppContext>);

pub async fn run_server(ctx: Arc<AppContext>) -> anyhow::Result<()> {
    let socket_path = ctx.config.socket.clone();
    if socket_path.exists() {
        std::fs::remove_file(&socket_path)?;
    }
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let state = AppState(ctx);

    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    let app = Router::new()
        .route("/api/v1/kb/sources", get(list_sources).post(create_source))
        .route("/api/v1/kb/sources/{id}", delete(delete_source))
        .route("/api/v1/kb/sources/{id}/sync", post(sync_source))
        .route("/api/v1/kb/search", get(search))
        .route("/api/v1/kb/migrate", post(migrate))
        .route("/api/v1/events", get(stream_events))
        .route("/api/v1/qdrant/attach", post(attach_qdrant))
        .route("/api/v1/status", get(status))
        .layer(cors)
        .with_state(state);

    info!("listening on unix socket {}", socket_path.display());
    let listener = UnixListener::bind(&socket_path)?;
    axum::serve(listener, app).await?;

    Ok(())
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
        let body = ErrorBody { error: ErrorDetail { code: self.code, message: self.message } };
        (self.status, Json(body)).into_response()
    }
}

impl From<ConduitError> for AppError {
    fn from(err: ConduitError) -> Self {
        let (status, code) = match &err {
            ConduitError::StoreUnavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, "store_unavailable"),
            ConduitError::SemanticUnavailable(_) => (StatusCode::CONFLICT, "semantic_unavailable"),
            ConduitError::GraphUnavailable(_) => (StatusCode::CONFLICT, "graph_unavailable"),
            ConduitError::Extractor { .. } => (StatusCode::BAD_GATEWAY, "extractor_error"),
            ConduitError::PathInvalid(_) => (StatusCode::BAD_REQUEST, "path_invalid"),
            ConduitError::EmbedBatchFailed(_) => (StatusCode::BAD_GATEWAY, "embed_batch_failed"),
            ConduitError::Timeout(_) => (StatusCode::GATEWAY_TIMEOUT, "timeout"),
            ConduitError::Cancelled => (StatusCode::BAD_REQUEST, "cancelled"),
            ConduitError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            ConduitError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            ConduitError::Sqlx(_) => (StatusCode::SERVICE_UNAVAILABLE, "store_unavailable"),
            ConduitError::Io(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
            ConduitError::Other(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        };
        AppError { status, code: code.to_string(), message: err.to_string() }
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError { status: StatusCode::BAD_REQUEST, code: "bad_request".to_string(), message: message.into() }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError { status: StatusCode::NOT_FOUND, code: "not_found".to_string(), message: message.into() }
}

// ============ GET/POST /api/v1/kb/sources ============

async fn list_sources(State(state): State<AppState>) -> Result<Json<Vec<Source>>, AppError> {
    let sources = state.0.store.list_sources().await?;
    Ok(Json(sources))
}

#[derive(Deserialize)]
struct CreateSourceRequest {
    name: String,
    absolute_path: String,
    #[serde(default)]
    patterns: Vec<String>,
    #[serde(default)]
    excludes: Vec<String>,
    #[serde(default = "default_sync_mode")]
    sync_mode: SyncMode,
}

fn default_sync_mode() -> SyncMode {
    SyncMode::Manual
}

async fn create_source(
    State(state): State<AppState>,
    Json(req): Json<CreateSourceRequest>,
) -> Result<Json<Source>, AppError> {
    if req.name.trim().is_empty() {
        return Err(bad_request("name must not be empty"));
    }
    if req.absolute_path.trim().is_empty() {
        return Err(bad_request("absolute_path must not be empty"));
    }

    let source = Source {
        id: Uuid::new_v4().to_string(),
        name: req.name,
        absolute_path: req.absolute_path,
        patterns: if req.patterns.is_empty() { vec!["**/*".to_string()] } else { req.patterns },
        excludes: req.excludes,
        sync_mode: req.sync_mode,
        added_at: Utc::now(),
        last_synced_at: None,
    };
    state.0.store.upsert_source(&source).await?;
    Ok(Json(source))
}

// ============ DELETE /api/v1/kb/sources/{id} ============

#[derive(Serialize)]
struct DeleteSourceResponse {
    documents_deleted: i64,
    vectors_deleted: i64,
}

async fn delete_source(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> Result<Json<DeleteSourceResponse>, AppError> {
    if state.0.store.get_source(&id).await?.is_none() {
        return Err(not_found(format!("source {id} not found")));
    }

    let mut chunk_ids = Vec::new();
    for document in state.0.store.list_documents(&id).await? {
        for chunk in state.0.store.list_chunks_for_document(&document.id).await? {
            chunk_ids.push(chunk.id);
        }
    }

    let counts = state.0.store.delete_source(&id).await?;

    if let Some(vector_store) = &state.0.vector_store {
        if !chunk_ids.is_empty() {
            let _ = vector_store.delete_points(CHUNKS_COLLECTION, &chunk_ids).await;
        }
    }

    Ok(Json(DeleteSourceResponse {
        documents_deleted: counts.documents_deleted,
        vectors_deleted: counts.vectors_deleted,
    }))
}

// ============ POST /api/v1/kb/sources/{id}/sync ============

async fn sync_source(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> Result<Json<SyncReport>, AppError> {
    let source = state.0.store.get_source(&id).await?.ok_or_else(|| not_found(format!("source {id} not found")))?;

    let ingestor = Ingestor {
        store: &state.0.store,
        vector_store: state.0.vector_store.as_ref(),
        embedder: state.0.embedder.as_deref(),
        events: Some(&state.0.events),
        kb: &state.0.config.kb,
    };
    let report = ingestor.sync(&source).await?;
    state.0.store.mark_source_synced(&id).await?;
    Ok(Json(report))
}

// ============ GET /api/v1/kb/search ============

#[derive(Deserialize)]
struct SearchQuery {
    q: String,
    #[serde(default = "default_search_mode")]
    mode: String,
    #[serde(default = "default_search_limit")]
    limit: usize,
    #[serde(default)]
    min_score: f64,
    #[serde(default = "default_semantic_weight")]
    semantic_weight: f64,
    #[serde(default = "default_mmr_lambda")]
    mmr_lambda: f64,
    #[serde(default)]
    mmr: bool,
    #[serde(default)]
    rerank: bool,
    #[serde(default)]
    raw: bool,
    #[serde(default)]
    context_chunks: i64,
}

fn default_search_mode() -> String {
    "hybrid".to_string()
}
fn default_search_limit() -> usize {
    10
}
fn default_semantic_weight() -> f64 {
    0.5
}
fn default_mmr_lambda() -> f64 {
    0.5
}

async fn search(
    State(state): State<AppState>,
    Query(params): Query<SearchQuery>,
) -> Result<Json<crate::search::SearchResponse>, AppError> {
    if params.q.trim().is_empty() {
        return Err(bad_request("q must not be empty"));
    }

    let mode = match params.mode.as_str() {
        "hybrid" => SearchMode::Hybrid,
        "semantic" => SearchMode::Semantic,
        "lexical" => SearchMode::Lexical,
        other => return Err(bad_request(format!("unknown search mode: {other}"))),
    };

    let options = SearchOptions {
        mode,
        limit: params.limit,
        min_score: params.min_score,
        semantic_weight: params.semantic_weight,
        mmr_lambda: params.mmr_lambda,
        enable_mmr: params.mmr,
        enable_rerank: params.rerank,
        raw: params.raw,
        context_chunks: params.context_chunks,
    };

    let searcher =
        Searcher { store: &state.0.store, vector_store: state.0.vector_store.as_ref(), embedder: state.0.embedder.as_deref() };
    let response = searcher.search(&params.q, &options).await?;
    Ok(Json(response))
}

// ============ POST /api/v1/kb/migrate ============

#[derive(Serialize, Default)]
struct MigrateReport {
    documents_embedded: u64,
    chunks_embedded: u64,
    errors: u64,
}

async fn migrate(State(state): State<AppState>) -> Result<Json<MigrateReport>, AppError> {
    let (vector_store, embedder) = match (&state.0.vector_store, &state.0.embedder) {
        (Some(vs), Some(e)) => (vs, e.as_ref()),
        _ => {
            return Err(AppError {
                status: StatusCode::CONFLICT,
                code: "semantic_unavailable".to_string(),
                message: "vector store and embedder must both be configured to migrate".to_string(),
            })
        }
    };

    let mut report = MigrateReport::default();
    for source in state.0.store.list_sources().await? {
        for document in state.0.store.list_documents(&source.id).await? {
            let chunks = state.0.store.list_chunks_for_document(&document.id).await?;
            if chunks.is_empty() {
                continue;
            }
            let texts: Vec<String> = chunks.iter().map(|c| c.content.clone()).collect();
            match embedder.embed_batch(&texts).await {
                Ok(vectors) => {
                    let points: Vec<crate::vector_store::VectorPoint> = chunks
                        .iter()
                        .zip(vectors)
                        .map(|(chunk, vector)| {
                            let mut payload = std::collections::HashMap::new();
                            payload.insert("content".to_string(), serde_json::json!(chunk.content));
                            payload.insert("document_id".to_string(), serde_json::json!(document.id));
                            payload.insert("source_id".to_string(), serde_json::json!(source.id));
                            payload.insert("ordinal".to_string(), serde_json::json!(chunk.ordinal));
                            crate::vector_store::VectorPoint { id: chunk.id.clone(), vector, payload }
                        })
                        .collect();
                    let batch_report = vector_store.upsert_points_batched(CHUNKS_COLLECTION, points, 64).await;
                    if batch_report.failed > 0 {
                        report.errors += batch_report.failed as u64;
                    }
                    report.documents_embedded += 1;
                    report.chunks_embedded += chunks.len() as u64;
                }
                Err(_) => report.errors += 1,
            }
        }
    }

    Ok(Json(report))
}

// ============ GET /api/v1/events ============

async fn stream_events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<SseEvent, std::convert::Infallible>>> {
    let receiver = state.0.events.subscribe();
    let stream = BroadcastStream::new(receiver).filter_map(|result| {
        result.ok().map(|event| Ok(SseEvent::default().event(event.event_type).data(event.data.to_string())))
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

// ============ POST /api/v1/qdrant/attach ============

#[derive(Deserialize)]
struct AttachQdrantRequest {
    url: String,
}

#[derive(Serialize)]
struct AttachQdrantResponse {
    attached: bool,
}

async fn attach_qdrant(Json(req): Json<AttachQdrantRequest>) -> Result<Json<AttachQdrantResponse>, AppError> {
    // Reinitializing the shared VectorStore in place would need interior
    // mutability on AppContext; for now this validates reachability only,
    // the same connection check the capability detector performs.
    VectorStore::connect(&req.url).await?;
    Ok(Json(AttachQdrantResponse { attached: true }))
}

// ============ GET /api/v1/status ============

#[derive(Serialize)]
struct StatusResponse {
    uptime_ms: u128,
    capability: CapabilitySnapshot,
    sources: usize,
    documents: i64,
    chunks: i64,
    entities: i64,
    relations: i64,
}

async fn status(State(state): State<AppState>) -> Result<Json<StatusResponse>, AppError> {
    let detector = CapabilityDetector {
        store: &state.0.store,
        vector_store: state.0.vector_store.as_ref(),
        embedder: state.0.embedder.as_deref(),
        graph_store: state.0.graph_store.as_ref(),
    };
    let capability = detector.probe().await;
    let sources = state.0.store.list_sources().await?.len();
    let (documents, chunks, entities, relations) = state.0.store.total_counts().await?;

    Ok(Json(StatusResponse {
        uptime_ms: state.0.events.uptime_ms(),
        capability,
        sources,
        documents,
        chunks,
        entities,
        relations,
    }))
}
