//! VaultSync Server - multi-master file synchronization backend
//!
//! A hierarchical file-sync service using:
//! - Pointer-propagation writes and incremental tree diffs
//! - Deterministic conflict resolution for multi-master replication
//! - Checkpoint/version sync with self-verifying sums
//! - Sled embedded database for revision-tree persistence
//! - Axum for the HTTP surface

use anyhow::Context;
use axum::{
    extract::{Path, Query, State},
    http::{Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, sync::Arc};
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info};

mod config;
mod storage;
mod sync;

use config::ServerConfig;
use storage::open_store;
use sync::{
    checkpoint::CheckpointChain,
    diff::{DiffOptions, TreeDiff},
    document::GitProvenance,
    resolver::ResolveReport,
    server::RepoSummary,
    ChangeSet, ClientError, SyncError, SyncServer, Timestamp, Version,
};

// ============================================================================
// APPLICATION STATE
// ============================================================================

/// Shared application state
pub struct AppState {
    /// Synchronization engine
    sync_server: Arc<SyncServer>,
}

// ============================================================================
// API TYPES
// ============================================================================

/// File contents on the wire: base64 blobs, `null` deletes
type WireChanges = BTreeMap<String, Option<String>>;

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    replica_id: String,
    repos: usize,
    conflict_sweeps: u64,
    uptime_seconds: u64,
}

#[derive(Debug, Default, Deserialize)]
struct CreateRepoRequest {
    last_git_hash: Option<String>,
    last_git_time: Option<Timestamp>,
}

#[derive(Debug, Deserialize)]
struct ApplyChangesRequest {
    /// Timestamp of the client's last successful sync
    baseline: Timestamp,
    changes: WireChanges,
}

#[derive(Debug, Serialize)]
struct ApplyChangesResponse {
    timestamp: Timestamp,
}

#[derive(Debug, Deserialize)]
struct DiffQuery {
    since: Option<Timestamp>,
    #[serde(default)]
    ignore_timestamps: bool,
}

#[derive(Debug, Deserialize)]
struct UpdatesQuery {
    checkpoint: Option<String>,
}

#[derive(Debug, Serialize)]
struct UpdatesResponse {
    checkpoint: String,
    changes: WireChanges,
    dropped_checkpoints: usize,
}

#[derive(Debug, Deserialize)]
struct WriteUpdatesRequest {
    changes: WireChanges,
}

#[derive(Debug, Serialize)]
struct WriteUpdatesResponse {
    version: Version,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

// ============================================================================
// ERRORS
// ============================================================================

/// Maps engine errors onto HTTP responses
struct ApiError(SyncError);

impl<E: Into<SyncError>> From<E> for ApiError {
    fn from(err: E) -> Self {
        ApiError(err.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self.0 {
            SyncError::Client(client) => (
                StatusCode::from_u16(client.status()).unwrap_or(StatusCode::BAD_REQUEST),
                client.message.clone(),
            ),
            other => {
                error!("Request failed: {}", other);
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
            }
        };
        (status, Json(ErrorResponse { error: message })).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

fn decode_changes(wire: WireChanges) -> Result<ChangeSet, ClientError> {
    wire.into_iter()
        .map(|(path, content)| {
            let bytes = content
                .map(|encoded| STANDARD.decode(encoded.as_bytes()))
                .transpose()
                .map_err(|e| ClientError::bad_request(format!("invalid base64 for {}: {}", path, e)))?;
            Ok((path, bytes))
        })
        .collect()
}

fn encode_changes(changes: ChangeSet) -> WireChanges {
    changes
        .into_iter()
        .map(|(path, content)| (path, content.map(|bytes| STANDARD.encode(bytes))))
        .collect()
}

// ============================================================================
// HTTP HANDLERS
// ============================================================================

/// Health check endpoint
async fn health_check(State(state): State<Arc<AppState>>) -> ApiResult<HealthResponse> {
    let stats = state.sync_server.stats().await?;

    Ok(Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        replica_id: stats.replica_id,
        repos: stats.repos,
        conflict_sweeps: stats.conflict_sweeps,
        uptime_seconds: stats.uptime_seconds,
    }))
}

/// Create a new repo
async fn create_repo(
    State(state): State<Arc<AppState>>,
    Path(repo_id): Path<String>,
    payload: Option<Json<CreateRepoRequest>>,
) -> ApiResult<RepoSummary> {
    let request = payload.map(|Json(request)| request).unwrap_or_default();
    let provenance = GitProvenance {
        last_git_hash: request.last_git_hash,
        last_git_time: request.last_git_time,
    };

    let summary = state.sync_server.create_repo(&repo_id, provenance).await?;
    info!("Created repo: {}", repo_id);
    Ok(Json(summary))
}

async fn get_repo(State(state): State<Arc<AppState>>, Path(repo_id): Path<String>) -> ApiResult<RepoSummary> {
    Ok(Json(state.sync_server.repo_summary(&repo_id).await?))
}

async fn apply_changes(
    State(state): State<Arc<AppState>>,
    Path(repo_id): Path<String>,
    Json(request): Json<ApplyChangesRequest>,
) -> ApiResult<ApplyChangesResponse> {
    let changes = decode_changes(request.changes)?;
    let timestamp = state
        .sync_server
        .apply_change_set(&repo_id, &changes, request.baseline)
        .await?;
    Ok(Json(ApplyChangesResponse { timestamp }))
}

async fn diff_since(
    State(state): State<Arc<AppState>>,
    Path(repo_id): Path<String>,
    Query(query): Query<DiffQuery>,
) -> ApiResult<TreeDiff> {
    let options = DiffOptions {
        ignore_timestamps: query.ignore_timestamps,
    };
    let diff = state
        .sync_server
        .diff_since(&repo_id, query.since.unwrap_or(0), options)
        .await?;
    Ok(Json(diff))
}

async fn resolve_conflicts(
    State(state): State<Arc<AppState>>,
    Path(repo_id): Path<String>,
) -> ApiResult<ResolveReport> {
    Ok(Json(state.sync_server.resolve_conflicts(&repo_id).await?))
}

async fn read_updates(
    State(state): State<Arc<AppState>>,
    Path(repo_id): Path<String>,
    Query(query): Query<UpdatesQuery>,
) -> ApiResult<UpdatesResponse> {
    let chain = CheckpointChain::parse(query.checkpoint.as_deref().unwrap_or(""))?;
    let updates = state.sync_server.checkpoint_read(&repo_id, &chain).await?;
    Ok(Json(UpdatesResponse {
        checkpoint: updates
            .chain
            .encode(state.sync_server.config().checkpoint_chain_limit),
        changes: encode_changes(updates.changes),
        dropped_checkpoints: updates.dropped,
    }))
}

async fn write_updates(
    State(state): State<Arc<AppState>>,
    Path(repo_id): Path<String>,
    Json(request): Json<WriteUpdatesRequest>,
) -> ApiResult<WriteUpdatesResponse> {
    let changes = decode_changes(request.changes)?;
    let version = state.sync_server.checkpoint_write(&repo_id, &changes).await?;
    Ok(Json(WriteUpdatesResponse { version }))
}

fn router(state: Arc<AppState>) -> Router {
    // Set up CORS
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        // Health check
        .route("/health", get(health_check))
        // Repo management
        .route("/api/repos/:repo_id", get(get_repo).post(create_repo))
        // Tree sync
        .route("/api/repos/:repo_id/changes", post(apply_changes))
        .route("/api/repos/:repo_id/diff", get(diff_since))
        .route("/api/repos/:repo_id/resolve", post(resolve_conflicts))
        // Checkpoint sync
        .route(
            "/api/repos/:repo_id/updates",
            get(read_updates).post(write_updates),
        )
        // Add state and middleware
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors),
        )
}

async fn shutdown_signal(server: Arc<SyncServer>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
    info!("Shutdown requested");
    server.shutdown();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vaultsync_server=info,tower_http=info".into()),
        )
        .init();

    let config = ServerConfig::from_env()?;

    info!(
        "Initializing {:?} storage at: {}",
        config.storage.backend, config.storage.path
    );
    let store = open_store(&config.storage).context("failed to open storage")?;
    info!("Storage initialized successfully");

    let sync_server = Arc::new(SyncServer::new(store, config.sync.clone()));
    let background_handles = sync_server.clone().start_background_tasks();

    let state = Arc::new(AppState {
        sync_server: sync_server.clone(),
    });
    let app = router(state);

    let addr = config.addr();
    info!("VaultSync server v{} starting", env!("CARGO_PKG_VERSION"));
    info!("   Listening on: http://{}", addr);
    info!("   Health check: http://{}/health", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind to {}", addr))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(sync_server))
        .await
        .context("server error")?;

    background_handles.wait().await;
    info!("Server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use crate::storage::MemoryStore;
    use tower::ServiceExt;

    fn app() -> Router {
        let server = SyncServer::with_store(Arc::new(MemoryStore::new()));
        router(Arc::new(AppState {
            sync_server: Arc::new(server),
        }))
    }

    async fn call(app: &Router, method: &str, uri: &str, body: Option<serde_json::Value>) -> (StatusCode, serde_json::Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json");
        let request = match body {
            Some(json) => request.body(Body::from(json.to_string())).unwrap(),
            None => request.body(Body::empty()).unwrap(),
        };
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    #[tokio::test]
    async fn test_change_and_diff_round_trip() {
        let app = app();
        let (status, repo) = call(&app, "POST", "/api/repos/r", Some(serde_json::json!({}))).await;
        assert_eq!(status, StatusCode::OK);
        let t0 = repo["timestamp"].as_i64().unwrap();

        let (status, written) = call(
            &app,
            "POST",
            "/api/repos/r/changes",
            Some(serde_json::json!({ "baseline": t0, "changes": { "/docs/a.txt": STANDARD.encode("hello") } })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let t1 = written["timestamp"].as_i64().unwrap();

        let (status, diff) = call(&app, "GET", &format!("/api/repos/r/diff?since={}", t0), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(diff["paths"]["/docs/a.txt"].as_i64(), Some(t1));
        assert_eq!(diff["is_consistent"], serde_json::Value::Bool(true));

        let (status, updates) = call(&app, "GET", "/api/repos/r/updates", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(updates["checkpoint"], "1:1");
        assert_eq!(updates["changes"]["/docs/a.txt"], STANDARD.encode("hello"));
    }

    #[tokio::test]
    async fn test_client_errors_map_to_status() {
        let app = app();
        let (status, _) = call(&app, "GET", "/api/repos/missing", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        call(&app, "POST", "/api/repos/r", None).await;
        let (status, body) = call(&app, "POST", "/api/repos/r", None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(body["error"].as_str().unwrap().contains("already exists"));

        let (status, _) = call(
            &app,
            "POST",
            "/api/repos/r/changes",
            Some(serde_json::json!({ "baseline": 0, "changes": { "/gone": null } })),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

        let (status, _) = call(
            &app,
            "POST",
            "/api/repos/r/changes",
            Some(serde_json::json!({ "baseline": 0, "changes": { "/f": "not base64!" } })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(&app, "GET", "/api/repos/r/updates?checkpoint=oops", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
