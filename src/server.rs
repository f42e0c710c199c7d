//! HTTP front end.
//!
//! A thin JSON layer over [`SearchService`]. Identity comes from the
//! request (`user` and `groups` query parameters); authenticating it is the
//! job of whatever sits in front of this server.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/search` | Run a query (`q`, `user`, `groups`, `root`, `category`, `strict`, `recursive`, `offset`, `limit`) |
//! | `GET`  | `/admin/stats` | Indexer statistics |
//! | `POST` | `/admin/commit` | Commit the index now |
//! | `POST` | `/admin/crawl` | Schedule a full crawl (`{"path": "/lab", "force": true}`) |
//! | `POST` | `/admin/clear` | Drop the index and re-crawl everything |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "Incomplete query: ..." } }
//! ```
//!
//! Error codes: `bad_request` (400), `unavailable` (503), `internal` (500).

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crawldex_core::models::SearchResult;
use crawldex_core::path::ResourcePath;
use crawldex_core::security::Identity;

use crate::search::{SearchError, SearchRequest};
use crate::service::SearchService;
use crate::stats::IndexerStats;

/// Builds the router. Split out from [`run_server`] so tests can bind
/// their own listener.
pub fn router(service: Arc<SearchService>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/search", get(handle_search))
        .route("/admin/stats", get(handle_stats))
        .route("/admin/commit", post(handle_commit))
        .route("/admin/crawl", post(handle_crawl))
        .route("/admin/clear", post(handle_clear))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(service)
}

/// Serves on `[server].bind` until the process receives Ctrl-C, then shuts
/// the service down cleanly.
pub async fn run_server(service: Arc<SearchService>) -> anyhow::Result<()> {
    let bind_addr = service.config().server.bind.clone();
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!(addr = %bind_addr, "search server listening");
    println!("crawldex listening on http://{}", bind_addr);

    axum::serve(listener, router(service.clone()))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    service.shutdown().await;
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

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request",
        message: message.into(),
    }
}

fn internal(err: impl std::fmt::Display) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal",
        message: err.to_string(),
    }
}

impl From<SearchError> for AppError {
    fn from(err: SearchError) -> Self {
        match err {
            SearchError::InvalidQuery(message) => bad_request(message),
            // The index is down or misconfigured; the caller can retry.
            SearchError::Index(e) => AppError {
                status: StatusCode::SERVICE_UNAVAILABLE,
                code: "unavailable",
                message: e.to_string(),
            },
        }
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

// ============ GET /search ============

#[derive(Debug, Deserialize)]
struct SearchParams {
    q: String,
    #[serde(default)]
    user: Option<String>,
    /// Comma-separated group names.
    #[serde(default)]
    groups: Option<String>,
    root: String,
    #[serde(default)]
    current: Option<String>,
    /// Comma-separated category names.
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    strict: bool,
    #[serde(default = "default_recursive")]
    recursive: bool,
    #[serde(default)]
    offset: usize,
    #[serde(default)]
    limit: Option<usize>,
}

fn default_recursive() -> bool {
    true
}

fn split_list(value: Option<&str>) -> Vec<String> {
    value
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

async fn handle_search(
    State(service): State<Arc<SearchService>>,
    Query(params): Query<SearchParams>,
) -> Result<Json<SearchResult>, AppError> {
    let identity = match params.user {
        Some(name) => Identity {
            name,
            groups: split_list(params.groups.as_deref()),
        },
        None => Identity::guest(),
    };
    let mut request = SearchRequest::new(params.q, identity, params.root);
    request.categories = split_list(params.category.as_deref());
    request.strict_categories = params.strict;
    request.current = params.current;
    request.recursive = params.recursive;
    request.offset = params.offset;
    request.limit = params
        .limit
        .unwrap_or(service.config().search.default_limit);

    let result = service.search(&request).await?;
    Ok(Json(result))
}

// ============ /admin ============

async fn handle_stats(State(service): State<Arc<SearchService>>) -> Json<IndexerStats> {
    Json(service.indexer_stats().await)
}

#[derive(Serialize)]
struct Ack {
    ok: bool,
}

async fn handle_commit(State(service): State<Arc<SearchService>>) -> Result<Json<Ack>, AppError> {
    service.commit().await.map_err(internal)?;
    Ok(Json(Ack { ok: true }))
}

#[derive(Debug, Default, Deserialize)]
struct CrawlBody {
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    force: bool,
}

#[derive(Serialize)]
struct CrawlScheduled {
    directories: u64,
}

async fn handle_crawl(
    State(service): State<Arc<SearchService>>,
    body: Option<Json<CrawlBody>>,
) -> Result<Json<CrawlScheduled>, AppError> {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let path = match body.path.as_deref() {
        Some(p) => ResourcePath::parse(p).map_err(|e| bad_request(e.to_string()))?,
        None => ResourcePath::root(),
    };
    let directories = service
        .start_full_crawl(&path, body.force)
        .await
        .map_err(|e| internal(format!("{e:#}")))?;
    Ok(Json(CrawlScheduled { directories }))
}

async fn handle_clear(State(service): State<Arc<SearchService>>) -> Result<Json<Ack>, AppError> {
    service
        .clear()
        .await
        .map_err(|e| internal(format!("{e:#}")))?;
    Ok(Json(Ack { ok: true }))
}
