//! HTTP API.
//!
//! Endpoints:
//! - `GET  /health`  - node status and cache summary
//! - `POST /search`  - run a semantic search
//! - `POST /refresh` - force a corpus refresh
//! - `GET  /metrics` - Prometheus metrics (when a recorder is installed)

use axum::{
    extract::State,
    http::{HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::ApiConfig;
use crate::error::{Error, Result};
use crate::search::{SearchContext, SearchQuery, SimilarityResult};

/// Shared state for request handlers.
#[derive(Clone)]
pub struct AppState {
    pub search: SearchContext,
    pub start_time: Instant,
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(search: SearchContext) -> Self {
        Self {
            search,
            start_time: Instant::now(),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }
}

/// Health check response.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    /// Entries in the current cache snapshot.
    pub entries: usize,
    /// Last cache refresh (epoch millis).
    pub last_refreshed: Option<u64>,
    /// Uptime in seconds.
    pub uptime: u64,
}

/// Search request body.
#[derive(Debug, Serialize, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    #[serde(default)]
    pub top_k: Option<usize>,
}

/// Refresh response body.
#[derive(Debug, Serialize, Deserialize)]
pub struct RefreshResponse {
    pub entries: usize,
    pub last_refreshed: Option<u64>,
}

/// Error body returned for failed requests.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub kind: String,
}

/// Wrapper mapping search errors onto HTTP responses.
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        ApiError(err)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            Error::EmptyQuery => StatusCode::BAD_REQUEST,
            Error::EmbeddingUnavailable(_) => StatusCode::BAD_GATEWAY,
            Error::CacheUnavailable(_) | Error::Corpus(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = ErrorResponse {
            error: self.0.to_string(),
            kind: self.0.kind().to_string(),
        };
        (status, Json(body)).into_response()
    }
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let snapshot = state.search.cache().get();
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        entries: snapshot.len(),
        last_refreshed: snapshot.last_refreshed,
        uptime: state.start_time.elapsed().as_secs(),
    })
}

async fn search(
    State(state): State<AppState>,
    Json(request): Json<SearchRequest>,
) -> std::result::Result<Json<Vec<SimilarityResult>>, ApiError> {
    let mut query = SearchQuery::new(request.query);
    query.top_k = request.top_k;
    let results = state.search.search(&query).await?;
    Ok(Json(results))
}

async fn refresh(
    State(state): State<AppState>,
) -> std::result::Result<Json<RefreshResponse>, ApiError> {
    state.search.refresh().await?;
    let snapshot = state.search.cache().get();
    Ok(Json(RefreshResponse {
        entries: snapshot.len(),
        last_refreshed: snapshot.last_refreshed,
    }))
}

async fn metrics(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => handle.render().into_response(),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed").into_response(),
    }
}

/// Build the API router.
pub fn router(state: AppState, config: &ApiConfig) -> Router {
    let mut router = Router::new()
        .route("/health", get(health))
        .route("/search", post(search))
        .route("/refresh", post(refresh))
        .route("/metrics", get(metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    if config.cors_enabled {
        router = router.layer(cors_layer(&config.cors_origins));
    }
    router
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);

    if origins.is_empty() {
        return layer.allow_origin(Any);
    }

    let parsed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(v) => Some(v),
            Err(_) => {
                warn!("Ignoring invalid CORS origin: {}", o);
                None
            }
        })
        .collect();
    layer.allow_origin(AllowOrigin::list(parsed))
}

/// HTTP API server.
pub struct ApiServer {
    config: ApiConfig,
    state: AppState,
}

impl ApiServer {
    pub fn with_state(config: ApiConfig, state: AppState) -> Self {
        Self { config, state }
    }

    /// Serve until the process is stopped.
    pub async fn run(self, addr: &str) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| Error::Api(format!("Failed to bind {}: {}", addr, e)))?;
        info!("API listening on {}", addr);

        let app = router(self.state, &self.config);
        axum::serve(listener, app)
            .await
            .map_err(|e| Error::Api(format!("Server error: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::{
        CacheManagerConfig, EmbeddingCacheManager, EmbeddingEntry, EmbeddingFetcher,
        InMemoryCorpus, MemoryStorage,
    };
    use async_trait::async_trait;
    use axum_test::TestServer;
    use std::time::Duration;

    struct FixedFetcher;

    #[async_trait]
    impl EmbeddingFetcher for FixedFetcher {
        async fn fetch_embedding(&self, text: &str) -> Result<Vec<f32>> {
            match text {
                "hello" => Ok(vec![1.0, 0.0]),
                "wide" => Ok(vec![1.0, 0.0, 0.0]),
                _ => Err(Error::EmbeddingUnavailable("endpoint returned 500".into())),
            }
        }
    }

    fn state(corpus: Arc<InMemoryCorpus>) -> AppState {
        let manager = EmbeddingCacheManager::new(
            Arc::new(MemoryStorage::new()),
            CacheManagerConfig {
                ttl: Duration::from_secs(300),
                dimension: Some(2),
            },
        );
        AppState::new(SearchContext::new(
            Arc::new(manager),
            Arc::new(FixedFetcher),
            corpus,
        ))
    }

    fn corpus() -> Arc<InMemoryCorpus> {
        Arc::new(InMemoryCorpus::new(vec![
            EmbeddingEntry::new("1", "hello world", vec![1.0, 0.0], 1),
            EmbeddingEntry::new("2", "goodbye", vec![0.0, 1.0], 2),
        ]))
    }

    fn server(state: AppState) -> TestServer {
        TestServer::new(router(state, &ApiConfig::default())).unwrap()
    }

    #[tokio::test]
    async fn test_health_reports_cache_summary() {
        let server = server(state(corpus()));
        let response = server.get("/health").await;
        response.assert_status_ok();

        let health: HealthResponse = response.json();
        assert_eq!(health.status, "ok");
        assert_eq!(health.entries, 0);
        assert_eq!(health.last_refreshed, None);
    }

    #[tokio::test]
    async fn test_search_returns_ranked_results() {
        let server = server(state(corpus()));
        let response = server
            .post("/search")
            .json(&serde_json::json!({"query": "hello", "top_k": 1}))
            .await;
        response.assert_status_ok();

        let results: Vec<SimilarityResult> = response.json();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].entry.text, "hello world");
    }

    #[tokio::test]
    async fn test_empty_query_is_bad_request() {
        let server = server(state(corpus()));
        let response = server
            .post("/search")
            .json(&serde_json::json!({"query": "  "}))
            .await;
        response.assert_status(StatusCode::BAD_REQUEST);

        let body: ErrorResponse = response.json();
        assert_eq!(body.kind, "empty_query");
    }

    #[tokio::test]
    async fn test_embedding_failure_is_bad_gateway() {
        let server = server(state(corpus()));
        let response = server
            .post("/search")
            .json(&serde_json::json!({"query": "unknown"}))
            .await;
        response.assert_status(StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_cache_unavailable_is_service_unavailable() {
        let corpus = corpus();
        corpus.set_failure(Some("backend down"));
        let server = server(state(corpus));
        let response = server
            .post("/search")
            .json(&serde_json::json!({"query": "hello"}))
            .await;
        response.assert_status(StatusCode::SERVICE_UNAVAILABLE);

        let body: ErrorResponse = response.json();
        assert_eq!(body.kind, "cache_unavailable");
    }

    #[tokio::test]
    async fn test_dimension_mismatch_is_internal_error() {
        let server = server(state(corpus()));
        let response = server
            .post("/search")
            .json(&serde_json::json!({"query": "wide"}))
            .await;
        response.assert_status(StatusCode::INTERNAL_SERVER_ERROR);

        let body: ErrorResponse = response.json();
        assert_eq!(body.kind, "dimension_mismatch");
    }

    #[tokio::test]
    async fn test_refresh_populates_cache() {
        let server = server(state(corpus()));
        let response = server.post("/refresh").await;
        response.assert_status_ok();

        let body: RefreshResponse = response.json();
        assert_eq!(body.entries, 2);
        assert!(body.last_refreshed.is_some());

        let health: HealthResponse = server.get("/health").await.json();
        assert_eq!(health.entries, 2);
    }

    #[tokio::test]
    async fn test_metrics_without_recorder_is_not_found() {
        let server = server(state(corpus()));
        server
            .get("/metrics")
            .await
            .assert_status(StatusCode::NOT_FOUND);
    }
}
