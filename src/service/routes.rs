//! Axum routes for the observability service.

use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    middleware,
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::crawl::CrawlStatus;
use crate::index::FlushReport;
use crate::supervisor::SupervisorError;
use crate::types::{CrawlResult, GroupId, Neighbors, ScoredPost};

use super::middleware::{metrics_middleware, record_admin_delete};
use super::state::ServiceState;

/// State handed to every handler.
pub type AppState = ServiceState;

// ============================================================================
// Request/Response Types
// ============================================================================

/// Query of the ranked-posts endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RankedQuery {
    /// Rank as of this instant instead of now.
    pub at: Option<DateTime<Utc>>,
}

/// Ranked posts of a group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankedResponse {
    /// Group ranked.
    pub group_id: GroupId,
    /// Instant the ranking was computed for.
    pub at: DateTime<Utc>,
    /// Posts, best first.
    pub posts: Vec<ScoredPost>,
}

/// Active crawl, if any.
#[derive(Debug, Clone, Serialize)]
pub struct CrawlStatusResponse {
    /// Whether a crawl is running.
    pub active: bool,
    /// Snapshot of the running crawl.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<CrawlStatus>,
}

/// Request to delete ephemeral rows by key prefix.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeletePrefixRequest {
    /// Storage-key prefix, e.g. `post_index:4:`.
    pub prefix: String,
}

/// Rows removed by an administrative operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeletedResponse {
    /// Rows deleted from the ephemeral store.
    pub deleted: u64,
}

/// Service health response (detailed).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    /// `healthy` or `degraded`.
    pub status: String,
    /// Crate version.
    pub version: String,
    /// Whether the periodic tasks run.
    pub workers_started: bool,
    /// Whether a crawl is active.
    pub crawl_active: bool,
    /// Groups with a crawl result on record.
    pub crawled_groups: usize,
    /// Ephemeral rows, when the store answered.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ephemeral_rows: Option<u64>,
    /// Service start time.
    pub started_at: DateTime<Utc>,
}

/// Simple liveness response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LivenessResponse {
    /// Always `alive`.
    pub status: String,
}

/// Readiness response with dependency status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResponse {
    /// Whether traffic may be routed here.
    pub ready: bool,
    /// Whether the ephemeral store answered.
    pub ephemeral_store: bool,
    /// Failure detail.
    pub details: Option<String>,
}

/// Structured error response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Human-readable error message.
    pub error: String,
    /// Machine-readable error code.
    pub code: String,
    /// Additional error details (optional).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorResponse {
    /// Create a new error response with code and message.
    pub fn new(code: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            code: code.into(),
            details: None,
        }
    }

    /// Add details to the error.
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, error: ErrorResponse) -> ApiError {
    tracing::warn!(code = %error.code, error = %error.error, "Request error");
    (status, Json(error))
}

impl From<SupervisorError> for ErrorResponse {
    fn from(e: SupervisorError) -> Self {
        let code = match &e {
            SupervisorError::Config(_) => "CONFIG",
            SupervisorError::Store(_) => "STORE_FAILED",
            SupervisorError::Crawl(_) => "CRAWL_FAILED",
            SupervisorError::Ranking(_) => "RANKING_FAILED",
            SupervisorError::EmptyPrefix => "EMPTY_PREFIX",
        };
        ErrorResponse::new(code, e.to_string())
    }
}

fn internal(e: SupervisorError) -> ApiError {
    api_error(StatusCode::INTERNAL_SERVER_ERROR, e.into())
}

// ============================================================================
// Route Handlers
// ============================================================================

async fn neighbors_handler(
    State(state): State<AppState>,
    Path(group): Path<u64>,
) -> Result<Json<Neighbors>, ApiError> {
    state.supervisor.get_neighbors(GroupId(group)).map(Json).ok_or_else(|| {
        api_error(
            StatusCode::NOT_FOUND,
            ErrorResponse::new("NO_NEIGHBORS", format!("No neighbors computed for group {}", group)),
        )
    })
}

async fn crawl_result_handler(
    State(state): State<AppState>,
    Path(group): Path<u64>,
) -> Result<Json<CrawlResult>, ApiError> {
    state.supervisor.get_crawl_result(GroupId(group)).map(Json).ok_or_else(|| {
        api_error(
            StatusCode::NOT_FOUND,
            ErrorResponse::new("NEVER_CRAWLED", format!("Group {} has not been crawled", group)),
        )
    })
}

async fn crawl_status_handler(State(state): State<AppState>) -> Json<CrawlStatusResponse> {
    let status = state.supervisor.get_crawl_status();
    Json(CrawlStatusResponse { active: status.is_some(), status })
}

async fn ranked_handler(
    State(state): State<AppState>,
    Path(group): Path<u64>,
    Query(query): Query<RankedQuery>,
) -> Result<Json<RankedResponse>, ApiError> {
    let at = query.at.unwrap_or_else(|| state.supervisor.now());
    let posts = state.supervisor.get_ranked_posts(GroupId(group), at).await.map_err(internal)?;
    Ok(Json(RankedResponse { group_id: GroupId(group), at, posts }))
}

async fn delete_prefix_handler(
    State(state): State<AppState>,
    Json(request): Json<DeletePrefixRequest>,
) -> Result<Json<DeletedResponse>, ApiError> {
    if !state.admin_enabled() {
        return Err(api_error(
            StatusCode::FORBIDDEN,
            ErrorResponse::new("ADMIN_DISABLED", "Administrative endpoints are disabled"),
        ));
    }
    if !ServiceState::is_deletable_prefix(&request.prefix) {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            ErrorResponse::new("INVALID_PREFIX", "Prefix must start with an ephemeral table prefix")
                .with_details(request.prefix),
        ));
    }

    let deleted = state.supervisor.delete_ephemeral_indices(&request.prefix).await.map_err(internal)?;
    record_admin_delete(&request.prefix, deleted);
    Ok(Json(DeletedResponse { deleted }))
}

async fn sweep_handler(State(state): State<AppState>) -> Result<Json<DeletedResponse>, ApiError> {
    if !state.admin_enabled() {
        return Err(api_error(
            StatusCode::FORBIDDEN,
            ErrorResponse::new("ADMIN_DISABLED", "Administrative endpoints are disabled"),
        ));
    }
    let now = state.supervisor.now();
    let deleted = state.supervisor.delete_expired_ephemeral_data(now).await.map_err(internal)?;
    Ok(Json(DeletedResponse { deleted }))
}

async fn flush_handler(State(state): State<AppState>) -> Result<Json<FlushReport>, ApiError> {
    if !state.admin_enabled() {
        return Err(api_error(
            StatusCode::FORBIDDEN,
            ErrorResponse::new("ADMIN_DISABLED", "Administrative endpoints are disabled"),
        ));
    }
    Ok(Json(state.supervisor.flush_indices().await))
}

/// Health check endpoint (detailed).
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let supervisor = &state.supervisor;
    let ephemeral_rows = supervisor.ephemeral_row_count().await.ok();

    Json(HealthResponse {
        status: if ephemeral_rows.is_some() { "healthy" } else { "degraded" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        workers_started: supervisor.workers_started(),
        crawl_active: supervisor.worker().is_active(),
        crawled_groups: supervisor.crawled_groups().len(),
        ephemeral_rows,
        started_at: state.started_at(),
    })
}

/// Liveness probe. Does NOT check dependencies.
async fn liveness_handler() -> Json<LivenessResponse> {
    Json(LivenessResponse {
        status: "alive".to_string(),
    })
}

/// Readiness probe: 200 when the ephemeral store answers, 503 otherwise.
async fn readiness_handler(
    State(state): State<AppState>,
) -> Result<Json<ReadinessResponse>, (StatusCode, Json<ReadinessResponse>)> {
    match state.supervisor.ephemeral_row_count().await {
        Ok(_) => Ok(Json(ReadinessResponse {
            ready: true,
            ephemeral_store: true,
            details: None,
        })),
        Err(e) => Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ReadinessResponse {
                ready: false,
                ephemeral_store: false,
                details: Some(e.to_string()),
            }),
        )),
    }
}

// ============================================================================
// Router Construction
// ============================================================================

/// Create the Axum router for the observability service.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Crawl results
        .route("/api/groups/:group/neighbors", get(neighbors_handler))
        .route("/api/groups/:group/crawl", get(crawl_result_handler))
        .route("/api/crawl/status", get(crawl_status_handler))
        // Ranking
        .route("/api/groups/:group/ranked", get(ranked_handler))
        // Administration
        .route("/api/admin/ephemeral/delete", post(delete_prefix_handler))
        .route("/api/admin/ephemeral/sweep", post(sweep_handler))
        .route("/api/admin/flush", post(flush_handler))
        // Health checks
        .route("/health", get(health_handler))
        .route("/health/live", get(liveness_handler))
        .route("/health/ready", get(readiness_handler))
        .layer(middleware::from_fn(metrics_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::memory::{InMemoryPostStore, StaticGroupRegistry};
    use crate::clients::NetworkClients;
    use crate::clock::ManualClock;
    use crate::config::KernelConfig;
    use crate::index::HourBucket;
    use crate::store::{InMemoryDurableStore, InMemoryEphemeralStore};
    use crate::supervisor::{Collaborators, Supervisor};
    use crate::types::{AccountId, Post, PostId};
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use chrono::TimeZone;
    use std::sync::Arc;
    use tower::ServiceExt;

    fn noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    struct Fixture {
        supervisor: Arc<Supervisor>,
        ephemeral: Arc<InMemoryEphemeralStore>,
        posts: Arc<InMemoryPostStore>,
    }

    async fn fixture() -> Fixture {
        let ephemeral = Arc::new(InMemoryEphemeralStore::new(100));
        let posts = Arc::new(InMemoryPostStore::new());
        let collaborators = Collaborators::new(
            ephemeral.clone(),
            Arc::new(InMemoryDurableStore::new()),
            NetworkClients::new(),
            posts.clone(),
            Arc::new(StaticGroupRegistry::default()),
        )
        .with_clock(Arc::new(ManualClock::new(noon())));
        let supervisor = Arc::new(Supervisor::new(KernelConfig::default(), collaborators).await.unwrap());
        Fixture { supervisor, ephemeral, posts }
    }

    async fn json(response: axum::response::Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_liveness_and_readiness() {
        let f = fixture().await;
        let router = create_router(ServiceState::new(f.supervisor));

        let live = router.clone().oneshot(Request::get("/health/live").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(live.status(), StatusCode::OK);

        let ready = router.clone().oneshot(Request::get("/health/ready").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(ready.status(), StatusCode::OK);

        f.ephemeral.set_unavailable(true);
        let ready = router.oneshot(Request::get("/health/ready").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(ready.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_uncrawled_group_is_not_found() {
        let f = fixture().await;
        let router = create_router(ServiceState::new(f.supervisor));

        let response = router
            .clone()
            .oneshot(Request::get("/api/groups/5/neighbors").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(json(response).await["code"], "NO_NEIGHBORS");

        let status = router.oneshot(Request::get("/api/crawl/status").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(status.status(), StatusCode::OK);
        assert_eq!(json(status).await["active"], false);
    }

    #[tokio::test]
    async fn test_ranked_posts_endpoint() {
        let f = fixture().await;
        let hour = HourBucket::containing(noon());
        f.posts.insert(Post {
            id: PostId::new("p"),
            author: AccountId::atproto("did:plc:a"),
            text: "hello".to_string(),
            posted_at: noon(),
            embedded_post_id: None,
            parent_post_id: None,
            root_post_id: None,
        });
        f.supervisor
            .add_like(GroupId(2), hour, &PostId::new("p"), &AccountId::atproto("did:plc:m"), true)
            .await
            .unwrap();

        let router = create_router(ServiceState::new(f.supervisor));
        let response = router
            .oneshot(Request::get("/api/groups/2/ranked").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json(response).await;
        assert_eq!(body["posts"].as_array().map(Vec::len), Some(1));
        assert_eq!(body["posts"][0]["score"], 1.0);
    }

    #[tokio::test]
    async fn test_admin_delete_validates_prefix() {
        let f = fixture().await;
        let hour = HourBucket::containing(noon());
        f.supervisor
            .add_quote(GroupId(4), hour, &PostId::new("p"), &PostId::new("q"), true)
            .await
            .unwrap();
        f.supervisor.flush_indices().await;

        let router = create_router(ServiceState::new(f.supervisor.clone()));
        let rejected = router
            .clone()
            .oneshot(post_json("/api/admin/ephemeral/delete", serde_json::json!({ "prefix": "crawl_result:" })))
            .await
            .unwrap();
        assert_eq!(rejected.status(), StatusCode::BAD_REQUEST);
        let body = json(rejected).await;
        assert_eq!(body["code"], "INVALID_PREFIX");
        assert_eq!(body["details"], "crawl_result:");

        let accepted = router
            .oneshot(post_json("/api/admin/ephemeral/delete", serde_json::json!({ "prefix": "reference_index:4:" })))
            .await
            .unwrap();
        assert_eq!(accepted.status(), StatusCode::OK);
        assert_eq!(json(accepted).await["deleted"], 1);

        let disabled = create_router(ServiceState::new(f.supervisor).with_admin(false))
            .oneshot(Request::post("/api/admin/flush").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(disabled.status(), StatusCode::FORBIDDEN);
        assert_eq!(json(disabled).await["code"], "ADMIN_DISABLED");
    }
}
