use crate::domain::ShowEdits;
use crate::error::ScraperError;
use crate::feedback::FeedbackLoop;
use crate::review::ReviewService;
use crate::storage::Storage;
use axum::{
    extract::{Path, Query},
    http::{Method, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Extension, Router,
};
use hyper::Server;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};
use uuid::Uuid;

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub storage: Arc<dyn Storage>,
    pub review: ReviewService,
    pub feedback: FeedbackLoop,
    pub metrics: Option<PrometheusHandle>,
}

/// Maps domain errors onto HTTP statuses.
pub struct ApiError(ScraperError);

impl From<ScraperError> for ApiError {
    fn from(e: ScraperError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            ScraperError::NotFound(_) => StatusCode::NOT_FOUND,
            ScraperError::DecisionConflict { .. } => StatusCode::CONFLICT,
            ScraperError::InvalidEdit(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(serde_json::json!({ "error": self.0.to_string() }))).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

#[derive(Debug, Default, Deserialize)]
pub struct ApproveRequest {
    #[serde(default)]
    pub edits: Option<ShowEdits>,
    #[serde(default)]
    pub admin_notes: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RejectRequest {
    #[serde(default)]
    pub admin_notes: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct BatchRequest {
    pub ids: Vec<Uuid>,
    #[serde(default)]
    pub admin_notes: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct StatsParams {
    pub days_ago: Option<i64>,
    pub min_count: Option<usize>,
}

/// Health check endpoint
async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "card-show-scraper",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn metrics_handler(Extension(state): Extension<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => handle.render().into_response(),
        None => (StatusCode::SERVICE_UNAVAILABLE, "metrics recorder not installed").into_response(),
    }
}

async fn queue(Extension(state): Extension<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.review.list_queue().await?))
}

async fn get_pending(
    Extension(state): Extension<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.review.get(id).await?))
}

async fn approve(
    Extension(state): Extension<AppState>,
    Path(id): Path<Uuid>,
    body: Option<Json<ApproveRequest>>,
) -> ApiResult<impl IntoResponse> {
    let req = body.map(|Json(req)| req).unwrap_or_default();
    let show = state
        .review
        .approve(id, req.edits.as_ref(), req.admin_notes.as_deref())
        .await?;
    Ok(Json(show))
}

async fn reject(
    Extension(state): Extension<AppState>,
    Path(id): Path<Uuid>,
    body: Option<Json<RejectRequest>>,
) -> ApiResult<impl IntoResponse> {
    let req = body.map(|Json(req)| req).unwrap_or_default();
    state.review.reject(id, req.admin_notes.as_deref()).await?;
    Ok(Json(serde_json::json!({ "id": id, "status": "REJECTED" })))
}

async fn approve_batch(
    Extension(state): Extension<AppState>,
    Json(req): Json<BatchRequest>,
) -> impl IntoResponse {
    let results = state
        .review
        .approve_batch(&req.ids, req.admin_notes.as_deref())
        .await;
    let priority_updates = refresh_priorities(&state).await;
    Json(serde_json::json!({ "results": results, "priority_updates": priority_updates }))
}

async fn reject_batch(
    Extension(state): Extension<AppState>,
    Json(req): Json<BatchRequest>,
) -> impl IntoResponse {
    let results = state
        .review
        .reject_batch(&req.ids, req.admin_notes.as_deref())
        .await;
    let priority_updates = refresh_priorities(&state).await;
    Json(serde_json::json!({ "results": results, "priority_updates": priority_updates }))
}

/// Priorities are best-effort after a batch; decisions already stand.
async fn refresh_priorities(state: &AppState) -> usize {
    match state.feedback.recompute_priorities().await {
        Ok(updates) => updates.len(),
        Err(e) => {
            warn!("Priority recompute after batch failed: {}", e);
            0
        }
    }
}

async fn feedback_stats(
    Extension(state): Extension<AppState>,
    Query(params): Query<StatsParams>,
) -> ApiResult<impl IntoResponse> {
    let stats = state
        .feedback
        .get_feedback_stats(params.days_ago.unwrap_or(30), params.min_count.unwrap_or(1))
        .await?;
    Ok(Json(stats))
}

async fn sources(Extension(state): Extension<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.storage.list_sources().await?))
}

/// Build the admin router
pub fn create_server(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_handler))
        .route("/admin/queue", get(queue))
        .route("/admin/pending/approve-batch", post(approve_batch))
        .route("/admin/pending/reject-batch", post(reject_batch))
        .route("/admin/pending/:id", get(get_pending))
        .route("/admin/pending/:id/approve", post(approve))
        .route("/admin/pending/:id/reject", post(reject))
        .route("/admin/feedback/stats", get(feedback_stats))
        .route("/admin/sources", get(sources))
        .layer(Extension(state))
        .layer(ServiceBuilder::new().layer(cors))
}

/// Start the HTTP server on the specified port
pub async fn start_server(state: AppState, port: u16) -> anyhow::Result<()> {
    let app = create_server(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    info!("Admin server listening on http://localhost:{}", port);
    info!("Health check: http://localhost:{}/health", port);

    Server::bind(&addr).serve(app.into_make_service()).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FeedbackConfig;
    use crate::domain::{NormalizedShow, PendingShow, ShowStatus};
    use crate::storage::InMemoryStorage;
    use axum::body::Body;
    use axum::http::Request;
    use chrono::{NaiveDate, Utc};
    use tower::util::ServiceExt;

    fn state(storage: Arc<InMemoryStorage>) -> AppState {
        AppState {
            storage: storage.clone(),
            review: ReviewService::new(storage.clone()),
            feedback: FeedbackLoop::new(storage, &FeedbackConfig::default()),
            metrics: None,
        }
    }

    async fn seed(storage: &InMemoryStorage) -> Uuid {
        let row = PendingShow {
            id: Uuid::new_v4(),
            source_url: "https://s1".to_string(),
            raw_payload: NormalizedShow::new("Card Show", NaiveDate::from_ymd_opt(2025, 8, 2).unwrap()),
            status: ShowStatus::Pending,
            confidence_score: 50,
            admin_notes: None,
            duplicate_of: None,
            dedup_key: "k".to_string(),
            created_at: Utc::now(),
            decided_at: None,
        };
        storage.insert_pending(&row).await.unwrap();
        row.id
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let app = create_server(state(Arc::new(InMemoryStorage::new())));
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["status"], "healthy");
    }

    #[tokio::test]
    async fn test_approve_then_conflict() {
        let storage = Arc::new(InMemoryStorage::new());
        let id = seed(&storage).await;
        let app = create_server(state(storage.clone()));

        let request = || {
            Request::builder()
                .method("POST")
                .uri(format!("/admin/pending/{}/approve", id))
                .header("content-type", "application/json")
                .body(Body::from(r#"{"admin_notes": "ok"}"#))
                .unwrap()
        };
        let first = app.clone().oneshot(request()).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(json_body(first).await["title"], "Card Show");

        let second = app.oneshot(request()).await.unwrap();
        assert_eq!(second.status(), StatusCode::CONFLICT);
        assert_eq!(storage.all_shows().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_pending_is_404() {
        let app = create_server(state(Arc::new(InMemoryStorage::new())));
        let response = app
            .oneshot(
                Request::builder()
                    .uri(format!("/admin/pending/{}", Uuid::new_v4()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_reject_batch_reports_per_id() {
        let storage = Arc::new(InMemoryStorage::new());
        let id = seed(&storage).await;
        let missing = Uuid::new_v4();
        let app = create_server(state(storage));

        let body = serde_json::json!({ "ids": [id, missing] }).to_string();
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/admin/pending/reject-batch")
                    .header("content-type", "application/json")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = json_body(response).await;
        assert_eq!(json["results"][0]["result"], "rejected");
        assert_eq!(json["results"][1]["result"], "not_found");
    }
}
