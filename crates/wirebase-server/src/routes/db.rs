//! Database administration routes.

use crate::{
    error::{ApiError, ApiResult},
    middleware::AdminAuth,
    response::{ApiResponse, MessageResponse},
    state::AppState,
};
use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderMap},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use tracing::info;
use wirebase_db::{FixReport, HealthStatus, LeakReport, MaintenanceReport, StatusReport};

/// Create the `/db` router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/status", get(status))
        .route("/health-check", post(health_check))
        .route("/maintenance", post(maintenance))
        .route("/leaks", get(leaks))
        .route("/fix-leaks", post(fix_leaks))
        .route("/reset-errors", post(reset_errors))
        .route("/reset-metrics", post(reset_metrics))
}

/// Body of `POST /db/fix-leaks`.
#[derive(Debug, Default, Deserialize)]
pub struct FixLeaksRequest {
    #[serde(default)]
    pub force: bool,
}

async fn status(
    State(state): State<AppState>,
    _admin: AdminAuth,
) -> Json<ApiResponse<StatusReport>> {
    Json(ApiResponse::success(state.db().status_report().await))
}

async fn health_check(
    State(state): State<AppState>,
    AdminAuth(user): AdminAuth,
) -> Json<ApiResponse<HealthStatus>> {
    info!(admin = %user.username, "Manual health check requested");
    Json(ApiResponse::success(state.db().health_check().await))
}

async fn maintenance(
    State(state): State<AppState>,
    AdminAuth(user): AdminAuth,
) -> Json<ApiResponse<MaintenanceReport>> {
    info!(admin = %user.username, "Maintenance requested");
    Json(ApiResponse::success(state.db().maintenance().await))
}

async fn leaks(
    State(state): State<AppState>,
    _admin: AdminAuth,
) -> Json<ApiResponse<LeakReport>> {
    Json(ApiResponse::success(state.db().leaks()))
}

impl FixLeaksRequest {
    /// An empty body means a non-forced pass; anything else must be a JSON object.
    fn parse(headers: &HeaderMap, body: &[u8]) -> ApiResult<Self> {
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(Self::default());
        }

        let is_json = headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.starts_with("application/json"));
        if !is_json {
            return Err(ApiError::BadRequest(
                "Expected Content-Type: application/json".to_string(),
            ));
        }

        serde_json::from_slice(body)
            .map_err(|e| ApiError::BadRequest(format!("Invalid fix-leaks body: {}", e)))
    }
}

async fn fix_leaks(
    State(state): State<AppState>,
    AdminAuth(user): AdminAuth,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<ApiResponse<FixReport>>> {
    let request = FixLeaksRequest::parse(&headers, &body)?;
    info!(admin = %user.username, force = request.force, "Leak fix requested");
    Ok(Json(ApiResponse::success(state.db().fix_leaks(request.force).await)))
}

async fn reset_errors(
    State(state): State<AppState>,
    AdminAuth(user): AdminAuth,
) -> Json<ApiResponse<MessageResponse>> {
    state.db().reset_errors();
    info!(admin = %user.username, "Error statistics reset");
    Json(ApiResponse::success(MessageResponse::new("Error statistics reset")))
}

async fn reset_metrics(
    State(state): State<AppState>,
    AdminAuth(user): AdminAuth,
) -> Json<ApiResponse<MessageResponse>> {
    state.db().reset_metrics();
    info!(admin = %user.username, "Pool metrics reset");
    Json(ApiResponse::success(MessageResponse::new("Pool metrics reset")))
}
