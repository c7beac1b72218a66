//! Route configuration for the Wirebase API server.

mod db;

use crate::{
    error::ApiError,
    middleware::{admin_token_auth, database_error_boundary},
    state::AppState,
};
use axum::{
    middleware::from_fn_with_state,
    response::IntoResponse,
    Router,
};
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::{
    catch_panic::CatchPanicLayer,
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

/// Create the main application router.
pub fn create_router(state: AppState, request_timeout: Duration) -> Router {
    let common_middleware = ServiceBuilder::new()
        .layer(SetRequestIdLayer::new(
            axum::http::HeaderName::from_static("x-request-id"),
            MakeRequestUuid,
        ))
        .layer(PropagateRequestIdLayer::new(
            axum::http::HeaderName::from_static("x-request-id"),
        ))
        .layer(TraceLayer::new_for_http())
        .layer(CatchPanicLayer::new())
        .layer(TimeoutLayer::new(request_timeout));

    Router::new()
        .nest("/db", db::router())
        .fallback(fallback_handler)
        .layer(from_fn_with_state(state.clone(), database_error_boundary))
        .layer(from_fn_with_state(state.clone(), admin_token_auth))
        .layer(common_middleware)
        .with_state(state)
}

async fn fallback_handler() -> impl IntoResponse {
    ApiError::NotFound("Route".to_string())
}
