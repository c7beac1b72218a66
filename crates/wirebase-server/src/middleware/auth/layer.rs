//! Bearer token authentication for operators.

use super::types::AuthUser;
use crate::error::ApiError;
use crate::state::AppState;
use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::{IntoResponse, Response},
};

/// Grant the admin role to requests bearing the configured admin token.
///
/// Requests without an `Authorization` header pass through untouched so a
/// session layer may still authenticate them.
pub async fn admin_token_auth(State(state): State<AppState>, mut req: Request, next: Next) -> Response {
    let Some(expected) = state.admin_token() else {
        return next.run(req).await;
    };

    match extract_token(&req) {
        Ok(Some(token)) if token == expected => {
            req.extensions_mut()
                .insert(AuthUser::new("operator", vec!["admin".to_string()]));
        }
        Ok(Some(_)) => return ApiError::InvalidToken.into_response(),
        Ok(None) => {}
        Err(err) => return err.into_response(),
    }

    next.run(req).await
}

fn extract_token(req: &Request) -> Result<Option<String>, ApiError> {
    let Some(auth_header) = req.headers().get(header::AUTHORIZATION) else {
        return Ok(None);
    };

    let auth_str = auth_header.to_str().map_err(|_| ApiError::InvalidToken)?;
    auth_str
        .strip_prefix("Bearer ")
        .map(|token| Some(token.to_string()))
        .ok_or(ApiError::InvalidToken)
}
