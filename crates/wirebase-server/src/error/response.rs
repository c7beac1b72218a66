//! Error response implementation.

use super::types::ApiError;
use axum::{
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, warn};
use wirebase_db::DbError;

/// The database error behind a response, for the error boundary to inspect.
#[derive(Debug, Clone)]
pub struct DbFailure(pub Arc<DbError>);

/// Error response body.
#[derive(Debug, Serialize)]
struct ErrorResponse {
    success: bool,
    error: ErrorBody,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.is_server_error() {
            error!(
                error = %self,
                code = self.error_code(),
                "Server error occurred"
            );
        } else if matches!(
            self,
            ApiError::Unauthorized | ApiError::InvalidToken | ApiError::Forbidden
        ) {
            warn!(
                error = %self,
                code = self.error_code(),
                "Auth error occurred"
            );
        }

        let status = self.status_code();
        let code = self.error_code();

        let message = match &self {
            ApiError::Internal(err) => {
                if cfg!(debug_assertions) {
                    format!("{}: {}", self, err)
                } else {
                    "An internal error occurred".to_string()
                }
            }
            ApiError::Database(err) => {
                if cfg!(debug_assertions) {
                    format!("Database error: {}", err)
                } else {
                    "A database error occurred".to_string()
                }
            }
            _ => self.to_string(),
        };

        let body = ErrorResponse {
            success: false,
            error: ErrorBody { code, message },
        };

        let mut response = (status, Json(body)).into_response();

        if let ApiError::Database(err) = self {
            response.extensions_mut().insert(DbFailure(err));
        }

        response
    }
}
