//! Database error boundary.
//!
//! Every database error surfacing from a handler is counted by the error
//! handler. Errors that signal a failing database are replaced with a
//! generic 503; all other responses pass through unchanged.

use crate::error::{ApiError, DbFailure};
use crate::state::AppState;
use axum::{
    extract::{Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::{warn, Instrument};
use wirebase_common_log::spans::{record_error, request_span};
use wirebase_db::is_database_failure;

/// Message returned in place of a database failure.
pub const UNAVAILABLE_MESSAGE: &str = "The database is unavailable. Please try again later.";

pub async fn database_error_boundary(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Response {
    let span = request_span(req.method().as_str(), req.uri().path());
    let context = format!("{} {}", req.method(), req.uri().path());
    let response = next.run(req).instrument(span.clone()).await;

    let Some(DbFailure(err)) = response.extensions().get::<DbFailure>().cloned() else {
        return response;
    };
    span.in_scope(|| record_error(&*err));

    let failure = is_database_failure(err.as_ref());
    let observed = state.db().errors().handle_error(err, context);

    if !failure {
        return response;
    }

    warn!(
        category = %observed.category(),
        context = observed.context(),
        "Database failure masked for client"
    );
    ApiError::ServiceUnavailable(UNAVAILABLE_MESSAGE.to_string()).into_response()
}
