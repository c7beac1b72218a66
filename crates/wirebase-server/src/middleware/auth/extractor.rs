//! Authentication extractors for handlers.

use super::types::AuthUser;
use crate::error::ApiError;
use axum::{async_trait, extract::FromRequestParts, http::request::Parts};

/// Extractor that requires admin role.
pub struct AdminAuth(pub AuthUser);

#[async_trait]
impl<S> FromRequestParts<S> for AdminAuth
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let user = parts
            .extensions
            .get::<AuthUser>()
            .cloned()
            .ok_or(ApiError::Unauthorized)?;

        if user.is_admin() {
            Ok(AdminAuth(user))
        } else {
            Err(ApiError::Forbidden)
        }
    }
}
