//! Authentication types.

use uuid::Uuid;

/// Authenticated user context, inserted into request extensions by the
/// session layer.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub id: Uuid,
    pub username: String,
    pub roles: Vec<String>,
}

impl AuthUser {
    pub fn new(username: impl Into<String>, roles: Vec<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            username: username.into(),
            roles,
        }
    }

    /// Check if user has admin role.
    pub fn is_admin(&self) -> bool {
        self.roles.iter().any(|r| r == "admin")
    }
}
