//! Shared application state.

use std::sync::Arc;
use wirebase_db::DbAdmin;

/// State shared by every handler.
#[derive(Clone)]
pub struct AppState {
    db: Arc<DbAdmin>,
    admin_token: Option<Arc<str>>,
}

impl AppState {
    pub fn new(db: Arc<DbAdmin>) -> Self {
        Self {
            db,
            admin_token: None,
        }
    }

    /// Accept this bearer token as an admin credential.
    pub fn with_admin_token(mut self, token: Option<String>) -> Self {
        self.admin_token = token.filter(|t| !t.is_empty()).map(Arc::from);
        self
    }

    pub fn db(&self) -> &DbAdmin {
        &self.db
    }

    pub fn admin_token(&self) -> Option<&str> {
        self.admin_token.as_deref()
    }
}
