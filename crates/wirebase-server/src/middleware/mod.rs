//! Middleware for the Wirebase API server.

pub mod auth;
pub mod db_errors;

pub use auth::{admin_token_auth, AdminAuth, AuthUser};
pub use db_errors::database_error_boundary;
