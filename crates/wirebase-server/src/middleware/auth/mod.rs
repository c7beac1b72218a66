//! Authentication for the admin endpoints.

pub mod extractor;
pub mod layer;
pub mod types;

pub use extractor::AdminAuth;
pub use layer::admin_token_auth;
pub use types::AuthUser;
