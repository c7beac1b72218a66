//! Error handling for the Wirebase API server.

pub mod response;
pub mod types;

pub use response::DbFailure;
pub use types::{ApiError, ApiResult};
