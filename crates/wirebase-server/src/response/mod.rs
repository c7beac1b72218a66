//! API response types.

pub mod types;

pub use types::{ApiResponse, MessageResponse};
