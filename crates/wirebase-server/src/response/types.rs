//! Standard API response types.

use serde::Serialize;

/// Standard API response envelope.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    /// Whether the request was successful.
    pub success: bool,
    /// Response data.
    pub data: T,
    /// Response timestamp.
    pub timestamp: String,
}

impl<T> ApiResponse<T> {
    /// Create a successful response.
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// Confirmation of an action without a data payload.
#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: String,
}

impl MessageResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}
