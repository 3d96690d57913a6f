//! Error types for the gateway.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::sdk::SdkError;

/// Errors surfaced to HTTP callers.
///
/// The message is passed through as-is so callers see the underlying
/// SDK or fetch failure text.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Unknown sandbox identifier or missing staged file.
    #[error("{0}")]
    NotFound(String),

    /// Any failure reported by the SDK, the URL fetch, or local I/O.
    #[error("{0}")]
    Internal(String),
}

impl GatewayError {
    pub fn sandbox_not_found(sandbox_id: &str) -> Self {
        GatewayError::NotFound(format!("Sandbox {sandbox_id} not found or expired"))
    }
}

impl From<SdkError> for GatewayError {
    fn from(err: SdkError) -> Self {
        GatewayError::Internal(err.to_string())
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        GatewayError::Internal(err.to_string())
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        GatewayError::Internal(err.to_string())
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = match &self {
            GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "detail": self.to_string() }))).into_response()
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
