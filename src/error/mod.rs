use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Result type for shield operations
pub type Result<T> = std::result::Result<T, ShieldError>;

/// Shield error types
#[derive(Error, Debug)]
pub enum ShieldError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Store error: {0}")]
    Store(#[from] redis::RedisError),

    #[error("Store command timed out after {0} ms")]
    StoreTimeout(u64),

    #[error("Bucket script error: {0}")]
    Script(String),

    #[error("Internal server error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ShieldError {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ShieldError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ShieldError::Store(_) => StatusCode::SERVICE_UNAVAILABLE,
            ShieldError::StoreTimeout(_) => StatusCode::SERVICE_UNAVAILABLE,
            ShieldError::Script(_) => StatusCode::SERVICE_UNAVAILABLE,
            ShieldError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ShieldError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether this error came from the shared store. Store failures
    /// trigger the fail-open path instead of surfacing to the client.
    pub fn is_store_failure(&self) -> bool {
        matches!(
            self,
            ShieldError::Store(_) | ShieldError::StoreTimeout(_) | ShieldError::Script(_)
        )
    }
}

impl IntoResponse for ShieldError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(json!({
            "error": self.to_string(),
            "status": status.as_u16(),
        }));

        (status, body).into_response()
    }
}
