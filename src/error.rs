use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Unified error type for the proxy pool
#[derive(Error, Debug)]
pub enum SnapError {
    // Registry errors
    #[error("Proxy instance {id} already exists")]
    DuplicateInstance { id: i64 },

    #[error("Proxy instance not found: {id}")]
    InstanceNotFound { id: i64 },

    #[error("Port {port} is already used by instance {owner}")]
    PortInUse { port: u16, owner: i64 },

    // Address errors
    #[error("Failed to generate a unique address in {prefix} after {attempts} attempts")]
    AddressSpaceExhausted { prefix: String, attempts: usize },

    #[error("Address {address} is already bound to another instance")]
    AddressInUse { address: String },

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Network interface is not configured")]
    NetworkNotConfigured,

    // Engine errors
    #[error("Failed to start proxy engine for instance {id}: {reason}")]
    EngineSpawnFailure { id: i64, reason: String },

    // Privileged network gateway errors
    #[error("Privileged network operation failed: {0}")]
    PrivilegedOperationFailure(String),

    // Batch errors
    #[error("{failed} of {total} instances failed: {details}")]
    PartialBatchFailure {
        failed: usize,
        total: usize,
        details: String,
    },

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // Request errors
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Authentication failed")]
    AuthenticationFailed,

    // Storage errors
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for pool operations
pub type Result<T> = std::result::Result<T, SnapError>;

impl SnapError {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            // 400 Bad Request
            SnapError::InvalidRequest(_)
            | SnapError::InvalidAddress(_)
            | SnapError::InvalidConfig(_) => StatusCode::BAD_REQUEST,

            // 401 Unauthorized
            SnapError::AuthenticationFailed => StatusCode::UNAUTHORIZED,

            // 404 Not Found
            SnapError::InstanceNotFound { .. } => StatusCode::NOT_FOUND,

            // 409 Conflict
            SnapError::DuplicateInstance { .. }
            | SnapError::PortInUse { .. }
            | SnapError::AddressInUse { .. } => StatusCode::CONFLICT,

            // 412 Precondition Failed
            SnapError::NetworkNotConfigured => StatusCode::PRECONDITION_FAILED,

            // 502 Bad Gateway
            SnapError::EngineSpawnFailure { .. } | SnapError::PrivilegedOperationFailure(_) => {
                StatusCode::BAD_GATEWAY
            }

            // 503 Service Unavailable
            SnapError::AddressSpaceExhausted { .. } => StatusCode::SERVICE_UNAVAILABLE,

            // 500 Internal Server Error
            SnapError::PartialBatchFailure { .. }
            | SnapError::Storage(_)
            | SnapError::Json(_)
            | SnapError::Io(_)
            | SnapError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Check if this is a client error (4xx)
    pub fn is_client_error(&self) -> bool {
        self.status_code().is_client_error()
    }

    /// Check if this is a server error (5xx)
    pub fn is_server_error(&self) -> bool {
        self.status_code().is_server_error()
    }
}

impl IntoResponse for SnapError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = json!({
            "error": self.to_string(),
        });

        (status, Json(body)).into_response()
    }
}

impl From<url::ParseError> for SnapError {
    fn from(err: url::ParseError) -> Self {
        SnapError::InvalidConfig(err.to_string())
    }
}

impl From<std::net::AddrParseError> for SnapError {
    fn from(err: std::net::AddrParseError) -> Self {
        SnapError::InvalidAddress(err.to_string())
    }
}
