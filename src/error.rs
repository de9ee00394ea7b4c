use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

use crate::query::response::ResponseFormatter;

#[derive(Debug, Clone, Error)]
pub enum PipelineError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Upstream error: {message}")]
    Upstream { message: String, transient: bool },

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl PipelineError {
    /// An upstream failure worth retrying (connection reset, throttling, 5xx).
    pub fn transient(message: impl Into<String>) -> Self {
        PipelineError::Upstream {
            message: message.into(),
            transient: true,
        }
    }

    /// An upstream failure that will not go away on retry.
    pub fn upstream(message: impl Into<String>) -> Self {
        PipelineError::Upstream {
            message: message.into(),
            transient: false,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, PipelineError::Upstream { transient: true, .. })
    }

    /// Kind name exposed in structured error payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Configuration(_) => "ConfigurationError",
            PipelineError::Validation(_) => "ValidationError",
            PipelineError::Upstream { .. } => "UpstreamError",
            PipelineError::Timeout(_) => "TimeoutError",
            PipelineError::Storage(_) => "StorageError",
        }
    }

    /// Message without the kind prefix that `Display` adds.
    pub fn detail(&self) -> &str {
        match self {
            PipelineError::Configuration(m)
            | PipelineError::Validation(m)
            | PipelineError::Timeout(m)
            | PipelineError::Storage(m) => m,
            PipelineError::Upstream { message, .. } => message,
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            PipelineError::Validation(_) => StatusCode::BAD_REQUEST,
            PipelineError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            PipelineError::Upstream { .. } => StatusCode::BAD_GATEWAY,
            PipelineError::Storage(_) | PipelineError::Configuration(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl From<duckdb::Error> for PipelineError {
    fn from(err: duckdb::Error) -> Self {
        PipelineError::upstream(err.to_string())
    }
}

impl From<reqwest::Error> for PipelineError {
    fn from(err: reqwest::Error) -> Self {
        let retryable = err.is_timeout()
            || err.is_connect()
            || err
                .status()
                .map_or(false, |s| s.is_server_error() || s.as_u16() == 429);
        PipelineError::Upstream {
            message: err.to_string(),
            transient: retryable,
        }
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        PipelineError::Validation(err.to_string())
    }
}

impl IntoResponse for PipelineError {
    fn into_response(self) -> Response {
        let (status, body) = ResponseFormatter::failure(&self);
        (status, Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
