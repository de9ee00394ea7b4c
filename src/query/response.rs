use axum::http::StatusCode;
use tracing::warn;

use super::MaterializedResult;
use crate::models::{ApiResponse, ErrorBody};
use crate::PipelineError;

/// Longest message placed in an error payload.
pub const MAX_MESSAGE_CHARS: usize = 256;

pub struct ResponseFormatter;

impl ResponseFormatter {
    pub fn success(result: &MaterializedResult) -> (StatusCode, ApiResponse) {
        (
            StatusCode::OK,
            ApiResponse::Success {
                data: result.preview.clone(),
                csv_url: result.csv_url.clone(),
            },
        )
    }

    pub fn failure(err: &PipelineError) -> (StatusCode, ApiResponse) {
        let status = err.status_code();
        if status.is_server_error() {
            warn!(kind = err.kind(), error = %err, "request failed");
        }
        (
            status,
            ApiResponse::Failure {
                error: ErrorBody {
                    kind: err.kind().to_string(),
                    message: sanitize(err.detail()),
                },
            },
        )
    }
}

/// First line only, bounded length; engine traces never reach callers.
pub fn sanitize(message: &str) -> String {
    let first = message.lines().map(str::trim).find(|l| !l.is_empty());
    match first {
        Some(line) => line.chars().take(MAX_MESSAGE_CHARS).collect(),
        None => "unknown error".to_string(),
    }
}
