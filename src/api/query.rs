use axum::{
    extract::{Query, State},
    response::IntoResponse,
    Json,
};
use bytes::Bytes;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use super::AppState;
use crate::config::PipelineConfig;
use crate::models::QueryRequest;
use crate::{PipelineError, Result};

#[derive(Debug, Default, Deserialize)]
pub struct QueryParams {
    pub query: Option<String>,
}

/// `GET|POST /query`
pub async fn run_query(
    State(state): State<AppState>,
    Query(params): Query<QueryParams>,
    body: Bytes,
) -> impl IntoResponse {
    let request = parse_request(params, &body, state.queries.config());
    let (status, payload) = state.queries.respond(request).await;
    (status, Json(payload))
}

/// Picks the query text: `?query=` first, then the body's `query` field, then
/// the configured default. A `query` field that is not a string is rejected.
pub fn parse_request(params: QueryParams, body: &[u8], config: &PipelineConfig) -> Result<QueryRequest> {
    if let Some(sql) = params.query {
        return Ok(QueryRequest::new(sql));
    }

    let parsed = match serde_json::from_slice::<Value>(body) {
        Ok(value) => value,
        Err(err) => {
            if !body.is_empty() {
                debug!(error = %err, "unparseable request body, using default query");
            }
            return Ok(QueryRequest::new(config.default_query()));
        }
    };

    match parsed.get("query") {
        Some(Value::String(sql)) => Ok(QueryRequest::new(sql.clone())),
        None | Some(Value::Null) => Ok(QueryRequest::new(config.default_query())),
        Some(other) => Err(PipelineError::Validation(format!(
            "\"query\" must be a string, got {}",
            json_type(other)
        ))),
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> PipelineConfig {
        PipelineConfig::new("bucket", "i-0abc")
    }

    fn params(query: Option<&str>) -> QueryParams {
        QueryParams {
            query: query.map(str::to_string),
        }
    }

    #[test]
    fn test_query_string_wins_over_body() {
        let request = parse_request(params(Some("SELECT 2")), br#"{"query": "SELECT 1"}"#, &config()).unwrap();
        assert_eq!(request.sql, "SELECT 2");
    }

    #[test]
    fn test_body_query_field() {
        let request = parse_request(params(None), br#"{"query": "SELECT 1"}"#, &config()).unwrap();
        assert_eq!(request.sql, "SELECT 1");
    }

    #[test]
    fn test_missing_query_uses_default() {
        let expected = "SELECT * FROM cpu_metrics.ec2_metrics_typed LIMIT 20";
        for body in [&b""[..], b"{}", br#"{"query": null}"#, b"not json", b"[1,2]"] {
            let request = parse_request(params(None), body, &config()).unwrap();
            assert_eq!(request.sql, expected);
        }
    }

    #[test]
    fn test_empty_query_is_kept_for_validation() {
        let request = parse_request(params(None), br#"{"query": "  "}"#, &config()).unwrap();
        assert_eq!(request.sql, "  ");
    }

    #[test]
    fn test_non_string_query_is_rejected() {
        let err = parse_request(params(None), br#"{"query": 42}"#, &config()).unwrap_err();
        assert_eq!(err.kind(), "ValidationError");
    }
}
