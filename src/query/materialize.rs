use bytes::Bytes;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::info;

use super::{ColumnInfo, QueryEngine};
use crate::models::{Cell, QueryExecution, QueryResultSet, QueryState};
use crate::retry::RetryPolicy;
use crate::storage::ObjectStore;
use crate::{PipelineError, Result};

/// A succeeded query with its canonical copy written.
#[derive(Debug, Clone, PartialEq)]
pub struct MaterializedResult {
    pub preview: Vec<Map<String, Value>>,
    /// Locator of the canonical result object
    pub csv_url: String,
    pub result_set: QueryResultSet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ColumnType {
    Bool,
    Integer,
    Float,
    Timestamp,
    Text,
}

impl ColumnType {
    fn from_type_name(name: &str) -> Self {
        let upper = name.trim().to_ascii_uppercase();
        let base = upper.split('(').next().unwrap_or("").trim();
        match base {
            "BOOLEAN" | "BOOL" => ColumnType::Bool,
            "TINYINT" | "SMALLINT" | "INTEGER" | "INT" | "BIGINT" | "HUGEINT" | "UTINYINT"
            | "USMALLINT" | "UINTEGER" | "UBIGINT" | "INT2" | "INT4" | "INT8" => {
                ColumnType::Integer
            }
            "DOUBLE" | "FLOAT" | "REAL" | "DECIMAL" | "NUMERIC" => ColumnType::Float,
            t if t.starts_with("TIMESTAMP") => ColumnType::Timestamp,
            _ => ColumnType::Text,
        }
    }

    /// Values that do not parse as the declared type are kept as text.
    fn decode(&self, raw: Option<&str>) -> Cell {
        let Some(raw) = raw else {
            return Cell::Null;
        };
        let text = || Cell::Text(raw.to_string());
        match self {
            ColumnType::Bool => match raw.to_ascii_lowercase().as_str() {
                "true" => Cell::Bool(true),
                "false" => Cell::Bool(false),
                _ => text(),
            },
            ColumnType::Integer => raw
                .parse::<i64>()
                .map(Cell::Integer)
                .or_else(|_| raw.parse::<f64>().map(Cell::Float))
                .unwrap_or_else(|_| text()),
            ColumnType::Float => raw.parse::<f64>().map(Cell::Float).unwrap_or_else(|_| text()),
            ColumnType::Timestamp => parse_timestamp(raw).map(Cell::Timestamp).unwrap_or_else(text),
            ColumnType::Text => text(),
        }
    }
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S%.f%#z", "%Y-%m-%dT%H:%M:%S%.f%#z"] {
        if let Ok(ts) = DateTime::parse_from_str(raw, fmt) {
            return Some(ts.with_timezone(&Utc));
        }
    }
    for fmt in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(naive.and_utc());
        }
    }
    None
}

/// Decodes string-encoded engine rows using the engine's column types.
pub fn decode_rows(
    columns: &[ColumnInfo],
    rows: Vec<Vec<Option<String>>>,
    result_location: String,
) -> QueryResultSet {
    let types: Vec<ColumnType> = columns
        .iter()
        .map(|c| ColumnType::from_type_name(&c.type_name))
        .collect();
    let rows = rows
        .into_iter()
        .map(|row| {
            types
                .iter()
                .enumerate()
                .map(|(i, ty)| ty.decode(row.get(i).and_then(|v| v.as_deref())))
                .collect()
        })
        .collect();
    QueryResultSet {
        schema: columns.iter().map(|c| c.name.clone()).collect(),
        rows,
        result_location,
    }
}

fn repeated_name(columns: &[ColumnInfo]) -> Option<&str> {
    let mut seen = HashSet::new();
    columns
        .iter()
        .map(|c| c.name.as_str())
        .find(|name| !seen.insert(*name))
}

pub struct ResultMaterializer {
    engine: Arc<dyn QueryEngine>,
    store: Arc<dyn ObjectStore>,
    result_key: String,
    preview_rows: usize,
    upstream_retry: RetryPolicy,
    storage_retry: RetryPolicy,
}

impl ResultMaterializer {
    pub fn new(
        engine: Arc<dyn QueryEngine>,
        store: Arc<dyn ObjectStore>,
        result_key: impl Into<String>,
        preview_rows: usize,
        upstream_retry: RetryPolicy,
        storage_retry: RetryPolicy,
    ) -> Self {
        Self {
            engine,
            store,
            result_key: result_key.into(),
            preview_rows,
            upstream_retry,
            storage_retry,
        }
    }

    /// Reads every page in order, overwrites the canonical result object and
    /// returns the preview. Nothing is returned unless the write succeeded.
    pub async fn materialize(&self, execution: &QueryExecution) -> Result<MaterializedResult> {
        if execution.state != QueryState::Succeeded {
            return Err(PipelineError::upstream(format!(
                "execution {} is {:?}, not Succeeded",
                execution.id, execution.state
            )));
        }

        let mut columns: Vec<ColumnInfo> = Vec::new();
        let mut rows = Vec::new();
        let mut token: Option<String> = None;
        let mut pages = 0usize;

        loop {
            let page = self
                .upstream_retry
                .run("query results", || {
                    self.engine.get_results(&execution.id, token.as_deref())
                })
                .await?;
            pages += 1;

            if columns.is_empty() {
                columns = page.columns;
            } else if !page.columns.is_empty() && page.columns != columns {
                return Err(PipelineError::upstream(
                    "result schema changed between pages",
                ));
            }
            rows.extend(page.rows);

            match page.next_token {
                Some(next) if token.as_deref() == Some(next.as_str()) => {
                    return Err(PipelineError::upstream("result pagination did not advance"));
                }
                Some(next) => token = Some(next),
                None => break,
            }
        }

        // preview rows are keyed by column name
        if let Some(name) = repeated_name(&columns) {
            return Err(PipelineError::Validation(format!(
                "column name {:?} appears more than once; give each output column a distinct alias",
                name
            )));
        }

        let result_set = decode_rows(&columns, rows, self.result_key.clone());
        let body = Bytes::from(result_set.to_csv());

        self.storage_retry
            .run("result put", || self.store.put(&self.result_key, body.clone()))
            .await?;

        info!(
            execution_id = %execution.id,
            rows = result_set.rows.len(),
            pages,
            key = %self.result_key,
            "query result materialized"
        );

        Ok(MaterializedResult {
            preview: result_set.preview(self.preview_rows),
            csv_url: self.store.locator(&self.result_key),
            result_set,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::ResultPage;
    use crate::storage::InMemoryObjectStore;
    use crate::testing::{text_page, FlakyObjectStore, ScriptedQueryEngine};
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::time::Duration;

    fn retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::ZERO,
        }
    }

    fn succeeded() -> QueryExecution {
        let mut exec = QueryExecution::submitted("exec-1", Utc::now());
        exec.advance(QueryState::Succeeded, Utc::now());
        exec
    }

    #[test]
    fn test_decodes_typed_columns() {
        let columns = vec![
            ColumnInfo { name: "ts".into(), type_name: "timestamp".into() },
            ColumnInfo { name: "cpu".into(), type_name: "DOUBLE".into() },
            ColumnInfo { name: "n".into(), type_name: "bigint".into() },
            ColumnInfo { name: "ok".into(), type_name: "BOOLEAN".into() },
            ColumnInfo { name: "id".into(), type_name: "VARCHAR".into() },
            ColumnInfo { name: "amount".into(), type_name: "DECIMAL(18,3)".into() },
        ];
        let rows = vec![vec![
            Some("2025-08-27 15:00:00".to_string()),
            Some("3.4".to_string()),
            Some("42".to_string()),
            Some("true".to_string()),
            Some("i-1".to_string()),
            None,
        ]];

        let set = decode_rows(&columns, rows, "k".into());

        assert_eq!(
            set.rows[0],
            vec![
                Cell::Timestamp(Utc.with_ymd_and_hms(2025, 8, 27, 15, 0, 0).unwrap()),
                Cell::Float(3.4),
                Cell::Integer(42),
                Cell::Bool(true),
                Cell::Text("i-1".into()),
                Cell::Null,
            ]
        );
    }

    #[test]
    fn test_timestamp_formats() {
        let expected = Utc.with_ymd_and_hms(2025, 8, 27, 15, 0, 0).unwrap();
        for raw in [
            "2025-08-27T15:00:00Z",
            "2025-08-27 15:00:00",
            "2025-08-27 15:00:00.000",
            "2025-08-27 15:00:00+00",
            "2025-08-27T17:00:00+02:00",
        ] {
            assert_eq!(parse_timestamp(raw), Some(expected), "{}", raw);
        }
        assert_eq!(parse_timestamp("yesterday"), None);
    }

    #[tokio::test]
    async fn test_pages_are_concatenated_in_order() {
        let mut first = text_page(&[("n", "integer")], &[&[Some("1")], &[Some("2")]]);
        first.next_token = Some("1".into());
        let second = ResultPage {
            columns: vec![],
            rows: vec![vec![Some("3".to_string())]],
            next_token: None,
        };
        let engine = Arc::new(ScriptedQueryEngine::new().with_pages(vec![first, second]));
        let store = Arc::new(InMemoryObjectStore::new("bucket"));
        let materializer =
            ResultMaterializer::new(engine, store.clone(), "results/latest.csv", 2, retry(3), retry(2));

        let result = materializer.materialize(&succeeded()).await.unwrap();

        assert_eq!(result.result_set.rows.len(), 3);
        assert_eq!(result.preview.len(), 2);
        assert_eq!(Value::Object(result.preview[1].clone()), json!({"n": 2}));
        assert_eq!(result.csv_url, "memory://bucket/results/latest.csv");
        assert_eq!(
            store.get("results/latest.csv").await.unwrap(),
            Bytes::from_static(b"n\n1\n2\n3\n")
        );
    }

    #[tokio::test]
    async fn test_storage_failure_returns_no_locator() {
        let engine = Arc::new(
            ScriptedQueryEngine::new().with_pages(vec![text_page(&[("n", "integer")], &[&[Some("1")]])]),
        );
        let store = Arc::new(FlakyObjectStore::failing_puts(10));
        let materializer =
            ResultMaterializer::new(engine, store.clone(), "results/latest.csv", 10, retry(3), retry(2));

        let err = materializer.materialize(&succeeded()).await.unwrap_err();

        assert_eq!(err.kind(), "StorageError");
        assert_eq!(store.put_attempts(), 2);
        assert!(!store.inner().contains("results/latest.csv").await);
    }

    #[tokio::test]
    async fn test_repeated_column_names_are_rejected_before_writing() {
        let engine = Arc::new(ScriptedQueryEngine::new().with_pages(vec![text_page(
            &[("a", "integer"), ("a", "integer")],
            &[&[Some("1"), Some("2")]],
        )]));
        let store = Arc::new(InMemoryObjectStore::new("bucket"));
        let materializer =
            ResultMaterializer::new(engine, store.clone(), "results/latest.csv", 10, retry(1), retry(1));

        let err = materializer.materialize(&succeeded()).await.unwrap_err();

        assert_eq!(err.kind(), "ValidationError");
        assert!(err.detail().contains("\"a\""));
        assert!(!store.contains("results/latest.csv").await);
    }

    #[tokio::test]
    async fn test_refuses_unfinished_execution() {
        let engine = Arc::new(ScriptedQueryEngine::new());
        let store = Arc::new(InMemoryObjectStore::new("bucket"));
        let materializer =
            ResultMaterializer::new(engine.clone(), store, "results/latest.csv", 10, retry(1), retry(1));

        let running = QueryExecution::submitted("exec-1", Utc::now());
        assert!(materializer.materialize(&running).await.is_err());
        assert_eq!(engine.result_calls(), 0);
    }
}
