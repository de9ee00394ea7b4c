//! Local asynchronous engine over the partition objects.
//!
//! Every execution opens a fresh in-memory DuckDB connection, exposes the
//! partition CSVs as `<namespace>.<table>`, and runs on the blocking pool.
//! Results are staged under the output location the same way a hosted
//! engine would, and served back in fixed-size pages.

use async_trait::async_trait;
use bytes::Bytes;
use duckdb::Connection;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};
use uuid::Uuid;

use super::{ColumnInfo, ExecutionStatus, QueryEngine, ResultPage};
use crate::config::PipelineConfig;
use crate::models::{csv_escape, Metric, QueryState};
use crate::partitioning::partition_columns;
use crate::storage::{LocalObjectStore, ObjectStore};
use crate::{PipelineError, Result};

pub const RESULT_PAGE_SIZE: usize = 1000;

/// Finished executions are forgotten after this long.
const EXECUTION_RETENTION: Duration = Duration::from_secs(3600);

type Rows = Vec<Vec<Option<String>>>;

struct ExecutionRecord {
    state: QueryState,
    reason: Option<String>,
    columns: Vec<ColumnInfo>,
    rows: Arc<Rows>,
    created: Instant,
}

struct EngineInner {
    store: Arc<LocalObjectStore>,
    partition_prefix: String,
    table: String,
    executions: Mutex<HashMap<String, ExecutionRecord>>,
}

#[derive(Clone)]
pub struct DuckDbQueryEngine {
    inner: Arc<EngineInner>,
}

impl DuckDbQueryEngine {
    pub fn new(
        store: Arc<LocalObjectStore>,
        partition_prefix: impl Into<String>,
        table: impl Into<String>,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                store,
                partition_prefix: partition_prefix.into(),
                table: table.into(),
                executions: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn from_config(config: &PipelineConfig, store: Arc<LocalObjectStore>) -> Self {
        Self::new(store, config.metrics_prefix.clone(), config.table.clone())
    }
}

#[async_trait]
impl QueryEngine for DuckDbQueryEngine {
    async fn submit(&self, sql: &str, namespace: &str, output_location: &str) -> Result<String> {
        if sql.trim().is_empty() {
            return Err(PipelineError::upstream("query text is empty"));
        }

        let id = Uuid::new_v4().to_string();
        {
            let mut executions = self.inner.executions.lock();
            executions.retain(|_, r| r.created.elapsed() < EXECUTION_RETENTION);
            executions.insert(
                id.clone(),
                ExecutionRecord {
                    state: QueryState::Submitted,
                    reason: None,
                    columns: Vec::new(),
                    rows: Arc::new(Vec::new()),
                    created: Instant::now(),
                },
            );
        }

        let inner = self.inner.clone();
        let exec_id = id.clone();
        let sql = sql.to_string();
        let namespace = namespace.to_string();
        let output = output_location.trim_end_matches('/').to_string();
        tokio::spawn(async move {
            inner.run(exec_id, sql, namespace, output).await;
        });

        Ok(id)
    }

    async fn get_state(&self, execution_id: &str) -> Result<ExecutionStatus> {
        let executions = self.inner.executions.lock();
        let record = executions
            .get(execution_id)
            .ok_or_else(|| PipelineError::upstream(format!("unknown execution {}", execution_id)))?;
        Ok(ExecutionStatus {
            state: record.state,
            reason: record.reason.clone(),
        })
    }

    async fn get_results(&self, execution_id: &str, page_token: Option<&str>) -> Result<ResultPage> {
        let (columns, rows) = {
            let executions = self.inner.executions.lock();
            let record = executions.get(execution_id).ok_or_else(|| {
                PipelineError::upstream(format!("unknown execution {}", execution_id))
            })?;
            if record.state != QueryState::Succeeded {
                return Err(PipelineError::upstream(format!(
                    "execution {} has no results in state {:?}",
                    execution_id, record.state
                )));
            }
            (record.columns.clone(), record.rows.clone())
        };

        let offset = match page_token {
            Some(token) => token
                .parse::<usize>()
                .map_err(|_| PipelineError::upstream(format!("invalid page token {:?}", token)))?,
            None => 0,
        };
        let end = (offset + RESULT_PAGE_SIZE).min(rows.len());
        let page_rows = rows.get(offset..end).map(<[_]>::to_vec).unwrap_or_default();

        Ok(ResultPage {
            columns: if offset == 0 { columns } else { Vec::new() },
            rows: page_rows,
            next_token: (end < rows.len()).then(|| end.to_string()),
        })
    }
}

impl EngineInner {
    async fn run(self: Arc<Self>, id: String, sql: String, namespace: String, output: String) {
        self.update(&id, |r| r.state = QueryState::Running);

        let outcome = match self.dataset_files().await {
            Ok(files) => {
                let worker = self.clone();
                tokio::task::spawn_blocking(move || worker.execute_blocking(&sql, &namespace, &files))
                    .await
                    .unwrap_or_else(|e| {
                        Err(PipelineError::upstream(format!("execution task failed: {}", e)))
                    })
            }
            Err(err) => Err(err),
        };

        let (columns, rows) = match outcome {
            Ok(result) => result,
            Err(err) => {
                info!(execution_id = %id, error = %err, "query failed");
                self.fail(&id, err.detail());
                return;
            }
        };

        let staged_key = format!("{}/{}.csv", output, id);
        if let Err(err) = self.store.put(&staged_key, stage_csv(&columns, &rows)).await {
            error!(execution_id = %id, error = %err, "failed to stage query output");
            self.fail(&id, &format!("could not write output: {}", err.detail()));
            return;
        }

        debug!(execution_id = %id, rows = rows.len(), key = %staged_key, "query output staged");
        self.update(&id, |r| {
            r.columns = columns;
            r.rows = Arc::new(rows);
            r.state = QueryState::Succeeded;
        });
    }

    fn update<F: FnOnce(&mut ExecutionRecord)>(&self, id: &str, f: F) {
        if let Some(record) = self.executions.lock().get_mut(id) {
            f(record);
        }
    }

    fn fail(&self, id: &str, reason: &str) {
        let reason = reason.to_string();
        self.update(id, |r| {
            r.state = QueryState::Failed;
            r.reason = Some(reason);
        });
    }

    /// Filesystem paths of every partition object.
    async fn dataset_files(&self) -> Result<Vec<String>> {
        self.store
            .list_keys(&self.partition_prefix, ".csv")
            .await?
            .iter()
            .map(|key| self.store.path_for(key).map(|p| p.display().to_string()))
            .collect()
    }

    fn execute_blocking(
        &self,
        sql: &str,
        namespace: &str,
        files: &[String],
    ) -> Result<(Vec<ColumnInfo>, Rows)> {
        let conn = Connection::open_in_memory()?;
        // keeps subquery order intact for the projection below
        conn.execute_batch("SET threads TO 1;")?;
        conn.execute_batch(&dataset_ddl(namespace, &self.table, files))?;

        let sql = strip_terminator(sql);

        let mut describe = conn.prepare(&format!("DESCRIBE\n{}\n", sql))?;
        let columns = describe
            .query_map([], |row| {
                Ok(ColumnInfo {
                    name: row.get(0)?,
                    type_name: row.get(1)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        if columns.is_empty() {
            return Ok((columns, Vec::new()));
        }

        let mut stmt = conn.prepare(&text_projection(sql, columns.len()))?;
        let width = columns.len();
        let rows = stmt
            .query_map([], |row| {
                (0..width)
                    .map(|i| row.get::<_, Option<String>>(i))
                    .collect::<duckdb::Result<Vec<_>>>()
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok((columns, rows))
    }
}

fn strip_terminator(sql: &str) -> &str {
    sql.trim().trim_end_matches(';').trim_end()
}

/// Every output column cast to text, addressed by position so repeated
/// column names keep their own values. The query sits on its own lines so a
/// trailing line comment cannot swallow the closing parenthesis.
fn text_projection(sql: &str, width: usize) -> String {
    let aliases: Vec<String> = (0..width).map(|i| quote_ident(&format!("c{}", i))).collect();
    let projection = aliases
        .iter()
        .map(|a| format!("CAST(q.{} AS VARCHAR)", a))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "SELECT {} FROM (\n{}\n) AS q({})",
        projection,
        sql,
        aliases.join(", ")
    )
}

/// Schema plus a typed view over the partition files.
fn dataset_ddl(namespace: &str, table: &str, files: &[String]) -> String {
    let metrics = Metric::ALL
        .iter()
        .map(|m| format!("TRY_CAST({col} AS DOUBLE) AS {col}", col = quote_ident(m.column())))
        .collect::<Vec<_>>()
        .join(",\n    ");

    let source = if files.is_empty() {
        let nulls = partition_columns()
            .iter()
            .map(|c| format!("CAST(NULL AS VARCHAR) AS {}", quote_ident(c)))
            .chain(std::iter::once("CAST(NULL AS VARCHAR) AS filename".to_string()))
            .collect::<Vec<_>>()
            .join(", ");
        format!("(SELECT {} WHERE false)", nulls)
    } else {
        let list = files
            .iter()
            .map(|f| quote_literal(f))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "read_csv_auto([{}], header = true, all_varchar = true, filename = true, union_by_name = true)",
            list
        )
    };

    format!(
        "CREATE SCHEMA IF NOT EXISTS {ns};\n\
         CREATE OR REPLACE VIEW {ns}.{table} AS SELECT\n    \
         strptime(\"timestamp\", '%Y-%m-%dT%H:%M:%SZ') AS \"timestamp\",\n    \
         regexp_extract(filename, 'instance-(.+)\\.csv$', 1) AS instance_id,\n    \
         {metrics}\n\
         FROM {source};",
        ns = quote_ident(namespace),
        table = quote_ident(table),
        metrics = metrics,
        source = source,
    )
}

fn stage_csv(columns: &[ColumnInfo], rows: &Rows) -> Bytes {
    let mut out = columns
        .iter()
        .map(|c| csv_escape(&c.name))
        .collect::<Vec<_>>()
        .join(",");
    out.push('\n');
    for row in rows {
        let line = row
            .iter()
            .map(|v| v.as_deref().map(csv_escape).unwrap_or_default())
            .collect::<Vec<_>>()
            .join(",");
        out.push_str(&line);
        out.push('\n');
    }
    Bytes::from(out)
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}
