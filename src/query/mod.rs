//! Asynchronous query pipeline: submit, poll to a terminal state, materialize.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::models::QueryState;
use crate::Result;

pub mod engine;
pub mod materialize;
pub mod poll;
pub mod response;
pub mod submit;

pub use engine::DuckDbQueryEngine;
pub use materialize::{MaterializedResult, ResultMaterializer};
pub use poll::{QueryPoller, Timer, TokioTimer};
pub use response::ResponseFormatter;
pub use submit::{QuerySubmitter, MAX_QUERY_BYTES};

/// State reported by the engine for one execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionStatus {
    pub state: QueryState,
    /// Engine-provided explanation, set for failed or cancelled executions
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    /// Engine type name, e.g. `DOUBLE`, `varchar`, `timestamp`
    pub type_name: String,
}

/// One page of string-encoded results. Only the first page must carry
/// `columns`; later pages may repeat them or leave them empty.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResultPage {
    pub columns: Vec<ColumnInfo>,
    pub rows: Vec<Vec<Option<String>>>,
    pub next_token: Option<String>,
}

/// Asynchronous SQL engine. Submission returns immediately; syntax and
/// runtime errors show up later as a `Failed` state.
#[async_trait]
pub trait QueryEngine: Send + Sync {
    async fn submit(&self, sql: &str, namespace: &str, output_location: &str) -> Result<String>;

    async fn get_state(&self, execution_id: &str) -> Result<ExecutionStatus>;

    async fn get_results(&self, execution_id: &str, page_token: Option<&str>) -> Result<ResultPage>;
}
