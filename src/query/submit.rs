use chrono::Utc;
use std::sync::Arc;
use tracing::info;

use super::QueryEngine;
use crate::models::{QueryExecution, QueryRequest};
use crate::retry::RetryPolicy;
use crate::Result;

/// Longest query text the engine accepts, in bytes.
pub const MAX_QUERY_BYTES: usize = 262_144;

pub struct QuerySubmitter {
    engine: Arc<dyn QueryEngine>,
    namespace: String,
    output_location: String,
    retry: RetryPolicy,
}

impl QuerySubmitter {
    pub fn new(
        engine: Arc<dyn QueryEngine>,
        namespace: impl Into<String>,
        output_location: impl Into<String>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            engine,
            namespace: namespace.into(),
            output_location: output_location.into(),
            retry,
        }
    }

    /// Validates locally, then hands the text to the engine. Invalid requests
    /// never reach the engine.
    pub async fn submit(&self, request: &QueryRequest) -> Result<QueryExecution> {
        request.validate(MAX_QUERY_BYTES)?;

        let id = self
            .retry
            .run("query submit", || {
                self.engine
                    .submit(&request.sql, &self.namespace, &self.output_location)
            })
            .await?;

        info!(execution_id = %id, namespace = %self.namespace, "query submitted");
        Ok(QueryExecution::submitted(id, Utc::now()))
    }
}
