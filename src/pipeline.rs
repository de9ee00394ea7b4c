//! End-to-end orchestration of the two pipelines.
//!
//! Collection: resolve window -> fetch and align -> write the day partition.
//! Query: submit -> poll -> materialize -> format.

use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument};

use crate::config::PipelineConfig;
use crate::metrics::{HttpMonitoringSource, MetricsFetcher, MonitoringSource};
use crate::models::{format_timestamp, ApiResponse, CollectionReport, Metric, QueryRequest};
use crate::partitioning::{PartitionKey, PartitionWriter};
use crate::query::{
    DuckDbQueryEngine, MaterializedResult, QueryEngine, QueryPoller, QuerySubmitter,
    ResponseFormatter, ResultMaterializer, Timer, TokioTimer,
};
use crate::retry::RetryPolicy;
use crate::storage::{LocalObjectStore, ObjectStore};
use crate::window::TimeWindowResolver;
use crate::{PipelineError, Result};

const MONITORING_TIMEOUT: Duration = Duration::from_secs(30);

pub struct CollectionPipeline {
    config: Arc<PipelineConfig>,
    resolver: TimeWindowResolver,
    fetcher: MetricsFetcher,
    writer: PartitionWriter,
}

impl CollectionPipeline {
    pub fn new(
        config: Arc<PipelineConfig>,
        source: Arc<dyn MonitoringSource>,
        store: Arc<dyn ObjectStore>,
    ) -> Result<Self> {
        let resolver = TimeWindowResolver::from_config(&config)?;
        let fetcher = MetricsFetcher::new(source, RetryPolicy::upstream(&config));
        let writer = PartitionWriter::new(
            store,
            config.metrics_prefix.clone(),
            RetryPolicy::storage(&config),
        );
        Ok(Self {
            config,
            resolver,
            fetcher,
            writer,
        })
    }

    /// Local store under `storage_root()` fed by the HTTP monitoring source.
    pub fn from_config(config: Arc<PipelineConfig>) -> Result<Self> {
        let endpoint = config.monitoring_endpoint.clone().ok_or_else(|| {
            PipelineError::Configuration("MONITORING_ENDPOINT is required for collection".into())
        })?;
        let source = Arc::new(HttpMonitoringSource::new(endpoint, MONITORING_TIMEOUT)?);
        let store = Arc::new(LocalObjectStore::new(config.storage_root())?);
        Self::new(config, source, store)
    }

    pub async fn run(&self) -> Result<CollectionReport> {
        self.run_at(Utc::now()).await
    }

    #[instrument(skip(self), fields(instance_id = %self.config.instance_id))]
    pub async fn run_at(&self, now: DateTime<Utc>) -> Result<CollectionReport> {
        let instance_id = &self.config.instance_id;
        let window = self.resolver.resolve(now, self.config.launch_time)?;
        info!(
            start = %format_timestamp(&window.start),
            end = %format_timestamp(&window.end),
            "collecting metrics"
        );

        let fetched = self.fetcher.fetch(&window, instance_id, &Metric::ALL).await?;
        let key = PartitionKey::from_window(instance_id, &window);
        let object_key = self.writer.write(&key, &fetched.rows).await?;

        let report = CollectionReport {
            status: "ok".to_string(),
            instance_id: instance_id.clone(),
            timestamps: fetched.rows.len(),
            datapoints: fetched.datapoints,
            failed_metrics: fetched.failed,
            partition_key: object_key,
            period_seconds: self.config.period_seconds,
            window_start: format_timestamp(&window.start),
            window_end: format_timestamp(&window.end),
        };
        info!(
            partition = %report.partition_key,
            timestamps = report.timestamps,
            failed = report.failed_metrics.len(),
            "collection finished"
        );
        Ok(report)
    }
}

pub struct QueryPipeline {
    config: Arc<PipelineConfig>,
    submitter: QuerySubmitter,
    poller: QueryPoller,
    materializer: ResultMaterializer,
}

impl QueryPipeline {
    pub fn new(
        config: Arc<PipelineConfig>,
        engine: Arc<dyn QueryEngine>,
        store: Arc<dyn ObjectStore>,
        timer: Arc<dyn Timer>,
    ) -> Self {
        let upstream = RetryPolicy::upstream(&config);
        let submitter = QuerySubmitter::new(
            engine.clone(),
            config.database.clone(),
            config.output_location.clone(),
            upstream,
        );
        let poller = QueryPoller::new(engine.clone(), timer, config.poll.clone(), upstream);
        let materializer = ResultMaterializer::new(
            engine,
            store,
            config.latest_result_key(),
            config.preview_rows,
            upstream,
            RetryPolicy::storage(&config),
        );
        Self {
            config,
            submitter,
            poller,
            materializer,
        }
    }

    /// DuckDB engine over the local store, real clock.
    pub fn from_config(config: Arc<PipelineConfig>) -> Result<Self> {
        let store = Arc::new(LocalObjectStore::new(config.storage_root())?);
        let engine = Arc::new(DuckDbQueryEngine::from_config(&config, store.clone()));
        Ok(Self::new(config, engine, store, Arc::new(TokioTimer)))
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Runs one query to a materialized result under the execution deadline.
    pub async fn execute(&self, request: QueryRequest) -> Result<MaterializedResult> {
        let deadline = self.config.execution_deadline;
        tokio::time::timeout(deadline, self.execute_inner(&request))
            .await
            .map_err(|_| {
                PipelineError::Timeout(format!(
                    "query did not complete within the {}s deadline",
                    deadline.as_secs_f64()
                ))
            })?
    }

    async fn execute_inner(&self, request: &QueryRequest) -> Result<MaterializedResult> {
        let execution = self.submitter.submit(request).await?;
        let execution = self.poller.wait(execution).await?;
        self.materializer.materialize(&execution).await
    }

    /// Maps a parsed (or rejected) request to the response the caller sees.
    pub async fn respond(&self, request: Result<QueryRequest>) -> (StatusCode, ApiResponse) {
        let outcome = match request {
            Ok(request) => self.execute(request).await,
            Err(err) => Err(err),
        };
        match outcome {
            Ok(result) => ResponseFormatter::success(&result),
            Err(err) => ResponseFormatter::failure(&err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PollConfig;
    use crate::models::QueryState;
    use crate::storage::InMemoryObjectStore;
    use crate::testing::{text_page, FakeMonitoringSource, ManualTimer, ScriptedQueryEngine};
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn ts(d: u32, h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 8, d, h, m, 0).unwrap()
    }

    fn config() -> Arc<PipelineConfig> {
        let mut config = PipelineConfig::new("bucket", "i-0abc");
        config.retry_base_delay = Duration::ZERO;
        Arc::new(config)
    }

    fn source() -> FakeMonitoringSource {
        FakeMonitoringSource::new()
            .with_series(Metric::CpuUtilization, vec![(ts(27, 15, 0), 3.4), (ts(27, 15, 5), 7.25)])
            .with_series(Metric::NetworkIn, vec![(ts(27, 15, 0), 2048.0)])
            .with_series(Metric::NetworkOut, vec![(ts(27, 15, 5), 512.0)])
    }

    #[test_log::test(tokio::test)]
    async fn test_collection_writes_one_day_partition() {
        let store = Arc::new(InMemoryObjectStore::new("bucket"));
        let pipeline = CollectionPipeline::new(config(), Arc::new(source()), store.clone()).unwrap();

        let report = pipeline.run_at(ts(28, 0, 10)).await.unwrap();

        assert_eq!(report.status, "ok");
        assert_eq!(report.timestamps, 288);
        assert_eq!(report.partition_key, "ec2-metrics/2025/08/27/instance-i-0abc.csv");
        assert_eq!(report.window_start, "2025-08-27T00:00:00Z");
        assert_eq!(report.window_end, "2025-08-28T00:00:00Z");
        assert_eq!(report.datapoints[&Metric::CpuUtilization], 2);
        assert!(report.failed_metrics.is_empty());

        let body = store.get(&report.partition_key).await.unwrap();
        let text = std::str::from_utf8(&body).unwrap();
        assert!(text.starts_with("timestamp,cpu_percent,network_in_bytes,network_out_bytes\n"));
        assert!(text.contains("2025-08-27T15:00:00Z,3.400,2048,\n"));
        assert!(text.contains("2025-08-27T15:05:00Z,7.250,,512\n"));
        assert_eq!(text.lines().count(), 289);
    }

    #[tokio::test]
    async fn test_rerun_is_byte_identical() {
        let store = Arc::new(InMemoryObjectStore::new("bucket"));
        let pipeline = CollectionPipeline::new(config(), Arc::new(source()), store.clone()).unwrap();

        let first = pipeline.run_at(ts(28, 0, 10)).await.unwrap();
        let before = store.get(&first.partition_key).await.unwrap();
        let second = pipeline.run_at(ts(28, 23, 59)).await.unwrap();
        let after = store.get(&second.partition_key).await.unwrap();

        assert_eq!(first.partition_key, second.partition_key);
        assert_eq!(before, after);
        assert_eq!(store.keys().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_partial_metric_failure_still_collects() {
        let store = Arc::new(InMemoryObjectStore::new("bucket"));
        let source = source().with_failure(Metric::NetworkIn, PipelineError::upstream("access denied"));
        let pipeline = CollectionPipeline::new(config(), Arc::new(source), store.clone()).unwrap();

        let report = pipeline.run_at(ts(28, 0, 10)).await.unwrap();

        assert_eq!(report.failed_metrics, vec![Metric::NetworkIn]);
        assert_eq!(report.datapoints[&Metric::NetworkIn], 0);
        let body = store.get(&report.partition_key).await.unwrap();
        assert!(std::str::from_utf8(&body)
            .unwrap()
            .contains("2025-08-27T15:00:00Z,3.400,,\n"));
    }

    #[tokio::test]
    async fn test_collection_requires_endpoint() {
        let err = CollectionPipeline::from_config(config()).err().unwrap();
        assert_eq!(err.kind(), "ConfigurationError");
    }

    #[tokio::test]
    async fn test_query_round_trip_response() {
        let engine = Arc::new(
            ScriptedQueryEngine::new()
                .with_states(vec![QueryState::Running, QueryState::Succeeded])
                .with_pages(vec![text_page(
                    &[("ts", "TIMESTAMP"), ("cpu_percent", "DOUBLE")],
                    &[&[Some("2025-08-27 15:00:00"), Some("3.4")]],
                )]),
        );
        let store = Arc::new(InMemoryObjectStore::new("bucket"));
        let pipeline = QueryPipeline::new(config(), engine, store.clone(), Arc::new(ManualTimer::new()));

        let (status, body) = pipeline
            .respond(Ok(QueryRequest::new("SELECT ts, cpu_percent FROM t")))
            .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            serde_json::to_value(&body).unwrap(),
            json!({
                "data": [{"ts": "2025-08-27T15:00:00Z", "cpu_percent": 3.4}],
                "csv_url": "memory://bucket/athena-query-results/latest.csv"
            })
        );
        assert!(store.contains("athena-query-results/latest.csv").await);
    }

    #[tokio::test]
    async fn test_stuck_query_times_out_without_writing() {
        let mut config = PipelineConfig::new("bucket", "i-0abc");
        config.poll = PollConfig {
            budget: Duration::from_secs(3),
            ..PollConfig::default()
        };
        let engine = Arc::new(ScriptedQueryEngine::new().with_states(vec![QueryState::Running]));
        let store = Arc::new(InMemoryObjectStore::new("bucket"));
        let pipeline =
            QueryPipeline::new(Arc::new(config), engine, store.clone(), Arc::new(ManualTimer::new()));

        let (status, body) = pipeline.respond(Ok(QueryRequest::new("SELECT 1"))).await;

        assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(serde_json::to_value(&body).unwrap()["error"]["kind"], "TimeoutError");
        assert!(store.keys().await.unwrap().is_empty());
    }
}
