//! Metric retrieval and alignment.
//!
//! Each metric is fetched as its own sparse series, then the series are outer
//! joined on the window's bucket grid. A bucket without a reading stays `None`.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::models::{AlignedSeriesRow, Metric, MetricSample, MetricWindow};
use crate::retry::RetryPolicy;
use crate::{PipelineError, Result};

pub mod http;

pub use http::HttpMonitoringSource;

/// Read-only time-series source.
#[async_trait]
pub trait MonitoringSource: Send + Sync {
    /// Samples for one metric over `window` at `window.period` resolution.
    /// Samples may be sparse and in any order.
    async fn get_series(
        &self,
        instance_id: &str,
        metric: Metric,
        window: &MetricWindow,
    ) -> Result<Vec<MetricSample>>;
}

/// Aligned rows plus per-metric bookkeeping for the collection report.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedSeries {
    pub rows: Vec<AlignedSeriesRow>,
    pub datapoints: BTreeMap<Metric, usize>,
    pub failed: Vec<Metric>,
}

pub struct MetricsFetcher {
    source: Arc<dyn MonitoringSource>,
    retry: RetryPolicy,
}

impl MetricsFetcher {
    pub fn new(source: Arc<dyn MonitoringSource>, retry: RetryPolicy) -> Self {
        Self { source, retry }
    }

    pub async fn fetch(
        &self,
        window: &MetricWindow,
        instance_id: &str,
        metrics: &[Metric],
    ) -> Result<FetchedSeries> {
        if metrics.is_empty() {
            return Err(PipelineError::Configuration("no metrics requested".into()));
        }

        let buckets = window.bucket_count();
        let mut columns: BTreeMap<Metric, Vec<Option<f64>>> = BTreeMap::new();
        let mut failed = Vec::new();
        let mut first_error = None;

        for &metric in metrics {
            let mut column = vec![None; buckets];
            let fetched = self
                .retry
                .run(metric.source_name(), || {
                    self.source.get_series(instance_id, metric, window)
                })
                .await;

            match fetched {
                Ok(samples) => {
                    let mut dropped = 0usize;
                    for sample in samples {
                        match window.bucket_index(sample.timestamp) {
                            // later samples for the same bucket win
                            Some(idx) => column[idx] = sample.value.filter(|v| v.is_finite()),
                            None => dropped += 1,
                        }
                    }
                    if dropped > 0 {
                        debug!(metric = %metric, dropped, "discarded samples outside the window");
                    }
                }
                Err(err) => {
                    warn!(
                        instance_id = %instance_id,
                        metric = %metric,
                        error = %err,
                        "metric fetch failed, column will be null"
                    );
                    failed.push(metric);
                    first_error.get_or_insert(err);
                }
            }
            columns.insert(metric, column);
        }

        if failed.len() == metrics.len() {
            let cause = first_error
                .map(|e| e.detail().to_string())
                .unwrap_or_default();
            return Err(PipelineError::upstream(format!(
                "all {} metric series failed: {}",
                metrics.len(),
                cause
            )));
        }

        let rows: Vec<AlignedSeriesRow> = window
            .buckets()
            .enumerate()
            .map(|(idx, timestamp)| AlignedSeriesRow {
                timestamp,
                instance_id: instance_id.to_string(),
                values: columns.iter().map(|(m, col)| (*m, col[idx])).collect(),
            })
            .collect();

        let datapoints = columns
            .iter()
            .map(|(m, col)| (*m, col.iter().filter(|v| v.is_some()).count()))
            .collect();

        info!(
            instance_id = %instance_id,
            buckets,
            failed = failed.len(),
            "aligned metric series"
        );

        Ok(FetchedSeries {
            rows,
            datapoints,
            failed,
        })
    }
}
