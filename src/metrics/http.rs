use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use super::MonitoringSource;
use crate::models::{format_timestamp, Metric, MetricSample, MetricWindow};
use crate::{PipelineError, Result};

#[derive(Debug, Deserialize)]
struct SeriesResponse {
    points: Vec<SeriesPoint>,
}

#[derive(Debug, Deserialize)]
struct SeriesPoint {
    timestamp: DateTime<Utc>,
    value: Option<f64>,
}

/// Monitoring source reached over HTTP.
///
/// `GET {endpoint}/series?instance_id=&metric=&stat=&unit=&start=&end=&period=`
/// answers `{"points": [{"timestamp": "...", "value": 1.5}, ...]}`.
#[derive(Debug, Clone)]
pub struct HttpMonitoringSource {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpMonitoringSource {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PipelineError::Configuration(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl MonitoringSource for HttpMonitoringSource {
    async fn get_series(
        &self,
        instance_id: &str,
        metric: Metric,
        window: &MetricWindow,
    ) -> Result<Vec<MetricSample>> {
        let url = format!("{}/series", self.endpoint);
        let period = window.period.num_seconds().to_string();
        let start = format_timestamp(&window.start);
        let end = format_timestamp(&window.end);

        debug!(url = %url, metric = %metric, "requesting series");

        let response = self
            .client
            .get(&url)
            .query(&[
                ("instance_id", instance_id),
                ("metric", metric.source_name()),
                ("stat", metric.statistic().as_str()),
                ("unit", metric.unit()),
                ("start", start.as_str()),
                ("end", end.as_str()),
                ("period", period.as_str()),
            ])
            .send()
            .await?
            .error_for_status()?;

        let body: SeriesResponse = response.json().await?;

        Ok(body
            .points
            .into_iter()
            .map(|p| MetricSample {
                timestamp: p.timestamp,
                metric,
                value: p.value,
            })
            .collect())
    }
}
