use bytes::Bytes;
use chrono::Datelike;
use std::sync::Arc;
use tracing::info;

use crate::models::{format_timestamp, AlignedSeriesRow, Metric, MetricWindow};
use crate::retry::RetryPolicy;
use crate::storage::ObjectStore;
use crate::{PipelineError, Result};

/// Bumped whenever the column layout below changes.
pub const PARTITION_SCHEMA_VERSION: u32 = 1;

/// Header of a partition object: timestamp, then metrics in declared order.
pub fn partition_columns() -> Vec<&'static str> {
    std::iter::once("timestamp")
        .chain(Metric::ALL.iter().map(|m| m.column()))
        .collect()
}

/// One instance-day; names exactly one storage object.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PartitionKey {
    pub instance_id: String,
    pub year: i32,
    pub month: u32,
    pub day: u32,
}

impl PartitionKey {
    /// Derived from the UTC date of `window.start`.
    pub fn from_window(instance_id: &str, window: &MetricWindow) -> Self {
        let date = window.start.date_naive();
        Self {
            instance_id: instance_id.to_string(),
            year: date.year(),
            month: date.month(),
            day: date.day(),
        }
    }

    /// `<prefix>/<yyyy>/<mm>/<dd>/instance-<id>.csv`
    pub fn object_key(&self, prefix: &str) -> String {
        format!(
            "{}/{:04}/{:02}/{:02}/instance-{}.csv",
            prefix.trim_end_matches('/'),
            self.year,
            self.month,
            self.day,
            self.instance_id
        )
    }
}

pub struct PartitionWriter {
    store: Arc<dyn ObjectStore>,
    prefix: String,
    retry: RetryPolicy,
}

impl PartitionWriter {
    pub fn new(store: Arc<dyn ObjectStore>, prefix: impl Into<String>, retry: RetryPolicy) -> Self {
        Self {
            store,
            prefix: prefix.into(),
            retry,
        }
    }

    /// Serializes rows; identical input always yields identical bytes.
    pub fn encode(rows: &[AlignedSeriesRow]) -> Result<Bytes> {
        if let Some(pair) = rows.windows(2).find(|p| p[0].timestamp >= p[1].timestamp) {
            return Err(PipelineError::Validation(format!(
                "rows out of order at {}",
                format_timestamp(&pair[1].timestamp)
            )));
        }

        let mut out = partition_columns().join(",");
        out.push('\n');
        for row in rows {
            out.push_str(&format_timestamp(&row.timestamp));
            for metric in Metric::ALL {
                out.push(',');
                if let Some(value) = row.value(metric) {
                    out.push_str(&format_value(value));
                }
            }
            out.push('\n');
        }
        Ok(Bytes::from(out))
    }

    /// Replaces the partition object for `key`; returns the object key.
    pub async fn write(&self, key: &PartitionKey, rows: &[AlignedSeriesRow]) -> Result<String> {
        let body = Self::encode(rows)?;
        let object_key = key.object_key(&self.prefix);

        self.retry
            .run("partition put", || self.store.put(&object_key, body.clone()))
            .await?;

        info!(
            key = %object_key,
            rows = rows.len(),
            bytes = body.len(),
            schema_version = PARTITION_SCHEMA_VERSION,
            "partition written"
        );
        Ok(object_key)
    }
}

/// Whole numbers without a fraction, everything else with three decimals.
fn format_value(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{:.3}", value)
    }
}
