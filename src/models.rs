use chrono::{DateTime, Duration, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

use crate::{PipelineError, Result};

/// Monitoring statistic requested for a metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Statistic {
    Average,
    Sum,
}

impl Statistic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Statistic::Average => "Average",
            Statistic::Sum => "Sum",
        }
    }
}

/// Metrics collected for every instance, in partition column order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Metric {
    #[serde(rename = "cpu_percent")]
    CpuUtilization,
    #[serde(rename = "network_in_bytes")]
    NetworkIn,
    #[serde(rename = "network_out_bytes")]
    NetworkOut,
}

impl Metric {
    pub const ALL: [Metric; 3] = [Metric::CpuUtilization, Metric::NetworkIn, Metric::NetworkOut];

    /// Name understood by the monitoring source.
    pub fn source_name(&self) -> &'static str {
        match self {
            Metric::CpuUtilization => "CPUUtilization",
            Metric::NetworkIn => "NetworkIn",
            Metric::NetworkOut => "NetworkOut",
        }
    }

    pub fn statistic(&self) -> Statistic {
        match self {
            Metric::CpuUtilization => Statistic::Average,
            // bytes per period
            Metric::NetworkIn | Metric::NetworkOut => Statistic::Sum,
        }
    }

    pub fn unit(&self) -> &'static str {
        match self {
            Metric::CpuUtilization => "Percent",
            Metric::NetworkIn | Metric::NetworkOut => "Bytes",
        }
    }

    /// Column name in partition objects.
    pub fn column(&self) -> &'static str {
        match self {
            Metric::CpuUtilization => "cpu_percent",
            Metric::NetworkIn => "network_in_bytes",
            Metric::NetworkOut => "network_out_bytes",
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.source_name())
    }
}

/// Half-open collection interval `[start, end)` split into `period` buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub period: Duration,
}

impl MetricWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>, period: Duration) -> Result<Self> {
        if period <= Duration::zero() {
            return Err(PipelineError::Configuration(format!(
                "period must be positive, got {}s",
                period.num_seconds()
            )));
        }
        if start >= end {
            return Err(PipelineError::Configuration(format!(
                "window start {} is not before end {}",
                start, end
            )));
        }
        let length = end - start;
        if period > length {
            return Err(PipelineError::Configuration(format!(
                "period {}s exceeds window length {}s",
                period.num_seconds(),
                length.num_seconds()
            )));
        }
        if length.num_seconds() % period.num_seconds() != 0 {
            return Err(PipelineError::Configuration(format!(
                "period {}s does not divide window length {}s",
                period.num_seconds(),
                length.num_seconds()
            )));
        }
        Ok(Self { start, end, period })
    }

    pub fn bucket_count(&self) -> usize {
        ((self.end - self.start).num_seconds() / self.period.num_seconds()) as usize
    }

    /// Bucket start times, ascending.
    pub fn buckets(&self) -> impl Iterator<Item = DateTime<Utc>> + '_ {
        (0..self.bucket_count()).map(move |i| self.start + self.period * i as i32)
    }

    /// Index of the bucket containing `ts`, or `None` outside the window.
    pub fn bucket_index(&self, ts: DateTime<Utc>) -> Option<usize> {
        if ts < self.start || ts >= self.end {
            return None;
        }
        let offset = (ts - self.start).num_seconds();
        Some((offset / self.period.num_seconds()) as usize)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetricSample {
    pub timestamp: DateTime<Utc>,
    pub metric: Metric,
    /// `None` is a missing reading, never zero.
    pub value: Option<f64>,
}

/// One time bucket with a value slot for every collected metric.
#[derive(Debug, Clone, PartialEq)]
pub struct AlignedSeriesRow {
    pub timestamp: DateTime<Utc>,
    pub instance_id: String,
    pub values: BTreeMap<Metric, Option<f64>>,
}

impl AlignedSeriesRow {
    pub fn value(&self, metric: Metric) -> Option<f64> {
        self.values.get(&metric).copied().flatten()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryRequest {
    pub sql: String,
}

impl QueryRequest {
    pub fn new(sql: impl Into<String>) -> Self {
        Self { sql: sql.into() }
    }

    /// Rejects empty text and text over the engine limit.
    pub fn validate(&self, max_len: usize) -> Result<()> {
        if self.sql.trim().is_empty() {
            return Err(PipelineError::Validation("query text is empty".into()));
        }
        if self.sql.len() > max_len {
            return Err(PipelineError::Validation(format!(
                "query text is {} bytes, limit is {}",
                self.sql.len(),
                max_len
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryState {
    Submitted,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl QueryState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            QueryState::Succeeded | QueryState::Failed | QueryState::Cancelled
        )
    }

    fn rank(&self) -> u8 {
        match self {
            QueryState::Submitted => 0,
            QueryState::Running => 1,
            _ => 2,
        }
    }
}

/// One engine execution as seen by a single request.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryExecution {
    pub id: String,
    pub state: QueryState,
    pub submitted_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl QueryExecution {
    pub fn submitted(id: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            state: QueryState::Submitted,
            submitted_at: at,
            completed_at: None,
        }
    }

    /// Moves forward along `Submitted -> Running -> terminal`. Returns false and
    /// leaves the execution untouched for backwards or post-terminal reports.
    pub fn advance(&mut self, next: QueryState, at: DateTime<Utc>) -> bool {
        if self.state.is_terminal() || next.rank() < self.state.rank() {
            return false;
        }
        self.state = next;
        if next.is_terminal() {
            self.completed_at = Some(at);
        }
        true
    }
}

/// Typed result cell.
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
    Timestamp(DateTime<Utc>),
}

impl Cell {
    pub fn to_json(&self) -> Value {
        match self {
            Cell::Null => Value::Null,
            Cell::Bool(b) => Value::Bool(*b),
            Cell::Integer(i) => Value::from(*i),
            Cell::Float(f) => serde_json::Number::from_f64(*f)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            Cell::Text(s) => Value::String(s.clone()),
            Cell::Timestamp(ts) => Value::String(format_timestamp(ts)),
        }
    }

    fn to_csv_field(&self) -> String {
        match self {
            Cell::Null => String::new(),
            Cell::Bool(b) => b.to_string(),
            Cell::Integer(i) => i.to_string(),
            Cell::Float(f) if f.is_finite() => f.to_string(),
            Cell::Float(_) => String::new(),
            Cell::Text(s) => csv_escape(s),
            Cell::Timestamp(ts) => format_timestamp(ts),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryResultSet {
    pub schema: Vec<String>,
    pub rows: Vec<Vec<Cell>>,
    pub result_location: String,
}

impl QueryResultSet {
    /// Full result as CSV with a header line.
    pub fn to_csv(&self) -> String {
        let mut out = self
            .schema
            .iter()
            .map(|c| csv_escape(c))
            .collect::<Vec<_>>()
            .join(",");
        out.push('\n');
        for row in &self.rows {
            let line = row.iter().map(Cell::to_csv_field).collect::<Vec<_>>().join(",");
            out.push_str(&line);
            out.push('\n');
        }
        out
    }

    /// First `limit` rows as objects keyed by column name, in schema order.
    pub fn preview(&self, limit: usize) -> Vec<Map<String, Value>> {
        self.rows
            .iter()
            .take(limit)
            .map(|row| {
                self.schema
                    .iter()
                    .zip(row.iter())
                    .map(|(name, cell)| (name.clone(), cell.to_json()))
                    .collect()
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: String,
    pub message: String,
}

/// Payload returned to query callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ApiResponse {
    Success {
        data: Vec<Map<String, Value>>,
        csv_url: String,
    },
    Failure {
        error: ErrorBody,
    },
}

/// Summary of one collection run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionReport {
    pub status: String,
    pub instance_id: String,
    pub timestamps: usize,
    /// Non-null samples per metric column
    pub datapoints: BTreeMap<Metric, usize>,
    pub failed_metrics: Vec<Metric>,
    pub partition_key: String,
    pub period_seconds: i64,
    pub window_start: String,
    pub window_end: String,
}

/// RFC 3339, UTC, `Z` suffix, fractional seconds only when present.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

pub(crate) fn csv_escape(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}
