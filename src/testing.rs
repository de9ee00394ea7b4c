//! Scriptable collaborators for exercising the pipelines without a network,
//! a query engine or a real clock.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use crate::metrics::MonitoringSource;
use crate::models::{Metric, MetricSample, MetricWindow, QueryState};
use crate::query::{ColumnInfo, ExecutionStatus, QueryEngine, ResultPage, Timer};
use crate::storage::{InMemoryObjectStore, ObjectStore};
use crate::{PipelineError, Result};

/// Monitoring source answering from fixed per-metric series.
#[derive(Default)]
pub struct FakeMonitoringSource {
    series: HashMap<Metric, Vec<(DateTime<Utc>, f64)>>,
    failures: HashMap<Metric, PipelineError>,
    transient_failures: HashMap<Metric, usize>,
    calls: Mutex<HashMap<Metric, usize>>,
}

impl FakeMonitoringSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_series(mut self, metric: Metric, points: Vec<(DateTime<Utc>, f64)>) -> Self {
        self.series.insert(metric, points);
        self
    }

    /// Every call for `metric` fails with `err`.
    pub fn with_failure(mut self, metric: Metric, err: PipelineError) -> Self {
        self.failures.insert(metric, err);
        self
    }

    /// The first `n` calls for `metric` fail with a retryable error.
    pub fn failing_first(mut self, metric: Metric, n: usize) -> Self {
        self.transient_failures.insert(metric, n);
        self
    }

    pub fn calls(&self, metric: Metric) -> usize {
        self.calls.lock().get(&metric).copied().unwrap_or(0)
    }
}

#[async_trait]
impl MonitoringSource for FakeMonitoringSource {
    async fn get_series(
        &self,
        _instance_id: &str,
        metric: Metric,
        _window: &MetricWindow,
    ) -> Result<Vec<MetricSample>> {
        let call = {
            let mut calls = self.calls.lock();
            let count = calls.entry(metric).or_insert(0);
            *count += 1;
            *count
        };

        if call <= self.transient_failures.get(&metric).copied().unwrap_or(0) {
            return Err(PipelineError::transient(format!("{} throttled", metric)));
        }
        if let Some(err) = self.failures.get(&metric) {
            return Err(err.clone());
        }

        Ok(self
            .series
            .get(&metric)
            .map(|points| {
                points
                    .iter()
                    .map(|(timestamp, value)| MetricSample {
                        timestamp: *timestamp,
                        metric,
                        value: Some(*value),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }
}

/// Query engine that replays a scripted sequence of states and pages.
///
/// Each state check returns the next scripted state; the last one repeats.
/// Page tokens are page indexes.
pub struct ScriptedQueryEngine {
    states: Vec<QueryState>,
    reason: Option<String>,
    pages: Vec<ResultPage>,
    submit_error: Option<PipelineError>,
    submits: AtomicUsize,
    polls: AtomicUsize,
    result_calls: AtomicUsize,
    last_sql: Mutex<Option<String>>,
}

impl Default for ScriptedQueryEngine {
    fn default() -> Self {
        Self {
            states: vec![QueryState::Succeeded],
            reason: None,
            pages: vec![ResultPage::default()],
            submit_error: None,
            submits: AtomicUsize::new(0),
            polls: AtomicUsize::new(0),
            result_calls: AtomicUsize::new(0),
            last_sql: Mutex::new(None),
        }
    }
}

impl ScriptedQueryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_states(mut self, states: Vec<QueryState>) -> Self {
        if !states.is_empty() {
            self.states = states;
        }
        self
    }

    /// Reason attached to failed and cancelled states.
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_pages(mut self, pages: Vec<ResultPage>) -> Self {
        self.pages = pages;
        self
    }

    pub fn rejecting_submit(mut self, err: PipelineError) -> Self {
        self.submit_error = Some(err);
        self
    }

    pub fn submits(&self) -> usize {
        self.submits.load(Ordering::SeqCst)
    }

    pub fn polls(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }

    pub fn result_calls(&self) -> usize {
        self.result_calls.load(Ordering::SeqCst)
    }

    pub fn last_sql(&self) -> Option<String> {
        self.last_sql.lock().clone()
    }
}

#[async_trait]
impl QueryEngine for ScriptedQueryEngine {
    async fn submit(&self, sql: &str, _namespace: &str, _output_location: &str) -> Result<String> {
        let n = self.submits.fetch_add(1, Ordering::SeqCst) + 1;
        *self.last_sql.lock() = Some(sql.to_string());
        match &self.submit_error {
            Some(err) => Err(err.clone()),
            None => Ok(format!("exec-{}", n)),
        }
    }

    async fn get_state(&self, _execution_id: &str) -> Result<ExecutionStatus> {
        let idx = self.polls.fetch_add(1, Ordering::SeqCst);
        let state = self.states[idx.min(self.states.len() - 1)];
        let reason = match state {
            QueryState::Failed | QueryState::Cancelled => self.reason.clone(),
            _ => None,
        };
        Ok(ExecutionStatus { state, reason })
    }

    async fn get_results(&self, _execution_id: &str, page_token: Option<&str>) -> Result<ResultPage> {
        self.result_calls.fetch_add(1, Ordering::SeqCst);
        let idx = match page_token {
            Some(token) => token
                .parse::<usize>()
                .map_err(|_| PipelineError::upstream(format!("invalid page token {:?}", token)))?,
            None => 0,
        };
        self.pages
            .get(idx)
            .cloned()
            .ok_or_else(|| PipelineError::upstream(format!("no result page {}", idx)))
    }
}

/// Timer whose clock only moves when something sleeps on it.
pub struct ManualTimer {
    origin: Instant,
    offset: Mutex<Duration>,
    sleeps: Mutex<Vec<Duration>>,
}

impl Default for ManualTimer {
    fn default() -> Self {
        Self {
            origin: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
            sleeps: Mutex::new(Vec::new()),
        }
    }
}

impl ManualTimer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn elapsed(&self) -> Duration {
        *self.offset.lock()
    }

    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().clone()
    }
}

#[async_trait]
impl Timer for ManualTimer {
    fn now(&self) -> Instant {
        self.origin + *self.offset.lock()
    }

    async fn sleep(&self, duration: Duration) {
        self.sleeps.lock().push(duration);
        *self.offset.lock() += duration;
    }
}

/// In-memory store whose first puts fail.
pub struct FlakyObjectStore {
    inner: InMemoryObjectStore,
    remaining_failures: AtomicU32,
    put_attempts: AtomicUsize,
}

impl FlakyObjectStore {
    pub fn failing_puts(n: u32) -> Self {
        Self {
            inner: InMemoryObjectStore::new("flaky"),
            remaining_failures: AtomicU32::new(n),
            put_attempts: AtomicUsize::new(0),
        }
    }

    pub fn inner(&self) -> &InMemoryObjectStore {
        &self.inner
    }

    pub fn put_attempts(&self) -> usize {
        self.put_attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ObjectStore for FlakyObjectStore {
    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        self.put_attempts.fetch_add(1, Ordering::SeqCst);
        let failed = self
            .remaining_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(PipelineError::Storage(format!("injected put failure for {}", key)));
        }
        self.inner.put(key, data).await
    }

    async fn get(&self, key: &str) -> Result<Bytes> {
        self.inner.get(key).await
    }

    fn locator(&self, key: &str) -> String {
        self.inner.locator(key)
    }
}

/// Builds a result page from string cells.
pub fn text_page(columns: &[(&str, &str)], rows: &[&[Option<&str>]]) -> ResultPage {
    ResultPage {
        columns: columns
            .iter()
            .map(|(name, type_name)| ColumnInfo {
                name: name.to_string(),
                type_name: type_name.to_string(),
            })
            .collect(),
        rows: rows
            .iter()
            .map(|row| row.iter().map(|v| v.map(str::to_string)).collect())
            .collect(),
        next_token: None,
    }
}
