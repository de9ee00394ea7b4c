use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::QueryEngine;
use crate::config::PollConfig;
use crate::models::{QueryExecution, QueryState};
use crate::retry::RetryPolicy;
use crate::{PipelineError, Result};

/// Clock and sleep used by the poll loop.
#[async_trait]
pub trait Timer: Send + Sync {
    fn now(&self) -> Instant;

    async fn sleep(&self, duration: Duration);
}

/// Wall clock backed by the tokio timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioTimer;

#[async_trait]
impl Timer for TokioTimer {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Drives one execution to a terminal state within a fixed budget.
///
/// The engine is checked immediately, then after each sleep. Sleeps grow by
/// the configured multiplier and never run past the budget, so the final
/// check lands on the deadline. Running out of budget or attempts leaves the
/// remote execution alone.
pub struct QueryPoller {
    engine: Arc<dyn QueryEngine>,
    timer: Arc<dyn Timer>,
    config: PollConfig,
    retry: RetryPolicy,
}

impl QueryPoller {
    pub fn new(
        engine: Arc<dyn QueryEngine>,
        timer: Arc<dyn Timer>,
        config: PollConfig,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            engine,
            timer,
            config,
            retry,
        }
    }

    pub async fn wait(&self, mut execution: QueryExecution) -> Result<QueryExecution> {
        let started = self.timer.now();
        let mut interval = self.config.initial_interval.min(self.config.max_interval);
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let status = self
                .retry
                .run("query state", || self.engine.get_state(&execution.id))
                .await?;

            if !execution.advance(status.state, Utc::now()) {
                warn!(
                    execution_id = %execution.id,
                    current = ?execution.state,
                    reported = ?status.state,
                    "ignoring backwards state report"
                );
            }
            debug!(execution_id = %execution.id, state = ?execution.state, attempts, "polled");

            match execution.state {
                QueryState::Succeeded => {
                    info!(execution_id = %execution.id, attempts, "query succeeded");
                    return Ok(execution);
                }
                QueryState::Failed => {
                    let reason = status.reason.unwrap_or_else(|| "unknown error".to_string());
                    return Err(PipelineError::upstream(format!("query failed: {}", reason)));
                }
                QueryState::Cancelled => {
                    return Err(PipelineError::upstream("query was cancelled"));
                }
                QueryState::Submitted | QueryState::Running => {}
            }

            let elapsed = self.timer.now().saturating_duration_since(started);
            if attempts >= self.config.max_attempts || elapsed >= self.config.budget {
                warn!(
                    execution_id = %execution.id,
                    attempts,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "poll budget exhausted, abandoning execution"
                );
                return Err(PipelineError::Timeout(format!(
                    "query did not finish within {}s ({} checks)",
                    self.config.budget.as_secs_f64(),
                    attempts
                )));
            }

            self.timer.sleep(interval.min(self.config.budget - elapsed)).await;
            interval = grow(interval, self.config.backoff_multiplier, self.config.max_interval);
        }
    }
}

/// Next interval, capped at `max`. Growth that does not fit a `Duration`
/// (infinite or NaN factors included) lands on the cap.
fn grow(interval: Duration, multiplier: f64, max: Duration) -> Duration {
    Duration::try_from_secs_f64(interval.as_secs_f64() * multiplier)
        .unwrap_or(max)
        .min(max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ManualTimer, ScriptedQueryEngine};
    use pretty_assertions::assert_eq;

    fn poll_config(budget_secs: u64, max_attempts: u32) -> PollConfig {
        PollConfig {
            initial_interval: Duration::from_secs(1),
            backoff_multiplier: 1.0,
            max_interval: Duration::from_secs(5),
            budget: Duration::from_secs(budget_secs),
            max_attempts,
        }
    }

    fn poller(engine: Arc<ScriptedQueryEngine>, timer: Arc<ManualTimer>, config: PollConfig) -> QueryPoller {
        QueryPoller::new(
            engine,
            timer,
            config,
            RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::ZERO,
            },
        )
    }

    fn execution() -> QueryExecution {
        QueryExecution::submitted("exec-1", Utc::now())
    }

    #[tokio::test]
    async fn test_reaches_success_within_n_plus_one_checks() {
        for n in 0..5usize {
            let mut states = vec![QueryState::Submitted];
            states.extend(std::iter::repeat(QueryState::Running).take(n.saturating_sub(1)));
            states.truncate(n);
            states.push(QueryState::Succeeded);

            let engine = Arc::new(ScriptedQueryEngine::new().with_states(states));
            let timer = Arc::new(ManualTimer::new());
            let done = poller(engine.clone(), timer, poll_config(50, 60))
                .wait(execution())
                .await
                .unwrap();

            assert_eq!(done.state, QueryState::Succeeded);
            assert!(done.completed_at.is_some());
            assert!(engine.polls() <= n + 1, "n={} polls={}", n, engine.polls());
        }
    }

    #[tokio::test]
    async fn test_stuck_execution_times_out_at_budget() {
        let engine = Arc::new(ScriptedQueryEngine::new().with_states(vec![QueryState::Running]));
        let timer = Arc::new(ManualTimer::new());

        let err = poller(engine.clone(), timer.clone(), poll_config(5, 100))
            .wait(execution())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), "TimeoutError");
        assert_eq!(timer.elapsed(), Duration::from_secs(5));
        assert_eq!(engine.polls(), 6);
    }

    #[tokio::test]
    async fn test_attempt_cap_applies_before_budget() {
        let engine = Arc::new(ScriptedQueryEngine::new().with_states(vec![QueryState::Running]));
        let timer = Arc::new(ManualTimer::new());

        let err = poller(engine.clone(), timer.clone(), poll_config(50, 3))
            .wait(execution())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), "TimeoutError");
        assert_eq!(engine.polls(), 3);
        assert_eq!(timer.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_backoff_grows_to_cap_and_clips_to_budget() {
        let engine = Arc::new(ScriptedQueryEngine::new().with_states(vec![QueryState::Running]));
        let timer = Arc::new(ManualTimer::new());
        let config = PollConfig {
            initial_interval: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            max_interval: Duration::from_secs(4),
            budget: Duration::from_secs(10),
            max_attempts: 100,
        };

        poller(engine, timer.clone(), config)
            .wait(execution())
            .await
            .unwrap_err();

        let secs: Vec<u64> = timer.sleeps().iter().map(|d| d.as_secs()).collect();
        assert_eq!(secs, vec![1, 2, 4, 3]);
    }

    #[tokio::test]
    async fn test_unbounded_multiplier_jumps_to_cap() {
        let engine = Arc::new(ScriptedQueryEngine::new().with_states(vec![QueryState::Running]));
        let timer = Arc::new(ManualTimer::new());
        let config = PollConfig {
            initial_interval: Duration::from_secs(1),
            backoff_multiplier: f64::INFINITY,
            max_interval: Duration::from_secs(5),
            budget: Duration::from_secs(12),
            max_attempts: 100,
        };

        let err = poller(engine, timer.clone(), config)
            .wait(execution())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), "TimeoutError");
        let secs: Vec<u64> = timer.sleeps().iter().map(|d| d.as_secs()).collect();
        assert_eq!(secs, vec![1, 5, 5, 1]);
    }

    #[test]
    fn test_grow_saturates() {
        let max = Duration::from_secs(5);
        assert_eq!(grow(Duration::from_secs(1), 2.0, max), Duration::from_secs(2));
        assert_eq!(grow(Duration::from_secs(4), 2.0, max), max);
        assert_eq!(grow(Duration::from_secs(1), 1e300, max), max);
        assert_eq!(grow(Duration::from_secs(1), f64::NAN, max), max);
    }

    #[tokio::test]
    async fn test_engine_failure_carries_reason() {
        let engine = Arc::new(
            ScriptedQueryEngine::new()
                .with_states(vec![QueryState::Running, QueryState::Failed])
                .with_reason("line 1:8: mismatched input 'FORM'"),
        );
        let timer = Arc::new(ManualTimer::new());

        let err = poller(engine, timer, poll_config(50, 60))
            .wait(execution())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), "UpstreamError");
        assert!(err.detail().contains("mismatched input"));
    }

    #[tokio::test]
    async fn test_cancelled_execution_is_upstream_error() {
        let engine = Arc::new(ScriptedQueryEngine::new().with_states(vec![QueryState::Cancelled]));
        let timer = Arc::new(ManualTimer::new());

        let err = poller(engine, timer, poll_config(50, 60))
            .wait(execution())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "UpstreamError");
    }
}
