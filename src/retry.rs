use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::config::PipelineConfig;
use crate::{PipelineError, Result};

/// Bounded retry with doubling delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    /// Transient upstream failures: configured attempt count.
    pub fn upstream(config: &PipelineConfig) -> Self {
        Self {
            max_attempts: config.upstream_max_attempts.max(1),
            base_delay: config.retry_base_delay,
        }
    }

    /// Storage failures: one retry.
    pub fn storage(config: &PipelineConfig) -> Self {
        Self {
            max_attempts: 2,
            base_delay: config.retry_base_delay,
        }
    }

    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
        }
    }

    /// Runs `op` until it succeeds, fails with a non-retryable error, or the
    /// attempts run out. The last error is returned as is.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if attempt < self.max_attempts && is_retryable(&err) => {
                    let delay = self.base_delay.saturating_mul(1u32 << (attempt - 1).min(16));
                    warn!(
                        operation = %operation,
                        attempt,
                        max_attempts = self.max_attempts,
                        error = %err,
                        "retrying after failure"
                    );
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

fn is_retryable(err: &PipelineError) -> bool {
    err.is_transient() || matches!(err, PipelineError::Storage(_))
}
