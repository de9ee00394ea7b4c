//! Pipeline configuration.
//!
//! Every component receives this value explicitly; nothing reads the
//! environment after startup.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::{PipelineError, Result};

/// Largest accepted poll interval growth factor.
pub const MAX_BACKOFF_MULTIPLIER: f64 = 10.0;

/// Poll loop limits for the query pipeline.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PollConfig {
    /// Delay before the second state check
    #[serde(default = "default_poll_interval")]
    pub initial_interval: Duration,

    /// Growth factor applied to the interval after every check (1.0 = fixed)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Upper bound for the grown interval
    #[serde(default = "default_max_poll_interval")]
    pub max_interval: Duration,

    /// Total elapsed time allowed for polling
    #[serde(default = "default_poll_budget")]
    pub budget: Duration,

    /// Total number of state checks allowed
    #[serde(default = "default_poll_attempts")]
    pub max_attempts: u32,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            initial_interval: default_poll_interval(),
            backoff_multiplier: default_backoff_multiplier(),
            max_interval: default_max_poll_interval(),
            budget: default_poll_budget(),
            max_attempts: default_poll_attempts(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PipelineConfig {
    /// Storage namespace; the local store lives at `data_dir/bucket`
    pub bucket: String,

    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Monitored instance
    pub instance_id: String,

    #[serde(default = "default_period_seconds")]
    pub period_seconds: i64,

    /// Known launch time, used to shorten the very first collection window
    #[serde(default)]
    pub launch_time: Option<DateTime<Utc>>,

    #[serde(default = "default_max_retention_days")]
    pub max_retention_days: i64,

    #[serde(default = "default_metrics_prefix")]
    pub metrics_prefix: String,

    /// Dataset namespace queries run against
    #[serde(default = "default_database")]
    pub database: String,

    #[serde(default = "default_table")]
    pub table: String,

    /// Engine staging prefix; the latest result is kept beside it
    #[serde(default = "default_output_location")]
    pub output_location: String,

    #[serde(default)]
    pub poll: PollConfig,

    /// Hard deadline of one query invocation
    #[serde(default = "default_execution_deadline")]
    pub execution_deadline: Duration,

    #[serde(default = "default_preview_rows")]
    pub preview_rows: usize,

    #[serde(default = "default_upstream_attempts")]
    pub upstream_max_attempts: u32,

    #[serde(default = "default_retry_base_delay")]
    pub retry_base_delay: Duration,

    #[serde(default)]
    pub monitoring_endpoint: Option<String>,

    #[serde(default = "default_port")]
    pub port: u16,
}

impl PipelineConfig {
    /// Configuration with defaults for everything but the two required values.
    pub fn new(bucket: impl Into<String>, instance_id: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            data_dir: default_data_dir(),
            instance_id: instance_id.into(),
            period_seconds: default_period_seconds(),
            launch_time: None,
            max_retention_days: default_max_retention_days(),
            metrics_prefix: default_metrics_prefix(),
            database: default_database(),
            table: default_table(),
            output_location: default_output_location(),
            poll: PollConfig::default(),
            execution_deadline: default_execution_deadline(),
            preview_rows: default_preview_rows(),
            upstream_max_attempts: default_upstream_attempts(),
            retry_base_delay: default_retry_base_delay(),
            monitoring_endpoint: None,
            port: default_port(),
        }
    }

    /// Load from process environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load from an arbitrary variable lookup and validate.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |name: &str| {
            lookup(name)
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| PipelineError::Configuration(format!("{} must be set", name)))
        };

        let mut config = Self::new(required("BUCKET_NAME")?, required("INSTANCE_ID")?);

        if let Some(dir) = lookup("DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        config.period_seconds = parse_var(&lookup, "PERIOD_SECONDS", config.period_seconds)?;
        config.launch_time = match lookup("INSTANCE_LAUNCH_TIME") {
            Some(raw) => Some(
                DateTime::parse_from_rfc3339(raw.trim())
                    .map_err(|e| {
                        PipelineError::Configuration(format!(
                            "INSTANCE_LAUNCH_TIME is not RFC 3339: {}",
                            e
                        ))
                    })?
                    .with_timezone(&Utc),
            ),
            None => None,
        };
        config.max_retention_days =
            parse_var(&lookup, "MAX_RETENTION_DAYS", config.max_retention_days)?;
        if let Some(prefix) = lookup("METRICS_PREFIX") {
            config.metrics_prefix = prefix;
        }
        if let Some(database) = lookup("QUERY_DATABASE") {
            config.database = database;
        }
        if let Some(table) = lookup("QUERY_TABLE") {
            config.table = table;
        }
        if let Some(output) = lookup("QUERY_OUTPUT_LOCATION") {
            config.output_location = output;
        }

        config.poll.initial_interval = Duration::from_millis(parse_var(
            &lookup,
            "POLL_INTERVAL_MS",
            config.poll.initial_interval.as_millis() as u64,
        )?);
        config.poll.backoff_multiplier =
            parse_var(&lookup, "POLL_BACKOFF_MULTIPLIER", config.poll.backoff_multiplier)?;
        config.poll.max_interval = Duration::from_millis(parse_var(
            &lookup,
            "POLL_MAX_INTERVAL_MS",
            config.poll.max_interval.as_millis() as u64,
        )?);
        config.poll.budget = Duration::from_secs(parse_var(
            &lookup,
            "POLL_BUDGET_SECONDS",
            config.poll.budget.as_secs(),
        )?);
        config.poll.max_attempts =
            parse_var(&lookup, "POLL_MAX_ATTEMPTS", config.poll.max_attempts)?;
        config.execution_deadline = Duration::from_secs(parse_var(
            &lookup,
            "EXECUTION_DEADLINE_SECONDS",
            config.execution_deadline.as_secs(),
        )?);
        config.preview_rows = parse_var(&lookup, "PREVIEW_ROWS", config.preview_rows)?;
        config.upstream_max_attempts =
            parse_var(&lookup, "UPSTREAM_MAX_ATTEMPTS", config.upstream_max_attempts)?;
        config.retry_base_delay = Duration::from_millis(parse_var(
            &lookup,
            "RETRY_BASE_DELAY_MS",
            config.retry_base_delay.as_millis() as u64,
        )?);
        config.monitoring_endpoint = lookup("MONITORING_ENDPOINT").filter(|v| !v.is_empty());
        config.port = parse_var(&lookup, "PORT", config.port)?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.bucket.trim().is_empty() || self.instance_id.trim().is_empty() {
            return Err(PipelineError::Configuration(
                "bucket and instance id must be non-empty".into(),
            ));
        }
        if self.period_seconds <= 0 {
            return Err(PipelineError::Configuration(format!(
                "period must be positive, got {}s",
                self.period_seconds
            )));
        }
        if self.max_retention_days <= 0 {
            return Err(PipelineError::Configuration(
                "max retention must be at least one day".into(),
            ));
        }
        if self.poll.max_attempts == 0 {
            return Err(PipelineError::Configuration(
                "poll attempt cap must be at least 1".into(),
            ));
        }
        let multiplier = self.poll.backoff_multiplier;
        if !(1.0..=MAX_BACKOFF_MULTIPLIER).contains(&multiplier) {
            return Err(PipelineError::Configuration(format!(
                "poll backoff multiplier must be between 1.0 and {}, got {}",
                MAX_BACKOFF_MULTIPLIER, multiplier
            )));
        }
        if self.poll.budget >= self.execution_deadline {
            return Err(PipelineError::Configuration(format!(
                "poll budget {:?} must be shorter than the execution deadline {:?}",
                self.poll.budget, self.execution_deadline
            )));
        }
        if self.preview_rows == 0 {
            return Err(PipelineError::Configuration(
                "preview row count must be at least 1".into(),
            ));
        }
        if self.upstream_max_attempts == 0 {
            return Err(PipelineError::Configuration(
                "upstream attempt count must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Query used when a request carries no query at all.
    pub fn default_query(&self) -> String {
        format!("SELECT * FROM {}.{} LIMIT 20", self.database, self.table)
    }

    /// Fixed key holding the most recent query result.
    pub fn latest_result_key(&self) -> String {
        format!("{}/latest.csv", self.output_location.trim_end_matches('/'))
    }

    pub fn storage_root(&self) -> PathBuf {
        self.data_dir.join(&self.bucket)
    }
}

fn parse_var<F, T>(lookup: &F, name: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        Some(raw) => raw.trim().parse().map_err(|e| {
            PipelineError::Configuration(format!("{} has invalid value {:?}: {}", name, raw, e))
        }),
        None => Ok(default),
    }
}

// Default value functions
fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_period_seconds() -> i64 {
    300
}

fn default_max_retention_days() -> i64 {
    15
}

fn default_metrics_prefix() -> String {
    "ec2-metrics".to_string()
}

fn default_database() -> String {
    "cpu_metrics".to_string()
}

fn default_table() -> String {
    "ec2_metrics_typed".to_string()
}

fn default_output_location() -> String {
    "athena-query-results".to_string()
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_backoff_multiplier() -> f64 {
    1.0
}

fn default_max_poll_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_poll_budget() -> Duration {
    Duration::from_secs(50)
}

fn default_poll_attempts() -> u32 {
    60
}

fn default_execution_deadline() -> Duration {
    Duration::from_secs(60)
}

fn default_preview_rows() -> usize {
    10
}

fn default_upstream_attempts() -> u32 {
    3
}

fn default_retry_base_delay() -> Duration {
    Duration::from_millis(200)
}

fn default_port() -> u16 {
    8080
}
