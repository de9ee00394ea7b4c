//! Collection window resolution.
//!
//! A run normally covers the most recent full UTC day. When the instance was
//! launched after that day began, the window starts at launch instead.

use chrono::{DateTime, Duration, TimeZone, Utc};

use crate::config::PipelineConfig;
use crate::models::MetricWindow;
use crate::{PipelineError, Result};

/// Sub-minute resolutions the monitoring source accepts; anything else must be
/// a whole number of minutes.
const HIGH_RESOLUTION_SECONDS: [i64; 4] = [1, 5, 10, 30];

#[derive(Debug, Clone, Copy)]
pub struct TimeWindowResolver {
    period: Duration,
    max_retention: Duration,
}

impl TimeWindowResolver {
    pub fn new(period_seconds: i64, max_retention_days: i64) -> Result<Self> {
        if period_seconds <= 0 {
            return Err(PipelineError::Configuration(format!(
                "period must be positive, got {}s",
                period_seconds
            )));
        }
        if period_seconds % 60 != 0 && !HIGH_RESOLUTION_SECONDS.contains(&period_seconds) {
            return Err(PipelineError::Configuration(format!(
                "period {}s is not a supported monitoring resolution",
                period_seconds
            )));
        }
        if max_retention_days <= 0 {
            return Err(PipelineError::Configuration(
                "max retention must be at least one day".into(),
            ));
        }
        Ok(Self {
            period: Duration::seconds(period_seconds),
            max_retention: Duration::days(max_retention_days),
        })
    }

    pub fn from_config(config: &PipelineConfig) -> Result<Self> {
        Self::new(config.period_seconds, config.max_retention_days)
    }

    /// Window for a run happening at `now`.
    ///
    /// A first-run window starts after the previous midnight, so it is never
    /// more than two days old; the retention floor only binds for a
    /// one-day retention.
    pub fn resolve(&self, now: DateTime<Utc>, launch: Option<DateTime<Utc>>) -> Result<MetricWindow> {
        let today = Utc.from_utc_datetime(&now.date_naive().and_hms_opt(0, 0, 0).ok_or_else(
            || PipelineError::Configuration(format!("cannot take midnight of {}", now)),
        )?);
        let day_start = today - Duration::days(1);

        match launch {
            Some(launch) if launch > now => Err(PipelineError::Configuration(format!(
                "launch time {} is after the current time {}",
                launch, now
            ))),
            Some(launch) if launch > day_start => {
                let end = if launch < today {
                    today
                } else {
                    self.align_down(now)?
                };
                let floor = self.align_up(now - self.max_retention)?;
                let start = self.align_up(launch)?.max(floor);
                MetricWindow::new(start, end, self.period).map_err(|e| {
                    PipelineError::Configuration(format!(
                        "no complete period since launch at {}: {}",
                        launch,
                        e.detail()
                    ))
                })
            }
            _ => MetricWindow::new(day_start, today, self.period),
        }
    }

    fn align_down(&self, ts: DateTime<Utc>) -> Result<DateTime<Utc>> {
        let secs = ts.timestamp();
        from_epoch(secs - secs.rem_euclid(self.period.num_seconds()))
    }

    fn align_up(&self, ts: DateTime<Utc>) -> Result<DateTime<Utc>> {
        let period = self.period.num_seconds();
        let secs = ts.timestamp();
        let rem = secs.rem_euclid(period);
        // sub-second parts count as past the boundary
        if rem == 0 && ts.timestamp_subsec_nanos() == 0 {
            from_epoch(secs)
        } else {
            from_epoch(secs - rem + period)
        }
    }
}

fn from_epoch(secs: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_opt(secs, 0)
        .single()
        .ok_or_else(|| PipelineError::Configuration(format!("timestamp {} out of range", secs)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn ts(d: u32, h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 8, d, h, m, s).unwrap()
    }

    #[test]
    fn test_most_recent_full_day() {
        let resolver = TimeWindowResolver::new(300, 15).unwrap();
        let window = resolver.resolve(ts(27, 15, 42, 10), None).unwrap();

        assert_eq!(window.start, ts(26, 0, 0, 0));
        assert_eq!(window.end, ts(27, 0, 0, 0));
        assert_eq!(window.bucket_count(), 288);
    }

    #[test]
    fn test_same_day_reinvocation_is_stable() {
        let resolver = TimeWindowResolver::new(60, 15).unwrap();
        let early = resolver.resolve(ts(27, 0, 0, 1), None).unwrap();
        let late = resolver.resolve(ts(27, 23, 59, 59), None).unwrap();
        assert_eq!(early, late);
    }

    #[test]
    fn test_old_launch_uses_full_day() {
        let resolver = TimeWindowResolver::new(300, 15).unwrap();
        let window = resolver
            .resolve(ts(27, 8, 0, 0), Some(ts(1, 12, 0, 0)))
            .unwrap();
        assert_eq!(window.start, ts(26, 0, 0, 0));
        assert_eq!(window.end, ts(27, 0, 0, 0));
    }

    #[test]
    fn test_launch_during_previous_day() {
        let resolver = TimeWindowResolver::new(300, 15).unwrap();
        let window = resolver
            .resolve(ts(27, 8, 0, 0), Some(ts(26, 9, 31, 12)))
            .unwrap();
        assert_eq!(window.start, ts(26, 9, 35, 0));
        assert_eq!(window.end, ts(27, 0, 0, 0));
    }

    #[test]
    fn test_short_retention_clamps_first_run_start() {
        let resolver = TimeWindowResolver::new(300, 1).unwrap();
        let window = resolver
            .resolve(ts(27, 23, 0, 0), Some(ts(26, 1, 0, 0)))
            .unwrap();
        assert_eq!(window.start, ts(26, 23, 0, 0));
        assert_eq!(window.end, ts(27, 0, 0, 0));
        assert_eq!(window.bucket_count(), 12);

        // same launch, default retention: starts at launch
        let resolver = TimeWindowResolver::new(300, 15).unwrap();
        let window = resolver
            .resolve(ts(27, 23, 0, 0), Some(ts(26, 1, 0, 0)))
            .unwrap();
        assert_eq!(window.start, ts(26, 1, 0, 0));
    }

    #[test]
    fn test_launch_today_runs_until_now() {
        let resolver = TimeWindowResolver::new(300, 15).unwrap();
        let window = resolver
            .resolve(ts(27, 15, 42, 10), Some(ts(27, 9, 30, 0)))
            .unwrap();
        assert_eq!(window.start, ts(27, 9, 30, 0));
        assert_eq!(window.end, ts(27, 15, 40, 0));
    }

    #[test]
    fn test_launch_too_recent_for_one_period() {
        let resolver = TimeWindowResolver::new(300, 15).unwrap();
        let err = resolver
            .resolve(ts(27, 15, 42, 10), Some(ts(27, 15, 38, 0)))
            .unwrap_err();
        assert_eq!(err.kind(), "ConfigurationError");
    }

    #[test]
    fn test_launch_in_future_is_rejected() {
        let resolver = TimeWindowResolver::new(300, 15).unwrap();
        let err = resolver
            .resolve(ts(27, 15, 0, 0), Some(ts(27, 16, 0, 0)))
            .unwrap_err();
        assert_eq!(err.kind(), "ConfigurationError");
    }

    #[test]
    fn test_invalid_periods() {
        for period in [0, -60, 7, 90] {
            let err = TimeWindowResolver::new(period, 15).unwrap_err();
            assert_eq!(err.kind(), "ConfigurationError", "period {}", period);
        }
        // supported, but does not divide a day
        let resolver = TimeWindowResolver::new(420, 15).unwrap();
        assert!(resolver.resolve(ts(27, 1, 0, 0), None).is_err());
        // longer than the day
        let resolver = TimeWindowResolver::new(2 * 86_400, 15).unwrap();
        assert!(resolver.resolve(ts(27, 1, 0, 0), None).is_err());
    }
}
