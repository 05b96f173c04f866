//! Polling and session flow configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Backoff schedule for [`JobStatusPoller`](crate::poller::JobStatusPoller).
///
/// `max_attempts = 0` leaves the job's lifecycle entirely to the server; any
/// positive value is a client-side safety cap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollingConfig {
    /// Delay before the second request.
    #[serde(default = "default_initial_delay", with = "humantime_serde")]
    pub initial_delay: Duration,

    /// Upper bound for any delay.
    #[serde(default = "default_max_delay", with = "humantime_serde")]
    pub max_delay: Duration,

    /// Growth factor applied per attempt.
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,

    /// Attempts before giving up, 0 for unlimited.
    #[serde(default)]
    pub max_attempts: u32,
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(10)
}

fn default_backoff_factor() -> f64 {
    2.0
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            backoff_factor: default_backoff_factor(),
            max_attempts: 0,
        }
    }
}

impl PollingConfig {
    #[must_use]
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    #[must_use]
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    #[must_use]
    pub fn with_backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = factor;
        self
    }

    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Delay before attempt `n + 1`: `min(initial_delay * backoff_factor^n, max_delay)`.
    ///
    /// Factors below 1 are treated as 1 so the schedule never shrinks.
    pub fn delay(&self, n: u32) -> Duration {
        if n == 0 {
            return self.initial_delay.min(self.max_delay);
        }
        let factor = if self.backoff_factor.is_finite() {
            self.backoff_factor.max(1.0)
        } else {
            1.0
        };
        let exponent = i32::try_from(n).unwrap_or(i32::MAX);
        let secs = self.initial_delay.as_secs_f64() * factor.powi(exponent);

        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    /// Reject schedules that cannot behave as documented.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.initial_delay.is_zero() {
            return Err(ConfigError::Invalid(
                "initialDelay must be greater than zero".to_string(),
            ));
        }
        if self.max_delay < self.initial_delay {
            return Err(ConfigError::Invalid(
                "maxDelay must not be shorter than initialDelay".to_string(),
            ));
        }
        if !self.backoff_factor.is_finite() || self.backoff_factor < 1.0 {
            return Err(ConfigError::Invalid(format!(
                "backoffFactor must be at least 1, got {}",
                self.backoff_factor
            )));
        }
        Ok(())
    }
}

/// Deadline and check interval for
/// [`BoundedWaitPoller`](crate::poller::BoundedWaitPoller).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoundedWaitConfig {
    #[serde(default = "default_max_wait", with = "humantime_serde")]
    pub max_wait: Duration,

    #[serde(default = "default_wait_interval", with = "humantime_serde")]
    pub interval: Duration,
}

fn default_max_wait() -> Duration {
    Duration::from_millis(5000)
}

fn default_wait_interval() -> Duration {
    Duration::from_millis(1000)
}

impl Default for BoundedWaitConfig {
    fn default() -> Self {
        Self {
            max_wait: default_max_wait(),
            interval: default_wait_interval(),
        }
    }
}

/// Check interval for [`AggregateJobPoller`](crate::poller::AggregateJobPoller).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateConfig {
    #[serde(default = "default_aggregate_interval", with = "humantime_serde")]
    pub interval: Duration,
}

fn default_aggregate_interval() -> Duration {
    Duration::from_secs(2)
}

impl Default for AggregateConfig {
    fn default() -> Self {
        Self {
            interval: default_aggregate_interval(),
        }
    }
}

/// Configuration for a [`SessionFlowController`](crate::flow::SessionFlowController)
/// and the pollers it owns.
///
/// Every section is optional in TOML:
///
/// ```toml
/// maxResultHandoffs = 2
///
/// [job]
/// initialDelay = "500ms"
/// maxDelay = "8s"
///
/// [boundedWait]
/// maxWait = "5s"
/// interval = "1s"
///
/// [aggregate]
/// interval = "2s"
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowConfig {
    #[serde(default)]
    pub job: PollingConfig,

    #[serde(default)]
    pub bounded_wait: BoundedWaitConfig,

    #[serde(default)]
    pub aggregate: AggregateConfig,

    /// How many times a result fetch may hand off to a generation job.
    #[serde(default = "default_max_result_handoffs")]
    pub max_result_handoffs: u32,
}

fn default_max_result_handoffs() -> u32 {
    3
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            job: PollingConfig::default(),
            bounded_wait: BoundedWaitConfig::default(),
            aggregate: AggregateConfig::default(),
            max_result_handoffs: default_max_result_handoffs(),
        }
    }
}

impl FlowConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: FlowConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&contents)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.job.validate()?;
        if self.bounded_wait.interval.is_zero() {
            return Err(ConfigError::Invalid(
                "boundedWait.interval must be greater than zero".to_string(),
            ));
        }
        if self.aggregate.interval.is_zero() {
            return Err(ConfigError::Invalid(
                "aggregate.interval must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn config(initial_ms: u64, max_ms: u64, factor: f64) -> PollingConfig {
        PollingConfig::default()
            .with_initial_delay(Duration::from_millis(initial_ms))
            .with_max_delay(Duration::from_millis(max_ms))
            .with_backoff_factor(factor)
    }

    #[test]
    fn delay_grows_geometrically_until_capped() {
        let config = config(100, 1000, 2.0);
        assert_eq!(config.delay(0), Duration::from_millis(100));
        assert_eq!(config.delay(1), Duration::from_millis(200));
        assert_eq!(config.delay(2), Duration::from_millis(400));
        assert_eq!(config.delay(3), Duration::from_millis(800));
        assert_eq!(config.delay(4), Duration::from_millis(1000));
        assert_eq!(config.delay(50), Duration::from_millis(1000));
    }

    #[test]
    fn delay_is_non_decreasing_and_bounded() {
        for factor in [1.0, 1.5, 2.0, 3.7] {
            let config = config(250, 7000, factor);
            let mut previous = Duration::ZERO;
            for n in 0..200 {
                let delay = config.delay(n);
                assert!(delay >= previous, "factor {factor}, n {n}");
                assert!(delay <= config.max_delay, "factor {factor}, n {n}");
                previous = delay;
            }
        }
    }

    #[test]
    fn delay_survives_huge_exponents() {
        let config = config(1000, 30_000, 10.0);
        assert_eq!(config.delay(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn delay_treats_shrinking_factor_as_constant() {
        let config = config(500, 5000, 0.5);
        assert_eq!(config.delay(0), Duration::from_millis(500));
        assert_eq!(config.delay(5), Duration::from_millis(500));
    }

    #[test]
    fn validate_rejects_bad_schedules() {
        assert!(config(0, 1000, 2.0).validate().is_err());
        assert!(config(2000, 1000, 2.0).validate().is_err());
        assert!(config(100, 1000, 0.9).validate().is_err());
        assert!(config(100, 1000, f64::NAN).validate().is_err());
        assert!(config(100, 1000, 1.0).validate().is_ok());
    }

    #[test]
    fn flow_config_defaults() {
        let config = FlowConfig::default();
        assert_eq!(config.job.initial_delay, Duration::from_secs(1));
        assert_eq!(config.job.max_delay, Duration::from_secs(10));
        assert_eq!(config.job.max_attempts, 0);
        assert_eq!(config.bounded_wait.max_wait, Duration::from_millis(5000));
        assert_eq!(config.bounded_wait.interval, Duration::from_millis(1000));
        assert_eq!(config.aggregate.interval, Duration::from_secs(2));
        assert_eq!(config.max_result_handoffs, 3);
    }

    #[test]
    fn flow_config_parses_partial_toml() {
        let config = FlowConfig::from_toml_str(
            r#"
            maxResultHandoffs = 1

            [job]
            initialDelay = "250ms"
            maxAttempts = 12

            [boundedWait]
            maxWait = "3s"
            "#,
        )
        .unwrap();

        assert_eq!(config.job.initial_delay, Duration::from_millis(250));
        assert_eq!(config.job.max_delay, Duration::from_secs(10));
        assert_eq!(config.job.max_attempts, 12);
        assert_eq!(config.bounded_wait.max_wait, Duration::from_secs(3));
        assert_eq!(config.bounded_wait.interval, Duration::from_secs(1));
        assert_eq!(config.max_result_handoffs, 1);
    }

    #[test]
    fn flow_config_empty_document_is_default() {
        assert_eq!(FlowConfig::from_toml_str("").unwrap(), FlowConfig::default());
    }

    #[test]
    fn flow_config_rejects_zero_interval() {
        let err = FlowConfig::from_toml_str("[aggregate]\ninterval = \"0s\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn flow_config_load_reads_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[aggregate]\ninterval = \"750ms\"").unwrap();

        let config = FlowConfig::load(file.path()).unwrap();
        assert_eq!(config.aggregate.interval, Duration::from_millis(750));
    }

    #[test]
    fn flow_config_load_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = FlowConfig::load(dir.path().join("missing.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
