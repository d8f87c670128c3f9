//! Runtime configuration.
//!
//! Loaded from TOML; every field has a default so an empty file is valid.
//! Durations are written as (fractional) seconds:
//!
//! ```toml
//! max_concurrent_workers = 4
//! heartbeat_window = 15.0
//! poll_interval = 0.5
//!
//! [circuit_breaker]
//! threshold = 5
//! recovery_timeout = 30.0
//!
//! [retry]
//! max_attempts = 3
//! base_delay = 0.5
//!
//! [timeouts]
//! default_timeout = 300.0
//! adaptive = true
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::HiveError;

/// (De)serialize a `Duration` as fractional seconds.
pub mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer, de::Error};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(D::Error::custom)
    }
}

/// Same as [`duration_secs`] for optional fields.
pub mod option_duration_secs {
    use serde::{Deserialize, Deserializer, Serializer, de::Error};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&d.as_secs_f64()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<f64>::deserialize(deserializer)?
            .map(|secs| Duration::try_from_secs_f64(secs).map_err(D::Error::custom))
            .transpose()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the breaker.
    pub threshold: u32,

    #[serde(with = "duration_secs")]
    pub recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            threshold: 5,
            recovery_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts per execution, including the first.
    pub max_attempts: u32,

    #[serde(with = "duration_secs")]
    pub base_delay: Duration,

    #[serde(with = "duration_secs")]
    pub max_delay: Duration,

    pub exponential_base: f64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            exponential_base: 2.0,
            jitter: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    #[serde(with = "duration_secs")]
    pub default_timeout: Duration,

    #[serde(with = "duration_secs")]
    pub min_timeout: Duration,

    #[serde(with = "duration_secs")]
    pub max_timeout: Duration,

    pub adaptive: bool,

    /// Multiplier applied to the observed p95.
    pub safety_factor: f64,

    /// Completions between two re-evaluations of an operation's timeout.
    pub adjustment_window: u32,

    /// Recent durations kept per operation.
    pub history_size: usize,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(300),
            min_timeout: Duration::from_secs(1),
            max_timeout: Duration::from_secs(3600),
            adaptive: true,
            safety_factor: 1.5,
            adjustment_window: 10,
            history_size: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HiveConfig {
    /// Worker slots; caps concurrently ASSIGNED/RUNNING tasks.
    pub max_concurrent_workers: usize,

    /// A worker silent for longer than this is presumed dead.
    #[serde(with = "duration_secs")]
    pub heartbeat_window: Duration,

    #[serde(with = "duration_secs")]
    pub heartbeat_interval: Duration,

    #[serde(with = "duration_secs")]
    pub poll_interval: Duration,

    /// Upper bound of the random delay added to each poll.
    #[serde(with = "duration_secs")]
    pub poll_jitter: Duration,

    pub max_attempts_per_task: u32,

    /// Parent of every per-run working directory.
    pub work_root: PathBuf,

    pub keep_workdirs: bool,

    pub circuit_breaker: CircuitBreakerConfig,
    pub retry: RetryConfig,
    pub timeouts: TimeoutConfig,
}

impl Default for HiveConfig {
    fn default() -> Self {
        Self {
            max_concurrent_workers: 4,
            heartbeat_window: Duration::from_secs(15),
            heartbeat_interval: Duration::from_secs(3),
            poll_interval: Duration::from_millis(500),
            poll_jitter: Duration::from_millis(100),
            max_attempts_per_task: 3,
            work_root: std::env::temp_dir().join("hive-work"),
            keep_workdirs: false,
            circuit_breaker: CircuitBreakerConfig::default(),
            retry: RetryConfig::default(),
            timeouts: TimeoutConfig::default(),
        }
    }
}

impl HiveConfig {
    /// Parse, apply `HIVE_*` overrides, validate.
    pub fn from_toml(toml_str: &str) -> Result<Self, HiveError> {
        let mut config: Self =
            toml::from_str(toml_str).map_err(|e| HiveError::Config(e.to_string()))?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, HiveError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    /// `HIVE_MAX_CONCURRENT_WORKERS` and `HIVE_WORK_ROOT` override the file.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("HIVE_MAX_CONCURRENT_WORKERS") {
            if let Ok(n) = v.parse::<usize>() {
                self.max_concurrent_workers = n;
            }
        }
        if let Ok(v) = std::env::var("HIVE_WORK_ROOT") {
            self.work_root = PathBuf::from(v);
        }
    }

    pub fn validate(&self) -> Result<(), HiveError> {
        let fail = |msg: &str| Err(HiveError::Config(msg.to_string()));

        if self.max_concurrent_workers == 0 {
            return fail("max_concurrent_workers must be at least 1");
        }
        if self.max_attempts_per_task == 0 {
            return fail("max_attempts_per_task must be at least 1");
        }
        if self.poll_interval.is_zero() {
            return fail("poll_interval must be positive");
        }
        if self.heartbeat_interval.is_zero() {
            return fail("heartbeat_interval must be positive");
        }
        if self.heartbeat_interval >= self.heartbeat_window {
            return fail("heartbeat_interval must be shorter than heartbeat_window");
        }
        if self.circuit_breaker.threshold == 0 {
            return fail("circuit_breaker.threshold must be at least 1");
        }
        if self.retry.max_attempts == 0 {
            return fail("retry.max_attempts must be at least 1");
        }
        if !(self.retry.exponential_base.is_finite() && self.retry.exponential_base >= 1.0) {
            return fail("retry.exponential_base must be a finite number >= 1.0");
        }
        if self.retry.base_delay > self.retry.max_delay {
            return fail("retry.base_delay must not exceed retry.max_delay");
        }
        let t = &self.timeouts;
        if t.min_timeout.is_zero() {
            return fail("timeouts.min_timeout must be positive");
        }
        if t.min_timeout > t.max_timeout {
            return fail("timeouts.min_timeout must not exceed timeouts.max_timeout");
        }
        if t.default_timeout < t.min_timeout || t.default_timeout > t.max_timeout {
            return fail("timeouts.default_timeout must lie within [min_timeout, max_timeout]");
        }
        if !(t.safety_factor.is_finite() && t.safety_factor >= 1.0) {
            return fail("timeouts.safety_factor must be a finite number >= 1.0");
        }
        if t.adjustment_window == 0 || t.history_size == 0 {
            return fail("timeouts.adjustment_window and history_size must be at least 1");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn empty_file_yields_defaults() {
        let config = HiveConfig::from_toml("").unwrap();
        assert_eq!(config.circuit_breaker, CircuitBreakerConfig::default());
        assert_eq!(config.max_attempts_per_task, 3);
    }

    #[test]
    fn durations_parse_from_seconds() {
        let config = HiveConfig::from_toml(
            r#"
            poll_interval = 0.25
            heartbeat_window = 10

            [circuit_breaker]
            recovery_timeout = 1.5

            [timeouts]
            default_timeout = 2
            min_timeout = 0.5
            "#,
        )
        .unwrap();
        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert_eq!(config.heartbeat_window, Duration::from_secs(10));
        assert_eq!(
            config.circuit_breaker.recovery_timeout,
            Duration::from_millis(1500)
        );
        assert_eq!(config.timeouts.min_timeout, Duration::from_millis(500));
    }

    #[test]
    fn rejects_inverted_timeout_bounds() {
        let err = HiveConfig::from_toml(
            r#"
            [timeouts]
            min_timeout = 20
            max_timeout = 10
            default_timeout = 15
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, HiveError::Config(_)));
    }

    #[test]
    fn rejects_negative_durations() {
        let err = HiveConfig::from_toml("poll_interval = -1.0").unwrap_err();
        assert!(matches!(err, HiveError::Config(_)));
    }

    #[test]
    fn rejects_zero_attempts() {
        let config = HiveConfig {
            max_attempts_per_task: 0,
            ..HiveConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[rstest]
    #[case(f64::NAN)]
    #[case(f64::INFINITY)]
    #[case(0.5)]
    fn rejects_unusable_growth_factors(#[case] factor: f64) {
        let mut config = HiveConfig::default();
        config.retry.exponential_base = factor;
        assert!(matches!(config.validate(), Err(HiveError::Config(_))));

        let mut config = HiveConfig::default();
        config.timeouts.safety_factor = factor;
        assert!(matches!(config.validate(), Err(HiveError::Config(_))));
    }
}
