//! Bounded exponential backoff.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::circuit_breaker::CircuitBreaker;
use crate::config::RetryConfig;
use crate::domain::HiveError;

/// Decides whether an error is worth another attempt.
pub type RetryPredicate = Arc<dyn Fn(&HiveError) -> bool + Send + Sync>;

#[derive(Clone)]
pub struct RetryPolicy {
    /// Attempts including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub exponential_base: f64,
    pub jitter: bool,
    retryable: RetryPredicate,
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("base_delay", &self.base_delay)
            .field("max_delay", &self.max_delay)
            .field("exponential_base", &self.exponential_base)
            .field("jitter", &self.jitter)
            .finish_non_exhaustive()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: config.base_delay,
            max_delay: config.max_delay,
            exponential_base: config.exponential_base,
            jitter: config.jitter,
            retryable: Arc::new(HiveError::is_transient),
        }
    }

    /// Replace the default predicate (transient errors only).
    pub fn with_retryable<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&HiveError) -> bool + Send + Sync + 'static,
    {
        self.retryable = Arc::new(predicate);
        self
    }

    pub fn is_retryable(&self, error: &HiveError) -> bool {
        !matches!(
            error,
            HiveError::CircuitBreakerOpen { .. } | HiveError::Cancelled
        ) && (self.retryable)(error)
    }

    /// `min(base_delay * exponential_base^(attempt-1), max_delay)`, without
    /// jitter. `attempt` is 1-based; 0 is treated as 1.
    ///
    /// With base=0.5s, base 2.0, max 30s:
    /// - attempt 1: 0.5s
    /// - attempt 2: 1s
    /// - attempt 3: 2s
    /// - attempt 8: 30s (capped)
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let secs = self.base_delay.as_secs_f64() * self.exponential_base.powi(exponent);
        Duration::try_from_secs_f64(secs)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// `calculate_delay` scaled by a uniform factor in [0.5, 1.0] when
    /// jitter is on, so the `max_delay` bound still holds.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let delay = self.calculate_delay(attempt);
        if self.jitter {
            let factor = rand::thread_rng().gen_range(0.5..=1.0);
            delay.mul_f64(factor)
        } else {
            delay
        }
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempts are used up; the last error is returned.
    ///
    /// Each attempt goes through `breaker` when one is given, so every
    /// attempt counts toward its threshold. A backoff that would end past
    /// `deadline` stops the loop early.
    pub async fn run<T, F, Fut>(
        &self,
        operation: &str,
        deadline: Option<Instant>,
        breaker: Option<&CircuitBreaker>,
        mut op: F,
    ) -> Result<T, HiveError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, HiveError>>,
    {
        let mut attempt = 1;
        loop {
            let result = match breaker {
                Some(breaker) => breaker.call(|| op(attempt)).await,
                None => op(attempt).await,
            };
            let error = match result {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            if attempt >= self.max_attempts || !self.is_retryable(&error) {
                return Err(error);
            }

            let delay = self.backoff(attempt);
            if deadline.is_some_and(|d| Instant::now() + delay >= d) {
                debug!(operation, attempt, "backoff would overrun deadline, giving up");
                return Err(error);
            }

            warn!(
                operation,
                attempt,
                max_attempts = self.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "attempt failed, retrying"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}
