//! Per-operation circuit breaker.
//!
//! ```text
//!   CLOSED --(threshold consecutive failures)--> OPEN
//!   OPEN   --(recovery_timeout elapsed, next call)--> HALF_OPEN (one trial)
//!   HALF_OPEN --success--> CLOSED      HALF_OPEN --failure--> OPEN
//! ```
//!
//! The gate itself never suspends: `try_acquire`/`record_*` are synchronous
//! and only hold a std mutex for a few field updates.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::{CircuitBreakerConfig, duration_secs};
use crate::domain::HiveError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitBreakerStatus {
    pub operation: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub threshold: u32,

    #[serde(with = "duration_secs")]
    pub recovery_timeout: Duration,

    /// Time since the last recorded failure.
    #[serde(skip)]
    pub since_last_failure: Option<Duration>,

    /// Time since the breaker last opened.
    #[serde(skip)]
    pub since_opened: Option<Duration>,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    operation: String,
    threshold: u32,
    recovery_timeout: Duration,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(operation: impl Into<String>, threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            operation: operation.into(),
            threshold: threshold.max(1),
            recovery_timeout,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure: None,
                opened_at: None,
                trial_in_flight: false,
            }),
        }
    }

    pub fn from_config(operation: impl Into<String>, config: &CircuitBreakerConfig) -> Self {
        Self::new(operation, config.threshold, config.recovery_timeout)
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn open_error(&self) -> HiveError {
        HiveError::CircuitBreakerOpen {
            operation: self.operation.clone(),
        }
    }

    /// Admit or reject one call.
    ///
    /// Admitting a call while OPEN (after the cooldown) turns it into the
    /// HALF_OPEN trial; further calls fail fast until the trial settles.
    pub fn try_acquire(&self) -> Result<(), HiveError> {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let cooled = inner
                    .opened_at
                    .is_none_or(|at| at.elapsed() >= self.recovery_timeout);
                if cooled {
                    inner.state = CircuitState::HalfOpen;
                    inner.trial_in_flight = true;
                    info!(operation = %self.operation, "circuit breaker half-open, admitting trial call");
                    Ok(())
                } else {
                    Err(self.open_error())
                }
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    Err(self.open_error())
                } else {
                    inner.trial_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    /// Would `try_acquire` fail fast right now? Never changes state.
    pub fn is_rejecting(&self) -> bool {
        let inner = self.lock();
        match inner.state {
            CircuitState::Closed => false,
            CircuitState::Open => inner
                .opened_at
                .is_some_and(|at| at.elapsed() < self.recovery_timeout),
            CircuitState::HalfOpen => inner.trial_in_flight,
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => inner.failure_count = 0,
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Closed;
                inner.failure_count = 0;
                inner.opened_at = None;
                inner.trial_in_flight = false;
                info!(operation = %self.operation, "circuit breaker closed");
            }
            // A call admitted before the breaker opened; it proves nothing.
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.lock();
        let now = Instant::now();
        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                inner.last_failure = Some(now);
                if inner.failure_count >= self.threshold {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(now);
                    warn!(
                        operation = %self.operation,
                        failures = inner.failure_count,
                        "circuit breaker opened"
                    );
                }
            }
            CircuitState::HalfOpen => {
                inner.failure_count += 1;
                inner.last_failure = Some(now);
                inner.state = CircuitState::Open;
                inner.opened_at = Some(now);
                inner.trial_in_flight = false;
                warn!(operation = %self.operation, "trial call failed, circuit breaker re-opened");
            }
            CircuitState::Open => {}
        }
    }

    /// An admitted call ended without a verdict (cancelled or dropped).
    fn abandon(&self) {
        let mut inner = self.lock();
        if inner.state == CircuitState::HalfOpen {
            inner.trial_in_flight = false;
        }
    }

    /// Run `op` through the gate, recording its result.
    ///
    /// Returns `CircuitBreakerOpen` without invoking `op` when the gate is
    /// shut. `HiveError::Cancelled` is not counted as a failure.
    pub async fn call<T, F, Fut>(&self, op: F) -> Result<T, HiveError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, HiveError>>,
    {
        self.try_acquire()?;
        let mut guard = CallGuard {
            breaker: self,
            settled: false,
        };
        let result = op().await;
        guard.settled = true;
        match &result {
            Ok(_) => self.record_success(),
            Err(HiveError::Cancelled) => self.abandon(),
            Err(_) => self.record_failure(),
        }
        result
    }

    /// Force CLOSED with a zero failure count.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.last_failure = None;
        inner.opened_at = None;
        inner.trial_in_flight = false;
    }

    pub fn get_status(&self) -> CircuitBreakerStatus {
        let inner = self.lock();
        CircuitBreakerStatus {
            operation: self.operation.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            threshold: self.threshold,
            recovery_timeout: self.recovery_timeout,
            since_last_failure: inner.last_failure.map(|at| at.elapsed()),
            since_opened: inner.opened_at.map(|at| at.elapsed()),
        }
    }
}

/// Releases a HALF_OPEN trial slot if the call future is dropped mid-flight.
struct CallGuard<'a> {
    breaker: &'a CircuitBreaker,
    settled: bool,
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.abandon();
        }
    }
}

/// One breaker per operation name, created on first use.
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: Mutex<BTreeMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn get(&self, operation: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().unwrap_or_else(PoisonError::into_inner);
        breakers
            .entry(operation.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::from_config(operation, &self.config)))
            .clone()
    }

    /// Is the breaker for `operation`, if any, currently failing fast?
    pub fn rejects(&self, operation: &str) -> bool {
        let breakers = self.breakers.lock().unwrap_or_else(PoisonError::into_inner);
        breakers.get(operation).is_some_and(|b| b.is_rejecting())
    }

    /// Status of every breaker, sorted by operation name.
    pub fn statuses(&self) -> Vec<CircuitBreakerStatus> {
        let breakers = self.breakers.lock().unwrap_or_else(PoisonError::into_inner);
        breakers.values().map(|b| b.get_status()).collect()
    }

    pub fn reset_all(&self) {
        let breakers = self.breakers.lock().unwrap_or_else(PoisonError::into_inner);
        for breaker in breakers.values() {
            breaker.reset();
        }
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}
