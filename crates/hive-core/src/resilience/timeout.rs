//! Adaptive per-operation timeouts.
//!
//! Each named operation keeps rolling statistics. With adaptation enabled,
//! every `adjustment_window` completions the recommended timeout moves
//! halfway toward `p95 * safety_factor`, clamped to `[min, max]`.
//! Timed-out calls enter the window at the timeout value, which is a lower
//! bound of their real duration, so repeated timeouts push the
//! recommendation up.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::{TimeoutConfig, duration_secs};
use crate::domain::HiveError;

/// Snapshot of one operation's statistics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperationMetrics {
    pub operation: String,
    pub total_calls: u64,
    pub successful_calls: u64,
    pub timeout_calls: u64,
    pub failed_calls: u64,

    #[serde(with = "duration_secs")]
    pub average_duration: Duration,

    #[serde(with = "duration_secs")]
    pub current_timeout: Duration,

    /// Most recent durations, oldest first.
    #[serde(skip)]
    pub recent_durations: Vec<Duration>,
}

/// What the manager would use for an operation right now.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimeoutRecommendation {
    #[serde(with = "duration_secs")]
    pub current_timeout: Duration,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub p95: Option<f64>,

    pub samples: usize,
}

#[derive(Debug, Clone, Copy)]
enum Completion {
    Success,
    Failure,
    TimedOut,
}

#[derive(Debug)]
struct OperationStats {
    total: u64,
    successful: u64,
    timeouts: u64,
    failures: u64,

    /// Last `history_size` durations; both the average and the p95 use them.
    recent: VecDeque<Duration>,
    current_timeout: Duration,
    since_adjustment: u32,
}

impl OperationStats {
    fn new(initial: Duration) -> Self {
        Self {
            total: 0,
            successful: 0,
            timeouts: 0,
            failures: 0,
            recent: VecDeque::new(),
            current_timeout: initial,
            since_adjustment: 0,
        }
    }

    fn average(&self) -> Duration {
        if self.recent.is_empty() {
            return Duration::ZERO;
        }
        let sum: Duration = self.recent.iter().sum();
        sum.div_f64(self.recent.len() as f64)
    }

    fn p95(&self) -> Option<Duration> {
        if self.recent.is_empty() {
            return None;
        }
        let mut sorted: Vec<Duration> = self.recent.iter().copied().collect();
        sorted.sort_unstable();
        let rank = (sorted.len() as f64 * 0.95).ceil() as usize;
        sorted.get(rank.saturating_sub(1)).copied()
    }
}

#[derive(Debug)]
pub struct AdaptiveTimeoutManager {
    config: TimeoutConfig,
    stats: Mutex<HashMap<String, OperationStats>>,
}

impl AdaptiveTimeoutManager {
    pub fn new(config: TimeoutConfig) -> Self {
        Self {
            config,
            stats: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, OperationStats>> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Recommended timeout for `operation` (the default until history exists).
    pub fn current_timeout(&self, operation: &str) -> Duration {
        self.lock()
            .get(operation)
            .map_or(self.config.default_timeout, |s| s.current_timeout)
    }

    /// Await `future` for at most `timeout` (or the current recommendation).
    ///
    /// Expiry drops the future and returns `AsyncTimeout`.
    pub async fn execute_with_timeout<T, Fut>(
        &self,
        future: Fut,
        operation: &str,
        timeout: Option<Duration>,
    ) -> Result<T, HiveError>
    where
        Fut: Future<Output = Result<T, HiveError>>,
    {
        let limit = timeout.unwrap_or_else(|| self.current_timeout(operation));
        let started = Instant::now();
        match tokio::time::timeout(limit, future).await {
            Ok(result) => {
                let completion = if result.is_ok() {
                    Completion::Success
                } else {
                    Completion::Failure
                };
                self.record(operation, completion, started.elapsed());
                result
            }
            Err(_) => {
                self.record(operation, Completion::TimedOut, limit);
                warn!(operation, timeout_ms = limit.as_millis() as u64, "operation timed out");
                Err(HiveError::AsyncTimeout {
                    operation: operation.to_string(),
                    timeout_duration: limit,
                })
            }
        }
    }

    /// Like [`execute_with_timeout`](Self::execute_with_timeout), but a
    /// timeout yields `fallback` instead of an error.
    pub async fn execute_with_fallback<T, Fut>(
        &self,
        future: Fut,
        operation: &str,
        timeout: Option<Duration>,
        fallback: T,
    ) -> Result<T, HiveError>
    where
        Fut: Future<Output = Result<T, HiveError>>,
    {
        match self.execute_with_timeout(future, operation, timeout).await {
            Err(HiveError::AsyncTimeout { .. }) => Ok(fallback),
            other => other,
        }
    }

    fn record(&self, operation: &str, completion: Completion, duration: Duration) {
        let mut stats = self.lock();
        let entry = stats
            .entry(operation.to_string())
            .or_insert_with(|| OperationStats::new(self.config.default_timeout));

        entry.total += 1;
        match completion {
            Completion::Success => entry.successful += 1,
            Completion::Failure => entry.failures += 1,
            Completion::TimedOut => entry.timeouts += 1,
        }
        entry.recent.push_back(duration);
        while entry.recent.len() > self.config.history_size {
            entry.recent.pop_front();
        }

        if !self.config.adaptive {
            return;
        }
        entry.since_adjustment += 1;
        if entry.since_adjustment < self.config.adjustment_window {
            return;
        }
        entry.since_adjustment = 0;

        let Some(p95) = entry.p95() else { return };
        let target = p95.as_secs_f64() * self.config.safety_factor;
        let current = entry.current_timeout.as_secs_f64();
        let nudged = current + (target - current) / 2.0;
        let next = Duration::try_from_secs_f64(nudged)
            .unwrap_or(self.config.max_timeout)
            .clamp(self.config.min_timeout, self.config.max_timeout);
        debug!(
            operation,
            p95_ms = p95.as_millis() as u64,
            from_ms = entry.current_timeout.as_millis() as u64,
            to_ms = next.as_millis() as u64,
            "adjusted timeout"
        );
        entry.current_timeout = next;
    }

    pub fn get_metrics(&self, operation: &str) -> Option<OperationMetrics> {
        self.lock().get(operation).map(|s| snapshot(operation, s))
    }

    /// Metrics of every operation seen so far, sorted by name.
    pub fn all_metrics(&self) -> Vec<OperationMetrics> {
        let stats = self.lock();
        let mut all: Vec<_> = stats.iter().map(|(name, s)| snapshot(name, s)).collect();
        all.sort_by(|a, b| a.operation.cmp(&b.operation));
        all
    }

    pub fn get_recommendations(&self) -> BTreeMap<String, TimeoutRecommendation> {
        self.lock()
            .iter()
            .map(|(name, s)| {
                (
                    name.clone(),
                    TimeoutRecommendation {
                        current_timeout: s.current_timeout,
                        p95: s.p95().map(|d| d.as_secs_f64()),
                        samples: s.recent.len(),
                    },
                )
            })
            .collect()
    }

    /// Forget all history; every operation falls back to the default.
    pub fn reset(&self) {
        self.lock().clear();
    }
}

fn snapshot(operation: &str, s: &OperationStats) -> OperationMetrics {
    OperationMetrics {
        operation: operation.to_string(),
        total_calls: s.total,
        successful_calls: s.successful,
        timeout_calls: s.timeouts,
        failed_calls: s.failures,
        average_duration: s.average(),
        current_timeout: s.current_timeout,
        recent_durations: s.recent.iter().copied().collect(),
    }
}
