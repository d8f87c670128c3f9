//! Resilience primitives wrapped around every executor call.

pub mod circuit_breaker;
pub mod retry;
pub mod timeout;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerRegistry, CircuitBreakerStatus, CircuitState};
pub use retry::{RetryPolicy, RetryPredicate};
pub use timeout::{AdaptiveTimeoutManager, OperationMetrics, TimeoutRecommendation};
