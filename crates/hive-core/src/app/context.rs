use std::sync::Arc;

use crate::app::recorder::EventRecorder;
use crate::app::registry::ExecutorRegistry;
use crate::config::HiveConfig;
use crate::domain::Decider;
use crate::ports::{Clock, IdGenerator, TaskStore};
use crate::resilience::{AdaptiveTimeoutManager, CircuitBreakerRegistry, RetryPolicy};

/// Collaborators shared by the scheduler and every worker.
///
/// Registries are owned here and injected; nothing in the crate is global.
#[derive(Clone)]
pub struct HiveContext {
    pub config: Arc<HiveConfig>,
    pub store: Arc<dyn TaskStore>,
    pub recorder: Arc<EventRecorder>,
    pub clock: Arc<dyn Clock>,
    pub ids: Arc<dyn IdGenerator>,
    pub decider: Arc<dyn Decider>,
    pub executors: Arc<ExecutorRegistry>,
    pub breakers: Arc<CircuitBreakerRegistry>,
    pub timeouts: Arc<AdaptiveTimeoutManager>,
    pub retry: RetryPolicy,
}
