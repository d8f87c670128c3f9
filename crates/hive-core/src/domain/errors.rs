//! Error taxonomy shared by every layer of the crate.

use std::time::Duration;

use thiserror::Error;

use super::ids::{TaskId, WorkerId};
use super::state::TaskStatus;

/// Operational classification of an error.
///
/// - Transient: worth retrying (timeouts, flaky executors)
/// - Permanent: retrying cannot help (bad input, graph errors, open breaker)
/// - Infrastructure: the store, bus or filesystem failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transient,
    Permanent,
    Infrastructure,
}

#[derive(Debug, Error)]
pub enum HiveError {
    /// A dependency reference does not name a task of the submitted batch.
    #[error("task '{task}' depends on unknown task '{missing}'")]
    Dependency { task: String, missing: String },

    /// The same key appears twice in one batch.
    #[error("duplicate task key '{0}' in submitted batch")]
    DuplicateTask(String),

    /// Kahn's algorithm left these nodes unresolved.
    #[error("cyclic dependency among tasks: {}", .0.join(", "))]
    CyclicDependency(Vec<String>),

    #[error("circuit breaker open for operation '{operation}'")]
    CircuitBreakerOpen { operation: String },

    #[error("operation '{operation}' timed out after {timeout_duration:?}")]
    AsyncTimeout {
        operation: String,
        timeout_duration: Duration,
    },

    /// The executor capability itself errored (spawn failure, crash, ...).
    #[error("task execution failed: {message}")]
    TaskExecution { message: String, retryable: bool },

    #[error("worker {0} is unavailable (heartbeat lost)")]
    WorkerUnavailable(WorkerId),

    #[error("no executor registered for task kind '{0}'")]
    ExecutorNotFound(String),

    #[error("an executor is already registered for task kind '{0}'")]
    DuplicateExecutor(String),

    /// Expected task kinds with no registered executor.
    #[error("missing executors for task kinds: {}", .0.join(", "))]
    MissingExecutors(Vec<String>),

    #[error("invalid task '{key}': {reason}")]
    InvalidTask { key: String, reason: String },

    #[error("task {0} not found")]
    TaskNotFound(TaskId),

    #[error("task {task} is {status} and cannot be {action}")]
    InvalidTransition {
        task: TaskId,
        status: TaskStatus,
        action: &'static str,
    },

    #[error("execution cancelled")]
    Cancelled,

    #[error("task store error: {0}")]
    Store(String),

    #[error("event bus error: {0}")]
    EventBus(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl HiveError {
    pub fn execution(message: impl Into<String>) -> Self {
        HiveError::TaskExecution {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn fatal_execution(message: impl Into<String>) -> Self {
        HiveError::TaskExecution {
            message: message.into(),
            retryable: false,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            HiveError::AsyncTimeout { .. } => ErrorKind::Transient,
            HiveError::TaskExecution { retryable: true, .. } => ErrorKind::Transient,
            HiveError::WorkerUnavailable(_) => ErrorKind::Transient,
            HiveError::Store(_) | HiveError::EventBus(_) | HiveError::Io(_) => {
                ErrorKind::Infrastructure
            }
            _ => ErrorKind::Permanent,
        }
    }

    /// Default retryable predicate: only transient errors are retried.
    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    /// Graph validation errors abort a whole batch before scheduling.
    pub fn is_graph_error(&self) -> bool {
        matches!(
            self,
            HiveError::Dependency { .. }
                | HiveError::DuplicateTask(_)
                | HiveError::CyclicDependency(_)
        )
    }
}
