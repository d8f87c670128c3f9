//! Task and worker state machines.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a task.
///
/// Transitions:
/// - Pending -> Assigned (scheduler, dependencies satisfied, worker available)
/// - Assigned -> Running (worker claims)
/// - Running -> Completed | Failed | Timeout | Blocked (worker reports)
/// - Failed | Timeout -> Pending (requeue within the attempt budget)
/// - Timeout -> Failed (attempts exhausted)
/// - Failed -> Failed (given up early; the budget is marked spent)
/// - Running -> Pending (fast-failed by an open breaker, attempt refunded)
/// - Assigned | Running -> Pending | Failed (owner presumed dead)
/// - Blocked -> Pending (explicit unblock)
/// - any non-terminal -> Cancelled
///
/// `Failed` is terminal only once the attempt budget is spent; see
/// [`crate::domain::TaskRecord::is_terminal`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Assigned,
    Running,
    Completed,
    Failed,
    Timeout,
    Cancelled,
    Blocked,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 8] = [
        TaskStatus::Pending,
        TaskStatus::Assigned,
        TaskStatus::Running,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Timeout,
        TaskStatus::Cancelled,
        TaskStatus::Blocked,
    ];

    /// States that never change again regardless of budget.
    pub fn is_final(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Cancelled)
    }

    /// States in which a worker owns the task.
    pub fn is_owned(self) -> bool {
        matches!(self, TaskStatus::Assigned | TaskStatus::Running)
    }

    /// Is `self -> next` an edge of the state machine?
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        match (self, next) {
            (Pending, Assigned) => true,
            (Assigned, Running) => true,
            (Running, Completed | Failed | Timeout | Blocked) => true,
            (Failed | Timeout, Pending) => true,
            (Timeout | Failed, Failed) => true,
            (Assigned | Running, Pending | Failed) => true,
            (Blocked, Pending) => true,
            (from, Cancelled) => !from.is_final(),
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Assigned => "ASSIGNED",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Timeout => "TIMEOUT",
            TaskStatus::Cancelled => "CANCELLED",
            TaskStatus::Blocked => "BLOCKED",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Liveness state of a worker as seen by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Active,
    Unavailable,
}
