//! TaskStore port: the single source of truth for task records.
//!
//! Every status change is a compare-and-swap: `update_status` only applies
//! when the record still matches [`Expected`], and reports `false` otherwise.
//! Two parties racing on the same task (scheduler reclaiming, worker
//! reporting) therefore never both win.

use async_trait::async_trait;

use crate::domain::{
    AttemptRecord, Expected, HiveError, NewTask, TaskId, TaskPatch, TaskRecord, TaskStatus,
};

/// Ordering of `list_pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatchOrder {
    /// Priority desc, then created_at asc, then creation sequence.
    #[default]
    PriorityThenAge,

    /// Creation sequence only.
    Submission,
}

impl DispatchOrder {
    pub fn sort(self, tasks: &mut [TaskRecord]) {
        match self {
            DispatchOrder::PriorityThenAge => tasks.sort_by(|a, b| {
                b.priority
                    .cmp(&a.priority)
                    .then(a.created_at.cmp(&b.created_at))
                    .then(a.seq.cmp(&b.seq))
            }),
            DispatchOrder::Submission => tasks.sort_by_key(|t| t.seq),
        }
    }
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert a new PENDING task.
    async fn create_task(&self, task: NewTask) -> Result<TaskId, HiveError>;

    async fn get_task(&self, id: TaskId) -> Result<Option<TaskRecord>, HiveError>;

    /// Conditionally move `id` to `new_status` and apply `patch`.
    ///
    /// Returns `Ok(false)` when the record no longer matches `expected`.
    /// Errors when the task is unknown or the edge is not part of the state
    /// machine.
    async fn update_status(
        &self,
        id: TaskId,
        expected: Expected,
        new_status: TaskStatus,
        patch: TaskPatch,
    ) -> Result<bool, HiveError>;

    /// PENDING tasks in the requested order.
    async fn list_pending(&self, order: DispatchOrder) -> Result<Vec<TaskRecord>, HiveError>;

    /// Tasks in any of `statuses`, in submission order.
    async fn list_by_status(&self, statuses: &[TaskStatus]) -> Result<Vec<TaskRecord>, HiveError>;

    async fn record_attempt(&self, attempt: AttemptRecord) -> Result<(), HiveError>;

    /// Attempts of one task, oldest first.
    async fn list_attempts(&self, task_id: TaskId) -> Result<Vec<AttemptRecord>, HiveError>;
}
