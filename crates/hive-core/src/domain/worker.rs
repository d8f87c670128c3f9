//! Worker records as tracked by the scheduler.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{RunId, TaskId, WorkerId};
use super::state::WorkerStatus;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub id: WorkerId,
    pub status: WorkerStatus,
    pub current_task: Option<TaskId>,
    pub current_run: Option<RunId>,
    pub last_heartbeat: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,
    pub unavailable_since: Option<DateTime<Utc>>,
}

impl WorkerRecord {
    pub fn new(id: WorkerId, now: DateTime<Utc>) -> Self {
        Self {
            id,
            status: WorkerStatus::Active,
            current_task: None,
            current_run: None,
            last_heartbeat: now,
            registered_at: now,
            unavailable_since: None,
        }
    }

    /// Active and not holding a task.
    pub fn is_idle(&self) -> bool {
        self.status == WorkerStatus::Active && self.current_task.is_none()
    }

    /// Has the last heartbeat fallen outside `window` at `now`?
    pub fn heartbeat_expired(&self, now: DateTime<Utc>, window: chrono::Duration) -> bool {
        now - self.last_heartbeat > window
    }

    pub fn release(&mut self) {
        self.current_task = None;
        self.current_run = None;
    }
}
