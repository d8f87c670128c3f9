//! Append-only execution events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{RunId, TaskId, WorkerId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    TaskSubmitted,
    TaskAssigned,
    TaskStarted,
    TaskCompleted,
    TaskFailed,
    TaskBlocked,
    TaskTimedOut,
    TaskRequeued,
    TaskDeferred,
    TaskCancelled,
    TaskUnblocked,
    TaskOrphaned,
    LateResultDiscarded,
    WorkerRegistered,
    WorkerUnavailable,
    WorkerRemoved,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<WorkerId>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<RunId>,

    pub timestamp: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub payload: serde_json::Value,
}

impl ExecutionEvent {
    pub fn new(kind: EventKind, timestamp: DateTime<Utc>) -> Self {
        Self {
            kind,
            task_id: None,
            worker_id: None,
            run_id: None,
            timestamp,
            payload: serde_json::Value::Null,
        }
    }

    pub fn task(mut self, id: TaskId) -> Self {
        self.task_id = Some(id);
        self
    }

    pub fn worker(mut self, id: WorkerId) -> Self {
        self.worker_id = Some(id);
        self
    }

    pub fn run(mut self, id: RunId) -> Self {
        self.run_id = Some(id);
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}
