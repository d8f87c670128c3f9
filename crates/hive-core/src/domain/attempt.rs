//! Per-run execution history.
//!
//! One `AttemptRecord` is persisted per (task_id, run_id), including runs whose
//! result arrived after the task was reassigned; those are stored with
//! `superseded = true` so the history explains what happened.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{RunId, TaskId, WorkerId};
use super::outcome::Artifact;
use crate::config::duration_secs;

/// How a single run ended from the worker's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Failed,
    Blocked,
    TimedOut,
    Cancelled,

    /// Rejected by an open circuit breaker before the executor ran; the
    /// task goes back to PENDING without spending an attempt.
    Deferred,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub task_id: TaskId,
    pub run_id: RunId,
    pub worker_id: WorkerId,

    /// 1-based attempt number at claim time.
    pub attempt: u32,

    pub status: RunStatus,
    pub notes: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<Artifact>,

    pub error: Option<String>,

    #[serde(with = "duration_secs")]
    pub duration: Duration,

    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,

    /// The run no longer owned the task when it finished.
    #[serde(default)]
    pub superseded: bool,
}
