//! Task specs (what callers submit) and task records (what the store keeps).

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::HiveError;
use super::ids::{RunId, TaskId, WorkerId};
use super::outcome::{Artifact, OutcomeKind};
use super::state::TaskStatus;
use crate::config::{duration_secs, option_duration_secs};

/// Executor kind used by both `Command` and `Pipeline` payloads.
pub const COMMAND_KIND: &str = "command";

/// One external program invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub program: String,

    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

fn default_parallelism() -> usize {
    4
}

/// What a task does, tagged by kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskPayload {
    /// Run one program and read its result marker.
    Command(CommandSpec),

    /// Independent programs run with bounded concurrency; all must succeed.
    Pipeline {
        steps: Vec<CommandSpec>,
        #[serde(default = "default_parallelism")]
        max_parallel: usize,
    },

    /// Handed to the executor registered under `executor`.
    Custom {
        executor: String,
        #[serde(default)]
        data: serde_json::Value,
    },
}

impl TaskPayload {
    /// Registry key of the executor that handles this payload.
    pub fn kind(&self) -> &str {
        match self {
            TaskPayload::Command(_) | TaskPayload::Pipeline { .. } => COMMAND_KIND,
            TaskPayload::Custom { executor, .. } => executor,
        }
    }

    fn validate(&self) -> Result<(), String> {
        match self {
            TaskPayload::Command(cmd) => validate_command(cmd),
            TaskPayload::Pipeline {
                steps,
                max_parallel,
            } => {
                if steps.is_empty() {
                    return Err("pipeline has no steps".to_string());
                }
                if *max_parallel == 0 {
                    return Err("pipeline max_parallel must be at least 1".to_string());
                }
                steps.iter().try_for_each(validate_command)
            }
            TaskPayload::Custom { executor, .. } => {
                if executor.trim().is_empty() {
                    Err("custom payload has an empty executor name".to_string())
                } else {
                    Ok(())
                }
            }
        }
    }
}

fn validate_command(cmd: &CommandSpec) -> Result<(), String> {
    if cmd.program.trim().is_empty() {
        Err("command program is empty".to_string())
    } else {
        Ok(())
    }
}

/// A task as submitted by a caller.
///
/// `key` is only meaningful inside one submitted batch: `depends_on` refers to
/// other keys of the same batch. The scheduler maps keys to `TaskId`s.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub key: String,
    pub title: String,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub priority: i32,

    #[serde(default)]
    pub depends_on: Vec<String>,

    /// Falls back to the configured default timeout.
    #[serde(default, with = "option_duration_secs")]
    pub timeout: Option<Duration>,

    /// Falls back to `max_attempts_per_task`.
    #[serde(default)]
    pub max_attempts: Option<u32>,

    pub payload: TaskPayload,
}

impl TaskSpec {
    pub fn new(key: impl Into<String>, title: impl Into<String>, payload: TaskPayload) -> Self {
        Self {
            key: key.into(),
            title: title.into(),
            description: String::new(),
            priority: 0,
            depends_on: Vec::new(),
            timeout: None,
            max_attempts: None,
            payload,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn depends_on(mut self, key: impl Into<String>) -> Self {
        self.depends_on.push(key.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Field-level checks. Graph-level checks live in [`crate::graph`].
    pub fn validate(&self) -> Result<(), HiveError> {
        let invalid = |reason: String| HiveError::InvalidTask {
            key: self.key.clone(),
            reason,
        };
        if self.key.trim().is_empty() {
            return Err(invalid("key is empty".to_string()));
        }
        if self.title.trim().is_empty() {
            return Err(invalid("title is empty".to_string()));
        }
        if self.timeout.is_some_and(|t| t.is_zero()) {
            return Err(invalid("timeout must be positive".to_string()));
        }
        if self.max_attempts == Some(0) {
            return Err(invalid("max_attempts must be at least 1".to_string()));
        }
        let mut seen = HashSet::new();
        if let Some(dup) = self.depends_on.iter().find(|d| !seen.insert(d.as_str())) {
            return Err(invalid(format!("dependency '{dup}' listed twice")));
        }
        self.payload.validate().map_err(invalid)
    }
}

/// Structured result persisted on a task once a run finishes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub run_id: RunId,
    pub status: OutcomeKind,
    pub notes: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<Artifact>,

    #[serde(with = "duration_secs")]
    pub duration: Duration,
}

/// Fields supplied to `TaskStore::create_task`.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub id: TaskId,
    pub key: String,
    pub title: String,
    pub description: String,
    pub priority: i32,
    pub dependencies: Vec<TaskId>,
    pub timeout: Duration,
    pub max_attempts: u32,
    pub payload: TaskPayload,
    pub created_at: DateTime<Utc>,
}

/// The persisted task record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub key: String,
    pub title: String,
    pub description: String,
    pub priority: i32,
    pub status: TaskStatus,
    pub dependencies: Vec<TaskId>,

    #[serde(with = "duration_secs")]
    pub timeout: Duration,

    pub payload: TaskPayload,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub assigned_worker: Option<WorkerId>,

    /// Ownership token of the current assignment.
    pub run_id: Option<RunId>,

    pub assigned_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    /// Store-assigned creation sequence, last dispatch tie-breaker.
    pub seq: u64,

    pub result: Option<TaskResult>,
    pub error: Option<String>,
}

impl TaskRecord {
    pub fn from_new(new: NewTask, seq: u64) -> Self {
        Self {
            id: new.id,
            key: new.key,
            title: new.title,
            description: new.description,
            priority: new.priority,
            status: TaskStatus::Pending,
            dependencies: new.dependencies,
            timeout: new.timeout,
            payload: new.payload,
            attempt_count: 0,
            max_attempts: new.max_attempts,
            assigned_worker: None,
            run_id: None,
            assigned_at: None,
            created_at: new.created_at,
            updated_at: new.created_at,
            seq,
            result: None,
            error: None,
        }
    }

    pub fn attempts_exhausted(&self) -> bool {
        self.attempt_count >= self.max_attempts
    }

    /// Permanent terminal state: Completed, Cancelled, or Failed with no
    /// attempts left.
    pub fn is_terminal(&self) -> bool {
        self.status.is_final() || (self.status == TaskStatus::Failed && self.attempts_exhausted())
    }

    /// Has a RUNNING task outlived its timeout at `now`?
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        match (self.status, self.assigned_at) {
            (TaskStatus::Running, Some(assigned_at)) => {
                let timeout = chrono::Duration::from_std(self.timeout)
                    .unwrap_or(chrono::TimeDelta::MAX);
                now - assigned_at > timeout
            }
            _ => false,
        }
    }
}

/// Ownership change applied together with a status transition.
#[derive(Debug, Clone, Default)]
pub enum Ownership {
    #[default]
    Keep,
    Assign {
        worker: WorkerId,
        run_id: RunId,
        at: DateTime<Utc>,
    },
    /// Drop the run token but remember the last worker.
    Revoke,
    /// Clear every ownership field.
    Release,
}

/// Extra fields written by `TaskStore::update_status`.
#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
    pub ownership: Ownership,
    pub increment_attempts: bool,

    /// Give back the attempt taken by the current assignment.
    pub refund_attempt: bool,

    /// Mark the attempt budget spent so the task turns terminal.
    pub exhaust_attempts: bool,
    pub result: Option<TaskResult>,
    pub error: Option<String>,
    pub clear_error: bool,
}

impl TaskPatch {
    pub fn assign(worker: WorkerId, run_id: RunId, at: DateTime<Utc>) -> Self {
        Self {
            ownership: Ownership::Assign { worker, run_id, at },
            increment_attempts: true,
            clear_error: true,
            ..Self::default()
        }
    }

    pub fn release() -> Self {
        Self {
            ownership: Ownership::Release,
            ..Self::default()
        }
    }

    pub fn revoke() -> Self {
        Self {
            ownership: Ownership::Revoke,
            ..Self::default()
        }
    }

    /// Back to PENDING as if the run never started.
    pub fn defer() -> Self {
        Self {
            ownership: Ownership::Release,
            refund_attempt: true,
            ..Self::default()
        }
    }

    pub fn exhausted(mut self) -> Self {
        self.exhaust_attempts = true;
        self
    }

    pub fn with_result(mut self, result: TaskResult) -> Self {
        self.result = Some(result);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Apply the patch to a record. Status and timestamps are set by the store.
    pub fn apply(self, record: &mut TaskRecord) {
        match self.ownership {
            Ownership::Keep => {}
            Ownership::Assign { worker, run_id, at } => {
                record.assigned_worker = Some(worker);
                record.run_id = Some(run_id);
                record.assigned_at = Some(at);
            }
            Ownership::Revoke => {
                record.run_id = None;
            }
            Ownership::Release => {
                record.assigned_worker = None;
                record.run_id = None;
                record.assigned_at = None;
            }
        }
        if self.increment_attempts {
            record.attempt_count += 1;
        }
        if self.refund_attempt {
            record.attempt_count = record.attempt_count.saturating_sub(1);
        }
        if self.exhaust_attempts {
            record.attempt_count = record.attempt_count.max(record.max_attempts);
        }
        if self.clear_error {
            record.error = None;
        }
        if let Some(result) = self.result {
            record.result = Some(result);
        }
        if let Some(error) = self.error {
            record.error = Some(error);
        }
    }
}

/// Compare-and-swap guard for `TaskStore::update_status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Expected {
    pub status: TaskStatus,

    /// When set, the record's current run id must match.
    pub run_id: Option<RunId>,
}

impl Expected {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status,
            run_id: None,
        }
    }

    pub fn owned(status: TaskStatus, run_id: RunId) -> Self {
        Self {
            status,
            run_id: Some(run_id),
        }
    }

    pub fn matches(&self, record: &TaskRecord) -> bool {
        record.status == self.status
            && self.run_id.is_none_or(|run| record.run_id == Some(run))
    }
}
