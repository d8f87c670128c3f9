//! What to do with a task whose run did not succeed.

use serde::{Deserialize, Serialize};

use super::task::TaskRecord;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Decision {
    /// Back to PENDING for another attempt.
    Requeue { reason: String },

    /// Permanently FAILED.
    GiveUp { reason: String },
}

impl Decision {
    pub fn reason(&self) -> &str {
        match self {
            Decision::Requeue { reason } | Decision::GiveUp { reason } => reason,
        }
    }
}

/// Pure policy: given the task after a failed, timed-out or orphaned run,
/// decide whether it gets another attempt.
pub trait Decider: Send + Sync {
    fn decide(&self, task: &TaskRecord) -> Decision;
}

/// Requeues while `attempt_count < max_attempts`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultDecider;

impl Decider for DefaultDecider {
    fn decide(&self, task: &TaskRecord) -> Decision {
        if task.attempts_exhausted() {
            Decision::GiveUp {
                reason: format!(
                    "max attempts reached: {}/{}",
                    task.attempt_count, task.max_attempts
                ),
            }
        } else {
            Decision::Requeue {
                reason: format!(
                    "attempt {}/{} did not succeed",
                    task.attempt_count, task.max_attempts
                ),
            }
        }
    }
}
