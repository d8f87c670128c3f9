//! Status snapshot: task counts per state, workers, resilience state.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::domain::{TaskStatus, WorkerRecord};
use crate::resilience::{CircuitBreakerStatus, TimeoutRecommendation};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TaskCounts {
    pub pending: usize,
    pub assigned: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub timeout: usize,
    pub cancelled: usize,
    pub blocked: usize,
}

impl TaskCounts {
    pub fn add(&mut self, status: TaskStatus) {
        match status {
            TaskStatus::Pending => self.pending += 1,
            TaskStatus::Assigned => self.assigned += 1,
            TaskStatus::Running => self.running += 1,
            TaskStatus::Completed => self.completed += 1,
            TaskStatus::Failed => self.failed += 1,
            TaskStatus::Timeout => self.timeout += 1,
            TaskStatus::Cancelled => self.cancelled += 1,
            TaskStatus::Blocked => self.blocked += 1,
        }
    }

    pub fn get(&self, status: TaskStatus) -> usize {
        match status {
            TaskStatus::Pending => self.pending,
            TaskStatus::Assigned => self.assigned,
            TaskStatus::Running => self.running,
            TaskStatus::Completed => self.completed,
            TaskStatus::Failed => self.failed,
            TaskStatus::Timeout => self.timeout,
            TaskStatus::Cancelled => self.cancelled,
            TaskStatus::Blocked => self.blocked,
        }
    }

    pub fn total(&self) -> usize {
        TaskStatus::ALL.iter().map(|s| self.get(*s)).sum()
    }

    /// Tasks a worker currently owns.
    pub fn in_flight(&self) -> usize {
        self.assigned + self.running
    }
}

impl FromIterator<TaskStatus> for TaskCounts {
    fn from_iter<I: IntoIterator<Item = TaskStatus>>(iter: I) -> Self {
        let mut counts = Self::default();
        for status in iter {
            counts.add(status);
        }
        counts
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub tasks: TaskCounts,
    pub workers: Vec<WorkerRecord>,
    pub breakers: Vec<CircuitBreakerStatus>,
    pub timeouts: BTreeMap<String, TimeoutRecommendation>,

    /// No task can make progress without outside action.
    pub settled: bool,
}
