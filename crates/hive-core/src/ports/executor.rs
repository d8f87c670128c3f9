//! TaskExecutor port: the opaque capability that actually does a task's work.

use std::path::Path;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::domain::{HiveError, Outcome, TaskRecord};

/// Runs one task inside `workdir`.
///
/// `Ok(outcome)` covers every result the task itself reports, including
/// failure and blocked. `Err` means the executor could not do its job
/// (spawn failure, crash); transient errors are retried by the worker.
///
/// The worker aborts the returned future at `deadline`; executors may also
/// use it to bound their own sub-steps.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(
        &self,
        task: &TaskRecord,
        workdir: &Path,
        deadline: Instant,
    ) -> Result<Outcome, HiveError>;
}
