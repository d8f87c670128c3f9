//! Worker side: claim an assignment, run it, report back.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde_json::json;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::app::context::HiveContext;
use crate::app::scheduler::{Assignment, Queen};
use crate::domain::{
    Artifact, AttemptRecord, EventKind, Expected, HiveError, Outcome, OutcomeKind, RunId,
    RunStatus, TaskId, TaskPatch, TaskRecord, TaskResult, TaskStatus, WorkerId,
};
use crate::ports::TaskExecutor;

/// Deadline horizon for a timeout too large to add to the current instant.
const UNBOUNDED_RUN: Duration = Duration::from_secs(86_400 * 365 * 30);

/// How one run ended, before it is written back.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionReport {
    pub status: RunStatus,
    pub notes: String,
    pub artifacts: Vec<Artifact>,

    /// Set when the executor itself errored, timed out or was cancelled.
    pub error: Option<String>,

    pub duration: Duration,
}

impl ExecutionReport {
    fn from_outcome(outcome: Outcome, duration: Duration) -> Self {
        let status = match outcome.kind {
            OutcomeKind::Success => RunStatus::Completed,
            OutcomeKind::Failure => RunStatus::Failed,
            OutcomeKind::Blocked => RunStatus::Blocked,
        };
        Self {
            status,
            notes: outcome.notes,
            artifacts: outcome.artifacts,
            error: None,
            duration,
        }
    }

    /// `executor_ran` tells a breaker rejection before any call (deferred)
    /// from one that cut a run of real failures short (failed).
    fn from_error(error: &HiveError, executor_ran: bool, duration: Duration) -> Self {
        let status = match error {
            HiveError::AsyncTimeout { .. } => RunStatus::TimedOut,
            HiveError::Cancelled => RunStatus::Cancelled,
            HiveError::CircuitBreakerOpen { .. } if !executor_ran => RunStatus::Deferred,
            _ => RunStatus::Failed,
        };
        Self {
            status,
            notes: String::new(),
            artifacts: Vec::new(),
            error: Some(error.to_string()),
            duration,
        }
    }

    /// Store status this run moves the task to; `None` for cancelled runs,
    /// whose task was already moved by the scheduler.
    fn next_status(&self) -> Option<TaskStatus> {
        match self.status {
            RunStatus::Completed => Some(TaskStatus::Completed),
            RunStatus::Failed => Some(TaskStatus::Failed),
            RunStatus::Blocked => Some(TaskStatus::Blocked),
            RunStatus::TimedOut => Some(TaskStatus::Timeout),
            RunStatus::Deferred => Some(TaskStatus::Pending),
            RunStatus::Cancelled => None,
        }
    }

    fn patch(&self, run_id: RunId) -> TaskPatch {
        let mut patch = match self.status {
            RunStatus::Deferred => TaskPatch::defer(),
            _ => TaskPatch::default(),
        };
        let outcome = match self.status {
            RunStatus::Completed => Some(OutcomeKind::Success),
            RunStatus::Blocked => Some(OutcomeKind::Blocked),
            RunStatus::Failed if self.error.is_none() => Some(OutcomeKind::Failure),
            _ => None,
        };
        if let Some(status) = outcome {
            patch = patch.with_result(TaskResult {
                run_id,
                status,
                notes: self.notes.clone(),
                artifacts: self.artifacts.clone(),
                duration: self.duration,
            });
        }
        match (&self.error, self.status) {
            (Some(error), _) => patch.with_error(error.clone()),
            (None, RunStatus::Failed) => patch.with_error(self.notes.clone()),
            _ => patch,
        }
    }
}

/// Executes assignments on behalf of one registered worker.
#[derive(Clone)]
pub struct WorkerExecutor {
    worker_id: WorkerId,
    ctx: HiveContext,
}

impl WorkerExecutor {
    pub fn new(worker_id: WorkerId, ctx: HiveContext) -> Self {
        Self { worker_id, ctx }
    }

    pub fn id(&self) -> WorkerId {
        self.worker_id
    }

    /// Claim, execute and report one assignment.
    ///
    /// Returns `Ok(None)` when the assignment was revoked before it could be
    /// claimed.
    pub async fn run(&self, assignment: Assignment) -> Result<Option<ExecutionReport>, HiveError> {
        let Assignment {
            task_id,
            run_id,
            cancel,
        } = assignment;

        let claimed = self
            .ctx
            .store
            .update_status(
                task_id,
                Expected::owned(TaskStatus::Assigned, run_id),
                TaskStatus::Running,
                TaskPatch::default(),
            )
            .await?;
        if !claimed {
            debug!(task_id = %task_id, run_id = %run_id, "assignment revoked before claim");
            return Ok(None);
        }

        let task = self
            .ctx
            .store
            .get_task(task_id)
            .await?
            .ok_or(HiveError::TaskNotFound(task_id))?;
        let started_at = self.ctx.clock.now();

        info!(
            task_id = %task_id,
            worker_id = %self.worker_id,
            run_id = %run_id,
            attempt = task.attempt_count,
            "task started"
        );
        self.ctx
            .recorder
            .record(
                self.ctx
                    .recorder
                    .event(EventKind::TaskStarted)
                    .task(task_id)
                    .worker(self.worker_id)
                    .run(run_id)
                    .with_payload(json!({ "attempt": task.attempt_count })),
            )
            .await;

        let report = self.execute(&task, run_id, cancel).await;
        self.persist(&task, run_id, started_at, &report).await?;
        Ok(Some(report))
    }

    /// Run `task` in its own work directory, bounded by the task timeout.
    ///
    /// Each executor call goes through the task kind's circuit breaker and
    /// the adaptive timeout manager, and transient errors are retried with
    /// backoff while the deadline allows. Flipping `cancel` aborts the run.
    pub async fn execute(
        &self,
        task: &TaskRecord,
        run_id: RunId,
        mut cancel: watch::Receiver<bool>,
    ) -> ExecutionReport {
        let started = Instant::now();
        let deadline = started
            .checked_add(task.timeout)
            .unwrap_or_else(|| started + UNBOUNDED_RUN);
        let kind = task.payload.kind();
        let workdir = self.workdir(task.id, run_id);
        let executor_ran = AtomicBool::new(false);

        let result = match self.prepare(task, &workdir).await {
            Err(e) => Err(e),
            Ok(executor) => {
                let work = self.invoke(executor, task, &workdir, deadline, &executor_ran);
                tokio::select! {
                    biased;
                    () = cancelled(&mut cancel) => Err(HiveError::Cancelled),
                    res = tokio::time::timeout_at(deadline, work) => {
                        res.unwrap_or_else(|_| Err(HiveError::AsyncTimeout {
                            operation: kind.to_string(),
                            timeout_duration: task.timeout,
                        }))
                    }
                }
            }
        };

        if !self.ctx.config.keep_workdirs {
            self.cleanup(&workdir).await;
        }

        let duration = started.elapsed();
        match result {
            Ok(outcome) => ExecutionReport::from_outcome(outcome, duration),
            Err(error) => {
                debug!(task_id = %task.id, run_id = %run_id, error = %error, "run ended with error");
                let ran = executor_ran.load(Ordering::Relaxed);
                ExecutionReport::from_error(&error, ran, duration)
            }
        }
    }

    fn workdir(&self, task: TaskId, run: RunId) -> PathBuf {
        self.ctx
            .config
            .work_root
            .join(task.to_string())
            .join(run.to_string())
    }

    async fn prepare(
        &self,
        task: &TaskRecord,
        workdir: &Path,
    ) -> Result<Arc<dyn TaskExecutor>, HiveError> {
        let executor = self.ctx.executors.resolve(task)?;
        tokio::fs::create_dir_all(workdir).await?;
        Ok(executor)
    }

    async fn invoke(
        &self,
        executor: Arc<dyn TaskExecutor>,
        task: &TaskRecord,
        workdir: &Path,
        deadline: Instant,
        executor_ran: &AtomicBool,
    ) -> Result<Outcome, HiveError> {
        let kind = task.payload.kind();
        let breaker = self.ctx.breakers.get(kind);
        self.ctx
            .retry
            .run(kind, Some(deadline), Some(&*breaker), |attempt| {
                let executor = Arc::clone(&executor);
                let remaining = deadline.saturating_duration_since(Instant::now());
                async move {
                    executor_ran.store(true, Ordering::Relaxed);
                    if attempt > 1 {
                        debug!(task_id = %task.id, attempt, "retrying executor call");
                    }
                    let call = executor.execute(task, workdir, deadline);
                    self.ctx
                        .timeouts
                        .execute_with_timeout(call, kind, Some(remaining))
                        .await
                }
            })
            .await
    }

    async fn cleanup(&self, workdir: &Path) {
        if let Err(e) = tokio::fs::remove_dir_all(workdir).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            debug!(workdir = %workdir.display(), error = %e, "could not remove work directory");
        }
        // Task directory goes too once its last run is gone.
        if let Some(parent) = workdir.parent() {
            let _ = tokio::fs::remove_dir(parent).await;
        }
    }

    /// Write the report back under compare-and-swap and keep the attempt.
    async fn persist(
        &self,
        task: &TaskRecord,
        run_id: RunId,
        started_at: chrono::DateTime<chrono::Utc>,
        report: &ExecutionReport,
    ) -> Result<(), HiveError> {
        let superseded = match report.next_status() {
            Some(next) => {
                let applied = self
                    .ctx
                    .store
                    .update_status(
                        task.id,
                        Expected::owned(TaskStatus::Running, run_id),
                        next,
                        report.patch(run_id),
                    )
                    .await?;
                if applied {
                    self.announce(task, run_id, next, report).await;
                }
                !applied
            }
            None => true,
        };

        if superseded && report.status != RunStatus::Cancelled {
            warn!(
                task_id = %task.id,
                worker_id = %self.worker_id,
                run_id = %run_id,
                status = ?report.status,
                "late result discarded"
            );
            self.ctx
                .recorder
                .record(
                    self.ctx
                        .recorder
                        .event(EventKind::LateResultDiscarded)
                        .task(task.id)
                        .worker(self.worker_id)
                        .run(run_id)
                        .with_payload(json!({ "status": report.status })),
                )
                .await;
        }

        self.ctx
            .store
            .record_attempt(AttemptRecord {
                task_id: task.id,
                run_id,
                worker_id: self.worker_id,
                attempt: task.attempt_count,
                status: report.status,
                notes: report.notes.clone(),
                artifacts: report.artifacts.clone(),
                error: report.error.clone(),
                duration: report.duration,
                started_at,
                finished_at: self.ctx.clock.now(),
                superseded,
            })
            .await
    }

    async fn announce(
        &self,
        task: &TaskRecord,
        run_id: RunId,
        next: TaskStatus,
        report: &ExecutionReport,
    ) {
        let kind = match next {
            TaskStatus::Completed => EventKind::TaskCompleted,
            TaskStatus::Blocked => EventKind::TaskBlocked,
            TaskStatus::Timeout => EventKind::TaskTimedOut,
            TaskStatus::Pending => EventKind::TaskDeferred,
            _ => EventKind::TaskFailed,
        };
        let duration_ms = report.duration.as_millis() as u64;
        match next {
            TaskStatus::Completed => {
                info!(task_id = %task.id, run_id = %run_id, duration_ms, "task completed")
            }
            TaskStatus::Pending => info!(
                task_id = %task.id,
                run_id = %run_id,
                error = report.error.as_deref().unwrap_or_default(),
                "task deferred, attempt refunded"
            ),
            _ => warn!(
                task_id = %task.id,
                run_id = %run_id,
                status = %next,
                duration_ms,
                error = report.error.as_deref().unwrap_or(&report.notes),
                "task did not complete"
            ),
        }
        let event = self
            .ctx
            .recorder
            .event(kind)
            .task(task.id)
            .worker(self.worker_id)
            .run(run_id)
            .with_payload(json!({
                "duration_ms": duration_ms,
                "notes": report.notes,
                "error": report.error,
            }));
        // No requeue follows a completion or a failure with no budget left.
        let finished = next == TaskStatus::Completed
            || (next == TaskStatus::Failed && task.attempts_exhausted());
        if finished {
            self.ctx.recorder.record_final(event).await;
        } else {
            self.ctx.recorder.record(event).await;
        }
    }
}

/// Resolves once `cancel` reads `true`; never when the sender is gone.
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    let closed = cancel.wait_for(|c| *c).await.is_err();
    if closed {
        std::future::pending::<()>().await;
    }
}

/// Drive one worker: heartbeat on an interval, run whatever arrives in
/// `assignments`, stop on shutdown or once the scheduler refuses our
/// heartbeat. The current run is always finished before exiting.
pub async fn worker_loop(
    worker: WorkerExecutor,
    queen: Arc<Queen>,
    mut assignments: mpsc::Receiver<Assignment>,
    mut shutdown: watch::Receiver<bool>,
) {
    let id = worker.id();
    let mut heartbeat = tokio::time::interval(worker.ctx.config.heartbeat_interval);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut lost = false;

    info!(worker_id = %id, "worker started");
    loop {
        if lost || *shutdown.borrow() {
            break;
        }
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = heartbeat.tick() => {
                lost = !send_heartbeat(&queen, id).await;
            }
            assignment = assignments.recv() => {
                let Some(assignment) = assignment else {
                    break;
                };
                let task_id = assignment.task_id;
                let run = worker.run(assignment);
                tokio::pin!(run);
                let result = loop {
                    tokio::select! {
                        result = &mut run => break result,
                        _ = heartbeat.tick() => {
                            lost |= !send_heartbeat(&queen, id).await;
                        }
                    }
                };
                if let Err(e) = result {
                    error!(worker_id = %id, task_id = %task_id, error = %e, "run failed");
                }
            }
        }
    }

    if let Err(e) = queen.deregister_worker(id).await {
        error!(worker_id = %id, error = %e, "deregistration failed");
    }
    info!(worker_id = %id, "worker stopped");
}

/// Keep `size` workers running until shutdown.
///
/// A worker whose heartbeat was refused (or that panicked) exits; a freshly
/// registered one takes its place. On shutdown every worker is joined.
pub async fn worker_pool(
    queen: Arc<Queen>,
    ctx: HiveContext,
    size: usize,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut workers = JoinSet::new();
    for _ in 0..size {
        spawn_worker(&mut workers, &queen, &ctx, &shutdown).await;
    }

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            Some(joined) = workers.join_next() => {
                if let Err(e) = joined {
                    error!(error = %e, "worker panicked");
                }
                if *shutdown.borrow() {
                    break;
                }
                warn!(workers = workers.len(), size, "worker exited, starting a replacement");
                spawn_worker(&mut workers, &queen, &ctx, &shutdown).await;
            }
        }
    }

    while let Some(joined) = workers.join_next().await {
        if let Err(e) = joined {
            error!(error = %e, "worker panicked");
        }
    }
}

async fn spawn_worker(
    workers: &mut JoinSet<()>,
    queen: &Arc<Queen>,
    ctx: &HiveContext,
    shutdown: &watch::Receiver<bool>,
) {
    let handle = queen.register_worker().await;
    let worker = WorkerExecutor::new(handle.id, ctx.clone());
    workers.spawn(worker_loop(
        worker,
        Arc::clone(queen),
        handle.assignments,
        shutdown.clone(),
    ));
}

async fn send_heartbeat(queen: &Queen, id: WorkerId) -> bool {
    match queen.heartbeat(id).await {
        Ok(()) => true,
        Err(e) => {
            warn!(worker_id = %id, error = %e, "heartbeat refused, worker stopping");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use ulid::Ulid;

    fn blank_record() -> TaskRecord {
        TaskRecord::from_new(
            crate::domain::NewTask {
                id: TaskId::from_ulid(Ulid::new()),
                key: "k".into(),
                title: "t".into(),
                description: String::new(),
                priority: 0,
                dependencies: Vec::new(),
                timeout: Duration::from_secs(10),
                max_attempts: 3,
                payload: crate::domain::TaskPayload::Custom {
                    executor: "x".into(),
                    data: serde_json::Value::Null,
                },
                created_at: chrono::Utc::now(),
            },
            0,
        )
    }

    #[rstest]
    #[case(Outcome::success("ok"), RunStatus::Completed, Some(TaskStatus::Completed))]
    #[case(Outcome::failure("bad"), RunStatus::Failed, Some(TaskStatus::Failed))]
    #[case(Outcome::blocked("wait"), RunStatus::Blocked, Some(TaskStatus::Blocked))]
    fn outcomes_map_to_statuses(
        #[case] outcome: Outcome,
        #[case] run: RunStatus,
        #[case] next: Option<TaskStatus>,
    ) {
        let report = ExecutionReport::from_outcome(outcome, Duration::from_millis(5));
        assert_eq!(report.status, run);
        assert_eq!(report.next_status(), next);
    }

    #[rstest]
    #[case(HiveError::AsyncTimeout { operation: "x".into(), timeout_duration: Duration::from_secs(1) }, true, RunStatus::TimedOut)]
    #[case(HiveError::Cancelled, true, RunStatus::Cancelled)]
    #[case(HiveError::execution("boom"), true, RunStatus::Failed)]
    #[case(HiveError::CircuitBreakerOpen { operation: "x".into() }, false, RunStatus::Deferred)]
    #[case(HiveError::CircuitBreakerOpen { operation: "x".into() }, true, RunStatus::Failed)]
    fn errors_map_to_statuses(
        #[case] error: HiveError,
        #[case] executor_ran: bool,
        #[case] run: RunStatus,
    ) {
        let report = ExecutionReport::from_error(&error, executor_ran, Duration::ZERO);
        assert_eq!(report.status, run);
        assert_eq!(report.error, Some(error.to_string()));
    }

    #[test]
    fn breaker_rejection_refunds_the_attempt() {
        let run = RunId::from_ulid(Ulid::new());
        let error = HiveError::CircuitBreakerOpen { operation: "x".into() };
        let report = ExecutionReport::from_error(&error, false, Duration::ZERO);
        assert_eq!(report.next_status(), Some(TaskStatus::Pending));

        let mut task = blank_record();
        task.status = TaskStatus::Running;
        task.attempt_count = 2;
        task.run_id = Some(run);
        report.patch(run).apply(&mut task);

        assert_eq!(task.attempt_count, 1);
        assert!(task.run_id.is_none());
        assert!(task.result.is_none());
        assert!(task.error.unwrap().contains("circuit breaker open"));
    }

    #[test]
    fn failure_outcome_keeps_result_and_error() {
        let run = RunId::from_ulid(Ulid::new());
        let report = ExecutionReport::from_outcome(Outcome::failure("tests red"), Duration::ZERO);
        let mut task = blank_record();
        task.status = TaskStatus::Failed;
        report.patch(run).apply(&mut task);

        let result = task.result.unwrap();
        assert_eq!(result.status, OutcomeKind::Failure);
        assert_eq!(result.run_id, run);
        assert_eq!(task.error.as_deref(), Some("tests red"));
    }

    #[test]
    fn executor_error_leaves_no_result() {
        let run = RunId::from_ulid(Ulid::new());
        let report = ExecutionReport::from_error(&HiveError::execution("spawn"), true, Duration::ZERO);
        let mut task = blank_record();
        report.patch(run).apply(&mut task);

        assert!(task.result.is_none());
        assert!(task.error.unwrap().contains("spawn"));
    }
}
