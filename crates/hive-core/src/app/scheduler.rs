//! The scheduler ("queen").
//!
//! One `tick` runs the whole control loop under the scheduler lock:
//!
//! 1. reconcile: forget assignments whose task has left ASSIGNED/RUNNING
//! 2. timeouts: RUNNING tasks past their deadline move to TIMEOUT
//! 3. liveness: workers with stale heartbeats are marked unavailable and
//!    their task is reclaimed; long-unavailable workers are removed
//! 4. requeue: FAILED/TIMEOUT tasks go back to PENDING or, when the decider
//!    gives up, to FAILED with the attempt budget marked spent
//! 5. dispatch: eligible PENDING tasks go to idle workers, highest priority
//!    first; kinds whose circuit breaker is failing fast wait
//!
//! Every status change goes through the store's compare-and-swap, so a
//! worker reporting late can never overwrite a decision made here.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use rand::Rng;
use serde::Serialize;
use serde_json::json;
use tokio::sync::{Mutex, mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::app::context::HiveContext;
use crate::app::status::{StatusSnapshot, TaskCounts};
use crate::domain::{
    Decision, EventKind, Expected, HiveError, NewTask, RunId, TaskId, TaskPatch, TaskRecord,
    TaskSpec, TaskStatus, WorkerId, WorkerRecord, WorkerStatus,
};
use crate::graph::resolve_order;
use crate::ports::DispatchOrder;

const ASSIGNMENT_BUFFER: usize = 4;

/// A task handed to a worker.
#[derive(Debug)]
pub struct Assignment {
    pub task_id: TaskId,
    pub run_id: RunId,

    /// Flips to `true` when the scheduler revokes the run.
    pub cancel: watch::Receiver<bool>,
}

/// Returned by `register_worker`: the worker's id and its assignment inbox.
#[derive(Debug)]
pub struct WorkerHandle {
    pub id: WorkerId,
    pub assignments: mpsc::Receiver<Assignment>,
}

/// What one tick changed.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TickReport {
    pub timed_out: Vec<TaskId>,
    pub orphaned: Vec<TaskId>,
    pub requeued: Vec<TaskId>,
    pub failed: Vec<TaskId>,
    pub dispatched: Vec<TaskId>,
    pub workers_lost: Vec<WorkerId>,
    pub workers_removed: Vec<WorkerId>,
}

impl TickReport {
    pub fn is_empty(&self) -> bool {
        self.timed_out.is_empty()
            && self.orphaned.is_empty()
            && self.requeued.is_empty()
            && self.failed.is_empty()
            && self.dispatched.is_empty()
            && self.workers_lost.is_empty()
            && self.workers_removed.is_empty()
    }
}

struct WorkerSlot {
    record: WorkerRecord,
    seq: u64,
    sender: mpsc::Sender<Assignment>,
}

struct InFlight {
    worker: WorkerId,
    run_id: RunId,
    cancel: watch::Sender<bool>,
}

#[derive(Default)]
struct SchedulerState {
    workers: HashMap<WorkerId, WorkerSlot>,
    inflight: HashMap<TaskId, InFlight>,
    next_worker_seq: u64,
}

impl SchedulerState {
    /// Drop the in-flight entry of `(task, run)` and free its worker.
    fn release(&mut self, task: TaskId, run: RunId, cancel: bool) {
        let Some(flight) = self.inflight.get(&task) else {
            return;
        };
        if flight.run_id != run {
            return;
        }
        if let Some(flight) = self.inflight.remove(&task) {
            if cancel {
                let _ = flight.cancel.send(true);
            }
            if let Some(slot) = self.workers.get_mut(&flight.worker)
                && slot.record.current_run == Some(run)
            {
                slot.record.release();
            }
        }
    }
}

pub struct Queen {
    ctx: HiveContext,
    state: Mutex<SchedulerState>,
}

impl Queen {
    pub fn new(ctx: HiveContext) -> Self {
        Self {
            ctx,
            state: Mutex::new(SchedulerState::default()),
        }
    }

    pub fn context(&self) -> &HiveContext {
        &self.ctx
    }

    // ------------------------------------------------------------------
    // Workers
    // ------------------------------------------------------------------

    pub async fn register_worker(&self) -> WorkerHandle {
        let id = self.ctx.ids.generate_worker_id();
        let now = self.ctx.clock.now();
        let (sender, assignments) = mpsc::channel(ASSIGNMENT_BUFFER);

        {
            let mut state = self.state.lock().await;
            let seq = state.next_worker_seq;
            state.next_worker_seq += 1;
            state.workers.insert(
                id,
                WorkerSlot {
                    record: WorkerRecord::new(id, now),
                    seq,
                    sender,
                },
            );
        }

        info!(worker_id = %id, "worker registered");
        self.ctx
            .recorder
            .record(self.ctx.recorder.event(EventKind::WorkerRegistered).worker(id))
            .await;

        WorkerHandle { id, assignments }
    }

    /// Refresh a worker's liveness. Unknown and unavailable workers are
    /// refused; they have to register again.
    pub async fn heartbeat(&self, worker: WorkerId) -> Result<(), HiveError> {
        let now = self.ctx.clock.now();
        let mut state = self.state.lock().await;
        match state.workers.get_mut(&worker) {
            Some(slot) if slot.record.status == WorkerStatus::Active => {
                slot.record.last_heartbeat = slot.record.last_heartbeat.max(now);
                Ok(())
            }
            _ => Err(HiveError::WorkerUnavailable(worker)),
        }
    }

    /// Remove a worker, reclaiming any task it still holds.
    pub async fn deregister_worker(&self, worker: WorkerId) -> Result<(), HiveError> {
        let mut state = self.state.lock().await;
        let Some(slot) = state.workers.remove(&worker) else {
            return Ok(());
        };

        if let (Some(task), Some(run)) = (slot.record.current_task, slot.record.current_run) {
            let mut report = TickReport::default();
            self.reclaim(&mut state, task, run, worker, "worker deregistered", &mut report)
                .await?;
        }

        info!(worker_id = %worker, "worker deregistered");
        self.ctx
            .recorder
            .record(self.ctx.recorder.event(EventKind::WorkerRemoved).worker(worker))
            .await;
        Ok(())
    }

    pub async fn workers(&self) -> Vec<WorkerRecord> {
        let state = self.state.lock().await;
        let mut slots: Vec<&WorkerSlot> = state.workers.values().collect();
        slots.sort_by_key(|s| s.seq);
        slots.into_iter().map(|s| s.record.clone()).collect()
    }

    // ------------------------------------------------------------------
    // Tasks
    // ------------------------------------------------------------------

    /// Validate and persist a batch of task specs.
    ///
    /// The whole batch is checked (fields, timeout ceiling, executor kinds,
    /// dependency references, cycles) before anything is stored. Ids are
    /// returned in input order.
    pub async fn submit(&self, batch: Vec<TaskSpec>) -> Result<Vec<TaskId>, HiveError> {
        let max_timeout = self.ctx.config.timeouts.max_timeout;
        for spec in &batch {
            spec.validate()?;
            if let Some(timeout) = spec.timeout.filter(|t| *t > max_timeout) {
                return Err(HiveError::InvalidTask {
                    key: spec.key.clone(),
                    reason: format!(
                        "timeout {:.1}s exceeds max_timeout {:.1}s",
                        timeout.as_secs_f64(),
                        max_timeout.as_secs_f64()
                    ),
                });
            }
            let kind = spec.payload.kind();
            if self.ctx.executors.get(kind).is_none() {
                return Err(HiveError::ExecutorNotFound(kind.to_string()));
            }
        }
        let order = resolve_order(&batch)?;

        let ids: HashMap<&str, TaskId> = batch
            .iter()
            .map(|spec| (spec.key.as_str(), self.ctx.ids.generate_task_id()))
            .collect();
        let by_key: HashMap<&str, &TaskSpec> =
            batch.iter().map(|spec| (spec.key.as_str(), spec)).collect();

        let now = self.ctx.clock.now();
        for key in &order {
            let (Some(spec), Some(&id)) = (by_key.get(key.as_str()), ids.get(key.as_str())) else {
                continue;
            };
            let dependencies: Vec<TaskId> = spec
                .depends_on
                .iter()
                .filter_map(|dep| ids.get(dep.as_str()).copied())
                .collect();
            let timeout = spec
                .timeout
                .unwrap_or_else(|| self.ctx.timeouts.current_timeout(spec.payload.kind()));

            self.ctx
                .store
                .create_task(NewTask {
                    id,
                    key: spec.key.clone(),
                    title: spec.title.clone(),
                    description: spec.description.clone(),
                    priority: spec.priority,
                    dependencies: dependencies.clone(),
                    timeout,
                    max_attempts: spec
                        .max_attempts
                        .unwrap_or(self.ctx.config.max_attempts_per_task),
                    payload: spec.payload.clone(),
                    created_at: now,
                })
                .await?;

            debug!(task_id = %id, key = %spec.key, priority = spec.priority, "task created");
            self.ctx
                .recorder
                .record(
                    self.ctx
                        .recorder
                        .event(EventKind::TaskSubmitted)
                        .task(id)
                        .with_payload(json!({
                            "key": spec.key,
                            "priority": spec.priority,
                            "dependencies": dependencies.len(),
                            "timeout_secs": timeout.as_secs_f64(),
                        })),
                )
                .await;
        }

        info!(tasks = batch.len(), "task batch submitted");
        Ok(batch
            .iter()
            .filter_map(|spec| ids.get(spec.key.as_str()).copied())
            .collect())
    }

    /// Cancel a task that has not finished. A running attempt is told to
    /// stop; its late result is discarded.
    pub async fn cancel(&self, id: TaskId) -> Result<(), HiveError> {
        let mut state = self.state.lock().await;
        loop {
            let task = self
                .ctx
                .store
                .get_task(id)
                .await?
                .ok_or(HiveError::TaskNotFound(id))?;
            if task.is_terminal() {
                return Err(HiveError::InvalidTransition {
                    task: id,
                    status: task.status,
                    action: "cancelled",
                });
            }

            let expected = match task.run_id {
                Some(run) if task.status.is_owned() => Expected::owned(task.status, run),
                _ => Expected::status(task.status),
            };
            let patch = TaskPatch::revoke().with_error("cancelled by request");
            if !self
                .ctx
                .store
                .update_status(id, expected, TaskStatus::Cancelled, patch)
                .await?
            {
                continue;
            }

            if let Some(run) = task.run_id {
                state.release(id, run, true);
            }
            info!(task_id = %id, from = %task.status, "task cancelled");
            self.ctx
                .recorder
                .record_final(
                    self.ctx
                        .recorder
                        .event(EventKind::TaskCancelled)
                        .task(id)
                        .with_payload(json!({ "from": task.status })),
                )
                .await;
            return Ok(());
        }
    }

    /// Put a BLOCKED task back in the queue.
    pub async fn unblock(&self, id: TaskId) -> Result<(), HiveError> {
        let task = self
            .ctx
            .store
            .get_task(id)
            .await?
            .ok_or(HiveError::TaskNotFound(id))?;

        let moved = task.status == TaskStatus::Blocked
            && self
                .ctx
                .store
                .update_status(
                    id,
                    Expected::status(TaskStatus::Blocked),
                    TaskStatus::Pending,
                    TaskPatch::release(),
                )
                .await?;
        if !moved {
            let status = self
                .ctx
                .store
                .get_task(id)
                .await?
                .map_or(task.status, |t| t.status);
            return Err(HiveError::InvalidTransition {
                task: id,
                status,
                action: "unblocked",
            });
        }

        info!(task_id = %id, "task unblocked");
        self.ctx
            .recorder
            .record(self.ctx.recorder.event(EventKind::TaskUnblocked).task(id))
            .await;
        Ok(())
    }

    pub async fn status(&self) -> Result<StatusSnapshot, HiveError> {
        let tasks = self.ctx.store.list_by_status(&TaskStatus::ALL).await?;
        Ok(StatusSnapshot {
            tasks: tasks.iter().map(|t| t.status).collect::<TaskCounts>(),
            settled: is_settled(&tasks),
            workers: self.workers().await,
            breakers: self.ctx.breakers.statuses(),
            timeouts: self.ctx.timeouts.get_recommendations(),
        })
    }

    // ------------------------------------------------------------------
    // Control loop
    // ------------------------------------------------------------------

    pub async fn tick(&self) -> Result<TickReport, HiveError> {
        let mut state = self.state.lock().await;
        let now = self.ctx.clock.now();
        let mut report = TickReport::default();

        self.reconcile(&mut state).await?;
        self.detect_timeouts(&mut state, now, &mut report).await?;
        self.detect_dead_workers(&mut state, now, &mut report).await?;
        self.requeue(&mut report).await?;
        self.dispatch(&mut state, now, &mut report).await?;

        if !report.is_empty() {
            debug!(
                dispatched = report.dispatched.len(),
                requeued = report.requeued.len(),
                timed_out = report.timed_out.len(),
                orphaned = report.orphaned.len(),
                "tick"
            );
        }
        Ok(report)
    }

    /// Tick until `shutdown` flips, sleeping the poll interval plus jitter
    /// between ticks.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            poll_ms = self.ctx.config.poll_interval.as_millis() as u64,
            max_concurrent_workers = self.ctx.config.max_concurrent_workers,
            "scheduler started"
        );
        loop {
            if *shutdown.borrow() {
                break;
            }
            if let Err(e) = self.tick().await {
                error!(error = %e, "scheduler tick failed");
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tokio::time::sleep(self.next_poll_delay()) => {}
            }
        }
        info!("scheduler stopped");
    }

    fn next_poll_delay(&self) -> Duration {
        let config = &self.ctx.config;
        if config.poll_jitter.is_zero() {
            return config.poll_interval;
        }
        let factor: f64 = rand::thread_rng().gen_range(0.0..=1.0);
        config.poll_interval + config.poll_jitter.mul_f64(factor)
    }

    async fn reconcile(&self, state: &mut SchedulerState) -> Result<(), HiveError> {
        let flights: Vec<(TaskId, RunId)> = state
            .inflight
            .iter()
            .map(|(task, flight)| (*task, flight.run_id))
            .collect();

        for (task_id, run) in flights {
            let still_owned = self
                .ctx
                .store
                .get_task(task_id)
                .await?
                .is_some_and(|t| t.status.is_owned() && t.run_id == Some(run));
            if !still_owned {
                state.release(task_id, run, false);
            }
        }
        Ok(())
    }

    async fn detect_timeouts(
        &self,
        state: &mut SchedulerState,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) -> Result<(), HiveError> {
        for task in self.ctx.store.list_by_status(&[TaskStatus::Running]).await? {
            if !task.is_overdue(now) {
                continue;
            }
            let Some(run) = task.run_id else {
                continue;
            };

            let patch = TaskPatch::revoke()
                .with_error(format!("timed out after {:.1}s", task.timeout.as_secs_f64()));
            if !self
                .ctx
                .store
                .update_status(
                    task.id,
                    Expected::owned(TaskStatus::Running, run),
                    TaskStatus::Timeout,
                    patch,
                )
                .await?
            {
                continue;
            }

            state.release(task.id, run, true);
            warn!(
                task_id = %task.id,
                run_id = %run,
                timeout_secs = task.timeout.as_secs_f64(),
                "task timed out"
            );

            let mut event = self
                .ctx
                .recorder
                .event(EventKind::TaskTimedOut)
                .task(task.id)
                .run(run)
                .with_payload(json!({ "timeout_secs": task.timeout.as_secs_f64() }));
            if let Some(worker) = task.assigned_worker {
                event = event.worker(worker);
            }
            self.ctx.recorder.record(event).await;
            report.timed_out.push(task.id);
        }
        Ok(())
    }

    async fn detect_dead_workers(
        &self,
        state: &mut SchedulerState,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) -> Result<(), HiveError> {
        let window =
            TimeDelta::from_std(self.ctx.config.heartbeat_window).unwrap_or(TimeDelta::MAX);

        let mut lost = Vec::new();
        let mut removable = Vec::new();
        for (id, slot) in state.workers.iter_mut() {
            match slot.record.status {
                WorkerStatus::Active if slot.record.heartbeat_expired(now, window) => {
                    slot.record.status = WorkerStatus::Unavailable;
                    slot.record.unavailable_since = Some(now);
                    lost.push((*id, slot.record.current_task.zip(slot.record.current_run)));
                }
                WorkerStatus::Unavailable
                    if slot
                        .record
                        .unavailable_since
                        .is_some_and(|since| now - since > window) =>
                {
                    removable.push(*id);
                }
                _ => {}
            }
        }

        for (worker, held) in lost {
            warn!(worker_id = %worker, "worker heartbeat lost, marking unavailable");
            self.ctx
                .recorder
                .record(
                    self.ctx
                        .recorder
                        .event(EventKind::WorkerUnavailable)
                        .worker(worker),
                )
                .await;
            report.workers_lost.push(worker);

            if let Some((task, run)) = held {
                self.reclaim(state, task, run, worker, "worker heartbeat lost", report)
                    .await?;
            }
        }

        for worker in removable {
            state.workers.remove(&worker);
            info!(worker_id = %worker, "unavailable worker removed");
            self.ctx
                .recorder
                .record(self.ctx.recorder.event(EventKind::WorkerRemoved).worker(worker))
                .await;
            report.workers_removed.push(worker);
        }
        Ok(())
    }

    /// Take `(task, run)` away from `worker`: back to PENDING while the task
    /// has attempts left, FAILED otherwise.
    async fn reclaim(
        &self,
        state: &mut SchedulerState,
        task_id: TaskId,
        run: RunId,
        worker: WorkerId,
        reason: &str,
        report: &mut TickReport,
    ) -> Result<(), HiveError> {
        state.release(task_id, run, true);

        let Some(task) = self.ctx.store.get_task(task_id).await? else {
            return Ok(());
        };
        if !task.status.is_owned() || task.run_id != Some(run) {
            return Ok(());
        }

        let decision = self.ctx.decider.decide(&task);
        let (next, patch) = match decision {
            Decision::Requeue { .. } => (TaskStatus::Pending, TaskPatch::release()),
            Decision::GiveUp { .. } => (TaskStatus::Failed, TaskPatch::revoke().exhausted()),
        };
        let patch = patch.with_error(format!("{reason} ({worker})"));
        if !self
            .ctx
            .store
            .update_status(task_id, Expected::owned(task.status, run), next, patch)
            .await?
        {
            return Ok(());
        }

        warn!(
            task_id = %task_id,
            worker_id = %worker,
            run_id = %run,
            next = %next,
            reason,
            "task orphaned"
        );
        self.ctx
            .recorder
            .record(
                self.ctx
                    .recorder
                    .event(EventKind::TaskOrphaned)
                    .task(task_id)
                    .worker(worker)
                    .run(run)
                    .with_payload(json!({ "reason": reason, "from": task.status })),
            )
            .await;
        report.orphaned.push(task_id);
        self.record_decision(task_id, &decision, report).await;
        Ok(())
    }

    async fn requeue(&self, report: &mut TickReport) -> Result<(), HiveError> {
        let candidates = self
            .ctx
            .store
            .list_by_status(&[TaskStatus::Failed, TaskStatus::Timeout])
            .await?;

        for task in candidates {
            if task.is_terminal() {
                continue;
            }
            let decision = self.ctx.decider.decide(&task);
            let (next, patch) = match decision {
                Decision::Requeue { .. } => (TaskStatus::Pending, TaskPatch::release()),
                Decision::GiveUp { .. } => (TaskStatus::Failed, TaskPatch::revoke().exhausted()),
            };
            if !self
                .ctx
                .store
                .update_status(task.id, Expected::status(task.status), next, patch)
                .await?
            {
                continue;
            }
            self.record_decision(task.id, &decision, report).await;
        }
        Ok(())
    }

    async fn record_decision(&self, task: TaskId, decision: &Decision, report: &mut TickReport) {
        let kind = match decision {
            Decision::Requeue { .. } => {
                info!(task_id = %task, reason = decision.reason(), "task requeued");
                report.requeued.push(task);
                EventKind::TaskRequeued
            }
            Decision::GiveUp { .. } => {
                warn!(task_id = %task, reason = decision.reason(), "task failed permanently");
                report.failed.push(task);
                EventKind::TaskFailed
            }
        };
        let event = self
            .ctx
            .recorder
            .event(kind)
            .task(task)
            .with_payload(json!({ "reason": decision.reason() }));
        match decision {
            Decision::Requeue { .. } => self.ctx.recorder.record(event).await,
            Decision::GiveUp { .. } => self.ctx.recorder.record_final(event).await,
        }
    }

    async fn dispatch(
        &self,
        state: &mut SchedulerState,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) -> Result<(), HiveError> {
        let capacity = self
            .ctx
            .config
            .max_concurrent_workers
            .saturating_sub(state.inflight.len());
        if capacity == 0 {
            return Ok(());
        }

        let mut idle: Vec<(u64, WorkerId)> = state
            .workers
            .iter()
            .filter(|(_, slot)| slot.record.is_idle() && !slot.sender.is_closed())
            .map(|(id, slot)| (slot.seq, *id))
            .collect();
        if idle.is_empty() {
            return Ok(());
        }
        idle.sort_unstable();

        let pending = self
            .ctx
            .store
            .list_pending(DispatchOrder::PriorityThenAge)
            .await?;
        if pending.is_empty() {
            return Ok(());
        }
        let completed: HashSet<TaskId> = self
            .ctx
            .store
            .list_by_status(&[TaskStatus::Completed])
            .await?
            .into_iter()
            .map(|t| t.id)
            .collect();

        let mut idle = idle.into_iter().take(capacity).peekable();
        for task in pending {
            if !task.dependencies.iter().all(|dep| completed.contains(dep)) {
                continue;
            }
            // Held back until the kind's breaker admits calls again.
            if self.ctx.breakers.rejects(task.payload.kind()) {
                continue;
            }
            let Some(&(_, worker)) = idle.peek() else {
                break;
            };

            let run = self.ctx.ids.generate_run_id();
            if !self
                .ctx
                .store
                .update_status(
                    task.id,
                    Expected::status(TaskStatus::Pending),
                    TaskStatus::Assigned,
                    TaskPatch::assign(worker, run, now),
                )
                .await?
            {
                continue;
            }
            idle.next();
            self.hand_over(state, &task, worker, run).await;
            report.dispatched.push(task.id);
        }
        Ok(())
    }

    async fn hand_over(
        &self,
        state: &mut SchedulerState,
        task: &TaskRecord,
        worker: WorkerId,
        run: RunId,
    ) {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        state.inflight.insert(
            task.id,
            InFlight {
                worker,
                run_id: run,
                cancel: cancel_tx,
            },
        );

        if let Some(slot) = state.workers.get_mut(&worker) {
            slot.record.current_task = Some(task.id);
            slot.record.current_run = Some(run);
            let sent = slot.sender.try_send(Assignment {
                task_id: task.id,
                run_id: run,
                cancel: cancel_rx,
            });
            if let Err(e) = sent {
                // Reclaimed once the worker's heartbeat lapses.
                warn!(task_id = %task.id, worker_id = %worker, error = %e, "assignment not delivered");
            }
        }

        let attempt = task.attempt_count + 1;
        info!(
            task_id = %task.id,
            worker_id = %worker,
            run_id = %run,
            priority = task.priority,
            attempt,
            "task assigned"
        );
        self.ctx
            .recorder
            .record(
                self.ctx
                    .recorder
                    .event(EventKind::TaskAssigned)
                    .task(task.id)
                    .worker(worker)
                    .run(run)
                    .with_payload(json!({ "attempt": attempt, "priority": task.priority })),
            )
            .await;
    }
}

/// True when no task can move without outside action: every task is
/// terminal or BLOCKED, or PENDING behind a dependency that will never
/// complete.
pub fn is_settled(tasks: &[TaskRecord]) -> bool {
    let mut stuck: HashSet<TaskId> = tasks
        .iter()
        .filter(|t| {
            t.status == TaskStatus::Blocked || (t.is_terminal() && t.status != TaskStatus::Completed)
        })
        .map(|t| t.id)
        .collect();

    loop {
        let before = stuck.len();
        for task in tasks {
            if task.status == TaskStatus::Pending
                && !stuck.contains(&task.id)
                && task.dependencies.iter().any(|dep| stuck.contains(dep))
            {
                stuck.insert(task.id);
            }
        }
        if stuck.len() == before {
            break;
        }
    }

    tasks
        .iter()
        .all(|t| t.is_terminal() || stuck.contains(&t.id))
}
