//! In-memory task store.
//!
//! A single tokio mutex guards all records, so every `update_status` is an
//! atomic compare-and-swap.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::domain::{
    AttemptRecord, Expected, HiveError, NewTask, TaskId, TaskPatch, TaskRecord, TaskStatus,
};
use crate::ports::{Clock, DispatchOrder, SystemClock, TaskStore};

#[derive(Default)]
struct InMemoryStoreState {
    records: HashMap<TaskId, TaskRecord>,
    attempts: HashMap<TaskId, Vec<AttemptRecord>>,
    next_seq: u64,
}

impl InMemoryStoreState {
    fn allocate_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }
}

pub struct InMemoryTaskStore {
    state: Mutex<InMemoryStoreState>,
    clock: Arc<dyn Clock>,
}

impl InMemoryTaskStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(InMemoryStoreState::default()),
            clock,
        }
    }

    /// Number of stored tasks.
    pub async fn len(&self) -> usize {
        self.state.lock().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Default for InMemoryTaskStore {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn create_task(&self, task: NewTask) -> Result<TaskId, HiveError> {
        let mut state = self.state.lock().await;
        if state.records.contains_key(&task.id) {
            return Err(HiveError::Store(format!("task {} already exists", task.id)));
        }
        let seq = state.allocate_seq();
        let id = task.id;
        state.records.insert(id, TaskRecord::from_new(task, seq));
        Ok(id)
    }

    async fn get_task(&self, id: TaskId) -> Result<Option<TaskRecord>, HiveError> {
        Ok(self.state.lock().await.records.get(&id).cloned())
    }

    async fn update_status(
        &self,
        id: TaskId,
        expected: Expected,
        new_status: TaskStatus,
        patch: TaskPatch,
    ) -> Result<bool, HiveError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let record = state
            .records
            .get_mut(&id)
            .ok_or(HiveError::TaskNotFound(id))?;

        if !expected.matches(record) {
            return Ok(false);
        }
        if !record.status.can_transition_to(new_status) {
            return Err(HiveError::Store(format!(
                "illegal transition {} -> {} for task {id}",
                record.status, new_status
            )));
        }

        patch.apply(record);
        record.status = new_status;
        record.updated_at = now.max(record.updated_at);
        Ok(true)
    }

    async fn list_pending(&self, order: DispatchOrder) -> Result<Vec<TaskRecord>, HiveError> {
        let state = self.state.lock().await;
        let mut pending: Vec<TaskRecord> = state
            .records
            .values()
            .filter(|r| r.status == TaskStatus::Pending)
            .cloned()
            .collect();
        order.sort(&mut pending);
        Ok(pending)
    }

    async fn list_by_status(&self, statuses: &[TaskStatus]) -> Result<Vec<TaskRecord>, HiveError> {
        let state = self.state.lock().await;
        let mut matching: Vec<TaskRecord> = state
            .records
            .values()
            .filter(|r| statuses.contains(&r.status))
            .cloned()
            .collect();
        DispatchOrder::Submission.sort(&mut matching);
        Ok(matching)
    }

    async fn record_attempt(&self, attempt: AttemptRecord) -> Result<(), HiveError> {
        let mut state = self.state.lock().await;
        if !state.records.contains_key(&attempt.task_id) {
            return Err(HiveError::TaskNotFound(attempt.task_id));
        }
        let history = state.attempts.entry(attempt.task_id).or_default();
        // One record per (task, run); a rewrite replaces the earlier one.
        match history.iter_mut().find(|a| a.run_id == attempt.run_id) {
            Some(existing) => *existing = attempt,
            None => history.push(attempt),
        }
        Ok(())
    }

    async fn list_attempts(&self, task_id: TaskId) -> Result<Vec<AttemptRecord>, HiveError> {
        let state = self.state.lock().await;
        Ok(state.attempts.get(&task_id).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{
        CommandSpec, RunId, RunStatus, TaskPayload, TaskResult, WorkerId, OutcomeKind,
    };
    use crate::ports::ManualClock;
    use chrono::{DateTime, TimeZone, Utc};
    use std::time::Duration;
    use ulid::Ulid;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn new_task(priority: i32, created_at: DateTime<Utc>) -> NewTask {
        NewTask {
            id: TaskId::from_ulid(Ulid::new()),
            key: format!("p{priority}"),
            title: format!("priority {priority}"),
            description: String::new(),
            priority,
            dependencies: vec![],
            timeout: Duration::from_secs(5),
            max_attempts: 3,
            payload: TaskPayload::Command(CommandSpec::new("true")),
            created_at,
        }
    }

    fn store() -> (InMemoryTaskStore, ManualClock) {
        let clock = ManualClock::new(start());
        (InMemoryTaskStore::new(Arc::new(clock.clone())), clock)
    }

    #[tokio::test]
    async fn pending_tasks_are_listed_by_priority_then_age() {
        let (store, _) = store();
        let t0 = start();
        let low = store.create_task(new_task(20, t0)).await.unwrap();
        let high = store.create_task(new_task(90, t0)).await.unwrap();
        let mid_old = store.create_task(new_task(50, t0)).await.unwrap();
        let mid_new = store
            .create_task(new_task(50, t0 + chrono::Duration::seconds(1)))
            .await
            .unwrap();

        let ids: Vec<_> = store
            .list_pending(DispatchOrder::PriorityThenAge)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec![high, mid_old, mid_new, low]);

        let submitted: Vec<_> = store
            .list_pending(DispatchOrder::Submission)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(submitted, vec![low, high, mid_old, mid_new]);
    }

    #[tokio::test]
    async fn update_status_is_compare_and_swap() {
        let (store, clock) = store();
        let id = store.create_task(new_task(1, start())).await.unwrap();
        let worker = WorkerId::from_ulid(Ulid::new());
        let run = RunId::from_ulid(Ulid::new());

        clock.advance(chrono::Duration::seconds(3));
        let assigned = store
            .update_status(
                id,
                Expected::status(TaskStatus::Pending),
                TaskStatus::Assigned,
                TaskPatch::assign(worker, run, clock.now()),
            )
            .await
            .unwrap();
        assert!(assigned);

        // A second dispatcher racing on the same task loses.
        let again = store
            .update_status(
                id,
                Expected::status(TaskStatus::Pending),
                TaskStatus::Assigned,
                TaskPatch::default(),
            )
            .await
            .unwrap();
        assert!(!again);

        // A stale run id loses too.
        let stale = RunId::from_ulid(Ulid::new());
        let claimed = store
            .update_status(
                id,
                Expected::owned(TaskStatus::Assigned, stale),
                TaskStatus::Running,
                TaskPatch::default(),
            )
            .await
            .unwrap();
        assert!(!claimed);

        let record = store.get_task(id).await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Assigned);
        assert_eq!(record.attempt_count, 1);
        assert_eq!(record.run_id, Some(run));
        assert_eq!(record.updated_at, clock.now());
    }

    #[tokio::test]
    async fn illegal_edges_are_rejected() {
        let (store, _) = store();
        let id = store.create_task(new_task(1, start())).await.unwrap();
        let result = store
            .update_status(
                id,
                Expected::status(TaskStatus::Pending),
                TaskStatus::Completed,
                TaskPatch::default(),
            )
            .await;
        assert!(matches!(result, Err(HiveError::Store(_))));
    }

    #[tokio::test]
    async fn unknown_task_is_not_found() {
        let (store, _) = store();
        let missing = TaskId::from_ulid(Ulid::new());
        let result = store
            .update_status(
                missing,
                Expected::status(TaskStatus::Pending),
                TaskStatus::Assigned,
                TaskPatch::default(),
            )
            .await;
        assert!(matches!(result, Err(HiveError::TaskNotFound(id)) if id == missing));
    }

    #[tokio::test]
    async fn attempts_are_keyed_by_run() {
        let (store, clock) = store();
        let id = store.create_task(new_task(1, start())).await.unwrap();
        let run = RunId::from_ulid(Ulid::new());
        let attempt = |status: RunStatus| AttemptRecord {
            task_id: id,
            run_id: run,
            worker_id: WorkerId::from_ulid(Ulid::new()),
            attempt: 1,
            status,
            notes: String::new(),
            artifacts: vec![],
            error: None,
            duration: Duration::from_millis(5),
            started_at: clock.now(),
            finished_at: clock.now(),
            superseded: false,
        };

        store.record_attempt(attempt(RunStatus::Failed)).await.unwrap();
        store.record_attempt(attempt(RunStatus::Completed)).await.unwrap();

        let history = store.list_attempts(id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn list_by_status_filters() {
        let (store, clock) = store();
        let a = store.create_task(new_task(1, start())).await.unwrap();
        let b = store.create_task(new_task(2, start())).await.unwrap();
        let worker = WorkerId::from_ulid(Ulid::new());
        let run = RunId::from_ulid(Ulid::new());
        store
            .update_status(
                b,
                Expected::status(TaskStatus::Pending),
                TaskStatus::Assigned,
                TaskPatch::assign(worker, run, clock.now()),
            )
            .await
            .unwrap();
        store
            .update_status(
                b,
                Expected::owned(TaskStatus::Assigned, run),
                TaskStatus::Running,
                TaskPatch::default(),
            )
            .await
            .unwrap();
        store
            .update_status(
                b,
                Expected::owned(TaskStatus::Running, run),
                TaskStatus::Completed,
                TaskPatch::default().with_result(TaskResult {
                    run_id: run,
                    status: OutcomeKind::Success,
                    notes: "ok".into(),
                    artifacts: vec![],
                    duration: Duration::from_millis(1),
                }),
            )
            .await
            .unwrap();

        let done = store.list_by_status(&[TaskStatus::Completed]).await.unwrap();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].id, b);
        assert!(done[0].result.is_some());

        let pending = store.list_by_status(&[TaskStatus::Pending]).await.unwrap();
        assert_eq!(pending[0].id, a);
    }
}
