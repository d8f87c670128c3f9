#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use hive_core::app::{Assignment, Hive, HiveBuilder, WorkerHandle};
use hive_core::config::HiveConfig;
use hive_core::domain::{
    Decider, HiveError, Outcome, TaskId, TaskPayload, TaskRecord, TaskSpec, TaskStatus,
};
use hive_core::impls::InMemoryEventBus;
use hive_core::ports::{ManualClock, TaskExecutor};
use serde_json::json;
use tempfile::TempDir;
use tokio::time::Instant;

pub const SCRIPT: &str = "script";

/// Executor driven by the task's `data`:
/// - `result`: "success" (default), "failure" or "blocked"
/// - `sleep_secs`: tokio sleep before answering
/// - `hang_first`: never answer on the first attempt
/// - `error`: return an executor error instead of an outcome
pub struct ScriptExecutor;

#[async_trait]
impl TaskExecutor for ScriptExecutor {
    async fn execute(
        &self,
        task: &TaskRecord,
        _workdir: &Path,
        _deadline: Instant,
    ) -> Result<Outcome, HiveError> {
        let TaskPayload::Custom { data, .. } = &task.payload else {
            return Err(HiveError::fatal_execution("not a script task"));
        };
        if data["hang_first"].as_bool() == Some(true) && task.attempt_count == 1 {
            std::future::pending::<()>().await;
        }
        if data["error"].as_bool() == Some(true) {
            return Err(HiveError::execution("script crashed"));
        }
        if let Some(secs) = data["sleep_secs"].as_f64() {
            tokio::time::sleep(Duration::from_secs_f64(secs)).await;
        }
        Ok(match data["result"].as_str().unwrap_or("success") {
            "failure" => Outcome::failure("script failed"),
            "blocked" => Outcome::blocked("needs a human"),
            _ => Outcome::success("script done"),
        })
    }
}

pub fn script(key: &str, data: serde_json::Value) -> TaskSpec {
    TaskSpec::new(
        key,
        format!("task {key}"),
        TaskPayload::Custom {
            executor: SCRIPT.to_string(),
            data,
        },
    )
}

pub fn ok(key: &str) -> TaskSpec {
    script(key, json!({}))
}

pub struct Harness {
    pub hive: Hive,
    pub clock: ManualClock,
    pub events: Arc<InMemoryEventBus>,
    _workdir: TempDir,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(HiveConfig::default())
    }

    pub fn with_config(config: HiveConfig) -> Self {
        Self::build(config, None)
    }

    pub fn with_decider(decider: Arc<dyn Decider>) -> Self {
        Self::build(HiveConfig::default(), Some(decider))
    }

    fn build(mut config: HiveConfig, decider: Option<Arc<dyn Decider>>) -> Self {
        let workdir = tempfile::tempdir().unwrap();
        config.work_root = workdir.path().join("work");
        config.poll_jitter = Duration::ZERO;

        let clock = ManualClock::new(Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap());
        let events = Arc::new(InMemoryEventBus::new());
        let mut builder = HiveBuilder::new(config)
            .with_clock(Arc::new(clock.clone()))
            .with_event_bus(events.clone())
            .register_executor(SCRIPT, Arc::new(ScriptExecutor))
            .unwrap();
        if let Some(decider) = decider {
            builder = builder.with_decider(decider);
        }
        let hive = builder.build().unwrap();

        Self {
            hive,
            clock,
            events,
            _workdir: workdir,
        }
    }

    pub async fn task(&self, id: TaskId) -> TaskRecord {
        self.hive
            .context()
            .store
            .get_task(id)
            .await
            .unwrap()
            .unwrap()
    }

    pub async fn status_of(&self, id: TaskId) -> TaskStatus {
        self.task(id).await.status
    }

    /// Yield to spawned runs until `id` reaches `status`.
    pub async fn wait_for_status(&self, id: TaskId, status: TaskStatus) {
        for _ in 0..1000 {
            if self.status_of(id).await == status {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("task {id} never reached {status}");
    }

    pub fn advance_secs(&self, secs: i64) {
        self.clock.advance(chrono::Duration::seconds(secs));
    }
}

pub fn take_assignment(worker: &mut WorkerHandle) -> Assignment {
    worker
        .assignments
        .try_recv()
        .expect("worker should have an assignment")
}
