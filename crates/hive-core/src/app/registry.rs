use std::collections::HashMap;
use std::sync::Arc;

use crate::domain::{HiveError, TaskRecord};
use crate::ports::TaskExecutor;

/// Registry of executors (payload kind -> executor).
///
/// Built during initialization, then shared read-only behind an `Arc`, so
/// lookups need no lock.
#[derive(Default, Clone)]
pub struct ExecutorRegistry {
    executors: HashMap<String, Arc<dyn TaskExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self {
            executors: HashMap::new(),
        }
    }

    /// Register an executor for a payload kind. A kind can only be claimed once.
    pub fn register(
        &mut self,
        kind: impl Into<String>,
        executor: Arc<dyn TaskExecutor>,
    ) -> Result<(), HiveError> {
        let kind = kind.into();
        if self.executors.contains_key(&kind) {
            return Err(HiveError::DuplicateExecutor(kind));
        }
        self.executors.insert(kind, executor);
        Ok(())
    }

    pub fn get(&self, kind: &str) -> Option<&Arc<dyn TaskExecutor>> {
        self.executors.get(kind)
    }

    /// Executor for the task's payload kind.
    pub fn resolve(&self, task: &TaskRecord) -> Result<Arc<dyn TaskExecutor>, HiveError> {
        let kind = task.payload.kind();
        self.get(kind)
            .cloned()
            .ok_or_else(|| HiveError::ExecutorNotFound(kind.to_string()))
    }

    /// Registered kinds, sorted.
    pub fn registered_kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.executors.keys().cloned().collect();
        kinds.sort();
        kinds
    }

    pub fn len(&self) -> usize {
        self.executors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{NewTask, Outcome, TaskId, TaskPayload};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::path::Path;
    use std::time::Duration;
    use tokio::time::Instant;
    use ulid::Ulid;

    struct OkExecutor;

    #[async_trait]
    impl TaskExecutor for OkExecutor {
        async fn execute(
            &self,
            _task: &TaskRecord,
            _workdir: &Path,
            _deadline: Instant,
        ) -> Result<Outcome, HiveError> {
            Ok(Outcome::success("ok"))
        }
    }

    fn custom_task(executor: &str) -> TaskRecord {
        TaskRecord::from_new(
            NewTask {
                id: TaskId::from_ulid(Ulid::new()),
                key: "t".into(),
                title: "T".into(),
                description: String::new(),
                priority: 0,
                dependencies: vec![],
                timeout: Duration::from_secs(1),
                max_attempts: 1,
                payload: TaskPayload::Custom {
                    executor: executor.into(),
                    data: serde_json::json!({}),
                },
                created_at: Utc::now(),
            },
            0,
        )
    }

    #[tokio::test]
    async fn resolves_registered_executor() {
        let mut reg = ExecutorRegistry::new();
        reg.register("ok", Arc::new(OkExecutor)).unwrap();

        let task = custom_task("ok");
        let executor = reg.resolve(&task).unwrap();
        let outcome = executor
            .execute(&task, Path::new("."), Instant::now())
            .await
            .unwrap();
        assert!(outcome.is_success());
    }

    #[test]
    fn errors_when_executor_missing() {
        let reg = ExecutorRegistry::new();
        assert!(matches!(
            reg.resolve(&custom_task("missing")),
            Err(HiveError::ExecutorNotFound(kind)) if kind == "missing"
        ));
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut reg = ExecutorRegistry::new();
        reg.register("ok", Arc::new(OkExecutor)).unwrap();
        assert!(matches!(
            reg.register("ok", Arc::new(OkExecutor)),
            Err(HiveError::DuplicateExecutor(_))
        ));
        assert_eq!(reg.registered_kinds(), vec!["ok"]);
    }
}
