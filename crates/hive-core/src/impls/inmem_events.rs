//! In-memory event bus, mainly for tests and status inspection.

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::domain::{EventKind, ExecutionEvent, HiveError, TaskId};
use crate::ports::EventBus;

#[derive(Default)]
pub struct InMemoryEventBus {
    events: Mutex<Vec<ExecutionEvent>>,
}

impl InMemoryEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// All events in append order.
    pub async fn events(&self) -> Vec<ExecutionEvent> {
        self.events.lock().await.clone()
    }

    pub async fn events_for(&self, task: TaskId) -> Vec<ExecutionEvent> {
        self.events
            .lock()
            .await
            .iter()
            .filter(|e| e.task_id == Some(task))
            .cloned()
            .collect()
    }

    pub async fn kinds_for(&self, task: TaskId) -> Vec<EventKind> {
        self.events_for(task).await.into_iter().map(|e| e.kind).collect()
    }

    pub async fn count(&self, kind: EventKind) -> usize {
        self.events
            .lock()
            .await
            .iter()
            .filter(|e| e.kind == kind)
            .count()
    }
}

#[async_trait]
impl EventBus for InMemoryEventBus {
    async fn append(&self, event: &ExecutionEvent) -> Result<(), HiveError> {
        self.events.lock().await.push(event.clone());
        Ok(())
    }
}
