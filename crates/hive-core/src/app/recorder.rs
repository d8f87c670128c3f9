//! Stamps and appends execution events.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::warn;

use crate::domain::{EventKind, ExecutionEvent, TaskId};
use crate::ports::{Clock, EventBus};

/// Front of the event bus used by the scheduler and workers.
///
/// - timestamps come from the injected clock
/// - a task's events never go back in time, even when the clock does or two
///   writers race
/// - bus failures are logged, not propagated
pub struct EventRecorder {
    bus: Arc<dyn EventBus>,
    clock: Arc<dyn Clock>,
    last_by_task: Mutex<HashMap<TaskId, DateTime<Utc>>>,
}

impl EventRecorder {
    pub fn new(bus: Arc<dyn EventBus>, clock: Arc<dyn Clock>) -> Self {
        Self {
            bus,
            clock,
            last_by_task: Mutex::new(HashMap::new()),
        }
    }

    /// A new event stamped with the current time.
    pub fn event(&self, kind: EventKind) -> ExecutionEvent {
        ExecutionEvent::new(kind, self.clock.now())
    }

    pub async fn record(&self, event: ExecutionEvent) {
        self.append(event, false).await;
    }

    /// Record the event that ends a task's lifecycle and stop tracking it.
    pub async fn record_final(&self, event: ExecutionEvent) {
        self.append(event, true).await;
    }

    async fn append(&self, mut event: ExecutionEvent, last_for_task: bool) {
        // Held across the append so per-task order in the log matches the
        // stamped order.
        let mut last_by_task = self.last_by_task.lock().await;
        if let Some(task) = event.task_id {
            let last = last_by_task.entry(task).or_insert(event.timestamp);
            if event.timestamp < *last {
                event.timestamp = *last;
            }
            *last = event.timestamp;
            if last_for_task {
                last_by_task.remove(&task);
            }
        }

        if let Err(e) = self.bus.append(&event).await {
            warn!(kind = ?event.kind, error = %e, "failed to append execution event");
        }
    }
}
