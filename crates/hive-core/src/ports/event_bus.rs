//! EventBus port: append-only sink for [`ExecutionEvent`]s.

use async_trait::async_trait;

use crate::domain::{ExecutionEvent, HiveError};

/// Appends are concurrent; implementations must not reorder events from
/// a single caller.
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn append(&self, event: &ExecutionEvent) -> Result<(), HiveError>;
}
