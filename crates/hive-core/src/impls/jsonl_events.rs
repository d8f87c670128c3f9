//! Append-only JSON-lines event log.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::domain::{ExecutionEvent, HiveError};
use crate::ports::EventBus;

/// One event per line; lines are written whole under a mutex so concurrent
/// appends never interleave.
pub struct JsonlEventLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonlEventLog {
    /// Open (creating parents and the file if needed) in append mode.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, HiveError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Parse a log back into events; blank lines are skipped.
    pub async fn read_all(path: impl AsRef<Path>) -> Result<Vec<ExecutionEvent>, HiveError> {
        let content = tokio::fs::read_to_string(path).await?;
        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(HiveError::from))
            .collect()
    }
}

#[async_trait]
impl EventBus for JsonlEventLog {
    async fn append(&self, event: &ExecutionEvent) -> Result<(), HiveError> {
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');
        let mut file = self.file.lock().await;
        file.write_all(&line)
            .await
            .map_err(|e| HiveError::EventBus(format!("{}: {e}", self.path.display())))?;
        file.flush()
            .await
            .map_err(|e| HiveError::EventBus(format!("{}: {e}", self.path.display())))
    }
}
