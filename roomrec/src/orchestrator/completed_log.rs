//! Append-only log of completed capture tasks.
//!
//! One JSON record per line per completed task; external reporting
//! tooling tails this file. Expired tasks (no capture ever occurred) are
//! not recorded.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use crate::Result;
use crate::watcher::TaskInfo;

/// One completed-task record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletedRecord {
    pub room_id: String,
    pub room_name: String,
    /// Live-confirmation instant, or the scheduled start when the task
    /// was stopped before confirmation.
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub files: Vec<PathBuf>,
}

impl From<&TaskInfo> for CompletedRecord {
    fn from(info: &TaskInfo) -> Self {
        Self {
            room_id: info.room_id.clone(),
            room_name: info.room_name.clone(),
            started_at: info.live_at.unwrap_or(info.start_time),
            ended_at: info.ended_at,
            files: info.output_files.clone(),
        }
    }
}

/// Writer for the completed-tasks log. With no path configured, appends
/// are dropped.
#[derive(Debug, Clone)]
pub struct CompletedLog {
    path: Option<PathBuf>,
}

impl CompletedLog {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self { path }
    }

    pub async fn append(&self, record: &CompletedRecord) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}
