//! Per-room capture tasks.

mod task;

pub use task::CaptureTask;

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::TaskMode;

/// Read-only snapshot of one capture task, for reporting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskInfo {
    pub room_id: String,
    pub room_name: String,
    pub priority: u32,
    pub mode: TaskMode,
    /// Scheduled start, reset to the confirmation instant once live.
    pub start_time: DateTime<Utc>,
    pub live_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub output_files: Vec<PathBuf>,
}
