//! Core domain types: rooms, task modes, and watch-window timing.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Watch lead time in seconds, indexed by numeric room priority
/// (lower priority number = higher priority = longer lead).
///
/// Priorities beyond the table length fall back to [`MIN_LEAD_SECS`].
const LEAD_SECS: [u64; 10] = [600, 600, 600, 540, 480, 420, 360, 300, 240, 180];

/// Lead time floor for priorities past the end of [`LEAD_SECS`].
const MIN_LEAD_SECS: u64 = 120;

/// Lead time before a predicted start at which a room's task begins
/// actively polling for a live confirmation.
pub fn lead_time(priority: u32) -> Duration {
    let secs = LEAD_SECS
        .get(priority as usize)
        .copied()
        .unwrap_or(MIN_LEAD_SECS);
    Duration::from_secs(secs)
}

/// A trackable live-broadcast source.
///
/// Rooms are shared immutably (`Arc<Room>`) except for the `wanted`
/// flag, which the user may toggle while a task is running.
#[derive(Debug)]
pub struct Room {
    id: String,
    name: String,
    priority: u32,
    wanted: AtomicBool,
}

impl Room {
    pub fn new(id: impl Into<String>, name: impl Into<String>, priority: u32) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            priority,
            wanted: AtomicBool::new(false),
        }
    }

    pub fn wanted(id: impl Into<String>, name: impl Into<String>, priority: u32) -> Self {
        let room = Self::new(id, name, priority);
        room.set_wanted(true);
        room
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Numeric priority; lower is more important.
    pub fn priority(&self) -> u32 {
        self.priority
    }

    pub fn is_wanted(&self) -> bool {
        self.wanted.load(Ordering::Relaxed)
    }

    pub fn set_wanted(&self, wanted: bool) {
        self.wanted.store(wanted, Ordering::Relaxed);
    }
}

/// Resolves room identifiers to room metadata.
pub trait RoomDirectory: Send + Sync {
    fn lookup(&self, room_id: &str) -> Option<Arc<Room>>;

    fn contains(&self, room_id: &str) -> bool {
        self.lookup(room_id).is_some()
    }
}

/// State of a capture task.
///
/// `Scheduling → Watching → {Live | Download} → Quitting → {Expired | Completed}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskMode {
    /// Waiting for the watch window to open.
    Scheduling,
    /// Polling for a live confirmation inside the watch window.
    Watching,
    /// Room is live but not wanted; monitoring only.
    Live,
    /// Actively capturing via the process supervisor.
    Download,
    /// External stop requested; unwinding.
    Quitting,
    /// Terminal: the watch window closed without a live confirmation.
    Expired,
    /// Terminal: the broadcast ended (zero or more files captured).
    Completed,
}

impl TaskMode {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskMode::Expired | TaskMode::Completed)
    }
}

/// Named groups of task modes used by snapshot queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeGroup {
    /// `{Scheduling}`
    Upcoming,
    /// `{Watching, Live, Download}`
    Active,
    /// `{Live, Download}`
    LiveGroup,
    /// `{Expired, Completed}`
    Done,
}

impl ModeGroup {
    pub fn contains(self, mode: TaskMode) -> bool {
        match self {
            ModeGroup::Upcoming => mode == TaskMode::Scheduling,
            ModeGroup::Active => matches!(
                mode,
                TaskMode::Watching | TaskMode::Live | TaskMode::Download
            ),
            ModeGroup::LiveGroup => matches!(mode, TaskMode::Live | TaskMode::Download),
            ModeGroup::Done => mode.is_terminal(),
        }
    }
}

/// A single mode or a named group, accepted interchangeably by snapshot
/// queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeFilter {
    One(TaskMode),
    Group(ModeGroup),
}

impl ModeFilter {
    pub fn contains(self, mode: TaskMode) -> bool {
        match self {
            ModeFilter::One(m) => m == mode,
            ModeFilter::Group(g) => g.contains(mode),
        }
    }
}

impl From<TaskMode> for ModeFilter {
    fn from(mode: TaskMode) -> Self {
        ModeFilter::One(mode)
    }
}

impl From<ModeGroup> for ModeFilter {
    fn from(group: ModeGroup) -> Self {
        ModeFilter::Group(group)
    }
}

/// The interval `[start − lead, start + 2·lead]` during which a task
/// actively watches for its room to go live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchWindow {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

impl WatchWindow {
    pub fn new(scheduled_start: DateTime<Utc>, lead: Duration) -> Self {
        let lead = chrono::Duration::from_std(lead).unwrap_or_default();
        Self {
            start: scheduled_start - lead,
            end: scheduled_start + lead * 2,
        }
    }

    pub fn opens_at(&self) -> DateTime<Utc> {
        self.start
    }

    pub fn closes_at(&self) -> DateTime<Utc> {
        self.end
    }

    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        t >= self.start && t <= self.end
    }

    pub fn is_open(&self, now: DateTime<Utc>) -> bool {
        now >= self.start
    }

    pub fn is_past(&self, now: DateTime<Utc>) -> bool {
        now > self.end
    }

    /// Time remaining until the window opens, zero once open.
    pub fn until_open(&self, now: DateTime<Utc>) -> Duration {
        (self.start - now).to_std().unwrap_or(Duration::ZERO)
    }
}
