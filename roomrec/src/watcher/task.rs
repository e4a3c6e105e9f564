//! The per-room capture state machine.
//!
//! One task per room, driven to completion by a single owning worker:
//!
//! `scheduling → watching → {live | download} → quitting → {expired | completed}`
//!
//! All mutable task state sits behind one short-lived lock. The worker
//! never holds it across network or process I/O, and every transition is
//! a compare-and-set against the expected current mode, so an external
//! stop request can interleave at any point without racing.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::RngExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::TaskInfo;
use crate::capture::{ProcessSupervisor, StartOutcome};
use crate::config::{SupervisorConfig, WatcherConfig};
use crate::domain::{Room, TaskMode, WatchWindow, lead_time};
use crate::sources::{LiveStatusProbe, StreamResolver};
use crate::Error;

/// Upper bound on one scheduling nap, so reschedules take effect
/// promptly even when the window is hours away.
const SCHEDULING_NAP: Duration = Duration::from_secs(30);

/// Jitter ceiling added to capture retry sleeps.
const RETRY_JITTER_MS: u64 = 1000;

/// Mutable task state, guarded by the per-task lock.
#[derive(Debug)]
struct TaskState {
    mode: TaskMode,
    start_time: DateTime<Utc>,
    window: WatchWindow,
    live_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
}

/// A capture task for a single room.
pub struct CaptureTask {
    room: Arc<Room>,
    probe: Arc<dyn LiveStatusProbe>,
    supervisor: ProcessSupervisor,
    config: WatcherConfig,
    lead: Duration,
    state: parking_lot::Mutex<TaskState>,
    cancellation: CancellationToken,
}

impl CaptureTask {
    pub fn new(
        room: Arc<Room>,
        start_time: DateTime<Utc>,
        probe: Arc<dyn LiveStatusProbe>,
        resolver: Arc<dyn StreamResolver>,
        config: WatcherConfig,
        supervisor_config: SupervisorConfig,
    ) -> Self {
        let lead = lead_time(room.priority());
        let supervisor = ProcessSupervisor::new(room.clone(), resolver, supervisor_config);
        Self {
            room: room.clone(),
            probe,
            supervisor,
            config,
            lead,
            state: parking_lot::Mutex::new(TaskState {
                mode: TaskMode::Scheduling,
                start_time,
                window: WatchWindow::new(start_time, lead),
                live_at: None,
                ended_at: None,
            }),
            cancellation: CancellationToken::new(),
        }
    }

    // Explicit facade over the owned room.

    pub fn room_id(&self) -> &str {
        self.room.id()
    }

    pub fn room_name(&self) -> &str {
        self.room.name()
    }

    pub fn priority(&self) -> u32 {
        self.room.priority()
    }

    pub fn is_wanted(&self) -> bool {
        self.room.is_wanted()
    }

    pub fn mode(&self) -> TaskMode {
        self.state.lock().mode
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.state.lock().start_time
    }

    pub fn snapshot(&self) -> TaskInfo {
        let state = self.state.lock();
        TaskInfo {
            room_id: self.room.id().to_string(),
            room_name: self.room.name().to_string(),
            priority: self.room.priority(),
            mode: state.mode,
            start_time: state.start_time,
            live_at: state.live_at,
            ended_at: state.ended_at,
            output_files: self.supervisor.completed_files(),
        }
    }

    /// Move the scheduled start time.
    ///
    /// Effective only while the task is still in `scheduling`; anywhere
    /// else this is a silent no-op returning false. The mode guard runs
    /// under the task lock, so an external reschedule can never overwrite
    /// the start time the task set itself on going live.
    pub fn reschedule(&self, start_time: DateTime<Utc>) -> bool {
        let mut state = self.state.lock();
        if state.mode != TaskMode::Scheduling {
            return false;
        }
        state.start_time = start_time;
        state.window = WatchWindow::new(start_time, self.lead);
        true
    }

    /// Cooperative stop request: mark the task quitting, ask the
    /// supervisor to wind down, and wake the worker. The worker observes
    /// the mode change on its next iteration and unwinds to `completed`.
    pub async fn stop(&self) {
        {
            let mut state = self.state.lock();
            if state.mode.is_terminal() || state.mode == TaskMode::Quitting {
                return;
            }
            info!(room = self.room.id(), from = ?state.mode, "Stop requested");
            state.mode = TaskMode::Quitting;
        }
        self.supervisor.stop().await;
        self.cancellation.cancel();
    }

    /// Drive the state machine to a terminal mode.
    pub async fn run(self: Arc<Self>) {
        debug!(room = self.room.id(), "Capture task starting");
        loop {
            match self.mode() {
                TaskMode::Scheduling => self.step_scheduling().await,
                TaskMode::Watching => self.step_watching().await,
                TaskMode::Live => self.step_live().await,
                TaskMode::Download => self.step_download().await,
                TaskMode::Quitting => {
                    self.advance(TaskMode::Quitting, TaskMode::Completed);
                }
                TaskMode::Expired | TaskMode::Completed => break,
            }
        }
        info!(room = self.room.id(), mode = ?self.mode(), "Capture task finished");
    }

    async fn step_scheduling(&self) {
        let now = Utc::now();
        if self.try_open_window(now) {
            return;
        }
        let until_open = self.state.lock().window.until_open(now);
        self.nap(until_open.min(SCHEDULING_NAP)).await;
    }

    /// Enter `watching` once the window has opened. A window that
    /// somehow closed without ever opening still passes through
    /// `watching` at least once before it can expire.
    fn try_open_window(&self, now: DateTime<Utc>) -> bool {
        let open = self.state.lock().window.is_open(now);
        if open {
            self.advance(TaskMode::Scheduling, TaskMode::Watching)
        } else {
            false
        }
    }

    async fn step_watching(&self) {
        match self.probe.check_live(self.room.id()).await {
            Ok(true) => {
                self.note_live(Utc::now());
                return;
            }
            Ok(false) => {}
            Err(e) => {
                debug!(room = self.room.id(), error = %e, "Live check failed; retrying");
            }
        }
        if !self.note_window_expired(Utc::now()) {
            self.nap(self.config.watch_poll_interval).await;
        }
    }

    /// Record the live confirmation: the start time resets to the
    /// confirmation instant, and the task moves to `download` when the
    /// room is wanted, `live` (monitor only) otherwise.
    fn note_live(&self, now: DateTime<Utc>) -> TaskMode {
        {
            let mut state = self.state.lock();
            if state.mode == TaskMode::Watching {
                state.start_time = now;
                state.live_at = Some(now);
            }
        }
        let next = if self.room.is_wanted() {
            TaskMode::Download
        } else {
            TaskMode::Live
        };
        self.advance(TaskMode::Watching, next);
        self.mode()
    }

    /// Expire a watching task whose window closed with no confirmation.
    fn note_window_expired(&self, now: DateTime<Utc>) -> bool {
        let past = self.state.lock().window.is_past(now);
        past && self.advance(TaskMode::Watching, TaskMode::Expired)
    }

    async fn step_live(&self) {
        if self.room.is_wanted() {
            if self.advance(TaskMode::Live, TaskMode::Download) {
                info!(room = self.room.id(), "Room became wanted; starting capture");
            }
            return;
        }
        match self.probe.check_live(self.room.id()).await {
            Ok(false) => {
                self.advance(TaskMode::Live, TaskMode::Completed);
            }
            Ok(true) => self.nap(self.config.live_poll_interval).await,
            Err(e) => {
                debug!(room = self.room.id(), error = %e, "Live check failed; retrying");
                self.nap(self.config.live_poll_interval).await;
            }
        }
    }

    async fn step_download(&self) {
        // A wanted toggle never aborts an in-flight recording: the
        // supervisor is left to finish on its own when we drop to `live`.
        if !self.room.is_wanted() {
            if self.advance(TaskMode::Download, TaskMode::Live) {
                info!(room = self.room.id(), "Room no longer wanted; monitoring only");
            }
            return;
        }

        match self.probe.check_live(self.room.id()).await {
            Ok(true) => {}
            Ok(false) => {
                self.advance(TaskMode::Download, TaskMode::Completed);
                return;
            }
            Err(e) => {
                debug!(room = self.room.id(), error = %e, "Live check failed; retrying");
                self.retry_nap().await;
                return;
            }
        }

        match self.supervisor.start().await {
            Ok(StartOutcome::Started(_)) => match self.supervisor.wait().await {
                Ok(exit) => {
                    debug!(room = self.room.id(), status = ?exit.status, stalled = exit.stalled,
                        "Capture run ended; re-checking live status");
                }
                Err(e @ Error::FileExists { .. }) => {
                    error!(room = self.room.id(), error = %e,
                        "Filename collision on move; aborting capture");
                    self.advance(TaskMode::Download, TaskMode::Completed);
                }
                Err(e) => {
                    warn!(room = self.room.id(), error = %e, "Capture run failed");
                    self.retry_nap().await;
                }
            },
            Ok(StartOutcome::NoStream) => self.retry_nap().await,
            Err(e @ Error::FileExists { .. }) => {
                error!(room = self.room.id(), error = %e,
                    "Destination already exists; aborting capture");
                self.advance(TaskMode::Download, TaskMode::Completed);
            }
            Err(e) => {
                warn!(room = self.room.id(), error = %e, "Failed to start capture");
                self.retry_nap().await;
            }
        }
    }

    /// Compare-and-set transition; records the end timestamp when the
    /// target mode is terminal.
    fn advance(&self, from: TaskMode, to: TaskMode) -> bool {
        let mut state = self.state.lock();
        if state.mode != from {
            return false;
        }
        debug!(room = self.room.id(), from = ?from, to = ?to, "Mode transition");
        state.mode = to;
        if to.is_terminal() {
            state.ended_at = Some(Utc::now());
        }
        true
    }

    /// Sleep that wakes early on a stop request.
    async fn nap(&self, duration: Duration) {
        tokio::select! {
            _ = self.cancellation.cancelled() => {}
            _ = tokio::time::sleep(duration) => {}
        }
    }

    async fn retry_nap(&self) {
        let jitter = rand::rng().random_range(0..RETRY_JITTER_MS);
        self.nap(self.config.capture_retry_interval + Duration::from_millis(jitter))
            .await;
    }
}
