//! The top-level capture orchestrator.
//!
//! One loop polls the two external feeds at their own rates, creates or
//! reschedules capture tasks, reaps terminal ones, and enforces the
//! global tracking ceiling. Each task runs on its own worker; the watch
//! queue is the only structure shared between the orchestrator and task
//! lifecycle, and every queue call is one critical section under a
//! single lock.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::completed_log::{CompletedLog, CompletedRecord};
use crate::config::CaptureConfig;
use crate::domain::{ModeFilter, RoomDirectory, TaskMode};
use crate::queue::WatchQueue;
use crate::sources::{LiveStatusProbe, ScheduleFeed, StreamResolver};
use crate::watcher::{CaptureTask, TaskInfo};
use crate::{Error, Result};

/// Interval between orchestration cycles when `run` owns the loop.
const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// How long a reap waits for a finished task's worker to join.
const REAP_JOIN_GRACE: Duration = Duration::from_secs(5);

/// Poll pacing for the two feeds.
#[derive(Debug, Default)]
struct PollClocks {
    last_upcoming: Option<Instant>,
    last_live: Option<Instant>,
}

impl PollClocks {
    fn due(last: &mut Option<Instant>, interval: Duration) -> bool {
        let due = last.is_none_or(|t| t.elapsed() >= interval);
        if due {
            *last = Some(Instant::now());
        }
        due
    }
}

/// Orchestrates capture tasks for all tracked rooms.
pub struct Orchestrator<D, F>
where
    D: RoomDirectory + Send + Sync + 'static,
    F: ScheduleFeed + Send + Sync + 'static,
{
    directory: Arc<D>,
    feed: Arc<F>,
    probe: Arc<dyn LiveStatusProbe>,
    resolver: Arc<dyn StreamResolver>,
    config: CaptureConfig,
    /// The watch queue; one critical section per call.
    queue: parking_lot::Mutex<WatchQueue<Arc<CaptureTask>>>,
    /// Worker handles by room id, joined during reap/shutdown.
    workers: DashMap<String, JoinHandle<()>>,
    /// Workers that failed to join within the grace period. Tracked so
    /// operators can be warned, never silently discarded.
    stragglers: DashMap<String, JoinHandle<()>>,
    completed_log: CompletedLog,
    clocks: parking_lot::Mutex<PollClocks>,
    cancellation: CancellationToken,
}

impl<D, F> Orchestrator<D, F>
where
    D: RoomDirectory + Send + Sync + 'static,
    F: ScheduleFeed + Send + Sync + 'static,
{
    pub fn new(
        directory: Arc<D>,
        feed: Arc<F>,
        probe: Arc<dyn LiveStatusProbe>,
        resolver: Arc<dyn StreamResolver>,
        config: CaptureConfig,
    ) -> Self {
        Self::with_cancellation(
            directory,
            feed,
            probe,
            resolver,
            config,
            CancellationToken::new(),
        )
    }

    /// Construct with a shared cancellation token so a parent can cancel
    /// the orchestrator's own loop directly.
    pub fn with_cancellation(
        directory: Arc<D>,
        feed: Arc<F>,
        probe: Arc<dyn LiveStatusProbe>,
        resolver: Arc<dyn StreamResolver>,
        config: CaptureConfig,
        cancellation: CancellationToken,
    ) -> Self {
        let completed_log = CompletedLog::new(config.completed_log_path.clone());
        Self {
            directory,
            feed,
            probe,
            resolver,
            config,
            queue: parking_lot::Mutex::new(WatchQueue::new()),
            workers: DashMap::new(),
            stragglers: DashMap::new(),
            completed_log,
            clocks: parking_lot::Mutex::new(PollClocks::default()),
            cancellation,
        }
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    /// Number of currently tracked rooms.
    pub fn tracked_count(&self) -> usize {
        self.queue.lock().len()
    }

    /// Room ids whose workers missed the join grace period.
    pub fn straggler_ids(&self) -> Vec<String> {
        self.stragglers.iter().map(|e| e.key().clone()).collect()
    }

    /// Track a room with a predicted start time.
    ///
    /// A room already tracked is rescheduled instead (a no-op unless its
    /// task is still in `scheduling` — at most one live task per room).
    /// At the tracking ceiling, a strictly worse-priority task is evicted
    /// to make room; otherwise the arrival is dropped. Returns true when
    /// a new task was created.
    pub async fn submit(&self, room_id: &str, start_at: DateTime<Utc>) -> Result<bool> {
        let Some(room) = self.directory.lookup(room_id) else {
            debug!(room = room_id, "Submit for unknown room ignored");
            return Ok(false);
        };

        let evicted = {
            let mut queue = self.queue.lock();
            if let Some(existing) = queue.get(room_id) {
                existing.reschedule(start_at);
                return Ok(false);
            }
            if queue.len() >= self.config.orchestrator.max_tracked {
                queue.rebuild();
                match queue.prune_worse_than(room.priority()) {
                    Some(task) => Some(task),
                    None => {
                        debug!(
                            room = room_id,
                            priority = room.priority(),
                            "At tracking ceiling with nothing worse; arrival dropped"
                        );
                        return Ok(false);
                    }
                }
            } else {
                None
            }
        };

        if let Some(task) = evicted {
            warn!(
                evicted = task.room_id(),
                evicted_priority = task.priority(),
                arrival = room_id,
                arrival_priority = room.priority(),
                "Evicting lower-priority room at tracking ceiling"
            );
            task.stop().await;
            self.finish_task(&task).await?;
        }

        let task = Arc::new(CaptureTask::new(
            room.clone(),
            start_at,
            self.probe.clone(),
            self.resolver.clone(),
            self.config.watcher.clone(),
            self.config.supervisor.clone(),
        ));

        {
            let mut queue = self.queue.lock();
            if !queue.add(room_id, room.priority(), task.clone()) {
                return Err(Error::DuplicateTask {
                    room_id: room_id.to_string(),
                });
            }
        }

        let worker = tokio::spawn(task.clone().run());
        self.workers.insert(room_id.to_string(), worker);
        info!(
            room = room_id,
            priority = room.priority(),
            start = %start_at,
            "Tracking room"
        );
        Ok(true)
    }

    /// Stop tracking a room. Returns true if a task was cancelled.
    pub async fn cancel(&self, room_id: &str) -> Result<bool> {
        let task = self.queue.lock().pop_specific(room_id);
        let Some(task) = task else {
            return Ok(false);
        };

        info!(room = room_id, "Cancelling capture task");
        task.stop().await;
        self.finish_task(&task).await?;
        Ok(true)
    }

    /// One orchestration cycle: poll feeds that are due, reap terminal
    /// tasks, and compact the queue. Callable from an external timer;
    /// [`Orchestrator::run`] wraps it in a sleep loop.
    pub async fn tick(&self) -> Result<()> {
        let (upcoming_due, live_due) = {
            let mut clocks = self.clocks.lock();
            (
                PollClocks::due(
                    &mut clocks.last_upcoming,
                    self.config.orchestrator.upcoming_poll_interval,
                ),
                PollClocks::due(
                    &mut clocks.last_live,
                    self.config.orchestrator.live_poll_interval,
                ),
            )
        };

        if upcoming_due {
            match self.feed.poll_upcoming().await {
                Ok(entries) => {
                    for entry in entries {
                        self.submit(&entry.room_id, entry.start_at).await?;
                    }
                }
                Err(e) => debug!(error = %e, "Upcoming poll failed; no data this cycle"),
            }
        }

        if live_due {
            match self.feed.poll_live().await {
                Ok(entries) => {
                    for entry in entries {
                        self.submit(&entry.room_id, entry.start_at).await?;
                    }
                }
                Err(e) => debug!(error = %e, "Live poll failed; no data this cycle"),
            }
        }

        self.reap_finished().await?;
        Ok(())
    }

    /// Snapshot every tracked task whose mode matches `filter` — a
    /// single [`TaskMode`] or a [`crate::domain::ModeGroup`].
    pub fn list_by_mode(&self, filter: impl Into<ModeFilter>) -> Vec<TaskInfo> {
        let filter = filter.into();
        self.queue
            .lock()
            .iter()
            .filter(|t| filter.contains(t.mode()))
            .map(|t| t.snapshot())
            .collect()
    }

    /// Own the orchestration loop until the token is cancelled.
    pub async fn run(&self) {
        info!("Orchestrator starting");
        loop {
            tokio::select! {
                _ = self.cancellation.cancelled() => {
                    info!("Orchestrator cancelled");
                    break;
                }
                _ = tokio::time::sleep(TICK_INTERVAL) => {
                    if let Err(e) = self.tick().await {
                        warn!(error = %e, "Orchestration cycle failed");
                    }
                }
            }
        }
    }

    /// Stop every task and wait for workers within the configured grace
    /// period. Workers that fail to join are kept in the straggler table
    /// and warned about.
    pub async fn shutdown(&self) -> Result<()> {
        info!(tracked = self.tracked_count(), "Orchestrator shutting down");
        self.cancellation.cancel();

        let tasks: Vec<_> = {
            let mut queue = self.queue.lock();
            let tasks: Vec<_> = queue.iter().cloned().collect();
            for task in &tasks {
                queue.remove(task.room_id());
            }
            queue.rebuild();
            tasks
        };

        for task in &tasks {
            task.stop().await;
        }
        let deadline = Instant::now() + self.config.orchestrator.shutdown_grace;
        for task in &tasks {
            let grace = deadline.saturating_duration_since(Instant::now());
            self.join_worker(task.room_id(), grace).await;
            self.record_completed(task).await?;
        }

        if !self.stragglers.is_empty() {
            warn!(
                stragglers = ?self.straggler_ids(),
                "Workers failed to join within the shutdown grace period"
            );
        }
        Ok(())
    }

    /// Remove terminal tasks from the queue, join their workers, and log
    /// completed ones.
    async fn reap_finished(&self) -> Result<()> {
        let finished: Vec<_> = {
            let queue = self.queue.lock();
            queue
                .iter()
                .filter(|t| t.mode().is_terminal())
                .cloned()
                .collect()
        };

        for task in &finished {
            self.queue.lock().remove(task.room_id());
            self.finish_task(task).await?;
        }

        self.queue.lock().rebuild();
        Ok(())
    }

    /// Join a reaped task's worker and append its completed record.
    async fn finish_task(&self, task: &Arc<CaptureTask>) -> Result<()> {
        self.join_worker(task.room_id(), REAP_JOIN_GRACE).await;
        self.record_completed(task).await
    }

    async fn join_worker(&self, room_id: &str, grace: Duration) {
        let Some((_, mut handle)) = self.workers.remove(room_id) else {
            return;
        };
        match tokio::time::timeout(grace, &mut handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(room = room_id, error = %e, "Capture worker panicked"),
            Err(_) => {
                warn!(room = room_id, "Capture worker failed to join; tracking as straggler");
                self.stragglers.insert(room_id.to_string(), handle);
            }
        }
    }

    async fn record_completed(&self, task: &Arc<CaptureTask>) -> Result<()> {
        let info = task.snapshot();
        if info.mode == TaskMode::Completed {
            self.completed_log
                .append(&CompletedRecord::from(&info))
                .await?;
        } else {
            debug!(room = info.room_id, mode = ?info.mode, "Task reaped without capture");
        }
        Ok(())
    }
}
