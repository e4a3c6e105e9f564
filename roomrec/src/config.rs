//! Configuration objects for the capture engine.
//!
//! All configuration is explicit and passed by reference into the
//! components that need it. There is no ambient global state; callers
//! build one [`CaptureConfig`] (typically via [`CaptureConfig::from_env`])
//! and hand it to the orchestrator at construction.

use std::path::PathBuf;
use std::time::Duration;

use crate::{Error, Result};

/// Default interval between "upcoming schedule" feed polls.
const DEFAULT_UPCOMING_POLL_SECS: u64 = 30;

/// Default interval between "currently live" feed polls.
const DEFAULT_LIVE_POLL_SECS: u64 = 7;

/// Default interval between live-status checks while watching.
const DEFAULT_WATCH_POLL_SECS: u64 = 2;

/// Default interval between live-status checks while in the live
/// (monitor-only) state. Deliberately slower than the watch rate.
const DEFAULT_LIVE_CHECK_SECS: u64 = 30;

/// Default delay before retrying capture when no stream URL resolved.
const DEFAULT_CAPTURE_RETRY_SECS: u64 = 5;

/// Default ceiling on concurrently tracked rooms.
const DEFAULT_MAX_TRACKED: usize = 100;

/// Default baseline for the supervisor's stall tolerance.
const DEFAULT_STALL_TOLERANCE: u32 = 2;

/// Default encoder binary.
const DEFAULT_ENCODER_BIN: &str = "ffmpeg";

/// Default container extension for capture output files.
const DEFAULT_OUTPUT_EXT: &str = "mp4";

/// Orchestrator timing and capacity settings.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Interval between polls of the upcoming-schedule feed.
    pub upcoming_poll_interval: Duration,
    /// Interval between polls of the currently-live feed.
    pub live_poll_interval: Duration,
    /// Maximum number of rooms tracked at once. A higher-priority
    /// arrival at the ceiling evicts the worst tracked room.
    pub max_tracked: usize,
    /// Grace period for joining task workers during shutdown.
    pub shutdown_grace: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            upcoming_poll_interval: Duration::from_secs(DEFAULT_UPCOMING_POLL_SECS),
            live_poll_interval: Duration::from_secs(DEFAULT_LIVE_POLL_SECS),
            max_tracked: DEFAULT_MAX_TRACKED,
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

/// Per-task polling rates for the watcher state machine.
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Live-status poll interval while in the watching state.
    pub watch_poll_interval: Duration,
    /// Live-status poll interval while in the live (monitor-only) state.
    pub live_poll_interval: Duration,
    /// Delay before retrying `start` after a no-stream cycle.
    pub capture_retry_interval: Duration,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            watch_poll_interval: Duration::from_secs(DEFAULT_WATCH_POLL_SECS),
            live_poll_interval: Duration::from_secs(DEFAULT_LIVE_CHECK_SECS),
            capture_retry_interval: Duration::from_secs(DEFAULT_CAPTURE_RETRY_SECS),
        }
    }
}

/// Encoder invocation and output placement settings.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Path to the encoder binary.
    pub encoder_bin: String,
    /// Directory encoder output is written to while a capture is running.
    pub temp_dir: PathBuf,
    /// Directory finished captures are moved to.
    pub output_dir: PathBuf,
    /// Container extension for output files.
    pub output_ext: String,
    /// Baseline number of stall keep-alives tolerated before the
    /// supervisor stops the encoder.
    pub stall_tolerance: u32,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            encoder_bin: DEFAULT_ENCODER_BIN.to_string(),
            temp_dir: PathBuf::from("active"),
            output_dir: PathBuf::from("recordings"),
            output_ext: DEFAULT_OUTPUT_EXT.to_string(),
            stall_tolerance: DEFAULT_STALL_TOLERANCE,
        }
    }
}

/// Top-level configuration handed to the orchestrator.
#[derive(Debug, Clone, Default)]
pub struct CaptureConfig {
    pub orchestrator: OrchestratorConfig,
    pub watcher: WatcherConfig,
    pub supervisor: SupervisorConfig,
    /// Path of the append-only completed-tasks log.
    pub completed_log_path: Option<PathBuf>,
}

impl CaptureConfig {
    /// Build a configuration from environment variables, falling back to
    /// defaults for anything unset. Callers that want `.env` support
    /// load the file into the environment before calling this.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(dir) = env_var("ROOMREC_TEMP_DIR") {
            config.supervisor.temp_dir = PathBuf::from(dir);
        }
        if let Some(dir) = env_var("ROOMREC_OUTPUT_DIR") {
            config.supervisor.output_dir = PathBuf::from(dir);
        }
        if let Some(bin) = env_var("ROOMREC_ENCODER_BIN") {
            config.supervisor.encoder_bin = bin;
        }
        if let Some(path) = env_var("ROOMREC_COMPLETED_LOG") {
            config.completed_log_path = Some(PathBuf::from(path));
        }
        if let Some(raw) = env_var("ROOMREC_MAX_TRACKED") {
            config.orchestrator.max_tracked = raw
                .parse()
                .map_err(|_| Error::config(format!("invalid ROOMREC_MAX_TRACKED: {raw}")))?;
        }
        if let Some(raw) = env_var("ROOMREC_UPCOMING_POLL_SECS") {
            let secs: u64 = raw
                .parse()
                .map_err(|_| Error::config(format!("invalid ROOMREC_UPCOMING_POLL_SECS: {raw}")))?;
            config.orchestrator.upcoming_poll_interval = Duration::from_secs(secs);
        }
        if let Some(raw) = env_var("ROOMREC_LIVE_POLL_SECS") {
            let secs: u64 = raw
                .parse()
                .map_err(|_| Error::config(format!("invalid ROOMREC_LIVE_POLL_SECS: {raw}")))?;
            config.orchestrator.live_poll_interval = Duration::from_secs(secs);
        }

        Ok(config)
    }
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}
