//! Encoder process supervision.
//!
//! A [`ProcessSupervisor`] wraps one external encoder invocation at a
//! time. It resolves the stream URL, spawns the encoder with its
//! diagnostic stream piped, watches that stream for the "output started"
//! marker and for stall keep-alives ("ping loop of death"), and moves the
//! finished file to its final location exactly once.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, Command};
use tracing::{debug, error, info, warn};

use crate::config::SupervisorConfig;
use crate::domain::Room;
use crate::sources::{StreamResolver, Transport, select_source};
use crate::{Error, Result};

/// Diagnostic line the encoder emits once it has opened its output.
/// Arms the move-to-destination step.
const OUTPUT_STARTED_MARKER: &str = "Output #0";

/// Keep-alive line the encoder emits while its network connection is
/// stalled and producing no data.
const STALL_MARKER: &str = "Ping request";

/// How much the stall tolerance grows after each detected stall.
///
/// There is no reset besides a clean completion, so repeated failures
/// make the supervisor monotonically more patient; growth is logged at
/// warn level so operators can see it happening.
const STALL_TOLERANCE_STEP: u32 = 1;

/// Outcome of a start attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// Encoder spawned at the given instant.
    Started(DateTime<Utc>),
    /// No stream URL resolved this cycle; retry later.
    NoStream,
}

/// Terminal result of one encoder run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureExit {
    /// Process exit code, if the process exited normally enough to have one.
    pub status: Option<i32>,
    /// True when the run was cut short by stall detection.
    pub stalled: bool,
}

/// The live child process plus its control channel.
struct ActiveCapture {
    child: Child,
    stdin: Option<ChildStdin>,
    /// Set by the first `stop` call; a second call escalates to kill.
    stopping: bool,
}

/// Mutable bookkeeping, guarded by a short-lived lock.
#[derive(Debug, Default)]
struct SupervisorState {
    transport: Option<Transport>,
    stream_url: Option<String>,
    temp_path: Option<PathBuf>,
    final_path: Option<PathBuf>,
    /// Runs spawned so far; part of the output filename so a restart
    /// within the same second never reuses the previous run's name.
    run_seq: u32,
    stall_tolerance_extra: u32,
    completed_files: Vec<PathBuf>,
}

/// Tracks diagnostic-stream markers for one encoder run.
#[derive(Debug)]
struct DiagnosticScan {
    tolerance: u32,
    pings: u32,
    output_started: bool,
    stalled: bool,
}

/// What a scanned line means for the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LineEvent {
    None,
    OutputStarted,
    StallThresholdExceeded,
}

impl DiagnosticScan {
    fn new(tolerance: u32) -> Self {
        Self {
            tolerance,
            pings: 0,
            output_started: false,
            stalled: false,
        }
    }

    fn observe(&mut self, line: &str) -> LineEvent {
        if line.contains(OUTPUT_STARTED_MARKER) {
            self.output_started = true;
            return LineEvent::OutputStarted;
        }
        if line.contains(STALL_MARKER) {
            self.pings += 1;
            if !self.stalled && self.pings > self.tolerance {
                self.stalled = true;
                return LineEvent::StallThresholdExceeded;
            }
        }
        LineEvent::None
    }
}

/// Supervises one external encoder invocation at a time for one room.
///
/// At most one live process exists per supervisor: [`ProcessSupervisor::start`]
/// is rejected until the previous process has been observed to exit via
/// [`ProcessSupervisor::wait`].
pub struct ProcessSupervisor {
    room: Arc<Room>,
    resolver: Arc<dyn StreamResolver>,
    config: SupervisorConfig,
    state: parking_lot::Mutex<SupervisorState>,
    /// Held only for short control operations, never across process I/O.
    active: tokio::sync::Mutex<Option<ActiveCapture>>,
    /// Diagnostic stream of the live process, taken by `wait`.
    stderr: parking_lot::Mutex<Option<ChildStderr>>,
}

impl ProcessSupervisor {
    pub fn new(room: Arc<Room>, resolver: Arc<dyn StreamResolver>, config: SupervisorConfig) -> Self {
        Self {
            room,
            resolver,
            config,
            state: parking_lot::Mutex::new(SupervisorState::default()),
            active: tokio::sync::Mutex::new(None),
            stderr: parking_lot::Mutex::new(None),
        }
    }

    /// Output file paths completed and moved so far. A capture may
    /// restart several times within one task, producing several files.
    pub fn completed_files(&self) -> Vec<PathBuf> {
        self.state.lock().completed_files.clone()
    }

    /// Resolve the current stream URL and spawn the encoder.
    ///
    /// Resolution failures are "no URL available this cycle", not errors;
    /// the caller retries on its own schedule. A same-named file already
    /// at the final destination is fatal: it should never happen under
    /// correct operation.
    pub async fn start(&self) -> Result<StartOutcome> {
        let mut active = self.active.lock().await;
        if active.is_some() {
            return Err(Error::CaptureActive {
                room_id: self.room.id().to_string(),
            });
        }

        let sources = match self.resolver.resolve_urls(self.room.id()).await {
            Ok(sources) => sources,
            Err(e) => {
                debug!(room = self.room.id(), error = %e, "Stream URL resolution failed");
                return Ok(StartOutcome::NoStream);
            }
        };
        let Some(source) = select_source(&sources) else {
            debug!(room = self.room.id(), "No stream URL available this cycle");
            return Ok(StartOutcome::NoStream);
        };

        let filename = self.output_filename();
        let temp_path = self.config.temp_dir.join(&filename);
        let final_path = self.config.output_dir.join(&filename);

        if tokio::fs::try_exists(&final_path).await.unwrap_or(false) {
            return Err(Error::FileExists { path: final_path });
        }
        tokio::fs::create_dir_all(&self.config.temp_dir).await?;
        tokio::fs::create_dir_all(&self.config.output_dir).await?;

        info!(
            room = self.room.id(),
            transport = ?source.transport,
            file = %temp_path.display(),
            "Starting capture"
        );

        let mut child = Command::new(&self.config.encoder_bin)
            .args(self.build_args(&source.url, &temp_path))
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()?;

        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::other("Failed to capture encoder diagnostic stream"))?;
        let stdin = child.stdin.take();

        *self.stderr.lock() = Some(stderr);
        *active = Some(ActiveCapture {
            child,
            stdin,
            stopping: false,
        });

        {
            let mut state = self.state.lock();
            state.transport = Some(source.transport);
            state.stream_url = Some(source.url.clone());
            state.temp_path = Some(temp_path);
            state.final_path = Some(final_path);
            state.run_seq += 1;
        }

        Ok(StartOutcome::Started(Utc::now()))
    }

    /// Block on the encoder's diagnostic stream until the process exits.
    ///
    /// Stall keep-alives past the current tolerance trigger a proactive
    /// stop (and raise the tolerance for the next run). Once the process
    /// exits, the finished file is moved to its destination exactly once.
    pub async fn wait(&self) -> Result<CaptureExit> {
        let stderr = self
            .stderr
            .lock()
            .take()
            .ok_or_else(|| Error::other("wait called with no active capture"))?;

        let tolerance = self.config.stall_tolerance + self.state.lock().stall_tolerance_extra;
        let mut scan = DiagnosticScan::new(tolerance);
        let mut lines = BufReader::new(stderr).lines();

        loop {
            match lines.next_line().await {
                Ok(Some(line)) => match scan.observe(&line) {
                    LineEvent::OutputStarted => {
                        debug!(room = self.room.id(), "Encoder opened its output");
                    }
                    LineEvent::StallThresholdExceeded => {
                        let raised = {
                            let mut state = self.state.lock();
                            state.stall_tolerance_extra += STALL_TOLERANCE_STEP;
                            self.config.stall_tolerance + state.stall_tolerance_extra
                        };
                        warn!(
                            room = self.room.id(),
                            pings = scan.pings,
                            next_tolerance = raised,
                            "Encoder stalled in a ping loop; stopping it (tolerance grows, no reset until a clean completion)"
                        );
                        self.stop().await;
                    }
                    LineEvent::None => {}
                },
                Ok(None) => break,
                Err(e) => {
                    error!(room = self.room.id(), error = %e, "Error reading encoder diagnostics");
                    break;
                }
            }
        }

        let status = {
            let mut active = self.active.lock().await;
            match active.take() {
                Some(mut capture) => capture.child.wait().await?.code(),
                None => None,
            }
        };

        if scan.output_started {
            self.finalize_output().await?;
        }
        if !scan.stalled {
            self.state.lock().stall_tolerance_extra = 0;
        }

        debug!(
            room = self.room.id(),
            status = ?status,
            stalled = scan.stalled,
            "Encoder exited"
        );
        Ok(CaptureExit {
            status,
            stalled: scan.stalled,
        })
    }

    /// Request termination: graceful on the first call, forced while
    /// already stopping. Graceful termination is not guaranteed to land
    /// within bounded time, hence the escalation.
    pub async fn stop(&self) {
        let mut active = self.active.lock().await;
        let Some(capture) = active.as_mut() else {
            return;
        };

        if capture.stopping {
            info!(room = self.room.id(), "Stop escalation: killing encoder");
            if let Err(e) = capture.child.start_kill() {
                warn!(room = self.room.id(), error = %e, "Failed to kill encoder");
            }
            return;
        }

        capture.stopping = true;
        match capture.stdin.as_mut() {
            Some(stdin) => {
                debug!(room = self.room.id(), "Requesting graceful encoder quit");
                if let Err(e) = stdin.write_all(b"q\n").await {
                    warn!(room = self.room.id(), error = %e, "Graceful quit failed; killing");
                    let _ = capture.child.start_kill();
                }
            }
            None => {
                let _ = capture.child.start_kill();
            }
        }
    }

    /// Forced termination. Destructive (the output may become unusable);
    /// last resort outside `wait`'s own stall handling.
    pub async fn kill(&self) {
        let mut active = self.active.lock().await;
        if let Some(capture) = active.as_mut() {
            warn!(room = self.room.id(), "Force-killing encoder");
            let _ = capture.child.start_kill();
        }
    }

    /// Move the finished capture from the temp directory to its final
    /// destination.
    ///
    /// A missing source means the encoder exited before producing any
    /// bytes: expected, logged, no-op. An existing destination is an
    /// upstream filename-collision invariant violation and fatal.
    pub async fn finalize_output(&self) -> Result<Option<PathBuf>> {
        let (temp_path, final_path) = {
            let state = self.state.lock();
            match (state.temp_path.clone(), state.final_path.clone()) {
                (Some(t), Some(f)) => (t, f),
                _ => return Ok(None),
            }
        };

        if !tokio::fs::try_exists(&temp_path).await.unwrap_or(false) {
            info!(
                room = self.room.id(),
                file = %temp_path.display(),
                "No capture output to move (encoder produced no bytes)"
            );
            return Ok(None);
        }
        if tokio::fs::try_exists(&final_path).await.unwrap_or(false) {
            return Err(Error::FileExists { path: final_path });
        }

        tokio::fs::rename(&temp_path, &final_path).await?;
        info!(room = self.room.id(), file = %final_path.display(), "Capture finished");
        self.state.lock().completed_files.push(final_path.clone());
        Ok(Some(final_path))
    }

    /// `"{room id} {timestamp} {run seq}.{ext}"`. The timestamp alone is
    /// not unique: a clean completion followed by a restart inside the
    /// same second would reproduce it, so the per-supervisor run
    /// sequence disambiguates.
    fn output_filename(&self) -> String {
        format!(
            "{} {} {:02}.{}",
            self.room.id(),
            Utc::now().format("%Y-%m-%d %H%M%S"),
            self.state.lock().run_seq,
            self.config.output_ext
        )
    }

    fn build_args(&self, url: &str, output: &std::path::Path) -> Vec<String> {
        vec![
            "-y".to_string(),
            "-hide_banner".to_string(),
            "-loglevel".to_string(),
            "info".to_string(),
            "-i".to_string(),
            url.to_string(),
            "-c".to_string(),
            "copy".to_string(),
            output.to_string_lossy().to_string(),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SupervisorConfig;
    use async_trait::async_trait;
    use tempfile::TempDir;

    struct FixedResolver {
        sources: Vec<crate::sources::StreamSource>,
    }

    #[async_trait]
    impl StreamResolver for FixedResolver {
        async fn resolve_urls(&self, _room_id: &str) -> Result<Vec<crate::sources::StreamSource>> {
            Ok(self.sources.clone())
        }
    }

    struct FailingResolver;

    #[async_trait]
    impl StreamResolver for FailingResolver {
        async fn resolve_urls(&self, _room_id: &str) -> Result<Vec<crate::sources::StreamSource>> {
            Err(Error::other("connection reset"))
        }
    }

    fn test_room() -> Arc<Room> {
        Arc::new(Room::wanted("room-1", "Room One", 3))
    }

    fn test_config(dir: &TempDir) -> SupervisorConfig {
        SupervisorConfig {
            encoder_bin: "true".to_string(),
            temp_dir: dir.path().join("active"),
            output_dir: dir.path().join("done"),
            output_ext: "mp4".to_string(),
            stall_tolerance: 2,
        }
    }

    #[test]
    fn scan_stall_threshold_triggers_once() {
        let mut scan = DiagnosticScan::new(2);
        assert_eq!(scan.observe("Ping request sent"), LineEvent::None);
        assert_eq!(scan.observe("Ping request sent"), LineEvent::None);
        assert_eq!(
            scan.observe("Ping request sent"),
            LineEvent::StallThresholdExceeded
        );
        // Further keep-alives never re-trigger within the same run.
        assert_eq!(scan.observe("Ping request sent"), LineEvent::None);
        assert!(scan.stalled);
        assert!(!scan.output_started);
    }

    #[test]
    fn scan_output_started_before_threshold() {
        let mut scan = DiagnosticScan::new(2);
        assert_eq!(scan.observe("Ping request sent"), LineEvent::None);
        assert_eq!(
            scan.observe("Output #0, mp4, to 'room-1.mp4':"),
            LineEvent::OutputStarted
        );
        assert!(scan.output_started);
        assert!(!scan.stalled);
    }

    #[test]
    fn scan_ignores_ordinary_lines() {
        let mut scan = DiagnosticScan::new(1);
        assert_eq!(scan.observe("frame=  100 fps=25 size=1024kB"), LineEvent::None);
        assert_eq!(scan.observe("Stream mapping:"), LineEvent::None);
        assert_eq!(scan.pings, 0);
    }

    #[tokio::test]
    async fn resolution_failure_is_no_stream() {
        let dir = TempDir::new().unwrap();
        let supervisor =
            ProcessSupervisor::new(test_room(), Arc::new(FailingResolver), test_config(&dir));

        assert_eq!(supervisor.start().await.unwrap(), StartOutcome::NoStream);
    }

    #[tokio::test]
    async fn empty_resolution_is_no_stream() {
        let dir = TempDir::new().unwrap();
        let resolver = Arc::new(FixedResolver { sources: vec![] });
        let supervisor = ProcessSupervisor::new(test_room(), resolver, test_config(&dir));

        assert_eq!(supervisor.start().await.unwrap(), StartOutcome::NoStream);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn second_start_rejected_until_wait_observes_exit() {
        let dir = TempDir::new().unwrap();
        let resolver = Arc::new(FixedResolver {
            sources: vec![crate::sources::StreamSource {
                transport: Transport::Hls,
                quality: 720,
                url: "https://example.invalid/stream.m3u8".to_string(),
            }],
        });
        let supervisor = ProcessSupervisor::new(test_room(), resolver, test_config(&dir));

        assert!(matches!(
            supervisor.start().await.unwrap(),
            StartOutcome::Started(_)
        ));
        // The child (`true`) exits immediately, but until `wait` observes
        // that, a second start must be rejected.
        assert!(matches!(
            supervisor.start().await,
            Err(Error::CaptureActive { .. })
        ));

        let exit = supervisor.wait().await.unwrap();
        assert!(!exit.stalled);

        assert!(matches!(
            supervisor.start().await.unwrap(),
            StartOutcome::Started(_)
        ));
        supervisor.wait().await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn quick_restart_picks_a_fresh_filename() {
        let dir = TempDir::new().unwrap();
        let resolver = Arc::new(FixedResolver {
            sources: vec![crate::sources::StreamSource {
                transport: Transport::Hls,
                quality: 720,
                url: "https://example.invalid/stream.m3u8".to_string(),
            }],
        });
        let supervisor = ProcessSupervisor::new(test_room(), resolver, test_config(&dir));

        assert!(matches!(
            supervisor.start().await.unwrap(),
            StartOutcome::Started(_)
        ));
        let first = supervisor.state.lock().final_path.clone().unwrap();
        supervisor.wait().await.unwrap();

        // A finished file at the previous run's destination must not
        // block a restart within the same second.
        tokio::fs::write(&first, b"finished capture").await.unwrap();

        assert!(matches!(
            supervisor.start().await.unwrap(),
            StartOutcome::Started(_)
        ));
        let second = supervisor.state.lock().final_path.clone().unwrap();
        assert_ne!(first, second);
        supervisor.wait().await.unwrap();
    }

    #[tokio::test]
    async fn finalize_moves_once_and_noops_after() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let supervisor = ProcessSupervisor::new(
            test_room(),
            Arc::new(FixedResolver { sources: vec![] }),
            config.clone(),
        );

        tokio::fs::create_dir_all(&config.temp_dir).await.unwrap();
        tokio::fs::create_dir_all(&config.output_dir).await.unwrap();
        let temp = config.temp_dir.join("capture.mp4");
        let dest = config.output_dir.join("capture.mp4");
        tokio::fs::write(&temp, b"video bytes").await.unwrap();
        {
            let mut state = supervisor.state.lock();
            state.temp_path = Some(temp.clone());
            state.final_path = Some(dest.clone());
        }

        let moved = supervisor.finalize_output().await.unwrap();
        assert_eq!(moved, Some(dest.clone()));
        assert!(dest.exists());
        assert!(!temp.exists());
        assert_eq!(supervisor.completed_files(), vec![dest.clone()]);

        // Second call observes the missing source and no-ops.
        let moved_again = supervisor.finalize_output().await.unwrap();
        assert_eq!(moved_again, None);
        assert_eq!(supervisor.completed_files().len(), 1);
    }

    #[tokio::test]
    async fn finalize_rejects_existing_destination() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let supervisor = ProcessSupervisor::new(
            test_room(),
            Arc::new(FixedResolver { sources: vec![] }),
            config.clone(),
        );

        tokio::fs::create_dir_all(&config.temp_dir).await.unwrap();
        tokio::fs::create_dir_all(&config.output_dir).await.unwrap();
        let temp = config.temp_dir.join("capture.mp4");
        let dest = config.output_dir.join("capture.mp4");
        tokio::fs::write(&temp, b"new bytes").await.unwrap();
        tokio::fs::write(&dest, b"old bytes").await.unwrap();
        {
            let mut state = supervisor.state.lock();
            state.temp_path = Some(temp.clone());
            state.final_path = Some(dest.clone());
        }

        assert!(matches!(
            supervisor.finalize_output().await,
            Err(Error::FileExists { .. })
        ));
        // Neither file was touched.
        assert!(temp.exists());
        assert_eq!(tokio::fs::read(&dest).await.unwrap(), b"old bytes");
    }

    #[tokio::test]
    async fn existing_destination_blocks_start() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let resolver = Arc::new(FixedResolver {
            sources: vec![crate::sources::StreamSource {
                transport: Transport::Hls,
                quality: 720,
                url: "https://example.invalid/stream.m3u8".to_string(),
            }],
        });
        let room = test_room();
        let supervisor = ProcessSupervisor::new(room.clone(), resolver, config.clone());

        // Pre-create whatever filename start() would pick. The name is
        // timestamped to the second, so cover this second and the next.
        tokio::fs::create_dir_all(&config.output_dir).await.unwrap();
        let mut blocked = false;
        for _ in 0..2 {
            let name = supervisor.output_filename();
            tokio::fs::write(config.output_dir.join(&name), b"").await.unwrap();
            if matches!(supervisor.start().await, Err(Error::FileExists { .. })) {
                blocked = true;
                break;
            }
            // Filename ticked over between probe and start; reap and retry.
            let _ = supervisor.wait().await;
        }
        assert!(blocked);
    }
}
