//! Segment capture – spawns one `ffmpeg` per stream as a child process.
//!
//! The child writes fixed-length, clock-aligned segments named after their
//! start time into the stream's raw directory.  [`CaptureManager`] owns the
//! only handle to that child; a restart always reaps the old process before
//! the new one is spawned, so two encoders never write into the same
//! directory.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};

use nvr_common::config::{EncodingProfile, RecordingSettings, StreamConfig};

use crate::error::{RecorderError, Result};

/// strftime pattern handed to the segment muxer.  Colons are not allowed in
/// the pattern, so the time fields are separated by spaces.
const SEGMENT_NAME_PATTERN: &str = "%Y-%m-%dT%H %M %S%z";

/// Program and argument vector for one stream, fixed for its lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl CaptureCommand {
    pub fn for_stream(stream: &StreamConfig, recording: &RecordingSettings) -> Self {
        Self {
            program: recording.ffmpeg_path.clone(),
            args: build_args(stream, recording),
        }
    }
}

/// Output pattern for the segment muxer, e.g. `<raw>/%Y-%m-%dT%H %M %S%z.mkv`.
pub fn output_pattern(raw_dir: &Path, segment_format: &str) -> PathBuf {
    raw_dir.join(format!("{SEGMENT_NAME_PATTERN}.{segment_format}"))
}

// ── ffmpeg arguments ─────────────────────────────────────────────────────

pub fn build_args(stream: &StreamConfig, recording: &RecordingSettings) -> Vec<String> {
    let mut args: Vec<String> = [
        "-hide_banner",
        "-y",
        "-loglevel",
        "error",
        "-rtsp_transport",
        "tcp",
        // Source timestamps drift; stamp packets with the receive time.
        "-use_wallclock_as_timestamps",
        "1",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();

    match stream.profile {
        EncodingProfile::HardwareHevc => {
            args.extend(
                ["-hwaccel", "vaapi", "-hwaccel_output_format", "vaapi", "-i"]
                    .iter()
                    .map(|s| s.to_string()),
            );
            args.push(stream.source_url.clone());
            args.extend(
                ["-c:v", "hevc_vaapi", "-qp", "30", "-c:a", "copy"]
                    .iter()
                    .map(|s| s.to_string()),
            );
        }
        EncodingProfile::SoftwareCopy => {
            args.push("-i".to_string());
            args.push(stream.source_url.clone());
            args.extend(["-vcodec", "copy"].iter().map(|s| s.to_string()));
        }
    }

    args.extend(
        [
            "-f".to_string(),
            "segment".to_string(),
            "-reset_timestamps".to_string(),
            "1".to_string(),
            "-segment_time".to_string(),
            recording.segment_seconds.to_string(),
            "-segment_format".to_string(),
            recording.segment_format.clone(),
            "-segment_atclocktime".to_string(),
            "1".to_string(),
            "-strftime".to_string(),
            "1".to_string(),
        ],
    );
    args.push(
        output_pattern(&stream.raw_storage_path, &recording.segment_format)
            .to_string_lossy()
            .into_owned(),
    );
    args
}

// ── process lifecycle ────────────────────────────────────────────────────

/// A spawned child.  The monitor task owns the [`Child`]; this handle can
/// only ask it to terminate and wait for it to be reaped.
struct CaptureProcess {
    pid: Option<u32>,
    stop_tx: Option<oneshot::Sender<()>>,
    monitor: JoinHandle<()>,
}

/// Owns the (at most one) capture process of a stream.
pub struct CaptureManager {
    stream: String,
    command: CaptureCommand,
    stop_grace: Duration,
    current: Option<CaptureProcess>,
    generation: u64,
}

impl CaptureManager {
    pub fn new(stream: impl Into<String>, command: CaptureCommand, stop_grace: Duration) -> Self {
        Self {
            stream: stream.into(),
            command,
            stop_grace,
            current: None,
            generation: 0,
        }
    }

    /// Whether a child has been spawned and not yet exited.
    #[allow(dead_code)]
    pub fn is_running(&self) -> bool {
        self.current
            .as_ref()
            .is_some_and(|p| !p.monitor.is_finished())
    }

    #[allow(dead_code)]
    pub fn pid(&self) -> Option<u32> {
        self.current.as_ref().and_then(|p| p.pid)
    }

    /// Number of processes successfully spawned so far.
    #[allow(dead_code)]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Spawn the capture process.  A still-held previous process is stopped
    /// and reaped first.  On failure the handle stays empty; there is no retry
    /// here.
    pub async fn start(&mut self) -> Result<()> {
        if self.current.is_some() {
            self.stop().await;
        }

        info!("*** Spawning {} process ***", self.command.program);
        let mut cmd = Command::new(&self.command.program);
        cmd.args(&self.command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| RecorderError::Spawn {
            stream: self.stream.clone(),
            program: self.command.program.clone(),
            source,
        })?;

        let pid = child.id();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, OutputChannel::Stdout).in_current_span());
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, OutputChannel::Stderr).in_current_span());
        }

        let (stop_tx, stop_rx) = oneshot::channel();
        let monitor =
            tokio::spawn(watch_child(child, stop_rx, self.stop_grace).in_current_span());

        self.generation += 1;
        self.current = Some(CaptureProcess {
            pid,
            stop_tx: Some(stop_tx),
            monitor,
        });
        info!("Capture process started (pid={pid:?}, generation={})", self.generation);
        Ok(())
    }

    /// Terminate the current process, if any, and wait until it is reaped.
    /// A process that already exited on its own is simply cleared.
    pub async fn stop(&mut self) {
        let Some(mut process) = self.current.take() else {
            return;
        };

        info!("Stopping capture process (pid={:?})", process.pid);
        if let Some(tx) = process.stop_tx.take() {
            // Fails only if the monitor already finished, i.e. the child exited.
            let _ = tx.send(());
        }
        if let Err(e) = process.monitor.await {
            warn!("Capture monitor task failed: {e}");
        }
    }

    pub async fn restart(&mut self) -> Result<()> {
        info!("Attempting recording restart...");
        self.stop().await;
        self.start().await
    }
}

#[derive(Debug, Clone, Copy)]
enum OutputChannel {
    Stdout,
    Stderr,
}

async fn forward_lines<R: AsyncRead + Unpin>(reader: R, channel: OutputChannel) {
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if line.trim().is_empty() => {}
            Ok(Some(line)) => match channel {
                OutputChannel::Stdout => info!("[STDOUT] {line}"),
                OutputChannel::Stderr => warn!("[STDERR] {line}"),
            },
            Ok(None) => break,
            Err(e) => {
                debug!("{channel:?} stream read failed: {e}");
                break;
            }
        }
    }
    debug!("{channel:?} stream ended");
}

/// Owns the child until it exits on its own or is told to stop.
async fn watch_child(mut child: Child, stop_rx: oneshot::Receiver<()>, grace: Duration) {
    let status = tokio::select! {
        status = child.wait() => status,
        // A dropped sender means the manager is gone; stop in that case too.
        _ = stop_rx => terminate(&mut child, grace).await,
    };

    match status {
        Ok(status) => log_exit(status),
        Err(e) => warn!("[ERROR] cannot wait for capture process: {e}"),
    }
}

async fn terminate(child: &mut Child, grace: Duration) -> std::io::Result<ExitStatus> {
    request_termination(child);
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => status,
        Err(_) => {
            warn!("Capture process still running {grace:?} after SIGTERM, killing");
            if let Err(e) = child.start_kill() {
                debug!("kill failed (process already gone?): {e}");
            }
            child.wait().await
        }
    }
}

#[cfg(unix)]
fn request_termination(child: &mut Child) {
    let Some(pid) = child.id() else {
        return;
    };
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return;
    };
    // SAFETY: `pid` is our own child and has not been reaped, so the id
    // cannot have been recycled.
    let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
    if rc != 0 {
        debug!("SIGTERM to {pid} failed: {}", std::io::Error::last_os_error());
    }
}

#[cfg(not(unix))]
fn request_termination(child: &mut Child) {
    if let Err(e) = child.start_kill() {
        debug!("kill failed (process already gone?): {e}");
    }
}

fn log_exit(status: ExitStatus) {
    match status.code() {
        Some(code) => info!("[EXIT] code {code}"),
        None => info!("[EXIT] {status}"),
    }
}

// ─── tests ───────────────────────────────────────────────────────────────
