//! Stream supervisor – one per configured camera.
//!
//! Owns the stream's [`CaptureManager`] and runs the watchdog, archiver and
//! merge scheduler next to it.  Only this task touches the capture handle:
//! the watchdog asks for restarts over a channel, so restarts and the final
//! stop are serialized.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument, Span};

use nvr_common::config::{Config, StreamConfig};

use crate::archiver::SegmentArchiver;
use crate::capture::{CaptureCommand, CaptureManager};
use crate::error::{RecorderError, Result};
use crate::merge::{DayMerger, MergeScheduler};
use crate::watchdog::{activity_channel, watch_directory, Activity, Watchdog};

pub struct StreamSupervisor {
    stream: StreamConfig,
    config: Arc<Config>,
    merger: Arc<dyn DayMerger>,
}

impl StreamSupervisor {
    /// Creates the raw directory.  Failing to do so is fatal for startup.
    pub fn new(stream: StreamConfig, config: Arc<Config>, merger: Arc<dyn DayMerger>) -> Result<Self> {
        std::fs::create_dir_all(&stream.raw_storage_path).map_err(|source| {
            RecorderError::CreateDir {
                path: stream.raw_storage_path.clone(),
                source,
            }
        })?;
        Ok(Self {
            stream,
            config,
            merger,
        })
    }

    #[allow(dead_code)]
    pub fn name(&self) -> &str {
        &self.stream.name
    }

    /// Span that tags every log line of this unit with the stream name.
    pub fn span(&self) -> Span {
        info_span!("stream", name = %self.stream.name)
    }

    /// Record until `cancel` fires, then stop the capture process and wait
    /// for the sibling tasks.
    pub async fn run(self, cancel: CancellationToken) {
        let recording = &self.config.recording;
        let mode = self.config.time_mode();
        info!(
            "Initialising camera ({} encoding, {}s segments)",
            self.stream.profile, recording.segment_seconds
        );

        let (activity_tx, activity_rx) = activity_channel();
        let (restart_tx, mut restart_rx) = mpsc::channel(4);

        let watch = match watch_directory(
            &self.stream.raw_storage_path,
            recording.liveness,
            activity_tx.clone(),
        ) {
            Ok(watch) => Some(watch),
            Err(e) => {
                error!("{e}; restarts will be driven by the timer alone");
                None
            }
        };

        let mut tasks = JoinSet::new();
        tasks.spawn(
            Watchdog::new(recording.watchdog_timeout())
                .run(activity_rx, restart_tx, cancel.clone())
                .in_current_span(),
        );
        tasks.spawn(
            SegmentArchiver::new(&self.stream, &recording.segment_format, mode)
                .run(recording.archive_interval(), cancel.clone())
                .in_current_span(),
        );
        tasks.spawn(
            MergeScheduler::new(
                self.stream.storage_path.clone(),
                mode,
                recording.merge_hour,
                self.merger.clone(),
            )
            .run(cancel.clone())
            .in_current_span(),
        );

        let mut capture = CaptureManager::new(
            self.stream.name.clone(),
            CaptureCommand::for_stream(&self.stream, recording),
            recording.stop_grace(),
        );
        if let Err(e) = capture.start().await {
            error!("startRecording error: {e}");
        }
        let _ = activity_tx.send(Activity::StartAttempted).await;
        info!("Camera initialised");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(request) = restart_rx.recv() => {
                    warn!(
                        "No segment activity for {}s, restarting capture",
                        request.silent_for.as_secs()
                    );
                    if let Err(e) = capture.restart().await {
                        error!("startRecording error: {e}");
                    }
                    let _ = activity_tx.send(Activity::StartAttempted).await;
                }
            }
        }

        info!("Shutting down");
        capture.stop().await;
        drop(watch);
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!("Stream task failed: {e}");
            }
        }
        info!("Camera stopped");
    }
}

/// Spawn one supervisor per stream into `units`, each inside its own span.
pub fn spawn_all(
    config: &Arc<Config>,
    merger: &Arc<dyn DayMerger>,
    cancel: &CancellationToken,
    units: &mut JoinSet<()>,
) -> Result<usize> {
    // Create every raw directory before any capture starts.
    let supervisors = config
        .stream_configs()
        .into_iter()
        .map(|stream| StreamSupervisor::new(stream, config.clone(), merger.clone()))
        .collect::<Result<Vec<_>>>()?;

    let count = supervisors.len();
    for supervisor in supervisors {
        let span = supervisor.span();
        units.spawn(supervisor.run(cancel.clone()).instrument(span));
    }
    Ok(count)
}

// ─── tests ───────────────────────────────────────────────────────────────
