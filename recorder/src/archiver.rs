//! Segment archiver – moves finished segments into the dated tree.
//!
//! Every poll lists the raw directory, holds back the newest segment (the
//! capture process is still writing it) and renames each older one to
//! `<storage>/<YYYY>/<MM>/<DD>/<YYYY-MM-DDTHH MM SS>.<ext>`, adding a `_<n>`
//! suffix rather than replacing a segment already archived under that name.
//! A single `rename` per file means a crash leaves a segment either in raw or
//! in the archive, never in both.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::fs;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use nvr_common::config::StreamConfig;
use nvr_common::segment::{archive_path, parse_segment_name, TimeMode};

use crate::error::{RecorderError, Result};

/// Counts from one archive pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CycleReport {
    pub moved: usize,
    /// Names that did not parse even after truncation.
    pub skipped: usize,
    /// Directory creation or rename failures; retried next cycle.
    pub failed: usize,
}

pub struct SegmentArchiver {
    raw_dir: PathBuf,
    storage_dir: PathBuf,
    extension: String,
    /// Calendar used for directory and file names.
    filing: TimeMode,
    /// Zone the capture process names files in; used for truncated names.
    capture_zone: TimeMode,
}

impl SegmentArchiver {
    pub fn new(stream: &StreamConfig, extension: &str, filing: TimeMode) -> Self {
        Self {
            raw_dir: stream.raw_storage_path.clone(),
            storage_dir: stream.storage_path.clone(),
            extension: extension.to_string(),
            filing,
            capture_zone: TimeMode::Local,
        }
    }

    pub fn with_capture_zone(mut self, zone: TimeMode) -> Self {
        self.capture_zone = zone;
        self
    }

    /// Segments in the raw directory that are safe to move, oldest first.
    /// The lexicographically last segment is never included.
    pub async fn completed_segments(&self) -> Result<Vec<PathBuf>> {
        let list_err = |source| RecorderError::ListDir {
            path: self.raw_dir.clone(),
            source,
        };

        let mut entries = fs::read_dir(&self.raw_dir).await.map_err(list_err)?;
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(list_err)? {
            let is_file = entry.file_type().await.map(|t| t.is_file()).unwrap_or(false);
            if !is_file {
                continue;
            }
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some(self.extension.as_str()) {
                names.push(entry.file_name());
            }
        }

        names.sort();
        names.pop();
        Ok(names.into_iter().map(|n| self.raw_dir.join(n)).collect())
    }

    /// Move one segment into the archive and return its new path.
    pub async fn archive_segment(&self, path: &Path) -> Result<PathBuf> {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let stamp = parse_segment_name(&file_name, self.capture_zone).map_err(|source| {
            RecorderError::Timestamp {
                path: path.to_path_buf(),
                source,
            }
        })?;
        if stamp.truncated {
            warn!("Invalid file date in {file_name:?}, used the first 19 characters");
        }

        let wanted = archive_path(&self.storage_dir, &stamp.instant, self.filing, &self.extension);
        if let Some(dir) = wanted.parent() {
            fs::create_dir_all(dir)
                .await
                .map_err(|source| RecorderError::CreateDir {
                    path: dir.to_path_buf(),
                    source,
                })?;
        }

        let destination = free_destination(wanted).await?;
        fs::rename(path, &destination)
            .await
            .map_err(|source| RecorderError::Move {
                from: path.to_path_buf(),
                to: destination.clone(),
                source,
            })?;
        Ok(destination)
    }

    /// One archive pass.  Per-file problems are logged and counted; only a
    /// failure to list the raw directory is returned.
    pub async fn run_cycle(&self) -> Result<CycleReport> {
        let mut report = CycleReport::default();

        for path in self.completed_segments().await? {
            match self.archive_segment(&path).await {
                Ok(destination) => {
                    info!("Moved {}", destination.display());
                    report.moved += 1;
                }
                Err(e @ RecorderError::Timestamp { .. }) => {
                    warn!("Still an invalid file date, leaving in place: {e}");
                    report.skipped += 1;
                }
                Err(e) => {
                    error!("Archiving failed, will retry: {e}");
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }

    /// Poll every `interval` until cancelled.
    pub async fn run(self, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match self.run_cycle().await {
                Ok(report) if report.skipped + report.failed > 0 => warn!(
                    "Archive cycle: moved={} skipped={} failed={}",
                    report.moved, report.skipped, report.failed
                ),
                Ok(report) => debug!("Archive cycle: moved={}", report.moved),
                Err(e) => error!("Archive cycle aborted: {e}"),
            }
        }
        debug!("Archiver stopped");
    }
}

/// `wanted`, or `<stem>_<n>.<ext>` with the smallest free `n` when an
/// archived segment already holds that name.  Archive names carry no UTC
/// offset, so two segments can map to the same name (repeated local hour
/// at a DST change, a changed capture zone).  Only this stream's archiver
/// writes into its tree.
async fn free_destination(wanted: PathBuf) -> Result<PathBuf> {
    if !fs::try_exists(&wanted).await? {
        return Ok(wanted);
    }

    let stem = wanted
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let extension = wanted
        .extension()
        .map(|e| e.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mut n = 1u32;
    loop {
        let candidate = wanted.with_file_name(format!("{stem}_{n}.{extension}"));
        if !fs::try_exists(&candidate).await? {
            warn!(
                "{} already archived, filing as {}",
                wanted.display(),
                candidate.display()
            );
            return Ok(candidate);
        }
        n += 1;
    }
}

// ─── tests ───────────────────────────────────────────────────────────────
