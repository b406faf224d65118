//! Daily merge – concatenates yesterday's archived segments into one file.
//!
//! The scheduler wakes once a day at `merge_hour:00` in the configured
//! calendar, resolves "yesterday" to its day directory and hands it to a
//! [`DayMerger`].  A failed merge is logged; the next day is unaffected.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::fs;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use nvr_common::segment::{day_directory, next_daily_run, yesterday_midnight, TimeMode};

use crate::error::{RecorderError, Result};

/// Combines the segments of one day directory into a single file.
#[async_trait]
pub trait DayMerger: Send + Sync {
    /// Returns the merged file, or `None` when there was nothing to do.
    async fn merge_day(&self, day_dir: &Path, overwrite: bool) -> Result<Option<PathBuf>>;
}

// ── ffmpeg concat demuxer ────────────────────────────────────────────────

/// Stream-copies a day's segments into `<day_dir>/<YYYY-MM-DD>.<ext>`.
pub struct FfmpegConcatMerger {
    ffmpeg_path: String,
    extension: String,
}

impl FfmpegConcatMerger {
    pub fn new(ffmpeg_path: impl Into<String>, extension: impl Into<String>) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
            extension: extension.into(),
        }
    }

    /// `<root>/cam1/2024/03/09` → `2024-03-09.<ext>`.
    pub fn output_name(&self, day_dir: &Path) -> String {
        let parts: Vec<String> = day_dir
            .components()
            .rev()
            .take(3)
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        let stem = if parts.len() == 3 {
            format!("{}-{}-{}", parts[2], parts[1], parts[0])
        } else {
            "merged".to_string()
        };
        format!("{stem}.{}", self.extension)
    }

    async fn segments(&self, day_dir: &Path, output_name: &str) -> Result<Vec<PathBuf>> {
        let list_err = |source| RecorderError::ListDir {
            path: day_dir.to_path_buf(),
            source,
        };
        let mut entries = fs::read_dir(day_dir).await.map_err(list_err)?;
        let mut segments = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(list_err)? {
            let path = entry.path();
            let is_segment = path.extension().and_then(|e| e.to_str()) == Some(self.extension.as_str());
            if is_segment && entry.file_name() != output_name {
                segments.push(path);
            }
        }
        segments.sort();
        Ok(segments)
    }
}

/// Input list for the concat demuxer.  Single quotes are closed, escaped and
/// reopened.
pub fn concat_list(segments: &[PathBuf]) -> String {
    segments
        .iter()
        .map(|p| format!("file '{}'\n", p.to_string_lossy().replace('\'', r"'\''")))
        .collect()
}

#[async_trait]
impl DayMerger for FfmpegConcatMerger {
    async fn merge_day(&self, day_dir: &Path, overwrite: bool) -> Result<Option<PathBuf>> {
        if !fs::try_exists(day_dir).await.unwrap_or(false) {
            debug!("No recordings in {}, nothing to merge", day_dir.display());
            return Ok(None);
        }

        let output_name = self.output_name(day_dir);
        let output = day_dir.join(&output_name);
        if !overwrite && fs::try_exists(&output).await.unwrap_or(false) {
            info!("{} already merged", day_dir.display());
            return Ok(None);
        }

        let segments = self.segments(day_dir, &output_name).await?;
        if segments.is_empty() {
            debug!("No segments in {}, nothing to merge", day_dir.display());
            return Ok(None);
        }

        let list_path = day_dir.join(".concat.txt");
        fs::write(&list_path, concat_list(&segments)).await?;

        info!("Combining {} segment(s) into {}", segments.len(), output.display());
        let result = Command::new(&self.ffmpeg_path)
            .args(["-hide_banner", "-loglevel", "error", "-y", "-f", "concat", "-safe", "0", "-i"])
            .arg(&list_path)
            .args(["-c", "copy"])
            .arg(&output)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await;

        if let Err(e) = fs::remove_file(&list_path).await {
            debug!("Cannot remove {}: {e}", list_path.display());
        }

        let merge_err = |reason: String| RecorderError::Merge {
            dir: day_dir.to_path_buf(),
            reason,
        };
        let out = result.map_err(|e| merge_err(format!("cannot run {}: {e}", self.ffmpeg_path)))?;
        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            return Err(merge_err(format!("{} ({})", out.status, stderr.trim())));
        }
        Ok(Some(output))
    }
}

// ── scheduler ────────────────────────────────────────────────────────────

pub struct MergeScheduler {
    storage_dir: PathBuf,
    mode: TimeMode,
    hour: u32,
    merger: Arc<dyn DayMerger>,
}

impl MergeScheduler {
    pub fn new(storage_dir: PathBuf, mode: TimeMode, hour: u32, merger: Arc<dyn DayMerger>) -> Self {
        Self {
            storage_dir,
            mode,
            hour,
            merger,
        }
    }

    /// Day directory that a run at `now` merges.
    pub fn target_directory(&self, now: &DateTime<Utc>) -> Result<PathBuf> {
        let yesterday = yesterday_midnight(self.mode, now).map_err(|source| {
            RecorderError::Timestamp {
                path: self.storage_dir.clone(),
                source,
            }
        })?;
        Ok(day_directory(&self.storage_dir, &yesterday))
    }

    /// Merge yesterday's directory, overwriting an earlier merged file.
    pub async fn run_once(&self, now: &DateTime<Utc>) -> Result<Option<PathBuf>> {
        let dir = self.target_directory(now)?;
        self.merger.merge_day(&dir, true).await
    }

    pub async fn run(self, cancel: CancellationToken) {
        loop {
            let now = Utc::now();
            let next = match next_daily_run(self.mode, &now, self.hour) {
                Ok(next) => next,
                Err(e) => {
                    error!("Cannot schedule daily merge: {e}");
                    break;
                }
            };
            let wait = (next.with_timezone(&Utc) - now).to_std().unwrap_or_default();
            debug!("Next merge at {} (in {}s)", next.to_rfc3339(), wait.as_secs());

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }

            match self.run_once(&Utc::now()).await {
                Ok(Some(output)) => info!("Merged {}", output.display()),
                Ok(None) => {}
                Err(e) => error!("error combining files: {e}"),
            }
        }
        debug!("Merge scheduler stopped");
    }
}

// ─── tests ───────────────────────────────────────────────────────────────
