//! Configuration parsing – reads the recorder's TOML file.
//!
//! The file carries three sections: `[storage]` (where recordings live and
//! which calendar they are filed by), an optional `[recording]` block of
//! tuning knobs, and one `[[camera]]` table per stream.  The result is an
//! immutable [`Config`] that is handed to every supervision unit.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tracing::{info, warn};

use crate::segment::TimeMode;

/// Application configuration, shared read-only between all stream units.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub storage: StorageSettings,
    #[serde(default)]
    pub recording: RecordingSettings,
    #[serde(rename = "camera", alias = "cameras", default)]
    pub cameras: Vec<CameraConfig>,
}

/// Global storage settings.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageSettings {
    pub rootpath: PathBuf,
    /// File and log timestamps use the host's local calendar instead of UTC.
    #[serde(default, alias = "localTimeFormat")]
    pub local_time_format: bool,
    /// Re-encode to HEVC on a VAAPI device instead of stream-copying.
    #[serde(default)]
    pub hevc_vaapi: bool,
}

/// Timing and backend knobs.  Every field has a default.
#[derive(Debug, Clone, Deserialize)]
pub struct RecordingSettings {
    #[serde(default = "default_segment_seconds")]
    pub segment_seconds: u32,
    #[serde(default = "default_segment_format")]
    pub segment_format: String,
    #[serde(default = "default_watchdog_timeout_secs")]
    pub watchdog_timeout_secs: u64,
    #[serde(default = "default_archive_interval_secs")]
    pub archive_interval_secs: u64,
    #[serde(default = "default_merge_hour")]
    pub merge_hour: u32,
    #[serde(default = "default_stop_grace_secs")]
    pub stop_grace_secs: u64,
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: String,
    #[serde(default)]
    pub liveness: LivenessPolicy,
}

impl Default for RecordingSettings {
    fn default() -> Self {
        Self {
            segment_seconds: default_segment_seconds(),
            segment_format: default_segment_format(),
            watchdog_timeout_secs: default_watchdog_timeout_secs(),
            archive_interval_secs: default_archive_interval_secs(),
            merge_hour: default_merge_hour(),
            stop_grace_secs: default_stop_grace_secs(),
            ffmpeg_path: default_ffmpeg_path(),
            liveness: LivenessPolicy::default(),
        }
    }
}

impl RecordingSettings {
    pub fn watchdog_timeout(&self) -> Duration {
        Duration::from_secs(self.watchdog_timeout_secs)
    }

    pub fn archive_interval(&self) -> Duration {
        Duration::from_secs(self.archive_interval_secs)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }
}

/// Which filesystem notifications count as proof that a stream is alive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LivenessPolicy {
    /// Only writes into segment files.  Renames and removals (including the
    /// archiver moving finished segments out) are ignored.
    #[default]
    ContentChanges,
    /// Any create, write or remove in the raw directory.
    AnyActivity,
}

/// One `[[camera]]` entry.
#[derive(Debug, Clone, Deserialize)]
pub struct CameraConfig {
    pub name: String,
    #[serde(alias = "sourceURL", alias = "source_url")]
    pub url: String,
}

fn default_segment_seconds() -> u32 {
    300
}

fn default_segment_format() -> String {
    "mkv".to_string()
}

fn default_watchdog_timeout_secs() -> u64 {
    310
}

fn default_archive_interval_secs() -> u64 {
    15
}

fn default_merge_hour() -> u32 {
    3
}

fn default_stop_grace_secs() -> u64 {
    5
}

fn default_ffmpeg_path() -> String {
    "ffmpeg".to_string()
}

/// How a stream's capture process encodes its input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodingProfile {
    HardwareHevc,
    SoftwareCopy,
}

impl std::fmt::Display for EncodingProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::HardwareHevc => f.write_str("hardware-hevc"),
            Self::SoftwareCopy => f.write_str("software-copy"),
        }
    }
}

/// Resolved, immutable identity of one recorded stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamConfig {
    pub name: String,
    pub source_url: String,
    pub profile: EncodingProfile,
    /// `<rootpath>/<name>` – root of the dated archive.
    pub storage_path: PathBuf,
    /// `<rootpath>/<name>/raw` – where the capture process writes.
    pub raw_storage_path: PathBuf,
}

impl StreamConfig {
    pub fn new(root: &Path, camera: &CameraConfig, profile: EncodingProfile) -> Self {
        let storage_path = root.join(&camera.name);
        let raw_storage_path = storage_path.join("raw");
        Self {
            name: camera.name.clone(),
            source_url: camera.url.clone(),
            profile,
            storage_path,
            raw_storage_path,
        }
    }
}

impl Config {
    /// Default config path.
    pub fn default_path() -> &'static str {
        "/etc/nvr/recorder.toml"
    }

    /// Calendar used for archive paths, merge scheduling and log stamps.
    pub fn time_mode(&self) -> TimeMode {
        TimeMode::from_local_flag(self.storage.local_time_format)
    }

    pub fn profile(&self) -> EncodingProfile {
        if self.storage.hevc_vaapi {
            EncodingProfile::HardwareHevc
        } else {
            EncodingProfile::SoftwareCopy
        }
    }

    /// One [`StreamConfig`] per configured camera, in file order.
    pub fn stream_configs(&self) -> Vec<StreamConfig> {
        let profile = self.profile();
        self.cameras
            .iter()
            .map(|cam| StreamConfig::new(&self.storage.rootpath, cam, profile))
            .collect()
    }

    /// Reject configurations that would make streams collide or never record.
    pub fn validate(&self) -> Result<()> {
        if self.cameras.is_empty() {
            bail!("No [[camera]] entries configured");
        }

        let mut seen = HashSet::new();
        for cam in &self.cameras {
            let name = cam.name.as_str();
            if name.trim().is_empty() {
                bail!("Camera with url {} has an empty name", cam.url);
            }
            if name.trim() != name {
                bail!("Camera name {:?} has leading or trailing whitespace", cam.name);
            }
            if name.contains('/') || name.contains('\\') || name == "." || name == ".." {
                bail!("Camera name {:?} is not a valid directory name", cam.name);
            }
            if !seen.insert(name) {
                bail!("Duplicate camera name {:?}", cam.name);
            }
            if cam.url.trim().is_empty() {
                bail!("Camera {:?} has an empty url", cam.name);
            }
        }

        let rec = &self.recording;
        if rec.segment_seconds == 0 {
            bail!("segment_seconds must be greater than zero");
        }
        if rec.watchdog_timeout_secs == 0 {
            bail!("watchdog_timeout_secs must be greater than zero");
        }
        if rec.archive_interval_secs == 0 {
            bail!("archive_interval_secs must be greater than zero");
        }
        if rec.merge_hour > 23 {
            bail!("merge_hour must be in 0..=23, got {}", rec.merge_hour);
        }
        if rec.segment_format.is_empty()
            || !rec.segment_format.chars().all(|c| c.is_ascii_alphanumeric())
        {
            bail!("segment_format {:?} is not a plain file extension", rec.segment_format);
        }
        if rec.watchdog_timeout_secs <= u64::from(rec.segment_seconds) {
            warn!(
                "watchdog_timeout_secs ({}) is not longer than segment_seconds ({}); \
                 containers that flush once per segment will trigger spurious restarts",
                rec.watchdog_timeout_secs, rec.segment_seconds
            );
        }
        Ok(())
    }
}

/// Parse configuration text without touching the filesystem.
pub fn parse(text: &str) -> Result<Config> {
    let config: Config = toml::from_str(text).context("Invalid recorder configuration")?;
    config.validate()?;
    Ok(config)
}

/// Load and validate the configuration file at `path`.
pub fn load(path: &Path) -> Result<Config> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Cannot read config: {}", path.display()))?;

    let config = parse(&text).with_context(|| format!("In {}", path.display()))?;
    info!(
        "Loaded config from {} ({} camera(s), root={})",
        path.display(),
        config.cameras.len(),
        config.storage.rootpath.display()
    );
    Ok(config)
}

// ─── tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[storage]
rootpath = "/recordings"
localTimeFormat = true
hevc_vaapi = false

[[camera]]
name = "cam1"
url = "rtsp://10.0.0.2/stream1"

[[camera]]
name = "cam2"
sourceURL = "rtsp://10.0.0.3/stream1"
"#;

    #[test]
    fn test_parse_sample_with_defaults() {
        let config = parse(SAMPLE).unwrap();
        assert!(config.storage.local_time_format);
        assert_eq!(config.cameras.len(), 2);
        assert_eq!(config.cameras[1].url, "rtsp://10.0.0.3/stream1");
        assert_eq!(config.recording.segment_seconds, 300);
        assert_eq!(config.recording.watchdog_timeout_secs, 310);
        assert_eq!(config.recording.archive_interval_secs, 15);
        assert_eq!(config.recording.merge_hour, 3);
        assert_eq!(config.recording.segment_format, "mkv");
        assert_eq!(config.recording.liveness, LivenessPolicy::ContentChanges);
        assert_eq!(config.time_mode(), TimeMode::Local);
    }

    #[test]
    fn test_stream_paths_and_profile() {
        let config = parse(SAMPLE).unwrap();
        let streams = config.stream_configs();
        assert_eq!(streams[0].name, "cam1");
        assert_eq!(streams[0].storage_path, PathBuf::from("/recordings/cam1"));
        assert_eq!(streams[0].raw_storage_path, PathBuf::from("/recordings/cam1/raw"));
        assert_eq!(streams[0].profile, EncodingProfile::SoftwareCopy);

        let hevc = SAMPLE.replace("hevc_vaapi = false", "hevc_vaapi = true");
        let config = parse(&hevc).unwrap();
        assert!(config
            .stream_configs()
            .iter()
            .all(|s| s.profile == EncodingProfile::HardwareHevc));
    }

    #[test]
    fn test_recording_overrides() {
        let text = format!(
            "{SAMPLE}\n[recording]\nsegment_seconds = 60\nliveness = \"any-activity\"\nmerge_hour = 1\n"
        );
        let config = parse(&text).unwrap();
        assert_eq!(config.recording.segment_seconds, 60);
        assert_eq!(config.recording.merge_hour, 1);
        assert_eq!(config.recording.liveness, LivenessPolicy::AnyActivity);
        assert_eq!(config.recording.archive_interval(), Duration::from_secs(15));
    }

    #[test]
    fn test_rejects_duplicate_names() {
        let text = SAMPLE.replace("cam2", "cam1");
        let err = parse(&text).unwrap_err();
        assert!(format!("{err:#}").contains("Duplicate camera name"));
    }

    #[test]
    fn test_rejects_path_like_names_and_empty_list() {
        let text = SAMPLE.replace("\"cam2\"", "\"../etc\"");
        assert!(parse(&text).is_err());

        let text = "[storage]\nrootpath = \"/recordings\"\n";
        let err = parse(text).unwrap_err();
        assert!(format!("{err:#}").contains("No [[camera]]"));
    }

    #[test]
    fn test_rejects_bad_merge_hour() {
        let text = format!("{SAMPLE}\n[recording]\nmerge_hour = 24\n");
        assert!(parse(&text).is_err());
    }

    #[test]
    fn test_rejects_zero_watchdog_timeout() {
        let text = format!("{SAMPLE}\n[recording]\nwatchdog_timeout_secs = 0\n");
        let err = parse(&text).unwrap_err();
        assert!(format!("{err:#}").contains("watchdog_timeout_secs"));

        let text = format!("{SAMPLE}\n[recording]\nwatchdog_timeout_secs = 1\n");
        assert_eq!(parse(&text).unwrap().recording.watchdog_timeout_secs, 1);
    }

    #[test]
    fn test_rejects_names_with_surrounding_whitespace() {
        let text = SAMPLE.replace("\"cam2\"", "\"cam2 \"");
        let err = parse(&text).unwrap_err();
        assert!(format!("{err:#}").contains("whitespace"));

        // Would otherwise pass the duplicate check as a distinct name.
        let text = SAMPLE.replace("\"cam2\"", "\" cam1\"");
        assert!(parse(&text).is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("recorder.toml");
        std::fs::write(&path, SAMPLE).unwrap();
        let config = load(&path).unwrap();
        assert_eq!(config.storage.rootpath, PathBuf::from("/recordings"));

        let missing = load(&dir.path().join("missing.toml")).unwrap_err();
        assert!(format!("{missing:#}").contains("Cannot read config"));
    }
}
