//! NVR Recorder – records every configured camera into a dated archive.
//!
//! This binary:
//! 1. Reads configuration from `recorder.toml`
//! 2. Starts one supervision unit per camera (ffmpeg capture, liveness
//!    watchdog, segment archiver, daily merge)
//! 3. Runs until SIGINT/SIGTERM, then stops every capture process.

mod archiver;
mod capture;
mod error;
mod merge;
mod supervisor;
mod watchdog;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::fmt::time::{ChronoLocal, ChronoUtc};
use tracing_subscriber::EnvFilter;

use nvr_common::config::Config;

use crate::merge::{DayMerger, FfmpegConcatMerger};

fn init_logging(local_time: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if local_time {
        builder.with_timer(ChronoLocal::rfc_3339()).init();
    } else {
        builder.with_timer(ChronoUtc::rfc_3339()).init();
    }
}

fn config_path() -> PathBuf {
    std::env::args()
        .nth(1)
        .or_else(|| std::env::var("NVR_CONFIG").ok())
        .unwrap_or_else(|| Config::default_path().to_string())
        .into()
}

#[tokio::main]
async fn main() -> Result<()> {
    // ── load config ──────────────────────────────────────────────────
    // The log timer depends on the config, so logging starts afterwards.
    let config_path = config_path();
    let config = nvr_common::config::load(&config_path).context("Config load failed")?;
    init_logging(config.storage.local_time_format);

    info!(
        "NVR Recorder starting (config={}, root={}, cameras={})",
        config_path.display(),
        config.storage.rootpath.display(),
        config.cameras.len()
    );
    let config = Arc::new(config);

    // ── ctrl-c / SIGTERM ─────────────────────────────────────────────
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    ctrlc::set_handler(move || {
        info!("Shutdown signal received");
        on_signal.cancel();
    })
    .context("Cannot set Ctrl-C handler")?;

    // ── start supervision units ──────────────────────────────────────
    let merger: Arc<dyn DayMerger> = Arc::new(FfmpegConcatMerger::new(
        &config.recording.ffmpeg_path,
        &config.recording.segment_format,
    ));
    let mut units = JoinSet::new();
    let started = supervisor::spawn_all(&config, &merger, &cancel, &mut units)
        .context("Cannot initialise cameras")?;
    info!("{started} camera(s) recording");

    // Units only return once `cancel` fires.
    while let Some(joined) = units.join_next().await {
        if let Err(e) = joined {
            error!("Stream supervisor failed: {e}");
        }
    }

    info!("NVR Recorder stopped");
    Ok(())
}
