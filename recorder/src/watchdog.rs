//! Liveness watchdog – infers stream health from raw-directory activity.
//!
//! A capture process can hang without exiting, so the only reliable signal
//! is that segment files keep growing.  Every qualifying filesystem event
//! re-arms a one-shot timer; if the timer expires the watchdog asks the
//! supervisor for a restart and arms itself again.
//!
//! ```text
//! Unarmed --activity--> Armed --activity--> Armed (fresh deadline)
//!                         |
//!                         +--deadline--> emit restart, Armed (fresh deadline)
//! ```

use std::path::Path;
use std::time::Duration;

use notify::event::{AccessKind, AccessMode, ModifyKind};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use nvr_common::config::LivenessPolicy;

use crate::error::{RecorderError, Result};

/// Capacity of the activity channel.  Overflow is harmless: one pending
/// signal re-arms the timer as well as a hundred.
const ACTIVITY_BUFFER: usize = 64;

/// Something that proves the stream is alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activity {
    /// A segment file in the raw directory changed.
    FileChanged,
    /// The supervisor tried to (re)start the capture process.  Sent even when
    /// the spawn failed, so the timer retries it after one window.
    StartAttempted,
}

/// A request from the watchdog to restart the capture process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartRequest {
    /// How long the directory had been silent.
    pub silent_for: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogState {
    Unarmed,
    Armed { deadline: Instant },
}

/// Timer state of one stream.  Pure: time is passed in.
#[derive(Debug)]
pub struct Watchdog {
    timeout: Duration,
    state: WatchdogState,
}

impl Watchdog {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            state: WatchdogState::Unarmed,
        }
    }

    #[allow(dead_code)]
    pub fn state(&self) -> WatchdogState {
        self.state
    }

    pub fn deadline(&self) -> Option<Instant> {
        match self.state {
            WatchdogState::Unarmed => None,
            WatchdogState::Armed { deadline } => Some(deadline),
        }
    }

    /// Cancel any pending deadline and arm a fresh one.
    pub fn on_activity(&mut self, now: Instant) {
        self.state = WatchdogState::Armed {
            deadline: now + self.timeout,
        };
    }

    /// Returns a restart request if the deadline has passed, re-arming the
    /// timer in that case.
    pub fn poll_expired(&mut self, now: Instant) -> Option<RestartRequest> {
        let deadline = self.deadline()?;
        if now < deadline {
            return None;
        }
        self.on_activity(now);
        Some(RestartRequest {
            silent_for: self.timeout + (now - deadline),
        })
    }

    /// Drive the state machine until `cancel` fires.
    ///
    /// A closed activity channel (watch lost) leaves the timer running on its
    /// own, which restarts the stream once per window.
    pub async fn run(
        mut self,
        mut activity: mpsc::Receiver<Activity>,
        restarts: mpsc::Sender<RestartRequest>,
        cancel: CancellationToken,
    ) {
        let mut activity_open = true;
        loop {
            let deadline = self.deadline();
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = activity.recv(), if activity_open => match event {
                    Some(event) => {
                        debug!("Liveness signal: {event:?}");
                        self.on_activity(Instant::now());
                    }
                    None => {
                        warn!("Activity channel closed; watchdog continues on its timer");
                        activity_open = false;
                    }
                },
                _ = sleep_until_deadline(deadline) => {
                    if let Some(request) = self.poll_expired(Instant::now()) {
                        info!("File change timeout ({}s without activity)", request.silent_for.as_secs());
                        if restarts.send(request).await.is_err() {
                            debug!("Restart receiver gone, stopping watchdog");
                            break;
                        }
                    }
                }
            }
        }
        debug!("Watchdog stopped");
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Whether a filesystem event counts as a liveness signal under `policy`.
pub fn is_liveness_signal(kind: &EventKind, policy: LivenessPolicy) -> bool {
    let content_change = matches!(
        kind,
        EventKind::Modify(ModifyKind::Data(_))
            | EventKind::Modify(ModifyKind::Any)
            | EventKind::Access(AccessKind::Close(AccessMode::Write))
    );
    match policy {
        LivenessPolicy::ContentChanges => content_change,
        LivenessPolicy::AnyActivity => {
            content_change
                || matches!(
                    kind,
                    EventKind::Create(_) | EventKind::Remove(_) | EventKind::Modify(_)
                )
        }
    }
}

/// Handle that keeps the filesystem subscription alive.
pub struct DirectoryWatch {
    _watcher: RecommendedWatcher,
}

/// Subscribe to change notifications in `dir` (non-recursive).  Qualifying
/// events are forwarded as [`Activity::FileChanged`] into `tx`.
pub fn watch_directory(
    dir: &Path,
    policy: LivenessPolicy,
    tx: mpsc::Sender<Activity>,
) -> Result<DirectoryWatch> {
    let watch_err = |source| RecorderError::Watch {
        path: dir.to_path_buf(),
        source,
    };

    let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        match res {
            Ok(event) if is_liveness_signal(&event.kind, policy) => {
                // Full channel: a signal is already pending, dropping is fine.
                let _ = tx.try_send(Activity::FileChanged);
            }
            Ok(_) => {}
            Err(e) => warn!("Filesystem watch error: {e}"),
        }
    })
    .map_err(watch_err)?;

    watcher
        .watch(dir, RecursiveMode::NonRecursive)
        .map_err(watch_err)?;
    info!("Watching {} for segment activity", dir.display());

    Ok(DirectoryWatch { _watcher: watcher })
}

pub fn activity_channel() -> (mpsc::Sender<Activity>, mpsc::Receiver<Activity>) {
    mpsc::channel(ACTIVITY_BUFFER)
}

// ─── tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, DataChange, MetadataKind, RemoveKind, RenameMode};

    const TIMEOUT: Duration = Duration::from_secs(310);

    #[test]
    fn test_starts_unarmed() {
        let mut wd = Watchdog::new(TIMEOUT);
        assert_eq!(wd.state(), WatchdogState::Unarmed);
        assert!(wd.poll_expired(Instant::now() + TIMEOUT * 10).is_none());
    }

    #[test]
    fn test_activity_resets_deadline() {
        let start = Instant::now();
        let mut wd = Watchdog::new(TIMEOUT);
        wd.on_activity(start);
        assert_eq!(wd.deadline(), Some(start + TIMEOUT));

        let later = start + Duration::from_secs(300);
        wd.on_activity(later);
        assert!(wd.poll_expired(start + Duration::from_secs(311)).is_none());
        assert_eq!(wd.deadline(), Some(later + TIMEOUT));
    }

    #[test]
    fn test_expiry_emits_once_and_rearms() {
        let start = Instant::now();
        let mut wd = Watchdog::new(TIMEOUT);
        wd.on_activity(start);

        let fire = start + TIMEOUT;
        let request = wd.poll_expired(fire).unwrap();
        assert_eq!(request.silent_for, TIMEOUT);
        assert_eq!(wd.state(), WatchdogState::Armed { deadline: fire + TIMEOUT });
        assert!(wd.poll_expired(fire + Duration::from_secs(1)).is_none());
    }

    #[test]
    fn test_content_changes_policy() {
        let policy = LivenessPolicy::ContentChanges;
        assert!(is_liveness_signal(
            &EventKind::Modify(ModifyKind::Data(DataChange::Content)),
            policy
        ));
        assert!(is_liveness_signal(&EventKind::Modify(ModifyKind::Any), policy));
        // The archiver moving a finished segment out must not count.
        assert!(!is_liveness_signal(
            &EventKind::Modify(ModifyKind::Name(RenameMode::From)),
            policy
        ));
        assert!(!is_liveness_signal(&EventKind::Remove(RemoveKind::File), policy));
        assert!(!is_liveness_signal(&EventKind::Create(CreateKind::File), policy));
        assert!(!is_liveness_signal(
            &EventKind::Modify(ModifyKind::Metadata(MetadataKind::Any)),
            policy
        ));
    }

    #[test]
    fn test_any_activity_policy() {
        let policy = LivenessPolicy::AnyActivity;
        assert!(is_liveness_signal(&EventKind::Remove(RemoveKind::File), policy));
        assert!(is_liveness_signal(&EventKind::Create(CreateKind::File), policy));
        assert!(is_liveness_signal(
            &EventKind::Modify(ModifyKind::Name(RenameMode::From)),
            policy
        ));
        assert!(!is_liveness_signal(&EventKind::Access(AccessKind::Read), policy));
    }

    fn spawn_watchdog() -> (
        mpsc::Sender<Activity>,
        mpsc::Receiver<RestartRequest>,
        CancellationToken,
        tokio::task::JoinHandle<()>,
    ) {
        let (activity_tx, activity_rx) = activity_channel();
        let (restart_tx, restart_rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(Watchdog::new(TIMEOUT).run(activity_rx, restart_tx, cancel.clone()));
        (activity_tx, restart_rx, cancel, handle)
    }

    fn drain(rx: &mut mpsc::Receiver<RestartRequest>) -> usize {
        let mut n = 0;
        while rx.try_recv().is_ok() {
            n += 1;
        }
        n
    }

    #[tokio::test(start_paused = true)]
    async fn test_silence_triggers_exactly_one_restart_per_window() {
        let (activity, mut restarts, cancel, handle) = spawn_watchdog();
        activity.send(Activity::StartAttempted).await.unwrap();
        tokio::task::yield_now().await;

        tokio::time::sleep(Duration::from_secs(309)).await;
        assert_eq!(drain(&mut restarts), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(drain(&mut restarts), 1);

        // Re-armed: the next silent window yields exactly one more.
        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(drain(&mut restarts), 0);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(drain(&mut restarts), 1);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_steady_activity_prevents_restart() {
        let (activity, mut restarts, cancel, handle) = spawn_watchdog();
        for _ in 0..10 {
            activity.send(Activity::FileChanged).await.unwrap();
            tokio::time::sleep(Duration::from_secs(200)).await;
        }
        assert_eq!(drain(&mut restarts), 0);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_unarmed_never_fires() {
        let (_activity, mut restarts, cancel, handle) = spawn_watchdog();
        tokio::time::sleep(TIMEOUT * 5).await;
        assert_eq!(drain(&mut restarts), 0);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_keeps_timing_after_watch_is_lost() {
        let (activity, mut restarts, cancel, handle) = spawn_watchdog();
        activity.send(Activity::StartAttempted).await.unwrap();
        drop(activity);

        tokio::time::sleep(TIMEOUT * 2 + Duration::from_secs(1)).await;
        assert_eq!(drain(&mut restarts), 2);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_watch_directory_reports_writes() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = activity_channel();
        let _watch = watch_directory(dir.path(), LivenessPolicy::ContentChanges, tx).unwrap();

        std::fs::write(dir.path().join("segment.mkv"), b"data").unwrap();
        let got = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await;
        assert_eq!(got.ok().flatten(), Some(Activity::FileChanged));
    }

    #[test]
    fn test_watch_missing_directory_fails() {
        let (tx, _rx) = activity_channel();
        let err = watch_directory(Path::new("/nonexistent/raw"), LivenessPolicy::default(), tx);
        assert!(matches!(err, Err(RecorderError::Watch { .. })));
    }
}
