//! Backup orchestrator - runs one backup at a time.
//!
//! A backup has two phases:
//! - a synchronous phase on the caller's task: wait for the gate, flush the
//!   dataset and read it into memory, swap the log sink
//! - a background phase on a spawned task: pack, evict old backups, commit,
//!   then release the gate and save the captured logs
//!
//! The gate is a one-permit semaphore held from the start of the first phase
//! to the end of the archive step, so backups never overlap, whichever
//! trigger started them.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, SubsecRound, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::archive::{ArchiveWriter, WrittenArchive};
use crate::clock::{Clock, SystemClock};
use crate::config::BackupConfig;
use crate::dataset::SharedDataset;
use crate::naming;
use crate::retention::{RetentionEngine, RetentionPolicy};
use crate::snapshot::{SnapshotCoordinator, SnapshotFilter, VirtualDirectorySnapshot};
use crate::utils::errors::{BackupError, Result};
use crate::utils::log_sink::{BackupLog, LogSink};

/// Maximum number of queued events per subscriber
const EVENT_CAPACITY: usize = 64;

/// Per-run settings, copied out of the configuration when a run starts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackupRequest {
    pub retention: RetentionPolicy,
    pub save_logs: bool,
    /// Flush into the real save location instead of the scratch directory
    pub save_dataset_on_backup: bool,
}

impl BackupRequest {
    pub fn from_config(config: &BackupConfig) -> Self {
        Self {
            retention: config.retention_policy(),
            save_logs: config.save_logs,
            save_dataset_on_backup: config.save_dataset_on_backup,
        }
    }
}

/// Progress notifications for observers such as a status display
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "payload")]
pub enum BackupEvent {
    #[serde(rename = "gather:started")]
    GatherStarted,

    #[serde(rename = "gather:finished")]
    GatherFinished,

    #[serde(rename = "backup:completed")]
    BackupCompleted { path: PathBuf, size: u64 },

    #[serde(rename = "backup:failed")]
    BackupFailed { error: String },

    #[serde(rename = "backup:cancelled")]
    BackupCancelled,
}

/// Counts callers between entering `backup()` and releasing the gate
struct InFlight(Arc<AtomicUsize>);

impl InFlight {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Held for the whole gated region; dropping it ends the run.
///
/// The in-flight count drops before the permit is released, so a queued
/// caller keeps `is_backing_up()` true across the hand-over.
struct GateGuard {
    in_flight: Option<InFlight>,
    permit: Option<OwnedSemaphorePermit>,
}

impl Drop for GateGuard {
    fn drop(&mut self) {
        drop(self.in_flight.take());
        drop(self.permit.take());
    }
}

/// A backup whose archive is being written in the background
#[derive(Debug)]
pub struct BackupTask {
    archive_path: PathBuf,
    handle: JoinHandle<Result<WrittenArchive>>,
}

impl BackupTask {
    /// Where the archive will appear once committed
    pub fn archive_path(&self) -> &Path {
        &self.archive_path
    }

    /// Wait for the archive (and, if enabled, its logs) to be written
    pub async fn wait(self) -> Result<WrittenArchive> {
        self.handle.await?
    }
}

/// Single-flight backup runner for one dataset
pub struct BackupOrchestrator {
    dataset: SharedDataset,
    dataset_name: String,
    coordinator: SnapshotCoordinator,
    writer: ArchiveWriter,
    backup_dir: PathBuf,
    gate: Arc<Semaphore>,
    in_flight: Arc<AtomicUsize>,
    last_run: Mutex<Option<Instant>>,
    /// Timestamp of the newest archive this orchestrator named
    last_timestamp: Mutex<Option<DateTime<Utc>>>,
    logs: BackupLog,
    events: broadcast::Sender<BackupEvent>,
    clock: Arc<dyn Clock>,
    shutdown: CancellationToken,
}

impl BackupOrchestrator {
    pub fn new(dataset: SharedDataset, backup_dir: impl Into<PathBuf>, scratch_dir: impl Into<PathBuf>) -> Result<Self> {
        let dataset_name = dataset
            .lock()
            .map_err(|_| BackupError::DatasetPoisoned)?
            .name()
            .to_string();
        let backup_dir = backup_dir.into();
        let shutdown = CancellationToken::new();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Ok(Self {
            dataset,
            dataset_name,
            coordinator: SnapshotCoordinator::new(scratch_dir),
            writer: ArchiveWriter::new(RetentionEngine::new(&backup_dir), shutdown.clone()),
            backup_dir,
            gate: Arc::new(Semaphore::new(1)),
            in_flight: Arc::new(AtomicUsize::new(0)),
            last_run: Mutex::new(None),
            last_timestamp: Mutex::new(None),
            logs: BackupLog::new(),
            events,
            clock: Arc::new(SystemClock),
            shutdown,
        })
    }

    /// Cancel waiting and in-progress backups when `token` fires
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.writer = ArchiveWriter::new(RetentionEngine::new(&self.backup_dir), token.clone());
        self.shutdown = token;
        self
    }

    pub fn with_log(mut self, logs: BackupLog) -> Self {
        self.logs = logs;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_filter(mut self, filter: SnapshotFilter) -> Self {
        self.coordinator = self.coordinator.with_filter(filter);
        self
    }

    pub fn dataset(&self) -> &SharedDataset {
        &self.dataset
    }

    pub fn dataset_name(&self) -> &str {
        &self.dataset_name
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    /// True while any backup is running or waiting for the gate
    pub fn is_backing_up(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst) > 0
    }

    /// When the last backup started (monotonic)
    pub fn last_run(&self) -> Option<Instant> {
        *self.last_run.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether a backup started at most `window` ago
    pub fn ran_within(&self, window: Duration) -> bool {
        self.last_run().is_some_and(|at| at.elapsed() <= window)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BackupEvent> {
        self.events.subscribe()
    }

    /// Wait until no backup holds the gate
    pub async fn wait_idle(&self) {
        let _ = self.gate.acquire().await;
    }

    /// Start a backup.
    ///
    /// Waits for any running backup to finish completely, then flushes and
    /// snapshots the dataset before returning. The archive itself is written
    /// in the background; await [`BackupTask::wait`] for the outcome.
    pub async fn backup(&self, request: BackupRequest) -> Result<BackupTask> {
        if let Some(reason) = request.retention.disabled_reason() {
            info!(dataset = %self.dataset_name, reason, "Backup skipped, backups are disabled");
            return Err(BackupError::Disabled(reason.to_string()));
        }

        let in_flight = InFlight::enter(&self.in_flight);
        let permit = tokio::select! {
            permit = Arc::clone(&self.gate).acquire_owned() => permit.map_err(|_| BackupError::Cancelled)?,
            _ = self.shutdown.cancelled() => {
                info!(dataset = %self.dataset_name, "Backup cancelled while waiting for a running backup");
                return Err(BackupError::Cancelled);
            }
        };
        let guard = GateGuard {
            in_flight: Some(in_flight),
            permit: Some(permit),
        };

        *self.last_run.lock().unwrap_or_else(PoisonError::into_inner) = Some(Instant::now());
        let timestamp = self.next_timestamp();
        info!(dataset = %self.dataset_name, timestamp = %timestamp, "Starting backup");

        let _ = self.events.send(BackupEvent::GatherStarted);
        let gathered = self.gather(&request);
        let _ = self.events.send(BackupEvent::GatherFinished);

        let snapshot = match gathered {
            Ok(snapshot) => snapshot,
            Err(e) => {
                error!(dataset = %self.dataset_name, error = %e, "Backup failed while gathering the dataset");
                let _ = self.events.send(BackupEvent::BackupFailed { error: e.to_string() });
                drop(guard);
                return Err(e);
            }
        };
        let captured_logs = self.logs.swap();

        info!(
            files = snapshot.files().len(),
            bytes = snapshot.total_bytes(),
            "Dataset snapshot taken, archiving in background"
        );

        let archive_path = self.writer.archive_path(&self.dataset_name, &timestamp);
        let handle = tokio::spawn(run_background(
            BackgroundJob {
                writer: self.writer.clone(),
                dataset: self.dataset_name.clone(),
                backup_dir: self.backup_dir.clone(),
                timestamp,
                snapshot,
                request,
                captured_logs,
                events: self.events.clone(),
            },
            guard,
        ));

        Ok(BackupTask { archive_path, handle })
    }

    /// Archive names have second precision, so two runs within one second
    /// would share a name. Called under the gate: the result is later than
    /// any timestamp issued before and names no existing archive.
    fn next_timestamp(&self) -> DateTime<Utc> {
        let mut last = self.last_timestamp.lock().unwrap_or_else(PoisonError::into_inner);
        let mut timestamp = self.clock.now().trunc_subsecs(0);
        if let Some(previous) = *last {
            if timestamp <= previous {
                timestamp = previous + chrono::Duration::seconds(1);
            }
        }
        while self.writer.archive_path(&self.dataset_name, &timestamp).exists() {
            timestamp = timestamp + chrono::Duration::seconds(1);
        }
        *last = Some(timestamp);
        timestamp
    }

    /// Synchronous phase: flush and read the dataset under its lock
    fn gather(&self, request: &BackupRequest) -> Result<VirtualDirectorySnapshot> {
        let mut dataset = self.dataset.lock().map_err(|_| BackupError::DatasetPoisoned)?;
        self.coordinator.gather(&mut *dataset, !request.save_dataset_on_backup)
    }
}

struct BackgroundJob {
    writer: ArchiveWriter,
    dataset: String,
    backup_dir: PathBuf,
    timestamp: DateTime<Utc>,
    snapshot: VirtualDirectorySnapshot,
    request: BackupRequest,
    captured_logs: Arc<LogSink>,
    events: broadcast::Sender<BackupEvent>,
}

async fn run_background(job: BackgroundJob, guard: GateGuard) -> Result<WrittenArchive> {
    let BackgroundJob {
        writer,
        dataset,
        backup_dir,
        timestamp,
        snapshot,
        request,
        captured_logs,
        events,
    } = job;

    let result = writer.write(&dataset, timestamp, snapshot, request.retention).await;
    match &result {
        Ok(written) => {
            let _ = events.send(BackupEvent::BackupCompleted {
                path: written.path.clone(),
                size: written.size,
            });
        }
        Err(BackupError::Cancelled) => {
            info!(dataset = %dataset, "Backup cancelled before the archive was written");
            let _ = events.send(BackupEvent::BackupCancelled);
        }
        Err(e) => {
            error!(dataset = %dataset, error = %e, "Backup failed while writing the archive");
            let _ = events.send(BackupEvent::BackupFailed { error: e.to_string() });
        }
    }
    drop(guard);

    if request.save_logs {
        let log_dir = backup_dir.join(naming::log_dir_name(&dataset, &timestamp));
        match tokio::task::spawn_blocking(move || captured_logs.write_to(&log_dir)).await {
            Ok(Ok(files)) => info!(files = files.len(), "Backup logs saved"),
            Ok(Err(e)) => warn!(error = %e, "Could not save backup logs"),
            Err(e) => warn!(error = %e, "Backup log task failed"),
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::testing::SteppingClock;
    use crate::dataset::{Dataset, DirtyMarker};
    use crate::retention::{list_backups, Limit};
    use crate::testing::FakeDataset;
    use crate::utils::log_sink::LogEntry;
    use chrono::TimeZone;
    use std::sync::atomic::AtomicBool;
    use tempfile::TempDir;
    use tokio::sync::broadcast::error::TryRecvError;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn request() -> BackupRequest {
        BackupRequest {
            retention: RetentionPolicy::unlimited(),
            save_logs: false,
            save_dataset_on_backup: false,
        }
    }

    fn build(temp: &TempDir, dataset: SharedDataset) -> BackupOrchestrator {
        BackupOrchestrator::new(dataset, temp.path().join("backups"), temp.path().join("scratch"))
            .unwrap()
            .with_clock(Arc::new(SteppingClock::new(start(), chrono::Duration::minutes(1))))
    }

    fn orchestrator(temp: &TempDir, dataset: FakeDataset) -> Arc<BackupOrchestrator> {
        Arc::new(build(temp, dataset.shared()))
    }

    fn level(temp: &TempDir) -> FakeDataset {
        FakeDataset::new("D", temp.path().join("live")).with_file("level.json", b"{\"tiles\":[]}")
    }

    #[tokio::test]
    async fn test_backup_writes_archive_and_goes_idle() -> Result<()> {
        let temp = TempDir::new()?;
        let orch = orchestrator(&temp, level(&temp));

        let task = orch.backup(request()).await?;
        assert!(orch.is_backing_up() || task.archive_path().exists());
        let written = task.wait().await?;

        assert_eq!(written.path, temp.path().join("backups/backup_D_2024-05-01_12-00-00.zip"));
        assert!(written.path.exists());
        assert!(!orch.is_backing_up());
        assert!(orch.last_run().is_some());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_backups_are_serialized() -> Result<()> {
        let temp = TempDir::new()?;
        let orch = orchestrator(&temp, level(&temp));

        let mut events = orch.subscribe();
        let watcher = tokio::spawn({
            let orch = Arc::clone(&orch);
            async move {
                loop {
                    if let Ok(BackupEvent::GatherStarted) = events.recv().await {
                        break;
                    }
                }
                let mut seen = vec![BackupEvent::GatherStarted];
                let mut completed = 0;
                loop {
                    // Sample first: completion is announced before the gate is released
                    let busy = orch.is_backing_up();
                    loop {
                        match events.try_recv() {
                            Ok(event) => {
                                if matches!(event, BackupEvent::BackupCompleted { .. }) {
                                    completed += 1;
                                }
                                seen.push(event);
                            }
                            Err(TryRecvError::Empty) => break,
                            Err(e) => panic!("event stream broke: {e}"),
                        }
                    }
                    if completed == 2 {
                        break;
                    }
                    assert!(busy, "observed idle between backups");
                    tokio::task::yield_now().await;
                }
                seen
            }
        });

        let (first, second) = tokio::join!(orch.backup(request()), orch.backup(request()));
        let first = first?.wait().await?;
        let second = second?.wait().await?;
        let seen = watcher.await.unwrap();

        assert_ne!(first.path, second.path);
        assert_eq!(list_backups(orch.backup_dir(), "D")?.len(), 2);
        let kinds: Vec<_> = seen
            .iter()
            .map(|e| match e {
                BackupEvent::GatherStarted => "start",
                BackupEvent::GatherFinished => "finish",
                BackupEvent::BackupCompleted { .. } => "done",
                _ => "other",
            })
            .collect();
        assert_eq!(kinds, vec!["start", "finish", "done", "start", "finish", "done"]);
        assert!(!orch.is_backing_up());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_backups_in_the_same_second_get_distinct_archives() -> Result<()> {
        let temp = TempDir::new()?;
        let orch = Arc::new(
            BackupOrchestrator::new(level(&temp).shared(), temp.path().join("backups"), temp.path().join("scratch"))?
                .with_clock(Arc::new(SystemClock)),
        );

        let (first, second) = tokio::join!(orch.backup(request()), orch.backup(request()));
        let first = first?.wait().await?;
        let second = second?.wait().await?;

        assert_ne!(first.path, second.path);
        let records = list_backups(orch.backup_dir(), "D")?;
        assert_eq!(records.len(), 2);
        assert!(records[0].timestamp < records[1].timestamp);
        Ok(())
    }

    #[tokio::test]
    async fn test_existing_archive_is_never_overwritten() -> Result<()> {
        let temp = TempDir::new()?;
        let backups = temp.path().join("backups");
        std::fs::create_dir_all(&backups)?;
        let existing = backups.join(naming::archive_name("D", &start()));
        std::fs::write(&existing, b"earlier archive")?;
        let frozen = Arc::new(SteppingClock::new(start(), chrono::Duration::zero()));
        let orch = Arc::new(build(&temp, level(&temp).shared()).with_clock(frozen));

        let first = orch.backup(request()).await?.wait().await?;
        let second = orch.backup(request()).await?.wait().await?;

        assert_eq!(std::fs::read(&existing)?, b"earlier archive");
        assert_eq!(first.path, backups.join("backup_D_2024-05-01_12-00-01.zip"));
        assert_eq!(second.path, backups.join("backup_D_2024-05-01_12-00-02.zip"));
        Ok(())
    }

    #[tokio::test]
    async fn test_count_retention_keeps_most_recent() -> Result<()> {
        let temp = TempDir::new()?;
        let backups = temp.path().join("backups");
        std::fs::create_dir_all(&backups)?;
        for hour in 1..=5 {
            let ts = Utc.with_ymd_and_hms(2024, 5, 1, hour, 0, 0).unwrap();
            std::fs::write(backups.join(naming::archive_name("D", &ts)), b"old")?;
        }
        let orch = orchestrator(&temp, level(&temp));
        let mut req = request();
        req.retention.max_count = Limit::AtMost(3);

        orch.backup(req).await?.wait().await?;

        let hours: Vec<_> = list_backups(&backups, "D")?
            .iter()
            .map(|r| r.timestamp.format("%H").to_string())
            .collect();
        assert_eq!(hours, vec!["04", "05", "12"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_disabled_policy_never_takes_the_gate() -> Result<()> {
        let temp = TempDir::new()?;
        let dataset = level(&temp);
        let flushes = dataset.flush_counter();
        let orch = orchestrator(&temp, dataset);
        let mut req = request();
        req.retention.max_count = Limit::Disabled;

        let err = orch.backup(req).await.unwrap_err();

        assert!(matches!(err, BackupError::Disabled(_)));
        assert_eq!(flushes.load(Ordering::SeqCst), 0);
        assert!(!orch.is_backing_up());
        assert!(orch.last_run().is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_flush_failure_releases_gate() -> Result<()> {
        let temp = TempDir::new()?;
        let a = DirtyMarker::new("a");
        let dataset = level(&temp).with_dirty(&[a.clone()]).failing();
        let shared = dataset.shared();
        let orch = Arc::new(build(&temp, shared.clone()));

        let err = orch.backup(request()).await.unwrap_err();
        assert!(matches!(err, BackupError::Flush(_)));
        assert!(!orch.is_backing_up());

        // The gate is free again and the live dataset is untouched
        tokio::time::timeout(Duration::from_secs(1), orch.wait_idle())
            .await
            .expect("gate still held");
        let dataset = shared.lock().unwrap();
        assert_eq!(dataset.save_path(), temp.path().join("live").as_path());
        assert_eq!(dataset.dirty_markers(), vec![a]);
        assert!(list_backups(orch.backup_dir(), "D")?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_cancellation_after_gather_writes_nothing() -> Result<()> {
        let temp = TempDir::new()?;
        let shutdown = CancellationToken::new();
        let dataset = level(&temp).on_flush({
            let shutdown = shutdown.clone();
            move || shutdown.cancel()
        });
        let orch = Arc::new(build(&temp, dataset.shared()).with_shutdown(shutdown.clone()));
        let mut events = orch.subscribe();

        let err = orch.backup(request()).await?.wait().await.unwrap_err();

        assert!(err.is_cancelled());
        assert!(!orch.is_backing_up());
        assert!(list_backups(orch.backup_dir(), "D")?.is_empty());
        let mut cancelled = false;
        while let Ok(event) = events.try_recv() {
            cancelled |= event == BackupEvent::BackupCancelled;
        }
        assert!(cancelled);
        Ok(())
    }

    #[tokio::test]
    async fn test_logs_are_saved_next_to_archive() -> Result<()> {
        let temp = TempDir::new()?;
        let logs = BackupLog::new();
        let orch = Arc::new(build(&temp, level(&temp).shared()).with_log(logs.clone()));
        logs.record(LogEntry::new(tracing::Level::INFO, "session", "player joined"));
        let mut req = request();
        req.save_logs = true;

        let written = orch.backup(req).await?.wait().await?;

        let log_dir = orch.backup_dir().join(naming::log_dir_name("D", &start()));
        let text = std::fs::read_to_string(log_dir.join("session.txt"))?;
        assert!(text.contains("player joined"));
        assert!(written.path.exists());
        assert!(logs.current().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_save_dataset_on_backup_flushes_live_path() -> Result<()> {
        let temp = TempDir::new()?;
        let orch = orchestrator(&temp, level(&temp));
        let mut req = request();
        req.save_dataset_on_backup = true;

        orch.backup(req).await?.wait().await?;

        assert!(temp.path().join("live/level.json").exists());
        assert!(!temp.path().join("scratch").exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_gather_events_bracket_the_flush() -> Result<()> {
        let temp = TempDir::new()?;
        let flushed_inside = Arc::new(AtomicBool::new(false));
        let events_slot: Arc<Mutex<Option<broadcast::Receiver<BackupEvent>>>> = Arc::new(Mutex::new(None));
        let dataset = level(&temp).on_flush({
            let flushed_inside = Arc::clone(&flushed_inside);
            let slot = Arc::clone(&events_slot);
            move || {
                if let Some(rx) = slot.lock().unwrap().as_mut() {
                    let started = matches!(rx.try_recv(), Ok(BackupEvent::GatherStarted));
                    let nothing_else = matches!(rx.try_recv(), Err(TryRecvError::Empty));
                    flushed_inside.store(started && nothing_else, Ordering::SeqCst);
                }
            }
        });
        let orch = orchestrator(&temp, dataset);
        *events_slot.lock().unwrap() = Some(orch.subscribe());

        orch.backup(request()).await?.wait().await?;

        assert!(flushed_inside.load(Ordering::SeqCst));
        Ok(())
    }
}
