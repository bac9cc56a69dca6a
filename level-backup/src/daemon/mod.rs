//! Long-running backup daemon.
//!
//! Owns the orchestrator, the editing session and the active scheduler, and
//! reacts to the stdin console, SIGHUP reloads and shutdown signals.

pub mod console;
pub mod shutdown;

use std::ops::ControlFlow;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{BackupConfig, Config, ConfigStore, DatasetConfig, StorageConfig};
use crate::dataset::{DirectoryDataset, DirtyMarker, SharedDataset};
use crate::orchestrator::{BackupEvent, BackupOrchestrator, BackupRequest};
use crate::retention;
use crate::scheduler::Scheduler;
use crate::session::Session;
use crate::utils::errors::{BackupError, Result};
use crate::utils::log_sink::BackupLog;
use console::ConsoleCommand;
use shutdown::{ReloadSignal, ShutdownCoordinator};

/// How long shutdown waits for a running backup to reach a stage boundary
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Build the orchestrator for the configured dataset
pub fn build(config: &Config, log: &BackupLog, shutdown: CancellationToken) -> Result<Arc<BackupOrchestrator>> {
    let dataset: SharedDataset = Arc::new(Mutex::new(DirectoryDataset::new(
        config.dataset.name.clone(),
        config.dataset.work_dir.clone(),
        config.dataset.save_dir.clone(),
    )));

    let orchestrator = BackupOrchestrator::new(
        dataset,
        config.storage.backup_dir.clone(),
        config.storage.scratch_dir.clone(),
    )?
    .with_shutdown(shutdown)
    .with_log(log.clone());

    Ok(Arc::new(orchestrator))
}

/// Run until SIGINT/SIGTERM or the `quit` console command
pub async fn run(store: ConfigStore, log: BackupLog) -> anyhow::Result<()> {
    let shutdown = ShutdownCoordinator::new();
    let orchestrator = build(store.current(), &log, shutdown.token())?;
    let session = Session::new();
    let event_logger = spawn_event_logger(orchestrator.subscribe());

    info!(
        dataset = %orchestrator.dataset_name(),
        backup_dir = %orchestrator.backup_dir().display(),
        "Backup daemon started"
    );

    let scheduler = RunningScheduler::start(&orchestrator, &session, store.current().backup.clone(), true).await;
    let mut daemon = Daemon {
        dataset: store.current().dataset.clone(),
        storage: store.current().storage.clone(),
        store,
        orchestrator,
        session,
        scheduler,
    };

    let signal = shutdown.wait_for_signal();
    tokio::pin!(signal);
    let mut reload = ReloadSignal::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut console_open = true;

    loop {
        tokio::select! {
            _ = &mut signal => break,
            _ = reload.recv() => daemon.reload().await,
            line = lines.next_line(), if console_open => match line {
                Ok(Some(line)) if line.trim().is_empty() => {}
                Ok(Some(line)) => match line.parse::<ConsoleCommand>() {
                    Ok(command) => {
                        if daemon.handle(command).await.is_break() {
                            shutdown.trigger();
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, "Invalid console command"),
                },
                Ok(None) => {
                    debug!("Console input closed");
                    console_open = false;
                }
                Err(e) => {
                    warn!(error = %e, "Could not read console input");
                    console_open = false;
                }
            },
        }
    }

    info!("Graceful shutdown initiated");
    daemon.session.end();
    daemon.scheduler.join().await;
    if tokio::time::timeout(SHUTDOWN_GRACE, daemon.orchestrator.wait_idle()).await.is_err() {
        warn!("Backup still running at shutdown, forcing exit");
    }
    event_logger.abort();
    info!("Graceful shutdown complete");
    Ok(())
}

struct Daemon {
    store: ConfigStore,
    /// Dataset and storage settings the orchestrator was built with
    dataset: DatasetConfig,
    storage: StorageConfig,
    orchestrator: Arc<BackupOrchestrator>,
    session: Session,
    scheduler: RunningScheduler,
}

impl Daemon {
    async fn handle(&mut self, command: ConsoleCommand) -> ControlFlow<()> {
        match command {
            ConsoleCommand::Join(user) => self.session.user_joined(&user),
            ConsoleCommand::Leave(user) => self.session.user_left(&user),
            ConsoleCommand::Backup => self.manual_backup().await,
            ConsoleCommand::Touch(label) => self.touch(label),
            ConsoleCommand::Status => self.status().await,
            ConsoleCommand::Reload => self.reload().await,
            ConsoleCommand::Quit => return ControlFlow::Break(()),
        }
        ControlFlow::Continue(())
    }

    async fn manual_backup(&self) {
        let request = BackupRequest::from_config(&self.store.current().backup);
        match self.orchestrator.backup(request).await {
            Ok(task) => {
                self.session.clear_activity();
                tokio::spawn(async move {
                    if let Ok(written) = task.wait().await {
                        info!(path = %written.path.display(), size = written.size, "Manual backup finished");
                    }
                });
            }
            Err(BackupError::Disabled(reason)) => warn!(reason = %reason, "Manual backup refused, backups are disabled"),
            Err(e) => error!(error = %e, "Manual backup failed"),
        }
    }

    fn touch(&self, label: String) {
        match self.orchestrator.dataset().lock() {
            Ok(mut dataset) => {
                dataset.mark_dirty(DirtyMarker::new(label.as_str()));
                debug!(label = %label, "Dataset marked dirty");
            }
            Err(_) => error!(error = %BackupError::DatasetPoisoned, "Could not mark the dataset dirty"),
        }
    }

    async fn status(&self) {
        let dir = self.orchestrator.backup_dir().to_path_buf();
        let dataset = self.orchestrator.dataset_name().to_string();
        let backups = tokio::task::spawn_blocking(move || retention::list_backups(&dir, &dataset)).await;
        let (count, bytes) = match backups {
            Ok(Ok(records)) => (records.len(), records.iter().map(|r| r.size).sum::<u64>()),
            Ok(Err(e)) => {
                warn!(error = %e, "Could not list backups");
                (0, 0)
            }
            Err(e) => {
                warn!(error = %e, "Backup listing task failed");
                (0, 0)
            }
        };
        let dirty = self
            .orchestrator
            .dataset()
            .lock()
            .map(|dataset| dataset.dirty_markers().len())
            .unwrap_or_default();

        info!(
            behavior = ?self.store.current().backup.behavior,
            backing_up = self.orchestrator.is_backing_up(),
            last_run_secs_ago = self.orchestrator.last_run().map(|at| at.elapsed().as_secs()),
            backups = count,
            backup_bytes = bytes,
            dirty,
            activity = self.session.had_activity(),
            "Status"
        );
    }

    async fn reload(&mut self) {
        let config = match self.store.reload() {
            Ok(config) => config.clone(),
            Err(e) => {
                error!(error = %e, "Configuration reload failed, keeping the previous configuration");
                return;
            }
        };

        if config.dataset != self.dataset || config.storage != self.storage {
            warn!("Dataset and storage changes take effect after a restart");
        }

        self.scheduler.join().await;
        self.scheduler = RunningScheduler::start(&self.orchestrator, &self.session, config.backup, false).await;
        info!("Configuration reloaded, scheduler restarted");
    }
}

/// A scheduler running on its own task
struct RunningScheduler {
    stop: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl RunningScheduler {
    async fn start(
        orchestrator: &Arc<BackupOrchestrator>,
        session: &Session,
        config: BackupConfig,
        startup: bool,
    ) -> Self {
        let scheduler = Scheduler::new(Arc::clone(orchestrator), session.clone(), config);
        if startup {
            scheduler.check_startup().await;
        }
        let stop = scheduler.stop_token().clone();
        let handle = tokio::spawn(async move { scheduler.run().await });
        Self {
            stop,
            handle: Some(handle),
        }
    }

    /// Stop the scheduler and wait for its task to end
    async fn join(&mut self) {
        self.stop.cancel();
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "Scheduler task failed");
            }
        }
    }
}

/// Log orchestrator events as JSON at debug level
fn spawn_event_logger(mut events: broadcast::Receiver<BackupEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(json) => debug!(event = %json, "Backup event"),
                    Err(e) => warn!(error = %e, "Could not encode backup event"),
                },
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Missed backup events"),
                Err(RecvError::Closed) => break,
            }
        }
    })
}
