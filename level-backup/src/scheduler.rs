//! Decides when backups run.
//!
//! One `Scheduler` drives one behavior for one session. It stops when the
//! session ends or when its own stop token fires (a config reload replaces
//! the scheduler).

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Days, Local, NaiveTime, TimeZone, Utc};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{BackupBehavior, BackupConfig};
use crate::orchestrator::{BackupOrchestrator, BackupRequest};
use crate::retention;
use crate::session::{Session, SessionEvent};
use crate::utils::errors::BackupError;

/// Triggers closer together than this collapse into one backup
pub const TRIGGER_COOLDOWN: Duration = Duration::from_secs(5);

pub struct Scheduler {
    orchestrator: Arc<BackupOrchestrator>,
    session: Session,
    config: BackupConfig,
    stop: CancellationToken,
}

impl Scheduler {
    pub fn new(orchestrator: Arc<BackupOrchestrator>, session: Session, config: BackupConfig) -> Self {
        let stop = session.end_token().child_token();
        Self {
            orchestrator,
            session,
            config,
            stop,
        }
    }

    /// Cancelling this stops `run` without ending the session
    pub fn stop_token(&self) -> &CancellationToken {
        &self.stop
    }

    pub async fn run(&self) {
        info!(behavior = ?self.config.behavior, "Backup scheduler started");
        match self.config.behavior {
            BackupBehavior::Disabled => info!("Automatic backups are disabled"),
            BackupBehavior::OnDisconnect => self.run_on_disconnect().await,
            BackupBehavior::Interval => self.run_interval().await,
            BackupBehavior::Scheduled => self.run_scheduled().await,
        }
        debug!("Backup scheduler stopped");
    }

    /// One-shot check when a session starts. Returns whether a backup started.
    pub async fn check_startup(&self) -> bool {
        if !self.config.backup_on_startup {
            debug!("Startup backup not configured");
            return false;
        }
        if self.orchestrator.ran_within(TRIGGER_COOLDOWN) {
            info!("Startup backup skipped, a backup ran moments ago");
            return false;
        }

        let cooldown = self.config.startup_cooldown();
        if !cooldown.is_zero() {
            let dir = self.orchestrator.backup_dir().to_path_buf();
            let dataset = self.orchestrator.dataset_name().to_string();
            match tokio::task::spawn_blocking(move || retention::latest_backup(&dir, &dataset)).await {
                Ok(Ok(Some(latest))) => {
                    let age = self.orchestrator.clock().now() - latest.timestamp;
                    let recent = chrono::Duration::from_std(cooldown).map_or(true, |cooldown| age <= cooldown);
                    if recent {
                        info!(
                            latest = %latest.timestamp,
                            cooldown_secs = cooldown.as_secs(),
                            "Startup backup skipped, the newest backup is within the startup cooldown"
                        );
                        return false;
                    }
                }
                Ok(Ok(None)) => {}
                Ok(Err(e)) => warn!(error = %e, "Could not list existing backups, running startup backup anyway"),
                Err(e) => warn!(error = %e, "Backup listing task failed, running startup backup anyway"),
            }
        }

        self.start_backup("startup").await
    }

    /// React to a user leaving. Returns whether a backup started.
    pub async fn handle_disconnect(&self, user: &str) -> bool {
        if self.orchestrator.ran_within(TRIGGER_COOLDOWN) {
            info!(user, "Disconnect backup skipped, a backup ran moments ago");
            return false;
        }
        self.start_backup("disconnect").await
    }

    async fn run_on_disconnect(&self) {
        let mut events = self.session.subscribe();
        loop {
            tokio::select! {
                _ = self.stop.cancelled() => return,
                event = events.recv() => match event {
                    Ok(SessionEvent::UserLeft(user)) => {
                        self.handle_disconnect(&user).await;
                    }
                    Ok(SessionEvent::UserJoined(_)) => {}
                    Err(RecvError::Lagged(skipped)) => warn!(skipped, "Missed session events"),
                    Err(RecvError::Closed) => return,
                },
            }
        }
    }

    async fn run_interval(&self) {
        let interval = self.config.interval();
        self.start_backup("interval").await;

        loop {
            tokio::select! {
                _ = self.stop.cancelled() => return,
                _ = tokio::time::sleep(interval) => {}
            }
            self.timed_trigger("interval").await;
        }
    }

    async fn run_scheduled(&self) {
        let mut last_fired: Option<DateTime<Utc>> = None;

        loop {
            let now = self.orchestrator.clock().now();
            // Never fire twice for the same time of day
            let from = match last_fired {
                Some(fired) if fired >= now => fired + chrono::Duration::seconds(1),
                _ => now,
            };
            let next = if self.config.schedule_utc {
                next_occurrence(&from, &self.config.schedule)
            } else {
                next_occurrence(&from.with_timezone(&Local), &self.config.schedule).map(|at| at.with_timezone(&Utc))
            };
            let Some(next) = next else {
                warn!("Backup schedule has no upcoming time, scheduled backups stop");
                return;
            };

            info!(next = %next, "Next scheduled backup");
            let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
            tokio::select! {
                _ = self.stop.cancelled() => return,
                _ = tokio::time::sleep(wait) => {}
            }
            last_fired = Some(next);
            self.timed_trigger("scheduled").await;
        }
    }

    async fn timed_trigger(&self, trigger: &'static str) -> bool {
        if self.config.skip_if_inactive && !self.session.had_activity() {
            info!(trigger, "Backup skipped, nobody joined since the last backup");
            return false;
        }
        if self.orchestrator.ran_within(TRIGGER_COOLDOWN) {
            info!(trigger, "Backup skipped, a backup ran moments ago");
            return false;
        }
        self.start_backup(trigger).await
    }

    async fn start_backup(&self, trigger: &'static str) -> bool {
        let request = BackupRequest::from_config(&self.config);
        match self.orchestrator.backup(request).await {
            Ok(task) => {
                self.session.clear_activity();
                debug!(trigger, archive = %task.archive_path().display(), "Backup handed to background writer");
                // The background stage reports its own outcome
                drop(task);
                true
            }
            Err(BackupError::Disabled(_)) | Err(BackupError::Cancelled) => false,
            Err(e) => {
                error!(trigger, error = %e, "Backup failed");
                false
            }
        }
    }
}

/// The earliest of `times` (read as wall-clock times in `now`'s zone) at or
/// after `now`.
///
/// Local times skipped by a DST change are ignored; ambiguous ones resolve
/// to their earlier instant.
pub fn next_occurrence<Tz: TimeZone>(now: &DateTime<Tz>, times: &[NaiveTime]) -> Option<DateTime<Tz>> {
    let tz = now.timezone();
    let today = now.date_naive();

    for offset in 0..=2 {
        let Some(day) = today.checked_add_days(Days::new(offset)) else {
            continue;
        };
        let next = times
            .iter()
            .filter_map(|time| tz.from_local_datetime(&day.and_time(*time)).earliest())
            .filter(|candidate| candidate >= now)
            .min();
        if next.is_some() {
            return next;
        }
    }
    None
}
