//! Configuration management for the backup engine.
//!
//! Loads configuration from a TOML file with environment variable overrides
//! (`LEVEL_BACKUP__BACKUP__MAX_BACKUPS=5` sets `backup.max_backups`).

use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::retention::{Limit, RetentionPolicy};
use crate::utils::errors::{BackupError, Result};

const ENV_PREFIX: &str = "LEVEL_BACKUP";
const ENV_SEPARATOR: &str = "__";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub dataset: DatasetConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub backup: BackupConfig,

    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetConfig {
    /// Logical dataset name, part of every backup file name
    #[serde(default = "default_dataset_name")]
    pub name: String,

    /// Directory the live dataset is edited in
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,

    /// Where a regular save of the dataset goes
    #[serde(default = "default_save_dir")]
    pub save_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding `backup_*.zip` archives and `logs_*` folders
    #[serde(default = "default_backup_dir")]
    pub backup_dir: PathBuf,

    /// Throwaway flush target for backups that must not touch the real save
    #[serde(default = "default_scratch_dir")]
    pub scratch_dir: PathBuf,
}

/// When backups run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupBehavior {
    Disabled,
    /// Whenever a user leaves the session
    OnDisconnect,
    /// Every `interval_secs`
    Interval,
    /// At the configured times of day
    Scheduled,
}

/// Backup policy, copied into each run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupConfig {
    #[serde(default = "default_behavior")]
    pub behavior: BackupBehavior,

    /// 0 disables backups, negative means unlimited
    #[serde(default = "default_max_backups")]
    pub max_backups: i64,

    /// Byte budget for all archives of the dataset; 0 disables backups,
    /// negative or absent means unlimited
    #[serde(default)]
    pub max_backup_size_bytes: Option<i64>,

    #[serde(default)]
    pub backup_on_startup: bool,

    /// Skip the startup backup if the newest backup is younger than this
    #[serde(default)]
    pub startup_cooldown_secs: u64,

    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    /// Times of day (`HH:MM:SS`) for the scheduled behavior
    #[serde(default)]
    pub schedule: Vec<NaiveTime>,

    /// Interpret `schedule` in UTC instead of local time
    #[serde(default)]
    pub schedule_utc: bool,

    /// Skip interval/scheduled backups when nobody joined since the last one
    #[serde(default = "default_true")]
    pub skip_if_inactive: bool,

    #[serde(default = "default_true")]
    pub save_logs: bool,

    /// Flush into the real save location instead of the scratch directory
    #[serde(default)]
    pub save_dataset_on_backup: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log entries held in memory between backups; older ones are dropped
    #[serde(default = "default_capture_limit")]
    pub capture_limit: usize,
}

// Default values
fn default_dataset_name() -> String {
    "level".to_string()
}

fn default_work_dir() -> PathBuf {
    PathBuf::from("level")
}

fn default_save_dir() -> PathBuf {
    PathBuf::from("saves/level")
}

fn default_backup_dir() -> PathBuf {
    PathBuf::from("backups")
}

fn default_scratch_dir() -> PathBuf {
    PathBuf::from(".level-backup/scratch")
}

fn default_behavior() -> BackupBehavior {
    BackupBehavior::Interval
}

fn default_max_backups() -> i64 {
    20
}

fn default_interval_secs() -> u64 {
    30 * 60
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_capture_limit() -> usize {
    crate::utils::log_sink::DEFAULT_CAPACITY
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            name: default_dataset_name(),
            work_dir: default_work_dir(),
            save_dir: default_save_dir(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backup_dir: default_backup_dir(),
            scratch_dir: default_scratch_dir(),
        }
    }
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            behavior: default_behavior(),
            max_backups: default_max_backups(),
            max_backup_size_bytes: None,
            backup_on_startup: false,
            startup_cooldown_secs: 0,
            interval_secs: default_interval_secs(),
            schedule: Vec::new(),
            schedule_utc: false,
            skip_if_inactive: true,
            save_logs: true,
            save_dataset_on_backup: false,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            capture_limit: default_capture_limit(),
        }
    }
}

impl BackupConfig {
    pub fn retention_policy(&self) -> RetentionPolicy {
        RetentionPolicy {
            max_count: Limit::from_sentinel(self.max_backups),
            max_bytes: self.max_backup_size_bytes.map_or(Limit::Unlimited, Limit::from_sentinel),
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn startup_cooldown(&self) -> Duration {
        Duration::from_secs(self.startup_cooldown_secs)
    }
}

impl Config {
    /// Load from an optional TOML file, then apply `LEVEL_BACKUP__*` overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        let config: Config = builder
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator(ENV_SEPARATOR))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.dataset.name.contains(['/', '\\']) {
            return Err(BackupError::Config(format!(
                "dataset name {:?} must not contain path separators",
                self.dataset.name
            )));
        }
        if self.backup.behavior == BackupBehavior::Interval && self.backup.interval_secs == 0 {
            return Err(BackupError::Config("interval_secs must be greater than 0".to_string()));
        }
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| BackupError::Config(e.to_string()))
    }
}

/// The active configuration plus where it came from, for reloads
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: Option<PathBuf>,
    current: Config,
}

impl ConfigStore {
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let current = Config::load(path.as_deref())?;
        Ok(Self { path, current })
    }

    pub fn current(&self) -> &Config {
        &self.current
    }

    /// Re-read the configuration; on error the previous one stays active
    pub fn reload(&mut self) -> Result<&Config> {
        self.current = Config::load(self.path.as_deref())?;
        Ok(&self.current)
    }
}
