//! Backup enumeration and retention.
//!
//! Keeps the backups of one dataset within a count budget and a byte budget
//! by deleting the oldest archives first (together with their paired log
//! folders). Deletion failures are logged and skipped; they never abort a
//! backup run.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::naming::{self, BackupKind};
use crate::utils::errors::{BackupError, Result};

/// A budget read from configuration.
///
/// Configuration uses sentinels: `0` allows no backups at all and a negative
/// value means no limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Limit {
    Unlimited,
    Disabled,
    AtMost(u64),
}

impl Limit {
    pub fn from_sentinel(value: i64) -> Self {
        match value {
            v if v < 0 => Limit::Unlimited,
            0 => Limit::Disabled,
            v => Limit::AtMost(v as u64),
        }
    }

    /// `None` when unbounded
    pub fn bound(&self) -> Option<u64> {
        match self {
            Limit::Unlimited => None,
            Limit::Disabled => Some(0),
            Limit::AtMost(n) => Some(*n),
        }
    }
}

/// Count and size budgets for one dataset's backups
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub max_count: Limit,
    pub max_bytes: Limit,
}

impl RetentionPolicy {
    pub fn unlimited() -> Self {
        Self {
            max_count: Limit::Unlimited,
            max_bytes: Limit::Unlimited,
        }
    }

    /// Why no backup may be written under this policy, if that is the case
    pub fn disabled_reason(&self) -> Option<&'static str> {
        if self.max_count == Limit::Disabled {
            Some("max_backups is 0")
        } else if self.max_bytes == Limit::Disabled {
            Some("max_backup_size_bytes is 0")
        } else {
            None
        }
    }
}

/// An existing backup archive, recovered from its file name
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupRecord {
    pub path: PathBuf,
    pub timestamp: DateTime<Utc>,
    /// Archive size on disk in bytes
    pub size: u64,
}

/// List the archives of `dataset` in `dir`, oldest first (ties by path).
///
/// A missing directory simply has no backups.
pub fn list_backups(dir: &Path, dataset: &str) -> Result<Vec<BackupRecord>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut records = Vec::new();
    for entry in entries {
        let entry = entry?;
        let file_name = entry.file_name();
        let Some(decoded) = naming::decode(&file_name.to_string_lossy()) else {
            continue;
        };
        if decoded.kind != BackupKind::Archive || decoded.dataset != dataset {
            continue;
        }

        let metadata = entry.metadata()?;
        if !metadata.is_file() {
            continue;
        }

        records.push(BackupRecord {
            path: entry.path(),
            timestamp: decoded.timestamp,
            size: metadata.len(),
        });
    }

    records.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.path.cmp(&b.path)));
    Ok(records)
}

/// The newest archive of `dataset`, if any
pub fn latest_backup(dir: &Path, dataset: &str) -> Result<Option<BackupRecord>> {
    Ok(list_backups(dir, dataset)?.pop())
}

/// Deletes old backups to make room within a [`RetentionPolicy`]
#[derive(Debug, Clone)]
pub struct RetentionEngine {
    backup_dir: PathBuf,
}

impl RetentionEngine {
    pub fn new(backup_dir: impl Into<PathBuf>) -> Self {
        Self {
            backup_dir: backup_dir.into(),
        }
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    /// Make room for a new archive of `projected_size` bytes.
    ///
    /// Returns the backups that were deleted. The size budget is checked
    /// first, then the count budget, always both.
    pub fn enforce(&self, dataset: &str, projected_size: u64, policy: &RetentionPolicy) -> Vec<BackupRecord> {
        self.run(dataset, projected_size, 1, policy)
    }

    /// Bring existing backups within budget without writing a new one.
    pub fn prune(&self, dataset: &str, policy: &RetentionPolicy) -> Vec<BackupRecord> {
        self.run(dataset, 0, 0, policy)
    }

    fn run(&self, dataset: &str, projected_size: u64, reserved_slots: u64, policy: &RetentionPolicy) -> Vec<BackupRecord> {
        let mut deleted = Vec::new();

        if let Some(budget) = policy.max_bytes.bound() {
            match list_backups(&self.backup_dir, dataset) {
                Ok(records) => deleted.extend(self.evict_for_size(records, projected_size, budget)),
                Err(e) => warn!(dataset, error = %e, "Could not list backups for size retention"),
            }
        }

        if let Some(max_count) = policy.max_count.bound() {
            match list_backups(&self.backup_dir, dataset) {
                Ok(records) => deleted.extend(self.evict_for_count(records, max_count, reserved_slots)),
                Err(e) => warn!(dataset, error = %e, "Could not list backups for count retention"),
            }
        }

        deleted
    }

    /// Delete oldest-first until `total + projected <= budget` or nothing is
    /// left to delete. Failed deletions free nothing.
    fn evict_for_size(&self, records: Vec<BackupRecord>, projected: u64, budget: u64) -> Vec<BackupRecord> {
        let mut total: u64 = records.iter().map(|r| r.size).sum();
        let mut deleted = Vec::new();

        for record in records {
            if total.saturating_add(projected) <= budget {
                break;
            }
            match self.delete(&record) {
                Ok(()) => {
                    info!(
                        path = %record.path.display(),
                        freed = record.size,
                        "Deleted old backup to stay within size budget"
                    );
                    total = total.saturating_sub(record.size);
                    deleted.push(record);
                }
                Err(e) => warn!(error = %e, "Size retention skipped a backup"),
            }
        }

        if total.saturating_add(projected) > budget {
            warn!(
                total,
                projected,
                budget,
                "Size budget cannot be satisfied, writing the new backup anyway"
            );
        }

        deleted
    }

    /// Delete just enough of the oldest backups that `count + reserved_slots <= max_count`.
    fn evict_for_count(&self, records: Vec<BackupRecord>, max_count: u64, reserved_slots: u64) -> Vec<BackupRecord> {
        let mut remaining = (records.len() as u64 + reserved_slots).saturating_sub(max_count);
        let mut deleted = Vec::new();

        for record in records {
            if remaining == 0 {
                break;
            }
            match self.delete(&record) {
                Ok(()) => {
                    info!(path = %record.path.display(), max_count, "Deleted old backup to stay within count budget");
                    remaining -= 1;
                    deleted.push(record);
                }
                Err(e) => warn!(error = %e, "Count retention skipped a backup"),
            }
        }

        if remaining > 0 {
            warn!(remaining, max_count, "Count budget cannot be satisfied");
        }

        deleted
    }

    /// Remove an archive and, best-effort, its paired log folder
    fn delete(&self, record: &BackupRecord) -> Result<()> {
        std::fs::remove_file(&record.path).map_err(|source| BackupError::Eviction {
            path: record.path.clone(),
            source,
        })?;

        let logs = record
            .path
            .file_name()
            .and_then(|name| naming::decode(&name.to_string_lossy()))
            .map(|decoded| self.backup_dir.join(naming::log_dir_name(&decoded.dataset, &decoded.timestamp)));

        if let Some(logs) = logs {
            match std::fs::remove_dir_all(&logs) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %logs.display(), error = %e, "Could not delete backup logs"),
            }
        }

        Ok(())
    }
}
