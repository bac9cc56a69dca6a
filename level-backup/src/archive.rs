//! Packing snapshots into zip archives and committing them to disk.

use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::naming;
use crate::retention::{BackupRecord, RetentionEngine, RetentionPolicy};
use crate::snapshot::VirtualDirectorySnapshot;
use crate::utils::errors::{BackupError, Result};

const PARTIAL_SUFFIX: &str = ".partial";

/// Build the complete archive in memory.
///
/// Directories become zero-length `name/` entries, files are deflated.
pub fn pack(snapshot: &VirtualDirectorySnapshot) -> Result<Vec<u8>> {
    let mut zip = ZipWriter::new(Cursor::new(Vec::with_capacity(snapshot.total_bytes() as usize / 2)));
    let dir_options = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);
    let file_options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    for dir in snapshot.directories() {
        zip.add_directory(format!("{dir}/"), dir_options)?;
    }

    for file in snapshot.files() {
        zip.start_file(file.relative_path.as_str(), file_options)?;
        zip.write_all(&file.bytes)?;
    }

    Ok(zip.finish()?.into_inner())
}

/// Write `blob` to `path` in one go.
///
/// The bytes land in a hidden sibling file first and are renamed into place,
/// so a `backup_*` file is either complete or absent.
pub fn commit(path: &Path, blob: &[u8]) -> Result<()> {
    let write_error = |source: std::io::Error| BackupError::Write {
        path: path.to_path_buf(),
        source,
    };

    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let file_name = path
        .file_name()
        .ok_or_else(|| write_error(std::io::Error::new(std::io::ErrorKind::InvalidInput, "archive path has no file name")))?;
    let partial = parent.join(format!(".{}{PARTIAL_SUFFIX}", file_name.to_string_lossy()));

    std::fs::create_dir_all(parent).map_err(write_error)?;
    remove_stale_partials(parent);

    let result = std::fs::write(&partial, blob).and_then(|()| std::fs::rename(&partial, path));
    if let Err(e) = result {
        let _ = std::fs::remove_file(&partial);
        return Err(write_error(e));
    }

    Ok(())
}

/// Delete `.backup_*.partial` files left behind by an interrupted commit.
///
/// Commits are serialized, so any partial file seen here is dead.
fn remove_stale_partials(dir: &Path) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        let stale = name
            .strip_prefix('.')
            .is_some_and(|rest| rest.starts_with(naming::ARCHIVE_PREFIX) && rest.ends_with(PARTIAL_SUFFIX));
        if !stale {
            continue;
        }
        match std::fs::remove_file(entry.path()) {
            Ok(()) => debug!(path = %entry.path().display(), "Removed stale partial archive"),
            Err(e) => warn!(path = %entry.path().display(), error = %e, "Could not remove stale partial archive"),
        }
    }
}

/// Outcome of a committed backup
#[derive(Debug, Clone)]
pub struct WrittenArchive {
    pub path: PathBuf,
    pub size: u64,
    /// Old backups deleted to make room for this one
    pub evicted: Vec<BackupRecord>,
}

/// Packs a snapshot, makes room for it and commits it.
///
/// Every step runs on the blocking pool. Cancellation is checked between
/// steps, never in the middle of a write.
#[derive(Debug, Clone)]
pub struct ArchiveWriter {
    retention: RetentionEngine,
    cancel: CancellationToken,
}

impl ArchiveWriter {
    pub fn new(retention: RetentionEngine, cancel: CancellationToken) -> Self {
        Self { retention, cancel }
    }

    pub fn archive_path(&self, dataset: &str, timestamp: &DateTime<Utc>) -> PathBuf {
        self.retention.backup_dir().join(naming::archive_name(dataset, timestamp))
    }

    pub async fn write(
        &self,
        dataset: &str,
        timestamp: DateTime<Utc>,
        snapshot: VirtualDirectorySnapshot,
        policy: RetentionPolicy,
    ) -> Result<WrittenArchive> {
        let blob = tokio::task::spawn_blocking(move || pack(&snapshot)).await??;
        let size = blob.len() as u64;
        debug!(dataset, size, "Archive packed");
        self.check_cancelled()?;

        let retention = self.retention.clone();
        let owner = dataset.to_string();
        let evicted = tokio::task::spawn_blocking(move || retention.enforce(&owner, size, &policy)).await?;
        self.check_cancelled()?;

        let path = self.archive_path(dataset, &timestamp);
        let target = path.clone();
        tokio::task::spawn_blocking(move || commit(&target, &blob)).await??;

        info!(path = %path.display(), size, evicted = evicted.len(), "Backup archive written");
        Ok(WrittenArchive { path, size, evicted })
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(BackupError::Cancelled)
        } else {
            Ok(())
        }
    }
}
