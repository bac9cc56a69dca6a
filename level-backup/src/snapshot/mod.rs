//! Consistent snapshots of the live dataset.
//!
//! A snapshot is produced by flushing the dataset (optionally into a scratch
//! directory instead of its real save location) and reading the flushed tree
//! into memory. The save path and the dataset's dirty markers are restored
//! whatever happens during the flush.

pub mod dirty;
pub mod tree;

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::dataset::Dataset;
use crate::utils::errors::{BackupError, Result};
use dirty::DirtyState;
pub use tree::{SnapshotFile, SnapshotFilter, VirtualDirectorySnapshot};

/// Produces [`VirtualDirectorySnapshot`]s of a dataset.
///
/// Redirecting the save path mutates the dataset, so callers must serialize
/// `gather` calls; the orchestrator's gate does this.
#[derive(Debug, Clone)]
pub struct SnapshotCoordinator {
    scratch_dir: PathBuf,
    filter: SnapshotFilter,
}

impl SnapshotCoordinator {
    pub fn new(scratch_dir: impl Into<PathBuf>) -> Self {
        Self {
            scratch_dir: scratch_dir.into(),
            filter: SnapshotFilter::default(),
        }
    }

    pub fn with_filter(mut self, filter: SnapshotFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn scratch_dir(&self) -> &Path {
        &self.scratch_dir
    }

    /// Flush `dataset` and read the result into memory.
    ///
    /// With `use_temporary_path` the flush goes to the scratch directory and
    /// the user-visible save is left alone; otherwise the backup is a
    /// by-product of a real save. Blocks for the duration of the flush.
    pub fn gather(&self, dataset: &mut dyn Dataset, use_temporary_path: bool) -> Result<VirtualDirectorySnapshot> {
        let flushed_to = {
            let redirect = use_temporary_path.then(|| self.scratch_dir.clone());
            let mut session = FlushSession::begin(dataset, redirect);

            if use_temporary_path {
                self.clear_scratch();
            }

            let target = session.save_path().to_path_buf();
            debug!(target = %target.display(), "Flushing dataset for backup");
            session.flush().map_err(BackupError::Flush)?;
            target
        };

        tree::read_tree(&flushed_to, &self.filter)
    }

    fn clear_scratch(&self) {
        match std::fs::remove_dir_all(&self.scratch_dir) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.scratch_dir.display(), error = %e, "Could not clear scratch directory"),
        }
    }
}

/// Scope in which the dataset may be flushed to a redirected path.
///
/// Dropping it restores the original save path and re-applies the dirty
/// markers captured at the start, including when the flush failed or
/// panicked.
struct FlushSession<'a> {
    dataset: &'a mut dyn Dataset,
    original_path: Option<PathBuf>,
    dirty: DirtyState,
}

impl<'a> FlushSession<'a> {
    fn begin(dataset: &'a mut dyn Dataset, redirect: Option<PathBuf>) -> Self {
        let dirty = DirtyState::capture(&*dataset);
        let original_path = redirect.map(|path| {
            let original = dataset.save_path().to_path_buf();
            dataset.set_save_path(path);
            original
        });

        Self {
            dataset,
            original_path,
            dirty,
        }
    }
}

impl FlushSession<'_> {
    fn save_path(&self) -> &Path {
        self.dataset.save_path()
    }

    fn flush(&mut self) -> anyhow::Result<()> {
        self.dataset.flush()
    }
}

impl Drop for FlushSession<'_> {
    fn drop(&mut self) {
        if let Some(original) = self.original_path.take() {
            self.dataset.set_save_path(original);
        }
        self.dirty.apply(&mut *self.dataset);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::DirtyMarker;
    use crate::testing::FakeDataset;
    use tempfile::TempDir;

    #[test]
    fn test_temporary_gather_leaves_live_save_alone() -> Result<()> {
        let temp = TempDir::new()?;
        let live = temp.path().join("live");
        let scratch = temp.path().join("scratch");
        let mut dataset = FakeDataset::new("Lobby", &live).with_file("level.json", b"{}");

        let snapshot = SnapshotCoordinator::new(&scratch).gather(&mut dataset, true)?;

        assert_eq!(snapshot.files().len(), 1);
        assert_eq!(snapshot.files()[0].relative_path, "level.json");
        assert_eq!(dataset.save_path(), live.as_path());
        assert_eq!(dataset.flush_targets(), vec![scratch]);
        assert!(!live.exists());
        Ok(())
    }

    #[test]
    fn test_live_gather_flushes_to_save_path() -> Result<()> {
        let temp = TempDir::new()?;
        let live = temp.path().join("live");
        let mut dataset = FakeDataset::new("Lobby", &live).with_file("level.json", b"{}");

        let snapshot = SnapshotCoordinator::new(temp.path().join("scratch")).gather(&mut dataset, false)?;

        assert_eq!(snapshot.files().len(), 1);
        assert_eq!(dataset.flush_targets(), vec![live.clone()]);
        assert!(live.join("level.json").exists());
        Ok(())
    }

    #[test]
    fn test_stale_scratch_is_cleared() -> Result<()> {
        let temp = TempDir::new()?;
        let scratch = temp.path().join("scratch");
        std::fs::create_dir_all(&scratch)?;
        std::fs::write(scratch.join("leftover.json"), b"old")?;
        let mut dataset = FakeDataset::new("Lobby", temp.path().join("live")).with_file("level.json", b"{}");

        let snapshot = SnapshotCoordinator::new(&scratch).gather(&mut dataset, true)?;

        let paths: Vec<_> = snapshot.files().iter().map(|f| f.relative_path.as_str()).collect();
        assert_eq!(paths, vec!["level.json"]);
        Ok(())
    }

    #[test]
    fn test_dirty_markers_survive_successful_gather() -> Result<()> {
        let temp = TempDir::new()?;
        let a = DirtyMarker::new("a");
        let b = DirtyMarker::new("b");
        let mut dataset = FakeDataset::new("Lobby", temp.path().join("live"))
            .with_file("level.json", b"{}")
            .with_dirty(&[a.clone(), b.clone()]);

        SnapshotCoordinator::new(temp.path().join("scratch")).gather(&mut dataset, true)?;

        assert_eq!(dataset.dirty_markers(), vec![a, b]);
        Ok(())
    }

    #[test]
    fn test_failed_flush_restores_path_and_dirty_markers() {
        let temp = TempDir::new().unwrap();
        let live = temp.path().join("live");
        let a = DirtyMarker::new("a");
        let b = DirtyMarker::new("b");
        let mut dataset = FakeDataset::new("Lobby", &live)
            .with_dirty(&[a.clone(), b.clone()])
            .failing();

        let err = SnapshotCoordinator::new(temp.path().join("scratch"))
            .gather(&mut dataset, true)
            .unwrap_err();

        assert!(matches!(err, BackupError::Flush(_)));
        assert_eq!(dataset.save_path(), live.as_path());
        assert_eq!(dataset.dirty_markers(), vec![a, b]);
    }

    #[test]
    fn test_markers_added_during_flush_are_kept() -> Result<()> {
        let temp = TempDir::new()?;
        let a = DirtyMarker::new("a");
        let b = DirtyMarker::new("b");
        let during = DirtyMarker::new("edited while saving");
        let mut dataset = FakeDataset::new("Lobby", temp.path().join("live"))
            .with_file("level.json", b"{}")
            .with_dirty(&[a.clone(), b.clone()])
            .dirtying_during_flush(during.clone());

        SnapshotCoordinator::new(temp.path().join("scratch")).gather(&mut dataset, true)?;

        let markers = dataset.dirty_markers();
        assert_eq!(markers.len(), 3);
        for marker in [&a, &b, &during] {
            assert!(markers.contains(marker));
        }
        Ok(())
    }

    #[test]
    fn test_editor_artifacts_are_not_captured() -> Result<()> {
        let temp = TempDir::new()?;
        let mut dataset = FakeDataset::new("Lobby", temp.path().join("live"))
            .with_file("level.json", b"{}")
            .with_file("preview.png", b"png")
            .with_file("editor/camera.json", b"{}");

        let snapshot = SnapshotCoordinator::new(temp.path().join("scratch")).gather(&mut dataset, true)?;

        let paths: Vec<_> = snapshot.files().iter().map(|f| f.relative_path.as_str()).collect();
        assert_eq!(paths, vec!["level.json"]);
        assert!(snapshot.directories().contains("editor"));
        Ok(())
    }
}
