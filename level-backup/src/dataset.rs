//! The live dataset being backed up.
//!
//! The backup engine only needs a handful of capabilities from the dataset:
//! read and redirect its save target, flush it, and read/restore its dirty
//! markers. [`DirectoryDataset`] is the stock implementation used by the
//! daemon: a working directory that is mirrored into its save path on flush.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::Context;
use walkdir::WalkDir;

/// Dataset shared between the session that edits it and the backup engine.
pub type SharedDataset = Arc<Mutex<dyn Dataset>>;

pub trait Dataset: Send {
    /// Logical name, used in backup file names
    fn name(&self) -> &str;

    /// Where `flush` currently writes to
    fn save_path(&self) -> &Path;

    fn set_save_path(&mut self, path: PathBuf);

    /// Write the whole dataset to its current save path. May be slow.
    fn flush(&mut self) -> anyhow::Result<()>;

    /// Sub-objects with unsaved changes, in marking order
    fn dirty_markers(&self) -> Vec<DirtyMarker>;

    fn mark_dirty(&mut self, marker: DirtyMarker);
}

/// "This sub-object has unsaved changes".
///
/// Markers compare by identity: two markers with the same label created
/// separately are different markers.
#[derive(Clone)]
pub struct DirtyMarker(Arc<str>);

impl DirtyMarker {
    pub fn new(label: impl Into<Arc<str>>) -> Self {
        Self(label.into())
    }

    pub fn label(&self) -> &str {
        &self.0
    }
}

impl PartialEq for DirtyMarker {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for DirtyMarker {}

impl Hash for DirtyMarker {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (Arc::as_ptr(&self.0) as *const u8 as usize).hash(state);
    }
}

impl fmt::Debug for DirtyMarker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("DirtyMarker").field(&self.label()).finish()
    }
}

/// A dataset living in a working directory.
///
/// `flush` mirrors the working directory into the save path, replacing what
/// was there, and clears the dirty markers like a real save does.
pub struct DirectoryDataset {
    name: String,
    work_dir: PathBuf,
    save_path: PathBuf,
    dirty: Vec<DirtyMarker>,
}

impl DirectoryDataset {
    pub fn new(name: impl Into<String>, work_dir: impl Into<PathBuf>, save_path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            work_dir: work_dir.into(),
            save_path: save_path.into(),
            dirty: Vec::new(),
        }
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }
}

impl Dataset for DirectoryDataset {
    fn name(&self) -> &str {
        &self.name
    }

    fn save_path(&self) -> &Path {
        &self.save_path
    }

    fn set_save_path(&mut self, path: PathBuf) {
        self.save_path = path;
    }

    fn flush(&mut self) -> anyhow::Result<()> {
        if self.save_path.exists() {
            std::fs::remove_dir_all(&self.save_path)
                .with_context(|| format!("clearing {}", self.save_path.display()))?;
        }
        std::fs::create_dir_all(&self.save_path)
            .with_context(|| format!("creating {}", self.save_path.display()))?;

        for entry in WalkDir::new(&self.work_dir).min_depth(1) {
            let entry = entry.with_context(|| format!("walking {}", self.work_dir.display()))?;
            let relative = entry.path().strip_prefix(&self.work_dir)?;
            let target = self.save_path.join(relative);

            if entry.file_type().is_dir() {
                std::fs::create_dir_all(&target)?;
            } else {
                std::fs::copy(entry.path(), &target)
                    .with_context(|| format!("copying {}", relative.display()))?;
            }
        }

        self.dirty.clear();
        tracing::debug!(dataset = %self.name, target = %self.save_path.display(), "Dataset flushed");
        Ok(())
    }

    fn dirty_markers(&self) -> Vec<DirtyMarker> {
        self.dirty.clone()
    }

    fn mark_dirty(&mut self, marker: DirtyMarker) {
        if !self.dirty.contains(&marker) {
            self.dirty.push(marker);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_markers_compare_by_identity() {
        let first = DirtyMarker::new("tiles");
        let second = DirtyMarker::new("tiles");
        assert_eq!(first, first.clone());
        assert_ne!(first, second);
        assert_eq!(first.label(), second.label());
    }

    #[test]
    fn test_mark_dirty_ignores_duplicates() {
        let mut dataset = DirectoryDataset::new("Lobby", "/work", "/save");
        let marker = DirtyMarker::new("props");
        dataset.mark_dirty(marker.clone());
        dataset.mark_dirty(marker.clone());
        assert_eq!(dataset.dirty_markers(), vec![marker]);
    }

    #[test]
    fn test_flush_mirrors_work_dir_and_clears_dirty() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let work = temp.path().join("work");
        let save = temp.path().join("save");
        fs::create_dir_all(work.join("rooms"))?;
        fs::write(work.join("level.json"), b"{}")?;
        fs::write(work.join("rooms/a.json"), b"[]")?;
        fs::create_dir_all(&save)?;
        fs::write(save.join("stale.json"), b"old")?;

        let mut dataset = DirectoryDataset::new("Lobby", &work, &save);
        dataset.mark_dirty(DirtyMarker::new("rooms"));
        dataset.flush()?;

        assert_eq!(fs::read(save.join("level.json"))?, b"{}");
        assert_eq!(fs::read(save.join("rooms/a.json"))?, b"[]");
        assert!(!save.join("stale.json").exists());
        assert!(dataset.dirty_markers().is_empty());
        Ok(())
    }
}
