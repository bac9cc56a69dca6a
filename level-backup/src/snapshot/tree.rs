//! In-memory copies of a directory tree.
//!
//! The tree is read once per backup, filtered down to the canonical,
//! re-loadable dataset content, and then never mutated again.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use walkdir::{DirEntry, WalkDir};

use crate::utils::errors::{BackupError, Result};

/// Images the editor regenerates on its own
const EPHEMERAL_IMAGE_STEMS: &[&str] = &["thumbnail", "preview", "chart"];
const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "bmp", "webp"];

/// Scratch files written under an `editor` path segment
const EDITOR_SCRATCH_STEMS: &[&str] = &["camera", "height", "material", "object", "spawn"];
const EDITOR_SEGMENT: &str = "editor";

/// Version-control metadata folders, skipped with their descendants
const VCS_DIRS: &[&str] = &[".git", ".svn", ".hg"];

/// A file captured in a snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotFile {
    /// Relative to the snapshot root, `/`-separated
    pub relative_path: String,
    pub bytes: Bytes,
}

/// Read-only copy of a directory tree
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VirtualDirectorySnapshot {
    files: Vec<SnapshotFile>,
    directories: BTreeSet<String>,
}

impl VirtualDirectorySnapshot {
    pub fn files(&self) -> &[SnapshotFile] {
        &self.files
    }

    /// Relative, `/`-separated directory paths (without trailing separator)
    pub fn directories(&self) -> &BTreeSet<String> {
        &self.directories
    }

    pub fn total_bytes(&self) -> u64 {
        self.files.iter().map(|f| f.bytes.len() as u64).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty() && self.directories.is_empty()
    }
}

/// Decides which entries of the flushed tree end up in a backup
#[derive(Debug, Clone, Default)]
pub struct SnapshotFilter {
    /// Additional directory names to skip entirely
    pub extra_excluded_dirs: Vec<String>,
}

impl SnapshotFilter {
    pub fn include_dir(&self, name: &str) -> bool {
        !VCS_DIRS.contains(&name) && !self.extra_excluded_dirs.iter().any(|d| d == name)
    }

    /// `relative_path` is `/`-separated and relative to the snapshot root
    pub fn include_file(&self, relative_path: &str) -> bool {
        let file_name = relative_path.rsplit('/').next().unwrap_or(relative_path);
        let lower = file_name.to_ascii_lowercase();
        let (stem, extension) = match lower.rsplit_once('.') {
            Some((stem, ext)) => (stem, ext),
            None => (lower.as_str(), ""),
        };

        if IMAGE_EXTENSIONS.contains(&extension) && EPHEMERAL_IMAGE_STEMS.iter().any(|s| stem.starts_with(s)) {
            return false;
        }

        let in_editor = relative_path
            .split('/')
            .rev()
            .skip(1)
            .any(|segment| segment.eq_ignore_ascii_case(EDITOR_SEGMENT));
        if in_editor && EDITOR_SCRATCH_STEMS.iter().any(|s| stem.starts_with(s)) {
            return false;
        }

        true
    }
}

/// Read `root` into memory, applying `filter`.
///
/// The root itself is not recorded as a directory entry.
pub fn read_tree(root: &Path, filter: &SnapshotFilter) -> Result<VirtualDirectorySnapshot> {
    let read_error = |path: PathBuf, source: std::io::Error| BackupError::Read { path, source };

    let mut snapshot = VirtualDirectorySnapshot::default();
    let walker = WalkDir::new(root)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| !entry.file_type().is_dir() || filter.include_dir(&entry.file_name().to_string_lossy()));

    for entry in walker {
        let entry = entry.map_err(|e| {
            let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| root.to_path_buf());
            read_error(path, e.into())
        })?;
        let relative = relative_path(&entry, root);

        if entry.file_type().is_dir() {
            snapshot.directories.insert(relative);
        } else if entry.file_type().is_file() {
            if !filter.include_file(&relative) {
                tracing::trace!(path = %relative, "Excluded from snapshot");
                continue;
            }
            let bytes = std::fs::read(entry.path()).map_err(|e| read_error(entry.path().to_path_buf(), e))?;
            snapshot.files.push(SnapshotFile {
                relative_path: relative,
                bytes: Bytes::from(bytes),
            });
        }
    }

    Ok(snapshot)
}

fn relative_path(entry: &DirEntry, root: &Path) -> String {
    let relative = entry.path().strip_prefix(root).unwrap_or(entry.path());
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}
