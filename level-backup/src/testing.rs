//! Test doubles shared by the unit test suites.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::bail;

use crate::dataset::{Dataset, DirtyMarker};

type FlushHook = Box<dyn FnMut() + Send>;

/// In-memory dataset that writes a fixed set of files on flush.
pub struct FakeDataset {
    name: String,
    save_path: PathBuf,
    files: Vec<(String, Vec<u8>)>,
    dirty: Vec<DirtyMarker>,
    dirty_during_flush: Option<DirtyMarker>,
    fail: bool,
    on_flush: Option<FlushHook>,
    flush_targets: Vec<PathBuf>,
    flushes: Arc<AtomicUsize>,
}

impl FakeDataset {
    pub fn new(name: &str, save_path: impl AsRef<Path>) -> Self {
        Self {
            name: name.to_string(),
            save_path: save_path.as_ref().to_path_buf(),
            files: Vec::new(),
            dirty: Vec::new(),
            dirty_during_flush: None,
            fail: false,
            on_flush: None,
            flush_targets: Vec::new(),
            flushes: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_file(mut self, relative_path: &str, contents: impl AsRef<[u8]>) -> Self {
        self.files.push((relative_path.to_string(), contents.as_ref().to_vec()));
        self
    }

    pub fn with_dirty(mut self, markers: &[DirtyMarker]) -> Self {
        self.dirty.extend_from_slice(markers);
        self
    }

    /// Simulates an edit landing while the dataset is being written
    pub fn dirtying_during_flush(mut self, marker: DirtyMarker) -> Self {
        self.dirty_during_flush = Some(marker);
        self
    }

    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    pub fn on_flush(mut self, hook: impl FnMut() + Send + 'static) -> Self {
        self.on_flush = Some(Box::new(hook));
        self
    }

    pub fn flush_targets(&self) -> Vec<PathBuf> {
        self.flush_targets.clone()
    }

    /// Shared counter of `flush` calls, usable after the dataset is moved
    pub fn flush_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.flushes)
    }

    pub fn shared(self) -> Arc<Mutex<FakeDataset>> {
        Arc::new(Mutex::new(self))
    }
}

impl Dataset for FakeDataset {
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
        self.flushes.fetch_add(1, Ordering::SeqCst);
        self.flush_targets.push(self.save_path.clone());
        self.dirty.clear();

        if let Some(hook) = self.on_flush.as_mut() {
            hook();
        }
        if let Some(marker) = self.dirty_during_flush.clone() {
            self.mark_dirty(marker);
        }
        if self.fail {
            bail!("simulated flush failure");
        }

        for (relative_path, contents) in &self.files {
            let path = self.save_path.join(relative_path);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, contents)?;
        }
        std::fs::create_dir_all(&self.save_path)?;
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
