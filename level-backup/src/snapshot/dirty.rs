//! Preserving unsaved-change markers across a forced flush.

use crate::dataset::{Dataset, DirtyMarker};

/// Dirty markers captured right before a backup flush.
///
/// Flushing marks everything as saved, which is wrong when the flush went to a
/// scratch directory: the user's real save is still behind. Re-applying only
/// adds the captured markers back, so anything dirtied during the flush stays
/// dirty.
#[derive(Debug, Clone, Default)]
pub struct DirtyState {
    markers: Vec<DirtyMarker>,
}

impl DirtyState {
    pub fn capture(dataset: &dyn Dataset) -> Self {
        Self {
            markers: dataset.dirty_markers(),
        }
    }

    pub fn apply(&self, dataset: &mut dyn Dataset) {
        let current = dataset.dirty_markers();
        for marker in &self.markers {
            if !current.contains(marker) {
                dataset.mark_dirty(marker.clone());
            }
        }
    }

    pub fn markers(&self) -> &[DirtyMarker] {
        &self.markers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::DirectoryDataset;

    #[test]
    fn test_apply_restores_captured_markers() {
        let mut dataset = DirectoryDataset::new("Lobby", "/work", "/save");
        let a = DirtyMarker::new("a");
        let b = DirtyMarker::new("b");
        dataset.mark_dirty(a.clone());
        dataset.mark_dirty(b.clone());

        let state = DirtyState::capture(&dataset);
        let mut cleared = DirectoryDataset::new("Lobby", "/work", "/save");
        let c = DirtyMarker::new("c");
        cleared.mark_dirty(c.clone());
        state.apply(&mut cleared);

        assert_eq!(cleared.dirty_markers(), vec![c, a, b]);
    }

    #[test]
    fn test_apply_is_idempotent() {
        let mut dataset = DirectoryDataset::new("Lobby", "/work", "/save");
        dataset.mark_dirty(DirtyMarker::new("a"));
        let state = DirtyState::capture(&dataset);

        state.apply(&mut dataset);
        state.apply(&mut dataset);

        assert_eq!(dataset.dirty_markers(), state.markers());
    }
}
