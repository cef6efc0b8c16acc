use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Paths currently owned by some stage of the pipeline.
///
/// A path is claimed by the watcher before it is emitted and released only
/// once the file has left the inbox (or was dropped), so rescans and repeated
/// notifications never start a second run for the same file.
#[derive(Clone, Debug, Default)]
pub struct ActivePaths {
    inner: Arc<Mutex<HashSet<PathBuf>>>,
}

impl ActivePaths {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` if the path is already owned.
    pub fn claim(&self, path: &Path) -> bool {
        self.lock().insert(path.to_path_buf())
    }

    pub fn release(&self, path: &Path) {
        self.lock().remove(path);
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.lock().contains(path)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<PathBuf>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
