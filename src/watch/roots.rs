use std::path::{Path, PathBuf};

use notify::{RecursiveMode, Watcher};
use rustc_hash::FxHashSet;

/// Keeps the desired watch roots attached to the backend.
///
/// Roots that do not exist yet are attached once they appear; roots that
/// vanish are dropped and re-attached when they come back.
pub(super) struct WatchRoots {
    desired: Vec<PathBuf>,
    attached: FxHashSet<PathBuf>,
}

impl WatchRoots {
    pub(super) fn new(paths: Vec<PathBuf>) -> Self {
        Self {
            desired: paths,
            attached: FxHashSet::default(),
        }
    }

    pub(super) fn attach_existing(&mut self, watcher: &mut dyn Watcher) -> notify::Result<()> {
        for path in &self.desired {
            if !path.is_dir() {
                continue;
            }
            watcher.watch(path, RecursiveMode::Recursive)?;
            self.attached.insert(path.clone());
        }
        Ok(())
    }

    /// Returns the roots that were re-attached.
    pub(super) fn maintain(&mut self, watcher: &mut dyn Watcher) -> Vec<PathBuf> {
        self.attached.retain(|path| path.is_dir());

        let mut reattached = Vec::new();
        for path in &self.desired {
            if self.attached.contains(path) || !path.is_dir() {
                continue;
            }
            match watcher.watch(path, RecursiveMode::Recursive) {
                Ok(()) => {
                    self.attached.insert(path.clone());
                    crate::debug!("watch"; "re-attached watch: {}", path.display());
                    reattached.push(path.clone());
                }
                Err(e) => crate::debug!("watch"; "cannot attach {}: {}", path.display(), e),
            }
        }
        reattached
    }

    pub(super) fn covers(&self, path: &Path) -> bool {
        self.desired.iter().any(|root| path.starts_with(root))
    }

    pub(super) fn attached_count(&self) -> usize {
        self.attached.len()
    }
}
