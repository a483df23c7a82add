//! Two-tier artifact cache.
//!
//! Tier 1 compares size + mtime with what was recorded and never reads the
//! file. Tier 2 reads and fingerprints the file and looks up
//! `(path, fingerprint)`. Only a tier-2 miss reaches the compiler.
//!
//! One entry per file holds the output of every component built from that
//! content: each component compiles with its own arguments, so a hit is
//! per component, never per file.
//!
//! An entry whose mtime lies within [`RACY_WINDOW`] of when it was recorded
//! is "racily clean": a same-size rewrite inside the filesystem's timestamp
//! granularity would be invisible to tier 1, so such entries always fall
//! through to tier 2.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::cache::ContentCache;
use crate::utils::hash::Fingerprint;

pub const RACY_WINDOW: Duration = Duration::from_secs(1);

/// Successful compiles of one file's content plus the file stats they were
/// built from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub size: u64,
    pub mtime_ns: u64,
    pub recorded_at_ns: u64,
    /// Combined compiler output per component (warnings survive a cache hit).
    pub outputs: BTreeMap<String, String>,
}

impl Artifact {
    fn is_racy(&self) -> bool {
        self.recorded_at_ns.saturating_sub(self.mtime_ns) < RACY_WINDOW.as_nanos() as u64
    }
}

/// Outcome of looking up one component's artifact. Hits carry the
/// compiler output recorded for that component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    /// Tier 1: size and mtime unchanged.
    Fresh(String),
    /// Tier 2: content fingerprint unchanged.
    Verified(String),
    Miss(FileStamp),
}

/// What a miss learned about the file, for recording the next artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStamp {
    pub fingerprint: Fingerprint,
    pub size: u64,
    pub mtime_ns: u64,
}

pub struct ArtifactCache {
    entries: Arc<ContentCache<Artifact>>,
}

impl ArtifactCache {
    pub fn new(entries: Arc<ContentCache<Artifact>>) -> Self {
        Self { entries }
    }

    pub fn entries(&self) -> &Arc<ContentCache<Artifact>> {
        &self.entries
    }

    pub fn lookup(&self, path: &Path, component: &str) -> io::Result<Lookup> {
        let meta = fs::metadata(path)?;
        let size = meta.len();
        let mtime_ns = meta.modified().map(nanos_since_epoch).unwrap_or(0);

        if let Some((_, artifact)) = self.entries.latest(path)
            && artifact.size == size
            && artifact.mtime_ns == mtime_ns
            && !artifact.is_racy()
            && let Some(output) = artifact.outputs.get(component)
        {
            return Ok(Lookup::Fresh(output.clone()));
        }

        let (fingerprint, _) = Fingerprint::of_file(path)?;
        let stamp = FileStamp {
            fingerprint,
            size,
            mtime_ns,
        };
        let Some(output) = self
            .entries
            .get(path, fingerprint)
            .and_then(|artifact| artifact.outputs.get(component).cloned())
        else {
            return Ok(Lookup::Miss(stamp));
        };

        // Re-stamp so the next lookup can stop at tier 1
        self.entries.upsert(path.to_path_buf(), fingerprint, |current| Artifact {
            size,
            mtime_ns,
            recorded_at_ns: now_ns(),
            outputs: current.map(|a| a.outputs.clone()).unwrap_or_else(|| {
                BTreeMap::from([(component.to_string(), output.clone())])
            }),
        });
        Ok(Lookup::Verified(output))
    }

    /// Record a successful compile of `component`. Outputs of sibling
    /// components built from the same content are kept. Failed builds are
    /// never recorded.
    pub fn record(&self, path: PathBuf, component: &str, stamp: FileStamp, output: String) {
        self.entries.upsert(path, stamp.fingerprint, |current| {
            let mut outputs = current.map(|a| a.outputs.clone()).unwrap_or_default();
            outputs.insert(component.to_string(), output);
            Artifact {
                size: stamp.size,
                mtime_ns: stamp.mtime_ns,
                recorded_at_ns: now_ns(),
                outputs,
            }
        });
    }

    /// Forget `component`'s artifact; siblings in the same file stay cached.
    pub fn invalidate(&self, path: &Path, component: &str) {
        self.entries.edit(path, |artifact| {
            artifact.outputs.remove(component);
            !artifact.outputs.is_empty()
        });
    }
}

fn nanos_since_epoch(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

fn now_ns() -> u64 {
    nanos_since_epoch(SystemTime::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use tempfile::TempDir;

    fn cache() -> ArtifactCache {
        ArtifactCache::new(Arc::new(ContentCache::new(16, Duration::from_secs(60))))
    }

    /// Backdate a file so it is outside the racy window.
    fn backdate(path: &Path, secs: u64) {
        let file = File::options().write(true).open(path).unwrap();
        file.set_modified(SystemTime::now() - Duration::from_secs(secs))
            .unwrap();
    }

    fn record_miss(cache: &ArtifactCache, path: &Path) {
        record_as(cache, path, "A");
    }

    fn record_as(cache: &ArtifactCache, path: &Path, component: &str) {
        match cache.lookup(path, component).unwrap() {
            Lookup::Miss(stamp) => {
                cache.record(path.to_path_buf(), component, stamp, format!("{component} ok"))
            }
            other => panic!("expected miss, got {other:?}"),
        }
    }

    #[test]
    fn test_miss_then_tier1_hit() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.component");
        fs::write(&path, "component A() {}").unwrap();
        backdate(&path, 10);

        let cache = cache();
        record_miss(&cache, &path);
        assert!(matches!(cache.lookup(&path, "A").unwrap(), Lookup::Fresh(_)));
    }

    #[test]
    fn test_racily_clean_entry_falls_to_tier2() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.component");
        fs::write(&path, "component A() {}").unwrap();

        let cache = cache();
        record_miss(&cache, &path);
        // mtime is "now": recorded within the racy window
        assert!(matches!(cache.lookup(&path, "A").unwrap(), Lookup::Verified(_)));
    }

    #[test]
    fn test_touched_but_identical_is_tier2_hit() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.component");
        fs::write(&path, "component A() {}").unwrap();
        backdate(&path, 10);

        let cache = cache();
        record_miss(&cache, &path);
        backdate(&path, 5);
        assert!(matches!(cache.lookup(&path, "A").unwrap(), Lookup::Verified(_)));
    }

    #[test]
    fn test_same_size_rewrite_is_a_miss() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.component");
        fs::write(&path, "component A() {}").unwrap();

        let cache = cache();
        record_miss(&cache, &path);
        fs::write(&path, "component B() {}").unwrap();
        assert!(matches!(cache.lookup(&path, "A").unwrap(), Lookup::Miss(_)));
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        assert!(cache().lookup(&dir.path().join("gone.component"), "A").is_err());
    }

    #[test]
    fn test_hits_are_per_component() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("x.component");
        fs::write(&path, "component A() {}\ncomponent B() {}").unwrap();
        backdate(&path, 10);

        let cache = cache();
        record_as(&cache, &path, "B");
        // B's artifact says nothing about A, at either tier
        assert!(matches!(cache.lookup(&path, "A").unwrap(), Lookup::Miss(_)));
        assert_eq!(cache.lookup(&path, "B").unwrap(), Lookup::Fresh("B ok".into()));

        record_as(&cache, &path, "A");
        assert_eq!(cache.lookup(&path, "A").unwrap(), Lookup::Fresh("A ok".into()));
        assert_eq!(cache.lookup(&path, "B").unwrap(), Lookup::Fresh("B ok".into()));
        assert_eq!(cache.entries().len(), 1);

        cache.invalidate(&path, "A");
        assert!(matches!(cache.lookup(&path, "A").unwrap(), Lookup::Miss(_)));
        assert!(matches!(cache.lookup(&path, "B").unwrap(), Lookup::Fresh(_)));
        cache.invalidate(&path, "B");
        assert!(cache.entries().is_empty());
    }
}
