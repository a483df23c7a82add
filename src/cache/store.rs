//! Cache persistence.
//!
//! Each live entry becomes one file `<path-digest>-<fingerprint>.json` in the
//! cache directory, so an entry's name alone says which `(path, fingerprint)`
//! it belongs to. Unreadable or mismatched files are treated as misses and
//! removed on restore.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use rustc_hash::FxHashSet;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::ContentCache;
use crate::utils::hash::{Fingerprint, path_digest};

#[derive(Debug, Serialize, Deserialize)]
struct PersistedEntry<V> {
    path: PathBuf,
    fingerprint: Fingerprint,
    recency: u64,
    value: V,
}

fn entry_filename(path: &Path, fingerprint: Fingerprint) -> String {
    format!("{}-{}.json", path_digest(path), fingerprint.to_hex())
}

/// Write every live entry of `cache` into `dir`, replacing what was there.
pub fn persist_cache<V>(cache: &ContentCache<V>, dir: &Path) -> io::Result<usize>
where
    V: Clone + Serialize,
{
    fs::create_dir_all(dir)?;

    // Snapshot under the cache lock, write with no lock held
    let entries = cache.snapshot();

    let mut written = FxHashSet::default();
    for (path, entry) in entries {
        let filename = entry_filename(&path, entry.fingerprint);
        let persisted = PersistedEntry {
            path,
            fingerprint: entry.fingerprint,
            recency: entry.recency,
            value: entry.value,
        };
        let json = match serde_json::to_vec(&persisted) {
            Ok(json) => json,
            Err(e) => {
                crate::debug!("cache"; "failed to serialize {}: {}", persisted.path.display(), e);
                continue;
            }
        };
        if fs::write(dir.join(&filename), json).is_ok() {
            written.insert(filename);
        }
    }

    // Entries evicted since the last persist
    for stale in fs::read_dir(dir)?.flatten() {
        let name = stale.file_name().to_string_lossy().into_owned();
        if name.ends_with(".json") && !written.contains(&name) {
            let _ = fs::remove_file(stale.path());
        }
    }

    crate::debug!("cache"; "saved {} entries to {}", written.len(), dir.display());
    Ok(written.len())
}

/// Load entries from `dir` into `cache`. A missing directory restores nothing.
pub fn restore_cache<V>(cache: &ContentCache<V>, dir: &Path) -> io::Result<usize>
where
    V: Clone + DeserializeOwned,
{
    let read_dir = match fs::read_dir(dir) {
        Ok(read_dir) => read_dir,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };

    let mut entries = Vec::new();
    for file in read_dir.flatten() {
        let path = file.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        match load_entry::<V>(&path) {
            Some(entry) => entries.push(entry),
            None => {
                crate::debug!("cache"; "discarding corrupt entry {}", path.display());
                let _ = fs::remove_file(&path);
            }
        }
    }

    // Oldest first so LRU order survives the round trip
    entries.sort_by_key(|e| e.recency);
    let restored = entries.len();
    for entry in entries {
        cache.insert(entry.path, entry.fingerprint, entry.value);
    }

    crate::debug!("cache"; "restored {} entries from {}", restored, dir.display());
    Ok(restored)
}

fn load_entry<V: DeserializeOwned>(file: &Path) -> Option<PersistedEntry<V>> {
    let bytes = fs::read(file).ok()?;
    let entry: PersistedEntry<V> = serde_json::from_slice(&bytes).ok()?;
    let expected = entry_filename(&entry.path, entry.fingerprint);
    let actual = file.file_name()?.to_str()?;
    (actual == expected).then_some(entry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    fn cache() -> ContentCache<String> {
        ContentCache::new(16, Duration::from_secs(60))
    }

    #[test]
    fn test_persist_and_restore() {
        let dir = TempDir::new().unwrap();
        let source = cache();
        let a = PathBuf::from("/proj/a.component");
        let b = PathBuf::from("/proj/b.component");
        source.insert(a.clone(), Fingerprint::of("a"), "meta-a".into());
        source.insert(b.clone(), Fingerprint::of("b"), "meta-b".into());

        assert_eq!(persist_cache(&source, dir.path()).unwrap(), 2);

        let target = cache();
        assert_eq!(restore_cache(&target, dir.path()).unwrap(), 2);
        assert_eq!(target.get(&a, Fingerprint::of("a")).as_deref(), Some("meta-a"));
        assert_eq!(target.get(&b, Fingerprint::of("b")).as_deref(), Some("meta-b"));
        assert_eq!(target.get(&a, Fingerprint::of("changed")), None);
    }

    #[test]
    fn test_corrupt_entry_is_a_miss() {
        let dir = TempDir::new().unwrap();
        let source = cache();
        source.insert(PathBuf::from("/proj/a"), Fingerprint::of("a"), "ok".into());
        persist_cache(&source, dir.path()).unwrap();

        let corrupt = dir.path().join("0000000000000000-0000000000000000.json");
        fs::write(&corrupt, b"{ not json").unwrap();

        let target = cache();
        assert_eq!(restore_cache(&target, dir.path()).unwrap(), 1);
        assert!(!corrupt.exists());
    }

    #[test]
    fn test_renamed_entry_is_rejected() {
        let dir = TempDir::new().unwrap();
        let source = cache();
        source.insert(PathBuf::from("/proj/a"), Fingerprint::of("a"), "ok".into());
        persist_cache(&source, dir.path()).unwrap();

        let original = fs::read_dir(dir.path()).unwrap().next().unwrap().unwrap().path();
        fs::rename(&original, dir.path().join("ffffffffffffffff-ffffffffffffffff.json")).unwrap();

        let target = cache();
        assert_eq!(restore_cache(&target, dir.path()).unwrap(), 0);
    }

    #[test]
    fn test_persist_removes_evicted_entries() {
        let dir = TempDir::new().unwrap();
        let source = cache();
        let a = PathBuf::from("/proj/a");
        source.insert(a.clone(), Fingerprint::of("v1"), "one".into());
        persist_cache(&source, dir.path()).unwrap();
        source.insert(a.clone(), Fingerprint::of("v2"), "two".into());
        persist_cache(&source, dir.path()).unwrap();

        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_restore_missing_dir() {
        let dir = TempDir::new().unwrap();
        assert_eq!(restore_cache(&cache(), &dir.path().join("none")).unwrap(), 0);
    }
}
