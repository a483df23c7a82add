//! Candidate discovery.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use globset::GlobSet;
use jwalk::WalkDir;

use crate::utils::path::{has_extension, is_temp_file};

/// Directories never descended into.
pub const SKIP_DIRS: &[&str] = &[".git", "node_modules", "target", "vendor", "dist", ".kiln"];

fn is_skipped_dir(name: &OsStr) -> bool {
    name.to_str().is_some_and(|n| SKIP_DIRS.contains(&n))
}

/// Which files count as component sources.
#[derive(Debug, Clone)]
pub struct CandidateFilter {
    pub root: PathBuf,
    pub extensions: Vec<String>,
    pub exclude: GlobSet,
}

impl CandidateFilter {
    pub fn accepts(&self, path: &Path) -> bool {
        if !has_extension(path, &self.extensions) || is_temp_file(path) {
            return false;
        }
        let relative = path.strip_prefix(&self.root).unwrap_or(path);
        if relative
            .components()
            .any(|c| is_skipped_dir(c.as_os_str()))
        {
            return false;
        }
        !self.exclude.is_match(relative)
    }
}

/// Walk `dir` and call `visit` for every accepted file until it returns
/// `false`.
pub fn walk(dir: &Path, filter: &CandidateFilter, mut visit: impl FnMut(PathBuf) -> bool) {
    let entries = WalkDir::new(dir)
        .skip_hidden(false)
        .process_read_dir(|_depth, _path, _state, children| {
            children.retain(|entry| {
                entry
                    .as_ref()
                    .map(|e| !(e.file_type().is_dir() && is_skipped_dir(&e.file_name)))
                    .unwrap_or(true)
            });
        });

    for entry in entries.into_iter().filter_map(Result::ok) {
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        if filter.accepts(&path) && !visit(path) {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use globset::{Glob, GlobSetBuilder};
    use std::fs;
    use tempfile::TempDir;

    fn filter(root: &Path, exclude: &[&str]) -> CandidateFilter {
        let mut builder = GlobSetBuilder::new();
        for pattern in exclude {
            builder.add(Glob::new(pattern).unwrap());
        }
        CandidateFilter {
            root: root.to_path_buf(),
            extensions: vec!["component".into()],
            exclude: builder.build().unwrap(),
        }
    }

    #[test]
    fn test_walk_skips_known_dirs_and_excludes() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        for rel in [
            "ui/button.component",
            "ui/legacy/old.component",
            "node_modules/pkg/x.component",
            ".git/y.component",
            "ui/readme.md",
            "ui/.button.component.swp",
        ] {
            let path = root.join(rel);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(&path, "").unwrap();
        }

        let filter = filter(root, &["ui/legacy/**"]);
        let mut found = Vec::new();
        walk(root, &filter, |p| {
            found.push(p.strip_prefix(root).unwrap().to_path_buf());
            true
        });
        assert_eq!(found, vec![PathBuf::from("ui/button.component")]);
    }

    #[test]
    fn test_walk_stops_when_visitor_declines() {
        let dir = TempDir::new().unwrap();
        for i in 0..5 {
            fs::write(dir.path().join(format!("c{i}.component")), "").unwrap();
        }
        let mut seen = 0;
        walk(dir.path(), &filter(dir.path(), &[]), |_| {
            seen += 1;
            false
        });
        assert_eq!(seen, 1);
    }
}
