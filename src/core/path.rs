//! Project root boundary.
//!
//! Every path that enters the engine from configuration or the filesystem
//! watcher is resolved here and rejected if it escapes the project root.

use std::path::{Component, Path, PathBuf};

use super::SecurityError;

/// Canonical project root with traversal checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectRoot {
    root: PathBuf,
}

impl ProjectRoot {
    /// Canonicalize `path`; it must be an existing directory.
    pub fn new(path: &Path) -> Result<Self, SecurityError> {
        let root = path
            .canonicalize()
            .map_err(|_| SecurityError::InvalidRoot(path.to_path_buf()))?;
        if !root.is_dir() {
            return Err(SecurityError::InvalidRoot(root));
        }
        Ok(Self { root })
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Resolve `path` (relative paths are joined onto the root) and check
    /// that the result stays inside the root.
    ///
    /// The path does not need to exist: the longest existing ancestor is
    /// canonicalized (resolving symlinks) and the remainder re-appended.
    pub fn resolve(&self, path: &Path) -> Result<PathBuf, SecurityError> {
        let joined = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        };
        let lexical = lexical_normalize(&joined);
        let resolved = canonicalize_existing_prefix(&lexical);

        if resolved.starts_with(&self.root) {
            Ok(resolved)
        } else {
            Err(SecurityError::PathTraversal {
                path: path.to_path_buf(),
                root: self.root.clone(),
            })
        }
    }

    /// Cheap containment check for already-absolute paths.
    pub fn contains(&self, path: &Path) -> bool {
        lexical_normalize(path).starts_with(&self.root)
    }

    /// Path relative to the root, for display.
    pub fn relative<'a>(&self, path: &'a Path) -> &'a Path {
        path.strip_prefix(&self.root).unwrap_or(path)
    }
}

/// Collapse `.` and `..` without touching the filesystem.
fn lexical_normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push(component);
                }
            }
            other => out.push(other),
        }
    }
    out
}

fn canonicalize_existing_prefix(path: &Path) -> PathBuf {
    let mut existing = path.to_path_buf();
    let mut rest = Vec::new();

    loop {
        if let Ok(canonical) = existing.canonicalize() {
            let mut out = canonical;
            for part in rest.iter().rev() {
                out.push(part);
            }
            return out;
        }
        match (existing.file_name().map(|n| n.to_os_string()), existing.parent()) {
            (Some(name), Some(parent)) => {
                rest.push(name);
                existing = parent.to_path_buf();
            }
            _ => return path.to_path_buf(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn root() -> (TempDir, ProjectRoot) {
        let temp = TempDir::new().unwrap();
        let root = ProjectRoot::new(temp.path()).unwrap();
        (temp, root)
    }

    #[test]
    fn test_resolve_relative_inside() {
        let (_temp, root) = root();
        std::fs::create_dir_all(root.path().join("ui")).unwrap();
        let resolved = root.resolve(Path::new("ui/button.component")).unwrap();
        assert_eq!(resolved, root.path().join("ui/button.component"));
    }

    #[test]
    fn test_resolve_rejects_traversal() {
        let (_temp, root) = root();
        let err = root.resolve(Path::new("../../etc/passwd")).unwrap_err();
        assert!(matches!(err, SecurityError::PathTraversal { .. }));
    }

    #[test]
    fn test_resolve_rejects_absolute_outside() {
        let (_temp, root) = root();
        let other = TempDir::new().unwrap();
        assert!(root.resolve(other.path()).is_err());
    }

    #[test]
    fn test_resolve_dotdot_that_stays_inside() {
        let (_temp, root) = root();
        let resolved = root.resolve(Path::new("ui/../components/a.component")).unwrap();
        assert_eq!(resolved, root.path().join("components/a.component"));
    }

    #[cfg(unix)]
    #[test]
    fn test_resolve_rejects_symlink_escape() {
        let (_temp, root) = root();
        let outside = TempDir::new().unwrap();
        std::os::unix::fs::symlink(outside.path(), root.path().join("link")).unwrap();
        assert!(root.resolve(Path::new("link/secret.component")).is_err());
    }

    #[test]
    fn test_invalid_root() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("file.txt");
        std::fs::write(&file, "x").unwrap();
        assert!(ProjectRoot::new(&file).is_err());
        assert!(ProjectRoot::new(&temp.path().join("missing")).is_err());
    }

    #[test]
    fn test_relative_display() {
        let (_temp, root) = root();
        let path = root.path().join("ui/a.component");
        assert_eq!(root.relative(&path), Path::new("ui/a.component"));
    }
}
