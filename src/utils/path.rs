//! Path helpers.

use std::path::{Path, PathBuf};

/// Normalize a file system path to absolute form.
///
/// Tries `canonicalize()` first (resolves symlinks, `.`, `..`); falls back to
/// the path itself when absolute, or joined onto the cwd when relative.
/// Removed files cannot be canonicalized, so their parent is canonicalized
/// instead to keep keys consistent with paths recorded while they existed.
pub fn normalize_path(path: &Path) -> PathBuf {
    if let Ok(canonical) = path.canonicalize() {
        return canonical;
    }
    if let (Some(parent), Some(name)) = (path.parent(), path.file_name())
        && let Ok(parent) = parent.canonicalize()
    {
        return parent.join(name);
    }
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir().map_or_else(|_| path.to_path_buf(), |cwd| cwd.join(path))
    }
}

/// Check if path is a temp/backup file (editor artifacts).
pub fn is_temp_file(path: &Path) -> bool {
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");

    matches!(ext, "bck" | "bak" | "backup" | "swp" | "swo" | "swx" | "tmp")
        || name.ends_with('~')
        || name.starts_with('.')
        || name.starts_with("#")
}

/// File extension check against a configured list (without dots).
pub fn has_extension(path: &Path, extensions: &[String]) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| extensions.iter().any(|want| want.eq_ignore_ascii_case(ext)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_removed_file_keeps_canonical_parent() {
        let dir = tempfile::TempDir::new().unwrap();
        let file = dir.path().join("gone.component");
        let normalized = normalize_path(&file);
        assert_eq!(normalized, dir.path().canonicalize().unwrap().join("gone.component"));
    }

    #[test]
    fn test_temp_files() {
        assert!(is_temp_file(Path::new("/p/.button.component.swp")));
        assert!(is_temp_file(Path::new("/p/button.component~")));
        assert!(is_temp_file(Path::new("/p/button.tmp")));
        assert!(!is_temp_file(Path::new("/p/button.component")));
    }

    #[test]
    fn test_has_extension() {
        let exts = vec!["component".to_string(), "templ".to_string()];
        assert!(has_extension(Path::new("a/Button.COMPONENT"), &exts));
        assert!(has_extension(Path::new("a/card.templ"), &exts));
        assert!(!has_extension(Path::new("a/card.go"), &exts));
        assert!(!has_extension(Path::new("a/Makefile"), &exts));
    }
}
