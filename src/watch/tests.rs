use std::fs;
use std::path::PathBuf;
use std::time::{Duration, Instant, SystemTime};

use tempfile::TempDir;

use super::*;

fn options(root: &ProjectRoot, force_poll: bool) -> WatchOptions {
    WatchOptions {
        roots: vec![root.path().to_path_buf()],
        debounce: Duration::from_millis(30),
        queue_capacity: 64,
        sweep_interval: Duration::from_secs(60),
        poll_interval: Duration::from_millis(50),
        force_poll,
    }
}

/// Collect events until one for `path` arrives or the timeout elapses.
fn wait_for(handle: &WatchHandle, path: &Path, timeout: Duration) -> Vec<ChangeEvent> {
    let deadline = Instant::now() + timeout;
    let mut seen = Vec::new();
    while Instant::now() < deadline {
        let batch = handle.recv_batch(64, Duration::from_millis(50));
        let found = batch.iter().any(|e| e.path == path);
        seen.extend(batch);
        if found {
            break;
        }
    }
    seen
}

fn setup() -> (TempDir, ProjectRoot) {
    let dir = TempDir::new().unwrap();
    let root = ProjectRoot::new(dir.path()).unwrap();
    (dir, root)
}

#[test]
fn test_reports_new_file() {
    let (_dir, root) = setup();
    let handle = watch(&root, options(&root, false)).unwrap();
    // give the backend a moment to attach
    std::thread::sleep(Duration::from_millis(100));

    let path = root.path().join("button.component");
    fs::write(&path, "component Button() {}").unwrap();

    let events = wait_for(&handle, &path, Duration::from_secs(5));
    let event = events.iter().find(|e| e.path == path).unwrap();
    assert_ne!(event.kind, ChangeKind::Removed);
}

#[test]
fn test_polling_backend_reports_changes() {
    let (_dir, root) = setup();
    let path = root.path().join("card.component");
    fs::write(&path, "component Card() {}").unwrap();

    let handle = watch(&root, options(&root, true)).unwrap();
    assert_eq!(handle.backend(), Backend::Polling);
    std::thread::sleep(Duration::from_millis(150));

    fs::remove_file(&path).unwrap();
    let events = wait_for(&handle, &path, Duration::from_secs(5));
    let event = events.iter().find(|e| e.path == path).unwrap();
    assert_eq!(event.kind, ChangeKind::Removed);
}

#[test]
fn test_editor_artifacts_and_skip_dirs_are_ignored() {
    let (_dir, root) = setup();
    let handle = watch(&root, options(&root, false)).unwrap();
    std::thread::sleep(Duration::from_millis(100));

    fs::write(root.path().join(".button.component.swp"), "x").unwrap();
    fs::write(root.path().join("button.component~"), "x").unwrap();
    fs::create_dir_all(root.path().join("node_modules/pkg")).unwrap();
    fs::write(root.path().join("node_modules/pkg/dep.component"), "x").unwrap();
    let marker = root.path().join("marker.component");
    fs::write(&marker, "component Marker() {}").unwrap();

    let events = wait_for(&handle, &marker, Duration::from_secs(5));
    assert!(events.iter().any(|e| e.path == marker));
    for event in &events {
        let name = event.path.file_name().unwrap().to_string_lossy();
        assert!(!name.ends_with(".swp") && !name.ends_with('~'), "{event:?}");
        assert!(!event.path.components().any(|c| c.as_os_str() == "node_modules"));
    }
}

#[test]
fn test_stop_is_idempotent() {
    let (_dir, root) = setup();
    let handle = watch(&root, options(&root, false)).unwrap();
    handle.stop();
    handle.stop();
    assert!(handle.is_stopped());
    assert!(handle.queue().is_closed());
    assert!(handle.recv_batch(8, Duration::from_millis(10)).is_empty());
}

#[test]
fn test_empty_roots_rejected() {
    let (_dir, root) = setup();
    let mut opts = options(&root, false);
    opts.roots.clear();
    let err = watch(&root, opts).err().unwrap();
    assert_eq!(err.kind(), ErrorKind::Structural);
}

#[test]
fn test_root_outside_project_rejected() {
    let (_dir, root) = setup();
    let outside = TempDir::new().unwrap();
    let mut opts = options(&root, false);
    opts.roots = vec![outside.path().to_path_buf()];
    let err = watch(&root, opts).err().unwrap();
    assert_eq!(err.kind(), ErrorKind::Security);
}

#[test]
fn test_correct_by_existence() {
    let dir = TempDir::new().unwrap();
    let present = dir.path().join("present.component");
    fs::write(&present, "x").unwrap();
    let event = |path: PathBuf, kind| ChangeEvent {
        path,
        kind,
        detected_at: SystemTime::now(),
    };

    let fixed = correct_by_existence(event(present.clone(), ChangeKind::Removed));
    assert_eq!(fixed.kind, ChangeKind::Modified);

    let gone = dir.path().join("gone.component");
    let fixed = correct_by_existence(event(gone.clone(), ChangeKind::Created));
    assert_eq!(fixed.kind, ChangeKind::Removed);
    let fixed = correct_by_existence(event(gone, ChangeKind::Removed));
    assert_eq!(fixed.kind, ChangeKind::Removed);
}
