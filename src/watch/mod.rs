//! File watcher.
//!
//! ```text
//! notify backend --raw events--> watch thread --debounced--> EventQueue --> consumer
//!                                  |  filter (root, temp files, skip dirs)
//!                                  |  Debouncer (per-path window)
//!                                  |  existence correction
//!                                  +- root maintenance, stale sweep
//! ```
//!
//! The watcher is started before the initial scan so no change made during
//! the scan is lost. OS notification is used when available, otherwise a
//! polling backend.

mod debouncer;
mod queue;
mod roots;
mod types;

pub use debouncer::MAX_DELAY_WINDOWS;
pub use queue::EventQueue;
pub use types::{ChangeEvent, ChangeKind};

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use notify::{Config, PollWatcher, RecommendedWatcher, Watcher};
use parking_lot::Mutex;
use thiserror::Error;

use crate::config::EngineConfig;
use crate::core::{ErrorKind, ProjectRoot, SecurityError, log_security};
use crate::scanner::SKIP_DIRS;
use crate::utils::path::{is_temp_file, normalize_path};
use crate::utils::plural_s;
use crate::{debug, log};
use debouncer::Debouncer;
use roots::WatchRoots;

/// Upper bound on how long the watch thread sleeps between housekeeping.
const TICK: Duration = Duration::from_millis(100);
const MAINTAIN_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("failed to start file watcher: {0}")]
    Notify(#[from] notify::Error),

    #[error("no directories to watch")]
    NoRoots,

    #[error(transparent)]
    Security(#[from] SecurityError),

    #[error("failed to spawn watch thread: {0}")]
    Thread(#[source] io::Error),
}

impl WatchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Notify(_) | Self::Thread(_) => ErrorKind::Transient,
            Self::NoRoots => ErrorKind::Structural,
            Self::Security(_) => ErrorKind::Security,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WatchOptions {
    pub roots: Vec<PathBuf>,
    pub debounce: Duration,
    pub queue_capacity: usize,
    pub sweep_interval: Duration,
    pub poll_interval: Duration,
    pub force_poll: bool,
}

impl WatchOptions {
    pub fn from_config(config: &EngineConfig) -> Self {
        let watch = &config.watch;
        Self {
            roots: config.scan.roots.clone(),
            debounce: Duration::from_millis(watch.debounce_ms),
            queue_capacity: watch.queue_capacity,
            sweep_interval: Duration::from_millis(watch.sweep_ms.max(1)),
            poll_interval: Duration::from_millis(watch.poll_interval_ms.max(1)),
            force_poll: watch.force_poll,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Native,
    Polling,
}

/// Running watcher. Stopping is idempotent and also happens on drop.
pub struct WatchHandle {
    queue: Arc<EventQueue>,
    stop: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
    backend: Backend,
}

impl WatchHandle {
    /// Wait up to `timeout` for debounced events; returns at most `max`.
    pub fn recv_batch(&self, max: usize, timeout: Duration) -> Vec<ChangeEvent> {
        self.queue.pop_batch(max, timeout)
    }

    pub fn queue(&self) -> &Arc<EventQueue> {
        &self.queue
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    pub fn dropped(&self) -> u64 {
        self.queue.dropped()
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    pub fn stop(&self) {
        if self.stop.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(handle) = self.thread.lock().take()
            && handle.join().is_err()
        {
            log!("watch"; "watch thread panicked");
        }
        self.queue.close();
        debug!("watch"; "stopped");
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Start watching `options.roots` (each must lie inside `root`).
pub fn watch(root: &ProjectRoot, options: WatchOptions) -> Result<WatchHandle, WatchError> {
    if options.roots.is_empty() {
        return Err(WatchError::NoRoots);
    }
    let dirs = options
        .roots
        .iter()
        .map(|dir| root.resolve(dir))
        .collect::<Result<Vec<_>, _>>()?;

    let (tx, rx) = mpsc::channel();
    let mut roots = WatchRoots::new(dirs);
    let (watcher, backend) = start_backend(&options, &mut roots, tx)?;

    let queue = Arc::new(EventQueue::new(options.queue_capacity));
    let stop = Arc::new(AtomicBool::new(false));
    let worker = WatchLoop {
        root: root.clone(),
        rx,
        watcher,
        roots,
        debouncer: Debouncer::new(options.debounce),
        queue: Arc::clone(&queue),
        stop: Arc::clone(&stop),
        sweep_interval: options.sweep_interval,
    };

    let thread = thread::Builder::new()
        .name("kiln-watch".into())
        .spawn(move || worker.run())
        .map_err(WatchError::Thread)?;

    debug!(
        "watch";
        "watching {} root{} ({:?})",
        options.roots.len(),
        plural_s(options.roots.len()),
        backend
    );
    Ok(WatchHandle {
        queue,
        stop,
        thread: Mutex::new(Some(thread)),
        backend,
    })
}

type RawEvent = notify::Result<notify::Event>;

fn start_backend(
    options: &WatchOptions,
    roots: &mut WatchRoots,
    tx: mpsc::Sender<RawEvent>,
) -> Result<(Box<dyn Watcher + Send>, Backend), WatchError> {
    if !options.force_poll {
        let native_tx = tx.clone();
        let native = RecommendedWatcher::new(
            move |res| {
                let _ = native_tx.send(res);
            },
            Config::default(),
        )
        .and_then(|mut watcher| {
            roots.attach_existing(&mut watcher)?;
            Ok(watcher)
        });
        match native {
            Ok(watcher) => return Ok((Box::new(watcher), Backend::Native)),
            Err(e) => log!("watch"; "native watcher unavailable ({}), falling back to polling", e),
        }
    }

    let mut poller = PollWatcher::new(
        move |res| {
            let _ = tx.send(res);
        },
        Config::default().with_poll_interval(options.poll_interval),
    )?;
    roots.attach_existing(&mut poller)?;
    Ok((Box::new(poller), Backend::Polling))
}

struct WatchLoop {
    root: ProjectRoot,
    rx: Receiver<RawEvent>,
    // Dropping the backend stops OS notifications
    watcher: Box<dyn Watcher + Send>,
    roots: WatchRoots,
    debouncer: Debouncer,
    queue: Arc<EventQueue>,
    stop: Arc<AtomicBool>,
    sweep_interval: Duration,
}

impl WatchLoop {
    fn run(mut self) {
        let mut last_maintain = Instant::now();
        let mut last_sweep = Instant::now();

        while !self.stop.load(Ordering::Acquire) {
            let now = Instant::now();
            let wait = self.debouncer.next_deadline(now).unwrap_or(TICK).min(TICK);

            match self.rx.recv_timeout(wait) {
                Ok(raw) => {
                    self.ingest(raw);
                    while let Ok(raw) = self.rx.try_recv() {
                        self.ingest(raw);
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }

            self.flush(Instant::now());

            if last_maintain.elapsed() >= MAINTAIN_INTERVAL {
                last_maintain = Instant::now();
                for dir in self.roots.maintain(self.watcher.as_mut()) {
                    // Files created while the root was gone are picked up by a walk
                    self.debouncer.add(dir, ChangeKind::Created, Instant::now());
                }
            }

            if last_sweep.elapsed() >= self.sweep_interval {
                last_sweep = Instant::now();
                let swept = self.debouncer.sweep(last_sweep, self.sweep_interval);
                if swept > 0 {
                    debug!("watch"; "swept {} stale path{}", swept, plural_s(swept));
                }
            }
        }

        self.queue.close();
        debug!("watch"; "loop exited ({} roots attached)", self.roots.attached_count());
    }

    fn ingest(&mut self, raw: RawEvent) {
        let event = match raw {
            Ok(event) => event,
            Err(e) => {
                log!("watch"; "notify error: {}", e);
                return;
            }
        };
        let Some(kind) = ChangeKind::from_notify(&event.kind) else {
            return;
        };

        let now = Instant::now();
        for path in &event.paths {
            if let Some(path) = self.accept(path) {
                debug!("watch"; "{} {}", kind.label(), path.display());
                self.debouncer.add(path, kind, now);
            }
        }
    }

    /// Boundary filter: inside the root, under a watch root, not an editor
    /// artifact, not inside a skipped directory.
    fn accept(&self, path: &Path) -> Option<PathBuf> {
        if is_temp_file(path) {
            return None;
        }
        let path = normalize_path(path);
        if !self.root.contains(&path) {
            log_security(&SecurityError::PathTraversal {
                path,
                root: self.root.path().to_path_buf(),
            });
            return None;
        }
        let skipped = self.root.relative(&path).components().any(|c| {
            c.as_os_str()
                .to_str()
                .is_some_and(|name| SKIP_DIRS.contains(&name))
        });
        (!skipped && self.roots.covers(&path)).then_some(path)
    }

    fn flush(&mut self, now: Instant) {
        let mut dropped = 0usize;
        for event in self.debouncer.take_ready(now) {
            if self.queue.push(correct_by_existence(event)) {
                dropped += 1;
            }
        }
        if dropped > 0 {
            log!(
                "watch";
                "event queue full: dropped {} oldest event{} ({} total)",
                dropped,
                plural_s(dropped),
                self.queue.dropped()
            );
        }
    }
}

/// Reconcile an event with what is on disk now.
///
/// Atomic saves show up as remove + create; a stale create can arrive for a
/// file that is already gone.
fn correct_by_existence(mut event: ChangeEvent) -> ChangeEvent {
    let exists = event.path.exists();
    event.kind = match (event.kind, exists) {
        (ChangeKind::Removed, true) => ChangeKind::Modified,
        (ChangeKind::Created | ChangeKind::Modified, false) => ChangeKind::Removed,
        (kind, _) => kind,
    };
    event
}

#[cfg(test)]
mod tests;
