use std::path::PathBuf;
use std::time::{Duration, Instant, SystemTime};

use rustc_hash::FxHashMap;

use super::types::{ChangeEvent, ChangeKind};

/// A path that keeps changing is still flushed after this many windows.
pub const MAX_DELAY_WINDOWS: u32 = 10;

struct Pending {
    kind: ChangeKind,
    first_seen: Instant,
    last_seen: Instant,
    detected_at: SystemTime,
}

/// Per-path debouncer: only handles timing and deduplication.
///
/// Each path flushes once it has been quiet for `window`. Within the window
/// the latest operation wins.
pub(super) struct Debouncer {
    window: Duration,
    pending: FxHashMap<PathBuf, Pending>,
}

impl Debouncer {
    pub(super) fn new(window: Duration) -> Self {
        Self {
            window,
            pending: FxHashMap::default(),
        }
    }

    pub(super) fn add(&mut self, path: PathBuf, kind: ChangeKind, now: Instant) {
        let entry = self.pending.entry(path).or_insert(Pending {
            kind,
            first_seen: now,
            last_seen: now,
            detected_at: SystemTime::now(),
        });
        entry.kind = kind;
        entry.last_seen = now;
    }

    pub(super) fn len(&self) -> usize {
        self.pending.len()
    }

    /// Remove and return every path whose window has elapsed, ordered by
    /// first detection.
    pub(super) fn take_ready(&mut self, now: Instant) -> Vec<ChangeEvent> {
        let max_delay = self.window * MAX_DELAY_WINDOWS;
        let ready: Vec<PathBuf> = self
            .pending
            .iter()
            .filter(|(_, p)| {
                now.duration_since(p.last_seen) >= self.window
                    || now.duration_since(p.first_seen) >= max_delay
            })
            .map(|(path, _)| path.clone())
            .collect();

        let mut events: Vec<(Instant, ChangeEvent)> = ready
            .into_iter()
            .filter_map(|path| {
                let p = self.pending.remove(&path)?;
                Some((
                    p.first_seen,
                    ChangeEvent {
                        path,
                        kind: p.kind,
                        detected_at: p.detected_at,
                    },
                ))
            })
            .collect();
        events.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.path.cmp(&b.1.path)));
        events.into_iter().map(|(_, e)| e).collect()
    }

    /// Time until the next path becomes ready.
    pub(super) fn next_deadline(&self, now: Instant) -> Option<Duration> {
        self.pending
            .values()
            .map(|p| (p.last_seen + self.window).saturating_duration_since(now))
            .min()
    }

    /// Drop entries that have sat unflushed longer than `stale_after`.
    pub(super) fn sweep(&mut self, now: Instant, stale_after: Duration) -> usize {
        let before = self.pending.len();
        self.pending
            .retain(|_, p| now.duration_since(p.first_seen) < stale_after);
        before - self.pending.len()
    }
}
