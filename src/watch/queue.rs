//! Bounded change-event queue.
//!
//! When full, the oldest event is dropped to make room and the drop is
//! counted. Consumers block on a condvar until events arrive, the queue is
//! closed, or their timeout elapses.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crossbeam::queue::ArrayQueue;
use parking_lot::{Condvar, Mutex};

use super::types::ChangeEvent;

pub struct EventQueue {
    events: ArrayQueue<ChangeEvent>,
    lock: Mutex<()>,
    ready: Condvar,
    dropped: AtomicU64,
    closed: AtomicBool,
}

impl EventQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            events: ArrayQueue::new(capacity.max(1)),
            lock: Mutex::new(()),
            ready: Condvar::new(),
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Push an event. Returns `true` when an older event was dropped.
    pub fn push(&self, event: ChangeEvent) -> bool {
        let displaced = self.events.force_push(event).is_some();
        if displaced {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        // Lock before notifying so a consumer between its check and its wait
        // cannot miss the wake-up
        let _guard = self.lock.lock();
        self.ready.notify_one();
        displaced
    }

    /// Take up to `max` events, waiting at most `timeout` for the first one.
    pub fn pop_batch(&self, max: usize, timeout: Duration) -> Vec<ChangeEvent> {
        let deadline = Instant::now() + timeout;
        let mut guard = self.lock.lock();
        while self.events.is_empty() && !self.is_closed() {
            if self.ready.wait_until(&mut guard, deadline).timed_out() {
                break;
            }
        }
        drop(guard);

        let mut batch = Vec::new();
        while batch.len() < max {
            match self.events.pop() {
                Some(event) => batch.push(event),
                None => break,
            }
        }
        batch
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let _guard = self.lock.lock();
        self.ready.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.events.capacity()
    }

    /// Events dropped because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watch::types::ChangeKind;
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::thread;
    use std::time::SystemTime;

    fn event(name: &str) -> ChangeEvent {
        ChangeEvent {
            path: PathBuf::from(name),
            kind: ChangeKind::Modified,
            detected_at: SystemTime::now(),
        }
    }

    #[test]
    fn test_overflow_drops_oldest() {
        let queue = EventQueue::new(3);
        for name in ["a", "b", "c"] {
            assert!(!queue.push(event(name)));
        }
        assert!(queue.push(event("d")));
        assert!(queue.push(event("e")));
        assert_eq!(queue.dropped(), 2);

        let batch = queue.pop_batch(10, Duration::ZERO);
        let names: Vec<_> = batch.iter().map(|e| e.path.to_str().unwrap()).collect();
        assert_eq!(names, ["c", "d", "e"]);
    }

    #[test]
    fn test_pop_times_out_when_empty() {
        let queue = EventQueue::new(4);
        let start = Instant::now();
        assert!(queue.pop_batch(4, Duration::from_millis(30)).is_empty());
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_pop_wakes_on_push() {
        let queue = Arc::new(EventQueue::new(4));
        let producer = Arc::clone(&queue);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            producer.push(event("a"));
        });
        let batch = queue.pop_batch(4, Duration::from_secs(5));
        assert_eq!(batch.len(), 1);
        handle.join().unwrap();
    }

    #[test]
    fn test_close_wakes_consumer() {
        let queue = Arc::new(EventQueue::new(4));
        let closer = Arc::clone(&queue);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            closer.close();
        });
        let start = Instant::now();
        assert!(queue.pop_batch(4, Duration::from_secs(5)).is_empty());
        assert!(start.elapsed() < Duration::from_secs(5));
        handle.join().unwrap();
    }

    #[test]
    fn test_batch_respects_max() {
        let queue = EventQueue::new(8);
        for name in ["a", "b", "c"] {
            queue.push(event(name));
        }
        assert_eq!(queue.pop_batch(2, Duration::ZERO).len(), 2);
        assert_eq!(queue.len(), 1);
    }
}
