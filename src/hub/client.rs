//! Per-connection state and outbound ring buffer.
//!
//! ```text
//! Connecting --activate--> Active --begin_close--> Closing --finish_close--> Closed
//!      |                                              ^
//!      +------------------begin_close-----------------+
//! ```
//!
//! `begin_close` succeeds exactly once per client, so resources are released
//! exactly once no matter which path (disconnect, idle timeout, explicit
//! unregister, shutdown) gets there first.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime};

use parking_lot::{Condvar, Mutex};

use crate::core::Priority;

pub type ClientId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ClientState {
    Connecting = 0,
    Active = 1,
    Closing = 2,
    Closed = 3,
}

impl ClientState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Connecting,
            1 => Self::Active,
            2 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientInfo {
    pub id: ClientId,
    pub address: SocketAddr,
    pub origin: String,
    pub subscribed_at: SystemTime,
}

#[derive(Debug, Clone)]
pub struct Outbound {
    pub text: Arc<str>,
    pub priority: Priority,
}

/// What happened to one enqueued frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueue {
    Queued,
    /// A normal frame refused above the utilization threshold.
    Dropped,
    /// An urgent frame queued by evicting an older normal frame from a full
    /// ring.
    Displaced,
    /// An urgent frame queued by evicting the oldest urgent frame: the ring
    /// held nothing else.
    UrgentLost,
    /// The client is closing; nothing was queued.
    Closed,
}

pub enum Next {
    Frame(Outbound),
    Timeout,
    Closed,
}

pub struct ClientSlot {
    info: ClientInfo,
    state: AtomicU8,
    ring: Mutex<VecDeque<Outbound>>,
    ready: Condvar,
    capacity: usize,
    /// Normal frames are refused once this many are queued.
    soft_limit: usize,
    last_activity: Mutex<Instant>,
    dropped: AtomicU64,
    urgent_lost: AtomicU64,
}

impl ClientSlot {
    pub fn new(info: ClientInfo, capacity: usize, drop_threshold: f64) -> Self {
        let capacity = capacity.max(1);
        let soft_limit = ((capacity as f64 * drop_threshold).ceil() as usize).clamp(1, capacity);
        Self {
            info,
            state: AtomicU8::new(ClientState::Connecting as u8),
            ring: Mutex::new(VecDeque::with_capacity(capacity)),
            ready: Condvar::new(),
            capacity,
            soft_limit,
            last_activity: Mutex::new(Instant::now()),
            dropped: AtomicU64::new(0),
            urgent_lost: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> ClientId {
        self.info.id
    }

    pub fn info(&self) -> &ClientInfo {
        &self.info
    }

    pub fn state(&self) -> ClientState {
        ClientState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state(), ClientState::Connecting | ClientState::Active)
    }

    pub(super) fn activate(&self) -> bool {
        self.transition(ClientState::Connecting, ClientState::Active)
    }

    /// Move to `Closing`. Returns `true` for exactly one caller.
    pub(super) fn begin_close(&self) -> bool {
        self.transition(ClientState::Active, ClientState::Closing)
            || self.transition(ClientState::Connecting, ClientState::Closing)
    }

    /// Release the ring and wake the dispatch thread.
    pub(super) fn finish_close(&self) {
        self.state
            .store(ClientState::Closed as u8, Ordering::Release);
        let mut ring = self.ring.lock();
        ring.clear();
        self.ready.notify_all();
    }

    fn transition(&self, from: ClientState, to: ClientState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn enqueue(&self, frame: Outbound) -> Enqueue {
        if !self.is_open() {
            return Enqueue::Closed;
        }
        let mut ring = self.ring.lock();

        if frame.priority == Priority::Normal && ring.len() >= self.soft_limit {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return Enqueue::Dropped;
        }

        let outcome = if ring.len() >= self.capacity {
            // Full with an urgent frame: evict the oldest normal frame, or the
            // oldest frame when everything queued is urgent
            match ring.iter().position(|f| f.priority == Priority::Normal) {
                Some(victim) => {
                    ring.remove(victim);
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    Enqueue::Displaced
                }
                None => {
                    ring.pop_front();
                    self.urgent_lost.fetch_add(1, Ordering::Relaxed);
                    Enqueue::UrgentLost
                }
            }
        } else {
            Enqueue::Queued
        };

        ring.push_back(frame);
        self.ready.notify_one();
        outcome
    }

    /// Wait up to `timeout` for the next frame.
    pub fn next(&self, timeout: Duration) -> Next {
        let deadline = Instant::now() + timeout;
        let mut ring = self.ring.lock();
        loop {
            if self.state() == ClientState::Closed {
                return Next::Closed;
            }
            if let Some(frame) = ring.pop_front() {
                return Next::Frame(frame);
            }
            if self.ready.wait_until(&mut ring, deadline).timed_out() {
                return match ring.pop_front() {
                    Some(frame) => Next::Frame(frame),
                    None => Next::Timeout,
                };
            }
        }
    }

    pub fn queue_depth(&self) -> usize {
        self.ring.lock().len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Normal frames refused or evicted.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Urgent frames evicted by newer urgent frames.
    pub fn urgent_lost(&self) -> u64 {
        self.urgent_lost.load(Ordering::Relaxed)
    }

    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }
}
