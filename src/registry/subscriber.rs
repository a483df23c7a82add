//! Per-subscriber delivery with timeout-based health.
//!
//! The publisher only ever offers events without blocking. When a
//! subscriber's buffer is full, the event moves to that subscriber's
//! overflow queue and a forwarding thread performs the timed send, so a
//! stalled reader never holds up the registry locks.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use crossbeam::channel::{
    Receiver, RecvTimeoutError, SendTimeoutError, Sender, TryRecvError, TrySendError,
};

use super::RegistryEvent;
use crate::log;

/// What happened when an event was offered to one subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Delivery {
    Sent,
    /// Buffer full; queued for the forwarding thread.
    Deferred,
    /// Too many strikes, or the receiver is gone.
    Closed,
}

#[derive(Debug)]
struct Health {
    healthy: AtomicBool,
    closed: AtomicBool,
    strikes: AtomicU32,
    /// Events handed to the forwarder and not yet attempted.
    backlog: AtomicUsize,
}

pub(super) struct Subscriber {
    pub id: u64,
    sender: Sender<RegistryEvent>,
    overflow: Sender<RegistryEvent>,
    health: Arc<Health>,
}

impl Subscriber {
    pub fn new(id: u64, buffer: usize, timeout: Duration, max_strikes: u32) -> (Self, Subscription) {
        let (sender, receiver) = crossbeam::channel::bounded(buffer.max(1));
        let (overflow, pending) = crossbeam::channel::unbounded();
        let health = Arc::new(Health {
            healthy: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            strikes: AtomicU32::new(0),
            backlog: AtomicUsize::new(0),
        });

        let forwarder = Forwarder {
            id,
            sender: sender.clone(),
            health: Arc::clone(&health),
            timeout,
            max_strikes,
        };
        thread::spawn(move || forwarder.run(pending));

        let subscriber = Self {
            id,
            sender,
            overflow,
            health: Arc::clone(&health),
        };
        let subscription = Subscription {
            id,
            receiver,
            health,
        };
        (subscriber, subscription)
    }

    pub fn is_closed(&self) -> bool {
        self.health.closed.load(Ordering::Acquire)
    }

    /// Never blocks. Sends directly while nothing is queued ahead of
    /// `event`, otherwise appends it to the overflow queue.
    pub fn offer(&self, event: RegistryEvent) -> Delivery {
        if self.is_closed() {
            return Delivery::Closed;
        }

        let event = if self.health.backlog.load(Ordering::Acquire) == 0 {
            match self.sender.try_send(event) {
                Ok(()) => {
                    self.health.recovered();
                    return Delivery::Sent;
                }
                Err(TrySendError::Disconnected(_)) => return Delivery::Closed,
                Err(TrySendError::Full(event)) => event,
            }
        } else {
            event
        };

        self.health.backlog.fetch_add(1, Ordering::AcqRel);
        match self.overflow.send(event) {
            Ok(()) => Delivery::Deferred,
            Err(_) => Delivery::Closed,
        }
    }
}

impl Health {
    fn recovered(&self) {
        if self.strikes.swap(0, Ordering::AcqRel) > 0 {
            self.healthy.store(true, Ordering::Release);
        }
    }
}

/// Drains one subscriber's overflow queue with timed sends.
struct Forwarder {
    id: u64,
    sender: Sender<RegistryEvent>,
    health: Arc<Health>,
    timeout: Duration,
    max_strikes: u32,
}

impl Forwarder {
    /// Exits once the subscriber closes or the registry drops it.
    fn run(self, pending: Receiver<RegistryEvent>) {
        for event in pending.iter() {
            let outcome = self.sender.send_timeout(event, self.timeout);
            self.health.backlog.fetch_sub(1, Ordering::AcqRel);

            match outcome {
                Ok(()) => self.health.recovered(),
                Err(SendTimeoutError::Disconnected(_)) => {
                    self.health.closed.store(true, Ordering::Release);
                    return;
                }
                Err(SendTimeoutError::Timeout(_)) => {
                    let strikes = self.health.strikes.fetch_add(1, Ordering::AcqRel) + 1;
                    self.health.healthy.store(false, Ordering::Release);
                    if strikes >= self.max_strikes {
                        log!("registry"; "dropping unresponsive subscriber {}", self.id);
                        self.health.closed.store(true, Ordering::Release);
                        return;
                    }
                    log!("registry"; "subscriber {} is falling behind", self.id);
                }
            }
        }
    }
}

/// Receiving end of a registry subscription.
///
/// Events arrive in mutation order. A subscriber that stops draining is
/// first marked unhealthy and then dropped; once the registry prunes it the
/// receiver reports disconnection and the owner must re-subscribe.
pub struct Subscription {
    id: u64,
    receiver: Receiver<RegistryEvent>,
    health: Arc<Health>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_healthy(&self) -> bool {
        self.health.healthy.load(Ordering::Acquire)
    }

    /// The registry gave up on this subscription. Buffered events may still
    /// be readable, but nothing further will arrive.
    pub fn is_closed(&self) -> bool {
        self.health.closed.load(Ordering::Acquire)
    }

    pub fn recv(&self) -> Option<RegistryEvent> {
        self.receiver.recv().ok()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<RegistryEvent, RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    pub fn try_recv(&self) -> Result<RegistryEvent, TryRecvError> {
        self.receiver.try_recv()
    }

    /// Drain whatever is buffered right now.
    pub fn drain(&self) -> Vec<RegistryEvent> {
        self.receiver.try_iter().collect()
    }

    /// Underlying receiver, for `select!`.
    pub fn receiver(&self) -> &Receiver<RegistryEvent> {
        &self.receiver
    }
}
