//! Background release of closed clients.
//!
//! Closing a client (clearing its ring, waking its dispatch thread, giving
//! back its per-address reservation) runs on a small worker pool so that a
//! broadcast never blocks on it.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Sender};
use parking_lot::Mutex;

use super::client::ClientSlot;
use super::security::AdmissionGate;
use crate::debug;

pub(super) struct CleanupPool {
    sender: Mutex<Option<Sender<Arc<ClientSlot>>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    gate: Arc<AdmissionGate>,
}

impl CleanupPool {
    pub fn new(workers: usize, gate: Arc<AdmissionGate>) -> Self {
        let (sender, receiver) = channel::unbounded::<Arc<ClientSlot>>();
        let handles = (0..workers.max(1))
            .filter_map(|i| {
                let receiver = receiver.clone();
                let gate = Arc::clone(&gate);
                thread::Builder::new()
                    .name(format!("kiln-cleanup-{i}"))
                    .spawn(move || {
                        for slot in receiver {
                            release(&slot, &gate);
                        }
                    })
                    .ok()
            })
            .collect();

        Self {
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(handles),
            gate,
        }
    }

    /// Queue `slot` for release. Runs inline once the pool is shut down.
    pub fn submit(&self, slot: Arc<ClientSlot>) {
        let slot = match self.sender.lock().as_ref() {
            Some(sender) => match sender.send(slot) {
                Ok(()) => return,
                Err(e) => e.into_inner(),
            },
            None => slot,
        };
        release(&slot, &self.gate);
    }

    /// Finish queued releases and join the workers. Idempotent.
    pub fn shutdown(&self) {
        drop(self.sender.lock().take());
        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            let _ = worker.join();
        }
    }
}

fn release(slot: &ClientSlot, gate: &AdmissionGate) {
    slot.finish_close();
    gate.release(slot.info().address.ip());
    debug!("hub"; "client {} released", slot.id());
}
