//! Broadcast hub: fan-out of build events to browser clients.
//!
//! ```text
//! RegistryEvent --> HubMessage --> broadcast --> ClientSlot ring --> dispatch thread --> WebSocket
//!                                     |              (per client)
//!                                     +-- failure snapshot (replayed to new clients)
//! ```
//!
//! `broadcast` never blocks on a slow client: each client owns a fixed ring
//! and a dispatch thread, and a full ring sheds normal frames first.

mod cleanup;
mod client;
mod message;
mod security;
mod server;

pub use client::{ClientId, ClientInfo, ClientSlot, ClientState, Enqueue, Next, Outbound};
pub use message::HubMessage;
pub use security::{AdmissionError, AdmissionGate, AdmissionRequest, OriginPolicy};
pub use server::{HubServer, serve};

use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;

use crate::config::ServeSection;
use crate::core::Priority;
use crate::utils::plural_s;
use crate::{debug, log};
use cleanup::CleanupPool;

#[derive(Debug, Clone)]
pub struct HubOptions {
    pub interface: IpAddr,
    pub port: u16,
    pub allowed_origins: Vec<String>,
    pub auth_token: Option<String>,
    pub max_connections_per_address: usize,
    pub idle_timeout: Duration,
    pub ping_interval: Duration,
    pub ring_capacity: usize,
    pub drop_threshold: f64,
    pub max_message_size: usize,
    pub cleanup_workers: usize,
}

impl HubOptions {
    pub fn from_config(serve: &ServeSection) -> Self {
        Self {
            interface: serve.interface,
            port: serve.port,
            allowed_origins: serve.allowed_origins.clone(),
            auth_token: serve.auth_token.clone(),
            max_connections_per_address: serve.max_connections_per_address,
            idle_timeout: Duration::from_millis(serve.idle_timeout_ms),
            ping_interval: Duration::from_millis(serve.ping_interval_ms.max(1)),
            ring_capacity: serve.ring_capacity,
            drop_threshold: serve.drop_threshold,
            max_message_size: serve.max_message_size,
            cleanup_workers: serve.cleanup_workers,
        }
    }
}

impl Default for HubOptions {
    fn default() -> Self {
        Self::from_config(&ServeSection::default())
    }
}

/// Outcome of one broadcast.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastReport {
    pub recipients: usize,
    /// Queued, including urgent frames that displaced older ones.
    pub delivered: usize,
    pub dropped: usize,
    pub displaced: usize,
    /// Queued by evicting an older urgent frame.
    pub urgent_lost: usize,
    pub skipped_closed: usize,
    /// The frame exceeded the message size cap and went nowhere.
    pub oversized: bool,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HubStats {
    pub clients: usize,
    pub broadcasts: u64,
    pub delivered: u64,
    pub dropped: u64,
    pub displaced: u64,
    pub urgent_lost: u64,
    pub oversized: u64,
}

#[derive(Default)]
struct Counters {
    broadcasts: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
    displaced: AtomicU64,
    urgent_lost: AtomicU64,
    oversized: AtomicU64,
}

pub struct BroadcastHub {
    /// Active clients only. A slot enters after its handshake and leaves
    /// before it is released, so broadcast never sees a half-open client.
    clients: RwLock<FxHashMap<ClientId, Arc<ClientSlot>>>,
    gate: Arc<AdmissionGate>,
    cleanup: CleanupPool,
    /// Latest failing build frame per component.
    failures: Mutex<BTreeMap<String, Arc<str>>>,
    next_id: AtomicU64,
    shut_down: AtomicBool,
    counters: Counters,
    options: HubOptions,
}

impl BroadcastHub {
    pub fn new(options: HubOptions) -> Self {
        let gate = Arc::new(AdmissionGate::new(
            OriginPolicy::new(&options.allowed_origins),
            options.auth_token.clone(),
            options.max_connections_per_address,
        ));
        Self {
            clients: RwLock::new(FxHashMap::default()),
            cleanup: CleanupPool::new(options.cleanup_workers, Arc::clone(&gate)),
            gate,
            failures: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
            shut_down: AtomicBool::new(false),
            counters: Counters::default(),
            options,
        }
    }

    pub fn options(&self) -> &HubOptions {
        &self.options
    }

    pub fn gate(&self) -> &AdmissionGate {
        &self.gate
    }

    // ------------------------------------------------------------------
    // client lifecycle
    // ------------------------------------------------------------------

    /// Admit a peer during its handshake. The returned slot is `Connecting`
    /// and holds a per-address reservation until it is closed.
    pub fn register(
        &self,
        address: SocketAddr,
        origin: Option<&str>,
        token: Option<&str>,
    ) -> Result<Arc<ClientSlot>, AdmissionError> {
        if self.is_shut_down() {
            return Err(AdmissionError::ShuttingDown);
        }
        let origin = self.gate.admit(&AdmissionRequest {
            address: address.ip(),
            origin,
            token,
        })?;

        let info = ClientInfo {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            address,
            origin,
            subscribed_at: SystemTime::now(),
        };
        Ok(Arc::new(ClientSlot::new(
            info,
            self.options.ring_capacity,
            self.options.drop_threshold,
        )))
    }

    /// Make a registered slot visible to broadcasts and queue the
    /// `connected` frame plus every current failure.
    pub fn activate(&self, slot: &Arc<ClientSlot>) -> bool {
        if self.is_shut_down() || !slot.activate() {
            self.close(slot);
            return false;
        }

        self.push(slot, &HubMessage::connected());
        {
            // Holding the snapshot lock across the insert means a concurrent
            // failure is either replayed here or broadcast to this slot
            let failures = self.failures.lock();
            self.clients.write().insert(slot.id(), Arc::clone(slot));
            for frame in failures.values() {
                slot.enqueue(Outbound {
                    text: Arc::clone(frame),
                    priority: Priority::Urgent,
                });
            }
        }
        // shutdown may have drained the index between the check and insert
        if self.is_shut_down() {
            self.unregister(slot.id());
            return false;
        }

        let info = slot.info();
        log!("hub"; "client {} connected from {} ({})", info.id, info.address, info.origin);
        true
    }

    /// Remove a client from the index and release it.
    pub fn unregister(&self, id: ClientId) -> bool {
        let Some(slot) = self.clients.write().remove(&id) else {
            return false;
        };
        self.close(&slot);
        true
    }

    /// Start closing `slot` if nobody has yet. Release happens on the
    /// cleanup pool, exactly once.
    pub fn close(&self, slot: &Arc<ClientSlot>) {
        if slot.state() == ClientState::Active {
            self.clients.write().remove(&slot.id());
        }
        if slot.begin_close() {
            debug!("hub"; "client {} closing", slot.id());
            self.cleanup.submit(Arc::clone(slot));
        }
    }

    /// Close clients silent for longer than the idle timeout.
    pub fn sweep_idle(&self) -> Vec<ClientId> {
        let idle: Vec<_> = self
            .clients
            .read()
            .values()
            .filter(|slot| slot.idle_for() > self.options.idle_timeout)
            .map(|slot| slot.id())
            .collect();
        for id in &idle {
            self.unregister(*id);
        }
        if !idle.is_empty() {
            log!("hub"; "closed {} idle client{}", idle.len(), plural_s(idle.len()));
        }
        idle
    }

    // ------------------------------------------------------------------
    // fan-out
    // ------------------------------------------------------------------

    pub fn broadcast(&self, message: &HubMessage) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        self.counters.broadcasts.fetch_add(1, Ordering::Relaxed);

        let Some(json) = message.to_json_within(self.options.max_message_size) else {
            self.counters.oversized.fetch_add(1, Ordering::Relaxed);
            log!("hub"; "message exceeds {} bytes, not sent", self.options.max_message_size);
            report.oversized = true;
            return report;
        };
        let text: Arc<str> = Arc::from(json);
        self.remember(message, &text);

        // Enqueue outside the index lock
        let recipients: Vec<_> = self.clients.read().values().cloned().collect();
        report.recipients = recipients.len();
        for slot in &recipients {
            let outcome = slot.enqueue(Outbound {
                text: Arc::clone(&text),
                priority: message.priority(),
            });
            match outcome {
                Enqueue::Queued => report.delivered += 1,
                Enqueue::Displaced => {
                    report.delivered += 1;
                    report.displaced += 1;
                }
                Enqueue::UrgentLost => {
                    report.delivered += 1;
                    report.urgent_lost += 1;
                }
                Enqueue::Dropped => report.dropped += 1,
                Enqueue::Closed => report.skipped_closed += 1,
            }
        }

        self.counters
            .delivered
            .fetch_add(report.delivered as u64, Ordering::Relaxed);
        self.counters
            .dropped
            .fetch_add(report.dropped as u64, Ordering::Relaxed);
        self.counters
            .displaced
            .fetch_add(report.displaced as u64, Ordering::Relaxed);
        self.counters
            .urgent_lost
            .fetch_add(report.urgent_lost as u64, Ordering::Relaxed);

        if report.urgent_lost > 0 {
            log!(
                "hub";
                "{} client{} lost an urgent frame: ring full of undelivered failures",
                report.urgent_lost,
                plural_s(report.urgent_lost)
            );
        }

        if report.dropped > 0 {
            debug!(
                "hub";
                "{} frame{} dropped under backpressure",
                report.dropped,
                plural_s(report.dropped)
            );
        }
        report
    }

    /// Keep the failure snapshot in step with what was broadcast.
    fn remember(&self, message: &HubMessage, text: &Arc<str>) {
        let mut failures = self.failures.lock();
        match message {
            HubMessage::Build {
                component,
                success: false,
                ..
            } => {
                failures.insert(component.clone(), Arc::clone(text));
            }
            HubMessage::Build { component, .. } | HubMessage::Removed { component } => {
                failures.remove(component);
            }
            HubMessage::Reload { .. } => failures.clear(),
            HubMessage::Connected { .. } | HubMessage::Ping { .. } => {}
        }
    }

    fn push(&self, slot: &ClientSlot, message: &HubMessage) -> Enqueue {
        match message.to_json_within(self.options.max_message_size) {
            Some(json) => slot.enqueue(Outbound {
                text: Arc::from(json),
                priority: message.priority(),
            }),
            None => Enqueue::Dropped,
        }
    }

    // ------------------------------------------------------------------
    // inspection and shutdown
    // ------------------------------------------------------------------

    pub fn client_count(&self) -> usize {
        self.clients.read().len()
    }

    /// Active clients, oldest first.
    pub fn clients(&self) -> Vec<ClientInfo> {
        let mut infos: Vec<_> = self
            .clients
            .read()
            .values()
            .map(|slot| slot.info().clone())
            .collect();
        infos.sort_by_key(|info| info.id);
        infos
    }

    /// Components whose latest broadcast build failed.
    pub fn failing_components(&self) -> Vec<String> {
        self.failures.lock().keys().cloned().collect()
    }

    pub fn stats(&self) -> HubStats {
        HubStats {
            clients: self.client_count(),
            broadcasts: self.counters.broadcasts.load(Ordering::Relaxed),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            displaced: self.counters.displaced.load(Ordering::Relaxed),
            urgent_lost: self.counters.urgent_lost.load(Ordering::Relaxed),
            oversized: self.counters.oversized.load(Ordering::Relaxed),
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Close every client and join the cleanup workers. Idempotent.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let slots: Vec<_> = self.clients.write().drain().map(|(_, slot)| slot).collect();
        for slot in &slots {
            self.close(slot);
        }
        self.cleanup.shutdown();
        debug!("hub"; "shut down ({} client{} closed)", slots.len(), plural_s(slots.len()));
    }
}

impl Drop for BroadcastHub {
    fn drop(&mut self) {
        self.shutdown();
    }
}
