//! The serve loop: watcher, WebSocket server and three blocking loops.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use crossbeam::channel::RecvTimeoutError;
use rustc_hash::FxHashSet;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::Engine;
use crate::hub::{HubMessage, serve};
use crate::registry::{RegistryEvent, Subscription};
use crate::watch::{WatchHandle, WatchOptions, watch};
use crate::{debug, log};

/// Poll interval of every loop; bounds shutdown latency.
const TICK: Duration = Duration::from_millis(100);
/// Most change events handled in one rescan.
const WATCH_BATCH: usize = 256;
/// Loops get this long to notice cancellation before shutdown proceeds.
const JOIN_TIMEOUT: Duration = Duration::from_secs(2);

impl Engine {
    /// Run until `shutdown` is cancelled, then stop everything and persist
    /// the caches.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        // Started before the initial scan so edits made during it are seen
        let watcher = Arc::new(
            watch(&self.root, WatchOptions::from_config(&self.config))
                .context("cannot start file watcher")?,
        );

        // The hub hears initial build results too
        let hub_events = self.registry.subscribe();
        self.initial_scan();
        let build_events = self.registry.subscribe();

        let server = serve(Arc::clone(&self.hub))?;
        let _ = self.ws_address.set(server.address());
        log!("serve"; "ready, waiting for changes (ws port {})", server.port());

        let loops: Vec<JoinHandle<()>> = vec![
            spawn_loop(&self, &shutdown, {
                let watcher = Arc::clone(&watcher);
                move |engine, token| watch_loop(&engine, &watcher, &token)
            }),
            spawn_loop(&self, &shutdown, move |engine, token| {
                build_loop(&engine, build_events, &token)
            }),
            spawn_loop(&self, &shutdown, move |engine, token| {
                hub_loop(&engine, hub_events, &token)
            }),
        ];

        shutdown.cancelled().await;
        debug!("serve"; "shutdown signal received");

        watcher.stop();
        server.stop();
        for handle in loops {
            if tokio::time::timeout(JOIN_TIMEOUT, handle).await.is_err() {
                log!("serve"; "a loop did not stop in time");
            }
        }
        self.shutdown();
        Ok(())
    }
}

fn spawn_loop<F>(engine: &Arc<Engine>, token: &CancellationToken, body: F) -> JoinHandle<()>
where
    F: FnOnce(Arc<Engine>, CancellationToken) + Send + 'static,
{
    let engine = Arc::clone(engine);
    let token = token.clone();
    tokio::task::spawn_blocking(move || body(engine, token))
}

/// Debounced change batches -> incremental rescans.
fn watch_loop(engine: &Engine, watcher: &WatchHandle, token: &CancellationToken) {
    let mut dropped = 0;
    while !token.is_cancelled() {
        let batch = watcher.recv_batch(WATCH_BATCH, TICK);
        if batch.is_empty() {
            if watcher.is_stopped() {
                break;
            }
            continue;
        }

        if watcher.dropped() > dropped {
            dropped = watcher.dropped();
            log!("watch"; "{} events lost to a full queue, rescanning everything", dropped);
            engine.scan();
            continue;
        }

        let mut seen = FxHashSet::default();
        let paths: Vec<PathBuf> = batch
            .into_iter()
            .filter(|event| seen.insert(event.path.clone()))
            .map(|event| event.path)
            .collect();
        debug!("watch"; "{} changed path(s)", paths.len());
        engine.rescan(&paths);
    }
}

/// Registry changes -> build submissions, with deferred retries.
fn build_loop(engine: &Engine, mut events: Subscription, token: &CancellationToken) {
    while !token.is_cancelled() {
        match events.recv_timeout(TICK) {
            Ok(RegistryEvent::Added(component))
            | Ok(RegistryEvent::Updated {
                current: component, ..
            }) => engine.dispatch(&component),
            Ok(RegistryEvent::Removed(component)) => {
                engine.pipeline.breaker().forget(&component.name);
                engine
                    .pipeline
                    .cache()
                    .invalidate(&component.path, &component.name);
            }
            Ok(RegistryEvent::BuildFinished(_) | RegistryEvent::Cleared) => {}
            Err(RecvTimeoutError::Timeout) if !events.is_closed() => {}
            Err(_) => {
                log!("build"; "fell behind registry events, resubscribing");
                events = engine.registry.subscribe();
                // Unchanged components come back from the artifact cache
                for component in engine.registry.get_all() {
                    engine.dispatch(&component);
                }
            }
        }
        if !engine.deferred.lock().is_empty() {
            engine.retry_deferred();
        }
    }
}

/// Registry changes -> browser messages.
fn hub_loop(engine: &Engine, mut events: Subscription, token: &CancellationToken) {
    while !token.is_cancelled() {
        match events.recv_timeout(TICK) {
            Ok(event) => {
                if let Some(message) = HubMessage::from_event(&event) {
                    engine.hub.broadcast(&message);
                }
            }
            Err(RecvTimeoutError::Timeout) if !events.is_closed() => {}
            Err(_) => {
                log!("hub"; "fell behind registry events, resubscribing");
                events = engine.registry.subscribe();
                engine
                    .hub
                    .broadcast(&HubMessage::reload("missed component updates"));
            }
        }
    }
}
