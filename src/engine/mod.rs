//! Engine coordinator.
//!
//! Owns the registry, both caches, the scanner, the build pipeline and the
//! hub, and wires them into the watch -> scan -> build -> broadcast loop.
//!
//! ```text
//! WatchHandle --batch--> Scanner.scan_paths --> ComponentRegistry
//!                                                  |  subscription (builds)
//!                                                  +--> BuildPipeline --record_build--+
//!                                                  |  subscription (hub)              |
//!                                                  +--> BroadcastHub <----------------+
//! ```
//!
//! It holds no business logic of its own: every decision lives in the
//! subsystem that owns the data.

mod runtime;

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::Mutex;

use crate::build::{
    Artifact, ArtifactCache, BuildPipeline, BuildResult, BuildStatus, BuildTicket, Compiler,
    LocationParser, PipelineOptions, ProcessCompiler, SubmitError,
};
use crate::cache::{ContentCache, persist_cache, restore_cache};
use crate::component::{Component, ParseStatus};
use crate::config::EngineConfig;
use crate::core::{CancelScope, Diagnostic, ProjectRoot};
use crate::hub::{BroadcastHub, HubOptions};
use crate::logger::{status_error, status_success, status_warning};
use crate::registry::{BuildSummary, ComponentRegistry, RegistryOptions};
use crate::scanner::{MetadataCache, ScanOptions, ScanReport, Scanner};
use crate::utils::plural::plural_count;
use crate::{debug, log};

const METADATA_DIR: &str = "metadata";
const ARTIFACTS_DIR: &str = "artifacts";

/// Outcome of a one-shot build of every component.
#[derive(Debug, Default)]
pub struct BuildRun {
    pub scan: ScanReport,
    pub results: Vec<BuildSummary>,
}

impl BuildRun {
    pub fn failed(&self) -> impl Iterator<Item = &BuildSummary> {
        self.results.iter().filter(|r| !r.success)
    }

    pub fn is_success(&self) -> bool {
        self.failed().next().is_none() && self.scan.errors.is_empty()
    }
}

pub struct Engine {
    config: Arc<EngineConfig>,
    root: ProjectRoot,
    registry: Arc<ComponentRegistry>,
    metadata: Arc<MetadataCache>,
    artifacts: Arc<ContentCache<Artifact>>,
    scanner: Arc<Scanner>,
    pipeline: Arc<BuildPipeline>,
    hub: Arc<BroadcastHub>,
    /// Components whose build was refused by a full queue, retried later.
    deferred: Mutex<BTreeSet<String>>,
    scope: CancelScope,
    ws_address: OnceLock<SocketAddr>,
    shut_down: AtomicBool,
}

impl Engine {
    /// Build every subsystem from `config`, resolving the compiler on PATH.
    pub fn new(config: EngineConfig) -> Result<Self> {
        let build = &config.build;
        let compiler = ProcessCompiler::new(&build.compiler, build.args.clone(), &config.root)
            .with_context(|| format!("cannot use compiler `{}`", build.compiler))?;
        Self::with_compiler(config, Arc::new(compiler))
    }

    pub fn with_compiler(config: EngineConfig, compiler: Arc<dyn Compiler>) -> Result<Self> {
        let root = ProjectRoot::new(&config.root)?;
        let ttl = Duration::from_millis(config.cache.ttl_ms);

        let metadata = Arc::new(MetadataCache::new(config.cache.capacity, ttl));
        let artifacts = Arc::new(ContentCache::<Artifact>::new(config.cache.capacity, ttl));
        if config.cache.persist {
            restore(&metadata, &config.cache.dir.join(METADATA_DIR));
            restore(&artifacts, &config.cache.dir.join(ARTIFACTS_DIR));
        }

        let registry = Arc::new(ComponentRegistry::new(RegistryOptions::from(&config.registry)));
        let scanner = Scanner::new(
            root.clone(),
            ScanOptions::from_config(&config),
            Arc::clone(&registry),
            Arc::clone(&metadata),
        )?;
        let pipeline = BuildPipeline::new(
            PipelineOptions::from_config(&config.build),
            compiler,
            Arc::new(LocationParser),
            Arc::new(ArtifactCache::new(Arc::clone(&artifacts))),
        );
        let hub = BroadcastHub::new(HubOptions::from_config(&config.serve));

        Ok(Self {
            config: Arc::new(config),
            root,
            registry,
            metadata,
            artifacts,
            scanner: Arc::new(scanner),
            pipeline: Arc::new(pipeline),
            hub: Arc::new(hub),
            deferred: Mutex::new(BTreeSet::new()),
            scope: CancelScope::new(),
            ws_address: OnceLock::new(),
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn root(&self) -> &Path {
        self.root.path()
    }

    pub fn registry(&self) -> &Arc<ComponentRegistry> {
        &self.registry
    }

    pub fn scanner(&self) -> &Arc<Scanner> {
        &self.scanner
    }

    pub fn pipeline(&self) -> &Arc<BuildPipeline> {
        &self.pipeline
    }

    pub fn hub(&self) -> &Arc<BroadcastHub> {
        &self.hub
    }

    /// Where the WebSocket server listens, once [`Engine::run`] bound it.
    pub fn ws_address(&self) -> Option<SocketAddr> {
        self.ws_address.get().copied()
    }

    // ------------------------------------------------------------------
    // scan and build
    // ------------------------------------------------------------------

    /// Full scan without building.
    pub fn scan(&self) -> ScanReport {
        let report = self.scanner.scan(&self.scope);
        log_scan(&report);
        report
    }

    /// First full scan; every new or changed component is queued for a
    /// build whose result lands in the registry.
    pub fn initial_scan(&self) -> ScanReport {
        let report = self.scan();
        for name in report.changed() {
            if let Some(component) = self.registry.get(name) {
                self.dispatch(&component);
            }
        }
        report
    }

    /// Rescan the given changed paths. Builds follow from the registry
    /// events this produces.
    pub fn rescan(&self, paths: &[PathBuf]) -> ScanReport {
        let report = self.scanner.scan_paths(paths, &self.scope);
        if report.has_changes() || !report.errors.is_empty() {
            log_scan(&report);
        }
        report
    }

    /// Queue a build for `component`, or record its parse error as a failed
    /// build. A full queue defers it to the next retry.
    pub fn dispatch(&self, component: &Arc<Component>) {
        if let ParseStatus::Error(error) = &component.status {
            self.record(BuildSummary {
                component: component.name.clone(),
                success: false,
                errors: vec![
                    Diagnostic::error(error.message.clone()).at(
                        &component.path,
                        error.line,
                        Some(error.column),
                    ),
                ],
                duration: Duration::ZERO,
                cache_hit: false,
                circuit_open: false,
            });
            return;
        }

        let registry = Arc::clone(&self.registry);
        let submitted = self
            .pipeline
            .submit_with(component.as_ref(), move |result| report_build(&registry, &result));
        match submitted {
            Ok(task) => {
                self.deferred.lock().remove(&task.component);
            }
            Err(SubmitError::QueueFull { component, .. }) => {
                debug!("build"; "queue full, deferring {}", component);
                self.deferred.lock().insert(component);
            }
            Err(SubmitError::ShutDown) => {}
        }
    }

    /// Retry builds refused by a full queue. Returns how many were queued.
    pub fn retry_deferred(&self) -> usize {
        let pending = std::mem::take(&mut *self.deferred.lock());
        let mut queued = 0;
        for name in pending {
            // Removed while waiting
            let Some(component) = self.registry.get(&name) else {
                continue;
            };
            self.dispatch(&component);
            if !self.deferred.lock().contains(&name) {
                queued += 1;
            }
        }
        queued
    }

    pub fn deferred(&self) -> Vec<String> {
        self.deferred.lock().iter().cloned().collect()
    }

    /// Scan, then build every known component once and wait for all of them.
    pub fn build_all(&self) -> BuildRun {
        let scan = self.scanner.scan(&self.scope);
        log_scan(&scan);

        let mut results = Vec::new();
        let mut pending: Vec<BuildTicket> = Vec::new();
        for component in self.registry.get_all() {
            if let ParseStatus::Error(_) = component.status {
                self.dispatch(&component);
                if let Some(summary) = self.registry.last_build(&component.name) {
                    results.push(summary.as_ref().clone());
                }
                continue;
            }
            loop {
                match self.pipeline.submit(component.as_ref()) {
                    Ok(ticket) => {
                        pending.push(ticket);
                        break;
                    }
                    // Make room by waiting on the oldest outstanding build
                    Err(SubmitError::QueueFull { .. }) if !pending.is_empty() => {
                        let ticket = pending.remove(0);
                        self.collect(ticket.wait(), &mut results);
                    }
                    Err(SubmitError::QueueFull { .. }) => std::thread::sleep(Duration::from_millis(10)),
                    Err(SubmitError::ShutDown) => return BuildRun { scan, results },
                }
            }
        }
        for ticket in pending {
            self.collect(ticket.wait(), &mut results);
        }

        results.sort_by(|a, b| a.component.cmp(&b.component));
        BuildRun { scan, results }
    }

    fn collect(&self, result: BuildResult, results: &mut Vec<BuildSummary>) {
        if result.status == BuildStatus::Cancelled {
            return;
        }
        let summary = result.summary();
        self.registry.record_build(summary.clone());
        results.push(summary);
    }

    fn record(&self, summary: BuildSummary) {
        if !summary.success {
            status_error(&format!("failed: {}", summary.component), &describe(&summary.errors));
        }
        self.registry.record_build(summary);
    }

    // ------------------------------------------------------------------
    // shutdown
    // ------------------------------------------------------------------

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Stop the pipeline and the hub, then persist the caches. Idempotent.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.scope.cancel();
        self.pipeline.shutdown();
        self.hub.shutdown();
        self.persist_caches();
        debug!("serve"; "engine stopped");
    }

    pub fn persist_caches(&self) {
        if !self.config.cache.persist {
            return;
        }
        let dir = &self.config.cache.dir;
        self.metadata.purge_expired();
        self.artifacts.purge_expired();
        for (cache, result) in [
            ("metadata", persist_cache(&self.metadata, &dir.join(METADATA_DIR))),
            ("artifact", persist_cache(&self.artifacts, &dir.join(ARTIFACTS_DIR))),
        ] {
            match result {
                Ok(count) => debug!("cache"; "persisted {} {} entries", count, cache),
                Err(e) => log!("cache"; "failed to persist {} cache: {}", cache, e),
            }
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn restore<V>(cache: &ContentCache<V>, dir: &Path)
where
    V: Clone + serde::de::DeserializeOwned,
{
    match restore_cache(cache, dir) {
        Ok(0) => {}
        Ok(count) => debug!("cache"; "restored {} entries from {}", count, dir.display()),
        Err(e) => log!("cache"; "cannot restore {}: {}", dir.display(), e),
    }
}

/// Store a finished build and show it on the status line. Cancelled
/// builds are dropped: a newer build or shutdown superseded them.
fn report_build(registry: &ComponentRegistry, result: &BuildResult) {
    let name = &result.task.component;
    match &result.status {
        BuildStatus::Cancelled => return,
        BuildStatus::Succeeded if result.cache_hit => {
            debug!("build"; "{} unchanged", name);
        }
        BuildStatus::Succeeded => {
            status_success(&format!("built {} in {}ms", name, result.duration.as_millis()));
        }
        BuildStatus::Failed => {
            status_error(&format!("failed: {name}"), &describe(&result.errors));
        }
        BuildStatus::CircuitOpen { retry_in } => {
            status_warning(&format!(
                "{} keeps failing; builds paused for {}s",
                name,
                retry_in.as_secs().max(1)
            ));
        }
    }
    registry.record_build(result.summary());
}

fn describe(errors: &[Diagnostic]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("\n")
}

fn log_scan(report: &ScanReport) {
    let mut parts = Vec::new();
    if !report.added.is_empty() {
        parts.push(format!("{} added", report.added.len()));
    }
    if !report.updated.is_empty() {
        parts.push(format!("{} updated", report.updated.len()));
    }
    if !report.removed.is_empty() {
        parts.push(format!("{} removed", report.removed.len()));
    }
    if parts.is_empty() {
        parts.push("no changes".into());
    }
    log!(
        "scan";
        "{}: {} ({} cached)",
        plural_count(report.files, "file"),
        parts.join(", "),
        report.cache_hits
    );
    for error in &report.errors {
        log!("error"; "{}", error);
    }
    if report.cancelled {
        log!("scan"; "cancelled before completion");
    }
}
