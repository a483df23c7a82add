//! Build pipeline.
//!
//! A fixed pool of workers fed by a bounded queue. Each task goes through the
//! circuit breaker, then the two-tier artifact cache, and only on a full
//! miss through the external compiler.
//!
//! ```text
//! submit --try_send--> [bounded queue] --> worker 1..N
//!    |                                       |
//!    +-- QueueFull when saturated            +-- breaker -> cache -> compiler -> parser
//!                                            +-- reply (ticket or callback)
//! ```

mod breaker;
mod cache;
mod compiler;
mod diagnostics;
mod metrics;
mod task;

pub use breaker::{Admission, CircuitBreaker, CircuitState};
pub use cache::{Artifact, ArtifactCache, FileStamp, Lookup, RACY_WINDOW};
pub use compiler::{
    ArgumentPolicy, CompileOutput, CompileRequest, Compiler, CompilerError, ProcessCompiler,
};
pub use diagnostics::{ErrorParser, LocationParser, fallback_error};
pub use metrics::{BuildMetrics, MetricsSnapshot};
pub use task::{
    BuildResult, BuildStatus, BuildTask, BuildTicket, BuildableComponent, SubmitError,
};

use std::io;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{Receiver, Sender, TrySendError, bounded};
use parking_lot::Mutex;

use crate::config::BuildSection;
use crate::core::{CancelScope, Diagnostic, log_security};
use crate::debug;

/// Upper bound on build workers regardless of configuration.
pub const MAX_WORKERS: usize = 8;

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub workers: usize,
    pub queue_capacity: usize,
    pub timeout: Option<Duration>,
    pub breaker_threshold: u32,
    pub breaker_cooldown: Duration,
}

impl PipelineOptions {
    pub fn from_config(build: &BuildSection) -> Self {
        Self {
            workers: build.workers,
            queue_capacity: build.queue_capacity,
            timeout: (build.timeout_ms > 0).then(|| Duration::from_millis(build.timeout_ms)),
            breaker_threshold: build.breaker_threshold,
            breaker_cooldown: Duration::from_millis(build.breaker_cooldown_ms),
        }
    }
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self::from_config(&BuildSection::default())
    }
}

type Callback = Box<dyn FnOnce(BuildResult) + Send>;

enum Reply {
    Ticket(Sender<BuildResult>),
    Callback(Callback),
}

impl Reply {
    fn send(self, result: BuildResult) {
        match self {
            // The ticket may have been dropped; nobody is waiting then
            Self::Ticket(tx) => {
                let _ = tx.send(result);
            }
            Self::Callback(callback) => {
                if catch_unwind(AssertUnwindSafe(|| callback(result))).is_err() {
                    crate::log!("build"; "result callback panicked");
                }
            }
        }
    }
}

struct Job {
    task: BuildTask,
    reply: Reply,
}

struct Shared {
    compiler: Arc<dyn Compiler>,
    parser: Arc<dyn ErrorParser>,
    cache: Arc<ArtifactCache>,
    breaker: CircuitBreaker,
    metrics: BuildMetrics,
    scope: CancelScope,
    timeout: Option<Duration>,
    closed: AtomicBool,
}

/// Bounded worker pool that compiles components.
pub struct BuildPipeline {
    shared: Arc<Shared>,
    sender: Mutex<Option<Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    next_id: AtomicU64,
    capacity: usize,
    worker_count: usize,
}

impl BuildPipeline {
    pub fn new(
        options: PipelineOptions,
        compiler: Arc<dyn Compiler>,
        parser: Arc<dyn ErrorParser>,
        cache: Arc<ArtifactCache>,
    ) -> Self {
        let capacity = options.queue_capacity.max(1);
        let worker_count = options.workers.clamp(1, MAX_WORKERS);
        let (tx, rx) = bounded::<Job>(capacity);

        let shared = Arc::new(Shared {
            compiler,
            parser,
            cache,
            breaker: CircuitBreaker::new(options.breaker_threshold, options.breaker_cooldown),
            metrics: BuildMetrics::default(),
            scope: CancelScope::new(),
            timeout: options.timeout,
            closed: AtomicBool::new(false),
        });

        let workers = (0..worker_count)
            .map(|i| {
                let shared = Arc::clone(&shared);
                let rx = rx.clone();
                thread::Builder::new()
                    .name(format!("kiln-build-{i}"))
                    .spawn(move || shared.run_worker(rx))
            })
            .filter_map(|spawned| match spawned {
                Ok(handle) => Some(handle),
                Err(e) => {
                    crate::log!("build"; "failed to spawn worker: {}", e);
                    None
                }
            })
            .collect();

        Self {
            shared,
            sender: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
            next_id: AtomicU64::new(1),
            capacity,
            worker_count,
        }
    }

    /// Queue a build and get a ticket for its result.
    pub fn submit<C: BuildableComponent + ?Sized>(
        &self,
        component: &C,
    ) -> Result<BuildTicket, SubmitError> {
        let task = self.task_for(component);
        let (tx, rx) = bounded(1);
        self.enqueue(Job {
            task: task.clone(),
            reply: Reply::Ticket(tx),
        })?;
        Ok(BuildTicket { task, receiver: rx })
    }

    /// Queue a build whose result is handed to `callback` on a worker thread.
    pub fn submit_with<C, F>(&self, component: &C, callback: F) -> Result<BuildTask, SubmitError>
    where
        C: BuildableComponent + ?Sized,
        F: FnOnce(BuildResult) + Send + 'static,
    {
        let task = self.task_for(component);
        self.enqueue(Job {
            task: task.clone(),
            reply: Reply::Callback(Box::new(callback)),
        })?;
        Ok(task)
    }

    fn task_for<C: BuildableComponent + ?Sized>(&self, component: &C) -> BuildTask {
        BuildTask {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            component: component.name().to_string(),
            path: component.path().to_path_buf(),
            fingerprint: component.fingerprint(),
            enqueued_at: Instant::now(),
        }
    }

    fn enqueue(&self, job: Job) -> Result<(), SubmitError> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(SubmitError::ShutDown);
        }
        let sender = self.sender.lock();
        let Some(tx) = sender.as_ref() else {
            return Err(SubmitError::ShutDown);
        };

        match tx.try_send(job) {
            Ok(()) => {
                self.shared.metrics.record_submitted();
                Ok(())
            }
            Err(TrySendError::Full(job)) => {
                self.shared.metrics.record_rejected();
                Err(SubmitError::QueueFull {
                    component: job.task.component,
                    capacity: self.capacity,
                })
            }
            Err(TrySendError::Disconnected(_)) => Err(SubmitError::ShutDown),
        }
    }

    pub fn queue_len(&self) -> usize {
        self.sender.lock().as_ref().map_or(0, Sender::len)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    pub fn cache(&self) -> &Arc<ArtifactCache> {
        &self.shared.cache
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.shared.breaker
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Stop accepting tasks, cancel running compiles, resolve queued tasks
    /// as cancelled and join the workers. Safe to call more than once.
    pub fn shutdown(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.scope.cancel();
        // Dropping the only sender lets workers drain and exit
        self.sender.lock().take();

        let handles = std::mem::take(&mut *self.workers.lock());
        for handle in handles {
            if handle.join().is_err() {
                crate::log!("build"; "worker thread panicked during shutdown");
            }
        }
        debug!("build"; "pipeline shut down");
    }
}

impl Drop for BuildPipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Shared {
    fn run_worker(&self, rx: Receiver<Job>) {
        for job in rx.iter() {
            if self.closed.load(Ordering::Acquire) {
                job.reply.send(BuildResult::cancelled(job.task));
                continue;
            }

            let start = Instant::now();
            let task = job.task.clone();
            let result = catch_unwind(AssertUnwindSafe(|| self.build(&job.task, start)))
                .unwrap_or_else(|_| BuildResult {
                    task,
                    status: BuildStatus::Failed,
                    errors: vec![Diagnostic::error("build panicked")],
                    duration: start.elapsed(),
                    cache_hit: false,
                });

            self.metrics.record(&result);
            debug!(
                "build";
                "{} {:?} in {:?}{}",
                result.task.component,
                result.status,
                result.duration,
                if result.cache_hit { " (cached)" } else { "" }
            );
            job.reply.send(result);
        }
    }

    fn build(&self, task: &BuildTask, start: Instant) -> BuildResult {
        let finish = |status: BuildStatus, errors: Vec<Diagnostic>, cache_hit: bool| BuildResult {
            task: task.clone(),
            status,
            errors,
            duration: start.elapsed(),
            cache_hit,
        };
        let name = task.component.as_str();

        let admission = self.breaker.check(name, task.fingerprint);
        if let Admission::Rejected { retry_in } = admission {
            let message = format!(
                "build skipped after repeated failures; retrying in {}ms",
                retry_in.as_millis()
            );
            return finish(
                BuildStatus::CircuitOpen { retry_in },
                vec![Diagnostic::error(message).at(task.path.clone(), 1, None)],
                false,
            );
        }

        let stamp = match self.cache.lookup(&task.path, name) {
            Ok(Lookup::Fresh(output)) | Ok(Lookup::Verified(output)) => {
                self.breaker.record_success(name);
                let warnings = self.parser.parse(&output);
                return finish(BuildStatus::Succeeded, warnings, true);
            }
            Ok(Lookup::Miss(stamp)) => stamp,
            Err(e) => {
                if admission == Admission::Probe {
                    self.breaker.release_probe(name);
                }
                let message = if e.kind() == io::ErrorKind::NotFound {
                    "source file no longer exists".to_string()
                } else {
                    format!("cannot read source: {e}")
                };
                return finish(
                    BuildStatus::Failed,
                    vec![Diagnostic::error(message)],
                    false,
                );
            }
        };

        let scope = self.scope.child_with_timeout(self.timeout);
        let request = CompileRequest {
            component: name,
            path: &task.path,
        };

        match self.compiler.compile(&request, &scope) {
            Ok(output) if output.success => {
                let warnings = self.parser.parse(&output.output);
                self.cache.record(task.path.clone(), name, stamp, output.output);
                self.breaker.record_success(name);
                finish(BuildStatus::Succeeded, warnings, false)
            }
            Ok(output) => {
                let mut errors = self.parser.parse(&output.output);
                if !errors.iter().any(Diagnostic::is_error) {
                    errors.push(fallback_error(&output.output, output.exit_code));
                }
                self.breaker.record_failure(name, task.fingerprint);
                finish(BuildStatus::Failed, errors, false)
            }
            Err(CompilerError::Cancelled) => {
                self.breaker.release_probe(name);
                finish(BuildStatus::Cancelled, Vec::new(), false)
            }
            Err(CompilerError::TimedOut) => {
                self.breaker.record_failure(name, task.fingerprint);
                let message = match self.timeout {
                    Some(t) => format!("compiler timed out after {}ms", t.as_millis()),
                    None => "compiler timed out".to_string(),
                };
                finish(BuildStatus::Failed, vec![Diagnostic::error(message)], false)
            }
            Err(e) => {
                if let CompilerError::Rejected(sec) = &e {
                    log_security(sec);
                }
                self.breaker.record_failure(name, task.fingerprint);
                finish(BuildStatus::Failed, vec![Diagnostic::error(e.to_string())], false)
            }
        }
    }
}

#[cfg(test)]
mod tests;
