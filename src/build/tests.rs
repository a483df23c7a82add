use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use crossbeam::channel::unbounded;
use parking_lot::Mutex;
use tempfile::TempDir;

use super::*;
use crate::cache::ContentCache;
use crate::core::ErrorKind;
use crate::utils::hash::Fingerprint;

#[derive(Clone, Copy)]
enum Behavior {
    Succeed,
    Fail,
    /// Block until cancelled.
    Hang,
    Panic,
}

struct FakeCompiler {
    behavior: Mutex<Behavior>,
    calls: AtomicUsize,
    delay: Duration,
}

impl FakeCompiler {
    fn new(behavior: Behavior) -> Arc<Self> {
        Self::slow(behavior, Duration::ZERO)
    }

    fn slow(behavior: Behavior, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            behavior: Mutex::new(behavior),
            calls: AtomicUsize::new(0),
            delay,
        })
    }

    fn set(&self, behavior: Behavior) {
        *self.behavior.lock() = behavior;
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Compiler for FakeCompiler {
    fn compile(
        &self,
        request: &CompileRequest<'_>,
        cancel: &CancelScope,
    ) -> Result<CompileOutput, CompilerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        thread::sleep(self.delay);
        let behavior = *self.behavior.lock();
        match behavior {
            Behavior::Succeed => Ok(CompileOutput {
                success: true,
                exit_code: Some(0),
                output: String::new(),
            }),
            Behavior::Fail => Ok(CompileOutput {
                success: false,
                exit_code: Some(1),
                output: format!(
                    "{}:3:7: error: unexpected token",
                    request.path.file_name().unwrap().to_string_lossy()
                ),
            }),
            Behavior::Hang => loop {
                if cancel.is_cancelled() {
                    return Err(if cancel.is_expired() {
                        CompilerError::TimedOut
                    } else {
                        CompilerError::Cancelled
                    });
                }
                thread::sleep(Duration::from_millis(5));
            },
            Behavior::Panic => panic!("compiler exploded"),
        }
    }
}

struct Source {
    name: String,
    path: PathBuf,
    fingerprint: Fingerprint,
}

impl BuildableComponent for Source {
    fn name(&self) -> &str {
        &self.name
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }
}

struct Fixture {
    dir: TempDir,
    compiler: Arc<FakeCompiler>,
    pipeline: BuildPipeline,
}

impl Fixture {
    fn new(compiler: Arc<FakeCompiler>, tweak: impl FnOnce(&mut PipelineOptions)) -> Self {
        let mut options = PipelineOptions {
            workers: 2,
            queue_capacity: 16,
            timeout: Some(Duration::from_secs(5)),
            breaker_threshold: 3,
            breaker_cooldown: Duration::from_secs(60),
        };
        tweak(&mut options);
        let cache = Arc::new(ArtifactCache::new(Arc::new(ContentCache::new(
            64,
            Duration::from_secs(60),
        ))));
        let pipeline = BuildPipeline::new(
            options,
            Arc::clone(&compiler) as Arc<dyn Compiler>,
            Arc::new(LocationParser),
            cache,
        );
        Self {
            dir: TempDir::new().unwrap(),
            compiler,
            pipeline,
        }
    }

    fn source(&self, name: &str, content: &str) -> Source {
        let path = self.dir.path().join(format!("{}.component", name.to_lowercase()));
        fs::write(&path, content).unwrap();
        Source {
            name: name.to_string(),
            path,
            fingerprint: Fingerprint::of(content),
        }
    }

    fn build(&self, source: &Source) -> BuildResult {
        self.pipeline.submit(source).unwrap().wait()
    }
}

#[test]
fn test_successful_build_then_cache_hit() {
    let fx = Fixture::new(FakeCompiler::new(Behavior::Succeed), |_| {});
    let button = fx.source("Button", "component Button() {}");

    let first = fx.build(&button);
    assert!(first.success());
    assert!(!first.cache_hit);

    let second = fx.build(&button);
    assert!(second.success());
    assert!(second.cache_hit);
    assert_eq!(fx.compiler.calls(), 1);

    let metrics = fx.pipeline.metrics();
    assert_eq!(metrics.completed, 2);
    assert_eq!(metrics.cache_hit_rate, 0.5);
    assert_eq!(metrics.success_rate, 1.0);
}

#[test]
fn test_content_change_rebuilds() {
    let fx = Fixture::new(FakeCompiler::new(Behavior::Succeed), |_| {});
    let card = fx.source("Card", "component Card() {}");
    fx.build(&card);

    let card = fx.source("Card", "component Card(title string) {}");
    let result = fx.build(&card);
    assert!(!result.cache_hit);
    assert_eq!(fx.compiler.calls(), 2);
}

#[test]
fn test_failed_build_reports_structured_errors_and_is_not_cached() {
    let fx = Fixture::new(FakeCompiler::new(Behavior::Fail), |_| {});
    let nav = fx.source("Nav", "component Nav( {}");

    let result = fx.build(&nav);
    assert_eq!(result.status, BuildStatus::Failed);
    assert_eq!(result.errors.len(), 1);
    assert_eq!(result.errors[0].line, Some(3));
    assert_eq!(result.errors[0].column, Some(7));

    fx.compiler.set(Behavior::Succeed);
    let result = fx.build(&nav);
    assert!(result.success());
    assert!(!result.cache_hit);
}

#[test]
fn test_sibling_success_is_not_a_hit_for_failing_component() {
    let fx = Fixture::new(FakeCompiler::new(Behavior::Fail), |_| {});
    let shared = fx.source("X", "component A() {}\ncomponent B() {}");
    let sibling = |name: &str| Source {
        name: name.to_string(),
        path: shared.path.clone(),
        fingerprint: shared.fingerprint,
    };
    let (a, b) = (sibling("A"), sibling("B"));

    assert_eq!(fx.build(&a).status, BuildStatus::Failed);
    fx.compiler.set(Behavior::Succeed);
    let built = fx.build(&b);
    assert!(built.success());
    assert!(!built.cache_hit);

    // B's artifact must not answer for A
    fx.compiler.set(Behavior::Fail);
    let again = fx.build(&a);
    assert_eq!(again.status, BuildStatus::Failed);
    assert!(!again.cache_hit);
    assert_eq!(fx.compiler.calls(), 3);

    // and B still hits
    assert!(fx.build(&b).cache_hit);
}

#[test]
fn test_circuit_opens_after_repeated_failures() {
    let fx = Fixture::new(FakeCompiler::new(Behavior::Fail), |o| o.breaker_threshold = 2);
    let nav = fx.source("Nav", "component Nav( {}");

    fx.build(&nav);
    fx.build(&nav);
    let result = fx.build(&nav);
    assert!(matches!(result.status, BuildStatus::CircuitOpen { .. }));
    assert!(result.summary().circuit_open);
    assert_eq!(fx.compiler.calls(), 2);
    assert_eq!(fx.pipeline.breaker().state("Nav"), CircuitState::Open);

    // editing the file closes the circuit
    fx.compiler.set(Behavior::Succeed);
    let fixed = fx.source("Nav", "component Nav() {}");
    assert!(fx.build(&fixed).success());
}

#[test]
fn test_queue_full_is_signalled() {
    let fx = Fixture::new(
        FakeCompiler::slow(Behavior::Succeed, Duration::from_millis(200)),
        |o| {
            o.workers = 1;
            o.queue_capacity = 1;
        },
    );
    let sources: Vec<_> = (0..4)
        .map(|i| fx.source(&format!("C{i}"), &format!("component C{i}() {{}}")))
        .collect();

    let mut tickets = Vec::new();
    let mut rejected = Vec::new();
    for source in &sources {
        match fx.pipeline.submit(source) {
            Ok(ticket) => tickets.push(ticket),
            Err(e) => rejected.push(e),
        }
    }

    assert!(!rejected.is_empty());
    assert!(matches!(&rejected[0], SubmitError::QueueFull { capacity: 1, .. }));
    assert_eq!(rejected[0].kind(), ErrorKind::ResourceExhaustion);
    for ticket in tickets {
        assert!(ticket.wait().success());
    }
    assert_eq!(fx.pipeline.metrics().rejected, rejected.len() as u64);
}

#[test]
fn test_timeout_kills_build() {
    let fx = Fixture::new(FakeCompiler::new(Behavior::Hang), |o| {
        o.timeout = Some(Duration::from_millis(50))
    });
    let slow = fx.source("Slow", "component Slow() {}");

    let result = fx.build(&slow);
    assert_eq!(result.status, BuildStatus::Failed);
    assert!(result.errors[0].message.contains("timed out"));
}

#[test]
fn test_panic_becomes_failed_result() {
    let fx = Fixture::new(FakeCompiler::new(Behavior::Panic), |_| {});
    let boom = fx.source("Boom", "component Boom() {}");

    let result = fx.build(&boom);
    assert_eq!(result.status, BuildStatus::Failed);
    assert_eq!(result.errors[0].message, "build panicked");

    // the worker survives
    fx.compiler.set(Behavior::Succeed);
    assert!(fx.build(&boom).success());
}

#[test]
fn test_callback_submission() {
    let fx = Fixture::new(FakeCompiler::new(Behavior::Succeed), |_| {});
    let a = fx.source("A", "component A() {}");
    let (tx, rx) = unbounded();

    fx.pipeline
        .submit_with(&a, move |result| {
            tx.send(result).unwrap();
        })
        .unwrap();
    let result = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(result.task.component, "A");
    assert!(result.success());
}

#[test]
fn test_missing_source_fails_without_compiling() {
    let fx = Fixture::new(FakeCompiler::new(Behavior::Succeed), |_| {});
    let ghost = Source {
        name: "Ghost".into(),
        path: fx.dir.path().join("ghost.component"),
        fingerprint: Fingerprint::default(),
    };
    let result = fx.build(&ghost);
    assert_eq!(result.status, BuildStatus::Failed);
    assert_eq!(fx.compiler.calls(), 0);
}

#[test]
fn test_shutdown_cancels_and_is_idempotent() {
    let fx = Fixture::new(FakeCompiler::new(Behavior::Hang), |o| {
        o.workers = 1;
        o.timeout = None;
    });
    let a = fx.source("A", "component A() {}");
    let b = fx.source("B", "component B() {}");

    let running = fx.pipeline.submit(&a).unwrap();
    let queued = fx.pipeline.submit(&b).unwrap();
    thread::sleep(Duration::from_millis(50));

    fx.pipeline.shutdown();
    fx.pipeline.shutdown();

    assert_eq!(running.wait().status, BuildStatus::Cancelled);
    assert_eq!(queued.wait().status, BuildStatus::Cancelled);
    assert!(fx.pipeline.is_shut_down());
    assert_eq!(fx.pipeline.submit(&a).err(), Some(SubmitError::ShutDown));
}

#[test]
fn test_worker_count_is_capped() {
    let fx = Fixture::new(FakeCompiler::new(Behavior::Succeed), |o| o.workers = 64);
    assert_eq!(fx.pipeline.worker_count(), MAX_WORKERS);
}
