//! Build tasks, results and tickets.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crossbeam::channel::{Receiver, RecvTimeoutError};
use thiserror::Error;

use crate::component::Component;
use crate::core::{Diagnostic, ErrorKind};
use crate::registry::BuildSummary;
use crate::utils::hash::Fingerprint;

/// The narrow view of a component the pipeline needs.
pub trait BuildableComponent {
    fn name(&self) -> &str;
    fn path(&self) -> &Path;
    fn fingerprint(&self) -> Fingerprint;
}

impl BuildableComponent for Component {
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

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildTask {
    pub id: u64,
    pub component: String,
    pub path: PathBuf,
    pub fingerprint: Fingerprint,
    pub enqueued_at: Instant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildStatus {
    Succeeded,
    Failed,
    /// Short-circuited after repeated failures; the compiler did not run.
    CircuitOpen { retry_in: Duration },
    /// Cancelled by shutdown before or during the compile.
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct BuildResult {
    pub task: BuildTask,
    pub status: BuildStatus,
    pub errors: Vec<Diagnostic>,
    pub duration: Duration,
    pub cache_hit: bool,
}

impl BuildResult {
    pub fn success(&self) -> bool {
        self.status == BuildStatus::Succeeded
    }

    pub(super) fn cancelled(task: BuildTask) -> Self {
        Self {
            task,
            status: BuildStatus::Cancelled,
            errors: Vec::new(),
            duration: Duration::ZERO,
            cache_hit: false,
        }
    }

    /// What the registry keeps about this build.
    pub fn summary(&self) -> BuildSummary {
        BuildSummary {
            component: self.task.component.clone(),
            success: self.success(),
            errors: self.errors.clone(),
            duration: self.duration,
            cache_hit: self.cache_hit,
            circuit_open: matches!(self.status, BuildStatus::CircuitOpen { .. }),
        }
    }
}

/// Handle to a submitted build.
pub struct BuildTicket {
    pub(super) task: BuildTask,
    pub(super) receiver: Receiver<BuildResult>,
}

impl BuildTicket {
    pub fn task(&self) -> &BuildTask {
        &self.task
    }

    /// Block until the result arrives. A pipeline torn down without replying
    /// yields a cancelled result.
    pub fn wait(self) -> BuildResult {
        self.receiver
            .recv()
            .unwrap_or_else(|_| BuildResult::cancelled(self.task))
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Option<BuildResult> {
        match self.receiver.recv_timeout(timeout) {
            Ok(result) => Some(result),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(BuildResult::cancelled(self.task.clone())),
        }
    }

    pub fn try_result(&self) -> Option<BuildResult> {
        self.receiver.try_recv().ok()
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SubmitError {
    #[error("build queue is full ({capacity} pending); `{component}` was not queued")]
    QueueFull { component: String, capacity: usize },

    #[error("build pipeline is shut down")]
    ShutDown,
}

impl SubmitError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::QueueFull { .. } => ErrorKind::ResourceExhaustion,
            Self::ShutDown => ErrorKind::Transient,
        }
    }
}
