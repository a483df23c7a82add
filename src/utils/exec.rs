//! External command execution.
//!
//! Builder API for running a compiler subprocess with a working directory,
//! captured output, and cancellation. A cancelled or timed-out command is
//! killed and reaped before `run` returns, so no subprocess outlives its
//! build.
//!
//! ```ignore
//! let output = Cmd::new("templ")
//!     .args(["generate", "-f", "ui/button.component"])
//!     .cwd(root)
//!     .cancel(scope.child_with_timeout(Some(timeout)))
//!     .run()?;
//! ```

use std::ffi::{OsStr, OsString};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use thiserror::Error;

use crate::core::CancelScope;

/// How often a running child is polled for exit or cancellation.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("failed to start `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("`{program}` was cancelled")]
    Cancelled { program: String },

    #[error("`{program}` timed out")]
    TimedOut { program: String },

    #[error("I/O error while running `{program}`: {source}")]
    Io {
        program: String,
        #[source]
        source: io::Error,
    },
}

/// Captured result of a finished command.
#[derive(Debug)]
pub struct CmdOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CmdOutput {
    /// Stderr followed by stdout, lossily decoded.
    pub fn combined(&self) -> String {
        let mut text = String::from_utf8_lossy(&self.stderr).into_owned();
        let stdout = String::from_utf8_lossy(&self.stdout);
        if !stdout.trim().is_empty() {
            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str(&stdout);
        }
        text
    }
}

/// Command builder for external process execution.
#[derive(Debug, Default)]
pub struct Cmd {
    program: OsString,
    args: Vec<OsString>,
    cwd: Option<PathBuf>,
    cancel: Option<CancelScope>,
}

impl Cmd {
    pub fn new<S: AsRef<OsStr>>(program: S) -> Self {
        Self {
            program: program.as_ref().to_owned(),
            ..Default::default()
        }
    }

    pub fn arg<S: AsRef<OsStr>>(mut self, arg: S) -> Self {
        self.args.push(arg.as_ref().to_owned());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args.extend(args.into_iter().map(|a| a.as_ref().to_owned()));
        self
    }

    pub fn cwd<P: AsRef<Path>>(mut self, dir: P) -> Self {
        self.cwd = Some(dir.as_ref().to_owned());
        self
    }

    /// Kill the child when `scope` is cancelled or its deadline passes.
    pub fn cancel(mut self, scope: CancelScope) -> Self {
        self.cancel = Some(scope);
        self
    }

    fn program_name(&self) -> String {
        self.program.to_string_lossy().into_owned()
    }

    /// Run to completion (or cancellation) and capture output.
    ///
    /// A non-zero exit is not an error here; callers inspect `status`.
    pub fn run(self) -> Result<CmdOutput, ExecError> {
        let name = self.program_name();

        if let Some(scope) = &self.cancel
            && scope.is_cancelled()
        {
            return Err(cancel_error(scope, name));
        }

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &self.cwd {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|source| ExecError::Spawn {
            program: name.clone(),
            source,
        })?;

        // Drain both pipes on their own threads so a chatty child never
        // blocks on a full pipe while we poll for exit.
        let stdout = child.stdout.take().map(spawn_reader);
        let stderr = child.stderr.take().map(spawn_reader);

        let status = match self.wait(&mut child, &name) {
            Ok(status) => status,
            Err(e) => {
                join_reader(stdout);
                join_reader(stderr);
                return Err(e);
            }
        };

        Ok(CmdOutput {
            status,
            stdout: join_reader(stdout),
            stderr: join_reader(stderr),
        })
    }

    fn wait(&self, child: &mut Child, name: &str) -> Result<ExitStatus, ExecError> {
        loop {
            match child.try_wait() {
                Ok(Some(status)) => return Ok(status),
                Ok(None) => {}
                Err(source) => {
                    kill_and_reap(child);
                    return Err(ExecError::Io {
                        program: name.to_string(),
                        source,
                    });
                }
            }

            if let Some(scope) = &self.cancel
                && scope.is_cancelled()
            {
                kill_and_reap(child);
                return Err(cancel_error(scope, name.to_string()));
            }

            thread::sleep(POLL_INTERVAL);
        }
    }
}

fn cancel_error(scope: &CancelScope, program: String) -> ExecError {
    if scope.is_expired() && !scope.token().is_cancelled() {
        ExecError::TimedOut { program }
    } else {
        ExecError::Cancelled { program }
    }
}

fn kill_and_reap(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

fn spawn_reader<R: Read + Send + 'static>(mut pipe: R) -> JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        buf
    })
}

fn join_reader(handle: Option<JoinHandle<Vec<u8>>>) -> Vec<u8> {
    handle.and_then(|h| h.join().ok()).unwrap_or_default()
}
