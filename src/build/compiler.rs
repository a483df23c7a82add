//! Compiler invocation.
//!
//! The compiler binary is resolved once through `which`. Arguments are built
//! from a template with `{file}` and `{component}` placeholders and passed
//! as an argv array; no shell is ever involved.

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::core::{CancelScope, ErrorKind, SecurityError};
use crate::utils::exec::{Cmd, ExecError};

/// Characters never accepted in a template argument or a substituted value.
const SHELL_METACHARS: &[char] = &[
    ';', '|', '&', '$', '`', '<', '>', '(', ')', '\n', '\r', '\0', '\'', '"', '\\', '*', '?',
];

pub struct CompileRequest<'a> {
    pub component: &'a str,
    /// Absolute path of the component's source file.
    pub path: &'a Path,
}

#[derive(Debug, Clone)]
pub struct CompileOutput {
    pub success: bool,
    pub exit_code: Option<i32>,
    /// Stderr then stdout.
    pub output: String,
}

#[derive(Debug, Error)]
pub enum CompilerError {
    #[error("compiler `{program}` not found: {source}")]
    NotFound {
        program: String,
        #[source]
        source: which::Error,
    },

    #[error(transparent)]
    Rejected(#[from] SecurityError),

    #[error("compile cancelled")]
    Cancelled,

    #[error("compile timed out")]
    TimedOut,

    #[error(transparent)]
    Exec(ExecError),
}

impl CompilerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::Structural,
            Self::Rejected(e) => e.kind(),
            Self::Cancelled | Self::TimedOut | Self::Exec(_) => ErrorKind::Transient,
        }
    }
}

impl From<ExecError> for CompilerError {
    fn from(err: ExecError) -> Self {
        match err {
            ExecError::Cancelled { .. } => Self::Cancelled,
            ExecError::TimedOut { .. } => Self::TimedOut,
            other => Self::Exec(other),
        }
    }
}

/// Runs one component build.
pub trait Compiler: Send + Sync {
    fn compile(
        &self,
        request: &CompileRequest<'_>,
        cancel: &CancelScope,
    ) -> Result<CompileOutput, CompilerError>;
}

/// Validates the argument template and every substituted value.
#[derive(Debug, Clone)]
pub struct ArgumentPolicy {
    template: Vec<String>,
}

impl ArgumentPolicy {
    pub fn new(template: Vec<String>) -> Result<Self, SecurityError> {
        for arg in &template {
            let literal = arg.replace("{file}", "").replace("{component}", "");
            // Unknown placeholders and shell syntax are both refused
            if literal.contains(['{', '}']) || literal.contains(SHELL_METACHARS) {
                return Err(SecurityError::ArgumentRejected(arg.clone()));
            }
        }
        Ok(Self { template })
    }

    /// Build the argv for one compile. `file` is relative to the project root.
    pub fn render(&self, file: &Path, component: &str) -> Result<Vec<String>, SecurityError> {
        let file = file
            .to_str()
            .ok_or_else(|| SecurityError::ArgumentRejected(file.display().to_string()))?;
        let file = sanitize(file)?;
        let component = sanitize(component)?;
        // A value starting with '-' would be read as an option
        let file = if file.starts_with('-') {
            format!("./{file}")
        } else {
            file.to_string()
        };
        if component.starts_with('-') {
            return Err(SecurityError::ArgumentRejected(component.to_string()));
        }

        Ok(self
            .template
            .iter()
            .map(|arg| arg.replace("{file}", &file).replace("{component}", component))
            .collect())
    }
}

fn sanitize(value: &str) -> Result<&str, SecurityError> {
    if value.is_empty() || value.contains(SHELL_METACHARS) {
        return Err(SecurityError::ArgumentRejected(value.escape_debug().to_string()));
    }
    Ok(value)
}

/// Runs an external compiler as a subprocess with its cwd pinned to the
/// project root.
#[derive(Debug)]
pub struct ProcessCompiler {
    program: PathBuf,
    policy: ArgumentPolicy,
    root: PathBuf,
}

impl ProcessCompiler {
    pub fn new(program: &str, args: Vec<String>, root: &Path) -> Result<Self, CompilerError> {
        let program = which::which(program).map_err(|source| CompilerError::NotFound {
            program: program.to_string(),
            source,
        })?;
        Ok(Self {
            program,
            policy: ArgumentPolicy::new(args)?,
            root: root.to_path_buf(),
        })
    }

    pub fn program(&self) -> &Path {
        &self.program
    }
}

impl Compiler for ProcessCompiler {
    fn compile(
        &self,
        request: &CompileRequest<'_>,
        cancel: &CancelScope,
    ) -> Result<CompileOutput, CompilerError> {
        let relative = request.path.strip_prefix(&self.root).map_err(|_| {
            SecurityError::PathTraversal {
                path: request.path.to_path_buf(),
                root: self.root.clone(),
            }
        })?;
        let args = self.policy.render(relative, request.component)?;

        crate::debug!("build"; "{} {}", self.program.display(), args.join(" "));
        let output = Cmd::new(&self.program)
            .args(&args)
            .cwd(&self.root)
            .cancel(cancel.clone())
            .run()?;

        Ok(CompileOutput {
            success: output.status.success(),
            exit_code: output.status.code(),
            output: output.combined(),
        })
    }
}
