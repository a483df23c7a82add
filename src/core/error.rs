//! Error taxonomy shared by every subsystem.
//!
//! Each subsystem keeps its own `thiserror` enum; all of them map onto
//! [`ErrorKind`] so the engine can decide whether to retry, record, reject or
//! push back.

use std::net::IpAddr;
use std::path::PathBuf;

use thiserror::Error;

/// Coarse classification of an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Subprocess failure, filesystem hiccup, dropped socket. Retried or
    /// surfaced without halting the loop.
    Transient,
    /// Malformed component definition or duplicate name. Recorded against
    /// the component.
    Structural,
    /// Path traversal, disallowed origin, disallowed compiler argument.
    Security,
    /// A bounded queue is saturated.
    ResourceExhaustion,
}

impl ErrorKind {
    pub fn label(self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Structural => "structural",
            Self::Security => "security",
            Self::ResourceExhaustion => "resource",
        }
    }
}

/// Rejections at a trust boundary. Never retried.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SecurityError {
    #[error("path `{}` escapes project root `{}`", path.display(), root.display())]
    PathTraversal { path: PathBuf, root: PathBuf },

    #[error("project root `{}` is not an accessible directory", .0.display())]
    InvalidRoot(PathBuf),

    #[error("origin `{0}` is not allowed")]
    OriginRejected(String),

    #[error("missing Origin header")]
    MissingOrigin,

    #[error("compiler argument `{0}` is not allowlisted")]
    ArgumentRejected(String),

    #[error("authentication required for non-local address {0}")]
    Unauthenticated(IpAddr),
}

impl SecurityError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Security
    }
}

/// Log a security rejection on its own channel.
pub fn log_security(err: &SecurityError) {
    crate::log!("security"; "rejected: {}", err);
}
