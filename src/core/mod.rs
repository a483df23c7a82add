//! Core types - pure abstractions shared across the codebase.

mod cancel;
mod diagnostic;
mod error;
mod path;
mod priority;
mod state;

pub use cancel::CancelScope;
pub use diagnostic::{Diagnostic, Severity};
pub use error::{ErrorKind, SecurityError, log_security};
pub use path::ProjectRoot;
pub use priority::Priority;
pub use state::setup_shutdown_handler;
