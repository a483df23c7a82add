//! Configuration error types.

use std::path::PathBuf;

use thiserror::Error;

use crate::core::{ErrorKind, SecurityError};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error when reading `{}`", .0.display())]
    Io(PathBuf, #[source] std::io::Error),

    #[error("config file parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("config validation error: {0}")]
    Validation(String),

    #[error(transparent)]
    Security(#[from] SecurityError),
}

impl ConfigError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Io(..) => ErrorKind::Transient,
            Self::Toml(_) | Self::Validation(_) => ErrorKind::Structural,
            Self::Security(_) => ErrorKind::Security,
        }
    }
}
