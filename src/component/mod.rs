//! Component metadata and the component source parser.
//!
//! A component file holds an optional `package` header and one or more
//! declarations:
//!
//! ```text
//! package ui
//!
//! component Button(label string, disabled bool) {
//!     <button disabled?={ disabled }>{ label }</button>
//!     @Icon("check")
//! }
//! ```
//!
//! The scanner turns each [`Declaration`] into a [`Component`]; a file that
//! fails to parse produces components carrying [`ParseStatus::Error`].

mod parse;

pub use parse::{Declaration, FileMetadata, ParseMode, parse};

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::utils::hash::Fingerprint;

/// One typed parameter, in declaration order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    pub ty: String,
}

impl fmt::Display for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.name, self.ty)
    }
}

/// A malformed component definition.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{line}:{column}: {message}")]
pub struct ParseError {
    pub message: String,
    pub line: usize,
    pub column: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseStatus {
    Ok,
    Error(ParseError),
}

impl ParseStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }

    pub fn error(&self) -> Option<&ParseError> {
        match self {
            Self::Ok => None,
            Self::Error(e) => Some(e),
        }
    }
}

/// Metadata of one component as last seen by the scanner.
///
/// Identity is `(name, path)`. Only the scanner creates or replaces these;
/// build results are recorded beside them in the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Component {
    /// Qualified name: `package.Name`, or `Name` without a package header.
    pub name: String,
    pub path: PathBuf,
    pub params: Vec<Parameter>,
    /// Qualified names of referenced components, first-seen order.
    pub dependencies: Vec<String>,
    pub fingerprint: Fingerprint,
    pub modified: SystemTime,
    pub status: ParseStatus,
}

impl Component {
    pub fn from_declaration(
        decl: &Declaration,
        package: Option<&str>,
        path: &Path,
        fingerprint: Fingerprint,
        modified: SystemTime,
    ) -> Self {
        Self {
            name: qualify(package, &decl.name),
            path: path.to_path_buf(),
            params: decl.params.clone(),
            dependencies: decl.dependencies.clone(),
            fingerprint,
            modified,
            status: ParseStatus::Ok,
        }
    }

    /// Stand-in for a file that has never parsed, named after the file stem.
    pub fn placeholder(
        path: &Path,
        package: Option<&str>,
        error: ParseError,
        fingerprint: Fingerprint,
        modified: SystemTime,
    ) -> Self {
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy())
            .unwrap_or_default();
        Self {
            name: qualify(package, &pascal_case(&stem)),
            path: path.to_path_buf(),
            params: Vec::new(),
            dependencies: Vec::new(),
            fingerprint,
            modified,
            status: ParseStatus::Error(error),
        }
    }

    /// Keep this component's last-good shape but mark it as failing.
    pub fn with_error(&self, error: ParseError, fingerprint: Fingerprint, modified: SystemTime) -> Self {
        Self {
            fingerprint,
            modified,
            status: ParseStatus::Error(error),
            ..self.clone()
        }
    }

    /// Same metadata apart from timestamps.
    pub fn same_shape(&self, other: &Self) -> bool {
        self.name == other.name
            && self.path == other.path
            && self.params == other.params
            && self.dependencies == other.dependencies
            && self.fingerprint == other.fingerprint
            && self.status == other.status
    }
}

pub(crate) fn qualify(package: Option<&str>, name: &str) -> String {
    match package {
        Some(pkg) if !name.contains('.') => format!("{pkg}.{name}"),
        _ => name.to_string(),
    }
}

/// `user-card` / `user_card` / `userCard` -> `UserCard`.
pub fn pascal_case(stem: &str) -> String {
    let mut out = String::with_capacity(stem.len());
    let mut upper = true;
    for ch in stem.chars() {
        if ch.is_alphanumeric() {
            if upper {
                out.extend(ch.to_uppercase());
            } else {
                out.push(ch);
            }
            upper = false;
        } else {
            upper = true;
        }
    }
    if out.is_empty() {
        out.push_str("Component");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pascal_case() {
        assert_eq!(pascal_case("user-card"), "UserCard");
        assert_eq!(pascal_case("user_card"), "UserCard");
        assert_eq!(pascal_case("userCard"), "UserCard");
        assert_eq!(pascal_case("button"), "Button");
        assert_eq!(pascal_case("--"), "Component");
    }

    #[test]
    fn test_qualify() {
        assert_eq!(qualify(Some("ui"), "Button"), "ui.Button");
        assert_eq!(qualify(None, "Button"), "Button");
        assert_eq!(qualify(Some("ui"), "icons.Check"), "icons.Check");
    }

    #[test]
    fn test_placeholder_and_with_error() {
        let err = ParseError {
            message: "expected '('".into(),
            line: 1,
            column: 18,
        };
        let fp = Fingerprint::of("x");
        let now = SystemTime::now();
        let placeholder =
            Component::placeholder(Path::new("/p/nav-bar.component"), Some("ui"), err.clone(), fp, now);
        assert_eq!(placeholder.name, "ui.NavBar");
        assert_eq!(placeholder.status.error(), Some(&err));

        let good = Component {
            name: "ui.NavBar".into(),
            path: PathBuf::from("/p/nav-bar.component"),
            params: vec![Parameter {
                name: "items".into(),
                ty: "[]string".into(),
            }],
            dependencies: vec!["ui.Link".into()],
            fingerprint: Fingerprint::of("old"),
            modified: now,
            status: ParseStatus::Ok,
        };
        let failed = good.with_error(err.clone(), fp, now);
        assert_eq!(failed.params, good.params);
        assert_eq!(failed.dependencies, good.dependencies);
        assert_eq!(failed.fingerprint, fp);
        assert!(!failed.status.is_ok());
    }
}
