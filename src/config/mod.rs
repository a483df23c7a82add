//! Engine configuration from `kiln.toml`.
//!
//! ```text
//! config/
//! ├── section/   # [scan] [build] [watch] [cache] [serve] [registry]
//! ├── error.rs   # ConfigError
//! └── mod.rs     # EngineConfig (this file)
//! ```
//!
//! Every section is optional; a project without `kiln.toml` runs on defaults.
//! Relative paths resolve against the project root and must stay inside it.

mod error;
pub mod section;

pub use error::ConfigError;
pub use section::{
    BuildSection, CacheSection, RegistrySection, ScanSection, ServeSection, WatchSection,
};

use std::fs;
use std::path::{Path, PathBuf};

use globset::Glob;
use serde::{Deserialize, Serialize};

use crate::core::ProjectRoot;
use crate::log;
use crate::watch::MAX_DELAY_WINDOWS;

/// Default config file name, looked up in the project root.
pub const CONFIG_FILE: &str = "kiln.toml";

/// Root configuration structure representing `kiln.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Canonical project root (internal use only)
    #[serde(skip)]
    pub root: PathBuf,

    /// Config file the values came from, if one existed (internal use only)
    #[serde(skip)]
    pub config_path: Option<PathBuf>,

    #[serde(default)]
    pub scan: ScanSection,

    #[serde(default)]
    pub build: BuildSection,

    #[serde(default)]
    pub watch: WatchSection,

    #[serde(default)]
    pub cache: CacheSection,

    #[serde(default)]
    pub serve: ServeSection,

    #[serde(default)]
    pub registry: RegistrySection,
}

impl EngineConfig {
    /// Load configuration for the project at `root`.
    ///
    /// `config` overrides the config file location; when it is `None` a
    /// missing `kiln.toml` means defaults, while an explicit file that does
    /// not exist is an error.
    pub fn load(root: &Path, config: Option<&Path>) -> Result<Self, ConfigError> {
        let project = ProjectRoot::new(root)?;

        let (path, required) = match config {
            Some(path) if path.is_absolute() => (path.to_path_buf(), true),
            Some(path) => (project.path().join(path), true),
            None => (project.path().join(CONFIG_FILE), false),
        };

        let mut loaded = if path.exists() || required {
            let mut parsed = Self::from_path(&path)?;
            parsed.config_path = Some(path);
            parsed
        } else {
            Self::default()
        };

        loaded.finalize(&project)?;
        loaded.validate()?;
        Ok(loaded)
    }

    /// Parse configuration from a TOML string (no path resolution).
    pub fn from_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let content =
            fs::read_to_string(path).map_err(|err| ConfigError::Io(path.to_path_buf(), err))?;

        let (config, ignored) = Self::parse_with_ignored(&content)?;
        if !ignored.is_empty() {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy())
                .unwrap_or_else(|| path.to_string_lossy());
            log!("warning"; "unknown fields in {} ignored: {}", name, ignored.join(", "));
        }
        Ok(config)
    }

    /// Parse TOML content, collecting any unknown fields.
    fn parse_with_ignored(content: &str) -> Result<(Self, Vec<String>), ConfigError> {
        let mut ignored = Vec::new();
        let deserializer = toml::Deserializer::new(content);
        let config = serde_ignored::deserialize(deserializer, |path: serde_ignored::Path| {
            ignored.push(path.to_string());
        })?;
        Ok((config, ignored))
    }

    /// Resolve every configured path against the project root.
    fn finalize(&mut self, project: &ProjectRoot) -> Result<(), ConfigError> {
        self.root = project.path().to_path_buf();

        let mut roots = Vec::with_capacity(self.scan.roots.len());
        for dir in &self.scan.roots {
            let resolved = project.resolve(dir)?;
            if !roots.contains(&resolved) {
                roots.push(resolved);
            }
        }
        self.scan.roots = roots;
        self.cache.dir = project.resolve(&self.cache.dir)?;

        self.build.workers = self.build.workers.clamp(1, 8);
        self.scan.parse_workers = self.scan.parse_workers.clamp(1, 8);
        self.scan.io_workers = self.scan.io_workers.max(1);
        Ok(())
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Validation(msg));

        if self.scan.roots.is_empty() {
            return invalid("[scan] roots must name at least one directory".into());
        }
        if self.scan.extensions.is_empty() {
            return invalid("[scan] extensions must not be empty".into());
        }
        for pattern in &self.scan.exclude {
            if let Err(e) = Glob::new(pattern) {
                return invalid(format!("[scan] invalid exclude glob `{pattern}`: {e}"));
            }
        }
        if self.scan.parse_queue == 0 {
            return invalid("[scan] parse_queue must be at least 1".into());
        }
        if self.build.compiler.trim().is_empty() {
            return invalid("[build] compiler must not be empty".into());
        }
        if self.build.queue_capacity == 0 {
            return invalid("[build] queue_capacity must be at least 1".into());
        }
        if self.build.breaker_threshold == 0 {
            return invalid("[build] breaker_threshold must be at least 1".into());
        }
        if self.watch.queue_capacity == 0 {
            return invalid("[watch] queue_capacity must be at least 1".into());
        }
        // The sweep must not discard paths the debouncer is still holding
        let longest_hold = self
            .watch
            .debounce_ms
            .saturating_mul(u64::from(MAX_DELAY_WINDOWS));
        if self.watch.sweep_ms < longest_hold {
            return invalid(format!(
                "[watch] sweep_ms must be at least {longest_hold} (debounce_ms x {MAX_DELAY_WINDOWS})"
            ));
        }
        if self.cache.capacity == 0 {
            return invalid("[cache] capacity must be at least 1".into());
        }
        if self.serve.ring_capacity == 0 {
            return invalid("[serve] ring_capacity must be at least 1".into());
        }
        if !(self.serve.drop_threshold > 0.0 && self.serve.drop_threshold <= 1.0) {
            return invalid("[serve] drop_threshold must be in (0, 1]".into());
        }
        if self.serve.max_connections_per_address == 0 {
            return invalid("[serve] max_connections_per_address must be at least 1".into());
        }
        if self.registry.subscriber_buffer == 0 {
            return invalid("[registry] subscriber_buffer must be at least 1".into());
        }
        Ok(())
    }
}

/// Parse config from TOML; panics on unknown fields so test typos surface.
#[cfg(test)]
pub fn test_parse_config(content: &str) -> EngineConfig {
    let (parsed, ignored) = EngineConfig::parse_with_ignored(content).unwrap();
    assert!(
        ignored.is_empty(),
        "test config has unknown fields: {:?}",
        ignored
    );
    parsed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::SecurityError;
    use tempfile::TempDir;

    #[test]
    fn test_invalid_toml() {
        assert!(EngineConfig::from_str("[scan\nroots = []").is_err());
    }

    #[test]
    fn test_unknown_fields_detected() {
        let (config, ignored) =
            EngineConfig::parse_with_ignored("[watch]\ndebounce_ms = 10\n[bogus]\nx = 1").unwrap();
        assert_eq!(config.watch.debounce_ms, 10);
        assert!(ignored.iter().any(|f| f.contains("bogus")));
    }

    #[test]
    fn test_load_without_config_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let config = EngineConfig::load(dir.path(), None).unwrap();
        let root = dir.path().canonicalize().unwrap();
        assert_eq!(config.root, root);
        assert_eq!(config.scan.roots, vec![root.clone()]);
        assert_eq!(config.cache.dir, root.join(".kiln/cache"));
        assert!(config.config_path.is_none());
    }

    #[test]
    fn test_load_explicit_missing_file_fails() {
        let dir = TempDir::new().unwrap();
        let err = EngineConfig::load(dir.path(), Some(Path::new("nope.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::Io(..)));
    }

    #[test]
    fn test_load_resolves_roots() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("ui")).unwrap();
        fs::write(dir.path().join(CONFIG_FILE), "[scan]\nroots = [\"ui\", \"./ui\"]").unwrap();
        let config = EngineConfig::load(dir.path(), None).unwrap();
        let root = dir.path().canonicalize().unwrap();
        assert_eq!(config.scan.roots, vec![root.join("ui")]);
        assert_eq!(config.config_path, Some(root.join(CONFIG_FILE)));
    }

    #[test]
    fn test_load_rejects_root_outside_project() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(CONFIG_FILE), "[scan]\nroots = [\"../..\"]").unwrap();
        let err = EngineConfig::load(dir.path(), None).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Security(SecurityError::PathTraversal { .. })
        ));
        assert_eq!(err.kind(), crate::core::ErrorKind::Security);
    }

    #[test]
    fn test_validate_rejects_bad_glob() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(CONFIG_FILE), "[scan]\nexclude = [\"a/[\"]").unwrap();
        let err = EngineConfig::load(dir.path(), None).unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn test_validate_rejects_sweep_shorter_than_debounce_hold() {
        let mut config = test_parse_config("[watch]\ndebounce_ms = 50\nsweep_ms = 400");
        config.scan.roots = vec![PathBuf::from("/")];
        assert!(matches!(config.validate(), Err(ConfigError::Validation(_))));

        config.watch.sweep_ms = 500;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_capacity() {
        let mut config = test_parse_config("[build]\nqueue_capacity = 0");
        config.scan.roots = vec![PathBuf::from("/")];
        assert!(matches!(config.validate(), Err(ConfigError::Validation(_))));
    }
}
