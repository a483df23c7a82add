//! Component scanner.
//!
//! Discovers component files, fingerprints them, serves unchanged files from
//! the metadata cache and parses the rest, then applies each file's
//! components to the registry.
//!
//! ```text
//! discovery --paths--> I/O workers --parse jobs--> parse workers
//!                          |                             |
//!                          +--------- results -----------+--> collector --> registry
//! ```
//!
//! I/O and parse workers are separate bounded pools so one expensive parse
//! never stalls discovery or reads of other files.

mod pipeline;
mod walk;

pub use walk::SKIP_DIRS;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use globset::{Glob, GlobSetBuilder};
use rustc_hash::FxHashSet;
use thiserror::Error;

use crate::cache::ContentCache;
use crate::component::{Component, FileMetadata};
use crate::config::EngineConfig;
use crate::core::{CancelScope, Diagnostic, ErrorKind, ProjectRoot, SecurityError, log_security};
use crate::registry::{ComponentRegistry, Conflict, FileChange};
use crate::utils::hash::Fingerprint;
use crate::{debug, log};
use pipeline::{FileOutcome, Pipeline};
use walk::CandidateFilter;

/// Parsed metadata per `(path, fingerprint)`.
pub type MetadataCache = ContentCache<FileMetadata>;

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("invalid exclude glob `{pattern}`: {source}")]
    InvalidGlob {
        pattern: String,
        #[source]
        source: globset::Error,
    },

    #[error(transparent)]
    Security(#[from] SecurityError),
}

impl ScanError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidGlob { .. } => ErrorKind::Structural,
            Self::Security(_) => ErrorKind::Security,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScanOptions {
    pub roots: Vec<PathBuf>,
    pub exclude: Vec<String>,
    pub extensions: Vec<String>,
    pub io_workers: usize,
    pub parse_workers: usize,
    pub parse_queue: usize,
    pub large_file_threshold: u64,
}

impl ScanOptions {
    pub fn from_config(config: &EngineConfig) -> Self {
        let scan = &config.scan;
        Self {
            roots: scan.roots.clone(),
            exclude: scan.exclude.clone(),
            extensions: scan.extensions.clone(),
            io_workers: scan.io_workers.max(1),
            parse_workers: scan.parse_workers.clamp(1, 8),
            parse_queue: scan.parse_queue.max(1),
            large_file_threshold: scan.large_file_threshold,
        }
    }
}

/// Outcome of one scan pass.
#[derive(Debug, Default, Clone)]
pub struct ScanReport {
    pub added: Vec<String>,
    pub updated: Vec<String>,
    pub removed: Vec<String>,
    pub unchanged: Vec<String>,
    /// Parse errors, unreadable files and rejected paths.
    pub errors: Vec<Diagnostic>,
    pub conflicts: Vec<Conflict>,
    pub files: usize,
    pub cache_hits: usize,
    pub cache_misses: usize,
    /// The scan stopped early; removal of unseen files was skipped.
    pub cancelled: bool,
}

impl ScanReport {
    /// Names whose metadata changed and need a build.
    pub fn changed(&self) -> impl Iterator<Item = &String> {
        self.added.iter().chain(&self.updated)
    }

    pub fn has_changes(&self) -> bool {
        !(self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty())
    }

    fn merge(&mut self, change: FileChange) {
        self.added.extend(change.added);
        self.updated.extend(change.updated);
        self.removed.extend(change.removed);
        self.unchanged.extend(change.unchanged);
        self.conflicts.extend(change.conflicts);
    }
}

pub struct Scanner {
    root: ProjectRoot,
    options: ScanOptions,
    filter: CandidateFilter,
    registry: Arc<ComponentRegistry>,
    cache: Arc<MetadataCache>,
}

impl Scanner {
    pub fn new(
        root: ProjectRoot,
        options: ScanOptions,
        registry: Arc<ComponentRegistry>,
        cache: Arc<MetadataCache>,
    ) -> Result<Self, ScanError> {
        let mut builder = GlobSetBuilder::new();
        for pattern in &options.exclude {
            let glob = Glob::new(pattern).map_err(|source| ScanError::InvalidGlob {
                pattern: pattern.clone(),
                source,
            })?;
            builder.add(glob);
        }
        let exclude = builder.build().map_err(|source| ScanError::InvalidGlob {
            pattern: options.exclude.join(", "),
            source,
        })?;

        for dir in &options.roots {
            root.resolve(dir)?;
        }

        let filter = CandidateFilter {
            root: root.path().to_path_buf(),
            extensions: options.extensions.clone(),
            exclude,
        };
        Ok(Self {
            root,
            options,
            filter,
            registry,
            cache,
        })
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.options.roots
    }

    pub fn registry(&self) -> &Arc<ComponentRegistry> {
        &self.registry
    }

    pub fn cache(&self) -> &Arc<MetadataCache> {
        &self.cache
    }

    /// Full scan of every configured root. Files the registry knows about
    /// that were not seen are removed, unless the scan was cancelled.
    pub fn scan(&self, cancel: &CancelScope) -> ScanReport {
        let roots = self.options.roots.clone();
        let filter = self.filter.clone();
        let discover = move |emit: &mut dyn FnMut(PathBuf) -> bool| {
            for dir in &roots {
                if !dir.is_dir() {
                    log!("scan"; "root {} does not exist, skipping", dir.display());
                    continue;
                }
                let mut stopped = false;
                walk::walk(dir, &filter, |path| {
                    let more = emit(path);
                    stopped = !more;
                    more
                });
                if stopped {
                    return;
                }
            }
        };

        let mut report = ScanReport::default();
        let seen = self.run(discover, cancel, &mut report);

        if !report.cancelled {
            for file in self.registry.tracked_files() {
                let under_root = self.options.roots.iter().any(|r| file.starts_with(r));
                if under_root && !seen.contains(&file) {
                    self.forget(&file, &mut report);
                }
            }
        }
        report
    }

    /// Rescan an explicit set of changed paths. Directories are walked;
    /// paths that no longer exist remove whatever they defined.
    pub fn scan_paths(&self, paths: &[PathBuf], cancel: &CancelScope) -> ScanReport {
        let mut report = ScanReport::default();
        let mut accepted = Vec::with_capacity(paths.len());

        for path in paths {
            match self.root.resolve(path) {
                Ok(resolved) => accepted.push(resolved),
                Err(err) => {
                    log_security(&err);
                    report.errors.push(Diagnostic::error(err.to_string()));
                }
            }
        }

        let filter = self.filter.clone();
        let discover = move |emit: &mut dyn FnMut(PathBuf) -> bool| {
            for path in accepted {
                if path.is_dir() {
                    let mut stopped = false;
                    walk::walk(&path, &filter, |file| {
                        let more = emit(file);
                        stopped = !more;
                        more
                    });
                    if stopped {
                        return;
                    }
                } else if (!path.exists() || filter.accepts(&path)) && !emit(path) {
                    return;
                }
            }
        };

        self.run(discover, cancel, &mut report);
        report
    }

    /// Drive the worker pipeline and apply every outcome as it arrives.
    fn run<D>(&self, discover: D, cancel: &CancelScope, report: &mut ScanReport) -> FxHashSet<PathBuf>
    where
        D: FnOnce(&mut dyn FnMut(PathBuf) -> bool) + Send,
    {
        let pipeline = Pipeline {
            cache: &self.cache,
            io_workers: self.options.io_workers,
            parse_workers: self.options.parse_workers,
            parse_queue: self.options.parse_queue,
            large_file_threshold: self.options.large_file_threshold,
        };

        let mut seen = FxHashSet::default();
        let cancelled = pipeline.run(discover, cancel, |outcome| {
            self.apply(outcome, &mut seen, report);
        });
        report.cancelled = cancelled;

        for conflict in &report.conflicts {
            log!(
                "scan";
                "duplicate component `{}`: {} replaces {}",
                conflict.name,
                self.root.relative(&conflict.kept).display(),
                self.root.relative(&conflict.displaced).display()
            );
        }
        debug!(
            "scan";
            "{} files, {} cache hits, {} parsed",
            report.files, report.cache_hits, report.cache_misses
        );
        seen
    }

    fn apply(&self, outcome: FileOutcome, seen: &mut FxHashSet<PathBuf>, report: &mut ScanReport) {
        match outcome {
            FileOutcome::Parsed {
                path,
                fingerprint,
                modified,
                metadata,
                cache_hit,
            } => {
                report.files += 1;
                if cache_hit {
                    report.cache_hits += 1;
                } else {
                    report.cache_misses += 1;
                }
                let change = self.apply_metadata(&path, fingerprint, modified, &metadata, report);
                report.merge(change);
                seen.insert(path);
            }
            FileOutcome::Vanished(path) => {
                // A removed file, or a removed directory of files
                let gone: Vec<PathBuf> = self
                    .registry
                    .tracked_files()
                    .into_iter()
                    .filter(|f| f.starts_with(&path))
                    .collect();
                for file in gone {
                    self.forget(&file, report);
                }
            }
            FileOutcome::Unreadable { path, message } => {
                report.errors.push(Diagnostic::error(message).at(&path, 1, None));
                seen.insert(path);
            }
        }
    }

    fn apply_metadata(
        &self,
        path: &Path,
        fingerprint: Fingerprint,
        modified: SystemTime,
        metadata: &FileMetadata,
        report: &mut ScanReport,
    ) -> FileChange {
        let package = metadata.package.as_deref();

        let Some(error) = &metadata.error else {
            let components = metadata
                .declarations
                .iter()
                .map(|decl| Component::from_declaration(decl, package, path, fingerprint, modified))
                .collect();
            return self.registry.apply_file(path, components);
        };

        report.errors.push(
            Diagnostic::error(error.message.clone()).at(path, error.line, Some(error.column)),
        );
        let existing = self.registry.components_in_file(path);
        let components = if existing.is_empty() {
            vec![Component::placeholder(path, package, error.clone(), fingerprint, modified)]
        } else {
            existing
                .iter()
                .map(|c| c.with_error(error.clone(), fingerprint, modified))
                .collect()
        };
        self.registry.apply_file(path, components)
    }

    fn forget(&self, file: &Path, report: &mut ScanReport) {
        self.cache.remove(file);
        report.merge(self.registry.remove_file(file));
    }
}
