//! Scan worker pipeline.

use std::fs;
use std::io;
use std::path::PathBuf;
use std::thread;
use std::time::{SystemTime, UNIX_EPOCH};

use crossbeam::channel::{Receiver, Sender, bounded};

use super::MetadataCache;
use crate::component::{FileMetadata, ParseMode, parse};
use crate::core::CancelScope;
use crate::utils::hash::Fingerprint;

/// What the collector learns about one file.
pub(super) enum FileOutcome {
    Parsed {
        path: PathBuf,
        fingerprint: Fingerprint,
        modified: SystemTime,
        metadata: FileMetadata,
        cache_hit: bool,
    },
    Vanished(PathBuf),
    Unreadable {
        path: PathBuf,
        message: String,
    },
}

struct ParseJob {
    path: PathBuf,
    fingerprint: Fingerprint,
    modified: SystemTime,
    bytes: Vec<u8>,
}

pub(super) struct Pipeline<'a> {
    pub cache: &'a MetadataCache,
    pub io_workers: usize,
    pub parse_workers: usize,
    pub parse_queue: usize,
    pub large_file_threshold: u64,
}

impl Pipeline<'_> {
    /// Run discovery and both worker pools; `on_outcome` runs on the calling
    /// thread as results arrive. Returns whether the scan was cancelled.
    pub fn run<D, F>(&self, discover: D, cancel: &CancelScope, mut on_outcome: F) -> bool
    where
        D: FnOnce(&mut dyn FnMut(PathBuf) -> bool) + Send,
        F: FnMut(FileOutcome),
    {
        let (path_tx, path_rx) = bounded::<PathBuf>(self.io_workers * 4);
        let (job_tx, job_rx) = bounded::<ParseJob>(self.parse_queue);
        let (out_tx, out_rx) = bounded::<FileOutcome>(self.parse_queue);

        thread::scope(|s| {
            s.spawn(move || {
                let mut emit = |path: PathBuf| !cancel.is_cancelled() && path_tx.send(path).is_ok();
                discover(&mut emit);
            });

            for _ in 0..self.io_workers {
                let (paths, jobs, out) = (path_rx.clone(), job_tx.clone(), out_tx.clone());
                s.spawn(move || self.io_worker(paths, jobs, out, cancel));
            }
            for _ in 0..self.parse_workers {
                let (jobs, out) = (job_rx.clone(), out_tx.clone());
                s.spawn(move || self.parse_worker(jobs, out));
            }

            // Only workers hold senders now; the loop ends once all exit
            drop((path_rx, job_tx, job_rx, out_tx));
            for outcome in out_rx.iter() {
                on_outcome(outcome);
            }
        });

        cancel.is_cancelled()
    }

    fn io_worker(
        &self,
        paths: Receiver<PathBuf>,
        jobs: Sender<ParseJob>,
        out: Sender<FileOutcome>,
        cancel: &CancelScope,
    ) {
        for path in paths.iter() {
            if cancel.is_cancelled() {
                // keep draining so discovery never blocks
                continue;
            }

            let metadata = match fs::metadata(&path) {
                Ok(m) if m.is_file() => m,
                Ok(_) => continue,
                Err(e) => {
                    if out.send(read_failure(path, e)).is_err() {
                        return;
                    }
                    continue;
                }
            };
            let modified = metadata.modified().unwrap_or(UNIX_EPOCH);

            let (fingerprint, bytes) = match Fingerprint::of_file(&path) {
                Ok(read) => read,
                Err(e) => {
                    if out.send(read_failure(path, e)).is_err() {
                        return;
                    }
                    continue;
                }
            };

            let sent = match self.cache.get(&path, fingerprint) {
                Some(metadata) => out
                    .send(FileOutcome::Parsed {
                        path,
                        fingerprint,
                        modified,
                        metadata,
                        cache_hit: true,
                    })
                    .is_ok(),
                None => jobs
                    .send(ParseJob {
                        path,
                        fingerprint,
                        modified,
                        bytes,
                    })
                    .is_ok(),
            };
            if !sent {
                return;
            }
        }
    }

    fn parse_worker(&self, jobs: Receiver<ParseJob>, out: Sender<FileOutcome>) {
        for job in jobs.iter() {
            let mode = if job.bytes.len() as u64 > self.large_file_threshold {
                ParseMode::Reduced
            } else {
                ParseMode::Full
            };
            let source = String::from_utf8_lossy(&job.bytes);
            let metadata = parse(&source, mode);

            self.cache
                .insert(job.path.clone(), job.fingerprint, metadata.clone());

            let outcome = FileOutcome::Parsed {
                path: job.path,
                fingerprint: job.fingerprint,
                modified: job.modified,
                metadata,
                cache_hit: false,
            };
            if out.send(outcome).is_err() {
                return;
            }
        }
    }
}

fn read_failure(path: PathBuf, err: io::Error) -> FileOutcome {
    if err.kind() == io::ErrorKind::NotFound {
        FileOutcome::Vanished(path)
    } else {
        FileOutcome::Unreadable {
            message: format!("cannot read {}: {}", path.display(), err),
            path,
        }
    }
}
