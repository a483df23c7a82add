//! `[scan]` section configuration.
//!
//! ```toml
//! [scan]
//! roots = ["components", "ui"]   # Directories to scan, relative to the project root
//! exclude = ["**/*_test.component"]
//! extensions = ["component", "templ"]
//! io_workers = 4
//! parse_workers = 4
//! parse_queue = 256
//! large_file_threshold = 1048576  # Bytes; larger files skip dependency extraction
//! ```

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::default_workers;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanSection {
    pub roots: Vec<PathBuf>,
    pub exclude: Vec<String>,
    pub extensions: Vec<String>,
    pub io_workers: usize,
    pub parse_workers: usize,
    pub parse_queue: usize,
    pub large_file_threshold: u64,
}

impl Default for ScanSection {
    fn default() -> Self {
        Self {
            roots: vec![PathBuf::from(".")],
            exclude: Vec::new(),
            extensions: vec!["component".into(), "templ".into()],
            io_workers: 4,
            parse_workers: default_workers(),
            parse_queue: 256,
            large_file_threshold: 1024 * 1024,
        }
    }
}
