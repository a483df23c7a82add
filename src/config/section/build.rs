//! `[build]` section configuration.
//!
//! ```toml
//! [build]
//! compiler = "templ"                      # Resolved once on PATH at startup
//! args = ["generate", "-f", "{file}"]     # `{file}` and `{component}` are substituted
//! workers = 8                             # Capped at 8
//! queue_capacity = 64
//! timeout_ms = 30000
//! breaker_threshold = 3                   # Consecutive failures before the circuit opens
//! breaker_cooldown_ms = 10000
//! ```

use serde::{Deserialize, Serialize};

use super::default_workers;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildSection {
    pub compiler: String,
    pub args: Vec<String>,
    pub workers: usize,
    pub queue_capacity: usize,
    pub timeout_ms: u64,
    pub breaker_threshold: u32,
    pub breaker_cooldown_ms: u64,
}

impl Default for BuildSection {
    fn default() -> Self {
        Self {
            compiler: "templ".into(),
            args: vec!["generate".into(), "-f".into(), "{file}".into()],
            workers: default_workers(),
            queue_capacity: 64,
            timeout_ms: 30_000,
            breaker_threshold: 3,
            breaker_cooldown_ms: 10_000,
        }
    }
}
