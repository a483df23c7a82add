//! `[watch]` section configuration.
//!
//! ```toml
//! [watch]
//! debounce_ms = 50         # Per-path coalescing window
//! queue_capacity = 1000    # Pending events before the oldest are dropped
//! sweep_ms = 60000         # Idle time before per-path state is forgotten
//! poll_interval_ms = 500   # Used when OS notification is unavailable
//! force_poll = false
//! ```

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchSection {
    pub debounce_ms: u64,
    pub queue_capacity: usize,
    pub sweep_ms: u64,
    pub poll_interval_ms: u64,
    pub force_poll: bool,
}

impl Default for WatchSection {
    fn default() -> Self {
        Self {
            debounce_ms: 50,
            queue_capacity: 1000,
            sweep_ms: 60_000,
            poll_interval_ms: 500,
            force_poll: false,
        }
    }
}
