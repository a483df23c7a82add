//! `[registry]` section configuration.

use serde::{Deserialize, Serialize};

/// Subscriber delivery settings.
///
/// ```toml
/// [registry]
/// subscriber_buffer = 256
/// send_timeout_ms = 100
/// max_strikes = 3          # Timed-out sends before a subscriber is dropped
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrySection {
    pub subscriber_buffer: usize,
    pub send_timeout_ms: u64,
    pub max_strikes: u32,
}

impl Default for RegistrySection {
    fn default() -> Self {
        Self {
            subscriber_buffer: 256,
            send_timeout_ms: 100,
            max_strikes: 3,
        }
    }
}
