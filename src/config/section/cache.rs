//! `[cache]` section configuration.
//!
//! ```toml
//! [cache]
//! capacity = 4096          # Entries per cache before LRU eviction
//! ttl_ms = 3600000         # Entries expire after this even without pressure
//! dir = ".kiln/cache"      # Relative to the project root
//! persist = true           # Restore on startup, write back on shutdown
//! ```

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSection {
    pub capacity: usize,
    pub ttl_ms: u64,
    pub dir: PathBuf,
    pub persist: bool,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            capacity: 4096,
            ttl_ms: 60 * 60 * 1000,
            dir: PathBuf::from(".kiln/cache"),
            persist: true,
        }
    }
}
