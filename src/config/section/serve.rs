//! `[serve]` section configuration.
//!
//! ```toml
//! [serve]
//! interface = "127.0.0.1"          # 0.0.0.0 exposes the socket to the LAN
//! port = 35729                     # Next free port is tried when busy
//! allowed_origins = ["localhost", "127.0.0.1"]
//! auth_token = "secret"            # Required from non-loopback peers
//! max_connections_per_address = 16
//! idle_timeout_ms = 60000
//! ping_interval_ms = 15000
//! ring_capacity = 64               # Outbound frames buffered per client
//! drop_threshold = 0.75            # Utilization above which normal frames drop
//! max_message_size = 65536
//! cleanup_workers = 2
//! ```

use std::net::{IpAddr, Ipv4Addr};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServeSection {
    pub interface: IpAddr,
    pub port: u16,
    pub allowed_origins: Vec<String>,
    pub auth_token: Option<String>,
    pub max_connections_per_address: usize,
    pub idle_timeout_ms: u64,
    pub ping_interval_ms: u64,
    pub ring_capacity: usize,
    pub drop_threshold: f64,
    pub max_message_size: usize,
    pub cleanup_workers: usize,
}

impl Default for ServeSection {
    fn default() -> Self {
        Self {
            interface: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 35729,
            allowed_origins: vec!["localhost".into(), "127.0.0.1".into()],
            auth_token: None,
            max_connections_per_address: 16,
            idle_timeout_ms: 60_000,
            ping_interval_ms: 15_000,
            ring_capacity: 64,
            drop_threshold: 0.75,
            max_message_size: 64 * 1024,
            cleanup_workers: 2,
        }
    }
}
