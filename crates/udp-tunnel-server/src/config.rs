//! Proxy configuration

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

/// Settings shared by both proxy flavours
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Host the listening socket binds to
    pub bind_host: IpAddr,
    /// A pooled peer with no traffic for this long is evicted
    pub idle_timeout: Duration,
    /// How often the pool looks for idle peers
    pub sweep_interval: Duration,
    /// Listen ports tried (desired, desired+1, ...) before giving up
    pub port_attempts: u16,
    /// Size of a single TCP read
    pub read_buffer_size: usize,
    /// Encoded frames that may wait for a peer's TCP write before datagrams are dropped
    pub peer_queue_depth: usize,
}

impl ProxyConfig {
    pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);
    pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
    pub const DEFAULT_PORT_ATTEMPTS: u16 = 20;

    pub fn with_bind_host(mut self, bind_host: IpAddr) -> Self {
        self.bind_host = bind_host;
        self
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn with_sweep_interval(mut self, sweep_interval: Duration) -> Self {
        self.sweep_interval = sweep_interval;
        self
    }

    pub fn with_port_attempts(mut self, port_attempts: u16) -> Self {
        self.port_attempts = port_attempts;
        self
    }

    pub fn with_read_buffer_size(mut self, read_buffer_size: usize) -> Self {
        self.read_buffer_size = read_buffer_size;
        self
    }

    pub fn with_peer_queue_depth(mut self, peer_queue_depth: usize) -> Self {
        self.peer_queue_depth = peer_queue_depth;
        self
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind_host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            idle_timeout: Self::DEFAULT_IDLE_TIMEOUT,
            sweep_interval: Self::DEFAULT_SWEEP_INTERVAL,
            port_attempts: Self::DEFAULT_PORT_ATTEMPTS,
            read_buffer_size: 64 * 1024,
            peer_queue_depth: 1024,
        }
    }
}
