//! UDP/TCP Tunnel Proxy Servers
//!
//! This crate implements the two reverse proxies that carry UDP datagrams
//! across a TCP-only hop:
//!
//! - [`UdpProxyServer`] listens on UDP and forwards each peer's datagrams over
//!   its own pooled TCP connection to a fixed TCP target.
//! - [`TcpProxyServer`] listens on TCP and gives each accepted connection a
//!   dedicated UDP socket connected to a fixed UDP target.
//!
//! Both return a [`ProxyServer`] handle that owns the listener and everything
//! spawned on its behalf.

mod allocator;
mod config;
mod error;
mod handle;
mod pool;
mod tcp_proxy;
mod udp_proxy;

pub use allocator::allocate_listen_port;
pub use config::ProxyConfig;
pub use error::{ErrorKind, ProxyError};
pub use handle::{ProxyServer, ProxyState};
pub use tcp_proxy::{TcpProxyServer, TcpProxyServerConfig};
pub use udp_proxy::{UdpProxyServer, UdpProxyServerConfig};
