//! UDP Tunnel Library - Public API for carrying UDP over TCP-only hops
//!
//! This library re-exports the tunnel crates and adds the two entry points
//! most applications need:
//!
//! - [`start_udp_fronted_proxy`] listens on UDP and forwards to a TCP port.
//! - [`start_tcp_fronted_proxy`] listens on TCP and forwards to a UDP endpoint.
//!
//! Chaining one of each gives a UDP service reachable through a TCP tunnel:
//!
//! ```ignore
//! use udp_tunnel_lib::{start_tcp_fronted_proxy, start_udp_fronted_proxy, Endpoint};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // Remote side: TCP in, DNS server out
//! let exit = start_tcp_fronted_proxy(Endpoint::new("10.0.0.2", 53)).await?;
//!
//! // Local side: UDP in on 5353 (or the next free port), TCP out to the exit
//! let entry = start_udp_fronted_proxy(5353, exit.listen_port()).await?;
//! println!("{} then {}", entry, exit);
//!
//! entry.close();
//! exit.close();
//! # Ok(())
//! # }
//! ```

mod registry;

pub use registry::{ProxyRegistry, ProxySummary};

pub use udp_tunnel_proto::{
    encode_frame, parse_port_expression, parse_target, validate_target, CodecError, Endpoint,
    EndpointParseError, FrameDecoder, Protocol, TargetParseError, DEFAULT_HOST,
    FRAME_HEADER_SIZE, MAX_PAYLOAD_SIZE,
};
pub use udp_tunnel_server::{
    allocate_listen_port, ErrorKind, ProxyConfig, ProxyError, ProxyServer, ProxyState,
    TcpProxyServer, TcpProxyServerConfig, UdpProxyServer, UdpProxyServerConfig,
};

use std::net::SocketAddr;

/// Start a UDP-fronted proxy forwarding to `127.0.0.1:target_tcp_port`.
///
/// If `listen_port` is taken the following ports are tried; check
/// [`ProxyServer::listen_port`] for the one actually bound.
pub async fn start_udp_fronted_proxy(
    listen_port: u16,
    target_tcp_port: u16,
) -> Result<ProxyServer, ProxyError> {
    start_udp_fronted_proxy_with_config(listen_port, target_tcp_port, ProxyConfig::default()).await
}

pub async fn start_udp_fronted_proxy_with_config(
    listen_port: u16,
    target_tcp_port: u16,
    config: ProxyConfig,
) -> Result<ProxyServer, ProxyError> {
    let target = Endpoint::localhost(target_tcp_port);

    allocate_listen_port(listen_port, config.port_attempts, |port| {
        UdpProxyServer::new(UdpProxyServerConfig {
            bind_addr: SocketAddr::new(config.bind_host, port),
            target: target.clone(),
        })
        .with_proxy_config(config.clone())
        .start()
    })
    .await
}

/// Start a TCP-fronted proxy forwarding to `target` on an OS-assigned port.
pub async fn start_tcp_fronted_proxy(target: Endpoint) -> Result<ProxyServer, ProxyError> {
    start_tcp_fronted_proxy_with_config(target, ProxyConfig::default()).await
}

pub async fn start_tcp_fronted_proxy_with_config(
    target: Endpoint,
    config: ProxyConfig,
) -> Result<ProxyServer, ProxyError> {
    TcpProxyServer::new(TcpProxyServerConfig {
        bind_addr: SocketAddr::new(config.bind_host, 0),
        target,
    })
    .with_proxy_config(config)
    .start()
    .await
}
