//! TCP-fronted proxy
//!
//! Accepts TCP connections carrying framed datagrams. Each connection gets a
//! private UDP socket connected to the target, so replies from the target
//! map back to the TCP connection that caused them.

use crate::config::ProxyConfig;
use crate::error::ProxyError;
use crate::handle::{Lifecycle, PeerCounter, ProxyServer};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{lookup_host, TcpListener, TcpStream, UdpSocket};
use tracing::{debug, error, info, trace, warn};
use udp_tunnel_proto::{encode_frame, Endpoint, FrameDecoder, Protocol, MAX_PAYLOAD_SIZE};

/// TCP proxy configuration
#[derive(Debug, Clone)]
pub struct TcpProxyServerConfig {
    pub bind_addr: SocketAddr,
    /// UDP endpoint datagrams are delivered to
    pub target: Endpoint,
}

/// TCP-fronted proxy server
pub struct TcpProxyServer {
    config: TcpProxyServerConfig,
    proxy_config: ProxyConfig,
}

impl TcpProxyServer {
    pub fn new(config: TcpProxyServerConfig) -> Self {
        Self {
            config,
            proxy_config: ProxyConfig::default(),
        }
    }

    pub fn with_proxy_config(mut self, proxy_config: ProxyConfig) -> Self {
        self.proxy_config = proxy_config;
        self
    }

    /// Bind the TCP listener and start accepting in the background.
    pub async fn start(self) -> Result<ProxyServer, ProxyError> {
        let listener = TcpListener::bind(self.config.bind_addr)
            .await
            .map_err(|e| ProxyError::bind(self.config.bind_addr, e))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| ProxyError::bind(self.config.bind_addr, e))?;

        info!(
            "TCP proxy listening on {} -> {}",
            local_addr, self.config.target
        );

        let connections = Arc::new(AtomicUsize::new(0));
        let (server, lifecycle) = ProxyServer::new(
            local_addr.port(),
            Protocol::Tcp,
            self.config.target.clone(),
            Protocol::Udp,
            PeerCounter::Connections(connections.clone()),
        );

        tokio::spawn(accept_loop(
            listener,
            self.config.target,
            self.proxy_config.read_buffer_size,
            connections,
            lifecycle,
        ));

        Ok(server)
    }
}

async fn accept_loop(
    listener: TcpListener,
    target: Endpoint,
    read_buffer_size: usize,
    connections: Arc<AtomicUsize>,
    mut lifecycle: Lifecycle,
) {
    let result = loop {
        tokio::select! {
            _ = lifecycle.shutdown_requested() => {
                debug!("TCP proxy shutting down");
                break Ok(());
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer_addr)) => {
                        debug!("Accepted TCP connection from {}", peer_addr);
                        let target = target.clone();
                        let guard = ConnectionGuard::new(connections.clone());
                        tokio::spawn(async move {
                            let _guard = guard;
                            if let Err(e) =
                                handle_connection(stream, peer_addr, target, read_buffer_size).await
                            {
                                error!("Error handling TCP connection from {}: {}", peer_addr, e);
                            }
                        });
                    }
                    Err(e) if is_transient(&e) => {
                        warn!("Failed to accept TCP connection: {}", e);
                    }
                    Err(e) => {
                        error!("TCP proxy listener failed: {}", e);
                        break Err(e.to_string());
                    }
                }
            }
        }
    };

    // Bridged connections outlive the listener until their client disconnects
    drop(listener);
    lifecycle.finish(result);
}

async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    target: Endpoint,
    read_buffer_size: usize,
) -> Result<(), ProxyError> {
    let _ = stream.set_nodelay(true);

    let target_addr = resolve_target(&target)
        .await
        .map_err(|e| ProxyError::peer(peer_addr, e))?;
    let socket = UdpSocket::bind(udp_bind_addr(&target, target_addr))
        .await
        .map_err(|e| ProxyError::peer(peer_addr, e))?;
    socket
        .connect(target_addr)
        .await
        .map_err(|e| ProxyError::peer(peer_addr, e))?;

    debug!(
        "Bridging {} to {} via UDP socket {:?}",
        peer_addr,
        target_addr,
        socket.local_addr().ok()
    );

    let (reader, writer) = stream.into_split();

    // Each direction runs on its own; whichever ends first tears down both
    tokio::select! {
        result = client_to_target(reader, &socket, peer_addr, target_addr, read_buffer_size) => result,
        result = target_to_client(&socket, writer, peer_addr, target_addr) => result,
    }
}

async fn client_to_target(
    mut reader: OwnedReadHalf,
    socket: &UdpSocket,
    peer_addr: SocketAddr,
    target_addr: SocketAddr,
    read_buffer_size: usize,
) -> Result<(), ProxyError> {
    let mut decoder = FrameDecoder::new();
    let mut buffer = vec![0u8; read_buffer_size.max(1)];

    loop {
        let n = reader
            .read(&mut buffer)
            .await
            .map_err(|e| ProxyError::peer(peer_addr, e))?;
        if n == 0 {
            debug!("TCP connection from {} closed", peer_addr);
            return Ok(());
        }
        for payload in decoder.decode(&buffer[..n]) {
            if let Err(e) = socket.send(&payload).await {
                // Undeliverable datagrams are lost, the connection stays up
                trace!("Failed to send datagram to {}: {}", target_addr, e);
            }
        }
    }
}

async fn target_to_client(
    socket: &UdpSocket,
    mut writer: OwnedWriteHalf,
    peer_addr: SocketAddr,
    target_addr: SocketAddr,
) -> Result<(), ProxyError> {
    let mut buffer = vec![0u8; MAX_PAYLOAD_SIZE];

    loop {
        match socket.recv(&mut buffer).await {
            Ok(len) => {
                let frame = encode_frame(&buffer[..len])?;
                writer
                    .write_all(&frame)
                    .await
                    .map_err(|e| ProxyError::peer(peer_addr, e))?;
            }
            Err(e) if is_transient(&e) => {
                trace!("Ignoring transient receive error from {}: {}", target_addr, e);
            }
            Err(e) => return Err(ProxyError::peer(peer_addr, e)),
        }
    }
}

/// Resolve the target, preferring IPv4 when both families are available
async fn resolve_target(target: &Endpoint) -> io::Result<SocketAddr> {
    let addrs: Vec<SocketAddr> = lookup_host((target.host.as_str(), target.port))
        .await?
        .collect();

    addrs
        .iter()
        .find(|addr| addr.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no address found for {}", target),
            )
        })
}

/// Loopback targets get a loopback socket, anything else binds all interfaces
fn udp_bind_addr(target: &Endpoint, resolved: SocketAddr) -> SocketAddr {
    let loopback = target.is_loopback() || resolved.ip().is_loopback();
    let ip = match (resolved.ip(), loopback) {
        (IpAddr::V4(_), true) => IpAddr::V4(Ipv4Addr::LOCALHOST),
        (IpAddr::V4(_), false) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        (IpAddr::V6(_), true) => IpAddr::V6(Ipv6Addr::LOCALHOST),
        (IpAddr::V6(_), false) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    };
    SocketAddr::new(ip, 0)
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}

/// Keeps the live-connection count accurate however the task ends
struct ConnectionGuard {
    connections: Arc<AtomicUsize>,
}

impl ConnectionGuard {
    fn new(connections: Arc<AtomicUsize>) -> Self {
        connections.fetch_add(1, Ordering::Relaxed);
        Self { connections }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.connections.fetch_sub(1, Ordering::Relaxed);
    }
}
