//! UDP-fronted proxy
//!
//! Listens for datagrams and forwards each one, framed, over a TCP
//! connection dedicated to its sender. Framed replies from the target are
//! unframed and sent back to that sender.

use crate::config::ProxyConfig;
use crate::error::{ErrorKind, ProxyError};
use crate::handle::{Lifecycle, PeerCounter, ProxyServer};
use crate::pool::{PeerPool, Reply};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};
use udp_tunnel_proto::{Endpoint, Protocol, MAX_PAYLOAD_SIZE};

/// UDP proxy configuration
#[derive(Debug, Clone)]
pub struct UdpProxyServerConfig {
    pub bind_addr: SocketAddr,
    /// TCP endpoint every peer connection is opened to
    pub target: Endpoint,
}

/// UDP-fronted proxy server
pub struct UdpProxyServer {
    config: UdpProxyServerConfig,
    proxy_config: ProxyConfig,
}

impl UdpProxyServer {
    pub fn new(config: UdpProxyServerConfig) -> Self {
        Self {
            config,
            proxy_config: ProxyConfig::default(),
        }
    }

    pub fn with_proxy_config(mut self, proxy_config: ProxyConfig) -> Self {
        self.proxy_config = proxy_config;
        self
    }

    /// Bind the UDP socket and start serving in the background.
    ///
    /// Returns once the socket is bound, or with the bind error.
    pub async fn start(self) -> Result<ProxyServer, ProxyError> {
        let socket = UdpSocket::bind(self.config.bind_addr)
            .await
            .map_err(|e| ProxyError::bind(self.config.bind_addr, e))?;
        let local_addr = socket
            .local_addr()
            .map_err(|e| ProxyError::bind(self.config.bind_addr, e))?;

        info!(
            "UDP proxy listening on {} -> {}",
            local_addr, self.config.target
        );

        // Replies queue up behind the same depth as outbound frames
        let (reply_tx, reply_rx) = mpsc::channel(self.proxy_config.peer_queue_depth.max(1));
        let pool = Arc::new(PeerPool::new(
            self.config.target.clone(),
            reply_tx,
            self.proxy_config.clone(),
        ));

        let (server, lifecycle) = ProxyServer::new(
            local_addr.port(),
            Protocol::Udp,
            self.config.target.clone(),
            Protocol::Tcp,
            PeerCounter::Pool(pool.clone()),
        );

        tokio::spawn(serve(socket, pool, reply_rx, lifecycle));

        Ok(server)
    }
}

async fn serve(
    socket: UdpSocket,
    pool: Arc<PeerPool>,
    mut replies: mpsc::Receiver<Reply>,
    mut lifecycle: Lifecycle,
) {
    // A datagram can never exceed what a frame can carry
    let mut buffer = vec![0u8; MAX_PAYLOAD_SIZE];

    let result = loop {
        tokio::select! {
            _ = lifecycle.shutdown_requested() => {
                debug!("UDP proxy shutting down");
                break Ok(());
            }
            received = socket.recv_from(&mut buffer) => {
                match received {
                    Ok((len, peer)) => forward_datagram(&pool, &buffer[..len], peer),
                    Err(e) if is_transient(&e) => {
                        trace!("Ignoring transient receive error: {}", e);
                    }
                    Err(e) => {
                        error!("UDP proxy socket failed: {}", e);
                        break Err(e.to_string());
                    }
                }
            }
            Some((payload, peer)) = replies.recv() => {
                if let Err(e) = socket.send_to(&payload, peer).await {
                    warn!(peer = %peer, "Failed to send reply: {}", e);
                }
            }
        }
    };

    pool.close();
    drop(socket);
    lifecycle.finish(result);
}

fn forward_datagram(pool: &PeerPool, payload: &[u8], peer: SocketAddr) {
    let Some(connection) = pool.get_or_create(peer) else {
        return;
    };

    if let Err(e) = connection.send_datagram(payload) {
        match e.kind() {
            ErrorKind::PayloadTooLarge => warn!(peer = %peer, "Dropping datagram: {}", e),
            _ => debug!(peer = %peer, "Dropping datagram: {}", e),
        }
    }
}

/// ICMP feedback from earlier sends surfaces as receive errors on some platforms
fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::ProxyState;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn config(target: Endpoint) -> UdpProxyServerConfig {
        UdpProxyServerConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            target,
        }
    }

    #[tokio::test]
    async fn test_frames_datagram_onto_tcp() {
        let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target_port = target.local_addr().unwrap().port();

        let server = UdpProxyServer::new(config(Endpoint::localhost(target_port)))
            .start()
            .await
            .unwrap();

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client
            .send_to(b"ping", ("127.0.0.1", server.listen_port()))
            .await
            .unwrap();

        let (mut stream, _) = tokio::time::timeout(Duration::from_secs(5), target.accept())
            .await
            .unwrap()
            .unwrap();
        let mut frame = [0u8; 6];
        stream.read_exact(&mut frame).await.unwrap();
        assert_eq!(&frame, &[0x00, 0x04, b'p', b'i', b'n', b'g']);

        // Reply is unframed and returned to the sender
        stream.write_all(&[0x00, 0x04, b'p', b'o', b'n', b'g']).await.unwrap();
        let mut reply = [0u8; 16];
        let (len, from) = tokio::time::timeout(Duration::from_secs(5), client.recv_from(&mut reply))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&reply[..len], b"pong");
        assert_eq!(from.port(), server.listen_port());
        assert_eq!(server.peer_count(), 1);

        server.close();
        server.closed().await.unwrap();
        assert_eq!(server.state(), ProxyState::Closed);
        assert_eq!(server.peer_count(), 0);
    }

    #[tokio::test]
    async fn test_bind_conflict() {
        let taken = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = taken.local_addr().unwrap().port();

        let err = UdpProxyServer::new(UdpProxyServerConfig {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], port)),
            target: Endpoint::localhost(1),
        })
        .start()
        .await
        .unwrap_err();

        assert!(err.is_addr_in_use());
    }

    #[tokio::test]
    async fn test_unreachable_target_does_not_stop_listener() {
        let unused = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = unused.local_addr().unwrap().port();
        drop(unused);

        let server = UdpProxyServer::new(config(Endpoint::localhost(port)))
            .start()
            .await
            .unwrap();

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client
            .send_to(b"hello", ("127.0.0.1", server.listen_port()))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(server.state(), ProxyState::Listening);

        server.close();
        server.closed().await.unwrap();
    }
}
