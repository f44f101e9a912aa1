//! Proxy error types

use std::net::SocketAddr;
use thiserror::Error;
use udp_tunnel_proto::{CodecError, Endpoint};

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("Failed to bind to {address}:{port}: {source}\n\nTroubleshooting:\n  • Check if another process is using this port: lsof -i :{port}\n  • Try using a different address or port")]
    Bind {
        address: String,
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Connection for peer {peer} failed: {source}")]
    PeerConnection {
        peer: Endpoint,
        #[source]
        source: std::io::Error,
    },

    #[error("Server closed unexpectedly: {0}")]
    ServerClosedUnexpectedly(String),
}

/// Coarse classification of a [`ProxyError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Listen/bind failed; fatal to that start attempt
    Bind,
    /// A datagram could not be framed; fatal to that single send
    PayloadTooLarge,
    /// One counterpart connection failed; only that peer is torn down
    PeerConnection,
    /// The listener died outside of an explicit close; fatal to the instance
    ServerClosedUnexpectedly,
}

impl ProxyError {
    pub(crate) fn bind(addr: SocketAddr, source: std::io::Error) -> Self {
        ProxyError::Bind {
            address: addr.ip().to_string(),
            port: addr.port(),
            source,
        }
    }

    pub(crate) fn peer(peer: impl Into<Endpoint>, source: std::io::Error) -> Self {
        ProxyError::PeerConnection {
            peer: peer.into(),
            source,
        }
    }

    /// True when the failure was a bind on a port somebody else holds
    pub fn is_addr_in_use(&self) -> bool {
        matches!(
            self,
            ProxyError::Bind { source, .. } if source.kind() == std::io::ErrorKind::AddrInUse
        )
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ProxyError::Bind { .. } => ErrorKind::Bind,
            ProxyError::Codec(CodecError::PayloadTooLarge(_)) => ErrorKind::PayloadTooLarge,
            ProxyError::PeerConnection { .. } => ErrorKind::PeerConnection,
            ProxyError::ServerClosedUnexpectedly(_) => ErrorKind::ServerClosedUnexpectedly,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_addr_in_use_detection() {
        let addr: SocketAddr = "127.0.0.1:5000".parse().unwrap();
        let in_use = ProxyError::bind(addr, io::Error::from(io::ErrorKind::AddrInUse));
        assert!(in_use.is_addr_in_use());
        assert_eq!(in_use.kind(), ErrorKind::Bind);

        let denied = ProxyError::bind(addr, io::Error::from(io::ErrorKind::PermissionDenied));
        assert!(!denied.is_addr_in_use());
        assert_eq!(denied.kind(), ErrorKind::Bind);
    }

    #[test]
    fn test_bind_error_message() {
        let addr: SocketAddr = "127.0.0.1:5000".parse().unwrap();
        let err = ProxyError::bind(addr, io::Error::from(io::ErrorKind::AddrInUse));
        let message = err.to_string();
        assert!(message.starts_with("Failed to bind to 127.0.0.1:5000"));
        assert!(message.contains("lsof -i :5000"));
    }

    #[test]
    fn test_error_kinds() {
        let codec = ProxyError::from(CodecError::PayloadTooLarge(70_000));
        assert_eq!(codec.kind(), ErrorKind::PayloadTooLarge);

        let peer = ProxyError::peer(
            Endpoint::localhost(4000),
            io::Error::from(io::ErrorKind::ConnectionRefused),
        );
        assert_eq!(peer.kind(), ErrorKind::PeerConnection);
        assert!(peer.to_string().contains("127.0.0.1:4000"));

        let closed = ProxyError::ServerClosedUnexpectedly("socket error".to_string());
        assert_eq!(closed.kind(), ErrorKind::ServerClosedUnexpectedly);
    }

    #[test]
    fn test_each_variant_has_its_own_kind() {
        let addr: SocketAddr = "127.0.0.1:5000".parse().unwrap();
        let errors = [
            ProxyError::bind(addr, io::Error::from(io::ErrorKind::AddrInUse)),
            ProxyError::from(CodecError::PayloadTooLarge(65_536)),
            ProxyError::peer(addr, io::Error::from(io::ErrorKind::ConnectionReset)),
            ProxyError::ServerClosedUnexpectedly("listener died".to_string()),
        ];

        let kinds: Vec<ErrorKind> = errors.iter().map(ProxyError::kind).collect();
        assert_eq!(
            kinds,
            vec![
                ErrorKind::Bind,
                ErrorKind::PayloadTooLarge,
                ErrorKind::PeerConnection,
                ErrorKind::ServerClosedUnexpectedly,
            ]
        );
    }
}
