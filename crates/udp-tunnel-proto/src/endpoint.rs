//! Addressing types shared by the proxies

use crate::DEFAULT_HOST;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use thiserror::Error;

/// Transport protocol of a listening socket or a target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

/// A (host, port) address identifying a UDP peer or a TCP/UDP target
///
/// Equality is structural: the host string is compared as-is, so
/// `localhost:53` and `127.0.0.1:53` are different endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EndpointParseError {
    #[error("Missing port in address \"{0}\"")]
    MissingPort(String),

    #[error("Invalid port \"{0}\"")]
    InvalidPort(String),

    #[error("Empty host in address \"{0}\"")]
    EmptyHost(String),
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Endpoint on the default loopback host
    pub fn localhost(port: u16) -> Self {
        Self::new(DEFAULT_HOST, port)
    }

    /// Canonical lookup key, `"host:port"`
    pub fn key(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// True when the host names the loopback interface
    pub fn is_loopback(&self) -> bool {
        if self.host.eq_ignore_ascii_case("localhost") {
            return true;
        }
        self.host
            .parse::<IpAddr>()
            .map(|ip| ip.is_loopback())
            .unwrap_or(false)
    }

    /// Short label: the bare port for the default host, `host:port` otherwise
    pub fn label(&self) -> String {
        if self.host == DEFAULT_HOST {
            self.port.to_string()
        } else {
            self.key()
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

impl FromStr for Endpoint {
    type Err = EndpointParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| EndpointParseError::MissingPort(s.to_string()))?;

        if host.is_empty() {
            return Err(EndpointParseError::EmptyHost(s.to_string()));
        }

        let port = port
            .parse::<u16>()
            .map_err(|_| EndpointParseError::InvalidPort(port.to_string()))?;

        Ok(Self::new(host, port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_key() {
        let endpoint = Endpoint::new("10.0.0.2", 5000);
        assert_eq!(endpoint.key(), "10.0.0.2:5000");
        assert_eq!(endpoint.to_string(), "10.0.0.2:5000");
    }

    #[test]
    fn test_endpoint_from_socket_addr() {
        let addr: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        assert_eq!(Endpoint::from(addr), Endpoint::localhost(4000));
    }

    #[test]
    fn test_endpoint_parse() {
        assert_eq!(
            "example.com:53".parse::<Endpoint>(),
            Ok(Endpoint::new("example.com", 53))
        );
        assert_eq!(
            "example.com".parse::<Endpoint>(),
            Err(EndpointParseError::MissingPort("example.com".to_string()))
        );
        assert_eq!(
            ":53".parse::<Endpoint>(),
            Err(EndpointParseError::EmptyHost(":53".to_string()))
        );
        assert!("host:99999".parse::<Endpoint>().is_err());
    }

    #[test]
    fn test_endpoint_loopback() {
        assert!(Endpoint::localhost(1).is_loopback());
        assert!(Endpoint::new("localhost", 1).is_loopback());
        assert!(Endpoint::new("::1", 1).is_loopback());
        assert!(!Endpoint::new("10.10.10.10", 1).is_loopback());
        assert!(!Endpoint::new("example.com", 1).is_loopback());
    }

    #[test]
    fn test_endpoint_label() {
        assert_eq!(Endpoint::localhost(3000).label(), "3000");
        assert_eq!(Endpoint::new("10.0.0.2", 3000).label(), "10.0.0.2:3000");
    }

    #[test]
    fn test_protocol_serde() {
        assert_eq!(serde_json::to_string(&Protocol::Udp).unwrap(), "\"udp\"");
        assert_eq!(Protocol::Tcp.to_string(), "tcp");
    }
}
